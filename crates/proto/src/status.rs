//! Status bytes carried in reply frames and returned by job handlers.

pub const OK: u8 = 0;
pub const EINVAL: u8 = 1;
pub const NO_CHUNK: u8 = 2;
pub const WRONG_VERSION: u8 = 3;
pub const WRONG_SIZE: u8 = 4;
pub const WRONG_OFFSET: u8 = 5;
pub const WRONG_CHUNK_ID: u8 = 6;
pub const NOT_DONE: u8 = 7;
pub const CANT_CONNECT: u8 = 8;
pub const DISCONNECTED: u8 = 9;
pub const CRC_ERROR: u8 = 10;
pub const IO: u8 = 11;
pub const NO_SPACE: u8 = 12;

/// Status byte value meaning "no status recorded yet" in the write pipeline.
pub const PENDING: u8 = 0xFF;

pub fn name(status: u8) -> &'static str {
    match status {
        OK => "OK",
        EINVAL => "EINVAL",
        NO_CHUNK => "no chunk",
        WRONG_VERSION => "wrong version",
        WRONG_SIZE => "wrong size",
        WRONG_OFFSET => "wrong offset",
        WRONG_CHUNK_ID => "wrong chunk id",
        NOT_DONE => "not done",
        CANT_CONNECT => "can't connect",
        DISCONNECTED => "disconnected",
        CRC_ERROR => "crc error",
        IO => "i/o error",
        NO_SPACE => "no space",
        _ => "unknown status",
    }
}
