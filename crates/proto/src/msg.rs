//! Frame type identifiers.
//!
//! Naming follows the direction of travel: `CLTOCS` client to chunkserver,
//! `CSTOCL` chunkserver to client, `CSTOMA`/`MATOCS` chunkserver/master,
//! `ANTOAN`/`ANTOCS`/`CSTOAN` any peer.

// any <-> any
pub const ANTOAN_NOP: u32 = 0;
pub const ANTOAN_UNKNOWN_COMMAND: u32 = 1;
pub const ANTOAN_BAD_COMMAND_SIZE: u32 = 2;
pub const ANTOAN_FORCE_TIMEOUT: u32 = 4;

// client <-> chunkserver data path
pub const CLTOCS_READ: u32 = 200;
pub const CSTOCL_READ_STATUS: u32 = 201;
pub const CSTOCL_READ_DATA: u32 = 202;
pub const CLTOCS_WRITE: u32 = 210;
pub const CLTOCS_WRITE_DATA: u32 = 211;
pub const CSTOCL_WRITE_STATUS: u32 = 212;
pub const CLTOCS_WRITE_FINISH: u32 = 213;

// chunkserver -> master
pub const CSTOMA_REGISTER: u32 = 400;
pub const CSTOMA_SPACE: u32 = 401;
pub const CSTOMA_CHUNK_DAMAGED: u32 = 402;
pub const CSTOMA_CHUNK_LOST: u32 = 403;
pub const CSTOMA_ERROR_OCCURRED: u32 = 404;
pub const CSTOMA_CHUNK_NEW: u32 = 405;
pub const CSTOMA_CURRENT_LOAD: u32 = 406;
pub const CSTOMA_LABELS: u32 = 407;
pub const CSTOMA_CHUNK_DOESNT_EXIST: u32 = 408;

// master -> chunkserver commands, each paired with its reply type
pub const MATOCS_MASTER_ACK: u32 = 419;
pub const MATOCS_CREATE: u32 = 420;
pub const CSTOMA_CREATE: u32 = 421;
pub const MATOCS_DELETE: u32 = 422;
pub const CSTOMA_DELETE: u32 = 423;
pub const MATOCS_SET_VERSION: u32 = 424;
pub const CSTOMA_SET_VERSION: u32 = 425;
pub const MATOCS_DUPLICATE: u32 = 426;
pub const CSTOMA_DUPLICATE: u32 = 427;
pub const MATOCS_TRUNCATE: u32 = 428;
pub const CSTOMA_TRUNCATE: u32 = 429;
pub const MATOCS_DUPTRUNC: u32 = 430;
pub const CSTOMA_DUPTRUNC: u32 = 431;
pub const MATOCS_REPLICATE: u32 = 432;
pub const CSTOMA_REPLICATE: u32 = 433;
pub const MATOCS_REPLICATE_SPLIT: u32 = 434;
pub const CSTOMA_REPLICATE_SPLIT: u32 = 435;
pub const MATOCS_REPLICATE_RECOVER: u32 = 436;
pub const CSTOMA_REPLICATE_RECOVER: u32 = 437;
pub const MATOCS_REPLICATE_JOIN: u32 = 438;
pub const CSTOMA_REPLICATE_JOIN: u32 = 439;
pub const MATOCS_LOCALSPLIT: u32 = 440;
pub const CSTOMA_LOCALSPLIT: u32 = 441;
pub const MATOCS_CHUNKOP: u32 = 442;
pub const CSTOMA_CHUNKOP: u32 = 443;
pub const MATOCS_CHUNK_STATUS: u32 = 444;
pub const CSTOMA_CHUNK_STATUS: u32 = 445;
pub const MATOCS_REGISTER_FIRST: u32 = 446;

// idle chunk-info queries
pub const ANTOCS_GET_CHUNK_BLOCKS: u32 = 502;
pub const CSTOAN_CHUNK_BLOCKS: u32 = 503;
pub const ANTOCS_GET_CHUNK_CHECKSUM: u32 = 504;
pub const CSTOAN_CHUNK_CHECKSUM: u32 = 505;
pub const ANTOCS_GET_CHUNK_CHECKSUM_TAB: u32 = 506;
pub const CSTOAN_CHUNK_CHECKSUM_TAB: u32 = 507;

// register frame subtypes
pub const REGISTER_BASE: u8 = 60;
pub const REGISTER_CHUNKS: u8 = 61;
pub const REGISTER_DONE: u8 = 62;
pub const REGISTER_BYE: u8 = 63;

/// Readable name of a frame type, for log messages.
pub fn type_name(ftype: u32) -> &'static str {
    match ftype {
        ANTOAN_NOP => "NOP",
        ANTOAN_UNKNOWN_COMMAND => "UNKNOWN_COMMAND",
        ANTOAN_BAD_COMMAND_SIZE => "BAD_COMMAND_SIZE",
        ANTOAN_FORCE_TIMEOUT => "FORCE_TIMEOUT",
        CLTOCS_READ => "READ",
        CSTOCL_READ_STATUS => "READ_STATUS",
        CSTOCL_READ_DATA => "READ_DATA",
        CLTOCS_WRITE => "WRITE",
        CLTOCS_WRITE_DATA => "WRITE_DATA",
        CSTOCL_WRITE_STATUS => "WRITE_STATUS",
        CLTOCS_WRITE_FINISH => "WRITE_FINISH",
        CSTOMA_REGISTER => "REGISTER",
        CSTOMA_SPACE => "SPACE",
        CSTOMA_CHUNK_DAMAGED => "CHUNK_DAMAGED",
        CSTOMA_CHUNK_LOST => "CHUNK_LOST",
        CSTOMA_ERROR_OCCURRED => "ERROR_OCCURRED",
        CSTOMA_CHUNK_NEW => "CHUNK_NEW",
        CSTOMA_CURRENT_LOAD => "CURRENT_LOAD",
        CSTOMA_LABELS => "LABELS",
        CSTOMA_CHUNK_DOESNT_EXIST => "CHUNK_DOESNT_EXIST",
        MATOCS_MASTER_ACK => "MASTER_ACK",
        MATOCS_CREATE => "CREATE",
        MATOCS_DELETE => "DELETE",
        MATOCS_SET_VERSION => "SET_VERSION",
        MATOCS_DUPLICATE => "DUPLICATE",
        MATOCS_TRUNCATE => "TRUNCATE",
        MATOCS_DUPTRUNC => "DUPTRUNC",
        MATOCS_REPLICATE => "REPLICATE",
        MATOCS_REPLICATE_SPLIT => "REPLICATE_SPLIT",
        MATOCS_REPLICATE_RECOVER => "REPLICATE_RECOVER",
        MATOCS_REPLICATE_JOIN => "REPLICATE_JOIN",
        MATOCS_LOCALSPLIT => "LOCALSPLIT",
        MATOCS_CHUNKOP => "CHUNKOP",
        MATOCS_CHUNK_STATUS => "CHUNK_STATUS",
        MATOCS_REGISTER_FIRST => "REGISTER_FIRST",
        ANTOCS_GET_CHUNK_BLOCKS => "GET_CHUNK_BLOCKS",
        ANTOCS_GET_CHUNK_CHECKSUM => "GET_CHUNK_CHECKSUM",
        ANTOCS_GET_CHUNK_CHECKSUM_TAB => "GET_CHUNK_CHECKSUM_TAB",
        _ => "???",
    }
}
