//! Persisted chunkserver identity (`chunkserverid.mfs`).
//!
//! Ten big-endian bytes: `csid:u16, meta_id:u64`. Created on the first
//! successful registration and verified against the master on every
//! reconnect.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use tracing::warn;

pub const IDENTITY_FILE: &str = "chunkserverid.mfs";

#[derive(Debug)]
pub struct IdentityFile {
    path: PathBuf,
    csid: u16,
    meta_id: u64,
}

impl IdentityFile {
    /// Loads the identity from `dir`, tolerating a missing or short file
    /// (both fields default to zero).
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(IDENTITY_FILE);
        let mut csid = 0;
        let mut meta_id = 0;
        if let Ok(raw) = std::fs::read(&path) {
            let mut buf = raw.as_slice();
            if buf.remaining() >= 2 {
                csid = buf.get_u16();
            }
            if buf.remaining() >= 8 {
                meta_id = buf.get_u64();
            }
        }
        Self {
            path,
            csid,
            meta_id,
        }
    }

    pub fn csid(&self) -> u16 {
        self.csid
    }

    pub fn meta_id(&self) -> u64 {
        self.meta_id
    }

    /// Applies master-assigned values. Zero fields keep their current value;
    /// the file is rewritten only when something changed. Returns whether a
    /// change was persisted.
    pub fn update(&mut self, csid: u16, meta_id: u64) -> bool {
        if (csid == 0 || csid == self.csid) && (meta_id == 0 || meta_id == self.meta_id) {
            return false;
        }
        if csid > 0 {
            self.csid = csid;
        }
        if meta_id > 0 {
            self.meta_id = meta_id;
        }
        if let Err(err) = self.store() {
            warn!("can't store chunkserver id: {err}");
        }
        true
    }

    fn store(&self) -> io::Result<()> {
        let mut buf = Vec::with_capacity(10);
        buf.put_u16(self.csid);
        buf.put_u64(self.meta_id);
        std::fs::write(&self.path, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let identity = IdentityFile::load(dir.path());
        assert_eq!(identity.csid(), 0);
        assert_eq!(identity.meta_id(), 0);
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = IdentityFile::load(dir.path());
        assert!(identity.update(7, 0xAABB));
        assert!(!identity.update(7, 0xAABB));
        // zero fields keep the stored values
        assert!(!identity.update(0, 0));

        let reloaded = IdentityFile::load(dir.path());
        assert_eq!(reloaded.csid(), 7);
        assert_eq!(reloaded.meta_id(), 0xAABB);
    }

    #[test]
    fn short_file_yields_partial_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), [0x01, 0x02]).unwrap();
        let identity = IdentityFile::load(dir.path());
        assert_eq!(identity.csid(), 0x0102);
        assert_eq!(identity.meta_id(), 0);
    }
}
