//! Chunked code loader.
//!
//! Modules arrive in bounded chunks, accumulate in an upload buffer and are swapped in
//! only when the whole buffer hashes to the expected release. `unload` is the only way
//! to reset the buffer; an interrupted upload is recovered by unloading and retrying.

use crate::error::{VaultError, VaultResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Identity of the module currently installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningModule {
    pub version: String,
    /// Lowercase hex SHA-256 of the module bytes.
    pub hash: String,
    pub size: usize,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChunkedCodeLoader {
    max_chunk_bytes: usize,
    max_module_bytes: usize,
    buffer: Vec<u8>,
    running: Option<RunningModule>,
}

impl ChunkedCodeLoader {
    pub fn new(max_chunk_bytes: usize, max_module_bytes: usize) -> Self {
        Self {
            max_chunk_bytes,
            max_module_bytes,
            buffer: Vec::new(),
            running: None,
        }
    }

    pub fn with_running(mut self, running: Option<RunningModule>) -> Self {
        self.running = running;
        self
    }

    pub fn running(&self) -> Option<&RunningModule> {
        self.running.as_ref()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append a chunk and return the accumulated size.
    pub fn load(&mut self, chunk: &[u8]) -> VaultResult<usize> {
        if chunk.is_empty() {
            return Err(VaultError::Loader("chunk is empty".to_string()));
        }
        if chunk.len() > self.max_chunk_bytes {
            return Err(VaultError::Loader(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                chunk.len(),
                self.max_chunk_bytes
            )));
        }
        let total = self.buffer.len() + chunk.len();
        if total > self.max_module_bytes {
            return Err(VaultError::Loader(format!(
                "module would grow to {total} bytes, limit is {}",
                self.max_module_bytes
            )));
        }
        self.buffer.extend_from_slice(chunk);
        debug!(chunk = chunk.len(), total, "Module chunk loaded");
        Ok(total)
    }

    pub fn unload(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer = Vec::new();
        debug!(dropped, "Module buffer unloaded");
        0
    }

    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.buffer).into()
    }

    pub fn hash_string(&self) -> String {
        hex::encode(self.hash())
    }

    /// Install the buffered module if it hashes to `expected_hash`.
    ///
    /// On mismatch the running module and the buffer are left untouched.
    pub fn upgrade(
        &mut self,
        version: &str,
        expected_hash: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<RunningModule> {
        if self.buffer.is_empty() {
            return Err(VaultError::Loader("no module has been loaded".to_string()));
        }
        let actual = self.hash_string();
        if !actual.eq_ignore_ascii_case(expected_hash.trim()) {
            warn!(expected = %expected_hash, actual = %actual, "Module hash mismatch");
            return Err(VaultError::HashMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }

        let module = std::mem::take(&mut self.buffer);
        let running = RunningModule {
            version: version.to_string(),
            hash: actual,
            size: module.len(),
            installed_at: now,
        };
        self.running = Some(running.clone());
        info!(version = %running.version, hash = %running.hash, size = running.size, "Module upgraded");
        Ok(running)
    }
}
