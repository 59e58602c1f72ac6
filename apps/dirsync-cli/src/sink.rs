//! JSON file sink
//!
//! Stores one pretty-printed JSON document per record key under a directory.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

use dirsync_connector::error::{SyncError, SyncResult};
use dirsync_connector::operation::NormalizedRecord;
use dirsync_connector::traits::Sink;
use dirsync_engine::atomic::write_atomic;

/// File names longer than this are replaced by a hash of the key.
const MAX_FILE_STEM: usize = 200;

/// Sink writing `<dir>/<escaped key>.json` per record.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    name: String,
    dir: PathBuf,
}

impl JsonFileSink {
    /// Create a sink writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            name: format!("json-files:{}", dir.display()),
            dir,
        }
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Escape a key into a portable file name.
///
/// Upper-case letters are escaped too, so keys differing only in case stay
/// distinct on case-insensitive file systems.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_lowercase()
            || byte.is_ascii_digit()
            || matches!(byte, b'.' | b'_' | b'-')
        {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }

    if stem.len() > MAX_FILE_STEM || stem.starts_with('.') {
        return hex::encode(Sha256::digest(key.as_bytes()));
    }
    stem
}

#[async_trait]
impl Sink for JsonFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, key: &str, record: &NormalizedRecord) -> SyncResult<()> {
        let path = self.path_for(key);
        let contents = serde_json::to_vec_pretty(record)
            .map_err(|e| SyncError::sink_delivery_with_source(format!("encode '{}'", key), e))?;

        debug!(key = %key, path = %path.display(), "Writing record");
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &contents))
            .await
            .map_err(|e| SyncError::sink_delivery_with_source("write task failed", e))?
            .map_err(|e| {
                SyncError::sink_delivery_with_source(format!("write {}", path.display()), e)
            })
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        debug!(key = %key, path = %path.display(), "Removing record");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::sink_delivery_with_source(
                format!("remove {}", path.display()),
                e,
            )),
        }
    }
}
