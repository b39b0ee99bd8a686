//! RocksDB-backed pending slot.
//!
//! Layout: a single key in the default column family.
//!
//! ```text
//! key   "pending_broadcast"
//! value LZ4( bincode( QueueRecord { session_id, state_json, checksum } ) )
//! ```
//!
//! The state is stored as JSON bytes inside the record because bincode cannot
//! describe a self-describing `serde_json::Value`. The checksum guards against
//! a torn or foreign value; a record that fails it is reported, and the engine
//! treats it as absent.

use rocksdb::{Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};

use super::{PendingBroadcast, PendingQueue};
use crate::config::QueueConfig;
use crate::error::QueueError;

const PENDING_KEY: &[u8] = b"pending_broadcast";

/// On-disk form of [`PendingBroadcast`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    session_id: String,
    state_json: Vec<u8>,
    checksum: u32,
}

impl QueueRecord {
    fn from_pending(pending: &PendingBroadcast) -> Result<Self, QueueError> {
        let state_json = serde_json::to_vec(&pending.state)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let checksum = Self::compute_checksum(&pending.session_id, &state_json);
        Ok(Self {
            session_id: pending.session_id.clone(),
            state_json,
            checksum,
        })
    }

    fn into_pending(self) -> Result<PendingBroadcast, QueueError> {
        if Self::compute_checksum(&self.session_id, &self.state_json) != self.checksum {
            return Err(QueueError::ChecksumMismatch);
        }
        let state = serde_json::from_slice(&self.state_json)
            .map_err(|e| QueueError::Deserialization(e.to_string()))?;
        Ok(PendingBroadcast {
            session_id: self.session_id,
            state,
        })
    }

    /// FNV-1a over the session id and the state bytes.
    fn compute_checksum(session_id: &str, state_json: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        let bytes = session_id
            .as_bytes()
            .iter()
            .chain(std::iter::once(&0u8))
            .chain(state_json.iter());
        for byte in bytes {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    fn encode(&self) -> Result<Vec<u8>, QueueError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| QueueError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| QueueError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Encode a pending broadcast to its on-disk bytes.
pub fn encode_pending(pending: &PendingBroadcast) -> Result<Vec<u8>, QueueError> {
    QueueRecord::from_pending(pending)?.encode()
}

/// Decode on-disk bytes back into a pending broadcast.
pub fn decode_pending(bytes: &[u8]) -> Result<PendingBroadcast, QueueError> {
    QueueRecord::decode(bytes)?.into_pending()
}

/// Durable pending slot in a RocksDB directory.
pub struct RocksQueue {
    db: DB,
    config: QueueConfig,
}

impl RocksQueue {
    /// Open (or create) the queue database at `config.path`.
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        // one tiny value, rewritten often
        opts.set_max_write_buffer_number(2);
        opts.set_keep_log_file_num(2);

        let db = DB::open(&opts, &config.path)?;
        log::debug!("Opened pending queue at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl PendingQueue for RocksQueue {
    fn load(&self) -> Result<Option<PendingBroadcast>, QueueError> {
        match self.db.get(PENDING_KEY)? {
            Some(bytes) => decode_pending(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, pending: &PendingBroadcast) -> Result<(), QueueError> {
        let bytes = encode_pending(pending)?;
        self.db.put_opt(PENDING_KEY, bytes, &self.write_options())?;
        Ok(())
    }

    fn clear(&self) -> Result<(), QueueError> {
        self.db.delete_opt(PENDING_KEY, &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_encode_decode() {
        let pending = PendingBroadcast::new("ABC12", json!({"sets": [25, 23], "serving": null}));
        let bytes = encode_pending(&pending).unwrap();
        assert_eq!(decode_pending(&bytes).unwrap(), pending);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_pending(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut record = QueueRecord::from_pending(&PendingBroadcast::new("A", json!(1))).unwrap();
        record.state_json = b"2".to_vec();
        assert!(matches!(
            record.into_pending(),
            Err(QueueError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_rocks_single_slot() {
        let dir = tempdir().unwrap();
        let queue = RocksQueue::open(QueueConfig::at(dir.path())).unwrap();
        assert!(queue.load().unwrap().is_none());

        for i in 0..5 {
            queue.save(&PendingBroadcast::new("S", json!(i))).unwrap();
        }
        assert_eq!(queue.load().unwrap().unwrap().state, json!(4));

        queue.clear().unwrap();
        assert!(queue.load().unwrap().is_none());
    }

    #[test]
    fn test_rocks_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let queue = RocksQueue::open(QueueConfig::at(dir.path())).unwrap();
            queue
                .save(&PendingBroadcast::new("KXR07", json!({"scoreA": 12})))
                .unwrap();
        }
        let queue = RocksQueue::open(QueueConfig::at(dir.path())).unwrap();
        let restored = queue.load().unwrap().unwrap();
        assert_eq!(restored.session_id, "KXR07");
        assert_eq!(restored.state, json!({"scoreA": 12}));
    }
}
