//! Block store consulted by the admission gate
//!
//! Blocks are created only by flag escalation and removed only by an
//! explicit unblock. Escalation writes are best effort; unblock writes are
//! surfaced to the operator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::{AdmissionError, StoreError};
use crate::store::{PersistentTable, StateStore};
use crate::suspicious::FlagReason;

/// Persisted block entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Reason inherited from the flag that caused the block
    pub reason: FlagReason,
    /// When the block was put in place
    pub timestamp: DateTime<Utc>,
}

/// Set of blocked client keys
pub struct BlockStore {
    blocks: PersistentTable<BlockRecord>,
    clock: SharedClock,
}

impl BlockStore {
    pub fn new(store: Arc<dyn StateStore<BlockRecord>>, clock: SharedClock) -> Self {
        Self {
            blocks: PersistentTable::load("blocks", store),
            clock,
        }
    }

    /// Block a key with a fresh timestamp; returns false if it was already blocked
    pub fn block(&self, key: &str, reason: FlagReason) -> bool {
        let record = BlockRecord {
            reason,
            timestamp: self.clock.now_utc(),
        };
        let previous = self.blocks.entries().insert(key.to_string(), record);
        self.blocks.persist_best_effort();

        warn!("Blocked {} ({})", key, reason);
        previous.is_none()
    }

    /// Remove a block. Returns whether the key was blocked.
    ///
    /// Flags and failure counters are left untouched.
    pub fn unblock(&self, key: &str) -> Result<bool, AdmissionError> {
        if self.blocks.entries().remove(key).is_none() {
            return Ok(false);
        }
        self.blocks.persist()?;
        info!("Unblocked {}", key);
        Ok(true)
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.blocks.contains(key)
    }

    pub fn get_block_info(&self, key: &str) -> Option<BlockRecord> {
        self.blocks.get(key)
    }

    /// All current blocks
    pub fn list(&self) -> HashMap<String, BlockRecord> {
        self.blocks.snapshot()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Write the block table now
    pub fn flush(&self) -> Result<(), StoreError> {
        self.blocks.persist()
    }
}
