// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Reconciler checkpoint: the highest ledger position whose effects are
//! reflected in the mirror, together with the events the reconciler still
//! owns (deferred or parked) whose seq the position has already passed.
//!
//! Persisted as JSON via write-to-temp + rename, so a crash mid-save leaves
//! the previous checkpoint intact. Restarting from a stale checkpoint only
//! causes redelivery, which the mirror absorbs. Deferred and parked events
//! ride along in the same file; without them a crash would strand events the
//! stream will never redeliver below the checkpoint.

use super::Parked;
use pocket_kernel::event::SequencedEvent;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_seq: u64,
    /// Events waiting for their prerequisite, re-armed on restart.
    #[serde(default)]
    pub deferred: Vec<SequencedEvent>,
    /// Events given up on, kept whole for manual replay.
    #[serde(default)]
    pub parked: Vec<Parked>,
}

impl Checkpoint {
    /// Missing file means a fresh mirror: start from the beginning.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
