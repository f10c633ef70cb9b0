// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Append-Only Event Log Writer
//!
//! This is the CANONICAL durability layer for the in-process ledger.
//! - Events are written to disk BEFORE the command is acknowledged
//! - Every write is fsync'd for crash safety
//! - No truncation or rewriting allowed
//! - Bincode serialization, CRC32-framed so a torn tail is detectable
//!
//! # File Format
//! ```text
//! [Header: 16 bytes][Frame][Frame][Frame]...
//! ```
//!
//! Header:
//! - magic: [u8; 4] ("PKTL")
//! - version: u32 (1)
//! - reserved: u64 (0)
//!
//! Frame:
//! - len: u32 (payload length)
//! - crc32: u32 (of payload)
//! - payload: bincode-encoded `SequencedEvent`

use pocket_kernel::event::SequencedEvent;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"PKTL";
const VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid header")]
    InvalidHeader,
}

pub type Result<T> = std::result::Result<T, EventLogError>;

fn header_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[0..4].copy_from_slice(&MAGIC);
    bytes[4..8].copy_from_slice(&VERSION.to_le_bytes());
    bytes
}

fn validate_header(bytes: &[u8; 16]) -> Result<()> {
    if bytes[0..4] != MAGIC {
        return Err(EventLogError::InvalidHeader);
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().map_err(|_| EventLogError::InvalidHeader)?);
    if version != VERSION {
        return Err(EventLogError::InvalidHeader);
    }
    Ok(())
}

/// Decode every intact frame; stops at the first torn or corrupt frame
/// (which a crash mid-append can legitimately leave at the tail).
fn decode_frames(buf: &[u8]) -> Vec<SequencedEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset + 8 <= buf.len() {
        let len = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]) as usize;
        let crc = u32::from_le_bytes([buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7]]);
        let start = offset + 8;
        let Some(end) = start.checked_add(len) else { break };
        if end > buf.len() {
            tracing::warn!("Event log tail truncated mid-frame at offset {}", offset);
            break;
        }
        let payload = &buf[start..end];
        if crc32fast::hash(payload) != crc {
            tracing::warn!("Event log frame at offset {} failed CRC; dropping tail", offset);
            break;
        }
        match bincode::serde::decode_from_slice::<SequencedEvent, _>(payload, bincode::config::standard()) {
            Ok((ev, _)) => events.push(ev),
            Err(e) => {
                tracing::warn!("Undecodable event log frame at offset {}: {}", offset, e);
                break;
            }
        }
        offset = end;
    }
    events
}

/// Append-Only Event Log Writer
///
/// # Safety Guarantees
/// - Write + fsync before returning
/// - No buffering without explicit flush
pub struct EventLogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    event_count: u64,
}

impl EventLogWriter {
    /// Open or create an event log file.
    ///
    /// If the file exists, validates the header and scans existing frames
    /// so the caller can resume sequence numbering after the last intact
    /// event. The recovered events are returned alongside the writer.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<SequencedEvent>)> {
        let path = path.as_ref().to_path_buf();
        let file_exists = path.exists();

        let mut file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;

        let mut events = Vec::new();

        if file_exists {
            let mut header = [0u8; 16];
            file.read_exact(&mut header)?;
            validate_header(&header)?;

            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            events = decode_frames(&buf);
        } else {
            file.write_all(&header_bytes())?;
            file.sync_all()?; // fsync header
        }

        let event_count = events.len() as u64;
        Ok((
            Self {
                path,
                file: BufWriter::new(file),
                event_count,
            },
            events,
        ))
    }

    /// Append an event to the log. Only returns Ok() after a durable write.
    pub fn append(&mut self, event: &SequencedEvent) -> Result<()> {
        let payload = bincode::serde::encode_to_vec(event, bincode::config::standard())
            .map_err(|e| EventLogError::Serialization(e.to_string()))?;

        let len = payload.len() as u32;
        let crc = crc32fast::hash(&payload);

        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&payload)?;

        // Flush buffer to OS, then force fsync (critical for crash safety)
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        self.event_count += 1;
        Ok(())
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
