//! Checkpoint Journal Format
//!
//! Append-only binary log used by the journal checkpoint store:
//! - 16-byte header, little-endian
//! - CRC32 checksum of the payload
//! - bincode payloads, versioned per entry
//! - torn-tail detection so a crash mid-append can be truncated on replay
//!
//! # Header Layout (16 bytes)
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ seq_id     │ 8 bytes   │ Monotonic sequence, starts at 1    │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! │ payload_len│ 2 bytes   │ Payload size (max 64KB)            │
//! │ entry_type │ 1 byte    │ See JournalEntryType               │
//! │ version    │ 1 byte    │ Payload format version             │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```

use crc32fast::Hasher;
use std::io::{self, Read, Write};

/// Journal header size in bytes
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// Current payload format version
pub const JOURNAL_VERSION: u8 = 1;

// ============================================================
// HEADER
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub seq_id: u64,
    pub checksum: u32,
    pub payload_len: u16,
    pub entry_type: u8,
    pub version: u8,
}

impl JournalHeader {
    pub fn new(entry_type: JournalEntryType, seq_id: u64, payload: &[u8]) -> io::Result<Self> {
        let payload_len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("journal payload too large: {} bytes", payload.len()),
            )
        })?;
        Ok(Self {
            seq_id,
            checksum: crc32_checksum(payload),
            payload_len,
            entry_type: entry_type as u8,
            version: JOURNAL_VERSION,
        })
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.seq_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..14].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[14] = self.entry_type;
        buf[15] = self.version;
        buf
    }

    pub fn from_bytes(buf: &[u8; JOURNAL_HEADER_SIZE]) -> Self {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[0..8]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[8..12]);
        Self {
            seq_id: u64::from_le_bytes(seq),
            checksum: u32::from_le_bytes(checksum),
            payload_len: u16::from_le_bytes([buf[12], buf[13]]),
            entry_type: buf[14],
            version: buf[15],
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

// ============================================================
// ENTRY TYPES
// ============================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntryType {
    /// Batch registered with its immutable request
    BatchOpened = 1,
    /// Iteration about to be executed (persist-before-call)
    IterationBegun = 2,
    /// Iteration finalized, carries its result
    IterationCommitted = 3,
    /// In-flight marker cleared without a commit
    IterationAbandoned = 4,
    /// Iteration failed; batch parked until resumed
    IterationFailed = 5,
    /// Batch finished and archived
    BatchArchived = 6,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BatchOpened),
            2 => Ok(Self::IterationBegun),
            3 => Ok(Self::IterationCommitted),
            4 => Ok(Self::IterationAbandoned),
            5 => Ok(Self::IterationFailed),
            6 => Ok(Self::BatchArchived),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown JournalEntryType: {}", value),
            )),
        }
    }
}

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ============================================================
// WRITER
// ============================================================

pub struct JournalWriter<W: Write> {
    writer: W,
    next_seq: u64,
}

impl<W: Write> JournalWriter<W> {
    pub fn new(writer: W, next_seq: u64) -> Self {
        Self { writer, next_seq }
    }

    /// Append one entry; returns its seq_id
    ///
    /// Header and payload go out in a single `write_all` so a crash leaves at
    /// most one short record at the tail.
    pub fn append(&mut self, entry_type: JournalEntryType, payload: &[u8]) -> io::Result<u64> {
        let seq_id = self.next_seq;
        let header = JournalHeader::new(entry_type, seq_id, payload)?;

        let mut record = Vec::with_capacity(JOURNAL_HEADER_SIZE + payload.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(payload);
        self.writer.write_all(&record)?;

        self.next_seq += 1;
        Ok(seq_id)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Reuse a seq_id after the caller truncated its record away
    pub fn rewind_to(&mut self, seq_id: u64) {
        self.next_seq = seq_id;
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

// ============================================================
// READER
// ============================================================

#[derive(Debug)]
pub struct JournalEntry {
    pub header: JournalHeader,
    pub payload: Vec<u8>,
}

impl JournalEntry {
    pub fn entry_type(&self) -> io::Result<JournalEntryType> {
        JournalEntryType::try_from(self.header.entry_type)
    }
}

/// Result of reading one record
#[derive(Debug)]
pub enum ReadOutcome {
    Entry(JournalEntry),
    /// Clean end of log
    Eof,
    /// Log ends in a partial record; `valid_len` bytes precede it
    TornTail { valid_len: u64 },
}

pub struct JournalReader<R: Read> {
    reader: R,
    offset: u64,
}

impl<R: Read> JournalReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Bytes consumed by fully-read records
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_entry(&mut self) -> io::Result<ReadOutcome> {
        let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header_buf)? {
            0 => return Ok(ReadOutcome::Eof),
            n if n < JOURNAL_HEADER_SIZE => {
                return Ok(ReadOutcome::TornTail {
                    valid_len: self.offset,
                });
            }
            _ => {}
        }

        let header = JournalHeader::from_bytes(&header_buf);
        let mut payload = vec![0u8; header.payload_len as usize];
        if read_full(&mut self.reader, &mut payload)? < payload.len() {
            return Ok(ReadOutcome::TornTail {
                valid_len: self.offset,
            });
        }

        if !header.verify_checksum(&payload) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CRC32 checksum mismatch at seq_id={}, expected={}, got={}",
                    header.seq_id,
                    header.checksum,
                    crc32_checksum(&payload)
                ),
            ));
        }

        self.offset += (JOURNAL_HEADER_SIZE + payload.len()) as u64;
        Ok(ReadOutcome::Entry(JournalEntry { header, payload }))
    }
}

/// Read until `buf` is full or EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
