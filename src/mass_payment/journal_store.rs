//! Journal-backed Checkpoint Store
//!
//! Single-file, append-only persistence for one node. Every transition is
//! appended as one journal record and `fdatasync`ed before the call returns;
//! on open the journal is replayed through the same transition rules the other
//! backends use.
//!
//! # Recovery
//!
//! 1. Replay records in seq order, rejecting gaps and checksum failures
//! 2. A partial record at the tail (crash mid-append) is truncated away
//! 3. Continue appending at `last_seq + 1`
//!
//! The file is held under an exclusive advisory lock for the store's lifetime,
//! so a second process opening the same path fails with `Locked` instead of
//! interleaving its own sequence numbers.

use async_trait::async_trait;
use fs2::FileExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::checkpoint::{CheckpointStore, OrchestrationCheckpoint, now_ms};
use super::error::CheckpointError;
use super::types::{
    BatchRequest, BatchRequestId, FailureRecord, IssueRef, IterationResult, Party, TransactionId,
};
use crate::journal::{
    JOURNAL_HEADER_SIZE, JOURNAL_VERSION, JournalEntry, JournalEntryType, JournalReader,
    JournalWriter, ReadOutcome,
};
use crate::money::Amount;

// ============================================================
// PAYLOADS
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
struct BatchOpenedPayload {
    request_id: String,
    iteration_count: u32,
    amount: String,
    currency: String,
    recipient: String,
    anonymize: bool,
    notary: String,
    created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IterationBegunPayload {
    request_id: String,
    iteration: u32,
    issue_ref: String,
    at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IterationCommittedPayload {
    request_id: String,
    expected_completed: u32,
    iteration: u32,
    transaction_id: String,
    recipient: String,
    recipient_anonymous: bool,
    at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IterationAbandonedPayload {
    request_id: String,
    iteration: u32,
    at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IterationFailedPayload {
    request_id: String,
    iteration: u32,
    code: String,
    message: String,
    outcome_unknown: bool,
    at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchArchivedPayload {
    request_id: String,
    at: i64,
}

fn parse_id(s: &str) -> Result<BatchRequestId, CheckpointError> {
    s.parse()
        .map_err(|e| CheckpointError::Corrupted(format!("bad request id {}: {}", s, e)))
}

fn decode<T: DeserializeOwned>(entry: &JournalEntry) -> Result<T, CheckpointError> {
    Ok(bincode::deserialize(&entry.payload)?)
}

fn opened_checkpoint(p: BatchOpenedPayload) -> Result<OrchestrationCheckpoint, CheckpointError> {
    let quantity = Decimal::from_str(&p.amount)
        .map_err(|e| CheckpointError::Corrupted(format!("bad amount {}: {}", p.amount, e)))?;
    let amount = Amount::new(quantity, &p.currency)
        .map_err(|e| CheckpointError::Corrupted(e.to_string()))?;
    let request = BatchRequest::new(
        p.iteration_count,
        amount,
        Party::new(p.recipient),
        p.anonymize,
        Party::new(p.notary),
    );
    let mut checkpoint = OrchestrationCheckpoint::new(parse_id(&p.request_id)?, request);
    checkpoint.created_at = p.created_at;
    checkpoint.updated_at = p.created_at;
    Ok(checkpoint)
}

fn read_error(e: io::Error) -> CheckpointError {
    if e.kind() == io::ErrorKind::InvalidData {
        CheckpointError::Corrupted(e.to_string())
    } else {
        CheckpointError::Storage(e.to_string())
    }
}

// ============================================================
// REPLAY
// ============================================================

struct Replayed {
    checkpoints: HashMap<BatchRequestId, OrchestrationCheckpoint>,
    last_seq: u64,
    valid_len: u64,
}

fn replay(file: &File) -> Result<Replayed, CheckpointError> {
    let mut reader = JournalReader::new(BufReader::new(file));
    let mut checkpoints = HashMap::new();
    let mut last_seq = 0u64;

    loop {
        match reader.read_entry().map_err(read_error)? {
            ReadOutcome::Eof => {
                return Ok(Replayed {
                    checkpoints,
                    last_seq,
                    valid_len: reader.offset(),
                });
            }
            ReadOutcome::TornTail { valid_len } => {
                return Ok(Replayed {
                    checkpoints,
                    last_seq,
                    valid_len,
                });
            }
            ReadOutcome::Entry(entry) => {
                let seq_id = entry.header.seq_id;
                if seq_id != last_seq + 1 {
                    return Err(CheckpointError::Corrupted(format!(
                        "sequence gap: expected {}, found {}",
                        last_seq + 1,
                        seq_id
                    )));
                }
                if entry.header.version != JOURNAL_VERSION {
                    return Err(CheckpointError::Corrupted(format!(
                        "seq {}: unsupported version {}",
                        seq_id, entry.header.version
                    )));
                }
                apply_entry(&mut checkpoints, &entry).map_err(|e| {
                    CheckpointError::Corrupted(format!("seq {}: {}", seq_id, e))
                })?;
                last_seq = seq_id;
            }
        }
    }
}

fn apply_entry(
    checkpoints: &mut HashMap<BatchRequestId, OrchestrationCheckpoint>,
    entry: &JournalEntry,
) -> Result<(), CheckpointError> {
    match entry.entry_type().map_err(read_error)? {
        JournalEntryType::BatchOpened => {
            let checkpoint = opened_checkpoint(decode(entry)?)?;
            if checkpoints.contains_key(&checkpoint.request_id) {
                return Err(CheckpointError::AlreadyExists(
                    checkpoint.request_id.to_string(),
                ));
            }
            checkpoints.insert(checkpoint.request_id, checkpoint);
            Ok(())
        }
        JournalEntryType::IterationBegun => {
            let p: IterationBegunPayload = decode(entry)?;
            batch(checkpoints, &p.request_id)?.apply_begin(
                p.iteration,
                &IssueRef::from(p.issue_ref.clone()),
                p.at,
            )
        }
        JournalEntryType::IterationCommitted => {
            let p: IterationCommittedPayload = decode(entry)?;
            let result = IterationResult {
                iteration: p.iteration,
                transaction_id: TransactionId::new(p.transaction_id),
                recipient: Party {
                    name: p.recipient,
                    anonymous: p.recipient_anonymous,
                },
            };
            batch(checkpoints, &p.request_id)?
                .apply_advance(p.expected_completed, &result, p.at)
                .map(|_| ())
        }
        JournalEntryType::IterationAbandoned => {
            let p: IterationAbandonedPayload = decode(entry)?;
            batch(checkpoints, &p.request_id)?.apply_clear(p.iteration, p.at)
        }
        JournalEntryType::IterationFailed => {
            let p: IterationFailedPayload = decode(entry)?;
            let failure = FailureRecord {
                iteration: p.iteration,
                code: p.code,
                message: p.message,
                outcome_unknown: p.outcome_unknown,
            };
            batch(checkpoints, &p.request_id)?.apply_failure(&failure, p.at)
        }
        JournalEntryType::BatchArchived => {
            let p: BatchArchivedPayload = decode(entry)?;
            batch(checkpoints, &p.request_id)?.apply_archive(p.at)
        }
    }
}

fn batch<'a>(
    checkpoints: &'a mut HashMap<BatchRequestId, OrchestrationCheckpoint>,
    request_id: &str,
) -> Result<&'a mut OrchestrationCheckpoint, CheckpointError> {
    checkpoints
        .get_mut(&parse_id(request_id)?)
        .ok_or_else(|| CheckpointError::NotFound(request_id.to_string()))
}

// ============================================================
// STORE
// ============================================================

struct JournalState {
    writer: JournalWriter<File>,
    /// Bytes covered by durable records
    len: u64,
    /// A failed append could not be rolled back; reopen required
    broken: bool,
    checkpoints: HashMap<BatchRequestId, OrchestrationCheckpoint>,
}

impl JournalState {
    /// Append one record durably, rolling the file back on failure
    fn append_durable(
        &mut self,
        entry_type: JournalEntryType,
        payload: &[u8],
    ) -> Result<(), CheckpointError> {
        if self.broken {
            return Err(CheckpointError::Storage(
                "journal is unwritable until reopened".into(),
            ));
        }
        let seq_id = self.writer.next_seq();
        let written = self
            .writer
            .append(entry_type, payload)
            .and_then(|_| self.writer.flush())
            .and_then(|_| self.writer.get_ref().sync_data());

        match written {
            Ok(()) => {
                self.len += (JOURNAL_HEADER_SIZE + payload.len()) as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.writer.get_ref().set_len(self.len) {
                    error!(error = %rollback, "Journal rollback failed, store disabled");
                    self.broken = true;
                }
                self.writer.rewind_to(seq_id);
                Err(CheckpointError::from(e))
            }
        }
    }
}

pub struct JournalCheckpointStore {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl JournalCheckpointStore {
    /// Open (or create) the journal at `path` and replay it
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|e| {
            CheckpointError::Locked(format!(
                "journal {} is held by another process: {}",
                path.display(),
                e
            ))
        })?;
        let replayed = replay(&file)?;

        let file_len = file.metadata()?.len();
        if replayed.valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len = replayed.valid_len,
                file_len,
                "Truncating torn journal tail"
            );
            file.set_len(replayed.valid_len)?;
            file.sync_all()?;
        }

        info!(
            path = %path.display(),
            batches = replayed.checkpoints.len(),
            last_seq = replayed.last_seq,
            "Checkpoint journal opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(JournalState {
                writer: JournalWriter::new(file, replayed.last_seq + 1),
                len: replayed.valid_len,
                broken: false,
                checkpoints: replayed.checkpoints,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, JournalState>, CheckpointError> {
        self.state
            .lock()
            .map_err(|_| CheckpointError::Storage("journal lock poisoned".into()))
    }

    /// Validate a transition on a copy, journal it, then publish the copy
    fn transition<T>(
        &self,
        request_id: BatchRequestId,
        entry_type: JournalEntryType,
        payload: &impl Serialize,
        f: impl FnOnce(&mut OrchestrationCheckpoint) -> Result<T, CheckpointError>,
    ) -> Result<T, CheckpointError> {
        let mut state = self.lock()?;
        let mut next = state
            .checkpoints
            .get(&request_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(request_id.to_string()))?;
        let out = f(&mut next)?;

        let bytes = bincode::serialize(payload)?;
        state.append_durable(entry_type, &bytes)?;
        state.checkpoints.insert(request_id, next);
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for JournalCheckpointStore {
    fn name(&self) -> &'static str {
        "journal"
    }

    async fn initialize(
        &self,
        request_id: BatchRequestId,
        request: &BatchRequest,
    ) -> Result<OrchestrationCheckpoint, CheckpointError> {
        let mut state = self.lock()?;
        if state.checkpoints.contains_key(&request_id) {
            return Err(CheckpointError::AlreadyExists(request_id.to_string()));
        }
        let checkpoint = OrchestrationCheckpoint::new(request_id, request.clone());
        let payload = BatchOpenedPayload {
            request_id: request_id.to_string(),
            iteration_count: request.iteration_count,
            amount: request.amount.quantity().to_string(),
            currency: request.amount.currency().to_string(),
            recipient: request.recipient.name.clone(),
            anonymize: request.anonymize,
            notary: request.notary.name.clone(),
            created_at: checkpoint.created_at,
        };
        let bytes = bincode::serialize(&payload)?;
        state.append_durable(JournalEntryType::BatchOpened, &bytes)?;
        state.checkpoints.insert(request_id, checkpoint.clone());
        Ok(checkpoint)
    }

    async fn load(
        &self,
        request_id: BatchRequestId,
    ) -> Result<Option<OrchestrationCheckpoint>, CheckpointError> {
        Ok(self.lock()?.checkpoints.get(&request_id).cloned())
    }

    async fn begin_iteration(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
        issue_ref: &IssueRef,
    ) -> Result<(), CheckpointError> {
        let at = now_ms();
        let payload = IterationBegunPayload {
            request_id: request_id.to_string(),
            iteration,
            issue_ref: issue_ref.to_string(),
            at,
        };
        self.transition(request_id, JournalEntryType::IterationBegun, &payload, |c| {
            c.apply_begin(iteration, issue_ref, at)
        })
    }

    async fn advance(
        &self,
        request_id: BatchRequestId,
        expected_completed: u32,
        result: &IterationResult,
    ) -> Result<u32, CheckpointError> {
        let at = now_ms();
        let payload = IterationCommittedPayload {
            request_id: request_id.to_string(),
            expected_completed,
            iteration: result.iteration,
            transaction_id: result.transaction_id.to_string(),
            recipient: result.recipient.name.clone(),
            recipient_anonymous: result.recipient.anonymous,
            at,
        };
        self.transition(
            request_id,
            JournalEntryType::IterationCommitted,
            &payload,
            |c| c.apply_advance(expected_completed, result, at),
        )
    }

    async fn clear_in_flight(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
    ) -> Result<(), CheckpointError> {
        let at = now_ms();
        let payload = IterationAbandonedPayload {
            request_id: request_id.to_string(),
            iteration,
            at,
        };
        self.transition(
            request_id,
            JournalEntryType::IterationAbandoned,
            &payload,
            |c| c.apply_clear(iteration, at),
        )
    }

    async fn fail_iteration(
        &self,
        request_id: BatchRequestId,
        failure: &FailureRecord,
    ) -> Result<(), CheckpointError> {
        let at = now_ms();
        let payload = IterationFailedPayload {
            request_id: request_id.to_string(),
            iteration: failure.iteration,
            code: failure.code.clone(),
            message: failure.message.clone(),
            outcome_unknown: failure.outcome_unknown,
            at,
        };
        self.transition(request_id, JournalEntryType::IterationFailed, &payload, |c| {
            c.apply_failure(failure, at)
        })
    }

    async fn archive(&self, request_id: BatchRequestId) -> Result<(), CheckpointError> {
        {
            let state = self.lock()?;
            if state.checkpoints.get(&request_id).is_some_and(|c| c.archived) {
                return Ok(());
            }
        }
        let at = now_ms();
        let payload = BatchArchivedPayload {
            request_id: request_id.to_string(),
            at,
        };
        self.transition(request_id, JournalEntryType::BatchArchived, &payload, |c| {
            c.apply_archive(at)
        })
    }

    async fn list_unfinished(
        &self,
        stale_before: i64,
        limit: usize,
    ) -> Result<Vec<OrchestrationCheckpoint>, CheckpointError> {
        let state = self.lock()?;
        let mut found: Vec<OrchestrationCheckpoint> = state
            .checkpoints
            .values()
            .filter(|c| c.is_recoverable() && c.updated_at <= stale_before)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.updated_at);
        found.truncate(limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_payment::error::ExecutorError;
    use std::io::Write;
    use tempfile::TempDir;

    fn request(n: u32) -> BatchRequest {
        BatchRequest::new(
            n,
            Amount::new(Decimal::new(1050, 2), "USD").unwrap(),
            Party::new("O=Bank B, L=New York, C=US"),
            true,
            Party::new("O=Notary, L=Zurich, C=CH"),
        )
    }

    fn result(iteration: u32) -> IterationResult {
        IterationResult {
            iteration,
            transaction_id: TransactionId::new(format!("tx-{}", iteration)),
            recipient: Party::anonymous(format!("key-{}", iteration)),
        }
    }

    fn journal_path(dir: &TempDir) -> PathBuf {
        dir.path().join("checkpoints").join("journal.bin")
    }

    #[tokio::test]
    async fn test_reopen_restores_every_transition() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        let done = BatchRequestId::new();
        let parked = BatchRequestId::new();

        let (done_before, parked_before) = {
            let store = JournalCheckpointStore::open(&path).unwrap();
            store.initialize(done, &request(2)).await.unwrap();
            for i in 1..=2 {
                store
                    .begin_iteration(done, i, &IssueRef::for_iteration(done, i))
                    .await
                    .unwrap();
                store.advance(done, i - 1, &result(i)).await.unwrap();
            }
            store.archive(done).await.unwrap();

            store.initialize(parked, &request(3)).await.unwrap();
            store
                .begin_iteration(parked, 1, &IssueRef::for_iteration(parked, 1))
                .await
                .unwrap();
            store
                .fail_iteration(
                    parked,
                    &FailureRecord::from_error(1, &ExecutorError::Timeout("notary".into())),
                )
                .await
                .unwrap();
            (
                store.load(done).await.unwrap().unwrap(),
                store.load(parked).await.unwrap().unwrap(),
            )
        };

        let store = JournalCheckpointStore::open(&path).unwrap();
        assert_eq!(store.load(done).await.unwrap().unwrap(), done_before);
        assert_eq!(store.load(parked).await.unwrap().unwrap(), parked_before);
        assert!(parked_before.in_flight.is_some());
        assert_eq!(done_before.last_result, Some(result(2)));
    }

    #[tokio::test]
    async fn test_rejected_transition_is_not_journaled() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        let id = BatchRequestId::new();
        let store = JournalCheckpointStore::open(&path).unwrap();
        store.initialize(id, &request(2)).await.unwrap();
        let len = fs::metadata(&path).unwrap().len();

        let err = store.advance(id, 1, &result(2)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict { .. }));
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        drop(store);

        let store = JournalCheckpointStore::open(&path).unwrap();
        assert_eq!(
            store.load(id).await.unwrap().unwrap().completed_iterations,
            0
        );
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_and_appends_continue() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        let id = BatchRequestId::new();
        {
            let store = JournalCheckpointStore::open(&path).unwrap();
            store.initialize(id, &request(2)).await.unwrap();
            store.advance(id, 0, &result(1)).await.unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[7u8; JOURNAL_HEADER_SIZE + 3]).unwrap();
        }

        {
            let store = JournalCheckpointStore::open(&path).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            assert_eq!(
                store.load(id).await.unwrap().unwrap().completed_iterations,
                1
            );
            store.advance(id, 1, &result(2)).await.unwrap();
        }

        let store = JournalCheckpointStore::open(&path).unwrap();
        assert_eq!(
            store.load(id).await.unwrap().unwrap().completed_iterations,
            2
        );
    }

    #[tokio::test]
    async fn test_corrupted_record_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        {
            let store = JournalCheckpointStore::open(&path).unwrap();
            store
                .initialize(BatchRequestId::new(), &request(1))
                .await
                .unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        bytes[JOURNAL_HEADER_SIZE + 1] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            JournalCheckpointStore::open(&path),
            Err(CheckpointError::Corrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_second_open_is_rejected_while_held() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        let id = BatchRequestId::new();
        let store = JournalCheckpointStore::open(&path).unwrap();
        store.initialize(id, &request(2)).await.unwrap();

        let second = JournalCheckpointStore::open(&path);
        assert!(matches!(second, Err(CheckpointError::Locked(_))));
        assert!(!second.err().unwrap().is_transient());

        store.advance(id, 0, &result(1)).await.unwrap();
        drop(store);

        let store = JournalCheckpointStore::open(&path).unwrap();
        assert_eq!(
            store.load(id).await.unwrap().unwrap().completed_iterations,
            1
        );
    }

    #[tokio::test]
    async fn test_oversized_record_rejected_without_advancing_seq() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        let id = BatchRequestId::new();
        let store = JournalCheckpointStore::open(&path).unwrap();
        store.initialize(id, &request(2)).await.unwrap();
        store
            .begin_iteration(id, 1, &IssueRef::for_iteration(id, 1))
            .await
            .unwrap();

        let huge = FailureRecord {
            iteration: 1,
            code: "TIMEOUT".into(),
            message: "x".repeat(70_000),
            outcome_unknown: true,
        };
        let err = store.fail_iteration(id, &huge).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Rejected(_)));
        assert!(store.load(id).await.unwrap().unwrap().failure.is_none());

        store.advance(id, 0, &result(1)).await.unwrap();
        drop(store);
        let store = JournalCheckpointStore::open(&path).unwrap();
        assert_eq!(
            store.load(id).await.unwrap().unwrap().completed_iterations,
            1
        );
    }

    #[tokio::test]
    async fn test_list_unfinished_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = journal_path(&dir);
        let id = BatchRequestId::new();
        {
            let store = JournalCheckpointStore::open(&path).unwrap();
            store.initialize(id, &request(3)).await.unwrap();
            store.advance(id, 0, &result(1)).await.unwrap();
        }
        let store = JournalCheckpointStore::open(&path).unwrap();
        let found = store.list_unfinished(i64::MAX, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].remaining(), 2);
    }
}
