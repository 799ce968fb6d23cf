//! PostgreSQL Checkpoint Store
//!
//! Shared persistence for several orchestrator nodes. Every transition is a
//! single conditional `UPDATE` (compare-and-set on `completed_iterations` /
//! `in_flight_iteration`); when it matches no row, the current record is loaded
//! and the in-memory transition rule explains why.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

use super::checkpoint::{CheckpointStore, OrchestrationCheckpoint, now_ms};
use super::error::CheckpointError;
use super::types::{
    BatchRequest, BatchRequestId, FailureRecord, InFlightIteration, IssueRef, IterationResult,
    Party, TransactionId,
};
use crate::money::Amount;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mass_payment_checkpoints_tb (
    request_id               TEXT PRIMARY KEY,
    iteration_count          INTEGER NOT NULL CHECK (iteration_count >= 1),
    amount                   NUMERIC(38, 8) NOT NULL,
    currency                 TEXT NOT NULL,
    recipient                TEXT NOT NULL,
    anonymize                BOOLEAN NOT NULL,
    notary                   TEXT NOT NULL,
    completed_iterations     INTEGER NOT NULL DEFAULT 0,
    in_flight_iteration      INTEGER,
    in_flight_ref            TEXT,
    last_iteration           INTEGER,
    last_tx_id               TEXT,
    last_recipient           TEXT,
    last_recipient_anonymous BOOLEAN,
    failure_iteration        INTEGER,
    failure_code             TEXT,
    failure_message          TEXT,
    failure_outcome_unknown  BOOLEAN,
    archived                 BOOLEAN NOT NULL DEFAULT FALSE,
    created_at               BIGINT NOT NULL,
    updated_at               BIGINT NOT NULL,
    CHECK (completed_iterations >= 0 AND completed_iterations <= iteration_count)
)
"#;

const COLUMNS: &str = r#"
    request_id, iteration_count, amount, currency, recipient, anonymize, notary,
    completed_iterations, in_flight_iteration, in_flight_ref,
    last_iteration, last_tx_id, last_recipient, last_recipient_anonymous,
    failure_iteration, failure_code, failure_message, failure_outcome_unknown,
    archived, created_at, updated_at
"#;

pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bootstrap the schema
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        tracing::info!("PostgreSQL checkpoint pool established");

        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Explain a CAS miss by applying the transition to the stored record
    async fn diagnose<T>(
        &self,
        request_id: BatchRequestId,
        transition: impl FnOnce(&mut OrchestrationCheckpoint) -> Result<T, CheckpointError>,
    ) -> Result<T, CheckpointError> {
        let mut checkpoint = self
            .load(request_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(request_id.to_string()))?;
        transition(&mut checkpoint)
    }

    fn row_to_checkpoint(row: &PgRow) -> Result<OrchestrationCheckpoint, CheckpointError> {
        let request_id_str: String = row.try_get("request_id")?;
        let request_id: BatchRequestId = request_id_str
            .parse()
            .map_err(|_| CheckpointError::Corrupted(format!("bad request_id {}", request_id_str)))?;

        let currency: String = row.try_get("currency")?;
        let amount = Amount::new(row.try_get("amount")?, &currency)
            .map_err(|e| CheckpointError::Corrupted(e.to_string()))?;

        let request = BatchRequest::new(
            row.try_get::<i32, _>("iteration_count")? as u32,
            amount,
            Party::new(row.try_get::<String, _>("recipient")?),
            row.try_get("anonymize")?,
            Party::new(row.try_get::<String, _>("notary")?),
        );

        let in_flight = match (
            row.try_get::<Option<i32>, _>("in_flight_iteration")?,
            row.try_get::<Option<String>, _>("in_flight_ref")?,
        ) {
            (Some(iteration), Some(issue_ref)) => Some(InFlightIteration {
                iteration: iteration as u32,
                issue_ref: IssueRef::from(issue_ref),
            }),
            _ => None,
        };

        let last_result = match (
            row.try_get::<Option<i32>, _>("last_iteration")?,
            row.try_get::<Option<String>, _>("last_tx_id")?,
            row.try_get::<Option<String>, _>("last_recipient")?,
        ) {
            (Some(iteration), Some(tx_id), Some(recipient)) => Some(IterationResult {
                iteration: iteration as u32,
                transaction_id: TransactionId::new(tx_id),
                recipient: Party {
                    name: recipient,
                    anonymous: row
                        .try_get::<Option<bool>, _>("last_recipient_anonymous")?
                        .unwrap_or(false),
                },
            }),
            _ => None,
        };

        let failure = match (
            row.try_get::<Option<i32>, _>("failure_iteration")?,
            row.try_get::<Option<String>, _>("failure_code")?,
        ) {
            (Some(iteration), Some(code)) => Some(FailureRecord {
                iteration: iteration as u32,
                code,
                message: row
                    .try_get::<Option<String>, _>("failure_message")?
                    .unwrap_or_default(),
                outcome_unknown: row
                    .try_get::<Option<bool>, _>("failure_outcome_unknown")?
                    .unwrap_or(false),
            }),
            _ => None,
        };

        Ok(OrchestrationCheckpoint {
            request_id,
            request,
            completed_iterations: row.try_get::<i32, _>("completed_iterations")? as u32,
            in_flight,
            last_result,
            failure,
            archived: row.try_get("archived")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(
        &self,
        request_id: BatchRequestId,
        request: &BatchRequest,
    ) -> Result<OrchestrationCheckpoint, CheckpointError> {
        let checkpoint = OrchestrationCheckpoint::new(request_id, request.clone());
        let result = sqlx::query(
            r#"
            INSERT INTO mass_payment_checkpoints_tb
                (request_id, iteration_count, amount, currency, recipient, anonymize, notary,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id.to_string())
        .bind(request.iteration_count as i32)
        .bind(request.amount.quantity())
        .bind(request.amount.currency().as_str())
        .bind(&request.recipient.name)
        .bind(request.anonymize)
        .bind(&request.notary.name)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CheckpointError::AlreadyExists(request_id.to_string()));
        }
        Ok(checkpoint)
    }

    async fn load(
        &self,
        request_id: BatchRequestId,
    ) -> Result<Option<OrchestrationCheckpoint>, CheckpointError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM mass_payment_checkpoints_tb WHERE request_id = $1",
            COLUMNS
        ))
        .bind(request_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn begin_iteration(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
        issue_ref: &IssueRef,
    ) -> Result<(), CheckpointError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE mass_payment_checkpoints_tb
            SET in_flight_iteration = $2, in_flight_ref = $3,
                failure_iteration = NULL, failure_code = NULL,
                failure_message = NULL, failure_outcome_unknown = NULL,
                updated_at = $4
            WHERE request_id = $1
              AND archived = FALSE
              AND completed_iterations = $2 - 1
              AND $2 <= iteration_count
              AND (in_flight_iteration IS NULL
                   OR (in_flight_iteration = $2 AND in_flight_ref = $3))
            "#,
        )
        .bind(request_id.to_string())
        .bind(iteration as i32)
        .bind(issue_ref.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        self.diagnose(request_id, |c| c.apply_begin(iteration, issue_ref, now))
            .await?;
        Err(CheckpointError::Storage("concurrent checkpoint update".into()))
    }

    async fn advance(
        &self,
        request_id: BatchRequestId,
        expected_completed: u32,
        result: &IterationResult,
    ) -> Result<u32, CheckpointError> {
        let now = now_ms();
        let row = sqlx::query(
            r#"
            UPDATE mass_payment_checkpoints_tb
            SET completed_iterations = $3,
                last_iteration = $3, last_tx_id = $4,
                last_recipient = $5, last_recipient_anonymous = $6,
                in_flight_iteration = NULL, in_flight_ref = NULL,
                failure_iteration = NULL, failure_code = NULL,
                failure_message = NULL, failure_outcome_unknown = NULL,
                updated_at = $7
            WHERE request_id = $1
              AND completed_iterations = $2
              AND completed_iterations < iteration_count
              AND archived = FALSE
              AND $3 = $2 + 1
            RETURNING completed_iterations
            "#,
        )
        .bind(request_id.to_string())
        .bind(expected_completed as i32)
        .bind(result.iteration as i32)
        .bind(result.transaction_id.as_str())
        .bind(&result.recipient.name)
        .bind(result.recipient.anonymous)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(row.try_get::<i32, _>("completed_iterations")? as u32);
        }
        self.diagnose(request_id, |c| c.apply_advance(expected_completed, result, now))
            .await?;
        Err(CheckpointError::Storage("concurrent checkpoint update".into()))
    }

    async fn clear_in_flight(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
    ) -> Result<(), CheckpointError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE mass_payment_checkpoints_tb
            SET in_flight_iteration = NULL, in_flight_ref = NULL, updated_at = $3
            WHERE request_id = $1 AND in_flight_iteration = $2
            "#,
        )
        .bind(request_id.to_string())
        .bind(iteration as i32)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        // No marker set is a no-op
        self.diagnose(request_id, |c| c.apply_clear(iteration, now))
            .await
    }

    async fn fail_iteration(
        &self,
        request_id: BatchRequestId,
        failure: &FailureRecord,
    ) -> Result<(), CheckpointError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE mass_payment_checkpoints_tb
            SET failure_iteration = $2, failure_code = $3,
                failure_message = $4, failure_outcome_unknown = $5,
                in_flight_iteration = CASE WHEN $5 THEN in_flight_iteration ELSE NULL END,
                in_flight_ref = CASE WHEN $5 THEN in_flight_ref ELSE NULL END,
                updated_at = $6
            WHERE request_id = $1 AND completed_iterations = $2 - 1
            "#,
        )
        .bind(request_id.to_string())
        .bind(failure.iteration as i32)
        .bind(&failure.code)
        .bind(&failure.message)
        .bind(failure.outcome_unknown)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        self.diagnose(request_id, |c| c.apply_failure(failure, now))
            .await?;
        Err(CheckpointError::Storage("concurrent checkpoint update".into()))
    }

    async fn archive(&self, request_id: BatchRequestId) -> Result<(), CheckpointError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE mass_payment_checkpoints_tb
            SET archived = TRUE, updated_at = $2
            WHERE request_id = $1
              AND completed_iterations = iteration_count
              AND archived = FALSE
            "#,
        )
        .bind(request_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Already archived is a no-op
        self.diagnose(request_id, |c| c.apply_archive(now)).await
    }

    async fn list_unfinished(
        &self,
        stale_before: i64,
        limit: usize,
    ) -> Result<Vec<OrchestrationCheckpoint>, CheckpointError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM mass_payment_checkpoints_tb
            WHERE archived = FALSE
              AND failure_code IS NULL
              AND updated_at <= $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }
}
