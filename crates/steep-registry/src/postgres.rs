// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL registry backend.
//!
//! Submissions and process chains are stored as JSONB blobs with the
//! mutable fields (status, times, results, agent address) duplicated into
//! columns for querying. Claims (`fetch_next_*`) take a single row with
//! `FOR UPDATE SKIP LOCKED`, so concurrent callers never receive the same
//! record; compare-and-swap updates are conditional `UPDATE`s checked via
//! row counts.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use steep_model::{ProcessChain, ProcessChainStatus, Submission, SubmissionStatus};

use crate::{RegistryError, Result, ResultMap, SubmissionRegistry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    seq BIGSERIAL,
    data JSONB NOT NULL,
    status TEXT NOT NULL,
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    results JSONB,
    error_message TEXT,
    execution_state JSONB
);
CREATE INDEX IF NOT EXISTS submissions_status_idx ON submissions (status, seq);

CREATE TABLE IF NOT EXISTS process_chains (
    id TEXT PRIMARY KEY,
    seq BIGSERIAL,
    submission_id TEXT NOT NULL REFERENCES submissions (id),
    data JSONB NOT NULL,
    capabilities JSONB NOT NULL,
    status TEXT NOT NULL,
    agent_address TEXT,
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    results JSONB,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS process_chains_status_idx ON process_chains (status, seq);
CREATE INDEX IF NOT EXISTS process_chains_submission_idx ON process_chains (submission_id);
"#;

fn storage_err(err: sqlx::Error) -> RegistryError {
    RegistryError::Unavailable(err.to_string())
}

fn json_err(err: serde_json::Error) -> RegistryError {
    RegistryError::Unavailable(format!("corrupt record: {err}"))
}

fn submission_status_str(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Accepted => "ACCEPTED",
        SubmissionStatus::Running => "RUNNING",
        SubmissionStatus::Cancelled => "CANCELLED",
        SubmissionStatus::Success => "SUCCESS",
        SubmissionStatus::PartialSuccess => "PARTIAL_SUCCESS",
        SubmissionStatus::Error => "ERROR",
    }
}

fn submission_status_from_str(status: &str) -> Result<SubmissionStatus> {
    match status {
        "ACCEPTED" => Ok(SubmissionStatus::Accepted),
        "RUNNING" => Ok(SubmissionStatus::Running),
        "CANCELLED" => Ok(SubmissionStatus::Cancelled),
        "SUCCESS" => Ok(SubmissionStatus::Success),
        "PARTIAL_SUCCESS" => Ok(SubmissionStatus::PartialSuccess),
        "ERROR" => Ok(SubmissionStatus::Error),
        other => Err(RegistryError::Unavailable(format!(
            "unknown submission status '{other}'"
        ))),
    }
}

fn chain_status_str(status: ProcessChainStatus) -> &'static str {
    match status {
        ProcessChainStatus::Registered => "REGISTERED",
        ProcessChainStatus::Running => "RUNNING",
        ProcessChainStatus::Success => "SUCCESS",
        ProcessChainStatus::Error => "ERROR",
        ProcessChainStatus::Cancelled => "CANCELLED",
    }
}

fn chain_status_from_str(status: &str) -> Result<ProcessChainStatus> {
    match status {
        "REGISTERED" => Ok(ProcessChainStatus::Registered),
        "RUNNING" => Ok(ProcessChainStatus::Running),
        "SUCCESS" => Ok(ProcessChainStatus::Success),
        "ERROR" => Ok(ProcessChainStatus::Error),
        "CANCELLED" => Ok(ProcessChainStatus::Cancelled),
        other => Err(RegistryError::Unavailable(format!(
            "unknown process chain status '{other}'"
        ))),
    }
}

/// Rebuild a submission from its JSONB blob plus the mutable columns.
fn submission_from_row(row: &sqlx::postgres::PgRow) -> Result<Submission> {
    let data: Value = row.try_get("data").map_err(storage_err)?;
    let mut submission: Submission = serde_json::from_value(data).map_err(json_err)?;
    let status: String = row.try_get("status").map_err(storage_err)?;
    submission.status = submission_status_from_str(&status)?;
    submission.start_time = row.try_get("start_time").map_err(storage_err)?;
    submission.end_time = row.try_get("end_time").map_err(storage_err)?;
    submission.error_message = row.try_get("error_message").map_err(storage_err)?;
    submission.execution_state = row.try_get("execution_state").map_err(storage_err)?;
    let results: Option<Value> = row.try_get("results").map_err(storage_err)?;
    submission.results = match results {
        Some(value) => Some(serde_json::from_value(value).map_err(json_err)?),
        None => None,
    };
    Ok(submission)
}

fn chain_from_row(row: &sqlx::postgres::PgRow) -> Result<ProcessChain> {
    let data: Value = row.try_get("data").map_err(storage_err)?;
    serde_json::from_value(data).map_err(json_err)
}

/// Registry backend storing everything in PostgreSQL.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database and create the schema if necessary.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(storage_err)?;
        let registry = Self::new(pool);
        registry.setup_schema().await?;
        Ok(registry)
    }

    /// Create tables and indexes. Idempotent.
    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionRegistry for PostgresRegistry {
    async fn add_submission(&self, submission: &Submission) -> Result<()> {
        let data = serde_json::to_value(submission).map_err(json_err)?;
        let result = sqlx::query(
            r#"
            INSERT INTO submissions (id, data, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&submission.id)
        .bind(&data)
        .bind(submission_status_str(submission.status))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::Conflict(format!(
                "submission '{}' already exists",
                submission.id
            )));
        }
        Ok(())
    }

    async fn find_submission_by_id(&self, submission_id: &str) -> Result<Option<Submission>> {
        let row = sqlx::query("SELECT * FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(submission_from_row).transpose()
    }

    async fn find_submissions_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>> {
        let rows = sqlx::query("SELECT * FROM submissions WHERE status = $1 ORDER BY seq")
            .bind(submission_status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(submission_from_row).collect()
    }

    async fn count_submissions(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submissions")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn fetch_next_submission(
        &self,
        current: SubmissionStatus,
        new: SubmissionStatus,
    ) -> Result<Option<Submission>> {
        let row = sqlx::query(
            r#"
            UPDATE submissions SET status = $2
            WHERE id = (
                SELECT id FROM submissions WHERE status = $1
                ORDER BY seq LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(submission_status_str(current))
        .bind(submission_status_str(new))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(submission_from_row).transpose()
    }

    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET status = $2 WHERE id = $1")
            .bind(submission_id)
            .bind(submission_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }
        Ok(())
    }

    async fn get_submission_status(&self, submission_id: &str) -> Result<SubmissionStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM submissions WHERE id = $1")
                .bind(submission_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        match status {
            Some(status) => submission_status_from_str(&status),
            None => Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            ))),
        }
    }

    async fn set_submission_start_time(
        &self,
        submission_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET start_time = $2 WHERE id = $1")
            .bind(submission_id)
            .bind(start_time)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }
        Ok(())
    }

    async fn set_submission_end_time(
        &self,
        submission_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET end_time = $2 WHERE id = $1")
            .bind(submission_id)
            .bind(end_time)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }
        Ok(())
    }

    async fn set_submission_results(
        &self,
        submission_id: &str,
        results: Option<&ResultMap>,
    ) -> Result<()> {
        let results = results
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_err)?;
        let result = sqlx::query("UPDATE submissions SET results = $2 WHERE id = $1")
            .bind(submission_id)
            .bind(results)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }
        Ok(())
    }

    async fn get_submission_results(&self, submission_id: &str) -> Result<Option<ResultMap>> {
        let row = sqlx::query("SELECT results FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| RegistryError::NotFound(format!("submission '{submission_id}'")))?;
        let results: Option<Value> = row.try_get("results").map_err(storage_err)?;
        results
            .map(|v| serde_json::from_value(v).map_err(json_err))
            .transpose()
    }

    async fn set_submission_error_message(
        &self,
        submission_id: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET error_message = $2 WHERE id = $1")
            .bind(submission_id)
            .bind(error_message)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }
        Ok(())
    }

    async fn set_submission_execution_state(
        &self,
        submission_id: &str,
        state: Option<&Value>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET execution_state = $2 WHERE id = $1")
            .bind(submission_id)
            .bind(state)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }
        Ok(())
    }

    async fn get_submission_execution_state(
        &self,
        submission_id: &str,
    ) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT execution_state FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| RegistryError::NotFound(format!("submission '{submission_id}'")))?;
        row.try_get("execution_state").map_err(storage_err)
    }

    async fn add_process_chains(
        &self,
        chains: &[ProcessChain],
        submission_id: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?;
        if exists.is_none() {
            return Err(RegistryError::NotFound(format!(
                "submission '{submission_id}'"
            )));
        }

        for chain in chains {
            let data = serde_json::to_value(chain).map_err(json_err)?;
            let capabilities =
                serde_json::to_value(&chain.required_capabilities).map_err(json_err)?;
            sqlx::query(
                r#"
                INSERT INTO process_chains (id, submission_id, data, capabilities, status)
                VALUES ($1, $2, $3, $4, 'REGISTERED')
                "#,
            )
            .bind(&chain.id)
            .bind(submission_id)
            .bind(&data)
            .bind(&capabilities)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn find_process_chain_by_id(&self, chain_id: &str) -> Result<Option<ProcessChain>> {
        let row = sqlx::query("SELECT data FROM process_chains WHERE id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(chain_from_row).transpose()
    }

    async fn find_process_chains_by_submission(
        &self,
        submission_id: &str,
    ) -> Result<Vec<ProcessChain>> {
        let rows = sqlx::query(
            "SELECT data FROM process_chains WHERE submission_id = $1 ORDER BY seq",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(chain_from_row).collect()
    }

    async fn find_process_chains_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> Result<Vec<ProcessChain>> {
        let rows = sqlx::query("SELECT data FROM process_chains WHERE status = $1 ORDER BY seq")
            .bind(chain_status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(chain_from_row).collect()
    }

    async fn count_process_chains_by_status(
        &self,
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM process_chains WHERE submission_id = $1 AND status = $2",
        )
        .bind(submission_id)
        .bind(chain_status_str(status))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn fetch_next_process_chain(
        &self,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
        required_capabilities: Option<&BTreeSet<String>>,
    ) -> Result<Option<ProcessChain>> {
        let capabilities = required_capabilities
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_err)?;
        let row = sqlx::query(
            r#"
            UPDATE process_chains SET status = $2
            WHERE id = (
                SELECT id FROM process_chains
                WHERE status = $1 AND ($3::jsonb IS NULL OR capabilities = $3::jsonb)
                ORDER BY seq LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING data
            "#,
        )
        .bind(chain_status_str(current))
        .bind(chain_status_str(new))
        .bind(capabilities)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(chain_from_row).transpose()
    }

    async fn set_process_chain_status(
        &self,
        chain_id: &str,
        status: ProcessChainStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE process_chains SET status = $2 WHERE id = $1")
            .bind(chain_id)
            .bind(chain_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("process chain '{chain_id}'")));
        }
        Ok(())
    }

    async fn set_process_chain_status_if(
        &self,
        chain_id: &str,
        expected: ProcessChainStatus,
        status: ProcessChainStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE process_chains SET status = $3 WHERE id = $1 AND status = $2")
                .bind(chain_id)
                .bind(chain_status_str(expected))
                .bind(chain_status_str(status))
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_process_chain_status(&self, chain_id: &str) -> Result<ProcessChainStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM process_chains WHERE id = $1")
                .bind(chain_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        match status {
            Some(status) => chain_status_from_str(&status),
            None => Err(RegistryError::NotFound(format!("process chain '{chain_id}'"))),
        }
    }

    async fn set_all_process_chain_statuses_by_submission(
        &self,
        submission_id: &str,
        expected: ProcessChainStatus,
        status: ProcessChainStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE process_chains SET status = $3 WHERE submission_id = $1 AND status = $2",
        )
        .bind(submission_id)
        .bind(chain_status_str(expected))
        .bind(chain_status_str(status))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn set_process_chain_agent(
        &self,
        chain_id: &str,
        agent_address: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE process_chains SET agent_address = $2 WHERE id = $1")
            .bind(chain_id)
            .bind(agent_address)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("process chain '{chain_id}'")));
        }
        Ok(())
    }

    async fn get_process_chain_agent(&self, chain_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT agent_address FROM process_chains WHERE id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| RegistryError::NotFound(format!("process chain '{chain_id}'")))?;
        row.try_get("agent_address").map_err(storage_err)
    }

    async fn find_process_chain_agents_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> Result<Vec<(String, Option<String>)>> {
        let rows = sqlx::query(
            "SELECT id, agent_address FROM process_chains WHERE status = $1 ORDER BY seq",
        )
        .bind(chain_status_str(status))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(storage_err)?;
                let agent: Option<String> = row.try_get("agent_address").map_err(storage_err)?;
                Ok((id, agent))
            })
            .collect()
    }

    async fn set_process_chain_start_time(
        &self,
        chain_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE process_chains SET start_time = $2 WHERE id = $1")
            .bind(chain_id)
            .bind(start_time)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("process chain '{chain_id}'")));
        }
        Ok(())
    }

    async fn set_process_chain_end_time(
        &self,
        chain_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE process_chains SET end_time = $2 WHERE id = $1")
            .bind(chain_id)
            .bind(end_time)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("process chain '{chain_id}'")));
        }
        Ok(())
    }

    async fn set_process_chain_results(
        &self,
        chain_id: &str,
        results: Option<&ResultMap>,
    ) -> Result<()> {
        let results = results
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_err)?;
        let result = sqlx::query("UPDATE process_chains SET results = $2 WHERE id = $1")
            .bind(chain_id)
            .bind(results)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("process chain '{chain_id}'")));
        }
        Ok(())
    }

    async fn get_process_chain_results(&self, chain_id: &str) -> Result<Option<ResultMap>> {
        let row = sqlx::query("SELECT results FROM process_chains WHERE id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| RegistryError::NotFound(format!("process chain '{chain_id}'")))?;
        let results: Option<Value> = row.try_get("results").map_err(storage_err)?;
        results
            .map(|v| serde_json::from_value(v).map_err(json_err))
            .transpose()
    }

    async fn set_process_chain_error_message(
        &self,
        chain_id: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE process_chains SET error_message = $2 WHERE id = $1")
            .bind(chain_id)
            .bind(error_message)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("process chain '{chain_id}'")));
        }
        Ok(())
    }

    async fn get_process_chain_error_message(&self, chain_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT error_message FROM process_chains WHERE id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| RegistryError::NotFound(format!("process chain '{chain_id}'")))?;
        row.try_get("error_message").map_err(storage_err)
    }
}
