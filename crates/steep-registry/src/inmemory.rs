// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry backend.
//!
//! Keeps everything under a single async mutex, which trivially makes
//! `fetch_next_*` and the compare-and-swap operations linearizable. Used by
//! tests and single-node deployments.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use steep_model::{ProcessChain, ProcessChainStatus, Submission, SubmissionStatus};
use tokio::sync::Mutex;

use crate::{RegistryError, Result, ResultMap, SubmissionRegistry};

#[derive(Debug, Clone)]
struct StoredChain {
    chain: ProcessChain,
    status: ProcessChainStatus,
    agent_address: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    results: Option<ResultMap>,
    error_message: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Submissions in insertion order.
    submissions: Vec<Submission>,
    /// Chains in insertion order across all submissions.
    chains: Vec<StoredChain>,
}

impl Inner {
    fn submission_mut(&mut self, id: &str) -> Result<&mut Submission> {
        self.submissions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound(format!("submission '{id}'")))
    }

    fn submission(&self, id: &str) -> Result<&Submission> {
        self.submissions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound(format!("submission '{id}'")))
    }

    fn chain_mut(&mut self, id: &str) -> Result<&mut StoredChain> {
        self.chains
            .iter_mut()
            .find(|c| c.chain.id == id)
            .ok_or_else(|| RegistryError::NotFound(format!("process chain '{id}'")))
    }

    fn chain(&self, id: &str) -> Result<&StoredChain> {
        self.chains
            .iter()
            .find(|c| c.chain.id == id)
            .ok_or_else(|| RegistryError::NotFound(format!("process chain '{id}'")))
    }
}

/// Registry backend holding all state in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    inner: Mutex<Inner>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionRegistry for InMemoryRegistry {
    async fn add_submission(&self, submission: &Submission) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.submissions.iter().any(|s| s.id == submission.id) {
            return Err(RegistryError::Conflict(format!(
                "submission '{}' already exists",
                submission.id
            )));
        }
        inner.submissions.push(submission.clone());
        Ok(())
    }

    async fn find_submission_by_id(&self, submission_id: &str) -> Result<Option<Submission>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .submissions
            .iter()
            .find(|s| s.id == submission_id)
            .cloned())
    }

    async fn find_submissions_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<Submission>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .submissions
            .iter()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn count_submissions(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.submissions.len() as u64)
    }

    async fn fetch_next_submission(
        &self,
        current: SubmissionStatus,
        new: SubmissionStatus,
    ) -> Result<Option<Submission>> {
        let mut inner = self.inner.lock().await;
        for submission in inner.submissions.iter_mut() {
            if submission.status == current {
                submission.status = new;
                return Ok(Some(submission.clone()));
            }
        }
        Ok(None)
    }

    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission_mut(submission_id)?.status = status;
        Ok(())
    }

    async fn get_submission_status(&self, submission_id: &str) -> Result<SubmissionStatus> {
        let inner = self.inner.lock().await;
        Ok(inner.submission(submission_id)?.status)
    }

    async fn set_submission_start_time(
        &self,
        submission_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission_mut(submission_id)?.start_time = Some(start_time);
        Ok(())
    }

    async fn set_submission_end_time(
        &self,
        submission_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission_mut(submission_id)?.end_time = Some(end_time);
        Ok(())
    }

    async fn set_submission_results(
        &self,
        submission_id: &str,
        results: Option<&ResultMap>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission_mut(submission_id)?.results = results.cloned();
        Ok(())
    }

    async fn get_submission_results(&self, submission_id: &str) -> Result<Option<ResultMap>> {
        let inner = self.inner.lock().await;
        Ok(inner.submission(submission_id)?.results.clone())
    }

    async fn set_submission_error_message(
        &self,
        submission_id: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission_mut(submission_id)?.error_message =
            error_message.map(|m| m.to_string());
        Ok(())
    }

    async fn set_submission_execution_state(
        &self,
        submission_id: &str,
        state: Option<&Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission_mut(submission_id)?.execution_state = state.cloned();
        Ok(())
    }

    async fn get_submission_execution_state(
        &self,
        submission_id: &str,
    ) -> Result<Option<Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.submission(submission_id)?.execution_state.clone())
    }

    async fn add_process_chains(
        &self,
        chains: &[ProcessChain],
        submission_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submission(submission_id)?;
        for chain in chains {
            if inner.chains.iter().any(|c| c.chain.id == chain.id) {
                return Err(RegistryError::Conflict(format!(
                    "process chain '{}' already exists",
                    chain.id
                )));
            }
        }
        for chain in chains {
            inner.chains.push(StoredChain {
                chain: chain.clone(),
                status: ProcessChainStatus::Registered,
                agent_address: None,
                start_time: None,
                end_time: None,
                results: None,
                error_message: None,
            });
        }
        Ok(())
    }

    async fn find_process_chain_by_id(&self, chain_id: &str) -> Result<Option<ProcessChain>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chains
            .iter()
            .find(|c| c.chain.id == chain_id)
            .map(|c| c.chain.clone()))
    }

    async fn find_process_chains_by_submission(
        &self,
        submission_id: &str,
    ) -> Result<Vec<ProcessChain>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chains
            .iter()
            .filter(|c| c.chain.submission_id == submission_id)
            .map(|c| c.chain.clone())
            .collect())
    }

    async fn find_process_chains_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> Result<Vec<ProcessChain>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chains
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.chain.clone())
            .collect())
    }

    async fn count_process_chains_by_status(
        &self,
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chains
            .iter()
            .filter(|c| c.chain.submission_id == submission_id && c.status == status)
            .count() as u64)
    }

    async fn fetch_next_process_chain(
        &self,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
        required_capabilities: Option<&BTreeSet<String>>,
    ) -> Result<Option<ProcessChain>> {
        let mut inner = self.inner.lock().await;
        for stored in inner.chains.iter_mut() {
            if stored.status != current {
                continue;
            }
            if let Some(capabilities) = required_capabilities {
                if &stored.chain.required_capabilities != capabilities {
                    continue;
                }
            }
            stored.status = new;
            return Ok(Some(stored.chain.clone()));
        }
        Ok(None)
    }

    async fn set_process_chain_status(
        &self,
        chain_id: &str,
        status: ProcessChainStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_mut(chain_id)?.status = status;
        Ok(())
    }

    async fn set_process_chain_status_if(
        &self,
        chain_id: &str,
        expected: ProcessChainStatus,
        status: ProcessChainStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let stored = inner.chain_mut(chain_id)?;
        if stored.status != expected {
            return Ok(false);
        }
        stored.status = status;
        Ok(true)
    }

    async fn get_process_chain_status(&self, chain_id: &str) -> Result<ProcessChainStatus> {
        let inner = self.inner.lock().await;
        Ok(inner.chain(chain_id)?.status)
    }

    async fn set_all_process_chain_statuses_by_submission(
        &self,
        submission_id: &str,
        expected: ProcessChainStatus,
        status: ProcessChainStatus,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for stored in inner.chains.iter_mut() {
            if stored.chain.submission_id == submission_id && stored.status == expected {
                stored.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn set_process_chain_agent(
        &self,
        chain_id: &str,
        agent_address: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_mut(chain_id)?.agent_address = agent_address.map(|a| a.to_string());
        Ok(())
    }

    async fn get_process_chain_agent(&self, chain_id: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.chain(chain_id)?.agent_address.clone())
    }

    async fn find_process_chain_agents_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> Result<Vec<(String, Option<String>)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chains
            .iter()
            .filter(|c| c.status == status)
            .map(|c| (c.chain.id.clone(), c.agent_address.clone()))
            .collect())
    }

    async fn set_process_chain_start_time(
        &self,
        chain_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_mut(chain_id)?.start_time = Some(start_time);
        Ok(())
    }

    async fn set_process_chain_end_time(
        &self,
        chain_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_mut(chain_id)?.end_time = Some(end_time);
        Ok(())
    }

    async fn set_process_chain_results(
        &self,
        chain_id: &str,
        results: Option<&ResultMap>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_mut(chain_id)?.results = results.cloned();
        Ok(())
    }

    async fn get_process_chain_results(&self, chain_id: &str) -> Result<Option<ResultMap>> {
        let inner = self.inner.lock().await;
        Ok(inner.chain(chain_id)?.results.clone())
    }

    async fn set_process_chain_error_message(
        &self,
        chain_id: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_mut(chain_id)?.error_message = error_message.map(|m| m.to_string());
        Ok(())
    }

    async fn get_process_chain_error_message(&self, chain_id: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.chain(chain_id)?.error_message.clone())
    }
}
