// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the in-memory registry backend.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use steep_model::{ProcessChain, ProcessChainStatus, Submission, SubmissionStatus, Workflow};
use steep_registry::{InMemoryRegistry, RegistryError, SubmissionRegistry};

fn submission() -> Submission {
    Submission::new(Workflow {
        name: None,
        vars: vec![],
        actions: vec![],
    })
}

fn chain(id: &str, submission_id: &str, capabilities: &[&str]) -> ProcessChain {
    ProcessChain {
        id: id.to_string(),
        submission_id: submission_id.to_string(),
        executables: vec![],
        required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_fetch_next_submission_claims_once() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();

    let claimed = registry
        .fetch_next_submission(SubmissionStatus::Accepted, SubmissionStatus::Running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, submission.id);

    // The submission moved out of ACCEPTED, a second claim finds nothing
    let second = registry
        .fetch_next_submission(SubmissionStatus::Accepted, SubmissionStatus::Running)
        .await
        .unwrap();
    assert!(second.is_none());

    let status = registry.get_submission_status(&submission.id).await.unwrap();
    assert_eq!(status, SubmissionStatus::Running);
}

#[tokio::test]
async fn test_fetch_next_on_empty_registry_returns_none() {
    let registry = InMemoryRegistry::new();
    assert!(registry
        .fetch_next_submission(SubmissionStatus::Accepted, SubmissionStatus::Running)
        .await
        .unwrap()
        .is_none());
    assert!(registry
        .fetch_next_process_chain(
            ProcessChainStatus::Registered,
            ProcessChainStatus::Running,
            None
        )
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_add_process_chains_requires_known_submission() {
    let registry = InMemoryRegistry::new();
    let result = registry
        .add_process_chains(&[chain("c1", "missing", &[])], "missing")
        .await;
    assert!(matches!(result, Err(RegistryError::NotFound(_))));
}

#[tokio::test]
async fn test_process_chains_kept_in_insertion_order() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();

    let chains: Vec<ProcessChain> = (0..5)
        .map(|i| chain(&format!("c{i}"), &submission.id, &[]))
        .collect();
    registry
        .add_process_chains(&chains, &submission.id)
        .await
        .unwrap();

    let found = registry
        .find_process_chains_by_submission(&submission.id)
        .await
        .unwrap();
    assert_eq!(found, chains);
}

#[tokio::test]
async fn test_concurrent_fetch_next_returns_disjoint_chains() {
    let registry = Arc::new(InMemoryRegistry::new());
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();

    let chains: Vec<ProcessChain> = (0..16)
        .map(|i| chain(&format!("c{i}"), &submission.id, &[]))
        .collect();
    registry
        .add_process_chains(&chains, &submission.id)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(chain) = registry
                .fetch_next_process_chain(
                    ProcessChainStatus::Registered,
                    ProcessChainStatus::Running,
                    None,
                )
                .await
                .unwrap()
            {
                claimed.push(chain.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 16, "each chain claimed exactly once");
}

#[tokio::test]
async fn test_fetch_next_process_chain_filters_by_capabilities() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();
    registry
        .add_process_chains(
            &[
                chain("gpu1", &submission.id, &["gpu"]),
                chain("plain1", &submission.id, &[]),
            ],
            &submission.id,
        )
        .await
        .unwrap();

    let wanted = ["gpu".to_string()].into_iter().collect();
    let claimed = registry
        .fetch_next_process_chain(
            ProcessChainStatus::Registered,
            ProcessChainStatus::Running,
            Some(&wanted),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, "gpu1");

    // No more chains with that capability set
    assert!(registry
        .fetch_next_process_chain(
            ProcessChainStatus::Registered,
            ProcessChainStatus::Running,
            Some(&wanted),
        )
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_set_process_chain_status_if_is_compare_and_swap() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();
    registry
        .add_process_chains(&[chain("c1", &submission.id, &[])], &submission.id)
        .await
        .unwrap();

    // Wrong expectation: no swap
    let swapped = registry
        .set_process_chain_status_if(
            "c1",
            ProcessChainStatus::Running,
            ProcessChainStatus::Registered,
        )
        .await
        .unwrap();
    assert!(!swapped);
    assert_eq!(
        registry.get_process_chain_status("c1").await.unwrap(),
        ProcessChainStatus::Registered
    );

    // Right expectation: swap happens exactly once
    let swapped = registry
        .set_process_chain_status_if(
            "c1",
            ProcessChainStatus::Registered,
            ProcessChainStatus::Running,
        )
        .await
        .unwrap();
    assert!(swapped);
    let swapped_again = registry
        .set_process_chain_status_if(
            "c1",
            ProcessChainStatus::Registered,
            ProcessChainStatus::Running,
        )
        .await
        .unwrap();
    assert!(!swapped_again);
}

#[tokio::test]
async fn test_bulk_status_update_only_touches_expected() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();
    registry
        .add_process_chains(
            &[
                chain("c1", &submission.id, &[]),
                chain("c2", &submission.id, &[]),
                chain("c3", &submission.id, &[]),
            ],
            &submission.id,
        )
        .await
        .unwrap();

    registry
        .set_process_chain_status("c2", ProcessChainStatus::Running)
        .await
        .unwrap();

    // Cancel all REGISTERED chains of the submission
    let updated = registry
        .set_all_process_chain_statuses_by_submission(
            &submission.id,
            ProcessChainStatus::Registered,
            ProcessChainStatus::Cancelled,
        )
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(
        registry.get_process_chain_status("c2").await.unwrap(),
        ProcessChainStatus::Running
    );
    assert_eq!(
        registry.get_process_chain_status("c1").await.unwrap(),
        ProcessChainStatus::Cancelled
    );
}

#[tokio::test]
async fn test_results_and_errors_round_trip() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();
    registry
        .add_process_chains(&[chain("c1", &submission.id, &[])], &submission.id)
        .await
        .unwrap();

    let results = HashMap::from([("out".to_string(), vec![json!("/out/a.txt")])]);
    registry
        .set_process_chain_results("c1", Some(&results))
        .await
        .unwrap();
    assert_eq!(
        registry.get_process_chain_results("c1").await.unwrap(),
        Some(results.clone())
    );

    registry
        .set_process_chain_error_message("c1", Some("boom"))
        .await
        .unwrap();
    assert_eq!(
        registry.get_process_chain_error_message("c1").await.unwrap(),
        Some("boom".to_string())
    );

    registry
        .set_submission_results(&submission.id, Some(&results))
        .await
        .unwrap();
    assert_eq!(
        registry.get_submission_results(&submission.id).await.unwrap(),
        Some(results)
    );

    let state = json!({"cursor": 2});
    registry
        .set_submission_execution_state(&submission.id, Some(&state))
        .await
        .unwrap();
    assert_eq!(
        registry
            .get_submission_execution_state(&submission.id)
            .await
            .unwrap(),
        Some(state)
    );
}

#[tokio::test]
async fn test_agent_address_tracking_for_orphan_scan() {
    let registry = InMemoryRegistry::new();
    let submission = submission();
    registry.add_submission(&submission).await.unwrap();
    registry
        .add_process_chains(&[chain("c1", &submission.id, &[])], &submission.id)
        .await
        .unwrap();

    registry
        .set_process_chain_status("c1", ProcessChainStatus::Running)
        .await
        .unwrap();
    registry
        .set_process_chain_agent("c1", Some("agent.node-a"))
        .await
        .unwrap();

    let running = registry
        .find_process_chain_agents_by_status(ProcessChainStatus::Running)
        .await
        .unwrap();
    assert_eq!(
        running,
        vec![("c1".to_string(), Some("agent.node-a".to_string()))]
    );
}
