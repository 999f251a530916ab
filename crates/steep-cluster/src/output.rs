// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output capture and result enumeration.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::watch;

/// Bounded ring of the last *K* captured output lines.
///
/// Runtimes append every stdout/stderr line; the executor reads the ring
/// when composing an error message. If a progress estimator is attached,
/// each appended line triggers an estimate over a copy of the ring (the
/// copy avoids handing the estimator a concurrently mutated buffer).
pub struct OutputCollector {
    max_lines: usize,
    lines: Mutex<VecDeque<String>>,
    estimator: Option<std::sync::Arc<dyn crate::runtime::ProgressEstimator>>,
    fraction_tx: watch::Sender<f64>,
}

impl OutputCollector {
    /// Create a collector keeping at most `max_lines` lines.
    pub fn new(max_lines: usize) -> Self {
        let (fraction_tx, _) = watch::channel(0.0);
        Self {
            max_lines: max_lines.max(1),
            lines: Mutex::new(VecDeque::new()),
            estimator: None,
            fraction_tx,
        }
    }

    /// Attach a progress estimator invoked on every captured line.
    pub fn with_estimator(
        mut self,
        estimator: std::sync::Arc<dyn crate::runtime::ProgressEstimator>,
    ) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Watch the fractional progress the estimator derives from output.
    pub fn fraction(&self) -> watch::Receiver<f64> {
        self.fraction_tx.subscribe()
    }

    /// Append one captured line, evicting the oldest above the bound.
    pub fn append(&self, line: String) {
        let snapshot = {
            let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
            if lines.len() == self.max_lines {
                lines.pop_front();
            }
            lines.push_back(line);
            self.estimator
                .as_ref()
                .map(|_| lines.iter().cloned().collect::<Vec<_>>())
        };

        if let (Some(estimator), Some(snapshot)) = (&self.estimator, snapshot) {
            if let Some(fraction) = estimator.estimate(&snapshot) {
                let _ = self.fraction_tx.send(fraction.clamp(0.0, 1.0));
            }
        }
    }

    /// The captured lines joined with newlines, or `None` when nothing was
    /// captured.
    pub fn last_output(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

/// Recursively enumerate all files under `path` in deterministic (sorted)
/// order. A plain file enumerates as itself; a missing path enumerates as
/// empty.
pub async fn enumerate_files(path: &str) -> std::io::Result<Vec<Value>> {
    let root = PathBuf::from(path);
    let metadata = match tokio::fs::metadata(&root).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    if metadata.is_file() {
        return Ok(vec![Value::String(path.to_string())]);
    }

    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.path());
        }
        children.sort();
        for child in children {
            if tokio::fs::metadata(&child).await?.is_dir() {
                pending.push(child);
            } else {
                files.push(child);
            }
        }
    }

    files.sort();
    Ok(files
        .iter()
        .map(|p| Value::String(path_to_string(p)))
        .collect())
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_keeps_last_k_lines() {
        let collector = OutputCollector::new(3);
        for i in 0..5 {
            collector.append(format!("line {i}"));
        }
        assert_eq!(
            collector.last_output().unwrap(),
            "line 2\nline 3\nline 4"
        );
    }

    #[test]
    fn test_collector_empty_output_is_none() {
        let collector = OutputCollector::new(10);
        assert!(collector.last_output().is_none());
    }

    #[tokio::test]
    async fn test_enumerate_files_is_sorted_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("b")).await.unwrap();
        tokio::fs::write(root.join("b/2.txt"), b"x").await.unwrap();
        tokio::fs::write(root.join("b/1.txt"), b"x").await.unwrap();
        tokio::fs::write(root.join("a.txt"), b"x").await.unwrap();

        let files = enumerate_files(root.to_str().unwrap()).await.unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names[0].ends_with("a.txt"));
        assert!(names[1].ends_with("b/1.txt"));
        assert!(names[2].ends_with("b/2.txt"));
    }

    #[tokio::test]
    async fn test_enumerate_missing_path_is_empty() {
        let files = enumerate_files("/does/not/exist").await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("only.txt");
        tokio::fs::write(&file, b"x").await.unwrap();

        let files = enumerate_files(file.to_str().unwrap()).await.unwrap();
        assert_eq!(files.len(), 1);
    }
}
