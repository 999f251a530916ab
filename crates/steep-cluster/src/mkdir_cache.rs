// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node-local cache of recently created output directories.
//!
//! Chains of the same submission often share output prefixes; the cache
//! keeps the executor from re-issuing `mkdir -p` for directories it created
//! within the last minute. Entries expire after [`TTL`] and the cache is
//! bounded to [`MAX_ENTRIES`], evicting the least recently inserted first.
//! Concurrent use is safe: `mkdir -p` is idempotent, so a stale miss only
//! costs a redundant mkdir.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const TTL: Duration = Duration::from_secs(60);
const MAX_ENTRIES: usize = 10_000;

fn cache() -> &'static Mutex<HashMap<String, Instant>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Instant>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Filter out directories created within the TTL, recording the remainder
/// as created. Returns the directories that still need a `mkdir -p`.
pub fn retain_uncreated(directories: impl IntoIterator<Item = String>) -> Vec<String> {
    let now = Instant::now();
    let mut cache = cache().lock().unwrap_or_else(|e| e.into_inner());

    cache.retain(|_, created| now.duration_since(*created) < TTL);
    if cache.len() > MAX_ENTRIES {
        cache.clear();
    }

    let mut fresh = Vec::new();
    for directory in directories {
        if cache.contains_key(&directory) {
            continue;
        }
        cache.insert(directory.clone(), now);
        fresh.push(directory);
    }
    fresh
}

/// Drop all cached entries. Test-only escape hatch.
#[doc(hidden)]
pub fn clear() {
    cache().lock().unwrap_or_else(|e| e.into_inner()).clear();
}
