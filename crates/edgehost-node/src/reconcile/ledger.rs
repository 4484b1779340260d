// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-worker version ledger.
//!
//! Push events may arrive out of order. The ledger remembers the version each
//! worker currently runs at and a bounded list of versions it has moved past,
//! so a late event for an old version can be ignored.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Retired versions remembered per worker.
pub const DEFAULT_RETAINED_VERSIONS: usize = 8;

#[derive(Debug, Default)]
struct LedgerEntry {
    current: Option<String>,
    retired: VecDeque<String>,
}

impl LedgerEntry {
    fn retire(&mut self, version: String, limit: usize) {
        if self.retired.contains(&version) {
            return;
        }
        self.retired.push_back(version);
        while self.retired.len() > limit {
            self.retired.pop_front();
        }
    }
}

/// Versions applied on this node.
#[derive(Debug)]
pub struct VersionLedger {
    entries: DashMap<String, LedgerEntry>,
    retained: usize,
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_RETAINED_VERSIONS)
    }
}

impl VersionLedger {
    /// Ledger remembering `retained` past versions per worker.
    pub fn new(retained: usize) -> Self {
        Self {
            entries: DashMap::new(),
            retained: retained.max(1),
        }
    }

    /// Version currently applied for `uid`.
    pub fn current(&self, uid: &str) -> Option<String> {
        self.entries.get(uid).and_then(|e| e.current.clone())
    }

    /// Whether `version` of `uid` is one this node has already moved past.
    pub fn is_retired(&self, uid: &str, version: &str) -> bool {
        self.entries
            .get(uid)
            .is_some_and(|e| e.retired.iter().any(|v| v == version))
    }

    /// Whether a delete for `version` of `uid` is outdated: a different version
    /// is live, or that version was already retired.
    pub fn is_stale_delete(&self, uid: &str, version: &str) -> bool {
        match self.entries.get(uid) {
            Some(entry) => {
                entry.retired.iter().any(|v| v == version)
                    || entry.current.as_deref().is_some_and(|c| c != version)
            }
            None => false,
        }
    }

    /// Record `version` as applied for `uid`. The previous version is retired.
    pub fn record(&self, uid: &str, version: &str) {
        let mut entry = self.entries.entry(uid.to_string()).or_default();
        entry.retired.retain(|v| v != version);
        if let Some(previous) = entry.current.replace(version.to_string())
            && previous != version
        {
            entry.retire(previous, self.retained);
        }
    }

    /// Retire whatever version `uid` currently runs at.
    pub fn retire(&self, uid: &str) {
        if let Some(mut entry) = self.entries.get_mut(uid)
            && let Some(previous) = entry.current.take()
        {
            entry.retire(previous, self.retained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_retires_previous_version() {
        let ledger = VersionLedger::default();
        ledger.record("w1", "v1");
        ledger.record("w1", "v2");

        assert_eq!(ledger.current("w1").as_deref(), Some("v2"));
        assert!(ledger.is_retired("w1", "v1"));
        assert!(!ledger.is_retired("w1", "v2"));
    }

    #[test]
    fn test_stale_delete() {
        let ledger = VersionLedger::default();
        assert!(!ledger.is_stale_delete("w1", "v1"));

        ledger.record("w1", "v1");
        assert!(!ledger.is_stale_delete("w1", "v1"));

        ledger.record("w1", "v2");
        assert!(ledger.is_stale_delete("w1", "v1"));
        assert!(!ledger.is_stale_delete("w1", "v2"));
    }

    #[test]
    fn test_retire_then_rerecord() {
        let ledger = VersionLedger::default();
        ledger.record("w1", "v1");
        ledger.retire("w1");
        assert!(ledger.current("w1").is_none());
        assert!(ledger.is_retired("w1", "v1"));

        // A pull reconciliation may legitimately bring a version back.
        ledger.record("w1", "v1");
        assert!(!ledger.is_retired("w1", "v1"));
    }

    #[test]
    fn test_retired_versions_are_bounded() {
        let ledger = VersionLedger::new(2);
        for v in ["v1", "v2", "v3", "v4"] {
            ledger.record("w1", v);
        }
        assert!(!ledger.is_retired("w1", "v1"));
        assert!(ledger.is_retired("w1", "v2"));
        assert!(ledger.is_retired("w1", "v3"));
    }
}
