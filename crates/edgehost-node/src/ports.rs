// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port allocation for worker sockets.
//!
//! Every worker owns two ports, keyed by its UID and by `"{uid}-control"`.
//! Claims are idempotent: claiming an already-claimed key returns the same port.

use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;

use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Key under which a worker's control socket port is claimed.
pub fn control_key(uid: &str) -> String {
    format!("{}-control", uid)
}

/// Hands out local ports to workers.
#[async_trait::async_trait]
pub trait PortAllocator: Send + Sync {
    /// Claim a port for `key`, returning the existing claim if there is one.
    async fn claim_port(&self, key: &str) -> Result<u16>;

    /// Port currently claimed for `key`.
    async fn get_port(&self, key: &str) -> Option<u16>;

    /// Release the claim of `key`. Releasing an unknown key is a no-op.
    async fn release_port(&self, key: &str);
}

#[derive(Default)]
struct Claims {
    by_key: HashMap<String, u16>,
    in_use: BTreeSet<u16>,
}

/// Allocator handing out ports from a fixed range, lowest free port first.
pub struct InMemoryPortAllocator {
    range: RangeInclusive<u16>,
    claims: Mutex<Claims>,
}

impl InMemoryPortAllocator {
    /// Create an allocator over `range`.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            claims: Mutex::new(Claims::default()),
        }
    }
}

#[async_trait::async_trait]
impl PortAllocator for InMemoryPortAllocator {
    async fn claim_port(&self, key: &str) -> Result<u16> {
        let mut claims = self.claims.lock().await;
        if let Some(port) = claims.by_key.get(key) {
            return Ok(*port);
        }

        let port = self
            .range
            .clone()
            .find(|p| !claims.in_use.contains(p))
            .ok_or(Error::PortsExhausted)?;

        claims.in_use.insert(port);
        claims.by_key.insert(key.to_string(), port);
        Ok(port)
    }

    async fn get_port(&self, key: &str) -> Option<u16> {
        self.claims.lock().await.by_key.get(key).copied()
    }

    async fn release_port(&self, key: &str) {
        let mut claims = self.claims.lock().await;
        if let Some(port) = claims.by_key.remove(key) {
            claims.in_use.remove(&port);
        }
    }
}
