// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node and service tokens.
//!
//! A node token is `md5_hex(node_name + cluster_secret)`. The receiver recomputes it
//! from the claimed node name and its own copy of the secret, so the secret itself
//! never travels on the wire.
//!
//! Worker-to-worker calls carry a service token, `md5_hex("{caller_uid}:{cluster_secret}")`,
//! injected into the request headers by the sandbox configuration.

use md5::{Digest, Md5};
use subtle::ConstantTimeEq;

/// Header carrying the caller's node name.
pub const HEADER_NODE_NAME: &str = "x-node-name";
/// Header carrying the caller's node token.
pub const HEADER_NODE_SECRET: &str = "x-secret";
/// Query parameter equivalent of [`HEADER_NODE_NAME`].
pub const QUERY_NODE_NAME: &str = "name";
/// Query parameter equivalent of [`HEADER_NODE_SECRET`].
pub const QUERY_NODE_SECRET: &str = "secret";
/// Header carrying the calling worker's UID on worker-to-worker requests.
pub const HEADER_CALLER_UID: &str = "x-edgehost-caller-uid";
/// Header carrying the calling worker's service token.
pub const HEADER_CALLER_TOKEN: &str = "x-edgehost-caller-token";

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Token a node presents to its peers.
pub fn node_token(node_name: &str, cluster_secret: &str) -> String {
    md5_hex(&format!("{}{}", node_name, cluster_secret))
}

/// Token a worker presents when calling another worker's service binding.
pub fn service_token(caller_uid: &str, cluster_secret: &str) -> String {
    md5_hex(&format!("{}:{}", caller_uid, cluster_secret))
}

/// Check a presented node token against the one derived from our secret.
pub fn verify_node_token(node_name: &str, presented: &str, cluster_secret: &str) -> bool {
    if node_name.is_empty() || presented.is_empty() {
        return false;
    }
    let expected = node_token(node_name, cluster_secret);
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}
