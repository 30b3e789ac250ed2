//! Hash helpers for the pre-bundle cache.
//!
//! All hashes are truncated SHA-256 hex digests. `config_hash` identifies
//! the configuration + lockfile; `browser_hash` busts the browser's module
//! cache when the dep set changes; `file_hash` tracks the bundle bytes.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use kiln_common::OptimizerConfig;

use crate::metadata::OptimizedDepInfo;

const HASH_LEN: usize = 8;

/// Truncated hex SHA-256 of arbitrary bytes.
pub fn get_hash(bytes: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(bytes));
    digest.truncate(HASH_LEN);
    digest
}

/// Hash of the configuration + lockfile identity. Invariant across a dev
/// session unless the config reloads.
pub fn config_hash(config: &OptimizerConfig) -> String {
    let payload = config.identity_payload();
    // Value serialization is deterministic (object keys keep insertion order)
    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
    get_hash(&bytes)
}

/// Browser hash over the current dep set. `timestamp` is appended for
/// provisional hashes handed to freshly discovered deps, and empty for
/// committed snapshots.
pub fn optimized_browser_hash(
    hash: &str,
    deps: &IndexMap<String, String>,
    timestamp: &str,
) -> String {
    let serialized = serde_json::to_string(deps).unwrap_or_default();
    get_hash(format!("{hash}{serialized}{timestamp}").as_bytes())
}

/// Provisional browser hash for a freshly discovered dep: covers the
/// snapshot state at the moment of insertion plus the session timestamp.
pub fn discovered_browser_hash(
    hash: &str,
    optimized: &IndexMap<String, String>,
    discovered: &IndexMap<String, String>,
    timestamp: &str,
) -> String {
    let optimized = serde_json::to_string(optimized).unwrap_or_default();
    let discovered = serde_json::to_string(discovered).unwrap_or_default();
    get_hash(format!("{hash}{optimized}{discovered}{timestamp}").as_bytes())
}

/// Flatten dep records into the `id -> file` map the browser hash is
/// computed over. Insertion order is preserved.
pub fn deps_from_info<'a, I>(deps: I) -> IndexMap<String, String>
where
    I: IntoIterator<Item = (&'a String, &'a OptimizedDepInfo)>,
{
    deps.into_iter()
        .map(|(id, info)| (id.clone(), info.file.to_string_lossy().into_owned()))
        .collect()
}
