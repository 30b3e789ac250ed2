//! Startup path for the metadata snapshot: reuse the on-disk cache when
//! its hash still matches the current config, otherwise start fresh.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use kiln_common::{KilnError, OptimizerConfig};

use crate::hash;
use crate::metadata::DepOptimizationMetadata;
use crate::paths;

/// Load the cached snapshot for this config, if one exists and its `hash`
/// matches the current configuration + lockfile identity. Any failure
/// degrades to a cold start; a dev session never dies over a bad cache.
pub async fn load_cached_metadata(
    config: &OptimizerConfig,
    ssr: bool,
) -> Option<DepOptimizationMetadata> {
    let file = paths::metadata_file_path(&paths::deps_cache_dir(config, ssr));
    match try_load_cached_metadata(config, &file).await {
        Ok(cached) => {
            info!(deps = cached.optimized.len(), "Reusing cached pre-bundled dependencies");
            Some(cached)
        }
        Err(KilnError::Io(err)) if err.kind() == ErrorKind::NotFound => None,
        Err(err @ KilnError::Cache(_)) => {
            info!(error = %err, "Pre-bundle cache is stale, re-bundling");
            None
        }
        Err(err) => {
            debug!(file = %file.display(), error = %err, "Ignoring unreadable metadata cache");
            None
        }
    }
}

async fn try_load_cached_metadata(
    config: &OptimizerConfig,
    file: &Path,
) -> Result<DepOptimizationMetadata, KilnError> {
    let raw = tokio::fs::read(file).await?;
    let cached: DepOptimizationMetadata = serde_json::from_slice(&raw)?;
    if cached.hash != hash::config_hash(config) {
        return Err(KilnError::Cache(
            "config or lockfile changed since the last session".to_string(),
        ));
    }
    Ok(cached)
}

/// Fresh snapshot for a new session. The provisional browser hash mixes in
/// the session timestamp so it never collides with a committed one.
pub fn init_fresh_metadata(
    config: &OptimizerConfig,
    session_timestamp: &str,
) -> DepOptimizationMetadata {
    let config_hash = hash::config_hash(config);
    let browser_hash = hash::optimized_browser_hash(
        &config_hash,
        &indexmap::IndexMap::new(),
        session_timestamp,
    );
    DepOptimizationMetadata::new(config_hash, browser_hash)
}

/// Resolve a manually-included bare specifier against the project's
/// `node_modules`. Returns `None` when nothing plausible exists on disk.
pub fn resolve_bare_import(config: &OptimizerConfig, id: &str) -> Option<PathBuf> {
    let base = config.root.join("node_modules");
    let candidates = [
        base.join(format!("{id}.js")),
        base.join(id).join("index.js"),
        base.join(id).join("index.mjs"),
    ];
    candidates.into_iter().find(|c| c.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DepKind, OptimizedDepInfo};

    async fn write_snapshot(config: &OptimizerConfig, meta: &DepOptimizationMetadata) {
        let dir = paths::deps_cache_dir(config, false);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let raw = serde_json::to_vec(meta).unwrap();
        tokio::fs::write(paths::metadata_file_path(&dir), raw)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_hit_requires_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OptimizerConfig::new(dir.path());

        let mut meta = init_fresh_metadata(&config, "1700000000000");
        meta.add(
            DepKind::Optimized,
            OptimizedDepInfo {
                id: "lodash".into(),
                src: None,
                file: paths::deterministic_dep_path(&config, "lodash", false),
                browser_hash: meta.browser_hash.clone(),
                file_hash: Some("feed0123".into()),
                needs_interop: Some(false),
                exports: Default::default(),
                processing: None,
            },
        )
        .unwrap();
        write_snapshot(&config, &meta).await;

        let loaded = load_cached_metadata(&config, false).await.unwrap();
        assert_eq!(loaded.optimized.len(), 1);

        // A lockfile change invalidates the cache.
        config.lockfile_contents = "lodash@5.0.0".into();
        assert!(load_cached_metadata(&config, false).await.is_none());
    }

    #[tokio::test]
    async fn missing_or_garbled_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = OptimizerConfig::new(dir.path());
        assert!(load_cached_metadata(&config, false).await.is_none());

        let deps_dir = paths::deps_cache_dir(&config, false);
        tokio::fs::create_dir_all(&deps_dir).await.unwrap();
        tokio::fs::write(paths::metadata_file_path(&deps_dir), b"not json")
            .await
            .unwrap();
        assert!(load_cached_metadata(&config, false).await.is_none());
    }

    #[test]
    fn bare_import_resolution_prefers_flat_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = OptimizerConfig::new(dir.path());
        let nm = config.root.join("node_modules");
        std::fs::create_dir_all(nm.join("vue")).unwrap();
        std::fs::write(nm.join("lodash.js"), "module.exports = {};").unwrap();
        std::fs::write(nm.join("vue").join("index.js"), "export {};").unwrap();

        assert_eq!(
            resolve_bare_import(&config, "lodash").unwrap(),
            nm.join("lodash.js")
        );
        assert_eq!(
            resolve_bare_import(&config, "vue").unwrap(),
            nm.join("vue").join("index.js")
        );
        assert!(resolve_bare_import(&config, "missing").is_none());
    }
}
