//! Directory bundler: the reference [`Bundler`] implementation.
//!
//! Writes one flattened output file per dep into a staging directory next
//! to the committed one, plus a serialized metadata snapshot. `commit()`
//! atomically swaps the staging directory into place; until then the
//! served bundles are untouched. A production bundler would inline each
//! dep's module graph; this one flattens the resolved entry module, which
//! is enough to honor the collaborator contract.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use kiln_common::{flatten_id, KilnError, OptimizerConfig};

use crate::boundary::{Bundler, PendingBundle};
use crate::hash::{self, deps_from_info};
use crate::metadata::{DepKind, DepOptimizationMetadata, OptimizedDepInfo};
use crate::paths;

pub struct DirBundler;

#[async_trait]
impl Bundler for DirBundler {
    async fn bundle(
        &self,
        config: &OptimizerConfig,
        deps: IndexMap<String, OptimizedDepInfo>,
        ssr: bool,
    ) -> anyhow::Result<Box<dyn PendingBundle>> {
        let staging_dir = paths::staging_deps_dir(config, ssr);
        let final_dir = paths::deps_cache_dir(config, ssr);

        // A previous cancelled run may have left a stale staging dir behind.
        if tokio::fs::metadata(&staging_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&staging_dir).await?;
        }
        tokio::fs::create_dir_all(&staging_dir).await?;

        let config_hash = hash::config_hash(config);
        let mut metadata = DepOptimizationMetadata::new(config_hash.clone(), String::new());

        for (id, info) in &deps {
            let src = info
                .src
                .as_ref()
                .ok_or_else(|| KilnError::Bundler(format!("dep {id} has no resolved source")))?;
            let exports = info.exports.get_or_extract(src).await?;

            let source = tokio::fs::read_to_string(src)
                .await
                .with_context(|| format!("reading {}", src.display()))?;
            let needs_interop = !exports.has_module_syntax;
            let output = if needs_interop {
                // Minimal CJS flattening: evaluate into a module object and
                // re-export it as the default binding.
                format!(
                    "const module = {{ exports: {{}} }};\nconst exports = module.exports;\n{source}\nexport default module.exports;\n"
                )
            } else {
                source
            };

            let out_file = staging_dir.join(format!("{}.js", flatten_id(id)));
            tokio::fs::write(&out_file, output.as_bytes()).await?;
            debug!(dep = %id, file = %out_file.display(), "Staged bundle");

            metadata.add(
                DepKind::Optimized,
                OptimizedDepInfo {
                    id: id.clone(),
                    src: Some(src.clone()),
                    file: paths::deterministic_dep_path(config, id, ssr),
                    browser_hash: String::new(),
                    file_hash: Some(hash::get_hash(output.as_bytes())),
                    needs_interop: Some(needs_interop),
                    exports: info.exports.clone(),
                    processing: None,
                },
            )?;
        }

        // Committed browser hash covers the full produced set.
        let browser_hash =
            hash::optimized_browser_hash(&config_hash, &deps_from_info(&metadata.optimized), "");
        metadata.browser_hash = browser_hash.clone();
        for info in metadata.optimized.values_mut() {
            info.browser_hash = browser_hash.clone();
        }

        let serialized = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(paths::metadata_file_path(&staging_dir), serialized).await?;

        Ok(Box::new(DirPendingBundle {
            staging_dir,
            final_dir,
            metadata,
            state: Mutex::new(BundleState::Staged),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleState {
    Staged,
    Committed,
    Cancelled,
}

struct DirPendingBundle {
    staging_dir: PathBuf,
    final_dir: PathBuf,
    metadata: DepOptimizationMetadata,
    state: Mutex<BundleState>,
}

impl DirPendingBundle {
    fn transition(&self, to: BundleState) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (*state, to) {
            (current, target) if current == target => Ok(false), // idempotent
            (BundleState::Staged, target) => {
                *state = target;
                Ok(true)
            }
            (current, target) => Err(KilnError::Bundler(format!(
                "bundle already {current:?}, cannot {target:?}"
            ))
            .into()),
        }
    }
}

#[async_trait]
impl PendingBundle for DirPendingBundle {
    fn metadata(&self) -> &DepOptimizationMetadata {
        &self.metadata
    }

    async fn commit(&self) -> anyhow::Result<()> {
        if !self.transition(BundleState::Committed)? {
            return Ok(());
        }
        if tokio::fs::metadata(&self.final_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&self.final_dir).await?;
        }
        if let Some(parent) = self.final_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.staging_dir, &self.final_dir)
            .await
            .context("swapping staged bundle dir into place")?;
        debug!(dir = %self.final_dir.display(), "Committed bundle dir");
        Ok(())
    }

    async fn cancel(&self) -> anyhow::Result<()> {
        if !self.transition(BundleState::Cancelled)? {
            return Ok(());
        }
        if tokio::fs::metadata(&self.staging_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&self.staging_dir).await?;
        }
        debug!(dir = %self.staging_dir.display(), "Discarded staged bundle dir");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exports::ExportsSlot;

    async fn make_project() -> (tempfile::TempDir, OptimizerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = OptimizerConfig::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join("node_modules"))
            .await
            .unwrap();
        (dir, config)
    }

    async fn make_dep(
        config: &OptimizerConfig,
        id: &str,
        source: &str,
    ) -> (String, OptimizedDepInfo) {
        let src = config
            .root
            .join("node_modules")
            .join(format!("{}.js", flatten_id(id)));
        tokio::fs::write(&src, source).await.unwrap();
        (
            id.to_string(),
            OptimizedDepInfo {
                id: id.to_string(),
                src: Some(src),
                file: paths::deterministic_dep_path(config, id, false),
                browser_hash: "00000000".into(),
                file_hash: None,
                needs_interop: None,
                exports: ExportsSlot::default(),
                processing: None,
            },
        )
    }

    #[tokio::test]
    async fn commit_swaps_staging_into_place() {
        let (_dir, config) = make_project().await;
        let deps: IndexMap<_, _> = [
            make_dep(&config, "esm-dep", "export const a = 1;\n").await,
            make_dep(&config, "cjs-dep", "module.exports = 42;\n").await,
        ]
        .into_iter()
        .collect();

        let pending = DirBundler.bundle(&config, deps, false).await.unwrap();
        let meta = pending.metadata().clone();
        assert_eq!(meta.optimized["esm-dep"].needs_interop, Some(false));
        assert_eq!(meta.optimized["cjs-dep"].needs_interop, Some(true));
        assert!(meta.optimized.values().all(|i| i.file_hash.is_some()));

        // Staged but not committed: nothing servable yet.
        let deps_dir = paths::deps_cache_dir(&config, false);
        assert!(tokio::fs::metadata(&deps_dir).await.is_err());

        pending.commit().await.unwrap();
        assert!(tokio::fs::metadata(deps_dir.join("esm-dep.js")).await.is_ok());
        assert!(tokio::fs::metadata(deps_dir.join("cjs-dep.js")).await.is_ok());
        assert!(
            tokio::fs::metadata(paths::metadata_file_path(&deps_dir))
                .await
                .is_ok()
        );
        assert!(
            tokio::fs::metadata(paths::staging_deps_dir(&config, false))
                .await
                .is_err()
        );

        // Idempotent
        pending.commit().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_discards_staging_and_keeps_previous_bundles() {
        let (_dir, config) = make_project().await;
        let first: IndexMap<_, _> = [make_dep(&config, "lodash", "export const pick = 1;\n").await]
            .into_iter()
            .collect();
        let pending = DirBundler.bundle(&config, first.clone(), false).await.unwrap();
        pending.commit().await.unwrap();

        let second: IndexMap<_, _> = [
            make_dep(&config, "lodash", "export const pick = 1;\n").await,
            make_dep(&config, "vue", "export function ref() {}\n").await,
        ]
        .into_iter()
        .collect();
        let pending = DirBundler.bundle(&config, second, false).await.unwrap();
        pending.cancel().await.unwrap();
        pending.cancel().await.unwrap(); // idempotent

        let deps_dir = paths::deps_cache_dir(&config, false);
        assert!(tokio::fs::metadata(deps_dir.join("lodash.js")).await.is_ok());
        assert!(tokio::fs::metadata(deps_dir.join("vue.js")).await.is_err());
        assert!(
            tokio::fs::metadata(paths::staging_deps_dir(&config, false))
                .await
                .is_err()
        );

        assert!(pending.commit().await.is_err(), "commit after cancel");
    }

    #[tokio::test]
    async fn identical_inputs_produce_identical_hashes() {
        let (_dir, config) = make_project().await;
        let deps: IndexMap<_, _> = [make_dep(&config, "lodash", "export const pick = 1;\n").await]
            .into_iter()
            .collect();

        let a = DirBundler.bundle(&config, deps.clone(), false).await.unwrap();
        let a_meta = a.metadata().clone();
        a.cancel().await.unwrap();

        let b = DirBundler.bundle(&config, deps, false).await.unwrap();
        let b_meta = b.metadata().clone();
        b.cancel().await.unwrap();

        assert_eq!(
            a_meta.optimized["lodash"].file_hash,
            b_meta.optimized["lodash"].file_hash
        );
        assert_eq!(a_meta.browser_hash, b_meta.browser_hash);
    }
}
