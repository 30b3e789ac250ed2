//! In-memory snapshot of the pre-bundled dependency set.
//!
//! A [`DepOptimizationMetadata`] value is immutable once published: the
//! [`MetadataStore`] hands out `Arc` snapshots and replaces the whole value
//! atomically on commit, so readers never observe a partially mutated set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use kiln_common::KilnError;

use crate::barrier::ProcessingHandle;
use crate::exports::ExportsSlot;

/// Which sub-map an entry currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Optimized,
    Chunk,
    Discovered,
}

impl DepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DepKind::Optimized => "optimized",
            DepKind::Chunk => "chunks",
            DepKind::Discovered => "discovered",
        }
    }
}

/// One record per dependency (or per bundler-emitted chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedDepInfo {
    /// Bare import specifier (`lodash`, `@scope/pkg/util`).
    pub id: String,
    /// Resolved absolute source path. Absent for internal chunks.
    pub src: Option<PathBuf>,
    /// Deterministic output path inside the cache directory.
    pub file: PathBuf,
    /// Cache-busting hash the browser appends as `?v=`.
    pub browser_hash: String,
    /// Content hash of the produced bundle file. Absent until bundled.
    pub file_hash: Option<String>,
    /// Whether an ESM↔CJS interop wrapper is needed. `None` until known.
    pub needs_interop: Option<bool>,
    /// Export summary, extracted on first access. Opaque to the optimizer.
    #[serde(skip)]
    pub exports: ExportsSlot,
    /// Resolves once the rerun that includes this entry commits. Unset on
    /// committed entries.
    #[serde(skip)]
    pub processing: Option<ProcessingHandle>,
}

/// The committed snapshot: known deps, bundler chunks, and deps discovered
/// since the last commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepOptimizationMetadata {
    /// Hash of the configuration + lockfile identity.
    pub hash: String,
    /// Hash the browser uses as a cache-busting query parameter; changes
    /// whenever the dep set changes unless explicitly held stable.
    pub browser_hash: String,
    pub optimized: IndexMap<String, OptimizedDepInfo>,
    pub chunks: IndexMap<String, OptimizedDepInfo>,
    /// Never persisted: discovery state is rebuilt every session.
    #[serde(skip)]
    pub discovered: IndexMap<String, OptimizedDepInfo>,
}

impl DepOptimizationMetadata {
    pub fn new(hash: String, browser_hash: String) -> Self {
        Self {
            hash,
            browser_hash,
            optimized: IndexMap::new(),
            chunks: IndexMap::new(),
            discovered: IndexMap::new(),
        }
    }

    fn map(&self, kind: DepKind) -> &IndexMap<String, OptimizedDepInfo> {
        match kind {
            DepKind::Optimized => &self.optimized,
            DepKind::Chunk => &self.chunks,
            DepKind::Discovered => &self.discovered,
        }
    }

    fn map_mut(&mut self, kind: DepKind) -> &mut IndexMap<String, OptimizedDepInfo> {
        match kind {
            DepKind::Optimized => &mut self.optimized,
            DepKind::Chunk => &mut self.chunks,
            DepKind::Discovered => &mut self.discovered,
        }
    }

    /// Insert `info` into the `kind` sub-map. Rejects ids that already live
    /// in a different sub-map; the three maps stay pairwise disjoint.
    pub fn add(&mut self, kind: DepKind, info: OptimizedDepInfo) -> Result<(), KilnError> {
        for other in [DepKind::Optimized, DepKind::Chunk, DepKind::Discovered] {
            if other != kind && self.map(other).contains_key(&info.id) {
                return Err(KilnError::DuplicateDep {
                    id: info.id,
                    kind: other.as_str(),
                });
            }
        }
        self.map_mut(kind).insert(info.id.clone(), info);
        Ok(())
    }

    /// Look up an entry in any sub-map, `optimized` and `chunks` first.
    pub fn dep_info(&self, id: &str) -> Option<&OptimizedDepInfo> {
        self.optimized
            .get(id)
            .or_else(|| self.chunks.get(id))
            .or_else(|| self.discovered.get(id))
    }

    /// Reverse lookup by output file path (without the `?v=` query).
    pub fn dep_info_from_file(&self, file: &Path) -> Option<&OptimizedDepInfo> {
        self.optimized
            .values()
            .chain(self.chunks.values())
            .chain(self.discovered.values())
            .find(|info| info.file == file)
    }
}

/// Holds the current committed snapshot. Reads are lock-free and always
/// observe a consistent snapshot; `replace` swaps the pointer atomically.
/// Writers are serialized by the optimizer's control-loop lock.
pub struct MetadataStore {
    inner: ArcSwap<DepOptimizationMetadata>,
}

impl MetadataStore {
    pub fn new(initial: DepOptimizationMetadata) -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(initial)),
        }
    }

    /// Owned snapshot; stays consistent even if a commit swaps in new data.
    pub fn load_full(&self) -> Arc<DepOptimizationMetadata> {
        self.inner.load_full()
    }

    /// Atomically publish a new snapshot.
    pub fn replace(&self, new_snapshot: DepOptimizationMetadata) {
        self.inner.store(Arc::new(new_snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(id: &str) -> OptimizedDepInfo {
        OptimizedDepInfo {
            id: id.to_string(),
            src: Some(PathBuf::from(format!("/app/node_modules/{id}/index.js"))),
            file: PathBuf::from(format!("/app/.kiln/deps/{id}.js")),
            browser_hash: "aaaa0000".to_string(),
            file_hash: None,
            needs_interop: None,
            exports: ExportsSlot::default(),
            processing: None,
        }
    }

    #[test]
    fn sub_maps_stay_disjoint() {
        let mut meta = DepOptimizationMetadata::new("cfg00000".into(), "bro00000".into());
        meta.add(DepKind::Optimized, make_info("lodash")).unwrap();

        let err = meta
            .add(DepKind::Discovered, make_info("lodash"))
            .unwrap_err();
        assert!(err.to_string().contains("lodash"));
        assert!(meta.discovered.is_empty());
    }

    #[test]
    fn re_adding_same_kind_overwrites() {
        let mut meta = DepOptimizationMetadata::new("cfg00000".into(), "bro00000".into());
        meta.add(DepKind::Discovered, make_info("vue")).unwrap();
        let mut updated = make_info("vue");
        updated.browser_hash = "bbbb1111".into();
        meta.add(DepKind::Discovered, updated).unwrap();

        assert_eq!(meta.discovered.len(), 1);
        assert_eq!(meta.discovered["vue"].browser_hash, "bbbb1111");
    }

    #[test]
    fn lookup_prefers_optimized_then_chunks() {
        let mut meta = DepOptimizationMetadata::new("cfg00000".into(), "bro00000".into());
        meta.add(DepKind::Optimized, make_info("react")).unwrap();
        meta.add(DepKind::Chunk, make_info("chunk-ABCD")).unwrap();
        meta.add(DepKind::Discovered, make_info("vue")).unwrap();

        assert_eq!(meta.dep_info("react").unwrap().id, "react");
        assert_eq!(meta.dep_info("chunk-ABCD").unwrap().id, "chunk-ABCD");
        assert_eq!(meta.dep_info("vue").unwrap().id, "vue");
        assert!(meta.dep_info("missing").is_none());
    }

    #[test]
    fn file_lookup_spans_all_maps() {
        let mut meta = DepOptimizationMetadata::new("cfg00000".into(), "bro00000".into());
        meta.add(DepKind::Discovered, make_info("vue")).unwrap();
        let file = PathBuf::from("/app/.kiln/deps/vue.js");
        assert_eq!(meta.dep_info_from_file(&file).unwrap().id, "vue");
    }

    #[test]
    fn snapshot_serde_round_trip_drops_discovered() {
        let mut meta = DepOptimizationMetadata::new("cfg00000".into(), "bro00000".into());
        let mut done = make_info("lodash");
        done.file_hash = Some("feed0123".into());
        done.needs_interop = Some(false);
        meta.add(DepKind::Optimized, done).unwrap();
        meta.add(DepKind::Discovered, make_info("vue")).unwrap();

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: DepOptimizationMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.hash, "cfg00000");
        assert_eq!(parsed.optimized["lodash"].file_hash.as_deref(), Some("feed0123"));
        assert!(parsed.discovered.is_empty(), "discovered is never persisted");
    }

    #[test]
    fn store_readers_see_consistent_snapshots() {
        let store = MetadataStore::new(DepOptimizationMetadata::new(
            "cfg00000".into(),
            "bro00000".into(),
        ));
        let before = store.load_full();

        let mut next = DepOptimizationMetadata::new("cfg00000".into(), "bro11111".into());
        next.add(DepKind::Optimized, make_info("lodash")).unwrap();
        store.replace(next);

        // The old snapshot is unchanged; new readers see the new one.
        assert!(before.optimized.is_empty());
        assert_eq!(store.load_full().optimized.len(), 1);
    }
}
