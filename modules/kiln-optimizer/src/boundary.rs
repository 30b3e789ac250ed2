//! Seams to the optimizer's collaborators: the bundler, the static
//! scanner, and the dev server's reload channel.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;

use kiln_common::OptimizerConfig;

use crate::metadata::{DepOptimizationMetadata, OptimizedDepInfo};

/// Produces bundles from a dep set.
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Bundle `deps` into a staging area and return the resulting metadata
    /// plus a commit/cancel handle. Nothing visible to the server changes
    /// until [`PendingBundle::commit`] runs.
    async fn bundle(
        &self,
        config: &OptimizerConfig,
        deps: IndexMap<String, OptimizedDepInfo>,
        ssr: bool,
    ) -> anyhow::Result<Box<dyn PendingBundle>>;
}

/// A staged bundle awaiting commit or discard. `commit` and `cancel` are
/// mutually exclusive and idempotent.
#[async_trait]
pub trait PendingBundle: Send + Sync {
    fn metadata(&self) -> &DepOptimizationMetadata;

    /// Make the staged bundle directory the canonical one.
    async fn commit(&self) -> anyhow::Result<()>;

    /// Discard the staged bundle.
    async fn cancel(&self) -> anyhow::Result<()>;
}

/// Walks user source at startup and proposes an initial candidate dep set.
#[async_trait]
pub trait DepScanner: Send + Sync {
    async fn discover(
        &self,
        config: &OptimizerConfig,
        session_timestamp: &str,
    ) -> anyhow::Result<IndexMap<String, OptimizedDepInfo>>;
}

/// Message broadcast to connected browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub path: String,
}

impl ReloadMessage {
    /// Instructs every connected browser to discard all module state.
    pub fn full_reload() -> Self {
        Self {
            kind: "full-reload",
            path: "*".to_string(),
        }
    }
}

/// The dev server surface the optimizer talks back to.
#[async_trait]
pub trait ServerLink: Send + Sync {
    /// Invalidate the server's module graph so stale transforms are
    /// recomputed against the new bundle set.
    async fn invalidate_module_graph(&self);

    async fn broadcast(&self, message: ReloadMessage) -> anyhow::Result<()>;
}

/// No-op server link for tests and one-shot builds.
pub struct NoopServerLink;

#[async_trait]
impl ServerLink for NoopServerLink {
    async fn invalidate_module_graph(&self) {}

    async fn broadcast(&self, _message: ReloadMessage) -> anyhow::Result<()> {
        Ok(())
    }
}
