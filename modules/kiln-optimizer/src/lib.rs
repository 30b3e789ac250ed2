//! Dependency pre-bundling for the kiln dev server.
//!
//! The optimizer keeps a cache-coherent set of pre-bundled third-party
//! dependencies over the lifetime of a dev session: it registers missing
//! imports as the server discovers them, coalesces discovery bursts into a
//! single re-bundling cycle, and decides after each cycle whether the
//! browser can keep its module cache or must fully reload.

pub mod barrier;
pub mod boundary;
pub mod bundler;
pub mod cache;
pub mod exports;
pub mod hash;
pub mod idle;
pub mod metadata;
pub mod optimizer;
pub mod paths;
pub mod registry;

pub use barrier::{ProcessingBarrier, ProcessingHandle};
pub use boundary::{Bundler, DepScanner, NoopServerLink, PendingBundle, ReloadMessage, ServerLink};
pub use bundler::DirBundler;
pub use idle::DoneSignal;
pub use metadata::{DepKind, DepOptimizationMetadata, MetadataStore, OptimizedDepInfo};
pub use optimizer::DepsOptimizer;
pub use registry::{close_optimizer, get_optimizer, init_optimizer};
