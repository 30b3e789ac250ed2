//! Process-wide registry of optimizers, keyed by configuration identity,
//! so worker compilation shares the main optimizer instead of spawning a
//! second control loop over the same cache directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use kiln_common::OptimizerConfig;

use crate::boundary::{Bundler, DepScanner, ServerLink};
use crate::hash;
use crate::optimizer::DepsOptimizer;

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<DepsOptimizer>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<DepsOptimizer>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock() -> std::sync::MutexGuard<'static, HashMap<String, Arc<DepsOptimizer>>> {
    registry().lock().unwrap_or_else(|e| e.into_inner())
}

/// The optimizer registered for this configuration, if any.
pub fn get_optimizer(config: &OptimizerConfig) -> Option<Arc<DepsOptimizer>> {
    lock().get(&hash::config_hash(config)).cloned()
}

/// Get or lazily initialize the optimizer for this configuration.
pub async fn init_optimizer(
    config: OptimizerConfig,
    bundler: Arc<dyn Bundler>,
    scanner: Option<Arc<dyn DepScanner>>,
    server: Arc<dyn ServerLink>,
) -> anyhow::Result<Arc<DepsOptimizer>> {
    let key = hash::config_hash(&config);
    if let Some(existing) = lock().get(&key).cloned() {
        return Ok(existing);
    }

    let optimizer = DepsOptimizer::init(config, bundler, scanner, server).await?;

    // Two servers racing the same config: first registration wins, the
    // loser is torn down before anyone could observe it.
    let mut map = lock();
    if let Some(existing) = map.get(&key).cloned() {
        drop(map);
        optimizer.close();
        return Ok(existing);
    }
    map.insert(key.clone(), Arc::clone(&optimizer));
    debug!(config = %key, "Registered dependency optimizer");
    Ok(optimizer)
}

/// Tear down and unregister the optimizer when the dev server closes.
pub fn close_optimizer(config: &OptimizerConfig) {
    let key = hash::config_hash(config);
    if let Some(optimizer) = lock().remove(&key) {
        optimizer.close();
        debug!(config = %key, "Closed dependency optimizer");
    }
}
