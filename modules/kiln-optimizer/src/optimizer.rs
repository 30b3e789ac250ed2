//! The optimizer control loop.
//!
//! One [`DepsOptimizer`] per config maintains the committed snapshot,
//! registers missing imports as they are discovered, coalesces discovery
//! bursts behind a debounce window, and runs at most one re-bundling cycle
//! at a time. A finished cycle either commits (swapping the snapshot) or is
//! discarded, in which case the already-scheduled follow-up cycle subsumes
//! it. The whole loop is cooperative: state mutations happen in short
//! critical sections, and the only suspension points are the bundler, the
//! scanner, timers, and awaited idle tokens.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kiln_common::{KilnError, OptimizerConfig};

use crate::barrier::{ProcessingBarrier, ProcessingHandle};
use crate::boundary::{Bundler, DepScanner, PendingBundle, ReloadMessage, ServerLink};
use crate::cache;
use crate::exports::ExportsSlot;
use crate::hash;
use crate::idle::IdleState;
use crate::metadata::{DepKind, DepOptimizationMetadata, MetadataStore, OptimizedDepInfo};
use crate::paths;

pub struct DepsOptimizer {
    config: OptimizerConfig,
    bundler: Arc<dyn Bundler>,
    server: Arc<dyn ServerLink>,
    store: MetadataStore,
    ssr_store: MetadataStore,
    session_timestamp: String,
    state: Mutex<ControlState>,
    pub(crate) idle: Mutex<IdleState>,
}

struct ControlState {
    /// At-most-one-rerun flag: set before the executor's first suspension
    /// point, cleared only after it returns.
    currently_processing: bool,
    /// A rerun request arrived while one was executing.
    rerun_enqueued: bool,
    first_run_called: bool,
    /// Deps were added to `discovered` since the current cycle snapshotted.
    new_deps_discovered: bool,
    /// Set while the startup scanner is walking user source.
    scan_processing: Option<ProcessingHandle>,
    /// Barrier for the cycle currently accumulating discoveries.
    barrier: ProcessingBarrier,
    /// Barriers of cycles that have gone to the bundler; drained only after
    /// the snapshot swap (or on the error path, so waiters never wedge).
    resolve_queue: Vec<ProcessingBarrier>,
    debounce_timer: Option<JoinHandle<()>>,
    log_timer: Option<JoinHandle<()>>,
    deps_to_log: Vec<String>,
    closed: bool,
}

impl DepsOptimizer {
    /// Set up the optimizer for a dev session: reuse the on-disk cache when
    /// its hash matches, otherwise seed `discovered` from the manual
    /// include list and (when a scanner is given) from a background scan.
    pub async fn init(
        config: OptimizerConfig,
        bundler: Arc<dyn Bundler>,
        scanner: Option<Arc<dyn DepScanner>>,
        server: Arc<dyn ServerLink>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let session_timestamp = Utc::now().timestamp_millis().to_string();

        let cached = cache::load_cached_metadata(&config, false).await;
        let cache_hit = cached.is_some();
        let metadata =
            cached.unwrap_or_else(|| cache::init_fresh_metadata(&config, &session_timestamp));

        let ssr_metadata = cache::init_fresh_metadata(&config, &session_timestamp);

        let optimizer = Arc::new(Self {
            store: MetadataStore::new(metadata),
            ssr_store: MetadataStore::new(ssr_metadata),
            session_timestamp,
            state: Mutex::new(ControlState {
                currently_processing: false,
                rerun_enqueued: false,
                // A warm cache serves as the first run: nothing to bundle
                // until a missing import shows up.
                first_run_called: cache_hit,
                new_deps_discovered: false,
                scan_processing: None,
                barrier: ProcessingBarrier::new(),
                resolve_queue: Vec::new(),
                debounce_timer: None,
                log_timer: None,
                deps_to_log: Vec::new(),
                closed: false,
            }),
            idle: Mutex::new(IdleState::default()),
            config,
            bundler,
            server,
        });

        if !cache_hit {
            optimizer.seed_manual_includes();
            if let Some(scanner) = scanner {
                optimizer.spawn_scan(scanner);
            }
        }

        if optimizer.config.ssr {
            if let Err(err) = optimizer.init_ssr().await {
                error!(error = %format!("{err:#}"), "SSR pre-bundling failed");
            }
        }

        Ok(optimizer)
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// The committed snapshot; the SSR slot when `ssr` is set outside a
    /// one-shot build.
    pub fn metadata(&self, ssr: bool) -> Arc<DepOptimizationMetadata> {
        if ssr && !self.config.is_build() {
            self.ssr_store.load_full()
        } else {
            self.store.load_full()
        }
    }

    pub fn is_optimized_dep_file(&self, path: &Path) -> bool {
        paths::is_optimized_dep_file(&self.config, path)
    }

    pub fn is_optimized_dep_url(&self, url: &str) -> bool {
        paths::is_optimized_dep_url(&self.config, url)
    }

    pub fn get_optimized_dep_id(&self, info: &OptimizedDepInfo) -> String {
        paths::get_optimized_dep_id(&self.config, info)
    }

    /// Force a scheduler tick with no debounce window.
    pub fn run(self: &Arc<Self>) {
        {
            let mut st = self.state();
            if st.closed {
                return;
            }
            st.first_run_called = true;
        }
        self.debounced_processing(0);
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(crate) fn first_run_called(&self) -> bool {
        self.state().first_run_called
    }

    /// Tear down: cancel timers and wake every waiter so nothing wedges.
    pub fn close(&self) {
        let mut st = self.state();
        st.closed = true;
        if let Some(t) = st.debounce_timer.take() {
            t.abort();
        }
        if let Some(t) = st.log_timer.take() {
            t.abort();
        }
        for barrier in st.resolve_queue.drain(..) {
            barrier.resolve();
        }
        st.barrier.resolve();
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Discovery registry ---

    /// Register a bare import the server could not resolve. Idempotent per
    /// id: known entries are returned unchanged; new ids land in
    /// `discovered` with a provisional browser hash and a completion signal
    /// that resolves once the rerun including them commits.
    ///
    /// Excluded dependencies are rejected (`Config`) so the server serves
    /// them unbundled, and a closed optimizer rejects everything
    /// (`Closed`).
    pub fn register_missing_import(
        self: &Arc<Self>,
        id: &str,
        resolved: &Path,
        ssr: bool,
    ) -> Result<OptimizedDepInfo, KilnError> {
        if self.config.excludes(id) {
            return Err(KilnError::Config(format!(
                "cannot pre-bundle excluded dependency {id}"
            )));
        }
        if ssr {
            return Ok(self.ssr_missing_import(id, resolved));
        }

        let mut st = self.state();
        if st.closed {
            return Err(KilnError::Closed);
        }
        if st.scan_processing.is_some() {
            error!(dep = %id, "Internal error: dependency registered while scan is in progress");
        }

        let snapshot = self.store.load_full();
        if let Some(info) = snapshot.optimized.get(id).or_else(|| snapshot.chunks.get(id)) {
            return Ok(info.clone());
        }
        if let Some(info) = snapshot.discovered.get(id) {
            return Ok(info.clone());
        }

        let missing = self.add_missing_dep(&mut st, &snapshot, id, resolved.to_path_buf());

        // Until the first run has been triggered (or the scanner owns the
        // trigger), discoveries accumulate without arming the scheduler.
        let arm = st.first_run_called || st.scan_processing.is_some();
        drop(st);
        if arm {
            self.debounced_processing(self.config.debounce_ms);
        }
        Ok(missing)
    }

    /// Insert a new discovered entry. Caller holds the control-loop lock.
    fn add_missing_dep(
        &self,
        st: &mut ControlState,
        snapshot: &DepOptimizationMetadata,
        id: &str,
        resolved: PathBuf,
    ) -> OptimizedDepInfo {
        let browser_hash = hash::discovered_browser_hash(
            &snapshot.hash,
            &hash::deps_from_info(&snapshot.optimized),
            &hash::deps_from_info(&snapshot.discovered),
            &self.session_timestamp,
        );
        let missing = OptimizedDepInfo {
            id: id.to_string(),
            src: Some(resolved),
            file: paths::deterministic_dep_path(&self.config, id, false),
            browser_hash,
            file_hash: None,
            needs_interop: None,
            exports: ExportsSlot::default(),
            processing: Some(st.barrier.handle()),
        };

        let mut next = snapshot.clone();
        if let Err(err) = next.add(DepKind::Discovered, missing.clone()) {
            // Unreachable while the lock is held; keep the old snapshot.
            error!(error = %err, "Discovered dep collided with an existing entry");
            return missing;
        }
        self.store.replace(next);
        st.new_deps_discovered = true;
        debug!(dep = %id, "Discovered new dependency");
        missing
    }

    fn ssr_missing_import(&self, id: &str, resolved: &Path) -> OptimizedDepInfo {
        let snapshot = self.ssr_store.load_full();
        if let Some(info) = snapshot.dep_info(id) {
            return info.clone();
        }
        error!(
            dep = %id,
            "Missing dependency found after SSR pre-bundling; add it to the include list"
        );
        OptimizedDepInfo {
            id: id.to_string(),
            src: Some(resolved.to_path_buf()),
            file: paths::deterministic_dep_path(&self.config, id, true),
            browser_hash: snapshot.browser_hash.clone(),
            file_hash: None,
            needs_interop: None,
            exports: ExportsSlot::default(),
            processing: None,
        }
    }

    fn seed_manual_includes(self: &Arc<Self>) {
        for id in self.config.include.clone() {
            match cache::resolve_bare_import(&self.config, &id) {
                Some(src) => {
                    let mut st = self.state();
                    let snapshot = self.store.load_full();
                    if snapshot.dep_info(&id).is_none() {
                        self.add_missing_dep(&mut st, &snapshot, &id, src);
                    }
                }
                None => {
                    warn!(dep = %id, "Cannot resolve manually included dependency, skipping");
                }
            }
        }
    }

    // --- Startup scanner ---

    fn spawn_scan(self: &Arc<Self>, scanner: Arc<dyn DepScanner>) {
        let scan_barrier = ProcessingBarrier::new();
        self.state().scan_processing = Some(scan_barrier.handle());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = scanner
                .discover(&this.config, &this.session_timestamp)
                .await;
            match result {
                Ok(deps) => {
                    let count = deps.len();
                    {
                        let mut st = this.state();
                        for (id, info) in deps {
                            if this.config.excludes(&id) {
                                debug!(dep = %id, "Scanner proposed an excluded dependency, skipping");
                                continue;
                            }
                            let snapshot = this.store.load_full();
                            if snapshot.dep_info(&id).is_none() {
                                let src = info
                                    .src
                                    .unwrap_or_else(|| this.config.root.join(&id));
                                this.add_missing_dep(&mut st, &snapshot, &id, src);
                            }
                        }
                        st.scan_processing = None;
                    }
                    scan_barrier.resolve();
                    info!(deps = count, "Dependency scan complete");
                    this.run();
                }
                Err(err) => {
                    // Unblock scan waiters and skip the first automatic
                    // rerun; the next missing import re-arms the scheduler.
                    warn!(error = %format!("{err:#}"), "Dependency scan failed");
                    this.state().scan_processing = None;
                    scan_barrier.resolve();
                }
            }
        });
    }

    // --- Debounced scheduler ---

    /// Serialize rerun requests: each call restarts the window, and a burst
    /// of discoveries collapses into a single cycle. A request landing
    /// while a cycle executes parks in the enqueued slot and runs when the
    /// cycle finishes.
    pub(crate) fn debounced_processing(self: &Arc<Self>, timeout_ms: u64) {
        let mut st = self.state();
        if st.closed {
            return;
        }
        st.rerun_enqueued = false;
        if let Some(t) = st.log_timer.take() {
            t.abort();
        }
        if let Some(t) = st.debounce_timer.take() {
            t.abort();
        }
        let this = Arc::clone(self);
        st.debounce_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            this.on_debounce_elapsed();
        }));
    }

    fn on_debounce_elapsed(self: &Arc<Self>) {
        let begin = {
            let mut st = self.state();
            st.debounce_timer = None;
            if st.closed {
                false
            } else if st.currently_processing {
                st.rerun_enqueued = true;
                false
            } else {
                st.currently_processing = true;
                true
            }
        };
        if begin {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_rerun_loop().await });
        }
    }

    /// Drive rerun cycles until no follow-up is enqueued. The
    /// `currently_processing` flag is already set on entry.
    async fn run_rerun_loop(self: Arc<Self>) {
        loop {
            self.rerun().await;
            let again = {
                let mut st = self.state();
                st.currently_processing = false;
                if st.rerun_enqueued && !st.closed {
                    st.rerun_enqueued = false;
                    st.currently_processing = true;
                    true
                } else {
                    false
                }
            };
            if !again {
                return;
            }
        }
    }

    // --- Rerun executor ---

    /// One bundling cycle: snapshot, bundle, diff hashes, commit or
    /// discard, signal reload when identities changed.
    async fn rerun(self: &Arc<Self>) {
        // The first cycle waits for the scanner's candidate set.
        let scan = self.state().scan_processing.clone();
        if let Some(scan) = scan {
            scan.wait().await;
        }

        let snapshot = {
            let mut st = self.state();
            if let Some(t) = st.debounce_timer.take() {
                t.abort();
            }
            let snapshot = self.store.load_full();
            if snapshot.discovered.is_empty() {
                return;
            }

            // From here on, new discoveries belong to the next cycle.
            st.new_deps_discovered = false;
            let previous = std::mem::replace(&mut st.barrier, ProcessingBarrier::new());
            st.resolve_queue.push(previous);
            snapshot
        };

        // Known deps first, then discoveries in registration order, so the
        // bundler sees a stable graph run-to-run.
        let mut new_deps: IndexMap<String, OptimizedDepInfo> = IndexMap::new();
        for (id, info) in snapshot.optimized.iter().chain(snapshot.discovered.iter()) {
            let mut copy = info.clone();
            copy.processing = None;
            new_deps.insert(id.clone(), copy);
        }

        info!(deps = new_deps.len(), "Re-bundling dependencies");
        let pending = match self.bundler.bundle(&self.config, new_deps, false).await {
            Ok(pending) => pending,
            Err(err) => {
                self.handle_rerun_error(err);
                return;
            }
        };
        let new_metadata = pending.metadata().clone();

        let mismatches = find_interop_mismatches(&snapshot.discovered, &new_metadata.optimized);
        let hash_changed = snapshot.hash != new_metadata.hash;
        let file_hash_changed = snapshot.optimized.iter().any(|(id, old)| {
            new_metadata
                .optimized
                .get(id)
                .map_or(true, |new| new.file_hash != old.file_hash)
        });
        let needs_reload = !mismatches.is_empty() || hash_changed || file_hash_changed;

        if !needs_reload {
            match self.commit_processing(pending.as_ref(), new_metadata, false).await {
                Ok(newly) => self.schedule_deps_log(newly),
                Err(err) => self.handle_rerun_error(err),
            }
            return;
        }

        if self.state().new_deps_discovered {
            // More deps turned up while the bundler ran and this result
            // would force a reload anyway: discard it and let the already
            // scheduled follow-up cycle produce a single reload. Waiters
            // stay parked in the resolve-queue until that cycle commits.
            info!("Delaying reload: new dependencies were found while re-bundling");
            if let Err(err) = pending.cancel().await {
                warn!(error = %format!("{err:#}"), "Failed to discard staged bundle");
            }
            return;
        }

        match self.commit_processing(pending.as_ref(), new_metadata, true).await {
            Ok(newly) => {
                for dep in &mismatches {
                    warn!(
                        dep = %dep,
                        "Mixed ESM and CJS dependency needs an interop wrapper, reloading"
                    );
                }
                if !newly.is_empty() {
                    info!(deps = ?newly, "New dependencies optimized");
                }
                info!("Optimized dependencies changed, reloading page");
                self.server.invalidate_module_graph().await;
                if let Err(err) = self.server.broadcast(ReloadMessage::full_reload()).await {
                    warn!(error = %format!("{err:#}"), "Failed to broadcast full reload");
                }
            }
            Err(err) => self.handle_rerun_error(err),
        }
    }

    /// Make a finished bundle durable and publish its snapshot.
    async fn commit_processing(
        &self,
        pending: &dyn PendingBundle,
        mut new_metadata: DepOptimizationMetadata,
        needs_reload: bool,
    ) -> anyhow::Result<Vec<String>> {
        pending.commit().await?;

        let mut st = self.state();
        let current = self.store.load_full();

        // Deps discovered while the bundler ran are not part of this
        // bundle; carry them into the new snapshot so the next cycle picks
        // them up (their completion signals belong to the next barrier).
        for (id, info) in &current.discovered {
            if !new_metadata.optimized.contains_key(id) {
                if let Err(err) = new_metadata.add(DepKind::Discovered, info.clone()) {
                    // A bundler chunk claimed this id; the dep is servable
                    // under the chunk entry, so drop the discovery.
                    warn!(error = %err, "Dropping discovered dep shadowed by a chunk");
                }
            }
        }

        // A commit that does not force a reload keeps the previous browser
        // hash so the browser's module cache stays warm.
        if !needs_reload {
            new_metadata.browser_hash = current.browser_hash.clone();
            for info in new_metadata
                .optimized
                .values_mut()
                .chain(new_metadata.chunks.values_mut())
            {
                info.browser_hash = current.browser_hash.clone();
            }
        }

        let newly: Vec<String> = new_metadata
            .optimized
            .keys()
            .filter(|id| current.discovered.contains_key(*id))
            .cloned()
            .collect();

        self.store.replace(new_metadata);
        for barrier in st.resolve_queue.drain(..) {
            barrier.resolve();
        }
        Ok(newly)
    }

    /// Bundler or commit failure: wake all waiters, force rediscovery,
    /// keep serving the last committed snapshot.
    fn handle_rerun_error(&self, err: anyhow::Error) {
        error!(error = %format!("{err:#}"), "Dependency re-bundling failed");
        let mut st = self.state();
        for barrier in st.resolve_queue.drain(..) {
            barrier.resolve();
        }
        let current = self.store.load_full();
        if !current.discovered.is_empty() {
            let mut cleared = (*current).clone();
            cleared.discovered.clear();
            self.store.replace(cleared);
        }
        st.new_deps_discovered = false;
    }

    fn schedule_deps_log(self: &Arc<Self>, newly: Vec<String>) {
        if newly.is_empty() {
            return;
        }
        let mut st = self.state();
        st.deps_to_log.extend(newly);
        if let Some(t) = st.log_timer.take() {
            t.abort();
        }
        let this = Arc::clone(self);
        let delay = self.config.log_delay_ms;
        st.log_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let deps = {
                let mut st = this.state();
                st.log_timer = None;
                std::mem::take(&mut st.deps_to_log)
            };
            if !deps.is_empty() {
                info!(deps = ?deps, "New dependencies optimized");
            }
        }));
    }

    // --- SSR variant ---

    /// Bundle the manual include list once with the SSR flag; the result
    /// lives in its own slot and never re-enters the control loop.
    async fn init_ssr(&self) -> anyhow::Result<()> {
        let mut deps: IndexMap<String, OptimizedDepInfo> = IndexMap::new();
        for id in &self.config.include {
            let Some(src) = cache::resolve_bare_import(&self.config, id) else {
                warn!(dep = %id, "Cannot resolve SSR include, skipping");
                continue;
            };
            deps.insert(
                id.clone(),
                OptimizedDepInfo {
                    id: id.clone(),
                    src: Some(src),
                    file: paths::deterministic_dep_path(&self.config, id, true),
                    browser_hash: String::new(),
                    file_hash: None,
                    needs_interop: None,
                    exports: ExportsSlot::default(),
                    processing: None,
                },
            );
        }
        if deps.is_empty() {
            return Ok(());
        }

        let pending = self.bundler.bundle(&self.config, deps, true).await?;
        let metadata = pending.metadata().clone();
        pending.commit().await?;
        info!(deps = metadata.optimized.len(), "SSR dependencies pre-bundled");
        self.ssr_store.replace(metadata);
        Ok(())
    }
}

/// Deps whose committed interop conclusion the browser has not seen:
/// definite values that disagree, or an unknown registered as plain ESM
/// that turned out to need a CJS wrapper.
fn find_interop_mismatches(
    discovered: &IndexMap<String, OptimizedDepInfo>,
    optimized: &IndexMap<String, OptimizedDepInfo>,
) -> Vec<String> {
    discovered
        .iter()
        .filter(|(id, old)| {
            optimized
                .get(*id)
                .is_some_and(|new| interop_mismatch(old.needs_interop, new.needs_interop))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn interop_mismatch(registered: Option<bool>, concluded: Option<bool>) -> bool {
    match (registered, concluded) {
        (Some(a), Some(b)) => a != b,
        (None, Some(true)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interop_mismatch_rule() {
        // Definite disagreement both ways
        assert!(interop_mismatch(Some(false), Some(true)));
        assert!(interop_mismatch(Some(true), Some(false)));
        // Unknown at registration: only a CJS conclusion forces a reload
        assert!(interop_mismatch(None, Some(true)));
        assert!(!interop_mismatch(None, Some(false)));
        // Agreement or no conclusion
        assert!(!interop_mismatch(Some(true), Some(true)));
        assert!(!interop_mismatch(Some(false), None));
        assert!(!interop_mismatch(None, None));
    }
}
