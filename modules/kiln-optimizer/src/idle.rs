//! Idle tracking: the server reports every in-flight module transform, and
//! the first optimize run fires once the server has gone quiet.
//!
//! Pending requests form a LIFO stack on purpose: the newest request is the
//! one closest to the user's current navigation path, so it is waited on
//! first. This ordering is part of the contract.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::optimizer::DepsOptimizer;

/// Completion signal for one in-flight transform request.
pub type DoneSignal = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Default)]
pub(crate) struct IdleState {
    /// Pending work, newest last (popped first).
    registered: Vec<(String, DoneSignal)>,
    seen: HashSet<String>,
    /// Ids driven by a parallel bundling pipeline; never block the run.
    workers_sources: HashSet<String>,
    waiting_on: Option<String>,
    first_run_ensured: bool,
}

enum IdleAction {
    Next,
    Run,
    Stop,
}

impl DepsOptimizer {
    fn idle_state(&self) -> MutexGuard<'_, IdleState> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hold the first optimize run until `done` resolves. Already-optimized
    /// files and ids seen before are ignored.
    pub fn delay_until(self: &Arc<Self>, id: &str, done: DoneSignal) {
        if self.is_closed() || self.is_optimized_dep_file(Path::new(id)) {
            return;
        }
        {
            let mut idle = self.idle_state();
            if !idle.seen.insert(id.to_string()) {
                return;
            }
            idle.registered.push((id.to_string(), done));
        }
        self.process_idle_queue();
    }

    /// Mark `id` as driven by a parallel pipeline: drop it from the stack
    /// and stop waiting on it if it is the one currently awaited.
    pub fn register_workers_source(self: &Arc<Self>, id: &str) {
        let resume = {
            let mut idle = self.idle_state();
            idle.workers_sources.insert(id.to_string());
            idle.registered.retain(|(registered, _)| registered != id);
            if idle.waiting_on.as_deref() == Some(id) {
                idle.waiting_on = None;
                true
            } else {
                false
            }
        };
        if resume {
            self.process_idle_queue();
        }
    }

    /// Drop all idle state. Stale waiter tasks notice and bail.
    pub fn reset_registered_ids(&self) {
        let mut idle = self.idle_state();
        idle.registered.clear();
        idle.seen.clear();
        idle.workers_sources.clear();
        idle.waiting_on = None;
    }

    /// Fallback for sessions where no transform ever registers (the entry
    /// point itself is a dependency): after a short idle, run anyway.
    pub fn ensure_first_run(self: &Arc<Self>) {
        let arm = {
            let mut idle = self.idle_state();
            if idle.first_run_ensured || !idle.registered.is_empty() || self.first_run_called()
            {
                false
            } else {
                idle.first_run_ensured = true;
                true
            }
        };
        if !arm {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(this.config().first_run_delay_ms)).await;
            let still_idle = {
                let idle = this.idle_state();
                idle.registered.is_empty() && idle.waiting_on.is_none()
            };
            if still_idle && !this.is_closed() && !this.first_run_called() {
                debug!("Server stayed idle, triggering the first optimize run");
                this.run();
            }
        });
    }

    fn process_idle_queue(self: &Arc<Self>) {
        let next = {
            let mut idle = self.idle_state();
            if idle.waiting_on.is_some() {
                return;
            }
            match idle.registered.pop() {
                Some((id, done)) => {
                    idle.waiting_on = Some(id.clone());
                    Some((id, done))
                }
                None => None,
            }
        };
        let Some((id, done)) = next else { return };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // A failed transform counts as completed.
            let _ = done.await;

            let more_queued = !this.idle_state().registered.is_empty();
            let grace = if more_queued {
                0
            } else {
                this.config().idle_grace_ms
            };
            if grace > 0 {
                tokio::time::sleep(Duration::from_millis(grace)).await;
            }

            let action = {
                let mut idle = this.idle_state();
                if idle.waiting_on.as_deref() != Some(id.as_str()) {
                    // Superseded by register_workers_source or a reset.
                    IdleAction::Stop
                } else {
                    idle.waiting_on = None;
                    if this.is_closed() || idle.workers_sources.contains(&id) {
                        IdleAction::Stop
                    } else if !idle.registered.is_empty() {
                        IdleAction::Next
                    } else if !this.first_run_called() {
                        IdleAction::Run
                    } else {
                        IdleAction::Stop
                    }
                }
            };
            match action {
                IdleAction::Next => this.process_idle_queue(),
                IdleAction::Run => {
                    debug!(last = %id, "Server went idle, triggering the first optimize run");
                    this.run();
                }
                IdleAction::Stop => {}
            }
        });
    }
}
