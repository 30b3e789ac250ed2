use std::env;
use std::path::PathBuf;

use serde_json::json;

use crate::error::KilnError;

/// Whether kiln was started as a one-shot build or as the dev server.
/// The optimizer only drives its control loop under `Serve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Build,
    Serve,
}

/// Resolved configuration for the dependency optimizer.
///
/// Built by the dev server from the project's resolved config. Fields are
/// public: the server fills in what it knows and leaves the rest at the
/// defaults from [`OptimizerConfig::new`].
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Project root. Manual includes are resolved relative to this.
    pub root: PathBuf,
    /// Cache directory holding the `deps` / `deps_ssr` bundle dirs.
    pub cache_dir: PathBuf,
    pub command: Command,
    /// Bundle a server-side rendering variant once at startup.
    pub ssr: bool,

    /// Dependencies to pre-bundle even if never imported.
    pub include: Vec<String>,
    /// Dependencies never pre-bundled.
    pub exclude: Vec<String>,
    /// Lockfile contents (or any other dependency-identity material); part
    /// of the snapshot hash so a lockfile change invalidates the cache.
    pub lockfile_contents: String,

    // Control loop timing (milliseconds)
    pub debounce_ms: u64,
    pub idle_grace_ms: u64,
    pub log_delay_ms: u64,
    pub first_run_delay_ms: u64,
}

impl OptimizerConfig {
    /// Config with defaults for a project rooted at `root`.
    /// `KILN_DEBOUNCE_MS` overrides the discovery debounce window.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cache_dir = root.join(".kiln");
        let debounce_ms = env::var("KILN_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        Self {
            root,
            cache_dir,
            command: Command::Serve,
            ssr: false,
            include: Vec::new(),
            exclude: Vec::new(),
            lockfile_contents: String::new(),
            debounce_ms,
            idle_grace_ms: 100,
            log_delay_ms: 200,
            first_run_delay_ms: 100,
        }
    }

    pub fn is_build(&self) -> bool {
        self.command == Command::Build
    }

    /// Whether `id` is barred from pre-bundling.
    pub fn excludes(&self, id: &str) -> bool {
        self.exclude.iter().any(|excluded| excluded == id)
    }

    /// Reject configurations that can never work: a dependency cannot be
    /// both force-included and excluded.
    pub fn validate(&self) -> Result<(), KilnError> {
        for id in &self.include {
            if self.excludes(id) {
                return Err(KilnError::Config(format!(
                    "dependency {id} is listed in both include and exclude"
                )));
            }
        }
        Ok(())
    }

    /// The material that identifies this configuration for cache purposes.
    /// Two configs with equal payloads share a pre-bundle cache.
    pub fn identity_payload(&self) -> serde_json::Value {
        json!({
            "root": self.root.to_string_lossy(),
            "mode": match self.command {
                Command::Build => "build",
                Command::Serve => "serve",
            },
            "include": self.include,
            "exclude": self.exclude,
            "lockfile": self.lockfile_contents,
        })
    }
}
