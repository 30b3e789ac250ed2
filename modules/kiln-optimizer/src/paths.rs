//! Cache-directory layout and the pure path/url predicates the server uses
//! to recognize pre-bundled dependency requests.

use std::path::{Path, PathBuf};

use kiln_common::{flatten_id, OptimizerConfig};

use crate::metadata::OptimizedDepInfo;

pub const METADATA_FILENAME: &str = "_metadata.json";

/// Directory holding the committed bundles: `<cache_dir>/deps`, or
/// `<cache_dir>/deps_ssr` for the server-side variant.
pub fn deps_cache_dir(config: &OptimizerConfig, ssr: bool) -> PathBuf {
    let name = if ssr { "deps_ssr" } else { "deps" };
    config.cache_dir.join(name)
}

/// Staging directory the bundler writes into before `commit()` swaps it in.
pub fn staging_deps_dir(config: &OptimizerConfig, ssr: bool) -> PathBuf {
    let mut dir = deps_cache_dir(config, ssr).into_os_string();
    dir.push("_temp");
    PathBuf::from(dir)
}

/// Deterministic output path for a dep, derived only from its id and the
/// SSR flag. Stable run-to-run so pre-bundle identifiers survive reruns.
pub fn deterministic_dep_path(config: &OptimizerConfig, id: &str, ssr: bool) -> PathBuf {
    deps_cache_dir(config, ssr).join(format!("{}.js", flatten_id(id)))
}

pub fn metadata_file_path(deps_dir: &Path) -> PathBuf {
    deps_dir.join(METADATA_FILENAME)
}

/// Does `path` point into one of the bundle cache directories?
pub fn is_optimized_dep_file(config: &OptimizerConfig, path: &Path) -> bool {
    path.starts_with(deps_cache_dir(config, false))
        || path.starts_with(deps_cache_dir(config, true))
}

/// URL prefix under which bundled deps are served: the cache dir relative
/// to the project root, or an `/@fs/` absolute escape when outside it.
fn deps_url_prefix(config: &OptimizerConfig, ssr: bool) -> String {
    let dir = deps_cache_dir(config, ssr);
    match dir.strip_prefix(&config.root) {
        Ok(relative) => format!("/{}", relative.display()),
        Err(_) => format!("/@fs/{}", dir.display().to_string().trim_start_matches('/')),
    }
}

/// Does `url` address a pre-bundled dependency?
pub fn is_optimized_dep_url(config: &OptimizerConfig, url: &str) -> bool {
    url.starts_with(&deps_url_prefix(config, false))
        || url.starts_with(&deps_url_prefix(config, true))
}

/// The id the browser imports: the plain file in build mode, the file plus
/// a `?v=` cache-busting query in dev.
pub fn get_optimized_dep_id(config: &OptimizerConfig, info: &OptimizedDepInfo) -> String {
    if config.is_build() {
        info.file.display().to_string()
    } else {
        format!("{}?v={}", info.file.display(), info.browser_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exports::ExportsSlot;
    use kiln_common::Command;

    fn make_config() -> OptimizerConfig {
        OptimizerConfig::new("/app")
    }

    fn make_info(config: &OptimizerConfig, id: &str) -> OptimizedDepInfo {
        OptimizedDepInfo {
            id: id.to_string(),
            src: None,
            file: deterministic_dep_path(config, id, false),
            browser_hash: "cafe0123".to_string(),
            file_hash: None,
            needs_interop: None,
            exports: ExportsSlot::default(),
            processing: None,
        }
    }

    #[test]
    fn dep_paths_are_deterministic_and_flattened() {
        let config = make_config();
        let path = deterministic_dep_path(&config, "@scope/pkg", false);
        assert_eq!(path, PathBuf::from("/app/.kiln/deps/@scope_pkg.js"));
        assert_eq!(path, deterministic_dep_path(&config, "@scope/pkg", false));

        let ssr = deterministic_dep_path(&config, "@scope/pkg", true);
        assert_eq!(ssr, PathBuf::from("/app/.kiln/deps_ssr/@scope_pkg.js"));
    }

    #[test]
    fn staging_dir_sits_next_to_the_committed_dir() {
        let config = make_config();
        assert_eq!(
            staging_deps_dir(&config, false),
            PathBuf::from("/app/.kiln/deps_temp")
        );
        assert_eq!(
            staging_deps_dir(&config, true),
            PathBuf::from("/app/.kiln/deps_ssr_temp")
        );
    }

    #[test]
    fn optimized_dep_file_predicate() {
        let config = make_config();
        assert!(is_optimized_dep_file(
            &config,
            Path::new("/app/.kiln/deps/lodash.js")
        ));
        assert!(is_optimized_dep_file(
            &config,
            Path::new("/app/.kiln/deps_ssr/lodash.js")
        ));
        assert!(!is_optimized_dep_file(
            &config,
            Path::new("/app/src/main.ts")
        ));
        // Staging output is not servable
        assert!(!is_optimized_dep_file(
            &config,
            Path::new("/app/.kiln/deps_temp/lodash.js")
        ));
    }

    #[test]
    fn optimized_dep_url_predicate() {
        let config = make_config();
        assert!(is_optimized_dep_url(&config, "/.kiln/deps/vue.js?v=cafe0123"));
        assert!(!is_optimized_dep_url(&config, "/src/main.ts"));

        let mut outside = make_config();
        outside.cache_dir = PathBuf::from("/var/cache/kiln");
        assert!(is_optimized_dep_url(
            &outside,
            "/@fs/var/cache/kiln/deps/vue.js"
        ));
    }

    #[test]
    fn dep_id_carries_version_query_only_in_dev() {
        let mut config = make_config();
        let info = make_info(&config, "vue");
        assert_eq!(
            get_optimized_dep_id(&config, &info),
            "/app/.kiln/deps/vue.js?v=cafe0123"
        );

        config.command = Command::Build;
        assert_eq!(
            get_optimized_dep_id(&config, &info),
            "/app/.kiln/deps/vue.js"
        );
    }
}
