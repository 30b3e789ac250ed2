//! Export summaries for resolved dependency sources.
//!
//! The server uses these to pick the right ESM/CJS interop wrapper when it
//! rewrites imports. The control loop treats the summary as opaque data; it
//! is extracted at most once per dep, on first access.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use regex::Regex;
use tokio::sync::OnceCell;

/// Summary of a module's export surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportsData {
    /// Whether the source contains ES module syntax at all. A `false` here
    /// means the dep is CJS and needs an interop wrapper.
    pub has_module_syntax: bool,
    /// Named exports, in source order.
    pub exports: Vec<String>,
    pub has_default_export: bool,
}

fn esm_syntax_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:import|export)\b").expect("valid regex"))
}

fn named_export_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*export\s+(?:const|let|var|function\*?|async\s+function\*?|class)\s+([A-Za-z_$][\w$]*)",
        )
        .expect("valid regex")
    })
}

fn export_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"export\s*\{([^}]*)\}").expect("valid regex"))
}

fn default_export_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*export\s+default\b").expect("valid regex"))
}

impl ExportsData {
    /// Scan a module source. This is a lexical approximation, not a parse:
    /// good enough to distinguish ESM from CJS and to enumerate the common
    /// named-export forms.
    pub fn from_source(source: &str) -> Self {
        let has_module_syntax = esm_syntax_re().is_match(source);
        if !has_module_syntax {
            return Self::default();
        }

        let mut exports: Vec<String> = named_export_re()
            .captures_iter(source)
            .map(|c| c[1].to_string())
            .collect();

        for list in export_list_re().captures_iter(source) {
            for name in list[1].split(',') {
                // `export { foo as bar }` re-exports under the alias
                let name = name.split(" as ").last().unwrap_or(name).trim();
                if name == "default" {
                    continue;
                }
                if !name.is_empty() && !exports.iter().any(|e| e == name) {
                    exports.push(name.to_string());
                }
            }
        }

        Self {
            has_module_syntax: true,
            exports,
            has_default_export: default_export_re().is_match(source)
                || source.contains("as default"),
        }
    }
}

/// Shared lazy slot for a dep's [`ExportsData`]. Clones share the slot, so
/// the extraction runs once no matter how many snapshot copies exist.
#[derive(Debug, Clone, Default)]
pub struct ExportsSlot {
    cell: Arc<OnceCell<ExportsData>>,
}

impl ExportsSlot {
    /// Extract from `src` on first call; later calls return the cached
    /// summary without touching the filesystem.
    pub async fn get_or_extract(&self, src: &Path) -> anyhow::Result<&ExportsData> {
        self.cell
            .get_or_try_init(|| async {
                let source = tokio::fs::read_to_string(src)
                    .await
                    .with_context(|| format!("reading dep source {}", src.display()))?;
                Ok(ExportsData::from_source(&source))
            })
            .await
    }

    pub fn get(&self) -> Option<&ExportsData> {
        self.cell.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cjs_module_has_no_module_syntax() {
        let data = ExportsData::from_source("module.exports = { pick: pick };\n");
        assert!(!data.has_module_syntax);
        assert!(data.exports.is_empty());
        assert!(!data.has_default_export);
    }

    #[test]
    fn named_declarations_are_collected() {
        let src = "export const a = 1;\nexport function b() {}\nexport class C {}\n";
        let data = ExportsData::from_source(src);
        assert!(data.has_module_syntax);
        assert_eq!(data.exports, vec!["a", "b", "C"]);
        assert!(!data.has_default_export);
    }

    #[test]
    fn export_lists_and_aliases() {
        let src = "const x = 1, y = 2;\nexport { x, y as why };\nexport default x;\n";
        let data = ExportsData::from_source(src);
        assert_eq!(data.exports, vec!["x", "why"]);
        assert!(data.has_default_export);
    }

    #[tokio::test]
    async fn slot_extracts_once_and_is_shared_across_clones() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("index.mjs");
        tokio::fs::write(&src, "export const one = 1;\n").await.unwrap();

        let slot = ExportsSlot::default();
        let clone = slot.clone();
        let data = slot.get_or_extract(&src).await.unwrap();
        assert_eq!(data.exports, vec!["one"]);

        // Delete the file: the clone must serve the cached summary.
        tokio::fs::remove_file(&src).await.unwrap();
        let cached = clone.get_or_extract(&src).await.unwrap();
        assert_eq!(cached.exports, vec!["one"]);
    }
}
