pub mod config;
pub mod error;

pub use config::{Command, OptimizerConfig};
pub use error::KilnError;

/// Flatten a bare import specifier into a single filesystem-safe path
/// segment: `/` and `:` become `_`, `.` becomes `__`, and nested-import
/// arrows (`a > b`) become `___` so distinct specifiers never collide.
///
/// ```
/// assert_eq!(kiln_common::flatten_id("lodash"), "lodash");
/// assert_eq!(kiln_common::flatten_id("@scope/pkg"), "@scope_pkg");
/// assert_eq!(kiln_common::flatten_id("pkg/dist/index.mjs"), "pkg_dist_index__mjs");
/// assert_eq!(kiln_common::flatten_id("a > b"), "a___b");
/// ```
pub fn flatten_id(id: &str) -> String {
    let mut flat = String::with_capacity(id.len());
    let mut rest = id;
    while let Some(pos) = rest.find(" > ") {
        flatten_segment(&rest[..pos], &mut flat);
        flat.push_str("___");
        rest = &rest[pos + 3..];
    }
    flatten_segment(rest, &mut flat);
    flat
}

fn flatten_segment(segment: &str, out: &mut String) {
    for c in segment.chars() {
        match c {
            '/' | ':' => out.push('_'),
            '.' => out.push_str("__"),
            _ => out.push(c),
        }
    }
}
