//! Project-relative path normalization.
//!
//! Exclusion rules, install paths and scaffold files are all compared as
//! `/`-separated strings relative to the project root, with no leading `./`
//! and no trailing slash. Everything that produces such a string goes through
//! this module so comparisons stay consistent.

use std::path::{Component, Path};

/// Normalizes a relative path string.
///
/// - Backslashes become `/`
/// - Empty and `.` segments are dropped
/// - `..` pops the previous segment
///
/// Returns `None` for the project root itself (empty result) and for paths
/// that climb above the root.
///
/// ```ignore
/// normalize_relative("./sites//default/") -> Some("sites/default")
/// normalize_relative("a/../b")            -> Some("b")
/// normalize_relative("../outside")        -> None
/// ```
pub fn normalize_relative(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Expresses `path` relative to `root`.
///
/// Absolute paths must live under `root`; relative paths are taken as already
/// relative to it. Lexical only: nothing is resolved on disk.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    if path.is_absolute() {
        let root = lexical_clean(root);
        let path = lexical_clean(path);
        let rest = path.strip_prefix(&root).ok()?;
        normalize_relative(&to_slash(rest))
    } else {
        normalize_relative(&to_slash(path))
    }
}

/// Joins a web-root-relative path onto the web root's project-relative prefix.
///
/// `web_prefix` is `None` when the web root is the project root.
pub fn web_to_project(web_prefix: Option<&str>, path: &str) -> Option<String> {
    match web_prefix {
        Some(prefix) => normalize_relative(&format!("{}/{}", prefix, path)),
        None => normalize_relative(path),
    }
}

/// Returns true if `candidate` equals `rule` or is nested inside it.
///
/// Matching is on whole components: `a/b` covers `a/b/c` but not `a/bc`.
pub fn is_covered_by(rule: &str, candidate: &str) -> bool {
    candidate == rule
        || candidate
            .strip_prefix(rule)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Renders a path with `/` separators regardless of platform.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Removes `.` components and resolves `..` lexically.
fn lexical_clean(path: &Path) -> std::path::PathBuf {
    let mut cleaned = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
