//! Helpers for cleaning untrusted names and for keeping full paths out of
//! tracing span attributes.

use std::path::{Path, PathBuf};

const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Drops userinfo and query string from a URL before it is logged.
pub fn redact_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);

    if let Some(scheme_end) = without_query.find("://") {
        let after_scheme = &without_query[scheme_end + 3..];
        let host_end = after_scheme.find('/').unwrap_or(after_scheme.len());
        if let Some(at_pos) = after_scheme[..host_end].rfind('@') {
            let scheme = &without_query[..scheme_end + 3];
            return format!("{}****@{}", scheme, &after_scheme[at_pos + 1..]);
        }
    }

    without_query.to_string()
}

/// Turns a suggested name into a library-relative path that cannot escape
/// the library.
///
/// Backslashes count as separators, empty and `.` components are dropped,
/// characters that are invalid on common file systems become `_`, and any
/// `..` component rejects the whole name. Returns `None` when nothing usable
/// remains.
pub fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();

    for raw in name.split(['/', '\\']) {
        let component: String = raw
            .chars()
            .map(|c| {
                if c.is_control() || FORBIDDEN_CHARS.contains(&c) {
                    '_'
                } else {
                    c
                }
            })
            .collect();
        let component = component.trim().trim_end_matches('.');

        if raw.trim() == ".." {
            return None;
        }
        if component.is_empty() {
            continue;
        }
        path.push(component);
    }

    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}
