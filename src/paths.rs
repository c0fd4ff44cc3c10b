//! Path normalization and sanitization
//!
//! Packet paths use `/` separators and must stay inside the base
//! directory. Output names are additionally scrubbed of characters and
//! device names that Windows cannot store, so a set created elsewhere
//! cannot write outside or onto a device when restored here.

use crate::error::{Error, Result};

/// Windows device names that cannot be used as file names.
const DEVICE_NAMES: [&str; 4] = ["CON", "PRN", "AUX", "NUL"];

/// Normalize a packet path: `\` to `/`, collapse `./` and empty segments,
/// resolve `../` inside the path, reject traversal above the base.
pub fn normalize_relative(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    let normalized = path.replace('\\', "/");
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::Logic(format!(
                        "path {path:?} escapes the base directory"
                    )));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(Error::Logic(format!("path {path:?} has no components")));
    }
    Ok(parts.join("/"))
}

fn is_device_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment);
    let upper = stem.to_ascii_uppercase();
    if DEVICE_NAMES.contains(&upper.as_str()) {
        return true;
    }
    if upper.len() == 4 && (upper.starts_with("COM") || upper.starts_with("LPT")) {
        return upper.as_bytes()[3].is_ascii_digit() && upper.as_bytes()[3] != b'0';
    }
    false
}

/// Replace reserved characters and device names so a component is safe to
/// create on any platform. Returns the sanitized component and whether
/// anything changed.
pub fn sanitize_component(segment: &str) -> (String, bool) {
    let mut changed = false;
    let mut out: String = segment
        .chars()
        .map(|c| {
            if c < ' ' || matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                changed = true;
                '_'
            } else {
                c
            }
        })
        .collect();
    if is_device_name(&out) {
        out.insert(0, '_');
        changed = true;
    }
    (out, changed)
}

/// Sanitize every component of a normalized relative path.
pub fn sanitize_relative(path: &str) -> (String, bool) {
    let mut changed = false;
    let parts: Vec<String> = path
        .split('/')
        .map(|segment| {
            let (clean, touched) = sanitize_component(segment);
            changed |= touched;
            clean
        })
        .collect();
    (parts.join("/"), changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_dot_segments() {
        assert_eq!(normalize_relative("a/./b//c").unwrap(), "a/b/c");
        assert_eq!(normalize_relative("a/b/../c").unwrap(), "a/c");
        assert_eq!(normalize_relative("a\\b").unwrap(), "a/b");
    }

    #[test]
    fn traversal_above_base_is_rejected() {
        assert!(normalize_relative("../a").is_err());
        assert!(normalize_relative("a/../../b").is_err());
    }

    #[test]
    fn reserved_characters_become_underscores() {
        let (clean, changed) = sanitize_component("a:b*c?");
        assert_eq!(clean, "a_b_c_");
        assert!(changed);

        let (clean, changed) = sanitize_component("plain.txt");
        assert_eq!(clean, "plain.txt");
        assert!(!changed);
    }

    #[test]
    fn device_names_are_prefixed() {
        assert_eq!(sanitize_component("CON").0, "_CON");
        assert_eq!(sanitize_component("con.txt").0, "_con.txt");
        assert_eq!(sanitize_component("COM1").0, "_COM1");
        assert_eq!(sanitize_component("COM0").0, "COM0");
        assert_eq!(sanitize_component("LPT9.log").0, "_LPT9.log");
        assert_eq!(sanitize_component("CONSOLE").0, "CONSOLE");
    }
}
