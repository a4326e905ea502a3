//! Version comparison for plugin version strings.
//!
//! Plugin authors rarely publish strict semver: `1.2`, `3.0.1.4` and
//! `2.0-beta` all show up in the wild. Strings are normalised to three
//! numeric components and compared with `semver`; anything it still rejects
//! falls back to a segment-by-segment comparison.

use std::cmp::Ordering;

use semver::Version;

/// Compare two version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_semver(a), parse_semver(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => compare_segments(a, b),
    }
}

/// `true` if `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

fn parse_semver(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }

    // Pad `1` / `1.2` (optionally with a `-pre` suffix) to three components.
    let (core, rest) = match raw.find(['-', '+']) {
        Some(idx) => raw.split_at(idx),
        None => (raw, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);

    Version::parse(&padded).ok()
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.trim()
            .split(['.', '-', '_', '+'])
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let (sa, sb) = (split(a), split(b));

    for i in 0..sa.len().max(sb.len()) {
        let ord = match (sa.get(i), sb.get(i)) {
            (Some(x), Some(y)) => match (x.parse::<u64>(), y.parse::<u64>()) {
                (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                _ => x.cmp(y),
            },
            (Some(x), None) => {
                if x.parse::<u64>().map_or(false, |n| n == 0) {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                }
            }
            (None, Some(y)) => {
                if y.parse::<u64>().map_or(false, |n| n == 0) {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            }
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semver_ordering() {
        assert_eq!(compare_versions("1.3.0", "1.2.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_short_versions_are_padded() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert!(is_newer("1.3", "1.2.9"));
        assert!(is_newer("v2", "1.9.9"));
    }

    #[test]
    fn test_prerelease_is_older() {
        assert!(is_newer("2.0.0", "2.0.0-beta"));
        assert!(is_newer("2.0-rc1", "1.9"));
    }

    #[test]
    fn test_four_component_fallback() {
        assert!(is_newer("3.0.1.5", "3.0.1.4"));
        assert!(is_newer("3.0.2", "3.0.1.9"));
        assert_eq!(compare_versions("3.0.1.0", "3.0.1"), Ordering::Equal);
    }

    #[test]
    fn test_not_newer_when_equal_or_older() {
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("0.9.0", "1.0.0"));
    }
}
