//! Relaxed semantic version comparison for marketplace update detection.
//!
//! Versions look like `major[.minor[.patch[.build]]][-prerelease]` with an
//! optional leading `v`/`V`. Missing numeric segments count as zero, so
//! `1.0.0` and `1.0.0.0` are the same version.
//!
//! Comparison never fails. Empty versions sort below everything, strings that
//! don't parse sort below every valid version, and two unparseable strings
//! compare equal.

use std::cmp::Ordering;

/// Maximum number of numeric segments (`major.minor.patch.build`)
const MAX_SEGMENTS: usize = 4;

/// A version string that passed the grammar check
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedVersion<'a> {
    parts: [u64; MAX_SEGMENTS],
    prerelease: Option<&'a str>,
}

fn strip_prefix(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

fn parse_segment(segment: &str) -> Option<u64> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Parse a version with its prefix already stripped.
fn parse(version: &str) -> Option<ParsedVersion<'_>> {
    let (numbers, prerelease) = match version.split_once('-') {
        Some((numbers, pre)) => (numbers, Some(pre)),
        None => (version, None),
    };

    let segments: Vec<&str> = numbers.split('.').collect();
    if segments.is_empty() || segments.len() > MAX_SEGMENTS {
        return None;
    }

    let mut parts = [0u64; MAX_SEGMENTS];
    for (slot, segment) in parts.iter_mut().zip(&segments) {
        *slot = parse_segment(segment)?;
    }

    Some(ParsedVersion { parts, prerelease })
}

fn is_blank(version: Option<&str>) -> bool {
    version.is_none_or(|v| v.trim().is_empty())
}

/// Compare two version strings, returning `-1`, `0` or `1`.
pub fn compare(a: Option<&str>, b: Option<&str>) -> i32 {
    match compare_ordering(a, b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// Same as [`compare`] but as an [`Ordering`], handy for sorting.
pub fn compare_ordering(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (is_blank(a), is_blank(b)) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }

    let a = parse(strip_prefix(a.unwrap_or_default()));
    let b = parse(strip_prefix(b.unwrap_or_default()));

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .parts
            .cmp(&b.parts)
            .then_with(|| compare_prerelease(a.prerelease, b.prerelease)),
    }
}

/// True when `available` is a valid version strictly newer than a valid
/// `installed` version. Blank or unparseable input never signals an update.
pub fn is_newer(available: Option<&str>, installed: Option<&str>) -> bool {
    if is_blank(available) || is_blank(installed) {
        return false;
    }
    let valid = |v: Option<&str>| parse(strip_prefix(v.unwrap_or_default())).is_some();
    if !valid(available) || !valid(installed) {
        return false;
    }
    compare_ordering(available, installed) == Ordering::Greater
}

fn compare_prerelease(a: Option<&str>, b: Option<&str>) -> Ordering {
    // A release outranks any of its prereleases
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(a), Some(b)) => (a, b),
    };

    let ids_a: Vec<&str> = a.split('.').collect();
    let ids_b: Vec<&str> = b.split('.').collect();

    ids_a
        .iter()
        .zip(&ids_b)
        .map(|(x, y)| compare_identifier(x, y))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or_else(|| ids_a.len().cmp(&ids_b.len()))
}

fn compare_identifier(a: &str, b: &str) -> Ordering {
    match (parse_segment(a), parse_segment(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        // numeric identifiers rank below alphanumeric ones
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
