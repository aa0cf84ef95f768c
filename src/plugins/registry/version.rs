//! Version ordering shared by the ecosystem plugins
//!
//! Semantic versions compare by semver rules. Anything else (Maven
//! qualifiers, four-part NuGet versions, PEP 440 oddities) falls back to a
//! segment-wise comparison where numbers compare numerically.

use std::cmp::Ordering;

use semver::Version;

/// Parse leniently: a leading `v` is dropped and a short numeric core padded
fn lenient_semver(raw: &str) -> Option<Version> {
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let split = raw.find(['-', '+']).unwrap_or(raw.len());
    let (core, rest) = raw.split_at(split);
    let parts = core.split('.').count();
    if parts == 0 || parts > 3 || core.split('.').any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let padded = format!("{}{}{}", core, ".0".repeat(3 - parts), rest);
    Version::parse(&padded).ok()
}

fn segments(raw: &str) -> Vec<&str> {
    raw.split(['.', '-', '_', '+'])
        .filter(|s| !s.is_empty())
        .collect()
}

fn fallback_compare(a: &str, b: &str) -> Ordering {
    let (sa, sb) = (segments(a), segments(b));
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(n), Ok(m)) => n.cmp(&m),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.to_lowercase().cmp(&y.to_lowercase()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    // `1.0` < `1.0.1` but `1.0` > `1.0-beta`
    let tail_is_numeric = |rest: &[&str]| rest.first().is_some_and(|s| s.parse::<u64>().is_ok());
    match sa.len().cmp(&sb.len()) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Less if tail_is_numeric(&sb[sa.len()..]) => Ordering::Less,
        Ordering::Less => Ordering::Greater,
        Ordering::Greater if tail_is_numeric(&sa[sb.len()..]) => Ordering::Greater,
        Ordering::Greater => Ordering::Less,
    }
}

/// Total order over version strings
pub fn compare(a: &str, b: &str) -> Ordering {
    match (lenient_semver(a), lenient_semver(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => fallback_compare(a, b).then_with(|| a.cmp(b)),
    }
}

/// Whether a version is a pre-release or snapshot
pub fn is_prerelease(version: &str) -> bool {
    if let Some(v) = lenient_semver(version) {
        return !v.pre.is_empty();
    }
    segments(version).iter().any(|s| {
        let s = s.to_lowercase();
        s == "snapshot"
            || s.starts_with("alpha")
            || s.starts_with("beta")
            || s.starts_with("rc")
            || s.starts_with("dev")
            || s.starts_with("pre")
    })
}

/// Distinct versions in ascending order
pub fn sorted_distinct<'a>(versions: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = versions.into_iter().map(String::from).collect();
    out.sort_by(|a, b| compare(a, b));
    out.dedup();
    out
}

/// Highest release, or the highest version if every one is a pre-release
pub fn latest<'a>(versions: impl IntoIterator<Item = &'a str> + Clone) -> Option<String> {
    versions
        .clone()
        .into_iter()
        .filter(|v| !is_prerelease(v))
        .max_by(|a, b| compare(a, b))
        .or_else(|| versions.into_iter().max_by(|a, b| compare(a, b)))
        .map(String::from)
}
