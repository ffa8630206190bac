//! The eviction engine: given a list of entries and one node of the
//! policy tree, decide which entries must be dropped and why.
//!
//! Filters run first (each one claims the entries it matches, in
//! declaration order), then the node's own bounds over whatever remains.
//! Within a bound, the node's eviction strategy decides admission
//! priority: entries sorted first are kept.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use imager_utils::{format_duration, format_size};

use super::manager::CacheEntry;
use super::policy::{EvictionStrategy, Limits, MainPolicy, SubPolicy, SubPolicyFilter};
use crate::download::is_http;
use crate::sources::SourceKind;

/// One entry to drop, with the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Eviction {
    pub(crate) key: Utf8PathBuf,
    pub(crate) reason: String,
}

/// A borrowed view of one policy-tree node, as consumed by the engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PolicyNodeRef<'a> {
    pub(crate) name: &'a str,
    pub(crate) enabled: bool,
    pub(crate) limits: &'a Limits,
    pub(crate) filters: &'a [SubPolicyFilter],
}

impl<'a> PolicyNodeRef<'a> {
    pub(crate) fn main(policy: &'a MainPolicy) -> Self {
        Self {
            name: "policy",
            enabled: policy.enabled,
            limits: &policy.limits,
            filters: &[],
        }
    }

    pub(crate) fn sub(name: &'a str, sub: &'a SubPolicy) -> Self {
        Self {
            name,
            enabled: sub.enabled,
            limits: &sub.limits,
            filters: &sub.filters,
        }
    }
}

/// Sort entries by admission priority for the given strategy.
pub(crate) fn sort_for<'a>(
    strategy: EvictionStrategy,
    entries: impl IntoIterator<Item = &'a CacheEntry>,
) -> Vec<&'a CacheEntry> {
    let mut sorted: Vec<&CacheEntry> = entries.into_iter().collect();
    match strategy {
        EvictionStrategy::Oldest => sorted.sort_by_key(|e| e.added_on),
        EvictionStrategy::Newest => sorted.sort_by_key(|e| Reverse(e.added_on)),
        EvictionStrategy::Largest => sorted.sort_by_key(|e| e.size),
        EvictionStrategy::Smallest => sorted.sort_by_key(|e| Reverse(e.size)),
        EvictionStrategy::Lru => sorted.sort_by_key(|e| Reverse(e.last_used_on)),
    }
    sorted
}

/// Compare version strings naturally: digit runs compare as numbers,
/// everything else bytewise.
pub(crate) fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&ca), Some(&cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na = a.iter().take_while(|c| c.is_ascii_digit()).count();
                    let nb = b.iter().take_while(|c| c.is_ascii_digit()).count();
                    let va: u64 = std::str::from_utf8(&a[..na])
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let vb: u64 = std::str::from_utf8(&b[..nb])
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    match va.cmp(&vb) {
                        Ordering::Equal => {
                            a = &a[na..];
                            b = &b[nb..];
                        }
                        other => return other,
                    }
                } else {
                    match ca.cmp(&cb) {
                        Ordering::Equal => {
                            a = &a[1..];
                            b = &b[1..];
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

/// Extract the `(ident, version)` pair of a versioned entry key:
/// `<ident>:<version>` for images, `<ident>_<YYYY-MM>.zim` for files.
pub(crate) fn identify_version(entry: &CacheEntry) -> Option<(String, String)> {
    let basename = entry.fpath.file_name()?;
    match entry.kind {
        SourceKind::Image => {
            let basename = basename.split('@').next()?;
            let (ident, version) = basename.split_once(':')?;
            if version.is_empty() {
                return None;
            }
            Some((ident.to_string(), version.to_string()))
        }
        SourceKind::File => {
            let stem = basename.strip_suffix(".zim")?;
            let (ident, version) = stem.rsplit_once('_')?;
            let ok = version.len() == 7
                && version.as_bytes()[4] == b'-'
                && version[..4].bytes().all(|b| b.is_ascii_digit())
                && version[5..].bytes().all(|b| b.is_ascii_digit());
            if !ok {
                return None;
            }
            Some((ident.to_string(), version.to_string()))
        }
    }
}

fn obsolete_versions(
    buckets: BTreeMap<String, Vec<(&CacheEntry, String)>>,
    keep: usize,
) -> Vec<Eviction> {
    let mut evictions = Vec::new();
    for (_ident, mut versions) in buckets {
        if versions.len() <= keep {
            continue;
        }
        versions.sort_by(|(_, a), (_, b)| natural_cmp(a, b));
        let cutoff = versions.len() - keep;
        for (entry, _version) in versions.into_iter().take(cutoff) {
            evictions.push(Eviction {
                key: entry.fpath.clone(),
                reason: "version now obsolete".to_string(),
            });
        }
    }
    evictions
}

/// Compute the `(entry, reason)` eviction set of `entries` under one
/// policy node. An entry appears at most once; the first applicable
/// reason wins.
pub(crate) fn get_eviction_for(
    entries: &[&CacheEntry],
    node: &PolicyNodeRef<'_>,
    now: DateTime<Utc>,
) -> Vec<Eviction> {
    if !node.enabled {
        return Vec::new();
    }

    let mut evictions: Vec<Eviction> = Vec::new();

    macro_rules! evict {
        ($entry:expr, $($reason:tt)*) => {
            evictions.push(Eviction {
                key: $entry.fpath.clone(),
                reason: format!($($reason)*),
            })
        };
    }

    // phase A: filters, each claiming matching entries in declaration order
    let mut claimed: HashSet<&Utf8Path> = HashSet::new();
    for filter in node.filters {
        let mut filter_size: u64 = 0;
        let mut filter_num: u64 = 0;
        let mut buckets: BTreeMap<String, Vec<(&CacheEntry, String)>> = BTreeMap::new();

        for entry in sort_for(filter.limits.eviction, entries.iter().copied()) {
            if !filter.matches(&entry.source) || claimed.contains(entry.fpath.as_path()) {
                continue;
            }
            claimed.insert(&entry.fpath);

            if filter.ignore {
                evict!(entry, "ignored pattern {}", filter.pattern);
                continue;
            }
            if let Some(max_age) = filter.limits.max_age {
                let cutoff =
                    now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
                if entry.added_on < cutoff {
                    evict!(
                        entry,
                        "too old for filter max_age ({})",
                        format_duration(max_age)
                    );
                    continue;
                }
            }
            if let Some(max_size) = filter.limits.max_size {
                if filter_size + entry.size > max_size {
                    evict!(
                        entry,
                        "would exceed filter max_size ({})",
                        format_size(max_size)
                    );
                    continue;
                }
            }
            if let Some(max_num) = filter.limits.max_num {
                if filter_num + 1 > max_num {
                    evict!(entry, "would exceed filter max_num ({max_num})");
                    continue;
                }
            }
            filter_size += entry.size;
            filter_num += 1;
            if filter.limits.keep_identified_versions.is_some() {
                if let Some((ident, version)) = identify_version(entry) {
                    buckets.entry(ident).or_default().push((entry, version));
                }
            }
        }

        if let Some(keep) = filter.limits.keep_identified_versions {
            evictions.extend(obsolete_versions(buckets, keep));
        }
    }

    // phase B: the node's own bounds over whatever the filters left
    let evicted_so_far: HashSet<Utf8PathBuf> = evictions.iter().map(|e| e.key.clone()).collect();
    let name = node.name;
    let mut total_size: u64 = 0;
    let mut total_num: u64 = 0;
    let mut buckets: BTreeMap<String, Vec<(&CacheEntry, String)>> = BTreeMap::new();
    for entry in sort_for(node.limits.eviction, entries.iter().copied()) {
        if evicted_so_far.contains(&entry.fpath) {
            continue;
        }
        if entry.kind == SourceKind::File && !is_http(&entry.source) {
            evict!(entry, "source protocol not cacheable");
            continue;
        }
        if let Some(max_age) = node.limits.max_age {
            let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
            if entry.added_on < cutoff {
                evict!(entry, "too old for {name} max_age ({})", format_duration(max_age));
                continue;
            }
        }
        if let Some(max_size) = node.limits.max_size {
            if total_size + entry.size > max_size {
                evict!(entry, "would exceed {name} max_size ({})", format_size(max_size));
                continue;
            }
        }
        if let Some(max_num) = node.limits.max_num {
            if total_num + 1 > max_num {
                evict!(entry, "would exceed {name} max_num ({max_num})");
                continue;
            }
        }
        total_size += entry.size;
        total_num += 1;
        if node.limits.keep_identified_versions.is_some() {
            if let Some((ident, version)) = identify_version(entry) {
                buckets.entry(ident).or_default().push((entry, version));
            }
        }
    }
    if let Some(keep) = node.limits.keep_identified_versions {
        evictions.extend(obsolete_versions(buckets, keep));
    }

    dedup_evictions(evictions)
}

/// Keep only the first eviction recorded for each key.
pub(crate) fn dedup_evictions(evictions: Vec<Eviction>) -> Vec<Eviction> {
    let mut seen: HashSet<Utf8PathBuf> = HashSet::new();
    evictions
        .into_iter()
        .filter(|e| seen.insert(e.key.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn entry(key: &str, kind: SourceKind, source: &str, size: u64, added_min: i64) -> CacheEntry {
        CacheEntry {
            fpath: key.into(),
            size,
            added_on: at(added_min),
            last_checked_on: at(added_min),
            last_used_on: at(added_min),
            nb_used: 1,
            kind,
            source: source.to_string(),
            digest: "d".to_string(),
        }
    }

    fn file_entry(key: &str, size: u64, added_min: i64) -> CacheEntry {
        entry(
            key,
            SourceKind::File,
            &format!("https://h/{key}"),
            size,
            added_min,
        )
    }

    fn node<'a>(limits: &'a Limits, filters: &'a [SubPolicyFilter]) -> PolicyNodeRef<'a> {
        PolicyNodeRef {
            name: "policy",
            enabled: true,
            limits,
            filters,
        }
    }

    fn filter_from_yaml(text: &str) -> SubPolicyFilter {
        let policy = MainPolicy::read_from(&format!("files:\n  filters:\n{text}")).unwrap();
        policy.files.filters[0].clone()
    }

    #[test]
    fn test_disabled_policy_evicts_nothing() {
        let limits = Limits {
            max_num: Some(0),
            ..Limits::default()
        };
        let entries = [file_entry("files/https/h/a", 10, 0)];
        let refs: Vec<&CacheEntry> = entries.iter().collect();
        let node = PolicyNodeRef {
            enabled: false,
            ..node(&limits, &[])
        };
        assert!(get_eviction_for(&refs, &node, at(60)).is_empty());
    }

    #[test]
    fn test_over_bound_admission_oldest() {
        // S3: max_size=100, oldest: A(60, t1), B(50, t2), candidate C(40, t3)
        let limits = Limits {
            max_size: Some(100),
            eviction: EvictionStrategy::Oldest,
            ..Limits::default()
        };
        let a = file_entry("files/https/h/a", 60, 0);
        let b = file_entry("files/https/h/b", 50, 1);
        let c = file_entry("files/https/h/c", 40, 2);
        let refs = vec![&a, &b, &c];
        let evictions = get_eviction_for(&refs, &node(&limits, &[]), at(60));
        // oldest-first admission: A(60) admitted, B(50) would overflow,
        // C(40) fits alongside A
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].key, Utf8PathBuf::from("files/https/h/b"));
        assert!(evictions[0].reason.contains("max_size"));
        let kept: u64 = [&a, &c].iter().map(|e| e.size).sum();
        assert!(kept <= 100);
    }

    #[test]
    fn test_ignore_filter() {
        // S4: an ftp:// source matching an ignore filter is always evicted
        let filter = filter_from_yaml("    - pattern: \"^ftp://\"\n      ignore: true\n");
        let filters = vec![filter];
        let limits = Limits::default();
        let e = entry("files/ftp/h/z", SourceKind::File, "ftp://h/z", 5, 0);
        let refs = vec![&e];
        let evictions = get_eviction_for(&refs, &node(&limits, &filters), at(1));
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].reason, "ignored pattern ^ftp://");
    }

    #[test]
    fn test_version_retention() {
        // S5: keep_identified_versions=2 over img:1.0 … img:2.0
        let limits = Limits {
            keep_identified_versions: Some(2),
            ..Limits::default()
        };
        let entries: Vec<CacheEntry> = ["1.0", "1.1", "1.2", "2.0"]
            .iter()
            .map(|v| {
                entry(
                    &format!("images/reg/repo/img:{v}"),
                    SourceKind::Image,
                    &format!("reg/repo/img:{v}"),
                    10,
                    0,
                )
            })
            .collect();
        let refs: Vec<&CacheEntry> = entries.iter().collect();
        let evictions = get_eviction_for(&refs, &node(&limits, &[]), at(60));
        let mut keys: Vec<String> = evictions.iter().map(|e| e.key.to_string()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["images/reg/repo/img:1.0", "images/reg/repo/img:1.1"]
        );
        assert!(evictions.iter().all(|e| e.reason == "version now obsolete"));
    }

    #[test]
    fn test_first_matching_filter_claims() {
        // an entry claimed by filter 0 is invisible to filter 1
        let f0 = filter_from_yaml("    - pattern: \"^https://h/\"\n      max_num: 1\n");
        let f1 = filter_from_yaml("    - pattern: \"^https://\"\n      ignore: true\n");
        let filters = vec![f0, f1];
        let limits = Limits::default();
        let a = file_entry("files/https/h/a", 1, 0);
        let refs = vec![&a];
        let evictions = get_eviction_for(&refs, &node(&limits, &filters), at(1));
        assert!(evictions.is_empty(), "{evictions:?}");
    }

    #[test]
    fn test_max_num_and_max_age() {
        let limits = Limits {
            max_num: Some(1),
            max_age: Some(Duration::from_secs(1800)),
            eviction: EvictionStrategy::Oldest,
            ..Limits::default()
        };
        // a is 2h older than `now`, past max_age; b and c compete on max_num
        let a = file_entry("files/https/h/a", 1, -120);
        let b = file_entry("files/https/h/b", 1, 0);
        let c = file_entry("files/https/h/c", 1, 10);
        let refs = vec![&a, &b, &c];
        let evictions = get_eviction_for(&refs, &node(&limits, &[]), at(20));
        let reasons: BTreeMap<String, String> = evictions
            .iter()
            .map(|e| (e.key.to_string(), e.reason.clone()))
            .collect();
        assert!(reasons["files/https/h/a"].contains("max_age"));
        assert!(reasons["files/https/h/c"].contains("max_num"));
        assert!(!reasons.contains_key("files/https/h/b"));
    }

    #[test]
    fn test_protocol_not_cacheable() {
        let limits = Limits::default();
        let e = entry("files/ftp/h/z", SourceKind::File, "ftp://h/z", 5, 0);
        let refs = vec![&e];
        let evictions = get_eviction_for(&refs, &node(&limits, &[]), at(1));
        assert_eq!(evictions[0].reason, "source protocol not cacheable");
    }

    #[test]
    fn test_lru_keeps_most_recently_used() {
        let limits = Limits {
            max_num: Some(2),
            eviction: EvictionStrategy::Lru,
            ..Limits::default()
        };
        let mut a = file_entry("files/https/h/a", 1, 0);
        let mut b = file_entry("files/https/h/b", 1, 0);
        let mut c = file_entry("files/https/h/c", 1, 0);
        a.last_used_on = at(10);
        b.last_used_on = at(30);
        c.last_used_on = at(20);
        let refs = vec![&a, &b, &c];
        let evictions = get_eviction_for(&refs, &node(&limits, &[]), at(60));
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].key, Utf8PathBuf::from("files/https/h/a"));
    }

    #[test]
    fn test_sort_disciplines() {
        let mut a = file_entry("files/https/h/a", 30, 0);
        let b = file_entry("files/https/h/b", 10, 1);
        let c = file_entry("files/https/h/c", 20, 2);
        a.last_used_on = at(99);
        let entries = [&a, &b, &c];

        fn keys(v: Vec<&CacheEntry>) -> Vec<&str> {
            v.into_iter().map(|e| e.fpath.as_str()).collect()
        }
        assert_eq!(
            keys(sort_for(EvictionStrategy::Oldest, entries.iter().copied()))[0],
            "files/https/h/a"
        );
        assert_eq!(
            keys(sort_for(EvictionStrategy::Newest, entries.iter().copied()))[0],
            "files/https/h/c"
        );
        assert_eq!(
            keys(sort_for(EvictionStrategy::Largest, entries.iter().copied()))[0],
            "files/https/h/b"
        );
        assert_eq!(
            keys(sort_for(EvictionStrategy::Smallest, entries.iter().copied()))[0],
            "files/https/h/a"
        );
        assert_eq!(
            keys(sort_for(EvictionStrategy::Lru, entries.iter().copied()))[0],
            "files/https/h/a"
        );
    }

    #[test]
    fn test_surviving_entries_satisfy_bounds() {
        let limits = Limits {
            max_size: Some(55),
            max_num: Some(4),
            eviction: EvictionStrategy::Smallest,
            ..Limits::default()
        };
        let entries: Vec<CacheEntry> = (0..8)
            .map(|i| file_entry(&format!("files/https/h/f{i}"), 10 + i, i as i64))
            .collect();
        let refs: Vec<&CacheEntry> = entries.iter().collect();
        let evictions = get_eviction_for(&refs, &node(&limits, &[]), at(60));
        let evicted: HashSet<&Utf8Path> =
            evictions.iter().map(|e| e.key.as_path()).collect();
        let kept: Vec<&CacheEntry> = entries
            .iter()
            .filter(|e| !evicted.contains(e.fpath.as_path()))
            .collect();
        assert!(kept.iter().map(|e| e.size).sum::<u64>() <= 55);
        assert!(kept.len() as u64 <= 4);
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("1.9", "1.10"), Ordering::Less);
        assert_eq!(natural_cmp("2.0", "10.0"), Ordering::Less);
        assert_eq!(natural_cmp("2024-05", "2024-11"), Ordering::Less);
        assert_eq!(natural_cmp("1.0", "1.0"), Ordering::Equal);
        assert_eq!(natural_cmp("1.0a", "1.0b"), Ordering::Less);
    }

    #[test]
    fn test_identify_version() {
        let img = entry("images/reg/repo/img:1.2", SourceKind::Image, "reg/repo/img:1.2", 1, 0);
        assert_eq!(
            identify_version(&img),
            Some(("img".to_string(), "1.2".to_string()))
        );
        let zim = entry(
            "files/https/h/wikipedia_en_2024-05.zim",
            SourceKind::File,
            "https://h/wikipedia_en_2024-05.zim",
            1,
            0,
        );
        assert_eq!(
            identify_version(&zim),
            Some(("wikipedia_en".to_string(), "2024-05".to_string()))
        );
        let plain = file_entry("files/https/h/a.bin", 1, 0);
        assert_eq!(identify_version(&plain), None);
    }
}
