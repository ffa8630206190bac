//! Cache retention policy: a hierarchy of bounds applied to cache content.
//!
//! A main policy carries global bounds and two per-kind subpolicies
//! (`oci_images`, `files`); each subpolicy may carry pattern-scoped
//! filters. A child bound may never exceed its parent's.

use std::fmt::Display;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer};

use crate::sources::SourceKind;

/// Ordering used to prioritize entries for retention when a bound is
/// tight; entries sorted first are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EvictionStrategy {
    /// Keep older entries, evict recent ones last in.
    Oldest,
    /// Keep the most recently added.
    Newest,
    /// Keep small entries, evict the large ones.
    Largest,
    /// Keep large entries, evict the small ones.
    Smallest,
    /// Keep the most recently used.
    #[default]
    Lru,
}

impl EvictionStrategy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::Oldest => "oldest",
            EvictionStrategy::Newest => "newest",
            EvictionStrategy::Largest => "largest",
            EvictionStrategy::Smallest => "smallest",
            EvictionStrategy::Lru => "lru",
        }
    }
}

impl Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBound {
    Int(i64),
    Str(String),
}

fn deserialize_size_bound<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    use serde::de::Error;
    match Option::<RawBound>::deserialize(deserializer)? {
        None => Ok(None),
        // zero means "unset"
        Some(RawBound::Int(0)) => Ok(None),
        Some(RawBound::Int(v)) if v < 0 => Err(Error::custom(format!(
            "Invalid negative value `{v}` for a size bound"
        ))),
        Some(RawBound::Int(v)) => Ok(Some(v as u64)),
        Some(RawBound::Str(s)) => imager_utils::parse_size(&s).map(Some).map_err(Error::custom),
    }
}

fn deserialize_age_bound<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    use serde::de::Error;
    match Option::<RawBound>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawBound::Int(0)) => Ok(None),
        Some(RawBound::Int(v)) if v < 0 => Err(Error::custom(format!(
            "Invalid negative value `{v}` for an age bound"
        ))),
        Some(RawBound::Int(v)) => Ok(Some(Duration::from_secs(v as u64))),
        Some(RawBound::Str(s)) => imager_utils::parse_duration(&s)
            .map(Some)
            .map_err(Error::custom),
    }
}

/// Bounds shared by every level of the policy tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Limits {
    /// Maximum cumulated size in bytes; accepts human units, `0` unsets.
    #[serde(default, deserialize_with = "deserialize_size_bound")]
    pub(crate) max_size: Option<u64>,
    /// Maximum entry age; accepts seconds or human durations.
    #[serde(default, deserialize_with = "deserialize_age_bound")]
    pub(crate) max_age: Option<Duration>,
    /// Maximum number of entries.
    #[serde(default)]
    pub(crate) max_num: Option<u64>,
    #[serde(default)]
    pub(crate) eviction: EvictionStrategy,
    /// How long a successful outdacy check remains valid.
    #[serde(default, deserialize_with = "deserialize_age_bound")]
    pub(crate) check_after: Option<Duration>,
    /// Keep only the N naturally-highest versions per identified series.
    #[serde(default)]
    pub(crate) keep_identified_versions: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// A pattern-scoped rule inside a subpolicy.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubPolicyFilter {
    /// Case-insensitive regular expression matched against the start of
    /// the entry source identifier.
    pub(crate) pattern: String,
    /// Entries matching this filter are never cached.
    #[serde(default)]
    pub(crate) ignore: bool,
    #[serde(flatten)]
    pub(crate) limits: Limits,
    #[serde(skip)]
    regex: Option<Regex>,
}

impl SubPolicyFilter {
    fn compile(&mut self) -> Result<()> {
        // anchored at the start, like the original matching rule
        let regex = RegexBuilder::new(&format!("^(?:{})", self.pattern))
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid filter pattern `{}`", self.pattern))?;
        self.regex = Some(regex);
        Ok(())
    }

    /// Whether this filter claims the given source identifier.
    pub(crate) fn matches(&self, source: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(source))
    }
}

/// Per-kind policy node: bounds plus an ordered filter list.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubPolicy {
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) filters: Vec<SubPolicyFilter>,
    #[serde(flatten)]
    pub(crate) limits: Limits,
}

impl Default for SubPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: Vec::new(),
            limits: Limits::default(),
        }
    }
}

/// The root of the policy tree, read from `policy.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MainPolicy {
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) oci_images: SubPolicy,
    #[serde(default)]
    pub(crate) files: SubPolicy,
    #[serde(flatten)]
    pub(crate) limits: Limits,
}

impl MainPolicy {
    /// The policy applied when the cache directory has no `policy.yaml`.
    pub(crate) fn defaults() -> Self {
        Self {
            enabled: true,
            oci_images: SubPolicy::default(),
            files: SubPolicy::default(),
            limits: Limits {
                max_size: Some(10 * 1024 * 1024 * 1024),
                eviction: EvictionStrategy::Lru,
                ..Limits::default()
            },
        }
    }

    /// A cache-less policy.
    pub(crate) fn disabled() -> Self {
        Self {
            enabled: false,
            oci_images: SubPolicy::default(),
            files: SubPolicy::default(),
            limits: Limits::default(),
        }
    }

    /// Parse a policy from its YAML text and validate the hierarchy.
    #[context("Reading cache policy")]
    pub(crate) fn read_from(text: &str) -> Result<Self> {
        let mut policy: MainPolicy = serde_yaml::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&mut self) -> Result<()> {
        for (name, sub) in [
            ("oci_images", &mut self.oci_images),
            ("files", &mut self.files),
        ] {
            check_not_exceeding(&sub.limits, name, &self.limits, "policy")?;
            for (idx, filter) in sub.filters.iter_mut().enumerate() {
                filter.compile()?;
                check_not_exceeding(
                    &filter.limits,
                    &format!("{name}.filters[{idx}]"),
                    &sub.limits,
                    name,
                )?;
            }
        }
        Ok(())
    }

    /// The subpolicy governing entries of the given kind.
    pub(crate) fn sub_for(&self, kind: SourceKind) -> &SubPolicy {
        match kind {
            SourceKind::Image => &self.oci_images,
            SourceKind::File => &self.files,
        }
    }

    /// Effective outdacy-check validity for an entry: the first matching
    /// filter wins, then the subpolicy, then the main policy.
    pub(crate) fn check_after_for(&self, kind: SourceKind, source: &str) -> Option<Duration> {
        let sub = self.sub_for(kind);
        for filter in &sub.filters {
            if filter.matches(source) {
                if let Some(d) = filter.limits.check_after {
                    return Some(d);
                }
                break;
            }
        }
        sub.limits.check_after.or(self.limits.check_after)
    }
}

fn check_not_exceeding(
    child: &Limits,
    child_name: &str,
    parent: &Limits,
    parent_name: &str,
) -> Result<()> {
    if let (Some(c), Some(p)) = (child.max_size, parent.max_size) {
        if c > p {
            bail!("{child_name}.max_size ({c}) exceeds {parent_name}.max_size ({p})");
        }
    }
    if let (Some(c), Some(p)) = (child.max_age, parent.max_age) {
        if c > p {
            bail!(
                "{child_name}.max_age ({}) exceeds {parent_name}.max_age ({})",
                c.as_secs(),
                p.as_secs()
            );
        }
    }
    if let (Some(c), Some(p)) = (child.max_num, parent.max_num) {
        if c > p {
            bail!("{child_name}.max_num ({c}) exceeds {parent_name}.max_num ({p})");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_defaults() {
        let policy = MainPolicy::defaults();
        assert!(policy.enabled);
        assert_eq!(policy.limits.max_size, Some(10 * 1024 * 1024 * 1024));
        assert_eq!(policy.limits.eviction, EvictionStrategy::Lru);
        assert!(policy.oci_images.enabled && policy.oci_images.limits.max_size.is_none());
    }

    #[test]
    fn test_read_full() {
        let policy = MainPolicy::read_from(indoc! { r#"
            enabled: true
            max_size: 30GiB
            max_age: 180d
            eviction: lru
            some_future_key: ignored
            oci_images:
              max_size: 10GiB
              keep_identified_versions: 2
            files:
              max_size: 20GiB
              eviction: largest
              filters:
                - pattern: "^https://mirror\\."
                  max_size: 5GiB
                  check_after: 7d
                - pattern: "^ftp://"
                  ignore: true
        "# })
        .unwrap();
        assert_eq!(policy.limits.max_size, Some(30 * 1024 * 1024 * 1024));
        assert_eq!(
            policy.limits.max_age,
            Some(Duration::from_secs(180 * 24 * 3600))
        );
        assert_eq!(policy.oci_images.limits.keep_identified_versions, Some(2));
        assert_eq!(policy.files.limits.eviction, EvictionStrategy::Largest);
        let filters = &policy.files.filters;
        assert_eq!(filters.len(), 2);
        assert!(filters[0].matches("https://MIRROR.example.org/x"));
        assert!(!filters[0].matches("https://other.example.org/x"));
        assert!(filters[1].ignore);
        assert_eq!(
            policy.check_after_for(SourceKind::File, "https://mirror.example.org/x"),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(policy.check_after_for(SourceKind::File, "https://h/x"), None);
    }

    #[test]
    fn test_sub_exceeds_main() {
        let err = MainPolicy::read_from(indoc! { r#"
            max_size: 10GiB
            files:
              max_size: 20GiB
        "# })
        .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds"));
    }

    #[test]
    fn test_filter_exceeds_sub() {
        let err = MainPolicy::read_from(indoc! { r#"
            files:
              max_num: 10
              filters:
                - pattern: ".*"
                  max_num: 100
        "# })
        .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds"));
    }

    #[test]
    fn test_zero_unsets_and_negative_rejected() {
        let policy = MainPolicy::read_from("max_size: 0\nmax_age: 0\n").unwrap();
        assert_eq!(policy.limits.max_size, None);
        assert_eq!(policy.limits.max_age, None);
        assert!(MainPolicy::read_from("max_size: -5\n").is_err());
    }

    #[test]
    fn test_age_accepts_seconds() {
        let policy = MainPolicy::read_from("max_age: 3600\n").unwrap();
        assert_eq!(policy.limits.max_age, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_bad_eviction_rejected() {
        assert!(MainPolicy::read_from("eviction: biggest\n").is_err());
    }

    #[test]
    fn test_filters_must_be_list_of_dicts() {
        assert!(MainPolicy::read_from("files:\n  filters: nope\n").is_err());
        assert!(MainPolicy::read_from("files:\n  filters:\n    - just-a-string\n").is_err());
    }

    #[test]
    fn test_missing_subpolicy_defaults() {
        let policy = MainPolicy::read_from("max_size: 1GiB\n").unwrap();
        assert!(policy.files.enabled);
        assert!(policy.files.filters.is_empty());
    }
}
