//! On-disk layout of the cache: deterministic relative keys derived from
//! source identity, and sidecar metadata persisted as user extended
//! attributes on the artifact files.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use url::Url;

use crate::sources::{FileSource, ImageSource, Source, SourceKind};

/// Reserved filename at the cache root; never treated as an entry.
pub(crate) const POLICY_FILENAME: &str = "policy.yaml";

// Namespace prefix for our attributes; callers only ever see the bare keys.
const XATTR_PREFIX: &str = "user.imager.";

const ATTR_ADDED_ON: &str = "added_on";
const ATTR_LAST_CHECKED_ON: &str = "last_checked_on";
const ATTR_LAST_USED_ON: &str = "last_used_on";
const ATTR_NB_USED: &str = "nb_used";
const ATTR_SOURCE: &str = "source";
const ATTR_DIGEST: &str = "digest";

/// Cache-relative path for any source.
pub(crate) fn key_for(source: &Source) -> Utf8PathBuf {
    match source {
        Source::File(f) => key_for_file(f),
        Source::Image(i) => key_for_image(i),
    }
}

/// Cache-relative path for a file: scheme, host and path directories,
/// with query and fragment folded into the basename for uniqueness.
pub(crate) fn key_for_file(file: &FileSource) -> Utf8PathBuf {
    let url = match &file.url {
        Some(url) => url,
        // plain content is never cached; give it a stable bogus key
        None => return Utf8PathBuf::from("files/-/-/__PLAIN__"),
    };
    key_for_url(url)
}

fn key_for_url(url: &Url) -> Utf8PathBuf {
    let mut key = Utf8PathBuf::from("files");
    key.push(url.scheme());
    let host = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => "-".to_string(),
    };
    key.push(host);

    // normalize the path, dropping dot segments
    let mut parts: Vec<&str> = Vec::new();
    for segment in url.path_segments().into_iter().flatten() {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut basename = parts.pop().unwrap_or("__ROOT__").to_string();
    for part in parts {
        key.push(part);
    }
    if let Some(query) = url.query() {
        basename.push('?');
        basename.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        basename.push('#');
        basename.push_str(fragment);
    }
    key.push(basename);
    key
}

/// Cache-relative path for an image archive.
pub(crate) fn key_for_image(image: &ImageSource) -> Utf8PathBuf {
    let oci = &image.oci;
    let mut fname = oci.name.clone();
    if let Some(tag) = &oci.tag {
        fname.push(':');
        fname.push_str(tag);
    }
    if let Some(digest) = &oci.digest {
        fname.push('@');
        fname.push_str(digest);
    }
    Utf8PathBuf::from("images")
        .join(&oci.registry)
        .join(&oci.repository)
        .join(fname)
}

fn get_attr(fpath: &Utf8Path, key: &str) -> Result<String> {
    let name = format!("{XATTR_PREFIX}{key}");
    let value = xattr::get(fpath.as_std_path(), &name)
        .with_context(|| format!("Reading attribute {key} of {fpath}"))?
        .ok_or_else(|| anyhow!("{fpath} has no {key} attribute"))?;
    String::from_utf8(value).with_context(|| format!("Decoding attribute {key} of {fpath}"))
}

fn set_attr(fpath: &Utf8Path, key: &str, value: &str) -> Result<()> {
    let name = format!("{XATTR_PREFIX}{key}");
    xattr::set(fpath.as_std_path(), &name, value.as_bytes())
        .with_context(|| format!("Writing attribute {key} of {fpath}"))
}

/// Whether this file looks like a cache entry (carries a digest attribute).
pub(crate) fn file_is_entry(fpath: &Utf8Path) -> bool {
    let name = format!("{XATTR_PREFIX}{ATTR_DIGEST}");
    matches!(xattr::get(fpath.as_std_path(), &name), Ok(Some(_)))
}

/// Whether the filesystem holding `dir` supports user extended attributes,
/// probed by writing one and reading it back.
pub(crate) fn supports_xattr(dir: &Utf8Path) -> Result<bool> {
    let probe = tempfile::NamedTempFile::new_in(dir.as_std_path())
        .with_context(|| format!("Creating probe file in {dir}"))?;
    let name = format!("{XATTR_PREFIX}probe");
    if xattr::set(probe.path(), &name, b"probe").is_err() {
        return Ok(false);
    }
    Ok(matches!(xattr::get(probe.path(), &name), Ok(Some(v)) if v == b"probe"))
}

fn parse_dt(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Parsing timestamp `{value}`"))?
        .with_timezone(&Utc))
}

/// The sidecar metadata set attached to every cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryMetadata {
    pub(crate) added_on: DateTime<Utc>,
    pub(crate) last_checked_on: DateTime<Utc>,
    pub(crate) last_used_on: DateTime<Utc>,
    pub(crate) nb_used: u64,
    pub(crate) kind: SourceKind,
    pub(crate) source: String,
    pub(crate) digest: String,
}

impl EntryMetadata {
    /// Read the full metadata set from an on-disk artifact.
    pub(crate) fn read_from(fpath: &Utf8Path) -> Result<Self> {
        let added_on = parse_dt(&get_attr(fpath, ATTR_ADDED_ON)?)?;
        // entries written before outdacy caching lack the attribute
        let last_checked_on = match get_attr(fpath, ATTR_LAST_CHECKED_ON) {
            Ok(v) => parse_dt(&v)?,
            Err(_) => added_on,
        };
        let last_used_on = parse_dt(&get_attr(fpath, ATTR_LAST_USED_ON)?)?;
        let nb_used = get_attr(fpath, ATTR_NB_USED)?
            .parse::<u64>()
            .with_context(|| format!("Parsing nb_used of {fpath}"))?;
        let source_field = get_attr(fpath, ATTR_SOURCE)?;
        let (kind, source) = source_field
            .split_once(':')
            .ok_or_else(|| anyhow!("Malformed source attribute on {fpath}"))?;
        Ok(Self {
            added_on,
            last_checked_on,
            last_used_on,
            nb_used,
            kind: SourceKind::parse(kind)?,
            source: source.to_string(),
            digest: get_attr(fpath, ATTR_DIGEST)?,
        })
    }

    /// Persist the full metadata set onto an on-disk artifact.
    pub(crate) fn write_to(&self, fpath: &Utf8Path) -> Result<()> {
        set_attr(fpath, ATTR_ADDED_ON, &self.added_on.to_rfc3339())?;
        set_attr(
            fpath,
            ATTR_LAST_CHECKED_ON,
            &self.last_checked_on.to_rfc3339(),
        )?;
        set_attr(fpath, ATTR_LAST_USED_ON, &self.last_used_on.to_rfc3339())?;
        set_attr(fpath, ATTR_NB_USED, &self.nb_used.to_string())?;
        set_attr(fpath, ATTR_SOURCE, &format!("{}:{}", self.kind, self.source))?;
        set_attr(fpath, ATTR_DIGEST, &self.digest)
    }

    /// Persist only the usage counters.
    pub(crate) fn write_usage_to(&self, fpath: &Utf8Path) -> Result<()> {
        set_attr(fpath, ATTR_NB_USED, &self.nb_used.to_string())?;
        set_attr(fpath, ATTR_LAST_USED_ON, &self.last_used_on.to_rfc3339())
    }

    /// Persist only the outdacy-check timestamp.
    pub(crate) fn write_last_checked_to(&self, fpath: &Utf8Path) -> Result<()> {
        set_attr(
            fpath,
            ATTR_LAST_CHECKED_ON,
            &self.last_checked_on.to_rfc3339(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ExpandMethod, ImageRef};

    fn file_source(url: &str) -> FileSource {
        FileSource {
            to: "/data/x".into(),
            url: Some(Url::parse(url).unwrap()),
            content: None,
            via: ExpandMethod::Direct,
            checksum: None,
            size: None,
        }
    }

    #[test]
    fn test_key_for_file() {
        let f = file_source("https://mirror.download.kiwix.org/zim/wikipedia/x.zim");
        assert_eq!(
            key_for_file(&f),
            Utf8PathBuf::from("files/https/mirror.download.kiwix.org/zim/wikipedia/x.zim")
        );

        let f = file_source("http://host:8080/");
        assert_eq!(
            key_for_file(&f),
            Utf8PathBuf::from("files/http/host:8080/__ROOT__")
        );

        let f = file_source("https://host/a/b.bin?rev=2#frag");
        assert_eq!(
            key_for_file(&f),
            Utf8PathBuf::from("files/https/host/a/b.bin?rev=2#frag")
        );
    }

    #[test]
    fn test_key_stability() {
        let a = file_source("https://host/a/b.bin?rev=2");
        let b = file_source("https://host/a/b.bin?rev=2");
        assert_eq!(key_for_file(&a), key_for_file(&b));
        let c = file_source("https://host/a/b.bin?rev=3");
        assert_ne!(key_for_file(&a), key_for_file(&c));
    }

    #[test]
    fn test_key_for_image() {
        let image = ImageSource {
            oci: ImageRef::parse("ghcr.io/offspot/kiwix-serve:3.5.0").unwrap(),
            filesize: 1,
            fullsize: 1,
        };
        assert_eq!(
            key_for_image(&image),
            Utf8PathBuf::from("images/ghcr.io/offspot/kiwix-serve:3.5.0")
        );
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        if !supports_xattr(dir_path).unwrap_or(false) {
            eprintln!("skipping: no user xattr support on {dir_path}");
            return;
        }
        let fpath = dir_path.join("artifact.bin");
        std::fs::write(&fpath, b"data").unwrap();
        assert!(!file_is_entry(&fpath));

        let now = Utc::now();
        let meta = EntryMetadata {
            added_on: now,
            last_checked_on: now,
            last_used_on: now,
            nb_used: 1,
            kind: SourceKind::File,
            source: "https://host/a.bin".to_string(),
            digest: "abc".to_string(),
        };
        meta.write_to(&fpath).unwrap();
        assert!(file_is_entry(&fpath));
        let read = EntryMetadata::read_from(&fpath).unwrap();
        assert_eq!(read.nb_used, 1);
        assert_eq!(read.kind, SourceKind::File);
        assert_eq!(read.source, "https://host/a.bin");
        assert_eq!(read.digest, "abc");
    }
}
