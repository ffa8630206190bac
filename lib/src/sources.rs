//! Model of the acquirable artifacts declared by a configuration:
//! plain files, local or remote files, and OCI images.

use std::fmt::Display;

use anyhow::{anyhow, bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use url::Url;

/// Mount point of the data partition on the final device. Destinations in
/// the configuration and in the UI are expressed under this root.
pub(crate) const DATA_PART_PATH: &str = "/data";

/// Kind discriminant shared by cache entries and sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    /// A file downloaded or copied onto the data partition.
    File,
    /// An OCI image exported as a docker-style tar.
    Image,
}

impl SourceKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Image => "image",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(SourceKind::File),
            "image" => Ok(SourceKind::Image),
            o => Err(anyhow!("unknown source kind {o:?}")),
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a fetched file is turned into its destination content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ExpandMethod {
    /// Written to the destination as-is.
    #[default]
    Direct,
    /// Expanded as a zip archive into the destination directory.
    Unzip,
    /// Expanded as a (possibly compressed) tar archive.
    Untar,
}

/// A file to place onto the data partition, from inline content, a local
/// path or a remote URL.
#[derive(Debug, Clone)]
pub(crate) struct FileSource {
    /// Absolute destination on the final device, under [`DATA_PART_PATH`].
    pub(crate) to: Utf8PathBuf,
    pub(crate) url: Option<Url>,
    pub(crate) content: Option<String>,
    pub(crate) via: ExpandMethod,
    pub(crate) checksum: Option<String>,
    /// Source size in bytes; declared in the configuration or probed
    /// remotely during validation.
    pub(crate) size: Option<u64>,
}

impl FileSource {
    /// Whether this is inline text content rather than a fetchable source.
    pub(crate) fn is_plain(&self) -> bool {
        self.content.is_some()
    }

    /// Whether this references a file on the local filesystem.
    pub(crate) fn is_local(&self) -> bool {
        !self.is_plain() && self.url.as_ref().is_some_and(|u| u.scheme() == "file")
    }

    /// Whether this references a remote resource.
    pub(crate) fn is_remote(&self) -> bool {
        !self.is_plain() && self.url.as_ref().is_some_and(|u| u.scheme() != "file")
    }

    pub(crate) fn is_direct(&self) -> bool {
        self.via == ExpandMethod::Direct
    }

    /// The URL as a string; empty for plain content.
    pub(crate) fn url_str(&self) -> &str {
        self.url.as_ref().map(|u| u.as_str()).unwrap_or("")
    }

    /// Local filesystem path of a `file://` source.
    pub(crate) fn local_path(&self) -> Result<Utf8PathBuf> {
        let url = self.url.as_ref().ok_or_else(|| anyhow!("not a local file"))?;
        if url.scheme() != "file" {
            bail!("{url} is not a file:// URL");
        }
        Ok(Utf8PathBuf::from(url.path()))
    }

    /// Destination path of this file inside a mounted data partition.
    pub(crate) fn mounted_to(&self, mount_point: &Utf8Path) -> Utf8PathBuf {
        let relative = self
            .to
            .strip_prefix(DATA_PART_PATH)
            .unwrap_or(self.to.as_path());
        mount_point.join(relative)
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
}

/// An OCI image reference broken into its registry coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageRef {
    pub(crate) registry: String,
    pub(crate) repository: String,
    pub(crate) name: String,
    pub(crate) tag: Option<String>,
    pub(crate) digest: Option<String>,
}

impl ImageRef {
    /// Parse a docker-style reference such as
    /// `ghcr.io/offspot/kiwix-serve:3.5.0` or `library/busybox@sha256:…`.
    pub(crate) fn parse(ident: &str) -> Result<Self> {
        if ident.is_empty() {
            bail!("empty image reference");
        }
        let (rest, digest) = match ident.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (ident, None),
        };
        // a colon after the last slash is a tag separator; earlier ones
        // belong to a registry port
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (rest, tag) = match rest[last_slash..].split_once(':') {
            Some((name, t)) => (
                format!("{}{}", &rest[..last_slash], name),
                Some(t.to_string()),
            ),
            None => (rest.to_string(), None),
        };
        let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            bail!("invalid image reference `{ident}`");
        }
        let registry = if segments.len() > 1
            && (segments[0].contains('.') || segments[0].contains(':') || segments[0] == "localhost")
        {
            segments.remove(0).to_string()
        } else {
            "docker.io".to_string()
        };
        let name = segments
            .pop()
            .ok_or_else(|| anyhow!("invalid image reference `{ident}`"))?
            .to_string();
        let repository = if segments.is_empty() {
            "library".to_string()
        } else {
            segments.join("/")
        };
        Ok(Self {
            registry,
            repository,
            name,
            tag,
            digest,
        })
    }

    /// Filename-safe identifier used for the exported tar.
    pub(crate) fn fs_name(&self) -> String {
        let mut name = self.name.clone();
        if let Some(tag) = &self.tag {
            name.push('_');
            name.push_str(tag);
        }
        name.replace(['/', ':', '@'], "_")
    }
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.registry, self.repository, self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// An OCI image to export onto the data partition. Sizes are declared in
/// the configuration (measured offline) since registries do not expose
/// the expanded size.
#[derive(Debug, Clone)]
pub(crate) struct ImageSource {
    pub(crate) oci: ImageRef,
    /// Size in bytes of the exported tar.
    pub(crate) filesize: u64,
    /// Size in bytes once loaded into the container engine.
    pub(crate) fullsize: u64,
}

impl ImageSource {
    pub(crate) fn identifier(&self) -> String {
        self.oci.to_string()
    }
}

/// A tagged reference to either declared source, as handed to the cache.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Source<'a> {
    File(&'a FileSource),
    Image(&'a ImageSource),
}

impl Source<'_> {
    pub(crate) fn kind(&self) -> SourceKind {
        match self {
            Source::File(_) => SourceKind::File,
            Source::Image(_) => SourceKind::Image,
        }
    }

    /// The canonical identifier recorded as the entry source.
    pub(crate) fn identifier(&self) -> String {
        match self {
            Source::File(f) => f.url_str().to_string(),
            Source::Image(i) => i.identifier(),
        }
    }

    /// Size in bytes of the artifact as it would land in the cache.
    pub(crate) fn size(&self) -> u64 {
        match self {
            Source::File(f) => f.size(),
            Source::Image(i) => i.filesize,
        }
    }
}

/// An image platform, `os/arch[/variant]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Platform {
    pub(crate) os: String,
    pub(crate) arch: String,
    pub(crate) variant: Option<String>,
}

/// The `platform` field of a manifest-list entry.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ManifestPlatform {
    #[serde(default)]
    pub(crate) os: String,
    #[serde(default)]
    pub(crate) architecture: String,
    #[serde(default)]
    pub(crate) variant: Option<String>,
}

impl Platform {
    /// The single platform targeted by produced images.
    pub(crate) fn target() -> Self {
        Self::parse("linux/arm64/v8").expect("static platform")
    }

    /// What registries assume when a manifest carries no platform data.
    pub(crate) fn registry_default() -> Self {
        Self::parse("linux/amd64").expect("static platform")
    }

    pub(crate) fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("invalid platform `{s}`"))?;
        let arch = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("invalid platform `{s}`"))?;
        let variant = parts.next().map(ToString::to_string);
        if parts.next().is_some() {
            bail!("invalid platform `{s}`");
        }
        Ok(Self {
            os: os.to_string(),
            arch: arch.to_string(),
            variant,
        })
    }

    /// Whether a manifest-list entry targets this platform. A missing
    /// variant on either side matches any variant.
    pub(crate) fn matches(&self, other: &ManifestPlatform) -> bool {
        if self.os != other.os || self.arch != other.architecture {
            return false;
        }
        match (&self.variant, &other.variant) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(url: &str) -> FileSource {
        FileSource {
            to: "/data/content/f.bin".into(),
            url: Some(Url::parse(url).unwrap()),
            content: None,
            via: ExpandMethod::Direct,
            checksum: None,
            size: None,
        }
    }

    #[test]
    fn test_image_ref_parse() {
        let r = ImageRef::parse("ghcr.io/offspot/kiwix-serve:3.5.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "offspot");
        assert_eq!(r.name, "kiwix-serve");
        assert_eq!(r.tag.as_deref(), Some("3.5.0"));
        assert_eq!(r.digest, None);
        assert_eq!(r.to_string(), "ghcr.io/offspot/kiwix-serve:3.5.0");

        let r = ImageRef::parse("busybox").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library");
        assert_eq!(r.name, "busybox");
        assert_eq!(r.tag, None);

        let r = ImageRef::parse("localhost:5000/a/b/c:1.2@sha256:abcd").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "a/b");
        assert_eq!(r.name, "c");
        assert_eq!(r.tag.as_deref(), Some("1.2"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));

        assert!(ImageRef::parse("").is_err());
    }

    #[test]
    fn test_fs_name() {
        let r = ImageRef::parse("ghcr.io/offspot/kiwix-serve:3.5.0").unwrap();
        assert_eq!(r.fs_name(), "kiwix-serve_3.5.0");
    }

    #[test]
    fn test_file_classification() {
        let f = file("https://host/f.bin");
        assert!(f.is_remote() && !f.is_local() && !f.is_plain());

        let f = file("file:///tmp/f.bin");
        assert!(f.is_local() && !f.is_remote());
        assert_eq!(f.local_path().unwrap(), Utf8PathBuf::from("/tmp/f.bin"));

        let f = FileSource {
            to: "/data/readme.txt".into(),
            url: None,
            content: Some("hello".into()),
            via: ExpandMethod::Direct,
            checksum: None,
            size: None,
        };
        assert!(f.is_plain() && !f.is_local() && !f.is_remote());
    }

    #[test]
    fn test_mounted_to() {
        let f = file("https://host/f.bin");
        assert_eq!(
            f.mounted_to(Utf8Path::new("/mnt/part3_x")),
            Utf8PathBuf::from("/mnt/part3_x/content/f.bin")
        );
    }

    #[test]
    fn test_platform() {
        let p = Platform::target();
        assert_eq!(p.to_string(), "linux/arm64/v8");
        let m: ManifestPlatform = serde_json::from_str(
            r#"{"os": "linux", "architecture": "arm64", "variant": "v8"}"#,
        )
        .unwrap();
        assert!(p.matches(&m));
        let m: ManifestPlatform =
            serde_json::from_str(r#"{"os": "linux", "architecture": "arm64"}"#).unwrap();
        assert!(p.matches(&m));
        let m: ManifestPlatform =
            serde_json::from_str(r#"{"os": "linux", "architecture": "amd64"}"#).unwrap();
        assert!(!p.matches(&m));
    }
}
