//! The YAML configuration document describing an image to assemble.

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::sources::{ExpandMethod, FileSource, ImageRef, ImageSource, DATA_PART_PATH};

/// Where shorthand `base` versions are resolved.
const BASE_URL_PREFIX: &str = "https://drive.offspot.it/base";

/// Capacity estimate for the uncompressed rootfs of official base images;
/// used for size planning before the base is fetched.
pub(crate) const BASE_ROOTFS_SIZE: u64 = 2_684_354_560;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDoc {
    base: String,
    #[serde(default)]
    output: OutputConfig,
    oci_images: Vec<OCIImageConfig>,
    files: Vec<FileConfig>,
    #[serde(default)]
    offspot: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSize {
    Int(u64),
    Str(String),
}

fn deserialize_output_size<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    use serde::de::Error;
    match Option::<RawSize>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawSize::Int(v)) => Ok(Some(v)),
        Some(RawSize::Str(s)) if s == "auto" => Ok(None),
        Some(RawSize::Str(s)) => imager_utils::parse_size(&s).map(Some).map_err(Error::custom),
    }
}

/// The `output` section: target size and post-processing switches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct OutputConfig {
    /// Requested image size in bytes; `None` (or `"auto"`) sizes to fit.
    #[serde(default, deserialize_with = "deserialize_output_size")]
    pub(crate) size: Option<u64>,
    #[serde(default)]
    pub(crate) shrink: bool,
    #[serde(default)]
    pub(crate) compress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OCIImageConfig {
    ident: String,
    #[serde(default)]
    #[allow(dead_code)] // accepted for compatibility; export always goes through the registry
    url: Option<String>,
    filesize: u64,
    fullsize: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    to: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    via: Option<ExpandMethod>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    checksum: Option<String>,
}

/// The base image to start from.
#[derive(Debug, Clone)]
pub(crate) struct BaseImage {
    pub(crate) file: FileSource,
    /// Size of the base rootfs once written to the target.
    pub(crate) rootfs_size: u64,
}

/// A parsed and validated configuration document.
#[derive(Debug, Clone)]
pub(crate) struct MainConfig {
    pub(crate) base: BaseImage,
    pub(crate) output: OutputConfig,
    pub(crate) oci_images: Vec<ImageSource>,
    pub(crate) files: Vec<FileSource>,
    pub(crate) offspot: serde_yaml::Mapping,
}

/// Infer the base URL from the flexible `base` value: a full URL, a local
/// path, or a shorthand `X.Y.Z[suffix]` resolved against the official prefix.
fn base_url_from(value: &str) -> Result<Url> {
    let version_re = Regex::new(r"^(?P<version>\d\.\d\.\d)(?P<extra>[a-z0-9\-\._]*)$")
        .expect("static regex");
    if let Some(m) = version_re.captures(value) {
        let url = format!(
            "{BASE_URL_PREFIX}/base-image-{}{}.img.xz",
            &m["version"], &m["extra"]
        );
        return Url::parse(&url).with_context(|| format!("Resolving base shorthand `{value}`"));
    }
    if value.contains("://") {
        return Url::parse(value).with_context(|| format!("Parsing base URL `{value}`"));
    }
    // a bare path refers to a local image file
    let path = std::path::absolute(value).with_context(|| format!("Resolving base path `{value}`"))?;
    Url::from_file_path(&path).map_err(|_| anyhow!("Invalid base path `{value}`"))
}

impl MainConfig {
    /// Parse a configuration from its YAML text and validate it.
    #[context("Parsing configuration")]
    pub(crate) fn read_from(text: &str) -> Result<Self> {
        let doc: ConfigDoc = serde_yaml::from_str(text)?;

        let base_url = base_url_from(&doc.base)?;
        let base = BaseImage {
            file: FileSource {
                to: Utf8PathBuf::from(DATA_PART_PATH).join("-"),
                url: Some(base_url),
                content: None,
                via: ExpandMethod::Direct,
                checksum: None,
                size: None,
            },
            rootfs_size: BASE_ROOTFS_SIZE,
        };

        let mut files = Vec::with_capacity(doc.files.len());
        for conf in &doc.files {
            files.push(file_from_config(conf)?);
        }
        let mut tos: Vec<&str> = doc.files.iter().map(|f| f.to.as_str()).collect();
        tos.sort_unstable();
        let dups: Vec<&str> = tos.windows(2).filter(|w| w[0] == w[1]).map(|w| w[0]).collect();
        if !dups.is_empty() {
            bail!("files: duplicate to target(s): {}", dups.join(", "));
        }

        let mut oci_images = Vec::with_capacity(doc.oci_images.len());
        for conf in &doc.oci_images {
            oci_images.push(ImageSource {
                oci: ImageRef::parse(&conf.ident)
                    .with_context(|| format!("Parsing image ident `{}`", conf.ident))?,
                filesize: conf.filesize,
                fullsize: conf.fullsize,
            });
        }

        Ok(Self {
            base,
            output: doc.output,
            oci_images,
            files,
            offspot: doc.offspot,
        })
    }

    /// Files fetched over the network.
    pub(crate) fn remote_files(&self) -> impl Iterator<Item = &FileSource> {
        self.files.iter().filter(|f| f.is_remote())
    }

    /// Files written from inline content or copied from the local filesystem.
    pub(crate) fn non_remote_files(&self) -> impl Iterator<Item = &FileSource> {
        self.files.iter().filter(|f| f.is_plain() || f.is_local())
    }
}

fn file_from_config(conf: &FileConfig) -> Result<FileSource> {
    let to = Utf8PathBuf::from(&conf.to);
    if !to.starts_with(DATA_PART_PATH) {
        bail!("{to} is not a descendent of {DATA_PART_PATH}");
    }
    let url = match (&conf.url, &conf.content) {
        (Some(url), None) => {
            Some(Url::parse(url).with_context(|| format!("URL `{url}` is incorrect"))?)
        }
        (None, Some(_)) => None,
        (Some(_), Some(_)) => {
            bail!("files[to={to}]: url and content are mutually exclusive")
        }
        (None, None) => bail!("files[to={to}]: either url or content must be set"),
    };
    Ok(FileSource {
        to,
        url,
        content: conf.content.clone(),
        via: conf.via.unwrap_or_default(),
        checksum: conf.checksum.clone(),
        size: conf.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const FULL: &str = indoc! { r#"
        base: 1.2.0
        output:
          size: 8 GiB
        oci_images:
          - ident: ghcr.io/offspot/kiwix-serve:3.5.0
            filesize: 47206400
            fullsize: 47156908
        files:
          - to: /data/content/readme.txt
            content: hello there
          - to: /data/content/pack.zim
            url: https://mirror.download.kiwix.org/zim/pack_2024-05.zim
            size: 1073741824
        offspot:
          hostname: my-offspot
    "# };

    #[test]
    fn test_read_full() {
        let config = MainConfig::read_from(FULL).unwrap();
        assert_eq!(
            config.base.file.url_str(),
            "https://drive.offspot.it/base/base-image-1.2.0.img.xz"
        );
        assert_eq!(config.output.size, Some(8 * 1024 * 1024 * 1024));
        assert!(!config.output.shrink);
        assert_eq!(config.oci_images.len(), 1);
        assert_eq!(config.files.len(), 2);
        assert_eq!(config.remote_files().count(), 1);
        assert_eq!(config.non_remote_files().count(), 1);
        assert_eq!(
            config.offspot.get("hostname"),
            Some(&serde_yaml::Value::from("my-offspot"))
        );
    }

    #[test]
    fn test_base_variants() {
        assert_eq!(
            base_url_from("1.0.2rc4").unwrap().as_str(),
            "https://drive.offspot.it/base/base-image-1.0.2rc4.img.xz"
        );
        assert_eq!(
            base_url_from("https://host/base.img").unwrap().as_str(),
            "https://host/base.img"
        );
        assert_eq!(
            base_url_from("/srv/base.img.xz").unwrap().as_str(),
            "file:///srv/base.img.xz"
        );
    }

    #[test]
    fn test_output_size_auto() {
        let config = MainConfig::read_from(indoc! { r#"
            base: 1.2.0
            output:
              size: auto
            oci_images: []
            files: []
        "# })
        .unwrap();
        assert_eq!(config.output.size, None);
    }

    #[test]
    fn test_duplicate_to_rejected() {
        let err = MainConfig::read_from(indoc! { r#"
            base: 1.2.0
            oci_images: []
            files:
              - to: /data/x
                content: a
              - to: /data/x
                content: b
        "# })
        .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate"));
    }

    #[test]
    fn test_url_content_exclusive() {
        for files in [
            "  - to: /data/x\n    url: https://h/x\n    content: boo",
            "  - to: /data/x",
        ] {
            let text = format!("base: 1.2.0\noci_images: []\nfiles:\n{files}");
            assert!(MainConfig::read_from(&text).is_err());
        }
    }

    #[test]
    fn test_to_outside_data_rejected() {
        let err = MainConfig::read_from(indoc! { r#"
            base: 1.2.0
            oci_images: []
            files:
              - to: /etc/passwd
                content: boo
        "# })
        .unwrap_err();
        assert!(format!("{err:#}").contains("descendent"));
    }
}
