//! OCI image export through `skopeo`: docker-style tars for the data
//! partition, and platform-specific manifest digests for outdacy checks.

use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use imager_utils::CommandRunExt;
use serde::Deserialize;

use crate::sources::{ImageRef, ManifestPlatform, Platform};

#[derive(Debug, Deserialize)]
struct DigestRef {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct ManifestListEntry {
    digest: String,
    platform: Option<ManifestPlatform>,
}

#[derive(Debug, Deserialize)]
struct V1History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

/// The top-level document returned by a raw manifest fetch: a
/// multi-platform index, a v2 single manifest, or a legacy v1 manifest.
#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(default)]
    manifests: Option<Vec<ManifestListEntry>>,
    #[serde(default)]
    layers: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    config: Option<DigestRef>,
    #[serde(default)]
    history: Option<Vec<V1History>>,
}

fn transport_ref(image: &ImageRef) -> String {
    format!("docker://{image}")
}

/// Resolve the manifest digest identifying `image` for `platform`.
///
/// For single-platform v2 manifests the registry assumes its default
/// platform, so any other target is a miss. The value is only ever
/// compared for equality, not shown to users.
#[context("Reading manifest digest of {image}")]
pub(crate) fn get_manifest_digest(image: &ImageRef, platform: &Platform) -> Result<String> {
    let raw = Command::new("skopeo")
        .args(["inspect", "--raw"])
        .arg(transport_ref(image))
        .lang_c()
        .run_get_string()?;
    let manifest: RawManifest = serde_json::from_str(&raw).context("Parsing raw manifest")?;
    digest_from_manifest(&manifest, platform)
}

fn digest_from_manifest(manifest: &RawManifest, platform: &Platform) -> Result<String> {
    if manifest.schema_version == 1 {
        // v1 chain: the digest lives in the first history entry
        let history = manifest
            .history
            .as_ref()
            .and_then(|h| h.first())
            .ok_or_else(|| anyhow!("v1 manifest without history"))?;
        #[derive(Deserialize)]
        struct V1Config {
            id: String,
        }
        let config: V1Config = serde_json::from_str(&history.v1_compatibility)
            .context("Parsing v1 compatibility blob")?;
        return Ok(config.id);
    }

    if let Some(manifests) = &manifest.manifests {
        // multi-platform index
        for entry in manifests {
            let matches = entry
                .platform
                .as_ref()
                .is_some_and(|p| platform.matches(p));
            if matches {
                return Ok(entry.digest.clone());
            }
        }
        bail!("image not found (multi)");
    }

    if manifest.layers.is_some() {
        // single-platform image, implicitly the registry default
        if *platform != Platform::registry_default() {
            bail!("image not found (single)");
        }
        return manifest
            .config
            .as_ref()
            .map(|c| c.digest.clone())
            .ok_or_else(|| anyhow!("v2 manifest without config"));
    }

    bail!("unrecognized manifest layout")
}

/// Whether `image` exists on its registry for `platform`.
pub(crate) fn image_exists(image: &ImageRef, platform: &Platform) -> bool {
    match get_manifest_digest(image, platform) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("image {image} lookup failed: {e:#}");
            false
        }
    }
}

/// Export `image` as a docker-style tar at `dest_tar`, staging layer
/// downloads under `build_dir`.
#[context("Exporting {image}")]
pub(crate) fn export(
    image: &ImageRef,
    platform: &Platform,
    dest_tar: &Utf8Path,
    build_dir: &Utf8Path,
) -> Result<()> {
    std::fs::create_dir_all(build_dir).with_context(|| format!("Creating {build_dir}"))?;
    let archive_name = format!(
        "{}/{}:{}",
        image.repository,
        image.name,
        image.tag.as_deref().unwrap_or("latest")
    );
    let mut cmd = Command::new("skopeo");
    cmd.arg("copy")
        .args(["--override-os", platform.os.as_str()])
        .args(["--override-arch", platform.arch.as_str()]);
    if let Some(variant) = &platform.variant {
        cmd.args(["--override-variant", variant.as_str()]);
    }
    cmd.args(["--tmpdir", build_dir.as_str()])
        .arg(transport_ref(image))
        .arg(format!("docker-archive:{dest_tar}:{archive_name}"));
    cmd.lang_c().run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(raw: &str) -> RawManifest {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_digest_from_index() {
        let manifest = parse(indoc! { r#"
            {
              "schemaVersion": 2,
              "manifests": [
                {"digest": "sha256:aaa", "platform": {"os": "linux", "architecture": "amd64"}},
                {"digest": "sha256:bbb", "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}}
              ]
            }
        "# });
        assert_eq!(
            digest_from_manifest(&manifest, &Platform::target()).unwrap(),
            "sha256:bbb"
        );
        let other = Platform::parse("linux/s390x").unwrap();
        assert!(digest_from_manifest(&manifest, &other).is_err());
    }

    #[test]
    fn test_digest_from_single_v2() {
        let manifest = parse(indoc! { r#"
            {
              "schemaVersion": 2,
              "config": {"digest": "sha256:cfg"},
              "layers": [{"digest": "sha256:l1"}]
            }
        "# });
        // single-platform images only resolve for the registry default
        assert!(digest_from_manifest(&manifest, &Platform::target()).is_err());
        assert_eq!(
            digest_from_manifest(&manifest, &Platform::registry_default()).unwrap(),
            "sha256:cfg"
        );
    }

    #[test]
    fn test_digest_from_v1() {
        let manifest = parse(
            r#"{"schemaVersion": 1, "history": [{"v1Compatibility": "{\"id\": \"deadbeef\"}"}]}"#,
        );
        assert_eq!(
            digest_from_manifest(&manifest, &Platform::target()).unwrap(),
            "deadbeef"
        );
    }

    #[test]
    fn test_transport_ref() {
        let image = ImageRef::parse("ghcr.io/offspot/kiwix-serve:3.5.0").unwrap();
        assert_eq!(
            transport_ref(&image),
            "docker://ghcr.io/offspot/kiwix-serve:3.5.0"
        );
    }
}
