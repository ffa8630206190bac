//! Source digests computed from remote metadata, used to decide whether
//! a cached artifact is still current.
//!
//! For files the digest comes from transport headers, tried in order:
//! a `Digest` header anywhere along the redirect chain, the final ETag,
//! then a `Content-Length|Last-Modified` combination. An empty digest
//! means "unknown" and is treated as always stale.

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use url::Url;

use crate::download::is_http;
use crate::ociexport;
use crate::sources::{ImageRef, Platform, Source, SourceKind};

const MAX_REDIRECTS: usize = 20;

fn strip_etag_quotes(etag: &str) -> &str {
    etag.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(etag)
}

/// Digest for an arbitrary URL, or the empty string when the server
/// exposes nothing usable. With `etag_only`, the header-combination
/// fallback is skipped.
#[context("Retrieving digest of {url}")]
pub(crate) fn get_digest(url: &Url, etag_only: bool) -> Result<String> {
    // only HTTP(S) resources carry transport digests
    if !is_http(url.as_str()) {
        return Ok(String::new());
    }
    let client = reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(std::time::Duration::from_secs(30))
        .user_agent(concat!("imager/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Building HTTP client")?;

    // walk the redirect chain ourselves: mirror redirectors (MirrorBrain)
    // advertise the content digest on the hop responses
    let mut current = url.clone();
    for _ in 0..MAX_REDIRECTS {
        let resp = client.get(current.clone()).send()?;
        if let Some(digest) = resp.headers().get("Digest").and_then(|v| v.to_str().ok()) {
            return Ok(digest.to_string());
        }
        if resp.status().is_redirection() {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .context("Redirect without Location header")?;
            current = current
                .join(location)
                .with_context(|| format!("Resolving redirect target `{location}`"))?;
            continue;
        }
        let resp = resp.error_for_status()?;

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| strip_etag_quotes(v).to_string())
            .unwrap_or_default();
        if !etag.is_empty() || etag_only {
            return Ok(etag);
        }

        let length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok());
        let modified = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok());
        return Ok(match (length, modified) {
            (Some(length), Some(modified)) => format!("{length}|{modified}"),
            _ => String::new(),
        });
    }
    bail!("too many redirects")
}

/// Digest for a stored source identifier (the entry's `source` field).
pub(crate) fn digest_for_identifier(kind: SourceKind, identifier: &str) -> Result<String> {
    match kind {
        SourceKind::File => {
            if !is_http(identifier) {
                return Ok(String::new());
            }
            let url = Url::parse(identifier)
                .with_context(|| format!("Parsing source URL `{identifier}`"))?;
            get_digest(&url, false)
        }
        SourceKind::Image => {
            let image = ImageRef::parse(identifier)?;
            ociexport::get_manifest_digest(&image, &Platform::target())
        }
    }
}

/// Digest for a declared source.
pub(crate) fn digest_for_source(source: &Source) -> Result<String> {
    match source {
        Source::File(f) => match &f.url {
            Some(url) => get_digest(url, false),
            None => Ok(String::new()),
        },
        Source::Image(i) => ociexport::get_manifest_digest(&i.oci, &Platform::target()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_etag_quotes() {
        assert_eq!(strip_etag_quotes("\"abc\""), "abc");
        assert_eq!(strip_etag_quotes("abc"), "abc");
        assert_eq!(strip_etag_quotes("W/\"abc"), "W/\"abc");
    }

    #[test]
    fn test_non_http_has_no_digest() {
        let url = Url::parse("ftp://host/f.bin").unwrap();
        assert_eq!(get_digest(&url, false).unwrap(), "");
        assert_eq!(
            digest_for_identifier(SourceKind::File, "ftp://host/f.bin").unwrap(),
            ""
        );
    }
}
