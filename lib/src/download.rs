//! Plain HTTP helpers: reading remote text documents and probing the
//! size of remote resources.

use std::time::Duration;

use anyhow::{Context, Result};
use fn_error_context::context;
use url::Url;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_ATTEMPTS: u32 = 3;

/// Whether this identifier is an HTTP(S) URL.
pub(crate) fn is_http(s: &str) -> bool {
    let lower = s.get(..8).map(str::to_ascii_lowercase).unwrap_or_default();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// A blocking client with connection (but no overall) timeout.
pub(crate) fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("imager/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Building HTTP client")
}

/// Run `f` up to [`RETRY_ATTEMPTS`] times with exponential backoff.
fn with_retries<T>(what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                tracing::debug!("{what} failed (attempt {attempt}): {e:#}");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Text content from a URL.
#[context("Reading {url}")]
pub(crate) fn read_text_from(url: &Url) -> Result<String> {
    let client = http_client()?;
    with_retries("text fetch", || {
        let resp = client
            .get(url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()?
            .error_for_status()?;
        Ok(resp.text()?)
    })
}

/// Size of a remote resource from its headers: `Ok(None)` when the server
/// does not advertise one, `Err` when the resource is unreachable.
///
/// Servers without HEAD support get a conservative streaming GET with
/// identity encoding, so Content-Length reflects the stored size.
#[context("Probing size of {url}")]
pub(crate) fn get_online_size(url: &Url) -> Result<Option<u64>> {
    let client = http_client()?;
    with_retries("size probe", || {
        let resp = client.head(url.clone()).timeout(PROBE_TIMEOUT).send()?;
        let resp = if resp.status().is_success() {
            resp
        } else {
            client
                .get(url.clone())
                .timeout(PROBE_TIMEOUT)
                .header(reqwest::header::ACCEPT_ENCODING, "identity")
                .send()?
                .error_for_status()?
        };
        let length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok(length)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_http() {
        assert!(is_http("https://host/x"));
        assert!(is_http("HTTP://host/x"));
        assert!(!is_http("ftp://host/x"));
        assert!(!is_http("file:///x"));
        assert!(!is_http(""));
    }
}
