//! Multi-protocol downloader: a dedicated `aria2c` process spawned for
//! the lifetime of the run and driven over its JSON-RPC interface.
//! Plain HTTP(S), metalink, magnet and `.torrent` URIs are handled
//! transparently by aria2.
//!
//! Transfers land in a temporary directory next to their target and are
//! renamed into place on completion. Status polling and completion
//! handling all happen on the caller's (driver) thread.

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

/// How often transfer status is polled.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Terminal error reported by the downloader for one transfer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("download error #{code}: {message}")]
pub(crate) struct DownloadErrorInfo {
    pub(crate) code: String,
    pub(crate) message: String,
}

/// Byte progress of one transfer (or an aggregate).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Progress {
    pub(crate) downloaded: u64,
    pub(crate) total: u64,
    pub(crate) speed: u64,
}

impl Progress {
    pub(crate) fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.downloaded as f64 / self.total as f64
    }
}

/// Lifecycle state of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownloadState {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

/// One status snapshot of a transfer.
#[derive(Debug, Clone)]
pub(crate) struct DownloadStatus {
    pub(crate) state: DownloadState,
    pub(crate) progress: Progress,
    pub(crate) error: Option<DownloadErrorInfo>,
}

// aria2 serializes every number as a JSON string
#[derive(Debug, Deserialize)]
struct RawStatus {
    status: String,
    #[serde(rename = "completedLength", default)]
    completed_length: Option<String>,
    #[serde(rename = "totalLength", default)]
    total_length: Option<String>,
    #[serde(rename = "downloadSpeed", default)]
    download_speed: Option<String>,
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

fn parse_status(raw: RawStatus) -> Result<DownloadStatus> {
    let to_u64 = |v: &Option<String>| v.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
    let state = match raw.status.as_str() {
        "active" => DownloadState::Active,
        "waiting" => DownloadState::Waiting,
        "paused" => DownloadState::Paused,
        "complete" => DownloadState::Complete,
        "error" => DownloadState::Error,
        "removed" => DownloadState::Removed,
        other => bail!("unknown download status `{other}`"),
    };
    let error = match state {
        DownloadState::Error => Some(DownloadErrorInfo {
            code: raw.error_code.unwrap_or_else(|| "?".to_string()),
            message: raw
                .error_message
                .unwrap_or_else(|| "unknown error".to_string()),
        }),
        _ => None,
    };
    Ok(DownloadStatus {
        state,
        progress: Progress {
            downloaded: to_u64(&raw.completed_length),
            total: to_u64(&raw.total_length),
            speed: to_u64(&raw.download_speed),
        },
        error,
    })
}

/// Normalize a `algo:hex` checksum declaration into aria2's
/// `algo=hex` option value.
fn aria2_checksum(decl: &str) -> Option<String> {
    let (algo, value) = decl.split_once([':', '='])?;
    let algo = match algo.to_ascii_lowercase().as_str() {
        "sha1" => "sha-1",
        "sha224" => "sha-224",
        "sha256" => "sha-256",
        "sha384" => "sha-384",
        "sha512" => "sha-512",
        "md5" => "md5",
        other if other.starts_with("sha-") => return Some(format!("{other}={value}")),
        _ => return None,
    };
    Some(format!("{algo}={value}"))
}

/// One submitted transfer: the aria2 identifier plus our bookkeeping.
#[derive(Debug)]
pub(crate) struct Download {
    gid: String,
    pub(crate) final_path: Utf8PathBuf,
    out_name: String,
    // holds the staging directory until the rename happened
    tmp_dir: tempfile::TempDir,
    #[allow(dead_code)]
    pub(crate) started_on: DateTime<Utc>,
    #[allow(dead_code)]
    pub(crate) completed_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// The spawned aria2c process and its RPC client.
#[derive(Debug)]
pub(crate) struct Aria2Downloader {
    child: Child,
    endpoint: String,
    secret: String,
    client: reqwest::blocking::Client,
    stopped: bool,
}

impl Aria2Downloader {
    /// Spawn aria2c on a free localhost port and wait for its RPC
    /// interface to come up.
    #[context("Starting downloader")]
    pub(crate) fn spawn() -> Result<Self> {
        let port = {
            let listener =
                TcpListener::bind(("127.0.0.1", 0)).context("Finding a free RPC port")?;
            listener.local_addr()?.port()
        };
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let port_arg = port.to_string();
        let pid_arg = std::process::id().to_string();
        let child = Command::new("aria2c")
            .args([
                "--enable-rpc",
                "--rpc-listen-port",
                port_arg.as_str(),
                "--rpc-secret",
                secret.as_str(),
                "--stop-with-process",
                pid_arg.as_str(),
                "--auto-file-renaming=false",
                "--allow-overwrite=true",
                "--follow-torrent=mem",
                "--seed-time=0",
                "--max-connection-per-server=4",
                "--console-log-level=warn",
                "--quiet=true",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Spawning aria2c (is it installed?)")?;
        let downloader = Self {
            child,
            endpoint: format!("http://127.0.0.1:{port}/jsonrpc"),
            secret,
            client: crate::download::http_client()?,
            stopped: false,
        };
        // give the RPC endpoint a moment to come up
        for attempt in 0..40 {
            match downloader.call::<serde_json::Value>("aria2.getVersion", json!([])) {
                Ok(_) => return Ok(downloader),
                Err(e) if attempt == 39 => {
                    return Err(e).context("aria2c RPC did not come up");
                }
                Err(_) => std::thread::sleep(Duration::from_millis(250)),
            }
        }
        unreachable!()
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let mut full_params = vec![json!(format!("token:{}", self.secret))];
        if let serde_json::Value::Array(values) = params {
            full_params.extend(values);
        }
        let body = json!({
            "jsonrpc": "2.0",
            "id": "imager",
            "method": method,
            "params": full_params,
        });
        let resp: RpcResponse<T> = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .with_context(|| format!("Calling {method}"))?
            .json()
            .with_context(|| format!("Decoding {method} response"))?;
        if let Some(error) = resp.error {
            bail!("{method} failed: #{} {}", error.code, error.message);
        }
        resp.result
            .ok_or_else(|| anyhow!("{method} returned no result"))
    }

    /// Submit one URI for download to `dest`. The transfer is staged in a
    /// fresh temporary directory next to `dest` and renamed into place by
    /// [`Self::finalize`].
    #[context("Submitting {uri}")]
    pub(crate) fn submit(
        &self,
        uri: &str,
        dest: &Utf8Path,
        checksum: Option<&str>,
    ) -> Result<Download> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("{dest} has no parent directory"))?;
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        let tmp_dir = tempfile::Builder::new()
            .prefix(".dl-")
            .tempdir_in(parent.as_std_path())
            .with_context(|| format!("Creating staging directory in {parent}"))?;
        let out_name = dest
            .file_name()
            .ok_or_else(|| anyhow!("{dest} has no file name"))?
            .to_string();

        let mut options = json!({
            "dir": tmp_dir.path().to_str(),
            "out": out_name,
        });
        if let Some(decl) = checksum {
            match aria2_checksum(decl) {
                Some(value) => {
                    options["checksum"] = json!(value);
                }
                None => tracing::warn!("unsupported checksum declaration `{decl}`, skipping"),
            }
        }
        let gid: String = self.call("aria2.addUri", json!([[uri], options]))?;
        Ok(Download {
            gid,
            final_path: dest.to_path_buf(),
            out_name,
            tmp_dir,
            started_on: Utc::now(),
            completed_on: None,
        })
    }

    /// One status snapshot for a transfer.
    pub(crate) fn status(&self, download: &Download) -> Result<DownloadStatus> {
        let raw: RawStatus = self.call(
            "aria2.tellStatus",
            json!([
                download.gid,
                [
                    "status",
                    "completedLength",
                    "totalLength",
                    "downloadSpeed",
                    "errorCode",
                    "errorMessage"
                ]
            ]),
        )?;
        parse_status(raw)
    }

    /// Move a completed transfer from its staging directory to its final
    /// location (same filesystem, so the rename is atomic).
    pub(crate) fn finalize(&self, download: &mut Download) -> Result<()> {
        let staged = Utf8PathBuf::from_path_buf(download.tmp_dir.path().join(&download.out_name))
            .map_err(|p| anyhow!("non-UTF8 staging path {p:?}"))?;
        std::fs::rename(&staged, &download.final_path)
            .with_context(|| format!("Moving {staged} to {}", download.final_path))?;
        download.completed_on = Some(Utc::now());
        Ok(())
    }

    /// Block until the transfer terminates, reporting progress roughly
    /// every [`POLL_INTERVAL`].
    pub(crate) fn block_until_done(
        &self,
        download: &mut Download,
        mut on_progress: impl FnMut(&Progress),
    ) -> Result<()> {
        loop {
            let status = self.status(download)?;
            on_progress(&status.progress);
            match status.state {
                DownloadState::Complete => return self.finalize(download),
                DownloadState::Error => {
                    let info = status.error.unwrap_or(DownloadErrorInfo {
                        code: "?".to_string(),
                        message: "unknown error".to_string(),
                    });
                    return Err(info).context(format!("Downloading {}", download.final_path));
                }
                DownloadState::Removed => bail!("download of {} cancelled", download.final_path),
                _ => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    /// Forcibly cancel a transfer; best-effort.
    pub(crate) fn cancel(&self, download: &Download) {
        if let Err(e) = self.call::<String>("aria2.forceRemove", json!([download.gid])) {
            tracing::debug!("cancelling {} failed: {e:#}", download.gid);
        }
    }

    /// Stop the aria2c process, cancelling anything outstanding.
    pub(crate) fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.call::<String>("aria2.forceShutdown", json!([])) {
            tracing::debug!("aria2 shutdown call failed: {e:#}");
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("killing aria2c failed: {e}");
        }
        let _ = self.child.wait();
    }
}

impl Drop for Aria2Downloader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let raw: RawStatus = serde_json::from_str(
            r#"{"status": "active", "completedLength": "512", "totalLength": "2048",
                "downloadSpeed": "100"}"#,
        )
        .unwrap();
        let status = parse_status(raw).unwrap();
        assert_eq!(status.state, DownloadState::Active);
        assert_eq!(status.progress.downloaded, 512);
        assert_eq!(status.progress.total, 2048);
        assert!(status.error.is_none());
        assert!((status.progress.ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_error_status() {
        let raw: RawStatus = serde_json::from_str(
            r#"{"status": "error", "errorCode": "9", "errorMessage": "no space left"}"#,
        )
        .unwrap();
        let status = parse_status(raw).unwrap();
        assert_eq!(status.state, DownloadState::Error);
        let error = status.error.unwrap();
        assert_eq!(error.code, "9");
        assert!(error.to_string().contains("no space left"));
    }

    #[test]
    fn test_aria2_checksum() {
        assert_eq!(
            aria2_checksum("sha256:abcd").as_deref(),
            Some("sha-256=abcd")
        );
        assert_eq!(
            aria2_checksum("sha-256=abcd").as_deref(),
            Some("sha-256=abcd")
        );
        assert_eq!(aria2_checksum("md5:ffff").as_deref(), Some("md5=ffff"));
        assert_eq!(aria2_checksum("crc32:1234"), None);
        assert_eq!(aria2_checksum("garbage"), None);
    }
}
