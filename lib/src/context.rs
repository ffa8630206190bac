//! Per-run state threaded explicitly through the pipeline steps.

use std::fmt::Display;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use url::Url;

use crate::cache::manager::CacheManager;
use crate::config::MainConfig;
use crate::download;
use crate::downloader::Aria2Downloader;
use crate::loopimg::LoopbackImage;

/// Where the configuration document comes from.
#[derive(Debug, Clone)]
pub(crate) enum ConfigLocation {
    Path(Utf8PathBuf),
    Url(Url),
}

impl ConfigLocation {
    pub(crate) fn parse(src: &str) -> Self {
        if download::is_http(src) {
            if let Ok(url) = Url::parse(src) {
                return ConfigLocation::Url(url);
            }
        }
        ConfigLocation::Path(Utf8PathBuf::from(src))
    }

    /// The configuration text, read from disk or fetched.
    pub(crate) fn read_text(&self) -> Result<String> {
        match self {
            ConfigLocation::Path(path) => {
                std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))
            }
            ConfigLocation::Url(url) => download::read_text_from(url),
        }
    }
}

impl Display for ConfigLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLocation::Path(path) => path.fmt(f),
            ConfigLocation::Url(url) => url.fmt(f),
        }
    }
}

/// Resolved command-line options for one run.
#[derive(Debug)]
pub(crate) struct RunOptions {
    pub(crate) config_src: ConfigLocation,
    pub(crate) output_path: Utf8PathBuf,
    pub(crate) build_dir: Utf8PathBuf,
    /// Keeps an auto-created build directory alive, and removed on drop.
    pub(crate) _build_dir_guard: Option<tempfile::TempDir>,
    pub(crate) cache_dir: Option<Utf8PathBuf>,
    pub(crate) check_only: bool,
    pub(crate) keep_failed: bool,
    pub(crate) overwrite: bool,
    pub(crate) max_size: Option<u64>,
}

/// Everything the steps share; replaces ambient globals.
#[derive(Debug)]
pub(crate) struct RunContext {
    pub(crate) options: RunOptions,
    pub(crate) config: Option<MainConfig>,
    pub(crate) cache: Option<CacheManager>,
    pub(crate) downloader: Option<Aria2Downloader>,
    pub(crate) image: Option<LoopbackImage>,
    /// Final image size decided by the size-computation step.
    pub(crate) output_size: u64,
    pub(crate) succeeded: bool,
}

impl RunContext {
    pub(crate) fn new(options: RunOptions) -> Self {
        Self {
            options,
            config: None,
            cache: None,
            downloader: None,
            image: None,
            output_size: 0,
            succeeded: false,
        }
    }

    pub(crate) fn config(&self) -> Result<&MainConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| anyhow!("configuration not loaded yet"))
    }

    pub(crate) fn cache_mut(&mut self) -> Result<&mut CacheManager> {
        self.cache
            .as_mut()
            .ok_or_else(|| anyhow!("cache manager not initialized yet"))
    }

    pub(crate) fn image_mut(&mut self) -> Result<&mut LoopbackImage> {
        self.image
            .as_mut()
            .ok_or_else(|| anyhow!("image not opened yet"))
    }

    /// Mount point of the data partition; only valid between the mount
    /// and unmount steps.
    pub(crate) fn data_mount_point(&self) -> Result<&Utf8Path> {
        self.image
            .as_ref()
            .and_then(|i| i.p3_mounted_on())
            .ok_or_else(|| anyhow!("data partition is not mounted"))
    }

    /// The long-lived downloader process, spawned on first use.
    pub(crate) fn downloader(&mut self) -> Result<&Aria2Downloader> {
        if self.downloader.is_none() {
            self.downloader = Some(Aria2Downloader::spawn()?);
        }
        Ok(self.downloader.as_ref().expect("just set"))
    }
}
