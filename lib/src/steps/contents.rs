//! Placing the declared files onto the data partition: inline content,
//! local files, and the remote download batch driven through the
//! downloader adapter.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use imager_utils::format_size;

use crate::context::RunContext;
use crate::downloader::{Download, DownloadState, POLL_INTERVAL};
use crate::output::{self, transfer_bar, TaskLine};
use crate::sources::{FileSource, Source};
use crate::utils;

/// Write inline-content and local files into their destinations,
/// expanding archives where requested.
pub(crate) fn processing_local_content(ctx: &mut RunContext) -> Result<i32> {
    let mount_point = ctx.data_mount_point()?.to_path_buf();
    let files: Vec<FileSource> = ctx.config()?.non_remote_files().cloned().collect();

    if files.is_empty() {
        output::task_note("No local content to process");
        return Ok(0);
    }

    for file in &files {
        let dest = file.mounted_to(&mount_point);
        if let Some(parent) = dest.parent() {
            if let Err(e) = utils::ensure_dir(parent) {
                eprintln!("error: {e:#}");
                return Ok(1);
            }
        }

        if let Some(content) = &file.content {
            let line = TaskLine::start(format!("Writing plain text to {}", file.to));
            match std::fs::write(&dest, content) {
                Ok(()) => line.succeed(format_size(content.len() as u64)),
                Err(e) => {
                    line.fail(e);
                    return Ok(1);
                }
            }
            continue;
        }

        let src = file.local_path()?;
        if file.is_direct() {
            let line = TaskLine::start(format!("Copying file to {}", file.to));
            match std::fs::copy(&src, &dest) {
                Ok(copied) => line.succeed(format_size(copied)),
                Err(e) => {
                    line.fail(e);
                    return Ok(1);
                }
            }
        } else {
            let line = TaskLine::start(format!("Expanding file to {}", file.to));
            match utils::expand_file(&src, &dest, file.via) {
                Ok(()) => line.succeed(format_size(utils::get_size_of(&dest).unwrap_or(0))),
                Err(e) => {
                    line.fail(format!("{e:#}"));
                    return Ok(1);
                }
            }
        }
    }
    Ok(0)
}

#[derive(Debug)]
struct Pending {
    file: FileSource,
    download: Download,
    downloaded: u64,
    done: bool,
}

/// Serve remote files from the cache when fresh, submit the rest to the
/// downloader in one batch and process completions (cache introduction,
/// archive expansion) as they are observed. A single failure cancels
/// whatever is still in flight.
pub(crate) fn downloading_content(ctx: &mut RunContext) -> Result<i32> {
    let mount_point = ctx.data_mount_point()?.to_path_buf();
    let build_dir = ctx.options.build_dir.clone();
    let remote: Vec<FileSource> = ctx.config()?.remote_files().cloned().collect();

    if remote.is_empty() {
        output::task_note("No content to download");
        return Ok(0);
    }

    let staging_root = build_dir.join("dl_remotes");

    // cache hits are copied straight out, everything else gets submitted
    let mut to_download: Vec<FileSource> = Vec::new();
    for file in remote {
        let in_cache = {
            let source = Source::File(&file);
            ctx.cache_mut()?.in_cache(&source, false)?
        };
        if !in_cache {
            to_download.push(file);
            continue;
        }
        let dest = file.mounted_to(&mount_point);
        let source = Source::File(&file);
        if file.is_direct() {
            let line = TaskLine::start(format!("Copying {} from cache", file.url_str()));
            match ctx.cache_mut()?.copy_out(&source, &dest) {
                Ok(copied) => line.succeed(format_size(copied)),
                Err(e) => {
                    line.fail(format!("{e:#}"));
                    return Ok(1);
                }
            }
        } else {
            utils::ensure_dir(&staging_root)?;
            let staged = staging_root.join(dest.file_name().unwrap_or("archive"));
            let line = TaskLine::start(format!("Expanding {} from cache", file.url_str()));
            let result = ctx
                .cache_mut()?
                .copy_out(&source, &staged)
                .and_then(|_| utils::expand_file(&staged, &dest, file.via));
            let _ = std::fs::remove_file(&staged);
            match result {
                Ok(()) => line.succeed(format_size(utils::get_size_of(&dest).unwrap_or(0))),
                Err(e) => {
                    line.fail(format!("{e:#}"));
                    return Ok(1);
                }
            }
        }
    }

    if to_download.is_empty() {
        return Ok(0);
    }

    let bytes_total: u64 = to_download.iter().map(|f| f.size()).sum();
    output::task_note(format!(
        "Downloading {} files totaling {}…",
        to_download.len(),
        format_size(bytes_total)
    ));

    // split borrows: the downloader drives transfers while the cache is
    // fed from this same (driver) thread
    if ctx.downloader.is_none() {
        ctx.downloader = Some(crate::downloader::Aria2Downloader::spawn()?);
    }
    let RunContext {
        downloader, cache, ..
    } = ctx;
    let downloader = downloader
        .as_ref()
        .context("downloader not running")?;
    let cache = cache.as_mut().context("cache manager not initialized yet")?;

    let mut pendings: Vec<Pending> = Vec::new();
    for (index, file) in to_download.into_iter().enumerate() {
        let dest = file.mounted_to(&mount_point);
        let target: Utf8PathBuf = if file.is_direct() {
            if let Some(parent) = dest.parent() {
                utils::ensure_dir(parent)?;
            }
            dest.clone()
        } else {
            utils::ensure_dir(&staging_root)?;
            staging_root.join(format!("{index}-{}", dest.file_name().unwrap_or("archive")))
        };
        let download = downloader.submit(file.url_str(), &target, file.checksum.as_deref())?;
        pendings.push(Pending {
            file,
            download,
            downloaded: 0,
            done: false,
        });
    }

    let total = pendings.len();
    let mut completed = 0usize;
    let bar = transfer_bar(bytes_total);
    let mut failure: Option<String> = None;

    while completed < total && failure.is_none() {
        for index in 0..pendings.len() {
            if pendings[index].done {
                continue;
            }
            let status = downloader.status(&pendings[index].download)?;
            match status.state {
                DownloadState::Complete => {
                    let pending = &mut pendings[index];
                    downloader.finalize(&mut pending.download)?;
                    pending.downloaded = status.progress.total.max(status.progress.downloaded);
                    pending.done = true;
                    completed += 1;

                    let source = Source::File(&pending.file);
                    if cache.should_cache(&source)?
                        && !cache.introduce(&source, &pending.download.final_path)?
                    {
                        tracing::debug!("{} not introduced to cache", pending.file.url_str());
                    }

                    if !pending.file.is_direct() {
                        let dest = pending.file.mounted_to(&mount_point);
                        let expanded = utils::expand_file(
                            &pending.download.final_path,
                            &dest,
                            pending.file.via,
                        );
                        let _ = std::fs::remove_file(&pending.download.final_path);
                        if let Err(e) = expanded {
                            failure = Some(format!("{e:#}"));
                            break;
                        }
                    }
                    bar.suspend(|| {
                        output::task_note(format!(
                            "{} done ({} of {} items remaining)",
                            pending.file.to,
                            total - completed,
                            total
                        ));
                    });
                }
                DownloadState::Error | DownloadState::Removed => {
                    let message = status
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "cancelled".to_string());
                    failure = Some(format!(
                        "downloading {} failed: {message}",
                        pendings[index].file.url_str()
                    ));
                    break;
                }
                _ => {
                    pendings[index].downloaded = status.progress.downloaded;
                }
            }
        }
        bar.set_position(pendings.iter().map(|p| p.downloaded).sum());
        if failure.is_none() && completed < total {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    if let Some(message) = failure {
        // a single failure halts the batch: everything in flight dies now
        for pending in pendings.iter().filter(|p| !p.done) {
            downloader.cancel(&pending.download);
        }
        bar.abandon();
        eprintln!("error: {message}");
        return Ok(1);
    }

    bar.finish_and_clear();
    Ok(0)
}
