//! Fetching the base image: from the cache, the local filesystem or the
//! network, with streamed decompression of `.xz` images.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use imager_utils::format_size;

use crate::context::RunContext;
use crate::output::{transfer_bar, TaskLine};
use crate::sources::{FileSource, Source};
use crate::utils;

fn is_xz(path_or_url: &str) -> bool {
    path_or_url.ends_with(".xz")
}

/// Copy or download the base image into place, going through the cache
/// when possible and feeding it when admissible.
pub(crate) fn download_image(ctx: &mut RunContext) -> Result<i32> {
    let base = ctx.config()?.base.file.clone();
    let output_path = ctx.options.output_path.clone();
    let build_dir = ctx.options.build_dir.clone();

    let in_cache = {
        let cache = ctx.cache_mut()?;
        cache.in_cache(&Source::File(&base), false)?
    };
    if in_cache {
        return run_cached(ctx, &base, &output_path, &build_dir);
    }
    if base.is_local() {
        return run_local(&base, &output_path);
    }
    run_remote(ctx, &base, &output_path, &build_dir)
}

fn extract_to_output(src: &Utf8Path, output_path: &Utf8Path) -> Result<i32> {
    let line = TaskLine::start(format!("Extracting {src} into {output_path}"));
    match utils::extract_xz_image(src, output_path) {
        Ok(written) => {
            line.succeed(format_size(written));
            Ok(0)
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            Ok(1)
        }
    }
}

fn run_cached(
    ctx: &mut RunContext,
    base: &FileSource,
    output_path: &Utf8Path,
    build_dir: &Utf8Path,
) -> Result<i32> {
    let source = Source::File(base);
    if is_xz(base.url_str()) {
        let staged = build_dir.join("base-image.img.xz");
        let line = TaskLine::start(format!("Copying cached base into {staged}"));
        let cache = ctx.cache_mut()?;
        match cache.copy_out(&source, &staged) {
            Ok(copied) => line.succeed(format_size(copied)),
            Err(e) => {
                line.fail(format!("{e:#}"));
                return Ok(1);
            }
        }
        let code = extract_to_output(&staged, output_path)?;
        let _ = std::fs::remove_file(&staged);
        Ok(code)
    } else {
        let line = TaskLine::start(format!("Copying cached base into {output_path}"));
        let cache = ctx.cache_mut()?;
        match cache.copy_out(&source, output_path) {
            Ok(copied) => {
                line.succeed(format_size(copied));
                Ok(0)
            }
            Err(e) => {
                line.fail(format!("{e:#}"));
                Ok(1)
            }
        }
    }
}

fn run_local(base: &FileSource, output_path: &Utf8Path) -> Result<i32> {
    let src = base.local_path()?;
    if is_xz(src.as_str()) {
        return extract_to_output(&src, output_path);
    }
    let line = TaskLine::start(format!("Copying {src} into {output_path}"));
    match std::fs::copy(&src, output_path) {
        Ok(copied) => {
            line.succeed(format_size(copied));
            Ok(0)
        }
        Err(e) => {
            line.fail(e);
            Ok(1)
        }
    }
}

fn run_remote(
    ctx: &mut RunContext,
    base: &FileSource,
    output_path: &Utf8Path,
    build_dir: &Utf8Path,
) -> Result<i32> {
    let url = base.url_str().to_string();
    let needs_extract = is_xz(&url);
    let dl_path: Utf8PathBuf = if needs_extract {
        utils::ensure_dir(build_dir)?;
        build_dir.join(
            Utf8Path::new(url::Url::parse(&url)?.path())
                .file_name()
                .unwrap_or("base-image.img.xz"),
        )
    } else {
        output_path.to_path_buf()
    };

    println!("  Downloading {url} into {dl_path}…");
    let bar = transfer_bar(base.size());
    {
        let downloader = ctx.downloader()?;
        let mut download = downloader.submit(&url, &dl_path, base.checksum.as_deref())?;
        let result = downloader.block_until_done(&mut download, |progress| {
            if progress.total > 0 {
                bar.set_length(progress.total);
            }
            bar.set_position(progress.downloaded);
        });
        bar.finish_and_clear();
        if let Err(e) = result {
            println!("  download FAILED {e:#}");
            return Ok(1);
        }
    }
    println!("  downloaded {}", format_size(utils::get_filesize(&dl_path)?));

    // feed the cache before the staged file is consumed
    let cache = ctx.cache_mut()?;
    if cache.should_cache(&Source::File(base))? {
        let line = TaskLine::start("Introducing base image into cache");
        if cache.introduce(&Source::File(base), &dl_path)? {
            line.done();
        } else {
            line.fail("not cached");
        }
    }

    if needs_extract {
        let code = extract_to_output(&dl_path, output_path)?;
        let _ = std::fs::remove_file(&dl_path);
        return Ok(code);
    }
    Ok(0)
}
