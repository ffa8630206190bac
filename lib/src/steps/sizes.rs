//! Size planning: the minimum image able to hold the declared content,
//! bound checks, and free-space verification across the volumes involved.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use imager_utils::format_size;

use crate::context::RunContext;
use crate::output::{self, TaskLine};
use crate::sources::Source;
use crate::utils;

/// Safety margin on top of the raw content size.
fn margin_for(content_size: u64) -> u64 {
    content_size / 10
}

/// Usable path for volume queries: the output file may not exist yet, nor
/// some of its parent directories.
fn existing_ancestor(path: &Utf8Path) -> Utf8PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }
    let mut current = path;
    while let Some(parent) = current.parent() {
        if parent.exists() {
            return parent.to_path_buf();
        }
        current = parent;
    }
    Utf8PathBuf::from(".")
}

/// Check the declared content fits the requested image size and the
/// involved volumes have enough free space.
pub(crate) fn compute_sizes(ctx: &mut RunContext) -> Result<i32> {
    let config = ctx.config()?;

    let tar_images_size: u64 = config.oci_images.iter().map(|i| i.filesize).sum();
    let expanded_images_size: u64 = config.oci_images.iter().map(|i| i.fullsize).sum();
    let expanded_files_size: u64 = config.files.iter().map(|f| f.size()).sum();

    let raw_content_size = tar_images_size + expanded_images_size + expanded_files_size;
    let min_image_size = config.base.rootfs_size + raw_content_size + margin_for(raw_content_size);

    output::task_note(format!(
        "Computed minimum image size: {}",
        format_size(min_image_size)
    ));

    // a requested output size must hold the computed minimum
    let image_size = match config.output.size {
        Some(requested) => {
            let line = TaskLine::start("Computed size fits within requested size");
            if requested < min_image_size {
                line.fail(format!(
                    "{} > {}",
                    format_size(min_image_size),
                    format_size(requested)
                ));
                return Ok(1);
            }
            line.succeed(format!(
                "{} <= {}",
                format_size(min_image_size),
                format_size(requested)
            ));
            requested
        }
        None => min_image_size,
    };

    if let Some(max_size) = ctx.options.max_size {
        let line = TaskLine::start("Computed size fits within max-size");
        if max_size < image_size {
            line.fail(format_size(max_size));
            return Ok(1);
        }
        line.done();
    }

    ctx.output_size = image_size;
    check_physical_space(ctx, image_size)
}

fn check_physical_space(ctx: &mut RunContext, image_size: u64) -> Result<i32> {
    let line = TaskLine::start("Checking free-space availability");

    let target_path = existing_ancestor(&ctx.options.output_path);
    let build_dir = ctx.options.build_dir.clone();
    let cache_dir = ctx.options.cache_dir.clone();

    let config = ctx.config()?;

    // the target volume receives the uncompressed image, later expanded
    let target_needs = image_size.max(config.base.rootfs_size);

    // files needing expansion are staged in the build dir first, and so
    // is an xz-compressed base
    let mut build_dir_needs: u64 = config
        .remote_files()
        .filter(|f| !f.is_direct())
        .map(|f| f.size())
        .sum();
    if config.base.file.is_remote() && config.base.file.url_str().ends_with(".xz") {
        build_dir_needs += config.base.file.size();
    }

    let mut cache_needs: u64 = 0;
    if cache_dir.is_some() {
        let cache = ctx
            .cache
            .as_ref()
            .context("cache manager not initialized yet")?;
        cache_needs = cache.candidates().map(|e| e.size).sum();
        // artifacts that live (or will live) in the cache are not staged
        // in the build dir a second time
        let config = ctx.config()?;
        let mut cached_away: u64 = 0;
        for file in config.remote_files().filter(|f| !f.is_direct()) {
            let source = Source::File(file);
            let cache = ctx.cache.as_ref().context("cache manager gone")?;
            if cache.has_candidate(&source)
                || cache
                    .entries()
                    .any(|e| e.source == source.identifier())
            {
                cached_away += file.size();
            }
        }
        build_dir_needs = build_dir_needs.saturating_sub(cached_away);
    }

    // group needs per volume, accumulating shares of the same device
    let mut volumes: BTreeMap<u64, (u64, Vec<Utf8PathBuf>)> = BTreeMap::new();
    let mut record = |volume: u64, needs: u64, path: Utf8PathBuf| {
        let slot = volumes.entry(volume).or_default();
        slot.0 += needs;
        slot.1.push(path);
    };
    record(utils::volume_id(&target_path)?, target_needs, target_path);
    record(utils::volume_id(&build_dir)?, build_dir_needs, build_dir);
    if let Some(cache_dir) = cache_dir {
        record(utils::volume_id(&cache_dir)?, cache_needs, cache_dir);
    }

    let mut total_needs = 0;
    let mut total_free = 0;
    for (needs, paths) in volumes.values() {
        let free = utils::get_free_space(&paths[0])?;
        if *needs > free {
            let missing = needs - free;
            let paths = paths
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            line.fail(format!(
                "missing {} on disk for {paths}. {} required, {} free.",
                format_size(missing),
                format_size(*needs),
                format_size(free)
            ));
            return Ok(1);
        }
        total_needs += needs;
        total_free += free;
    }

    line.succeed(format!(
        "{} required, {} free.",
        format_size(total_needs),
        format_size(total_free)
    ));
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin() {
        assert_eq!(margin_for(1000), 100);
        assert_eq!(margin_for(0), 0);
    }

    #[test]
    fn test_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        assert_eq!(existing_ancestor(root), root);
        assert_eq!(existing_ancestor(&root.join("a/b/c.img")), root);
    }
}
