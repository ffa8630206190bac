//! Exporting the declared OCI images onto the data partition.

use anyhow::Result;
use imager_utils::format_size;

use crate::context::RunContext;
use crate::output::{self, TaskLine};
use crate::sources::{Platform, Source};
use crate::{ociexport, utils};

/// Export (or copy from cache) every declared image as a tar under
/// `images/` on the data partition.
pub(crate) fn downloading_oci_images(ctx: &mut RunContext) -> Result<i32> {
    let mount_point = ctx.data_mount_point()?.to_path_buf();
    let images_dir = mount_point.join("images");
    let build_dir = ctx.options.build_dir.join("oci_export");

    let line = TaskLine::start("Creating OCI images placeholder");
    if let Err(e) = utils::ensure_dir(&images_dir) {
        line.fail(format!("{e:#}"));
        return Ok(1);
    }
    line.succeed(&images_dir);

    let images = ctx.config()?.oci_images.clone();
    let platform = Platform::target();
    for image in &images {
        let target = images_dir.join(format!("{}.tar", image.oci.fs_name()));
        let source = Source::Image(image);

        let in_cache = ctx.cache_mut()?.in_cache(&source, false)?;
        if in_cache {
            let line = TaskLine::start(format!("Copying {} from cache", image.identifier()));
            match ctx.cache_mut()?.copy_out(&source, &target) {
                Ok(copied) => {
                    line.succeed(format_size(copied));
                    continue;
                }
                Err(e) => {
                    line.fail(format!("{e:#}"));
                    return Ok(1);
                }
            }
        }

        output::task_note(format!(
            "Downloading OCI image {} to {}…",
            image.identifier(),
            target.strip_prefix(&mount_point).unwrap_or(&target)
        ));
        if let Err(e) = ociexport::export(&image.oci, &platform, &target, &build_dir) {
            let line = TaskLine::start("Export");
            line.fail(format!("{e:#}"));
            let _ = std::fs::remove_dir_all(&build_dir);
            return Ok(1);
        }
        let size = utils::get_filesize(&target).unwrap_or(0);
        output::task_note(format!("downloaded {} ({})", target, format_size(size)));

        let cache = ctx.cache_mut()?;
        if cache.should_cache(&source)? {
            let line = TaskLine::start("Introducing image into cache");
            if cache.introduce(&source, &target)? {
                line.done();
            } else {
                line.fail("not cached");
            }
        }
    }
    Ok(0)
}
