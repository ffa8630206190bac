//! Block-device steps: growing the image, attaching it to a loop device,
//! mounting and unmounting its partitions.

use anyhow::Result;
use imager_utils::format_size;

use crate::context::RunContext;
use crate::loopimg::LoopbackImage;
use crate::output::TaskLine;

/// Grow the image file to the computed output size, attach it and grow
/// the third partition with its filesystem.
pub(crate) fn resizing_image(ctx: &mut RunContext) -> Result<i32> {
    let output_size = ctx.output_size;

    let line = TaskLine::start("Checking image size");
    let mut image = match LoopbackImage::new(&ctx.options.output_path, &ctx.options.build_dir) {
        Ok(image) => image,
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(1);
        }
    };
    match image.get_size() {
        Ok(size) => line.succeed(format_size(size)),
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(1);
        }
    }

    let line = TaskLine::start(format!("Resizing image to {output_size}b"));
    if let Err(e) = image.resize(output_size) {
        line.fail(format!("{e:#}"));
        return Ok(1);
    }
    match image.get_size() {
        Ok(size) => line.succeed(format_size(size)),
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(1);
        }
    }

    let line = TaskLine::start("Getting a loop device");
    let loop_dev = match image.assign_loop_device() {
        Ok(dev) => {
            line.succeed(&dev);
            dev
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(1);
        }
    };

    let line = TaskLine::start(format!("Attaching image to {loop_dev}"));
    if let Err(e) = image.attach() {
        line.fail(format!("{e:#}"));
        return Ok(1);
    }
    line.done();

    let line = TaskLine::start(format!("Resizing third partition of {loop_dev}"));
    if let Err(e) = image.resize_last_part() {
        line.fail(format!("{e:#}"));
        ctx.image = Some(image);
        return Ok(1);
    }
    line.done();

    ctx.image = Some(image);
    Ok(0)
}

pub(crate) fn mounting_data_part(ctx: &mut RunContext) -> Result<i32> {
    let image = ctx.image_mut()?;
    let dev = image.loop_dev().unwrap_or("?").to_string();
    let line = TaskLine::start(format!("Mounting {dev}p3"));
    match image.mount_p3() {
        Ok(mounted_on) => {
            line.succeed(mounted_on);
            Ok(0)
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            Ok(1)
        }
    }
}

/// Unmount the data partition and filesystem-check it.
pub(crate) fn unmounting_data_part(ctx: &mut RunContext) -> Result<i32> {
    let image = ctx.image_mut()?;
    let line = TaskLine::start("Unmounting data partition");
    if let Err(e) = image.unmount_p3() {
        line.fail(format!("{e:#}"));
        return Ok(1);
    }
    line.done();

    let line = TaskLine::start("Checking data partition filesystem");
    match image.fsck_data_part() {
        Ok(()) => {
            line.done();
            Ok(0)
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            Ok(1)
        }
    }
}

pub(crate) fn mounting_boot_part(ctx: &mut RunContext) -> Result<i32> {
    let image = ctx.image_mut()?;
    let dev = image.loop_dev().unwrap_or("?").to_string();
    let line = TaskLine::start(format!("Mounting {dev}p1"));
    match image.mount_p1() {
        Ok(mounted_on) => {
            line.succeed(mounted_on);
            Ok(0)
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            Ok(1)
        }
    }
}

pub(crate) fn unmounting_boot_part(ctx: &mut RunContext) -> Result<i32> {
    let image = ctx.image_mut()?;
    let line = TaskLine::start("Unmounting boot partition");
    match image.unmount_p1() {
        Ok(()) => {
            line.done();
            Ok(0)
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            Ok(1)
        }
    }
}

pub(crate) fn detaching_image(ctx: &mut RunContext) -> Result<i32> {
    let image = ctx.image_mut()?;
    let dev = image.loop_dev().unwrap_or("?").to_string();
    let line = TaskLine::start(format!("Detaching image from {dev}"));
    if image.detach() {
        line.done();
        Ok(0)
    } else {
        line.fail("not detached!");
        Ok(1)
    }
}
