//! Validation steps: system requirements, the configuration document,
//! source reachability, and the offspot document written to the boot
//! partition.

use anyhow::{Context, Result};
use imager_utils::format_size;

use crate::cache::manager::CacheManager;
use crate::config::MainConfig;
use crate::context::RunContext;
use crate::output::{self, TaskLine};
use crate::sources::{FileSource, Platform, Source};
use crate::{download, ociexport, utils};

const REQUIRED_BINARIES: [&str; 10] = [
    "losetup",
    "fdisk",
    "partprobe",
    "resize2fs",
    "e2fsck",
    "mount",
    "umount",
    "qemu-img",
    "aria2c",
    "skopeo",
];

const REQUIREMENTS_HELP: &str = r#"
Requirements
------------

kernel features:
    - `loop` must be enabled in your kernel or as a module
       if running inside a docker-container:
        - same loop feature applies to host's kernel
        - container must be run with --privileged
    - `ext4` filesystem (most likely enabled in-kernel)

tools:
    - losetup, mount, umount (mount / util-linux)
    - fdisk, partprobe (fdisk / util-linux)
    - resize2fs, e2fsck (e2fsprogs)
    - qemu-img (qemu-utils)
    - aria2c (aria2)
    - skopeo

Sample setup (debian)
sudo modprobe --first-time loop
sudo modprobe --first-time ext4
sudo apt-get install --no-install-recommends mount fdisk e2fsprogs qemu-utils aria2 skopeo
"#;

fn binary_in_path(name: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        candidate
            .metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

fn has_ext4_support() -> bool {
    std::fs::read_to_string("/proc/filesystems")
        .map(|text| {
            text.lines()
                .any(|line| line.split_whitespace().last() == Some("ext4"))
        })
        .unwrap_or(false)
}

/// Verify privileges, external tools, loop devices and ext4 support.
pub(crate) fn check_requirements(_ctx: &mut RunContext) -> Result<i32> {
    let mut all_good = true;

    let line = TaskLine::start("Checking uid");
    if rustix::process::geteuid().is_root() {
        line.done();
    } else {
        line.fail("you must be root");
        all_good = false;
    }

    let line = TaskLine::start("Checking binary dependencies");
    let missing: Vec<&str> = REQUIRED_BINARIES
        .iter()
        .copied()
        .filter(|b| !binary_in_path(b))
        .collect();
    if missing.is_empty() {
        line.done();
    } else {
        line.fail(format!("missing binaries: {}", missing.join(", ")));
        all_good = false;
    }

    let line = TaskLine::start("Checking loop-device capability");
    match imager_blockdev::find_free_loop_device() {
        Ok(_) => line.done(),
        Err(e) => {
            line.fail(format!("{e:#}"));
            all_good = false;
        }
    }

    let line = TaskLine::start("Checking ext4 support");
    if has_ext4_support() {
        line.done();
    } else {
        line.fail("not in /proc/filesystems");
        all_good = false;
    }

    if !all_good {
        println!("{REQUIREMENTS_HELP}");
        return Ok(2);
    }
    Ok(0)
}

fn touch(path: &camino::Utf8Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
}

/// Read and parse the configuration, then vet the output target.
pub(crate) fn check_inputs(ctx: &mut RunContext) -> Result<i32> {
    let line = TaskLine::start(format!("Reading config from {}", ctx.options.config_src));
    let text = match ctx.options.config_src.read_text() {
        Ok(text) => {
            line.done();
            text
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Err(e);
        }
    };

    let line = TaskLine::start("Parsing config data");
    let config = match MainConfig::read_from(&text) {
        Ok(config) => {
            line.done();
            config
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(3);
        }
    };

    let line = TaskLine::start("Making sure base and output are different");
    if config.base.file.is_local() && config.base.file.local_path()? == ctx.options.output_path {
        line.fail("base and output image are the same");
        return Ok(3);
    }
    line.done();

    if config.output.shrink || config.output.compress {
        output::task_note("output.shrink and output.compress are not supported; ignoring");
    }
    ctx.config = Some(config);

    let output_path = ctx.options.output_path.clone();
    if ctx.options.check_only {
        // non-destructive: leave an existing output in place
        let line = TaskLine::start("Testing target location");
        let existed = output_path.exists();
        match touch(&output_path) {
            Ok(()) => {
                if !existed {
                    let _ = std::fs::remove_file(&output_path);
                }
                line.succeed(&output_path);
            }
            Err(e) => {
                line.fail(e);
                return Ok(3);
            }
        }
        return Ok(0);
    }

    if output_path.exists() {
        if ctx.options.overwrite {
            let line = TaskLine::start("Removing target path");
            match std::fs::remove_file(&output_path) {
                Ok(()) => line.done(),
                Err(e) => line.fail(e),
            }
        } else {
            let line = TaskLine::start("Checking target path");
            line.fail(format!("{output_path} exists."));
            return Ok(3);
        }
    }

    let line = TaskLine::start("Testing target location");
    match touch(&output_path).and_then(|()| std::fs::remove_file(&output_path)) {
        Ok(()) => line.succeed(&output_path),
        Err(e) => {
            line.fail(e);
            return Ok(3);
        }
    }
    Ok(0)
}

fn check_one_file(file: &mut FileSource, cache: &mut CacheManager) -> Result<bool> {
    let line = TaskLine::start(format!("Checking {}", file.url_str()));

    let in_cache = {
        let source = Source::File(&*file);
        cache.in_cache(&source, true)?
    };
    if in_cache {
        let size = {
            let source = Source::File(&*file);
            cache.get(&source)?.size
        };
        if file.size.is_none() {
            file.size = Some(size);
        }
        line.succeed("in cache");
        return Ok(true);
    }

    if file.is_local() {
        match utils::get_filesize(&file.local_path()?) {
            Ok(size) => {
                file.size = Some(size);
                line.succeed(format_size(size));
            }
            Err(e) => {
                line.fail(format!("{e:#}"));
                return Ok(false);
            }
        }
    } else {
        let Some(url) = file.url.clone() else {
            line.fail("no URL");
            return Ok(false);
        };
        match download::get_online_size(&url) {
            Ok(Some(size)) => {
                file.size = Some(size);
                line.succeed(format_size(size));
            }
            Ok(None) => line.succeed("size unknown"),
            Err(e) => {
                line.fail(format!("{e:#}"));
                return Ok(false);
            }
        }
    }

    let source = Source::File(&*file);
    cache.add_candidate(&source)?;
    Ok(true)
}

/// Probe every declared source: a cached-and-fresh item passes as-is,
/// everything else must be reachable. Every non-cached item becomes a
/// cache candidate, then admission is settled in one pass.
pub(crate) fn check_urls(ctx: &mut RunContext) -> Result<i32> {
    let RunContext { config, cache, .. } = ctx;
    let config = config.as_mut().context("configuration not loaded yet")?;
    let cache = cache.as_mut().context("cache manager not initialized yet")?;

    let mut all_valid = true;

    all_valid &= check_one_file(&mut config.base.file, cache)?;
    for file in config.files.iter_mut() {
        if file.is_plain() {
            continue;
        }
        all_valid &= check_one_file(file, cache)?;
    }

    let platform = Platform::target();
    for image in &config.oci_images {
        let line = TaskLine::start(format!("Checking OCI image {}", image.identifier()));
        let source = Source::Image(image);
        if cache.in_cache(&source, true)? {
            line.succeed("in cache");
        } else if ociexport::image_exists(&image.oci, &platform) {
            line.done();
            cache.add_candidate(&source)?;
        } else {
            line.fail("not found on registry");
            all_valid = false;
        }
    }

    cache.apply_candidates()?;

    Ok(if all_valid { 0 } else { 4 })
}

/// Serialize the `offspot` document onto the boot partition.
pub(crate) fn writing_offspot_config(ctx: &mut RunContext) -> Result<i32> {
    let offspot = ctx.config()?.offspot.clone();
    if offspot.is_empty() {
        output::task_note("No offspot config passed");
        return Ok(0);
    }
    let mount_point = ctx
        .image
        .as_ref()
        .and_then(|i| i.p1_mounted_on())
        .context("boot partition is not mounted")?;
    let fpath = mount_point.join("offspot.yaml");
    let line = TaskLine::start(format!("Saving offspot config to {fpath}"));
    let text = match serde_yaml::to_string(&serde_yaml::Value::Mapping(offspot)) {
        Ok(text) => text,
        Err(e) => {
            line.fail(e);
            return Ok(1);
        }
    };
    match std::fs::write(&fpath, text) {
        Ok(()) => {
            line.done();
            Ok(0)
        }
        Err(e) => {
            line.fail(e);
            Ok(1)
        }
    }
}
