//! Block-device plumbing for file-backed images: loop devices, virtual
//! size queries, partition growth and filesystem checks. Everything here
//! shells out to the platform tooling (`losetup`, `qemu-img`, `fdisk`,
//! `partprobe`, `e2fsck`, `resize2fs`, `mount`, `umount`).

use std::fmt::Write as _;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use imager_utils::CommandRunExt;
use serde::{Deserialize, Deserializer};

/// Sector size assumed for partition arithmetic; matches what the
/// platform tooling reports for loop devices.
pub const SECTOR_SIZE: u64 = 512;

// lsblk (and losetup) emit numbers as JSON strings on older util-linux.
fn u64_flexible<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
        None,
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(v) => Ok(Some(v)),
        Raw::Str(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Raw::None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// One device (or partition) as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel device name, without the `/dev/` prefix.
    pub name: String,
    /// Device size in bytes.
    #[serde(default, deserialize_with = "u64_flexible")]
    pub size: Option<u64>,
    /// Start sector of a partition; absent for whole devices.
    #[serde(default, deserialize_with = "u64_flexible")]
    pub start: Option<u64>,
    /// Partitions of this device.
    pub children: Option<Vec<Device>>,
}

impl Device {
    // RHEL8's lsblk doesn't have PATH, so we do it
    /// Absolute path of the device node.
    pub fn path(&self) -> String {
        format!("/dev/{}", &self.name)
    }

    /// Whether this device has any partitions.
    pub fn has_children(&self) -> bool {
        self.children.as_ref().map_or(false, |v| !v.is_empty())
    }
}

#[context("Listing device {dev}")]
fn list_dev(dev: &str) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-o", "NAME,SIZE,START", dev])
        .lang_c()
        .run_and_parse_json()?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// Path of the `num`th partition node of a device.
///
/// Loop devices name partitions with a `p` infix (`/dev/loop0p3`).
pub fn partition_path(dev: &str, num: u32) -> String {
    format!("{dev}p{num}")
}

/// Size in bytes of the virtual device contained in a raw image file.
#[context("Reading virtual size of {fpath}")]
pub fn get_image_virtual_size(fpath: &Utf8Path) -> Result<u64> {
    #[derive(Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct ImageInfo {
        virtual_size: u64,
    }
    let info: ImageInfo = Command::new("qemu-img")
        .args(["info", "-f", "raw", "--output=json", fpath.as_str()])
        .lang_c()
        .run_and_parse_json()?;
    Ok(info.virtual_size)
}

/// Resize the virtual device inside a raw image file (grow only).
#[context("Resizing image {fpath}")]
pub fn resize_image(fpath: &Utf8Path, size: u64) -> Result<()> {
    Command::new("qemu-img")
        .args(["resize", "-f", "raw", fpath.as_str()])
        .arg(size.to_string())
        .lang_c()
        .run()
}

/// Path of a loop device that is currently unused.
pub fn find_free_loop_device() -> Result<String> {
    let out = Command::new("losetup")
        .arg("-f")
        .lang_c()
        .run_get_string()
        .context("Requesting a free loop device")?;
    Ok(out.trim().to_string())
}

/// Whether a loop device is not currently attached to a backing file.
#[context("Querying loop device {dev}")]
pub fn is_loop_device_free(dev: &str) -> Result<bool> {
    #[derive(Deserialize)]
    struct LoopDevices {
        loopdevices: Vec<LoopDevice>,
    }
    #[derive(Deserialize)]
    struct LoopDevice {
        name: String,
    }
    let out = Command::new("losetup")
        .arg("--json")
        .lang_c()
        .run_get_string()?;
    // losetup prints nothing at all when no device is attached
    if out.trim().is_empty() {
        return Ok(true);
    }
    let devs: LoopDevices = serde_json::from_str(&out).context("Parsing losetup output")?;
    Ok(!devs.loopdevices.iter().any(|d| d.name == dev))
}

/// Attach an image file to a loop device, scanning its partitions.
#[context("Attaching {fpath} to {dev}")]
pub fn attach(fpath: &Utf8Path, dev: &str) -> Result<()> {
    Command::new("losetup")
        .args(["--partscan", dev, fpath.as_str()])
        .lang_c()
        .run()
}

/// Detach a loop device.
#[context("Detaching {dev}")]
pub fn detach(dev: &str) -> Result<()> {
    Command::new("losetup")
        .args(["--detach", dev])
        .lang_c()
        .run()
}

/// Number of sectors composing a device.
pub fn get_device_sectors(dev: &str) -> Result<u64> {
    let size = list_dev(dev)?
        .size
        .ok_or_else(|| anyhow!("lsblk reported no size for {dev}"))?;
    Ok(size / SECTOR_SIZE)
}

/// Start sector of the last partition of a device.
pub fn get_last_partition_start(dev: &str) -> Result<u64> {
    let device = list_dev(dev)?;
    let parts = device
        .children
        .ok_or_else(|| anyhow!("no partitions on {dev}"))?;
    parts
        .last()
        .and_then(|p| p.start)
        .ok_or_else(|| anyhow!("lsblk reported no start sector for last partition of {dev}"))
}

// `d 3` deletes the third partition, `n p 3 <start> <end>` recreates it
// over the remaining space, `N` declines wiping the existing filesystem
// signature and `w` writes the table back.
fn fdisk_resize_script(start_sector: u64, end_sector: u64) -> String {
    let mut script = String::new();
    for cmd in [
        "d",
        "3",
        "n",
        "p",
        "3",
        &start_sector.to_string(),
        &end_sector.to_string(),
        "N",
        "w",
    ] {
        writeln!(script, "{cmd}").expect("writing to string");
    }
    script
}

/// Recreate the third partition of a device so it spans all remaining
/// space, then grow its (ext4) filesystem.
#[context("Resizing last partition of {dev}")]
pub fn resize_last_partition(dev: &str) -> Result<()> {
    let nb_sectors = get_device_sectors(dev)?;
    let start_sector = get_last_partition_start(dev)?;
    let end_sector = nb_sectors - 1;

    let script = fdisk_resize_script(start_sector, end_sector);
    if let Err(e) = Command::new("fdisk").arg(dev).lang_c().run_with_stdin(&script) {
        // fdisk may fail the BLKRRPART ioctl while the device is busy;
        // partprobe below settles the kernel view
        tracing::debug!("fdisk returned an error (continuing): {e}");
    }
    Command::new("partprobe")
        .args(["--summary", dev])
        .lang_c()
        .run()?;

    let part = partition_path(dev, 3);
    fsck(&part)?;
    Command::new("resize2fs").arg(&part).lang_c().run()
}

/// Run a preen-mode filesystem check on a partition.
#[context("Checking filesystem on {part_dev}")]
pub fn fsck(part_dev: &str) -> Result<()> {
    Command::new("e2fsck").args(["-p", part_dev]).lang_c().run()
}

/// Mount a device on the target path, optionally forcing the filesystem type.
#[context("Mounting {dev} on {mount_point}")]
pub fn mount_on(dev: &str, mount_point: &Utf8Path, fstype: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("mount");
    if let Some(fstype) = fstype {
        cmd.args(["-t", fstype]);
    }
    cmd.args([dev, mount_point.as_str()]).lang_c().run()
}

/// Unmount the given mount point.
#[context("Unmounting {mount_point}")]
pub fn unmount(mount_point: &Utf8Path) -> Result<()> {
    Command::new("umount")
        .arg(mount_point.as_str())
        .lang_c()
        .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_lsblk() {
        let fixture = indoc! { r#"
            {
               "blockdevices": [
                  {"name": "loop0", "size": 8589934592, "start": null,
                   "children": [
                      {"name": "loop0p1", "size": 536870912, "start": 8192},
                      {"name": "loop0p2", "size": 33554432, "start": 1056768},
                      {"name": "loop0p3", "size": 8018460672, "start": 1122304}
                   ]
                  }
               ]
            }
        "# };
        let devs: DevicesOutput = serde_json::from_str(fixture).unwrap();
        let dev = devs.blockdevices.into_iter().next().unwrap();
        assert_eq!(dev.path(), "/dev/loop0");
        assert!(dev.has_children());
        assert_eq!(dev.size, Some(8589934592));
        let parts = dev.children.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.last().unwrap().start, Some(1122304));
    }

    #[test]
    fn test_parse_lsblk_stringly() {
        // older util-linux quotes numbers
        let fixture = indoc! { r#"
            {"blockdevices": [{"name": "loop7", "size": "2147483648", "start": null}]}
        "# };
        let devs: DevicesOutput = serde_json::from_str(fixture).unwrap();
        assert_eq!(devs.blockdevices[0].size, Some(2147483648));
        assert!(!devs.blockdevices[0].has_children());
    }

    #[test]
    fn test_fdisk_script() {
        let script = fdisk_resize_script(1122304, 16777215);
        assert_eq!(script, "d\n3\nn\np\n3\n1122304\n16777215\nN\nw\n");
    }

    #[test]
    fn test_partition_path() {
        assert_eq!(partition_path("/dev/loop3", 1), "/dev/loop3p1");
    }
}
