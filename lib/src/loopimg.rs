//! A file-backed disk image that can be attached to a loop device,
//! grown, and have its boot (p1, vfat) and data (p3, ext4) partitions
//! mounted.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imager_blockdev as blockdev;

/// Handle over the output image file and the resources (loop device,
/// mount points) acquired while assembling it.
#[derive(Debug)]
pub(crate) struct LoopbackImage {
    fpath: Utf8PathBuf,
    /// Where temporary mount points are created.
    mount_in: Utf8PathBuf,
    loop_dev: Option<String>,
    p1_mounted_on: Option<Utf8PathBuf>,
    p3_mounted_on: Option<Utf8PathBuf>,
}

impl LoopbackImage {
    /// Wrap an existing image file, verifying it is readable.
    #[context("Opening image {fpath}")]
    pub(crate) fn new(fpath: &Utf8Path, mount_in: &Utf8Path) -> Result<Self> {
        let mut probe = [0u8; 1024];
        std::fs::File::open(fpath)
            .and_then(|mut f| f.read(&mut probe))
            .with_context(|| format!("Reading {fpath}"))?;
        Ok(Self {
            fpath: fpath.to_path_buf(),
            mount_in: mount_in.to_path_buf(),
            loop_dev: None,
            p1_mounted_on: None,
            p3_mounted_on: None,
        })
    }

    pub(crate) fn loop_dev(&self) -> Option<&str> {
        self.loop_dev.as_deref()
    }

    pub(crate) fn p1_mounted_on(&self) -> Option<&Utf8Path> {
        self.p1_mounted_on.as_deref()
    }

    pub(crate) fn p3_mounted_on(&self) -> Option<&Utf8Path> {
        self.p3_mounted_on.as_deref()
    }

    /// Virtual device size of the image.
    pub(crate) fn get_size(&self) -> Result<u64> {
        blockdev::get_image_virtual_size(&self.fpath)
    }

    /// Grow the virtual device to `size` bytes.
    pub(crate) fn resize(&self, size: u64) -> Result<()> {
        blockdev::resize_image(&self.fpath, size)
    }

    /// Reserve a currently-free loop device for this image.
    pub(crate) fn assign_loop_device(&mut self) -> Result<String> {
        let dev = blockdev::find_free_loop_device()?;
        self.loop_dev = Some(dev.clone());
        Ok(dev)
    }

    /// Attach the image to its loop device, re-assigning one if the
    /// reserved device got taken in the meantime.
    pub(crate) fn attach(&mut self) -> Result<()> {
        let needs_reassign = match &self.loop_dev {
            None => true,
            Some(dev) => !blockdev::is_loop_device_free(dev)?,
        };
        if needs_reassign {
            self.assign_loop_device()?;
        }
        let dev = self.loop_dev.as_ref().ok_or_else(|| anyhow!("no loop device"))?;
        blockdev::attach(&self.fpath, dev)
    }

    /// Unmount everything and release the loop device. Returns false when
    /// nothing was attached or the detach failed.
    pub(crate) fn detach(&mut self) -> bool {
        self.unmount_all();
        let Some(dev) = self.loop_dev.clone() else {
            return false;
        };
        match blockdev::detach(&dev) {
            Ok(()) => {
                self.loop_dev = None;
                true
            }
            Err(e) => {
                tracing::warn!("detaching {dev} failed: {e:#}");
                false
            }
        }
    }

    /// Grow the third partition and its filesystem to the end of the
    /// device.
    pub(crate) fn resize_last_part(&self) -> Result<()> {
        let dev = self.require_loop_dev()?;
        blockdev::resize_last_partition(dev)
    }

    /// Filesystem-check the data partition.
    pub(crate) fn fsck_data_part(&self) -> Result<()> {
        let dev = self.require_loop_dev()?;
        blockdev::fsck(&blockdev::partition_path(dev, 3))
    }

    pub(crate) fn mount_p1(&mut self) -> Result<Utf8PathBuf> {
        self.mount_part(1, "vfat")
    }

    pub(crate) fn mount_p3(&mut self) -> Result<Utf8PathBuf> {
        self.mount_part(3, "ext4")
    }

    pub(crate) fn unmount_p1(&mut self) -> Result<()> {
        self.unmount_part(1)
    }

    pub(crate) fn unmount_p3(&mut self) -> Result<()> {
        self.unmount_part(3)
    }

    fn require_loop_dev(&self) -> Result<&str> {
        self.loop_dev
            .as_deref()
            .ok_or_else(|| anyhow!("image {} is not attached", self.fpath))
    }

    fn mount_slot(&mut self, part_num: u32) -> &mut Option<Utf8PathBuf> {
        match part_num {
            1 => &mut self.p1_mounted_on,
            _ => &mut self.p3_mounted_on,
        }
    }

    #[context("Mounting partition {part_num}")]
    fn mount_part(&mut self, part_num: u32, fstype: &str) -> Result<Utf8PathBuf> {
        let dev = self.require_loop_dev()?.to_string();
        let mount_point = tempfile::Builder::new()
            .prefix(&format!("part{part_num}_"))
            .tempdir_in(self.mount_in.as_std_path())
            .with_context(|| format!("Creating mount point in {}", self.mount_in))?
            .into_path();
        let mount_point = Utf8PathBuf::from_path_buf(mount_point)
            .map_err(|p| anyhow!("non-UTF8 mount point {p:?}"))?;
        blockdev::mount_on(
            &blockdev::partition_path(&dev, part_num),
            &mount_point,
            Some(fstype),
        )?;
        *self.mount_slot(part_num) = Some(mount_point.clone());
        Ok(mount_point)
    }

    #[context("Unmounting partition {part_num}")]
    fn unmount_part(&mut self, part_num: u32) -> Result<()> {
        let Some(mount_point) = self.mount_slot(part_num).clone() else {
            return Ok(());
        };
        blockdev::unmount(&mount_point)?;
        *self.mount_slot(part_num) = None;
        if let Err(e) = std::fs::remove_dir(&mount_point) {
            tracing::debug!("could not remove mount point {mount_point}: {e}");
        }
        Ok(())
    }

    /// Best-effort unmount of every partition we mounted.
    pub(crate) fn unmount_all(&mut self) {
        for part_num in [1, 3] {
            if let Err(e) = self.unmount_part(part_num) {
                tracing::warn!("unmounting p{part_num} failed: {e:#}");
            }
        }
    }
}
