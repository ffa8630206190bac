//! Filesystem helpers: sizes, free space, xz image extraction and
//! archive expansion with member-path safety checks.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::os::unix::fs::MetadataExt;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::sources::ExpandMethod;

/// Size in bytes of a file.
pub(crate) fn get_filesize(fpath: &Utf8Path) -> Result<u64> {
    Ok(fpath
        .metadata()
        .with_context(|| format!("Reading size of {fpath}"))?
        .len())
}

/// Cumulated size in bytes of every file under a directory.
pub(crate) fn get_dirsize(fpath: &Utf8Path) -> Result<u64> {
    let mut total = 0;
    for dirent in walkdir::WalkDir::new(fpath) {
        let dirent = dirent.with_context(|| format!("Walking {fpath}"))?;
        if dirent.file_type().is_file() {
            total += dirent.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Size in bytes of a file or directory tree.
pub(crate) fn get_size_of(fpath: &Utf8Path) -> Result<u64> {
    if fpath.is_dir() {
        get_dirsize(fpath)
    } else {
        get_filesize(fpath)
    }
}

/// mkdir -p
pub(crate) fn ensure_dir(fpath: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(fpath).with_context(|| format!("Creating {fpath}"))
}

/// Free bytes available to unprivileged writers on the volume of `fpath`.
pub(crate) fn get_free_space(fpath: &Utf8Path) -> Result<u64> {
    let stat =
        rustix::fs::statvfs(fpath.as_std_path()).with_context(|| format!("statvfs {fpath}"))?;
    Ok(stat.f_bavail * stat.f_frsize)
}

/// Identifier of the volume holding `fpath`; equal ids mean shared free
/// space.
pub(crate) fn volume_id(fpath: &Utf8Path) -> Result<u64> {
    Ok(fpath
        .metadata()
        .with_context(|| format!("stat {fpath}"))?
        .dev())
}

/// Stream-decompress an xz image file into `dest`. Returns the number of
/// decompressed bytes written.
#[context("Extracting {src}")]
pub(crate) fn extract_xz_image(src: &Utf8Path, dest: &Utf8Path) -> Result<u64> {
    let reader = BufReader::new(File::open(src).with_context(|| format!("Opening {src}"))?);
    let mut decoder = xz2::read::XzDecoder::new(reader);
    let mut writer =
        BufWriter::new(File::create(dest).with_context(|| format!("Creating {dest}"))?);
    let written = std::io::copy(&mut decoder, &mut writer)?;
    Ok(written)
}

/// Expand an archive into `dest_dir`, refusing any member that would be
/// written outside of it.
#[context("Expanding {src}")]
pub(crate) fn expand_file(src: &Utf8Path, dest_dir: &Utf8Path, via: ExpandMethod) -> Result<()> {
    ensure_dir(dest_dir)?;
    match via {
        ExpandMethod::Direct => bail!("direct files are not archives"),
        ExpandMethod::Unzip => expand_zip(src, dest_dir),
        ExpandMethod::Untar => expand_tar(src, dest_dir),
    }
}

fn expand_zip(src: &Utf8Path, dest_dir: &Utf8Path) -> Result<()> {
    let reader = File::open(src).with_context(|| format!("Opening {src}"))?;
    let mut archive = zip::ZipArchive::new(reader).context("Reading zip archive")?;
    for index in 0..archive.len() {
        let member = archive.by_index(index)?;
        if member.enclosed_name().is_none() {
            bail!(
                "zip file contains out-of-bound member path: {}",
                member.name()
            );
        }
    }
    archive
        .extract(dest_dir.as_std_path())
        .context("Extracting zip archive")
}

fn expand_tar(src: &Utf8Path, dest_dir: &Utf8Path) -> Result<()> {
    let file = File::open(src).with_context(|| format!("Opening {src}"))?;
    let reader = BufReader::new(file);
    // the extension tells us which decompressor wraps the tar stream
    let name = src.as_str();
    let reader: Box<dyn std::io::Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(flate2::read::GzDecoder::new(reader))
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Box::new(xz2::read::XzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("Reading tar archive")? {
        let mut entry = entry.context("Reading tar member")?;
        let unpacked = entry
            .unpack_in(dest_dir.as_std_path())
            .context("Unpacking tar member")?;
        if !unpacked {
            bail!(
                "tar file contains out-of-bound member path: {}",
                entry.path().map(|p| p.display().to_string()).unwrap_or_default()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::io::Write;

    fn tmproot() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_sizes() {
        let (_guard, root) = tmproot();
        std::fs::write(root.join("a"), b"12345").unwrap();
        std::fs::create_dir(root.join("d")).unwrap();
        std::fs::write(root.join("d/b"), b"123").unwrap();
        assert_eq!(get_filesize(&root.join("a")).unwrap(), 5);
        assert_eq!(get_dirsize(&root).unwrap(), 8);
        assert_eq!(get_size_of(&root).unwrap(), 8);
        assert_eq!(get_size_of(&root.join("d/b")).unwrap(), 3);
    }

    #[test]
    fn test_free_space_and_volume() {
        let (_guard, root) = tmproot();
        assert!(get_free_space(&root).unwrap() > 0);
        let a = volume_id(&root).unwrap();
        let b = volume_id(&root).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_xz_image() {
        let (_guard, root) = tmproot();
        let payload = b"not really a disk image but good enough".repeat(1000);
        let src = root.join("img.xz");
        let mut encoder = xz2::write::XzEncoder::new(File::create(&src).unwrap(), 3);
        encoder.write_all(&payload).unwrap();
        encoder.finish().unwrap();

        let dest = root.join("img");
        let written = extract_xz_image(&src, &dest).unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[test]
    fn test_expand_tar() {
        let (_guard, root) = tmproot();
        let src = root.join("a.tar");
        let mut builder = tar::Builder::new(File::create(&src).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "inner/file.txt", &b"hello"[..])
            .unwrap();
        builder.finish().unwrap();

        let dest = root.join("out");
        expand_file(&src, &dest, ExpandMethod::Untar).unwrap();
        assert_eq!(
            std::fs::read(dest.join("inner/file.txt")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_expand_zip() {
        let (_guard, root) = tmproot();
        let src = root.join("a.zip");
        let mut writer = zip::ZipWriter::new(File::create(&src).unwrap());
        writer
            .start_file("inner/z.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"zipped").unwrap();
        writer.finish().unwrap();

        let dest = root.join("out");
        expand_file(&src, &dest, ExpandMethod::Unzip).unwrap();
        assert_eq!(std::fs::read(dest.join("inner/z.txt")).unwrap(), b"zipped");
    }
}
