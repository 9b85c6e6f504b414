//! Disk images and virtio-fs shares for VM bundles.
//!
//! ```text
//! Host:  <shared folder>
//!            |
//!     virtio-fs (tag: "shared")
//!            |
//! Guest: mount -t virtiofs shared /mnt/shared
//! ```
//!
//! vfkit exposes every virtio-fs share read-write. A read-only share is
//! honoured by the guest mounting the tag with `-o ro`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::vm::hypervisor::SharedFolder;

/// The virtiofs tag the shared folder is exposed under.
pub const VIRTIOFS_SHARED_TAG: &str = "shared";

/// Chunk size used when streaming an image onto a disk.
const COPY_CHUNK: usize = 8 << 20;

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// A virtio-fs directory share exposed to the VM.
///
/// One `VirtioFsShare` corresponds to one `--device virtio-fs,...` argument
/// passed to vfkit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioFsShare {
    /// Absolute path to the directory on the host to share.
    pub host_path: PathBuf,
    pub tag: String,
    pub read_only: bool,
}

impl VirtioFsShare {
    pub fn from_shared_folder(folder: &SharedFolder) -> Self {
        Self {
            host_path: folder.path.clone(),
            tag: VIRTIOFS_SHARED_TAG.to_string(),
            read_only: folder.read_only,
        }
    }
}

// ---------------------------------------------------------------------------
// vfkit argument generation
// ---------------------------------------------------------------------------

/// Generate the `--device virtio-fs,...` command-line arguments for vfkit.
///
/// ```text
/// --device virtio-fs,sharedDir=<host_path>,mountTag=<tag>
/// ```
pub fn build_vfkit_virtiofs_args(share: &VirtioFsShare) -> Vec<String> {
    let device_spec = format!(
        "virtio-fs,sharedDir={},mountTag={}",
        share.host_path.display(),
        share.tag,
    );
    vec!["--device".to_string(), device_spec]
}

// ---------------------------------------------------------------------------
// Disk images
// ---------------------------------------------------------------------------

/// Create a zero-filled raw disk image of `size_bytes` at `path`.
///
/// The file is sparse: it only consumes real blocks once the guest writes
/// them. Fails if `path` already exists.
pub fn create_disk_image(path: &Path, size_bytes: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(size_bytes)?;
    file.sync_all()
}

/// Stream `src` onto the start of `dst` without truncating it, calling
/// `progress` with the fraction copied after every chunk.
///
/// Fails if `src` is larger than `dst`'s current length.
pub fn copy_onto<F>(src: &Path, dst: &Path, mut progress: F) -> std::io::Result<u64>
where
    F: FnMut(f64),
{
    let mut input = File::open(src)?;
    let total = input.metadata()?.len();
    let capacity = std::fs::metadata(dst)?.len();
    if total > capacity {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "image {} ({total} bytes) does not fit on disk {} ({capacity} bytes)",
                src.display(),
                dst.display()
            ),
        ));
    }

    let mut output = OpenOptions::new().write(true).open(dst)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    progress(0.0);
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        copied += n as u64;
        progress(if total == 0 { 1.0 } else { copied as f64 / total as f64 });
    }
    output.sync_all()?;
    progress(1.0);
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_vfkit_virtiofs_args_full_format() {
        let share = VirtioFsShare {
            host_path: PathBuf::from("/Users/drew/share"),
            tag: VIRTIOFS_SHARED_TAG.to_string(),
            read_only: true,
        };

        let args = build_vfkit_virtiofs_args(&share);
        let expected = "virtio-fs,sharedDir=/Users/drew/share,mountTag=shared";

        assert_eq!(args, vec!["--device".to_string(), expected.to_string()]);
    }

    #[test]
    fn disk_image_has_requested_size_and_is_zeroed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");

        create_disk_image(&path, 1 << 20).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 1 << 20);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn disk_image_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        std::fs::write(&path, b"keep").unwrap();

        let err = create_disk_image(&path, 16).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }

    #[test]
    fn copy_onto_keeps_disk_length_and_reports_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("image.raw");
        let disk = tmp.path().join("disk.img");
        std::fs::write(&image, b"bootable").unwrap();
        create_disk_image(&disk, 64).unwrap();

        let mut seen = Vec::new();
        let copied = copy_onto(&image, &disk, |f| seen.push(f)).unwrap();

        assert_eq!(copied, 8);
        let bytes = std::fs::read(&disk).unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..8], b"bootable");
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[test]
    fn copy_onto_rejects_oversized_image() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("image.raw");
        let disk = tmp.path().join("disk.img");
        std::fs::write(&image, vec![1u8; 32]).unwrap();
        create_disk_image(&disk, 16).unwrap();

        let err = copy_onto(&image, &disk, |_| {}).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
