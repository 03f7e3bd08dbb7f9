//! Collaborator seams: device probing, region loading, host identity, and
//! metadata-directory resolution.
//!
//! Everything here that touches the outside world is behind a trait so
//! failure scenarios compose in tests by swapping implementations — there
//! are no process-wide failure switches anywhere in FabFS.

use fabfs_error::{FabError, Result};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

/// Hidden metadata directory at the root of a mounted namespace.
pub const META_DIR: &str = ".meta";
/// Superblock file relative to the mount root.
pub const SB_RELPATH: &str = ".meta/.superblock";
/// Log file relative to the mount root.
pub const LOG_RELPATH: &str = ".meta/.log";

/// Backing-store kinds FabFS can sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Regular file (image, or the materialized `.meta` records).
    Regular,
    /// Block device.
    Block,
    /// Byte-addressable character device (dax).
    Char,
}

/// What a probe learned about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    /// Usable byte capacity.
    pub size: u64,
}

/// Resolves a path to its usable capacity and backing-store kind.
///
/// Anything that is not a regular file, block device, or byte-addressable
/// character device (pipes, sockets, directories) is rejected before any
/// read is attempted.
pub trait DeviceProbe {
    fn probe(&self, path: &Path) -> Result<DeviceInfo>;
}

/// The production probe, backed by `stat` and sysfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysDeviceProbe;

impl DeviceProbe for SysDeviceProbe {
    fn probe(&self, path: &Path) -> Result<DeviceInfo> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let metadata = fs::metadata(path)?;
        let file_type = metadata.file_type();

        if file_type.is_file() {
            return Ok(DeviceInfo {
                kind: DeviceKind::Regular,
                size: metadata.len(),
            });
        }
        if file_type.is_block_device() {
            // Block device capacity is the seekable extent of the node.
            let mut file = File::open(path)?;
            let size = file.seek(SeekFrom::End(0))?;
            return Ok(DeviceInfo {
                kind: DeviceKind::Block,
                size,
            });
        }
        if file_type.is_char_device() {
            // Byte-addressable (dax) character devices publish their size
            // in sysfs; a char device without that attribute (e.g.
            // /dev/zero) is not usable storage.
            let rdev = metadata.rdev();
            let sysfs = format!(
                "/sys/dev/char/{}:{}/size",
                nix::sys::stat::major(rdev),
                nix::sys::stat::minor(rdev)
            );
            let text = fs::read_to_string(&sysfs).map_err(|_| {
                FabError::TypeMismatch(format!(
                    "{} is not a byte-addressable device",
                    path.display()
                ))
            })?;
            let size = text.trim().parse::<u64>().map_err(|_| {
                FabError::TypeMismatch(format!(
                    "{} has an unparsable size attribute",
                    path.display()
                ))
            })?;
            return Ok(DeviceInfo {
                kind: DeviceKind::Char,
                size,
            });
        }

        Err(FabError::TypeMismatch(format!(
            "{} is not a regular file, block device, or dax device",
            path.display()
        )))
    }
}

// ── Region loading ──────────────────────────────────────────────────────────

/// How to expose file bytes to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Memory-map the file read-only.
    Mmap,
    /// Read it into an owned buffer.
    #[default]
    Buffered,
}

/// A read-only view of a file's bytes, mapped or owned.
#[derive(Debug)]
pub enum Region {
    Mapped(memmap2::Mmap),
    Buffered(Vec<u8>),
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Buffered(buf) => buf,
        }
    }
}

/// Load a whole file per `policy`.
///
/// An empty file loads as a zero-length view rather than an error.
#[allow(unsafe_code)]
pub fn load_region(path: &Path, policy: ReadPolicy) -> Result<Region> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Region::Buffered(Vec::new()));
    }
    match policy {
        ReadPolicy::Mmap => {
            // SAFETY: the map is read-only and private to this process;
            // concurrent log appends only touch committed-count-gated
            // slots, which replay never reads past.
            let map = unsafe { memmap2::Mmap::map(&file)? };
            Ok(Region::Mapped(map))
        }
        ReadPolicy::Buffered => {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(Region::Buffered(buf))
        }
    }
}

// ── Host identity ───────────────────────────────────────────────────────────

/// Supplies the local host's system UUID, used to resolve the mount role
/// against the superblock's ownership metadata.
pub trait SystemIdentity {
    fn system_uuid(&self) -> Result<[u8; 16]>;
}

/// Reads the system UUID from a bootstrap file (one UUID string).
#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
}

impl FileIdentity {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SystemIdentity for FileIdentity {
    fn system_uuid(&self) -> Result<[u8; 16]> {
        let text = fs::read_to_string(&self.path)?;
        let parsed = uuid::Uuid::parse_str(text.trim()).map_err(|err| {
            FabError::Parse(format!("system uuid file {}: {err}", self.path.display()))
        })?;
        Ok(parsed.into_bytes())
    }
}

/// A fixed identity, for tests and single-host tooling.
#[derive(Debug, Clone, Copy)]
pub struct FixedIdentity(pub [u8; 16]);

impl SystemIdentity for FixedIdentity {
    fn system_uuid(&self) -> Result<[u8; 16]> {
        Ok(self.0)
    }
}

// ── Metadata directory resolution ───────────────────────────────────────────

/// Ascend from `start` through parent directories until one contains the
/// hidden metadata directory, returning that mount root.
///
/// An empty path, the bare filesystem root, and a path with no separator
/// at all are rejected up front; a start point that does not exist is fine
/// as long as some ancestor holds `.meta`.
pub fn ascend_to_meta(start: &Path) -> Result<PathBuf> {
    if start.as_os_str().is_empty() {
        return Err(FabError::InvalidArgument("empty path".into()));
    }
    if start == Path::new("/") {
        return Err(FabError::InvalidArgument(
            "the filesystem root is not a mount point".into(),
        ));
    }
    if !start.to_string_lossy().contains('/') {
        return Err(FabError::InvalidArgument(format!(
            "path {:?} has no directory component",
            start.display()
        )));
    }

    for ancestor in start.ancestors() {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if ancestor.join(META_DIR).is_dir() {
            return Ok(ancestor.to_path_buf());
        }
    }
    Err(FabError::NotFound(format!(
        "no ancestor of {} contains {META_DIR}",
        start.display()
    )))
}

/// Normalize a path against the mount root into the relative form stored
/// in log entries.
///
/// Absolute paths must point inside the mount; `..` components and empty
/// results are rejected.
pub fn relativize(mount_root: &Path, path: &Path) -> Result<String> {
    let relative = if path.is_absolute() {
        path.strip_prefix(mount_root).map_err(|_| {
            FabError::InvalidArgument(format!(
                "{} is outside the mount at {}",
                path.display(),
                mount_root.display()
            ))
        })?
    } else {
        path
    };

    if relative.as_os_str().is_empty() {
        return Err(FabError::InvalidArgument(
            "path names the mount root itself".into(),
        ));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(FabError::InvalidArgument(format!(
                    "path {:?} is not in plain relative form",
                    relative.display()
                )));
            }
        }
    }
    relative
        .to_str()
        .map(str::to_owned)
        .ok_or_else(|| FabError::InvalidArgument("path is not valid UTF-8".into()))
}
