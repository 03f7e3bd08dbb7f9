//! Mount-side services for FabFS: mkfs, role resolution, the single-writer
//! locked log, and fsck.
//!
//! The concurrency unit is the host process holding the locked log. At
//! most one process across the shared-memory domain may hold the append
//! lock; this is enforced by an advisory `flock` on the log file plus an
//! independent role check — a client is rejected even when the lock itself
//! would be obtainable. Read-only diagnostics (fsck, logplay) never take
//! the lock: they only trust entries at indexes below the committed count,
//! which are immutable.

pub mod device;
pub mod fsck;

pub use device::{
    DeviceInfo, DeviceKind, DeviceProbe, FileIdentity, FixedIdentity, LOG_RELPATH, META_DIR,
    ReadPolicy, Region, SB_RELPATH, SysDeviceProbe, SystemIdentity, ascend_to_meta, load_region,
    relativize,
};
pub use fsck::{FsckOptions, FsckReport, fsck};

use fabfs_alloc::ExtentAllocator;
use fabfs_error::{FabError, Result};
use fabfs_ondisk::{
    DirCreate, FileCreate, LogEntry, LogHeader, LogPayload, Superblock, log_entry_offset,
};
use fabfs_replay::{DirRecord, FileRecord, Namespace, Replay};
use fabfs_types::{
    FABFS_LOG_LEN, FABFS_MAX_EXTENTS, LOG_HEADER_SIZE, SUPERBLOCK_RECORD_SIZE, u64_to_usize,
};
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ── Role ────────────────────────────────────────────────────────────────────

/// Per-host mutation privilege, resolved once at mount time and passed
/// explicitly to every mutating call — never re-derived mid-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This host created the filesystem and may append to the log.
    Master,
    /// Another host owns the filesystem; this host may only replay/read.
    Client,
    /// No valid superblock exists yet.
    NoSuper,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Master => "master",
            Self::Client => "client",
            Self::NoSuper => "no-superblock",
        };
        f.write_str(name)
    }
}

/// Resolve the mount role from the superblock's ownership metadata and the
/// local host identity.
pub fn resolve_role(sb: Option<&Superblock>, identity: &dyn SystemIdentity) -> Result<Role> {
    let Some(sb) = sb else {
        return Ok(Role::NoSuper);
    };
    if sb.validate().is_err() {
        return Ok(Role::NoSuper);
    }
    let local = identity.system_uuid()?;
    Ok(if local == sb.system_uuid {
        Role::Master
    } else {
        Role::Client
    })
}

// ── mkfs ────────────────────────────────────────────────────────────────────

/// Knobs for filesystem creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MkfsOptions {
    /// Overwrite an existing valid superblock.
    pub force: bool,
    /// Invalidate any existing superblock magic before formatting.
    pub kill: bool,
    /// Log region length override; `None` uses the default geometry.
    pub log_len: Option<u64>,
}

/// Format superblock and log regions in place.
///
/// This is the device-independent half of mkfs: the caller supplies the
/// two (mapped or buffered) regions and persists them afterwards. A valid
/// superblock already present in `sb_region` blocks the format unless
/// `force` is set; `kill` zeroes its magic first, which also makes the old
/// filesystem unrecognizable to every other host.
pub fn mkfs_regions(
    sb_region: &mut [u8],
    log_region: &mut [u8],
    device_size: u64,
    identity: &dyn SystemIdentity,
    opts: &MkfsOptions,
) -> Result<Superblock> {
    if opts.kill && sb_region.len() >= SUPERBLOCK_RECORD_SIZE {
        Superblock::invalidate_region(sb_region)
            .map_err(|err| FabError::Parse(format!("kill superblock: {err}")))?;
        info!("existing superblock invalidated");
    }

    if !opts.force
        && let Ok(existing) = Superblock::parse_from_bytes(sb_region)
        && existing.validate().is_ok()
    {
        return Err(FabError::AlreadyFormatted);
    }

    let log_len = opts.log_len.unwrap_or(FABFS_LOG_LEN);
    let usable_log = u64_to_usize(log_len, "log_len")
        .map_err(|err| FabError::InvalidArgument(err.to_string()))?;
    if log_region.len() < usable_log {
        return Err(FabError::InvalidArgument(format!(
            "log region holds {} bytes, geometry needs {usable_log}",
            log_region.len()
        )));
    }

    let sb = Superblock::build_with_log_len(
        device_size,
        uuid::Uuid::new_v4().into_bytes(),
        identity.system_uuid()?,
        log_len,
    )
    .map_err(|err| FabError::InvalidArgument(err.to_string()))?;

    sb.write_to_bytes(sb_region)
        .map_err(|err| FabError::Parse(format!("write superblock: {err}")))?;

    let header = LogHeader::new(sb.log_capacity());
    log_region[..usable_log].fill(0);
    header
        .write_to_bytes(log_region)
        .map_err(|err| FabError::Parse(format!("write log header: {err}")))?;

    info!(
        device_size,
        log_len,
        capacity = header.capacity,
        "filesystem created"
    );
    Ok(sb)
}

/// Create a filesystem at `target`.
///
/// A directory target materializes the superblock and log as files under
/// its hidden metadata directory (the mock/mount-root form); a device or
/// image target writes both records at their device offsets. `device_size`
/// must be given for the directory form and overrides the probed size
/// otherwise. mkfs expects to run with no concurrent mounts.
pub fn mkfs_at(
    target: &Path,
    device_size: Option<u64>,
    identity: &dyn SystemIdentity,
    probe: &dyn DeviceProbe,
    opts: &MkfsOptions,
) -> Result<Superblock> {
    let log_len = opts.log_len.unwrap_or(FABFS_LOG_LEN);
    let log_len_usize =
        u64_to_usize(log_len, "log_len").map_err(|err| FabError::InvalidArgument(err.to_string()))?;

    if target.is_dir() {
        let size = device_size.ok_or_else(|| {
            FabError::InvalidArgument("a directory target needs an explicit device size".into())
        })?;
        let meta = target.join(META_DIR);
        fs::create_dir_all(&meta)?;
        let sb_path = target.join(SB_RELPATH);
        let log_path = target.join(LOG_RELPATH);

        let mut sb_region = vec![0_u8; SUPERBLOCK_RECORD_SIZE];
        if let Ok(existing) = fs::read(&sb_path) {
            let take = existing.len().min(SUPERBLOCK_RECORD_SIZE);
            sb_region[..take].copy_from_slice(&existing[..take]);
        }
        let mut log_region = vec![0_u8; log_len_usize];

        let sb = mkfs_regions(&mut sb_region, &mut log_region, size, identity, opts)?;
        fs::write(&sb_path, &sb_region)?;
        fs::write(&log_path, &log_region)?;
        return Ok(sb);
    }

    let info = probe.probe(target)?;
    let size = device_size.unwrap_or(info.size);
    let file = OpenOptions::new().read(true).write(true).open(target)?;

    let mut sb_region = vec![0_u8; SUPERBLOCK_RECORD_SIZE];
    // A fresh device may be all zeroes or shorter than the record; a short
    // read just leaves zeroes, which parse (and fail validation) cleanly.
    let mut filled = 0;
    while filled < sb_region.len() {
        let n = file.read_at(&mut sb_region[filled..], filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let mut log_region = vec![0_u8; log_len_usize];
    let sb = mkfs_regions(&mut sb_region, &mut log_region, size, identity, opts)?;
    file.write_all_at(&sb_region, 0)?;
    file.write_all_at(&log_region, sb.log_offset)?;
    file.sync_data()?;
    Ok(sb)
}

// ── Locked log ──────────────────────────────────────────────────────────────

/// How to wait for the append lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Suspend until the lock is available.
    Blocking,
    /// Fail immediately with [`FabError::Busy`] if it is held.
    NonBlocking,
}

/// The single-writer mutation handle for one filesystem instance.
///
/// While held, this process is the sole log writer across the whole
/// shared-memory domain: an advisory exclusive `flock` on the log file
/// arbitrates between processes and hosts, and the role check rejects
/// clients even where a shared lock manager would have granted the lock.
/// Dropping the handle releases the lock; [`LockedLog::release`] does the
/// same with an error path.
pub struct LockedLog {
    mount_root: PathBuf,
    sb: Superblock,
    lock: Flock<File>,
    header: LogHeader,
    namespace: Namespace,
    allocator: ExtentAllocator,
}

/// Resolve the mount, check the role, lock the log, and rebuild state.
///
/// Fails with [`FabError::RoleViolation`] for the client and no-superblock
/// roles before the log is ever opened for writing, with [`FabError::Io`]
/// when the log file is not writable by this process, and with
/// [`FabError::Busy`] when `NonBlocking` finds the lock taken.
pub fn init_locked_log(
    path: &Path,
    identity: &dyn SystemIdentity,
    mode: LockMode,
) -> Result<LockedLog> {
    let mount_root = ascend_to_meta(path)?;
    let sb_path = mount_root.join(SB_RELPATH);

    let sb = if sb_path.is_file() {
        let region = load_region(&sb_path, ReadPolicy::Buffered)?;
        Superblock::parse_from_bytes(&region).ok()
    } else {
        None
    };
    let role = resolve_role(sb.as_ref(), identity)?;
    let sb = match role {
        Role::Master => sb.unwrap_or_else(|| unreachable!("master role implies a superblock")),
        Role::Client | Role::NoSuper => {
            return Err(FabError::RoleViolation(format!(
                "{role} role may not hold the mutation lock"
            )));
        }
    };

    let log_path = mount_root.join(LOG_RELPATH);
    let log_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&log_path)
        .map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                FabError::NotFound(format!("log file {}", log_path.display()))
            } else {
                FabError::Io(err)
            }
        })?;

    let flock_arg = match mode {
        LockMode::Blocking => FlockArg::LockExclusive,
        LockMode::NonBlocking => FlockArg::LockExclusiveNonblock,
    };
    let lock = Flock::lock(log_file, flock_arg).map_err(|(_, errno)| {
        if errno == nix::errno::Errno::EWOULDBLOCK {
            FabError::Busy
        } else {
            FabError::Io(std::io::Error::from_raw_os_error(errno as i32))
        }
    })?;

    let log_len = u64_to_usize(sb.log_len, "log_len")
        .map_err(|err| FabError::Structural(err.to_string()))?;
    let mut log_region = vec![0_u8; log_len];
    lock.read_exact_at(&mut log_region, 0).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            FabError::Structural("log file shorter than its region".into())
        } else {
            FabError::Io(err)
        }
    })?;

    let replay = Replay::run(&log_region, &sb)?.into_result()?;
    debug!(
        mount = %mount_root.display(),
        entries = replay.stats.entries_applied,
        "locked log initialized"
    );
    Ok(LockedLog {
        mount_root,
        sb,
        lock,
        header: LogHeader::parse_from_bytes(&log_region)
            .map_err(|err| FabError::Structural(format!("log header: {err}")))?,
        namespace: replay.namespace,
        allocator: replay.allocator,
    })
}

impl LockedLog {
    /// Append one entry under the held lock.
    ///
    /// The entry slot is written and synced before the header commits the
    /// new count, so a crash between the two leaves the log at its old,
    /// fully valid length.
    pub fn append(&mut self, payload: LogPayload) -> Result<u64> {
        if self.header.slots_available() == 0 {
            return Err(FabError::LogFull);
        }
        let seq = self.header.count;
        let entry = LogEntry { seq, payload };
        let bytes = entry
            .to_bytes()
            .map_err(|err| FabError::InvalidArgument(err.to_string()))?;
        let offset = log_entry_offset(seq).ok_or_else(|| {
            FabError::Structural("entry offset overflows the log region".into())
        })?;

        self.lock.write_all_at(&bytes, offset)?;
        self.lock.sync_data()?;

        let mut header = self.header;
        header.count += 1;
        header.crc = header.compute_crc();
        let mut header_bytes = [0_u8; LOG_HEADER_SIZE];
        header
            .write_to_bytes(&mut header_bytes)
            .map_err(|err| FabError::Parse(format!("write log header: {err}")))?;
        self.lock.write_all_at(&header_bytes, 0)?;
        self.lock.sync_data()?;

        self.header = header;
        Ok(seq)
    }

    /// Create a file: allocate extents, append one FILE entry.
    ///
    /// On append failure the allocation is rolled back, leaving no side
    /// effect beyond what was already durably committed.
    pub fn mkfile(
        &mut self,
        path: &Path,
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
    ) -> Result<FileRecord> {
        let rel = relativize(&self.mount_root, path)?;
        if size == 0 {
            return Err(FabError::InvalidArgument(
                "file size must be nonzero".into(),
            ));
        }
        if self.namespace.contains_file(&rel) {
            return Err(FabError::InvalidArgument(format!(
                "file {rel:?} already exists"
            )));
        }
        if self.header.slots_available() == 0 {
            return Err(FabError::LogFull);
        }

        let extents = self.allocator.allocate_scatter(size, FABFS_MAX_EXTENTS)?;
        let record = FileRecord {
            size,
            mode,
            uid,
            gid,
            extents: extents.clone(),
        };
        let appended = self.append(LogPayload::File(FileCreate {
            path: rel.clone(),
            size,
            mode,
            uid,
            gid,
            extents,
        }));
        if let Err(err) = appended {
            for extent in &record.extents {
                if let Err(rollback) = self.allocator.release(*extent) {
                    warn!(%rollback, "failed to roll back extent after append error");
                }
            }
            return Err(err);
        }

        self.namespace.files.insert(rel, record.clone());
        Ok(record)
    }

    /// Create one directory, consuming one log slot.
    ///
    /// Creating a directory that already exists is a no-op and consumes
    /// nothing, which keeps repeated mkdir-parents streams cheap.
    pub fn mkdir(&mut self, path: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
        let rel = relativize(&self.mount_root, path)?;
        self.mkdir_relative(rel, mode, uid, gid)
    }

    /// Create every missing component of `path` in root-to-leaf order,
    /// consuming one log slot per component.
    ///
    /// When slots run out mid-sequence this stops with [`FabError::LogFull`];
    /// the components already appended stay committed and the log remains
    /// replay-consistent — callers see partial success, not a rollback.
    pub fn mkdir_parents(&mut self, path: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
        let rel = relativize(&self.mount_root, path)?;
        let mut prefix = String::new();
        for component in rel.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            self.mkdir_relative(prefix.clone(), mode, uid, gid)?;
        }
        Ok(())
    }

    fn mkdir_relative(&mut self, rel: String, mode: u32, uid: u32, gid: u32) -> Result<()> {
        if self.namespace.contains_dir(&rel) {
            return Ok(());
        }
        self.append(LogPayload::Mkdir(DirCreate {
            path: rel.clone(),
            mode,
            uid,
            gid,
        }))?;
        self.namespace.dirs.insert(rel, DirRecord { mode, uid, gid });
        Ok(())
    }

    /// Record a metadata-only access event for an existing file.
    pub fn log_access(&mut self, path: &Path) -> Result<()> {
        let rel = relativize(&self.mount_root, path)?;
        if !self.namespace.contains_file(&rel) {
            return Err(FabError::NotFound(format!("file {rel:?}")));
        }
        self.append(LogPayload::Access(fabfs_ondisk::AccessTouch { path: rel }))?;
        Ok(())
    }

    #[must_use]
    pub fn slots_available(&self) -> u64 {
        self.header.slots_available()
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[must_use]
    pub fn allocator(&self) -> &ExtentAllocator {
        &self.allocator
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Release the lock and close the handle.
    ///
    /// Consuming `self` makes double release unrepresentable.
    pub fn release(self) -> Result<()> {
        self.lock
            .unlock()
            .map_err(|(_, errno)| FabError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabfs_types::{FABFS_MIN_DEVSIZE, LOG_ENTRY_SIZE};

    const DEVICE_SIZE: u64 = 1024 * 1024 * 1024;
    const MASTER: FixedIdentity = FixedIdentity([0xAA; 16]);
    const OTHER: FixedIdentity = FixedIdentity([0xBB; 16]);

    fn regions() -> (Vec<u8>, Vec<u8>) {
        let log_len = LOG_HEADER_SIZE + 8 * LOG_ENTRY_SIZE;
        (vec![0_u8; SUPERBLOCK_RECORD_SIZE], vec![0_u8; log_len])
    }

    fn opts(force: bool, kill: bool, log_len: u64) -> MkfsOptions {
        MkfsOptions {
            force,
            kill,
            log_len: Some(log_len),
        }
    }

    #[test]
    fn mkfs_regions_lifecycle() {
        let (mut sb_region, mut log_region) = regions();
        let log_len = log_region.len() as u64;

        mkfs_regions(
            &mut sb_region,
            &mut log_region,
            DEVICE_SIZE,
            &MASTER,
            &opts(false, false, log_len),
        )
        .expect("fresh format");

        // A valid superblock blocks a plain repeat.
        assert!(matches!(
            mkfs_regions(
                &mut sb_region,
                &mut log_region,
                DEVICE_SIZE,
                &MASTER,
                &opts(false, false, log_len),
            ),
            Err(FabError::AlreadyFormatted)
        ));

        // Kill plus force succeeds.
        mkfs_regions(
            &mut sb_region,
            &mut log_region,
            DEVICE_SIZE,
            &MASTER,
            &opts(true, true, log_len),
        )
        .expect("kill + force");

        // Kill alone wipes the magic, so a plain repeat then succeeds.
        let killed = mkfs_regions(
            &mut sb_region,
            &mut log_region,
            DEVICE_SIZE,
            &MASTER,
            &opts(false, true, log_len),
        )
        .expect("kill clears the old superblock");
        killed.validate().expect("fresh superblock validates");

        // Valid again: plain repeat fails, force succeeds.
        assert!(matches!(
            mkfs_regions(
                &mut sb_region,
                &mut log_region,
                DEVICE_SIZE,
                &MASTER,
                &opts(false, false, log_len),
            ),
            Err(FabError::AlreadyFormatted)
        ));
        mkfs_regions(
            &mut sb_region,
            &mut log_region,
            DEVICE_SIZE,
            &MASTER,
            &opts(true, false, log_len),
        )
        .expect("force overwrites");
    }

    #[test]
    fn mkfs_regions_writes_valid_records() {
        let (mut sb_region, mut log_region) = regions();
        let log_len = log_region.len() as u64;
        let sb = mkfs_regions(
            &mut sb_region,
            &mut log_region,
            DEVICE_SIZE,
            &MASTER,
            &opts(false, false, log_len),
        )
        .expect("format");

        let reparsed = Superblock::parse_from_bytes(&sb_region).expect("parse");
        assert_eq!(reparsed, sb);
        reparsed.validate().expect("validate");
        assert_eq!(reparsed.system_uuid, [0xAA; 16]);

        let header = LogHeader::parse_from_bytes(&log_region).expect("header");
        header.validate().expect("header validates");
        assert_eq!(header.count, 0);
        assert_eq!(header.capacity, 8);
    }

    #[test]
    fn mkfs_regions_rejects_bad_geometry() {
        let (mut sb_region, mut log_region) = regions();
        let log_len = log_region.len() as u64;

        assert!(matches!(
            mkfs_regions(
                &mut sb_region,
                &mut log_region,
                FABFS_MIN_DEVSIZE - 1,
                &MASTER,
                &opts(false, false, log_len),
            ),
            Err(FabError::InvalidArgument(_))
        ));

        // Log buffer smaller than the requested geometry.
        assert!(matches!(
            mkfs_regions(
                &mut sb_region,
                &mut log_region,
                DEVICE_SIZE,
                &MASTER,
                &opts(false, false, log_len + 1),
            ),
            Err(FabError::InvalidArgument(_))
        ));
    }

    #[test]
    fn role_resolution_from_superblock_identity() {
        let (mut sb_region, mut log_region) = regions();
        let log_len = log_region.len() as u64;
        let sb = mkfs_regions(
            &mut sb_region,
            &mut log_region,
            DEVICE_SIZE,
            &MASTER,
            &opts(false, false, log_len),
        )
        .expect("format");

        assert_eq!(resolve_role(Some(&sb), &MASTER).expect("role"), Role::Master);
        assert_eq!(resolve_role(Some(&sb), &OTHER).expect("role"), Role::Client);
        assert_eq!(resolve_role(None, &MASTER).expect("role"), Role::NoSuper);

        // An invalidated superblock downgrades everyone to no-superblock.
        let mut killed = sb;
        killed.invalidate();
        assert_eq!(
            resolve_role(Some(&killed), &MASTER).expect("role"),
            Role::NoSuper
        );
    }
}
