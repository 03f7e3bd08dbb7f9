//! Read-only structural and semantic consistency checking.
//!
//! fsck composes the superblock codec, the log codec, and replay against a
//! named location: a mount root directory, the materialized
//! `.meta/.superblock` file (with its sibling `.log`), or a raw device /
//! image holding both records at their device offsets. It never mutates
//! the checked region and never takes the append lock — a concurrently
//! mutating log is safe to scan because only entries below the committed
//! count are trusted, and those are immutable.

use crate::device::{
    DeviceKind, DeviceProbe, LOG_RELPATH, META_DIR, ReadPolicy, Region, SB_RELPATH, load_region,
};
use fabfs_error::{FabError, Result};
use fabfs_ondisk::{LogHeader, Superblock};
use fabfs_replay::Replay;
use fabfs_types::{SUPERBLOCK_RECORD_SIZE, u64_to_usize};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Knobs for a consistency check.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsckOptions {
    /// Load regions by memory-mapping instead of buffered reads.
    pub mmap: bool,
}

/// Aggregate result of a consistency check.
#[derive(Debug, Clone, Serialize)]
pub struct FsckReport {
    /// True when the superblock, log header, and every committed entry
    /// validated and replayed.
    pub valid: bool,
    pub device_size: u64,
    pub files: u64,
    pub directories: u64,
    pub bytes_allocated: u64,
    pub free_bytes: u64,
    pub slots_used: u64,
    pub slots_free: u64,
    /// Index of the earliest entry that failed, if any.
    pub halted_at: Option<u64>,
    pub errors: Vec<String>,
}

/// Check the filesystem at `path`.
///
/// Structural preconditions — an unsupported target type, a truncated or
/// invalid superblock, an absent or truncated log, an invalid log header —
/// fail the call. A log whose entries go bad partway instead produces a
/// full report with `valid == false` and the earliest failure recorded,
/// because the valid prefix is still worth describing.
pub fn fsck(path: &Path, probe: &dyn DeviceProbe, opts: &FsckOptions) -> Result<FsckReport> {
    let policy = if opts.mmap {
        ReadPolicy::Mmap
    } else {
        ReadPolicy::Buffered
    };

    let (sb_region, log_region) = locate_and_load(path, probe, policy)?;

    if sb_region.len() < SUPERBLOCK_RECORD_SIZE {
        return Err(FabError::Structural(format!(
            "superblock region is {} bytes, record needs {SUPERBLOCK_RECORD_SIZE}",
            sb_region.len()
        )));
    }
    let sb = Superblock::parse_from_bytes(&sb_region)
        .map_err(|err| FabError::Structural(format!("superblock: {err}")))?;
    sb.validate()
        .map_err(|err| FabError::Structural(format!("superblock: {err}")))?;

    let header = LogHeader::parse_from_bytes(&log_region)
        .map_err(|err| FabError::Structural(format!("log header: {err}")))?;
    header
        .validate()
        .map_err(|err| FabError::Structural(format!("log header: {err}")))?;
    let needed = fabfs_ondisk::log_entry_offset(header.count)
        .and_then(|end| u64_to_usize(end, "log_end").ok())
        .ok_or_else(|| FabError::Structural("log entry area overflows".into()))?;
    if log_region.len() < needed {
        return Err(FabError::Structural(format!(
            "log region holds {} bytes, {} committed entries need {needed}",
            log_region.len(),
            header.count
        )));
    }

    let replay = Replay::run(&log_region, &sb)?;

    let mut errors = Vec::new();
    let mut halted_at = None;
    if let Some(halt) = &replay.halted {
        halted_at = Some(halt.index);
        errors.push(halt.error.to_string());
    }

    let report = FsckReport {
        valid: errors.is_empty(),
        device_size: sb.device_size,
        files: replay.stats.files_created,
        directories: replay.stats.dirs_created,
        bytes_allocated: replay.stats.bytes_allocated,
        free_bytes: replay.allocator.free_bytes(),
        slots_used: header.count,
        slots_free: header.slots_available(),
        halted_at,
        errors,
    };
    info!(
        valid = report.valid,
        files = report.files,
        directories = report.directories,
        slots_free = report.slots_free,
        "fsck scan complete"
    );
    Ok(report)
}

/// Resolve which form the target takes and load both regions read-only.
fn locate_and_load(
    path: &Path,
    probe: &dyn DeviceProbe,
    policy: ReadPolicy,
) -> Result<(Region, Region)> {
    if path.is_dir() {
        return load_meta_pair(&path.join(SB_RELPATH), &path.join(LOG_RELPATH), policy);
    }

    // Target type is settled before any byte is read.
    let info = probe.probe(path)?;
    match info.kind {
        DeviceKind::Regular => {
            // The materialized superblock file sits inside the hidden
            // metadata directory; any other regular file is a device image.
            let in_meta = path
                .parent()
                .and_then(Path::file_name)
                .and_then(std::ffi::OsStr::to_str)
                == Some(META_DIR);
            if in_meta {
                let log_path = path
                    .parent()
                    .map(|meta| meta.join(".log"))
                    .ok_or_else(|| FabError::NotFound("metadata directory".into()))?;
                load_meta_pair(path, &log_path, policy)
            } else {
                load_device_regions(path, policy)
            }
        }
        DeviceKind::Block | DeviceKind::Char => load_device_regions(path, policy),
    }
}

fn load_meta_pair(sb_path: &Path, log_path: &Path, policy: ReadPolicy) -> Result<(Region, Region)> {
    if !sb_path.is_file() {
        return Err(FabError::NotFound(format!(
            "superblock file {}",
            sb_path.display()
        )));
    }
    let sb_region = load_region(sb_path, policy)?;
    if !log_path.is_file() {
        return Err(FabError::NotFound(format!(
            "log file {}",
            log_path.display()
        )));
    }
    let log_region = load_region(log_path, policy)?;
    Ok((sb_region, log_region))
}

/// Slice the superblock and log regions out of a whole-device view.
fn load_device_regions(path: &Path, policy: ReadPolicy) -> Result<(Region, Region)> {
    let whole = load_region(path, policy)?;
    if whole.len() < SUPERBLOCK_RECORD_SIZE {
        return Err(FabError::Structural(format!(
            "device holds {} bytes, superblock record needs {SUPERBLOCK_RECORD_SIZE}",
            whole.len()
        )));
    }
    let sb = Superblock::parse_from_bytes(&whole)
        .map_err(|err| FabError::Structural(format!("superblock: {err}")))?;
    sb.validate()
        .map_err(|err| FabError::Structural(format!("superblock: {err}")))?;

    let log_start = u64_to_usize(sb.log_offset, "log_offset")
        .map_err(|err| FabError::Structural(err.to_string()))?;
    let log_len =
        u64_to_usize(sb.log_len, "log_len").map_err(|err| FabError::Structural(err.to_string()))?;
    let log_end = log_start
        .checked_add(log_len)
        .ok_or_else(|| FabError::Structural("log region end overflows".into()))?;
    if whole.len() < log_end {
        return Err(FabError::Structural(format!(
            "log region [{log_start}, {log_end}) extends past device end {}",
            whole.len()
        )));
    }

    let sb_region = Region::Buffered(whole[..SUPERBLOCK_RECORD_SIZE].to_vec());
    let log_region = Region::Buffered(whole[log_start..log_end].to_vec());
    Ok((sb_region, log_region))
}
