#![forbid(unsafe_code)]
//! Deterministic replay of the FabFS metadata log.
//!
//! Replay is the single source of truth for namespace state: there is no
//! persisted directory index that could drift from the log. Every mount
//! and every fsck rebuilds the namespace and the allocator by walking the
//! committed entries in order from a freshly-reset allocator and an empty
//! namespace.
//!
//! Replay halts at the first entry that fails validation or whose recorded
//! extents cannot be reconciled with free space. Entries after a halt are
//! never applied, so an interrupted or corrupted log still presents the
//! maximal valid prefix of the namespace.

use fabfs_alloc::ExtentAllocator;
use fabfs_error::{FabError, Result};
use fabfs_ondisk::{LogEntry, LogHeader, LogPayload, Superblock, entry_slice};
use fabfs_types::Extent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A file reconstructed from a FILE entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub extents: Vec<Extent>,
}

/// A directory reconstructed from a MKDIR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// The reconstructed namespace, keyed by mount-relative path.
///
/// `BTreeMap` keeps iteration order deterministic, which is what makes two
/// replays of the same log bit-identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub files: BTreeMap<String, FileRecord>,
    pub dirs: BTreeMap<String, DirRecord>,
}

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    #[must_use]
    pub fn contains_dir(&self, path: &str) -> bool {
        self.dirs.contains_key(path)
    }
}

/// Aggregate counters accumulated while walking the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Entries validated and applied (the halt entry is not counted).
    pub entries_applied: u64,
    pub files_created: u64,
    pub dirs_created: u64,
    pub accesses_seen: u64,
    /// Total bytes of extents owned by files (allocation-unit granular).
    pub bytes_allocated: u64,
}

/// Where and why a replay stopped early.
#[derive(Debug)]
pub struct ReplayHalt {
    /// Index of the entry that failed; state reflects entries `[0, index)`.
    pub index: u64,
    pub error: FabError,
}

/// The outcome of a replay: reconstructed state plus an optional halt.
#[derive(Debug)]
pub struct Replay {
    pub namespace: Namespace,
    pub allocator: ExtentAllocator,
    pub stats: ReplayStats,
    pub halted: Option<ReplayHalt>,
}

impl Replay {
    /// Walk the committed entries of `log_region` and rebuild state.
    ///
    /// Structural problems that precede the walk — truncated region,
    /// invalid header, header capacity disagreeing with the superblock —
    /// fail the whole call. Per-entry failures instead stop the walk and
    /// are reported in [`Replay::halted`] with all prior state preserved,
    /// so diagnostic callers (fsck) can still report the valid prefix.
    pub fn run(log_region: &[u8], sb: &Superblock) -> Result<Self> {
        let header = LogHeader::parse_from_bytes(log_region)
            .map_err(|err| FabError::Structural(format!("log header: {err}")))?;
        header
            .validate()
            .map_err(|err| FabError::Structural(format!("log header: {err}")))?;
        if header.capacity != sb.log_capacity() {
            return Err(FabError::Structural(format!(
                "log capacity {} disagrees with superblock geometry {}",
                header.capacity,
                sb.log_capacity()
            )));
        }

        let mut allocator = ExtentAllocator::reset(
            sb.data_region()
                .map_err(|err| FabError::Structural(format!("data region: {err}")))?,
        )?;
        let mut namespace = Namespace::new();
        let mut stats = ReplayStats::default();
        let mut halted = None;

        for index in 0..header.count {
            match apply_entry(log_region, index, &mut namespace, &mut allocator, &mut stats) {
                Ok(()) => stats.entries_applied += 1,
                Err(error) => {
                    warn!(index, %error, "log replay halted");
                    halted = Some(ReplayHalt { index, error });
                    break;
                }
            }
        }

        debug!(
            entries = stats.entries_applied,
            files = stats.files_created,
            dirs = stats.dirs_created,
            "log replay finished"
        );
        Ok(Self {
            namespace,
            allocator,
            stats,
            halted,
        })
    }

    /// Convert a halted replay into an error for callers that need a fully
    /// valid log (mount, locked-log init).
    pub fn into_result(self) -> Result<Self> {
        match self.halted {
            Some(halt) => Err(halt.error),
            None => Ok(self),
        }
    }
}

fn apply_entry(
    log_region: &[u8],
    index: u64,
    namespace: &mut Namespace,
    allocator: &mut ExtentAllocator,
    stats: &mut ReplayStats,
) -> Result<()> {
    let sequence = |detail: String| FabError::Sequence { index, detail };

    let slice = entry_slice(log_region, index)
        .map_err(|err| FabError::Structural(format!("log region truncated: {err}")))?;
    let entry = LogEntry::parse_from_bytes(slice).map_err(|err| sequence(err.to_string()))?;
    entry
        .validate_seq(index)
        .map_err(|err| sequence(err.to_string()))?;

    match entry.payload {
        LogPayload::File(fc) => {
            if namespace.contains_file(&fc.path) {
                return Err(sequence(format!("duplicate file path {:?}", fc.path)));
            }
            // Ownership of every recorded extent must be re-establishable
            // against present free space; an overlap is corruption, not a
            // retryable allocation failure.
            for extent in &fc.extents {
                allocator.reserve(*extent)?;
            }
            stats.files_created += 1;
            stats.bytes_allocated += fc.extents.iter().map(|e| e.len).sum::<u64>();
            namespace.files.insert(
                fc.path,
                FileRecord {
                    size: fc.size,
                    mode: fc.mode,
                    uid: fc.uid,
                    gid: fc.gid,
                    extents: fc.extents,
                },
            );
        }
        LogPayload::Mkdir(md) => {
            // Re-creating an existing directory is a no-op: mkdir-parents
            // streams legitimately repeat ancestors across operations.
            if !namespace.contains_dir(&md.path) {
                stats.dirs_created += 1;
                namespace.dirs.insert(
                    md.path,
                    DirRecord {
                        mode: md.mode,
                        uid: md.uid,
                        gid: md.gid,
                    },
                );
            }
        }
        LogPayload::Access(_) => {
            stats.accesses_seen += 1;
        }
    }
    Ok(())
}
