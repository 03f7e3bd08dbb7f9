#![forbid(unsafe_code)]
//! On-media codecs for the FabFS superblock and append-only log.
//!
//! Every record is fixed-size and little-endian. The superblock sits at
//! device offset 0; the log region (header plus an array of fixed-size
//! entry slots) follows at `log_offset`. Encoders are canonical: a parse
//! followed by a write reproduces the input bit-exactly, which is what
//! makes the CRC fields checkable from the decoded form alone.

use fabfs_types::{
    Extent, FABFS_CURRENT_VERSION, FABFS_LOG_LEN, FABFS_LOG_MAGIC, FABFS_LOG_OFFSET,
    FABFS_MAX_EXTENTS, FABFS_MAX_PATHLEN, FABFS_MIN_DEVSIZE, FABFS_SUPER_MAGIC, FABFS_ALLOC_UNIT,
    LOG_ENTRY_SIZE, LOG_HEADER_SIZE, PATH_FIELD_SIZE, ParseError, SUPERBLOCK_RECORD_SIZE,
    align_down, align_up, ensure_slice, parse_nul_padded_str, read_fixed, read_le_u32, read_le_u64,
    u64_to_usize, write_bytes_at, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

// ── Superblock field offsets ────────────────────────────────────────────────

const SB_MAGIC_OFF: usize = 0x00;
const SB_VERSION_OFF: usize = 0x08;
const SB_FLAGS_OFF: usize = 0x0C;
const SB_CRC_OFF: usize = 0x10;
const SB_UUID_OFF: usize = 0x18;
const SB_SYSTEM_UUID_OFF: usize = 0x28;
const SB_DEVICE_SIZE_OFF: usize = 0x38;
const SB_LOG_OFFSET_OFF: usize = 0x40;
const SB_LOG_LEN_OFF: usize = 0x48;

/// The fixed superblock record at device offset 0.
///
/// Created once by mkfs and never mutated afterwards, except by a forced
/// re-mkfs (full rewrite) or a kill (magic zeroed in place).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u64,
    pub version: u32,
    pub flags: u32,
    /// CRC32C over the 256-byte record with this field zeroed.
    pub crc: u32,
    /// Identity of this filesystem instance.
    pub uuid: [u8; 16],
    /// System UUID of the host that created the filesystem. A mounting
    /// host whose own system UUID matches holds the master role.
    pub system_uuid: [u8; 16],
    pub device_size: u64,
    pub log_offset: u64,
    pub log_len: u64,
}

impl Superblock {
    /// Construct a fresh superblock for a device of `device_size` bytes
    /// with the default log geometry, stamping a fresh CRC.
    pub fn build(
        device_size: u64,
        uuid: [u8; 16],
        system_uuid: [u8; 16],
    ) -> Result<Self, ParseError> {
        Self::build_with_log_len(device_size, uuid, system_uuid, FABFS_LOG_LEN)
    }

    /// Construct a fresh superblock with an explicit log region length.
    ///
    /// Small logs are used by tests that exercise slot exhaustion without
    /// writing multi-megabyte fixtures; the layout rules are identical.
    pub fn build_with_log_len(
        device_size: u64,
        uuid: [u8; 16],
        system_uuid: [u8; 16],
        log_len: u64,
    ) -> Result<Self, ParseError> {
        if device_size < FABFS_MIN_DEVSIZE {
            return Err(ParseError::InvalidField {
                field: "device_size",
                reason: "below minimum device size",
            });
        }
        let min_log = LOG_HEADER_SIZE + LOG_ENTRY_SIZE;
        if u64_to_usize(log_len, "log_len").map_or(true, |len| len < min_log) {
            return Err(ParseError::InvalidField {
                field: "log_len",
                reason: "too small for header and one entry slot",
            });
        }

        let mut sb = Self {
            magic: FABFS_SUPER_MAGIC,
            version: FABFS_CURRENT_VERSION,
            flags: 0,
            crc: 0,
            uuid,
            system_uuid,
            device_size,
            log_offset: FABFS_LOG_OFFSET,
            log_len,
        };
        if sb.data_region()?.len == 0 {
            return Err(ParseError::InvalidField {
                field: "device_size",
                reason: "no allocatable space past the log region",
            });
        }
        sb.crc = sb.compute_crc();
        Ok(sb)
    }

    /// Parse a superblock from its fixed-size record.
    ///
    /// A region shorter than the record fails with `InsufficientData`
    /// rather than reading out of bounds. No semantic checks happen here;
    /// call [`Superblock::validate`] on the result.
    pub fn parse_from_bytes(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_RECORD_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        Ok(Self {
            magic: read_le_u64(region, SB_MAGIC_OFF)?,
            version: read_le_u32(region, SB_VERSION_OFF)?,
            flags: read_le_u32(region, SB_FLAGS_OFF)?,
            crc: read_le_u32(region, SB_CRC_OFF)?,
            uuid: read_fixed::<16>(region, SB_UUID_OFF)?,
            system_uuid: read_fixed::<16>(region, SB_SYSTEM_UUID_OFF)?,
            device_size: read_le_u64(region, SB_DEVICE_SIZE_OFF)?,
            log_offset: read_le_u64(region, SB_LOG_OFFSET_OFF)?,
            log_len: read_le_u64(region, SB_LOG_LEN_OFF)?,
        })
    }

    /// Encode into a caller-provided buffer of at least record size.
    pub fn write_to_bytes(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < SUPERBLOCK_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_RECORD_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        region[..SUPERBLOCK_RECORD_SIZE].fill(0);
        write_le_u64(region, SB_MAGIC_OFF, self.magic)?;
        write_le_u32(region, SB_VERSION_OFF, self.version)?;
        write_le_u32(region, SB_FLAGS_OFF, self.flags)?;
        write_le_u32(region, SB_CRC_OFF, self.crc)?;
        write_bytes_at(region, SB_UUID_OFF, &self.uuid)?;
        write_bytes_at(region, SB_SYSTEM_UUID_OFF, &self.system_uuid)?;
        write_le_u64(region, SB_DEVICE_SIZE_OFF, self.device_size)?;
        write_le_u64(region, SB_LOG_OFFSET_OFF, self.log_offset)?;
        write_le_u64(region, SB_LOG_LEN_OFF, self.log_len)?;
        Ok(())
    }

    /// Canonical encoding of this record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_RECORD_SIZE] {
        let mut buf = [0_u8; SUPERBLOCK_RECORD_SIZE];
        // Infallible: the buffer is exactly record-sized.
        self.write_to_bytes(&mut buf)
            .unwrap_or_else(|_| unreachable!("record-sized buffer"));
        buf
    }

    /// CRC32C over the canonical encoding with the CRC field zeroed.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        let mut zeroed = self.clone();
        zeroed.crc = 0;
        crc32c::crc32c(&zeroed.to_bytes())
    }

    /// Check magic, then version, then CRC — the first failing check wins.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != FABFS_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FABFS_SUPER_MAGIC,
                actual: self.magic,
            });
        }
        if self.version != FABFS_CURRENT_VERSION {
            return Err(ParseError::InvalidField {
                field: "sb_version",
                reason: "unrecognized format version",
            });
        }
        if self.compute_crc() != self.crc {
            return Err(ParseError::InvalidField {
                field: "sb_crc",
                reason: "superblock CRC32C mismatch",
            });
        }
        Ok(())
    }

    /// Zero the magic in place, making the filesystem unrecognizable to
    /// every host without wiping the device. Used by forced re-mkfs.
    pub fn invalidate(&mut self) {
        self.magic = 0;
    }

    /// Zero the magic directly in a raw mapped record.
    pub fn invalidate_region(region: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(region, SB_MAGIC_OFF, 0)
    }

    /// The allocatable region: everything past the log, trimmed to whole
    /// allocation units on both ends.
    pub fn data_region(&self) -> Result<Extent, ParseError> {
        let log_end = self
            .log_offset
            .checked_add(self.log_len)
            .ok_or(ParseError::IntegerConversion { field: "log_len" })?;
        let start = align_up(log_end, FABFS_ALLOC_UNIT).ok_or(ParseError::IntegerConversion {
            field: "data_offset",
        })?;
        let end = align_down(self.device_size, FABFS_ALLOC_UNIT).unwrap_or(0);
        Ok(Extent::new(start, end.saturating_sub(start)))
    }

    /// Number of entry slots the log region holds.
    #[must_use]
    pub fn log_capacity(&self) -> u64 {
        let Ok(len) = u64_to_usize(self.log_len, "log_len") else {
            return 0;
        };
        (len.saturating_sub(LOG_HEADER_SIZE) / LOG_ENTRY_SIZE) as u64
    }
}

// ── Log header ──────────────────────────────────────────────────────────────

const LH_MAGIC_OFF: usize = 0x00;
const LH_CRC_OFF: usize = 0x08;
const LH_COUNT_OFF: usize = 0x10;
const LH_CAPACITY_OFF: usize = 0x18;

/// The fixed header at the start of the log region.
///
/// `count` is the number of committed entries; it only grows. `capacity`
/// is fixed at mkfs time and never changes for the life of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub magic: u64,
    /// CRC32C over the 64-byte header with this field zeroed.
    pub crc: u32,
    pub count: u64,
    pub capacity: u64,
}

impl LogHeader {
    /// Fresh header for an empty log of `capacity` slots, CRC stamped.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let mut header = Self {
            magic: FABFS_LOG_MAGIC,
            crc: 0,
            count: 0,
            capacity,
        };
        header.crc = header.compute_crc();
        header
    }

    pub fn parse_from_bytes(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < LOG_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: LOG_HEADER_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        Ok(Self {
            magic: read_le_u64(region, LH_MAGIC_OFF)?,
            crc: read_le_u32(region, LH_CRC_OFF)?,
            count: read_le_u64(region, LH_COUNT_OFF)?,
            capacity: read_le_u64(region, LH_CAPACITY_OFF)?,
        })
    }

    pub fn write_to_bytes(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < LOG_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: LOG_HEADER_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        region[..LOG_HEADER_SIZE].fill(0);
        write_le_u64(region, LH_MAGIC_OFF, self.magic)?;
        write_le_u32(region, LH_CRC_OFF, self.crc)?;
        write_le_u64(region, LH_COUNT_OFF, self.count)?;
        write_le_u64(region, LH_CAPACITY_OFF, self.capacity)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0_u8; LOG_HEADER_SIZE];
        self.write_to_bytes(&mut buf)
            .unwrap_or_else(|_| unreachable!("header-sized buffer"));
        buf
    }

    /// CRC32C over the canonical encoding with the CRC field zeroed.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        let mut zeroed = *self;
        zeroed.crc = 0;
        crc32c::crc32c(&zeroed.to_bytes())
    }

    /// Magic is checked before the CRC; when the magic is already wrong
    /// the CRC is never attempted. A count past capacity is rejected even
    /// when the CRC matches — it means a writer bug, not bit rot.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != FABFS_LOG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FABFS_LOG_MAGIC,
                actual: self.magic,
            });
        }
        if self.compute_crc() != self.crc {
            return Err(ParseError::InvalidField {
                field: "log_crc",
                reason: "log header CRC32C mismatch",
            });
        }
        if self.count > self.capacity {
            return Err(ParseError::InvalidField {
                field: "log_count",
                reason: "entry count exceeds capacity",
            });
        }
        Ok(())
    }

    /// Remaining entry slots. Monotonically non-increasing within a mount.
    #[must_use]
    pub fn slots_available(&self) -> u64 {
        self.capacity.saturating_sub(self.count)
    }
}

// ── Log entries ─────────────────────────────────────────────────────────────

/// Type tag for a file-creation entry.
pub const LOG_TYPE_FILE: u32 = 1;
/// Type tag for a directory-creation entry.
pub const LOG_TYPE_MKDIR: u32 = 2;
/// Type tag for a metadata-only access event.
pub const LOG_TYPE_ACCESS: u32 = 3;

const LE_SEQ_OFF: usize = 0x00;
const LE_TYPE_OFF: usize = 0x08;
const LE_CRC_OFF: usize = 0x0C;

const FC_SIZE_OFF: usize = 0x10;
const FC_MODE_OFF: usize = 0x18;
const FC_UID_OFF: usize = 0x1C;
const FC_GID_OFF: usize = 0x20;
const FC_NEXTENTS_OFF: usize = 0x24;
const FC_EXTENTS_OFF: usize = 0x28;
const FC_PATH_OFF: usize = 0xA8;

const MD_MODE_OFF: usize = 0x10;
const MD_UID_OFF: usize = 0x14;
const MD_GID_OFF: usize = 0x18;
const MD_PATH_OFF: usize = 0x20;

const AC_PATH_OFF: usize = 0x10;

/// Payload of a FILE entry: register a file and the extents that back it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreate {
    /// Path relative to the mount root.
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub extents: Vec<Extent>,
}

/// Payload of a MKDIR entry: register one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirCreate {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Payload of an ACCESS entry: structurally valid, never namespace-mutating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTouch {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    File(FileCreate),
    Mkdir(DirCreate),
    Access(AccessTouch),
}

impl LogPayload {
    /// The relative path this entry names.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::File(fc) => &fc.path,
            Self::Mkdir(md) => &md.path,
            Self::Access(ac) => &ac.path,
        }
    }

    /// On-media type tag.
    #[must_use]
    pub fn type_tag(&self) -> u32 {
        match self {
            Self::File(_) => LOG_TYPE_FILE,
            Self::Mkdir(_) => LOG_TYPE_MKDIR,
            Self::Access(_) => LOG_TYPE_ACCESS,
        }
    }
}

/// One immutable slot of the append-only log.
///
/// Entry `i` must carry sequence number `i`; a gap or regression
/// invalidates replay from that point forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub payload: LogPayload,
}

fn check_path(path: &str) -> Result<(), ParseError> {
    if path.is_empty() {
        return Err(ParseError::InvalidField {
            field: "path",
            reason: "empty",
        });
    }
    if path.starts_with('/') {
        return Err(ParseError::InvalidField {
            field: "path",
            reason: "must be relative",
        });
    }
    if path.len() > FABFS_MAX_PATHLEN {
        return Err(ParseError::InvalidField {
            field: "path",
            reason: "exceeds maximum length",
        });
    }
    Ok(())
}

fn parse_path_field(buf: &[u8], offset: usize) -> Result<String, ParseError> {
    let field = ensure_slice(buf, offset, PATH_FIELD_SIZE)?;
    let path = parse_nul_padded_str(field)?;
    check_path(path)?;
    Ok(path.to_owned())
}

impl LogEntry {
    /// Decode one entry slot, verifying its CRC and structural rules.
    ///
    /// An unrecognized type tag is rejected rather than skipped, and a
    /// payload whose path decodes as absolute is rejected regardless of
    /// type — both are corruption signals.
    pub fn parse_from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < LOG_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: LOG_ENTRY_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        let buf = &buf[..LOG_ENTRY_SIZE];

        let stored_crc = read_le_u32(buf, LE_CRC_OFF)?;
        let mut image = [0_u8; LOG_ENTRY_SIZE];
        image.copy_from_slice(buf);
        write_le_u32(&mut image, LE_CRC_OFF, 0)?;
        if crc32c::crc32c(&image) != stored_crc {
            return Err(ParseError::InvalidField {
                field: "entry_crc",
                reason: "log entry CRC32C mismatch",
            });
        }

        let seq = read_le_u64(buf, LE_SEQ_OFF)?;
        let payload = match read_le_u32(buf, LE_TYPE_OFF)? {
            LOG_TYPE_FILE => {
                let nextents = read_le_u32(buf, FC_NEXTENTS_OFF)?;
                let nextents = usize::try_from(nextents)
                    .map_err(|_| ParseError::IntegerConversion { field: "nextents" })?;
                if nextents > FABFS_MAX_EXTENTS {
                    return Err(ParseError::InvalidField {
                        field: "nextents",
                        reason: "exceeds maximum extent count",
                    });
                }
                let mut extents = Vec::with_capacity(nextents);
                for i in 0..nextents {
                    let base = FC_EXTENTS_OFF + i * 16;
                    extents.push(Extent::new(
                        read_le_u64(buf, base)?,
                        read_le_u64(buf, base + 8)?,
                    ));
                }
                LogPayload::File(FileCreate {
                    path: parse_path_field(buf, FC_PATH_OFF)?,
                    size: read_le_u64(buf, FC_SIZE_OFF)?,
                    mode: read_le_u32(buf, FC_MODE_OFF)?,
                    uid: read_le_u32(buf, FC_UID_OFF)?,
                    gid: read_le_u32(buf, FC_GID_OFF)?,
                    extents,
                })
            }
            LOG_TYPE_MKDIR => LogPayload::Mkdir(DirCreate {
                path: parse_path_field(buf, MD_PATH_OFF)?,
                mode: read_le_u32(buf, MD_MODE_OFF)?,
                uid: read_le_u32(buf, MD_UID_OFF)?,
                gid: read_le_u32(buf, MD_GID_OFF)?,
            }),
            LOG_TYPE_ACCESS => LogPayload::Access(AccessTouch {
                path: parse_path_field(buf, AC_PATH_OFF)?,
            }),
            _ => {
                return Err(ParseError::InvalidField {
                    field: "entry_type",
                    reason: "unrecognized type tag",
                });
            }
        };

        Ok(Self { seq, payload })
    }

    /// Encode into one entry slot, stamping the CRC last.
    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if buf.len() < LOG_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: LOG_ENTRY_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        check_path(self.payload.path())?;

        let buf = &mut buf[..LOG_ENTRY_SIZE];
        buf.fill(0);
        write_le_u64(buf, LE_SEQ_OFF, self.seq)?;
        write_le_u32(buf, LE_TYPE_OFF, self.payload.type_tag())?;

        match &self.payload {
            LogPayload::File(fc) => {
                if fc.extents.len() > FABFS_MAX_EXTENTS {
                    return Err(ParseError::InvalidField {
                        field: "nextents",
                        reason: "exceeds maximum extent count",
                    });
                }
                write_le_u64(buf, FC_SIZE_OFF, fc.size)?;
                write_le_u32(buf, FC_MODE_OFF, fc.mode)?;
                write_le_u32(buf, FC_UID_OFF, fc.uid)?;
                write_le_u32(buf, FC_GID_OFF, fc.gid)?;
                write_le_u32(
                    buf,
                    FC_NEXTENTS_OFF,
                    u32::try_from(fc.extents.len())
                        .map_err(|_| ParseError::IntegerConversion { field: "nextents" })?,
                )?;
                for (i, extent) in fc.extents.iter().enumerate() {
                    let base = FC_EXTENTS_OFF + i * 16;
                    write_le_u64(buf, base, extent.offset)?;
                    write_le_u64(buf, base + 8, extent.len)?;
                }
                write_bytes_at(buf, FC_PATH_OFF, fc.path.as_bytes())?;
            }
            LogPayload::Mkdir(md) => {
                write_le_u32(buf, MD_MODE_OFF, md.mode)?;
                write_le_u32(buf, MD_UID_OFF, md.uid)?;
                write_le_u32(buf, MD_GID_OFF, md.gid)?;
                write_bytes_at(buf, MD_PATH_OFF, md.path.as_bytes())?;
            }
            LogPayload::Access(ac) => {
                write_bytes_at(buf, AC_PATH_OFF, ac.path.as_bytes())?;
            }
        }

        let mut image = [0_u8; LOG_ENTRY_SIZE];
        image.copy_from_slice(buf);
        write_le_u32(buf, LE_CRC_OFF, crc32c::crc32c(&image))?;
        Ok(())
    }

    /// Canonical encoding of this entry.
    pub fn to_bytes(&self) -> Result<[u8; LOG_ENTRY_SIZE], ParseError> {
        let mut buf = [0_u8; LOG_ENTRY_SIZE];
        self.write_to_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Sequence-number continuity relative to the previous accepted entry.
    pub fn validate_seq(&self, expected: u64) -> Result<(), ParseError> {
        if self.seq != expected {
            return Err(ParseError::InvalidField {
                field: "seqnum",
                reason: "sequence gap or regression",
            });
        }
        Ok(())
    }
}

// ── Log region geometry ─────────────────────────────────────────────────────

/// Byte offset of entry slot `index` within the log region.
#[must_use]
pub fn log_entry_offset(index: u64) -> Option<u64> {
    index
        .checked_mul(LOG_ENTRY_SIZE as u64)
        .and_then(|off| off.checked_add(LOG_HEADER_SIZE as u64))
}

/// Borrow entry slot `index` out of a full log region.
pub fn entry_slice(region: &[u8], index: u64) -> Result<&[u8], ParseError> {
    let offset = log_entry_offset(index).ok_or(ParseError::IntegerConversion {
        field: "entry_offset",
    })?;
    ensure_slice(region, u64_to_usize(offset, "entry_offset")?, LOG_ENTRY_SIZE)
}
