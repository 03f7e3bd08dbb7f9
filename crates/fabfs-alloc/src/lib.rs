#![forbid(unsafe_code)]
//! Extent allocation over the FabFS data region.
//!
//! The allocator tracks whole allocation units (`FABFS_ALLOC_UNIT` bytes
//! each) in a bitmap spanning the data region. Requests round up to unit
//! boundaries and are satisfied by the first sufficiently long free run in
//! offset order, so two independent replays of the same log always carve
//! identical extents. Releases clear bits, which coalesces adjacent free
//! runs for free.
//!
//! Invariant: at every point, the set of used units and the set of free
//! units exactly tile the data region — no overlap, no gap.

use fabfs_error::{FabError, Result};
use fabfs_types::{Extent, FABFS_ALLOC_UNIT, FABFS_MAX_EXTENTS, align_up};

// ── Bitmap primitives ───────────────────────────────────────────────────────

fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first run of `n` contiguous free units in `0..nbits`. The
/// front-to-back scan order is what makes allocation deterministic.
fn bitmap_find_free_run(bitmap: &[u8], nbits: u64, n: u64) -> Option<u64> {
    if n == 0 || n > nbits {
        return None;
    }
    let mut run_start = 0_u64;
    let mut run_len = 0_u64;
    for idx in 0..nbits {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

// ── Extent allocator ────────────────────────────────────────────────────────

/// Free/used accounting for the data region, in allocation units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentAllocator {
    /// Byte offset of the first allocation unit.
    base: u64,
    /// Number of allocation units in the region.
    nbits: u64,
    /// One bit per unit; set means used.
    bitmap: Vec<u8>,
    free_units: u64,
}

impl ExtentAllocator {
    /// Fresh allocator with the whole `data_region` free.
    ///
    /// This is mkfs's starting state and replay's starting state — the
    /// region must be unit-aligned, which [`fabfs_ondisk::Superblock::data_region`]
    /// guarantees by construction.
    pub fn reset(data_region: Extent) -> Result<Self> {
        if !data_region.is_unit_aligned(FABFS_ALLOC_UNIT) {
            return Err(FabError::InvalidArgument(format!(
                "data region {data_region} is not aligned to allocation units"
            )));
        }
        let nbits = data_region.len / FABFS_ALLOC_UNIT;
        let nbytes = usize::try_from(nbits.div_ceil(8)).map_err(|_| {
            FabError::InvalidArgument("data region too large for this host".into())
        })?;
        Ok(Self {
            base: data_region.offset,
            nbits,
            bitmap: vec![0_u8; nbytes],
            free_units: nbits,
        })
    }

    /// Allocate one contiguous extent covering `len_bytes` (rounded up to
    /// whole units). First-fit in offset order; the remainder of a longer
    /// free run stays free.
    pub fn allocate(&mut self, len_bytes: u64) -> Result<Extent> {
        let units = self.units_for(len_bytes)?;
        if units > self.free_units {
            return Err(FabError::NoSpace);
        }
        let Some(first) = bitmap_find_free_run(&self.bitmap, self.nbits, units) else {
            return Err(FabError::NoSpace);
        };
        for idx in first..first + units {
            bitmap_set(&mut self.bitmap, idx);
        }
        self.free_units -= units;
        Ok(self.extent_at(first, units))
    }

    /// Allocate `len_bytes` as up to `max_extents` extents, preferring one
    /// contiguous run and falling back to gathering free runs in offset
    /// order. All-or-nothing: on failure the allocator is unchanged.
    pub fn allocate_scatter(&mut self, len_bytes: u64, max_extents: usize) -> Result<Vec<Extent>> {
        let total_units = self.units_for(len_bytes)?;
        if max_extents == 0 || max_extents > FABFS_MAX_EXTENTS {
            return Err(FabError::InvalidArgument(format!(
                "max_extents must be in 1..={FABFS_MAX_EXTENTS}"
            )));
        }
        if total_units > self.free_units {
            return Err(FabError::NoSpace);
        }

        if let Ok(extent) = self.allocate(len_bytes) {
            return Ok(vec![extent]);
        }

        // Gather free runs front to back; bail (restoring nothing — we
        // only commit below) if the region is too fragmented to cover the
        // request within the extent budget.
        let mut runs: Vec<(u64, u64)> = Vec::new();
        let mut remaining = total_units;
        let mut idx = 0_u64;
        while idx < self.nbits && remaining > 0 && runs.len() < max_extents {
            if bitmap_get(&self.bitmap, idx) {
                idx += 1;
                continue;
            }
            let run_start = idx;
            let mut run_len = 0_u64;
            while idx < self.nbits && !bitmap_get(&self.bitmap, idx) && run_len < remaining {
                run_len += 1;
                idx += 1;
            }
            runs.push((run_start, run_len));
            remaining -= run_len;
        }
        if remaining > 0 {
            return Err(FabError::NoSpace);
        }

        for &(start, len) in &runs {
            for unit in start..start + len {
                bitmap_set(&mut self.bitmap, unit);
            }
        }
        self.free_units -= total_units;
        Ok(runs
            .iter()
            .map(|&(start, len)| self.extent_at(start, len))
            .collect())
    }

    /// Mark an exact recorded extent as used.
    ///
    /// Replay uses this to re-establish ownership of extents a FILE entry
    /// recorded; any unit already owned is a double-allocation, which is a
    /// corruption signal rather than a retryable condition.
    pub fn reserve(&mut self, extent: Extent) -> Result<()> {
        let (first, units) = self.units_of(extent)?;
        for idx in first..first + units {
            if bitmap_get(&self.bitmap, idx) {
                return Err(FabError::Corruption {
                    offset: self.base + idx * FABFS_ALLOC_UNIT,
                    detail: "extent already allocated".into(),
                });
            }
        }
        for idx in first..first + units {
            bitmap_set(&mut self.bitmap, idx);
        }
        self.free_units -= units;
        Ok(())
    }

    /// Return an extent to the free set. Clearing bits coalesces with any
    /// adjacent free neighbors automatically.
    pub fn release(&mut self, extent: Extent) -> Result<()> {
        let (first, units) = self.units_of(extent)?;
        for idx in first..first + units {
            if !bitmap_get(&self.bitmap, idx) {
                return Err(FabError::Corruption {
                    offset: self.base + idx * FABFS_ALLOC_UNIT,
                    detail: "double-free: unit already free".into(),
                });
            }
        }
        for idx in first..first + units {
            bitmap_clear(&mut self.bitmap, idx);
        }
        self.free_units += units;
        Ok(())
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_units * FABFS_ALLOC_UNIT
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        (self.nbits - self.free_units) * FABFS_ALLOC_UNIT
    }

    #[must_use]
    pub fn free_units(&self) -> u64 {
        self.free_units
    }

    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.nbits
    }

    /// The region this allocator covers.
    #[must_use]
    pub fn region(&self) -> Extent {
        Extent::new(self.base, self.nbits * FABFS_ALLOC_UNIT)
    }

    fn units_for(&self, len_bytes: u64) -> Result<u64> {
        if len_bytes == 0 {
            return Err(FabError::InvalidArgument(
                "cannot allocate zero bytes".into(),
            ));
        }
        let rounded = align_up(len_bytes, FABFS_ALLOC_UNIT).ok_or_else(|| {
            FabError::InvalidArgument("allocation length overflows".into())
        })?;
        Ok(rounded / FABFS_ALLOC_UNIT)
    }

    /// Map an extent to its (first unit, unit count), validating alignment
    /// and bounds against the data region.
    fn units_of(&self, extent: Extent) -> Result<(u64, u64)> {
        let corrupt = |detail: &str| FabError::Corruption {
            offset: extent.offset,
            detail: detail.into(),
        };
        if extent.len == 0 {
            return Err(corrupt("zero-length extent"));
        }
        if !extent.is_unit_aligned(FABFS_ALLOC_UNIT) {
            return Err(corrupt("extent not aligned to allocation units"));
        }
        let end = extent
            .checked_end()
            .ok_or_else(|| corrupt("extent end overflows"))?;
        let region = self.region();
        if extent.offset < region.offset || end > region.offset + region.len {
            return Err(corrupt("extent outside the data region"));
        }
        Ok((
            (extent.offset - self.base) / FABFS_ALLOC_UNIT,
            extent.len / FABFS_ALLOC_UNIT,
        ))
    }

    fn extent_at(&self, first_unit: u64, units: u64) -> Extent {
        Extent::new(
            self.base + first_unit * FABFS_ALLOC_UNIT,
            units * FABFS_ALLOC_UNIT,
        )
    }
}
