//! Extent composition: ordered, non-overlapping pieces of the virtual
//! address space, each backed by one container file (or a region of one).

use crate::cache::GrainTableCache;
use crate::header::SparseVariant;
use crate::{DiskError, Result, SECTOR_SIZE};

/// Hard caps against corrupt headers implying absurd allocations.
const MAX_CLUSTER_SECTORS: u64 = 0x20_0000;
pub(crate) const MAX_L1_ENTRIES: u64 = 512 * 1024 * 1024;

pub(crate) struct SparseParams {
    pub variant: SparseVariant,
    pub cluster_sectors: u64,
    pub l2_size: u32,
    pub l1_table: Vec<u32>,
    /// Grain tables behind the redundant grain directory, when mirrored.
    pub l1_backup_table: Option<Vec<u32>>,
    pub compressed: bool,
    pub has_marker: bool,
    pub zeroed_grain: bool,
    pub cache: GrainTableCache,
}

impl SparseParams {
    pub(crate) fn cluster_bytes(&self) -> u64 {
        self.cluster_sectors * SECTOR_SIZE as u64
    }

    /// Virtual sectors covered by one grain table.
    pub(crate) fn gt_coverage_sectors(&self) -> u64 {
        self.cluster_sectors * self.l2_size as u64
    }
}

pub(crate) enum ExtentKind {
    /// Pre-allocated run of sectors at a fixed byte offset in its file.
    Flat { base_offset: u64 },
    Sparse(Box<SparseParams>),
}

pub(crate) struct Extent<B> {
    pub backend: B,
    pub sectors: u64,
    /// Exclusive virtual end boundary; the start is `end_sector - sectors`.
    pub end_sector: u64,
    pub kind: ExtentKind,
}

impl<B> Extent<B> {
    pub(crate) fn start_sector(&self) -> u64 {
        self.end_sector - self.sectors
    }

    pub(crate) fn sparse(&self) -> Option<&SparseParams> {
        match &self.kind {
            ExtentKind::Sparse(params) => Some(params),
            ExtentKind::Flat { .. } => None,
        }
    }
}

/// The ordered extent set composing one virtual disk. Extent order defines
/// the virtual address layout: each appended extent starts where the
/// previous one ended.
pub(crate) struct ExtentTable<B> {
    extents: Vec<Extent<B>>,
}

impl<B> ExtentTable<B> {
    pub(crate) fn new() -> Self {
        Self {
            extents: Vec::new(),
        }
    }

    pub(crate) fn total_sectors(&self) -> u64 {
        self.extents.last().map_or(0, |e| e.end_sector)
    }

    pub(crate) fn len(&self) -> usize {
        self.extents.len()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Extent<B> {
        &mut self.extents[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Extent<B>> {
        self.extents.iter()
    }

    pub(crate) fn add_flat(&mut self, backend: B, sectors: u64, base_offset: u64) -> Result<()> {
        self.push(backend, sectors, ExtentKind::Flat { base_offset })
    }

    pub(crate) fn add_sparse(
        &mut self,
        backend: B,
        sectors: u64,
        params: SparseParams,
    ) -> Result<()> {
        if params.cluster_sectors > MAX_CLUSTER_SECTORS {
            return Err(DiskError::ExtentTooLarge("cluster size"));
        }
        if params.l1_table.len() as u64 > MAX_L1_ENTRIES {
            return Err(DiskError::ExtentTooLarge("grain directory length"));
        }
        self.push(backend, sectors, ExtentKind::Sparse(Box::new(params)))
    }

    fn push(&mut self, backend: B, sectors: u64, kind: ExtentKind) -> Result<()> {
        let end_sector = self
            .total_sectors()
            .checked_add(sectors)
            .ok_or(DiskError::OffsetOverflow)?;
        end_sector
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.extents.push(Extent {
            backend,
            sectors,
            end_sector,
            kind,
        });
        Ok(())
    }

    /// Finds the extent containing `sector`, resuming from `hint` (the
    /// previously used extent) so sequential access is O(1) amortized.
    pub(crate) fn find(&self, sector: u64, hint: usize) -> Option<usize> {
        let start = match self.extents.get(hint) {
            Some(e) if sector >= e.start_sector() => hint,
            _ => 0,
        };
        for (i, extent) in self.extents.iter().enumerate().skip(start) {
            if sector < extent.end_sector {
                return Some(i);
            }
        }
        None
    }
}
