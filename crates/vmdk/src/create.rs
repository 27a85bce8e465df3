//! Creation-time layout planning and metadata writing for new images.

use crate::descriptor::{generate_descriptor, CreateType, ExtentLine, ExtentLineKind, CID_UNKNOWN};
use crate::header::{SparseHeader, SparseVariant, MAX_GT_ENTRIES};
use crate::util::align_up_u64;
use crate::vmdk::fresh_cid;
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

const SECTOR: u64 = SECTOR_SIZE as u64;

/// Reference grain geometry: 64 KiB grains, 512-entry grain tables.
pub const DEFAULT_GRAIN_SECTORS: u64 = 128;
pub const DEFAULT_GT_ENTRIES: u32 = 512;

/// Sector at which the embedded descriptor region starts, and its size.
const DESC_OFFSET_SECTORS: u64 = 1;
const DESC_SIZE_SECTORS: u64 = 20;

/// Maximum physical extent size of the split subformats: 2 GiB.
const SPLIT_EXTENT_SECTORS: u64 = (2 * 1024 * 1024 * 1024) / SECTOR;

/// Options for creating a new image.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub capacity_sectors: u64,
    pub create_type: CreateType,
    pub grain_sectors: u64,
    pub gt_entries: u32,
    /// Allow the zero-grain sentinel (raises the header version to 2).
    pub zeroed_grain: bool,
    pub adapter_type: String,
    /// Chain the new image onto a backing image.
    pub parent: Option<ParentLink>,
}

/// Identity of the backing image a new child records at creation time.
#[derive(Clone, Debug)]
pub struct ParentLink {
    /// The backing image's CID at the time the child is created.
    pub cid: u32,
    pub file_name_hint: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            capacity_sectors: 0,
            create_type: CreateType::MonolithicSparse,
            grain_sectors: DEFAULT_GRAIN_SECTORS,
            gt_entries: DEFAULT_GT_ENTRIES,
            zeroed_grain: false,
            adapter_type: "ide".to_string(),
            parent: None,
        }
    }
}

/// On-disk layout of one sparse extent, all offsets/sizes in sectors:
/// header, descriptor region, redundant grain directory and its tables,
/// primary grain directory and its tables, then grain data aligned to the
/// grain size.
#[derive(Clone, Copy, Debug)]
pub struct LayoutPlan {
    pub desc_offset: u64,
    pub desc_size: u64,
    /// Grain-directory length in entries (= number of grain tables).
    pub gt_count: u32,
    /// Size of one grain table.
    pub gt_sectors: u64,
    /// Size of one grain directory.
    pub gd_sectors: u64,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    /// First grain-data sector.
    pub grain_offset: u64,
}

/// Computes the layout of a sparse extent holding `capacity_sectors`.
pub fn plan_layout(
    capacity_sectors: u64,
    grain_sectors: u64,
    gt_entries: u32,
) -> Result<LayoutPlan> {
    if capacity_sectors == 0 {
        return Err(DiskError::InvalidConfig("capacity must be positive"));
    }
    if grain_sectors == 0 || !grain_sectors.is_power_of_two() || grain_sectors > 0x20_0000 {
        return Err(DiskError::InvalidConfig(
            "granularity must be a power of two within the supported range",
        ));
    }
    if gt_entries == 0 || gt_entries > MAX_GT_ENTRIES {
        return Err(DiskError::InvalidConfig("grain table length"));
    }

    let gt_coverage = grain_sectors * gt_entries as u64;
    let gt_count: u32 = capacity_sectors
        .div_ceil(gt_coverage)
        .try_into()
        .map_err(|_| DiskError::InvalidConfig("capacity implies too many grain tables"))?;
    let gt_sectors = (gt_entries as u64 * 4).div_ceil(SECTOR);
    let gd_sectors = (gt_count as u64 * 4).div_ceil(SECTOR);

    let rgd_offset = DESC_OFFSET_SECTORS + DESC_SIZE_SECTORS;
    let tables = gd_sectors + gt_count as u64 * gt_sectors;
    let gd_offset = rgd_offset + tables;
    let grain_offset = align_up_u64(gd_offset + tables, grain_sectors)?;

    Ok(LayoutPlan {
        desc_offset: DESC_OFFSET_SECTORS,
        desc_size: DESC_SIZE_SECTORS,
        gt_count,
        gt_sectors,
        gd_sectors,
        rgd_offset,
        gd_offset,
        grain_offset,
    })
}

/// Writes a new sparse extent: header, zero-filled grain tables (the file
/// extension itself) and both grain directories pointing at sequentially
/// placed tables. Optionally embeds descriptor text.
pub fn write_sparse_extent<B: StorageBackend>(
    backend: &mut B,
    capacity_sectors: u64,
    grain_sectors: u64,
    gt_entries: u32,
    compressed: bool,
    zeroed_grain: bool,
    descriptor: Option<&str>,
) -> Result<LayoutPlan> {
    let plan = plan_layout(capacity_sectors, grain_sectors, gt_entries)?;

    backend.set_len(plan.grain_offset * SECTOR)?;

    let header = SparseHeader {
        variant: SparseVariant::Kdmv,
        version: if zeroed_grain { 2 } else { 1 },
        capacity_sectors,
        grain_sectors,
        desc_offset: plan.desc_offset,
        desc_size: plan.desc_size,
        gt_entries,
        rgd_offset: Some(plan.rgd_offset),
        gd_offset: plan.gd_offset,
        grain_offset: plan.grain_offset,
        l1_size: plan.gt_count,
        compressed,
        has_marker: compressed,
        zeroed_grain,
    };
    backend.write_at(0, &header.encode_kdmv())?;

    write_directory(backend, plan.rgd_offset, plan.gd_sectors, &plan)?;
    write_directory(backend, plan.gd_offset, plan.gd_sectors, &plan)?;

    if let Some(text) = descriptor {
        if text.len() > (plan.desc_size * SECTOR) as usize {
            return Err(DiskError::InvalidConfig(
                "descriptor does not fit its region",
            ));
        }
        backend.write_at(plan.desc_offset * SECTOR, text.as_bytes())?;
    }

    backend.flush()?;
    Ok(plan)
}

/// Every directory entry is pre-allocated and non-zero: entry `i` points at
/// the `i`-th table behind its directory.
fn write_directory<B: StorageBackend>(
    backend: &mut B,
    dir_offset: u64,
    gd_sectors: u64,
    plan: &LayoutPlan,
) -> Result<()> {
    let first_gt = dir_offset + gd_sectors;
    let mut entries = Vec::with_capacity(plan.gt_count as usize * 4);
    for i in 0..plan.gt_count as u64 {
        let gt: u32 = (first_gt + i * plan.gt_sectors)
            .try_into()
            .map_err(|_| DiskError::InvalidConfig("grain table beyond addressable range"))?;
        entries.extend_from_slice(&gt.to_le_bytes());
    }
    backend.write_at(dir_offset * SECTOR, &entries)
}

/// Creates a flat extent: a single length extension.
pub fn write_flat_extent<B: StorageBackend>(backend: &mut B, sectors: u64) -> Result<()> {
    let len = sectors
        .checked_mul(SECTOR)
        .ok_or(DiskError::InvalidConfig("flat extent size"))?;
    backend.set_len(len)?;
    backend.flush()
}

/// Creates a complete image of `opts.create_type`, allocating container
/// files through `alloc` (called once per physical file with its name).
///
/// `base_name` is the image name without extension; extent files follow the
/// conventional `-sNNN` / `-fNNN` / `-flat` naming. Split subformats cap
/// each physical extent at 2 GiB and emit one descriptor extent line per
/// file.
pub fn create_image<B: StorageBackend>(
    opts: &CreateOptions,
    base_name: &str,
    mut alloc: impl FnMut(&str) -> Result<B>,
) -> Result<()> {
    if opts.capacity_sectors == 0 {
        return Err(DiskError::InvalidConfig("capacity must be positive"));
    }

    let cid = fresh_cid();
    let parent_cid = opts.parent.as_ref().map_or(CID_UNKNOWN, |p| p.cid);
    let parent_hint = opts.parent.as_ref().map(|p| p.file_name_hint.as_str());

    let entry_name = format!("{base_name}.vmdk");
    match opts.create_type {
        CreateType::MonolithicSparse | CreateType::StreamOptimized => {
            let compressed = opts.create_type == CreateType::StreamOptimized;
            let extents = vec![ExtentLine {
                sectors: opts.capacity_sectors,
                kind: ExtentLineKind::Sparse,
                file_name: entry_name.clone(),
            }];
            let text = generate_descriptor(
                opts.create_type,
                cid,
                parent_cid,
                parent_hint,
                opts.capacity_sectors,
                &opts.adapter_type,
                &extents,
            );
            let mut backend = alloc(&entry_name)?;
            write_sparse_extent(
                &mut backend,
                opts.capacity_sectors,
                opts.grain_sectors,
                opts.gt_entries,
                compressed,
                opts.zeroed_grain && !compressed,
                Some(&text),
            )?;
            Ok(())
        }
        CreateType::MonolithicFlat => {
            let data_name = format!("{base_name}-flat.vmdk");
            let mut data = alloc(&data_name)?;
            write_flat_extent(&mut data, opts.capacity_sectors)?;

            let extents = vec![ExtentLine {
                sectors: opts.capacity_sectors,
                kind: ExtentLineKind::Flat { offset_sectors: 0 },
                file_name: data_name,
            }];
            write_descriptor_file(
                opts,
                &entry_name,
                cid,
                parent_cid,
                parent_hint,
                &extents,
                &mut alloc,
            )
        }
        CreateType::TwoGbMaxExtentSparse => {
            let mut extents = Vec::new();
            for (i, sectors) in split_sizes(opts.capacity_sectors).enumerate() {
                let name = format!("{base_name}-s{:03}.vmdk", i + 1);
                let mut backend = alloc(&name)?;
                write_sparse_extent(
                    &mut backend,
                    sectors,
                    opts.grain_sectors,
                    opts.gt_entries,
                    false,
                    opts.zeroed_grain,
                    None,
                )?;
                extents.push(ExtentLine {
                    sectors,
                    kind: ExtentLineKind::Sparse,
                    file_name: name,
                });
            }
            write_descriptor_file(
                opts,
                &entry_name,
                cid,
                parent_cid,
                parent_hint,
                &extents,
                &mut alloc,
            )
        }
        CreateType::TwoGbMaxExtentFlat => {
            let mut extents = Vec::new();
            for (i, sectors) in split_sizes(opts.capacity_sectors).enumerate() {
                let name = format!("{base_name}-f{:03}.vmdk", i + 1);
                let mut backend = alloc(&name)?;
                write_flat_extent(&mut backend, sectors)?;
                extents.push(ExtentLine {
                    sectors,
                    kind: ExtentLineKind::Flat { offset_sectors: 0 },
                    file_name: name,
                });
            }
            write_descriptor_file(
                opts,
                &entry_name,
                cid,
                parent_cid,
                parent_hint,
                &extents,
                &mut alloc,
            )
        }
        CreateType::Vmfs | CreateType::VmfsSparse => {
            Err(DiskError::Unsupported("creation of VMFS server images"))
        }
    }
}

fn write_descriptor_file<B: StorageBackend>(
    opts: &CreateOptions,
    entry_name: &str,
    cid: u32,
    parent_cid: u32,
    parent_hint: Option<&str>,
    extents: &[ExtentLine],
    alloc: &mut impl FnMut(&str) -> Result<B>,
) -> Result<()> {
    let text = generate_descriptor(
        opts.create_type,
        cid,
        parent_cid,
        parent_hint,
        opts.capacity_sectors,
        &opts.adapter_type,
        extents,
    );
    let mut backend = alloc(entry_name)?;
    backend.write_at(0, text.as_bytes())?;
    backend.flush()
}

/// Physical extent sizes for the split subformats.
fn split_sizes(total_sectors: u64) -> impl Iterator<Item = u64> {
    let mut remaining = total_sectors;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let chunk = remaining.min(SPLIT_EXTENT_SECTORS);
        remaining -= chunk;
        Some(chunk)
    })
}
