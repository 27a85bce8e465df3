//! The virtual-disk engine: extent composition, grain address translation,
//! allocate-on-write with copy-on-write fill, and snapshot-chain validation.

use tracing::{debug, warn};

use crate::cache::GrainTableCache;
use crate::codec::{read_compressed_grain, write_compressed_grain};
use crate::descriptor::{
    self, CreateType, Descriptor, ExtentLineKind, CID_UNKNOWN, DESC_REGION_BYTES,
};
use crate::extent::{Extent, ExtentKind, ExtentTable, SparseParams};
use crate::header::{read_sparse_header, SparseVariant, COWD_MAGIC, KDMV_MAGIC};
use crate::util::{align_up_u64, be_u32, checked_range, le_u32};
use crate::{
    BackingDisk, DiskError, GrainTableCacheStats, Result, StorageBackend, VirtualDisk, SECTOR_SIZE,
};

const SECTOR: u64 = SECTOR_SIZE as u64;

/// Grain-table entry sentinels.
const GTE_UNALLOCATED: u32 = 0;
const GTE_ZERO: u32 = 1;

/// Upper bound we accept for a standalone descriptor file.
const MAX_DESC_FILE_BYTES: u64 = 1024 * 1024;

/// Summary of one extent of an opened disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtentInfo {
    pub sectors: u64,
    pub flat: bool,
    pub variant: Option<SparseVariant>,
    pub compressed: bool,
    pub cluster_sectors: Option<u64>,
}

#[derive(Copy, Clone, Debug)]
enum ChainState {
    Unchecked,
    Valid,
    Broken { expected: u32, actual: u32 },
}

#[derive(Copy, Clone, Debug)]
enum DescriptorRegion {
    /// No descriptor anywhere (a bare `COWD` container).
    None,
    /// Embedded in an extent's container file.
    Embedded { extent: usize, offset: u64, len: usize },
    /// The standalone descriptor file is the whole region.
    Standalone { len: usize },
}

/// A virtual disk composed of one or more extents, optionally chained onto a
/// read-only backing image.
///
/// All mutating operations take `&mut self`; the exclusive borrow serializes
/// them, so no further locking exists inside the engine.
pub struct VmdkDisk<B> {
    extents: ExtentTable<B>,
    /// Standalone descriptor file, when the image has one.
    desc_file: Option<B>,
    desc_region: DescriptorRegion,
    total_sectors: u64,
    cid: u32,
    parent_cid: u32,
    create_type: CreateType,
    parent_hint: Option<String>,
    parent: Option<Box<dyn BackingDisk>>,
    chain: ChainState,
    cid_updated: bool,
    /// Last extent used, so sequential access resumes in O(1).
    hint: usize,
}

impl<B> std::fmt::Debug for VmdkDisk<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmdkDisk")
            .field("total_sectors", &self.total_sectors)
            .field("cid", &self.cid)
            .field("parent_cid", &self.parent_cid)
            .field("create_type", &self.create_type)
            .field("parent_hint", &self.parent_hint)
            .field("cid_updated", &self.cid_updated)
            .field("hint", &self.hint)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend> VmdkDisk<B> {
    /// Opens a single-file image (sparse container with or without an
    /// embedded descriptor).
    ///
    /// Images whose descriptor names external extent files need
    /// [`VmdkDisk::open_with`].
    pub fn open(mut backend: B) -> Result<Self> {
        if sniff_sparse_magic(&mut backend)? {
            return Self::open_single_sparse(backend);
        }
        Err(DiskError::Unsupported(
            "descriptor file references extent files; open it with an extent opener",
        ))
    }

    /// Opens an image from its entry file, resolving extent files named by a
    /// descriptor through `opener`.
    pub fn open_with(mut backend: B, mut opener: impl FnMut(&str) -> Result<B>) -> Result<Self> {
        if sniff_sparse_magic(&mut backend)? {
            return Self::open_single_sparse(backend);
        }
        Self::open_descriptor_file(backend, &mut opener)
    }

    fn open_single_sparse(mut backend: B) -> Result<Self> {
        let header = read_sparse_header(&mut backend)?;
        let l1_table = load_directory(&mut backend, header.gd_offset, header.l1_size)?;
        let l1_backup_table = match header.rgd_offset {
            Some(rgd) => Some(load_directory(&mut backend, rgd, header.l1_size)?),
            None => None,
        };

        let desc_region = if header.desc_size > 0 {
            let offset = header
                .desc_offset
                .checked_mul(SECTOR)
                .ok_or(DiskError::MalformedHeader("descriptor region offset"))?;
            let len = header
                .desc_size
                .checked_mul(SECTOR)
                .filter(|len| *len <= MAX_DESC_FILE_BYTES)
                .ok_or(DiskError::MalformedHeader("descriptor region size"))?;
            DescriptorRegion::Embedded {
                extent: 0,
                offset,
                len: len as usize,
            }
        } else {
            DescriptorRegion::None
        };

        // The embedded descriptor carries the CID pair, the subformat name
        // and the parent hint; the extent geometry always comes from the
        // binary header.
        let mut cid = CID_UNKNOWN;
        let mut parent_cid = CID_UNKNOWN;
        let mut parent_hint = None;
        let mut create_type = match (header.variant, header.compressed) {
            (SparseVariant::Cowd, _) => CreateType::VmfsSparse,
            (SparseVariant::Kdmv, true) => CreateType::StreamOptimized,
            (SparseVariant::Kdmv, false) => CreateType::MonolithicSparse,
        };
        if let DescriptorRegion::Embedded { offset, len, .. } = desc_region {
            let mut region = vec![0u8; len];
            read_exact_or(
                &mut backend,
                offset,
                &mut region,
                "descriptor region beyond end of file",
            )?;
            cid = descriptor::read_cid(&region, false);
            parent_cid = descriptor::read_cid(&region, true);
            if let Ok(desc) = Descriptor::parse(&String::from_utf8_lossy(trim_region(&region))) {
                create_type = desc.create_type;
                parent_hint = desc.parent_file_name_hint;
            }
        }

        let capacity_sectors = header.capacity_sectors;
        let mut extents = ExtentTable::new();
        extents.add_sparse(
            backend,
            capacity_sectors,
            SparseParams {
                variant: header.variant,
                cluster_sectors: header.grain_sectors,
                l2_size: header.gt_entries,
                l1_table,
                l1_backup_table,
                compressed: header.compressed,
                has_marker: header.has_marker,
                zeroed_grain: header.zeroed_grain,
                cache: GrainTableCache::new(),
            },
        )?;

        debug!(
            capacity_sectors,
            create_type = create_type.name(),
            "opened sparse container"
        );

        Ok(Self {
            extents,
            desc_file: None,
            desc_region,
            total_sectors: capacity_sectors,
            cid,
            parent_cid,
            create_type,
            parent_hint,
            parent: None,
            chain: ChainState::Unchecked,
            cid_updated: false,
            hint: 0,
        })
    }

    fn open_descriptor_file(
        mut backend: B,
        opener: &mut impl FnMut(&str) -> Result<B>,
    ) -> Result<Self> {
        let len = backend.len()?;
        if len > MAX_DESC_FILE_BYTES {
            return Err(DiskError::MalformedDescriptor("descriptor file too large"));
        }
        let mut text_bytes = vec![0u8; len as usize];
        backend.read_at(0, &mut text_bytes)?;
        let text = String::from_utf8_lossy(trim_region(&text_bytes)).into_owned();

        let desc = Descriptor::parse(&text)?;
        let mut extents = ExtentTable::new();
        for line in &desc.extents {
            let mut extent_backend = opener(&line.file_name)?;
            match line.kind {
                ExtentLineKind::Flat { offset_sectors } => {
                    let base = offset_sectors
                        .checked_mul(SECTOR)
                        .ok_or(DiskError::MalformedDescriptor("flat extent offset"))?;
                    extents.add_flat(extent_backend, line.sectors, base)?;
                }
                ExtentLineKind::Sparse => {
                    let header = read_sparse_header(&mut extent_backend)?;
                    let l1_table =
                        load_directory(&mut extent_backend, header.gd_offset, header.l1_size)?;
                    let l1_backup_table = match header.rgd_offset {
                        Some(rgd) => {
                            Some(load_directory(&mut extent_backend, rgd, header.l1_size)?)
                        }
                        None => None,
                    };
                    extents.add_sparse(
                        extent_backend,
                        line.sectors,
                        SparseParams {
                            variant: header.variant,
                            cluster_sectors: header.grain_sectors,
                            l2_size: header.gt_entries,
                            l1_table,
                            l1_backup_table,
                            compressed: header.compressed,
                            has_marker: header.has_marker,
                            zeroed_grain: header.zeroed_grain,
                            cache: GrainTableCache::new(),
                        },
                    )?;
                }
            }
        }
        if extents.len() == 0 {
            return Err(DiskError::MalformedDescriptor(
                "descriptor lists no usable extents",
            ));
        }

        let total_sectors = extents.total_sectors();
        let desc_region = DescriptorRegion::Standalone {
            len: (len as usize).min(DESC_REGION_BYTES),
        };

        debug!(
            total_sectors,
            extent_count = extents.len(),
            create_type = desc.create_type.name(),
            "opened descriptor-file image"
        );

        Ok(Self {
            extents,
            desc_file: Some(backend),
            desc_region,
            total_sectors,
            cid: desc.cid,
            parent_cid: desc.parent_cid,
            create_type: desc.create_type,
            parent_hint: desc.parent_file_name_hint,
            parent: None,
            chain: ChainState::Unchecked,
            cid_updated: false,
            hint: 0,
        })
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn parent_cid(&self) -> u32 {
        self.parent_cid
    }

    pub fn create_type(&self) -> CreateType {
        self.create_type
    }

    /// Path hint recorded at creation time for locating the backing image.
    /// Resolving and opening it is the caller's business.
    pub fn parent_file_name_hint(&self) -> Option<&str> {
        self.parent_hint.as_deref()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Chains this disk onto an opened backing image. The chain is validated
    /// lazily, once, on the first backing-dependent operation.
    pub fn attach_parent(&mut self, parent: Box<dyn BackingDisk>) {
        self.parent = Some(parent);
        self.chain = ChainState::Unchecked;
    }

    pub fn take_parent(&mut self) -> Option<Box<dyn BackingDisk>> {
        self.chain = ChainState::Unchecked;
        self.parent.take()
    }

    /// Per-extent summaries in virtual address order, the shape
    /// `info`-style tooling reports.
    pub fn extents_info(&self) -> Vec<ExtentInfo> {
        self.extents
            .iter()
            .map(|extent| match extent.sparse() {
                Some(params) => ExtentInfo {
                    sectors: extent.sectors,
                    flat: false,
                    variant: Some(params.variant),
                    compressed: params.compressed,
                    cluster_sectors: Some(params.cluster_sectors),
                },
                None => ExtentInfo {
                    sectors: extent.sectors,
                    flat: true,
                    variant: None,
                    compressed: false,
                    cluster_sectors: None,
                },
            })
            .collect()
    }

    /// Cache statistics of one extent's grain-table cache (flat extents have
    /// none).
    pub fn grain_table_cache_stats(&mut self, extent_index: usize) -> Option<GrainTableCacheStats> {
        if extent_index >= self.extents.len() {
            return None;
        }
        self.extents
            .get_mut(extent_index)
            .sparse()
            .map(|p| p.cache.stats())
    }

    /// Marks whole aligned clusters as explicitly zero without touching grain
    /// storage.
    ///
    /// Only legal on zero-grain-capable raw extents, for cluster-aligned
    /// requests covering at least one full cluster; anything else is
    /// [`DiskError::Unsupported`]. With `dry_run` the eligibility check runs
    /// and nothing is mutated, letting a caller fall back to an ordinary
    /// zero-filled data write.
    pub fn write_zeroes(&mut self, offset: u64, len: u64, dry_run: bool) -> Result<()> {
        let capacity = self.capacity_bytes();
        let end = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        if end > capacity {
            return Err(DiskError::CapacityExceeded {
                sector: offset / SECTOR,
                total_sectors: self.total_sectors,
            });
        }
        if len == 0 {
            return Err(DiskError::Unsupported(
                "zero-write must cover at least one cluster",
            ));
        }

        // Eligibility over the whole range first, so the dry run and the
        // mutating pass agree.
        let mut pos = 0u64;
        while pos < len {
            let abs = offset + pos;
            let idx = self
                .extents
                .find(abs / SECTOR, self.hint)
                .ok_or_else(|| DiskError::Io("sector beyond last extent".into()))?;
            let extent = self.extents.get_mut(idx);
            let extent_start_byte = extent.start_sector() * SECTOR;
            let extent_end_byte = extent.end_sector * SECTOR;
            let Some(params) = extent.sparse() else {
                return Err(DiskError::Unsupported("zero-write on a flat extent"));
            };
            if params.compressed || !params.zeroed_grain {
                return Err(DiskError::Unsupported("extent is not zero-grain-capable"));
            }
            let cluster_bytes = params.cluster_bytes();
            let rel = abs - extent_start_byte;
            if rel % cluster_bytes != 0 {
                return Err(DiskError::Unsupported("zero-write is not cluster-aligned"));
            }
            if len - pos < cluster_bytes || extent_end_byte - abs < cluster_bytes {
                return Err(DiskError::Unsupported(
                    "zero-write must cover whole clusters",
                ));
            }
            pos += cluster_bytes;
        }

        if dry_run {
            return Ok(());
        }

        let mut pos = 0u64;
        while pos < len {
            let abs = offset + pos;
            let idx = self
                .extents
                .find(abs / SECTOR, self.hint)
                .ok_or_else(|| DiskError::Io("sector beyond last extent".into()))?;
            self.hint = idx;
            let extent = self.extents.get_mut(idx);
            let rel = abs - extent.start_sector() * SECTOR;
            let cluster_bytes = match extent.sparse() {
                Some(params) => params.cluster_bytes(),
                None => return Err(DiskError::Unsupported("zero-write on a flat extent")),
            };
            let entry = locate_entry(extent, rel)?
                .ok_or(DiskError::CorruptMetadata("grain table not allocated"))?;
            publish_entry(extent, &entry.update(GTE_ZERO))?;
            pos += cluster_bytes;
        }

        self.stamp_cid_once()
    }

    fn read_desc_region(&mut self) -> Result<Option<Vec<u8>>> {
        match self.desc_region {
            DescriptorRegion::None => Ok(None),
            DescriptorRegion::Embedded {
                extent,
                offset,
                len,
            } => {
                let mut region = vec![0u8; len];
                self.extents
                    .get_mut(extent)
                    .backend
                    .read_at(offset, &mut region)?;
                Ok(Some(region))
            }
            DescriptorRegion::Standalone { len } => {
                let desc_file = self
                    .desc_file
                    .as_mut()
                    .ok_or(DiskError::CorruptMetadata("descriptor file missing"))?;
                let mut region = vec![0u8; len];
                desc_file.read_at(0, &mut region)?;
                Ok(Some(region))
            }
        }
    }

    fn write_desc_region(&mut self, bytes: &[u8]) -> Result<()> {
        match self.desc_region {
            DescriptorRegion::None => Ok(()),
            DescriptorRegion::Embedded { extent, offset, .. } => {
                self.extents.get_mut(extent).backend.write_at(offset, bytes)
            }
            DescriptorRegion::Standalone { .. } => {
                let desc_file = self
                    .desc_file
                    .as_mut()
                    .ok_or(DiskError::CorruptMetadata("descriptor file missing"))?;
                desc_file.write_at(0, bytes)
            }
        }
    }

    /// Stamps a freshly generated CID after the first successful write of the
    /// session, so disks chained on top of this one detect the mutation.
    fn stamp_cid_once(&mut self) -> Result<()> {
        if self.cid_updated {
            return Ok(());
        }
        let Some(region) = self.read_desc_region()? else {
            // No descriptor region: nothing a child could chain on.
            self.cid_updated = true;
            return Ok(());
        };
        let new_cid = fresh_cid();
        // A standalone descriptor file is rewritten at the full region size
        // (growing a short file) so the rewrite never truncates tail lines.
        let region_len = match self.desc_region {
            DescriptorRegion::Embedded { len, .. } => len,
            _ => DESC_REGION_BYTES.max(region.len()),
        };
        let rewritten = descriptor::write_cid(&region, region_len, new_cid)?;
        self.write_desc_region(&rewritten)?;
        self.cid = new_cid;
        self.cid_updated = true;
        debug!("stamped fresh cid {new_cid:#010x}");
        Ok(())
    }
}

impl<B: StorageBackend> VirtualDisk for VmdkDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.total_sectors * SECTOR
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity_bytes())?;
        if buf.is_empty() {
            return Ok(());
        }

        let capacity_bytes = self.total_sectors * SECTOR;
        let Self {
            extents,
            parent,
            chain,
            parent_cid,
            hint,
            ..
        } = self;

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let idx = extents
                .find(abs / SECTOR, *hint)
                .ok_or_else(|| DiskError::Io("sector beyond last extent".into()))?;
            *hint = idx;
            let extent = extents.get_mut(idx);
            let extent_end_byte = extent.end_sector * SECTOR;
            let rel = abs - extent.start_sector() * SECTOR;
            let remaining = buf.len() - pos;

            let geometry = extent
                .sparse()
                .map(|p| (p.cluster_bytes(), p.compressed));
            let (within, chunk) = match geometry {
                Some((cluster_bytes, _)) => {
                    let within = (rel % cluster_bytes) as usize;
                    let chunk = (cluster_bytes as usize - within)
                        .min(remaining)
                        .min((extent_end_byte - abs) as usize);
                    (within, chunk)
                }
                None => (0, ((extent_end_byte - abs) as usize).min(remaining)),
            };

            let mut ctx = CowCtx {
                parent: &mut *parent,
                chain: &mut *chain,
                parent_cid: *parent_cid,
                capacity_bytes,
            };
            let out = &mut buf[pos..pos + chunk];
            match get_cluster_offset(extent, &mut ctx, rel, false)? {
                ClusterLookup::Hit { cluster_offset } => match geometry {
                    Some((cluster_bytes, true)) => {
                        let grain = read_compressed_grain(
                            &mut extent.backend,
                            cluster_offset,
                            cluster_bytes as usize,
                        )?;
                        let end = within + chunk;
                        if end > grain.data.len() {
                            return Err(DiskError::CorruptGrain(
                                "grain shorter than requested range",
                            ));
                        }
                        out.copy_from_slice(&grain.data[within..end]);
                    }
                    _ => {
                        read_exact_or(
                            &mut extent.backend,
                            cluster_offset + within as u64,
                            out,
                            "grain beyond end of extent file",
                        )?;
                    }
                },
                ClusterLookup::Zero => out.fill(0),
                ClusterLookup::Unallocated => {
                    if let Some(parent) = ctx.parent.as_mut() {
                        ensure_chain(parent.as_mut(), ctx.chain, ctx.parent_cid)?;
                        read_from_parent(parent.as_mut(), abs, out)?;
                    } else {
                        out.fill(0);
                    }
                }
                ClusterLookup::Fresh { .. } => {
                    return Err(DiskError::CorruptMetadata(
                        "allocation during read-only translation",
                    ));
                }
            }
            pos += chunk;
        }

        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let capacity_bytes = self.total_sectors * SECTOR;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > capacity_bytes {
            return Err(DiskError::CapacityExceeded {
                sector: offset / SECTOR,
                total_sectors: self.total_sectors,
            });
        }
        if buf.is_empty() {
            return Ok(());
        }

        {
            let Self {
                extents,
                parent,
                chain,
                parent_cid,
                hint,
                ..
            } = self;

            let mut pos = 0usize;
            while pos < buf.len() {
                let abs = offset + pos as u64;
                let idx = extents
                    .find(abs / SECTOR, *hint)
                    .ok_or_else(|| DiskError::Io("sector beyond last extent".into()))?;
                *hint = idx;
                let extent = extents.get_mut(idx);
                let extent_end_byte = extent.end_sector * SECTOR;
                let rel = abs - extent.start_sector() * SECTOR;
                let remaining = buf.len() - pos;

                let geometry = extent
                    .sparse()
                    .map(|p| (p.cluster_bytes(), p.compressed));
                let (within, chunk) = match geometry {
                    Some((cluster_bytes, _)) => {
                        let within = (rel % cluster_bytes) as usize;
                        let chunk = (cluster_bytes as usize - within)
                            .min(remaining)
                            .min((extent_end_byte - abs) as usize);
                        (within, chunk)
                    }
                    None => (0, ((extent_end_byte - abs) as usize).min(remaining)),
                };

                let mut ctx = CowCtx {
                    parent: &mut *parent,
                    chain: &mut *chain,
                    parent_cid: *parent_cid,
                    capacity_bytes,
                };
                match get_cluster_offset(extent, &mut ctx, rel, true)? {
                    ClusterLookup::Hit { cluster_offset } => {
                        // Compressed extents are append-only: a grain, once
                        // written, is never rewritten.
                        if matches!(geometry, Some((_, true))) {
                            return Err(DiskError::WriteOnceViolation);
                        }
                        extent
                            .backend
                            .write_at(cluster_offset + within as u64, &buf[pos..pos + chunk])?;
                    }
                    ClusterLookup::Fresh {
                        cluster_offset,
                        was_zero,
                        pending,
                    } => {
                        match geometry {
                            Some((cluster_bytes, true)) => {
                                if !extent.sparse().is_some_and(|p| p.has_marker) {
                                    return Err(DiskError::Unsupported(
                                        "compressed extent without marker framing",
                                    ));
                                }
                                // A grain always encodes the full logical
                                // cluster: COW base overlaid with the
                                // caller's bytes.
                                let mut cluster = vec![0u8; cluster_bytes as usize];
                                if !was_zero {
                                    if let Some(parent) = ctx.parent.as_mut() {
                                        ensure_chain(parent.as_mut(), ctx.chain, ctx.parent_cid)?;
                                        read_from_parent(
                                            parent.as_mut(),
                                            abs - within as u64,
                                            &mut cluster,
                                        )?;
                                    }
                                }
                                cluster[within..within + chunk]
                                    .copy_from_slice(&buf[pos..pos + chunk]);
                                let lba = (abs - within as u64) / SECTOR;
                                write_compressed_grain(
                                    &mut extent.backend,
                                    cluster_offset,
                                    lba,
                                    &cluster,
                                )?;
                            }
                            _ => {
                                extent.backend.write_at(
                                    cluster_offset + within as u64,
                                    &buf[pos..pos + chunk],
                                )?;
                            }
                        }
                        publish_entry(extent, &pending)?;
                    }
                    ClusterLookup::Unallocated | ClusterLookup::Zero => {
                        return Err(DiskError::CorruptMetadata(
                            "translation yielded no cluster for a write",
                        ));
                    }
                }
                pos += chunk;
            }
        }

        self.stamp_cid_once()
    }

    fn flush(&mut self) -> Result<()> {
        for i in 0..self.extents.len() {
            self.extents.get_mut(i).backend.flush()?;
        }
        if let Some(desc_file) = self.desc_file.as_mut() {
            desc_file.flush()?;
        }
        Ok(())
    }
}

impl<B: StorageBackend> BackingDisk for VmdkDisk<B> {
    /// Live CID, re-read from the descriptor so mutations by whoever holds
    /// this disk are observed.
    fn current_cid(&mut self) -> Result<u32> {
        Ok(match self.read_desc_region()? {
            Some(region) => descriptor::read_cid(&region, false),
            None => self.cid,
        })
    }
}

struct CowCtx<'a> {
    parent: &'a mut Option<Box<dyn BackingDisk>>,
    chain: &'a mut ChainState,
    parent_cid: u32,
    capacity_bytes: u64,
}

enum ClusterLookup {
    /// Cluster already has storage (for flat extents, the exact byte).
    Hit { cluster_offset: u64 },
    /// Cluster storage was just allocated; the caller writes the grain data,
    /// then publishes `pending`.
    Fresh {
        cluster_offset: u64,
        /// The previous entry was the zero sentinel, so the copy-on-write
        /// base is zeroes rather than the parent.
        was_zero: bool,
        pending: PendingUpdate,
    },
    Unallocated,
    Zero,
}

/// A grain-table entry update, prepared during translation and published
/// only after the grain data it references is durable.
struct PendingUpdate {
    slot: usize,
    l2_index: usize,
    gt_offset: u64,
    backup_gt_offset: Option<u64>,
    entry: u32,
}

struct EntryRef {
    slot: usize,
    l2_index: usize,
    gt_offset: u64,
    backup_gt_offset: Option<u64>,
    raw: u32,
}

impl EntryRef {
    fn update(&self, entry: u32) -> PendingUpdate {
        PendingUpdate {
            slot: self.slot,
            l2_index: self.l2_index,
            gt_offset: self.gt_offset,
            backup_gt_offset: self.backup_gt_offset,
            entry,
        }
    }
}

/// Resolves the grain-table entry covering byte `rel` of a sparse extent,
/// faulting the grain table into the cache if needed. `Ok(None)` means the
/// directory entry is zero: no grain table covers this range.
fn locate_entry<B: StorageBackend>(extent: &mut Extent<B>, rel: u64) -> Result<Option<EntryRef>> {
    let Extent { backend, kind, .. } = extent;
    let params = match kind {
        ExtentKind::Sparse(p) => p,
        ExtentKind::Flat { .. } => {
            return Err(DiskError::CorruptMetadata("grain lookup on a flat extent"))
        }
    };

    let rel_sector = rel / SECTOR;
    let l1_index = usize::try_from(rel_sector / params.gt_coverage_sectors())
        .map_err(|_| DiskError::CorruptMetadata("grain directory index"))?;
    if l1_index >= params.l1_table.len() {
        return Err(DiskError::CorruptMetadata(
            "grain directory index out of range",
        ));
    }
    let gt_offset = params.l1_table[l1_index] as u64;
    if gt_offset == 0 {
        return Ok(None);
    }

    let slot = match params.cache.lookup(gt_offset) {
        Some(slot) => slot,
        None => {
            let mut raw = vec![0u8; params.l2_size as usize * 4];
            read_exact_or(
                backend,
                gt_offset * SECTOR,
                &mut raw,
                "grain table beyond end of file",
            )?;
            let table: Box<[u32]> = raw.chunks_exact(4).map(le_u32).collect();
            params.cache.install(gt_offset, table)
        }
    };

    let l2_index = ((rel_sector / params.cluster_sectors) % params.l2_size as u64) as usize;
    Ok(Some(EntryRef {
        slot,
        l2_index,
        gt_offset,
        backup_gt_offset: params
            .l1_backup_table
            .as_ref()
            .map(|t| t[l1_index] as u64)
            .filter(|offset| *offset != 0),
        raw: params.cache.entry(slot, l2_index),
    }))
}

/// Maps byte `rel` of `extent` to physical storage, allocating a fresh
/// cluster when `allocate` is set and the entry is unallocated or the zero
/// sentinel.
///
/// For raw extents the fresh cluster is extended, copy-on-write filled and
/// flushed before this returns, so a crash before publication leaves the
/// entry unallocated rather than pointing at uninitialized data. Compressed
/// extents get no pre-extension; the caller appends the grain at the
/// returned offset.
fn get_cluster_offset<B: StorageBackend>(
    extent: &mut Extent<B>,
    ctx: &mut CowCtx<'_>,
    rel: u64,
    allocate: bool,
) -> Result<ClusterLookup> {
    let extent_start_sector = extent.start_sector();

    if let ExtentKind::Flat { base_offset } = &extent.kind {
        return Ok(ClusterLookup::Hit {
            cluster_offset: base_offset
                .checked_add(rel)
                .ok_or(DiskError::OffsetOverflow)?,
        });
    }

    let (zeroed_grain, compressed, cluster_bytes) = match extent.sparse() {
        Some(p) => (p.zeroed_grain, p.compressed, p.cluster_bytes()),
        None => return Err(DiskError::CorruptMetadata("grain lookup on a flat extent")),
    };

    // A directory entry of zero is never produced at runtime (creation
    // pre-allocates every grain table); tolerate it on read as a fully
    // unallocated range, refuse to allocate into it.
    let Some(entry) = locate_entry(extent, rel)? else {
        if allocate {
            return Err(DiskError::CorruptMetadata("grain table not allocated"));
        }
        return Ok(ClusterLookup::Unallocated);
    };

    let zeroed = entry.raw == GTE_ZERO && zeroed_grain;
    if entry.raw != GTE_UNALLOCATED && !zeroed {
        return Ok(ClusterLookup::Hit {
            cluster_offset: (entry.raw as u64) << 9,
        });
    }
    if !allocate {
        return Ok(if zeroed {
            ClusterLookup::Zero
        } else {
            ClusterLookup::Unallocated
        });
    }

    // Allocate at end-of-file.
    let backend = &mut extent.backend;
    let cluster_offset = align_up_u64(backend.len()?, SECTOR)?;

    if !compressed {
        backend.set_len(
            cluster_offset
                .checked_add(cluster_bytes)
                .ok_or(DiskError::OffsetOverflow)?,
        )?;
        // Copy-on-write fill: parent bytes for a previously unallocated
        // cluster, zeroes (the extension itself) for the zero sentinel.
        if !zeroed {
            if let Some(parent) = ctx.parent.as_mut() {
                ensure_chain(parent.as_mut(), ctx.chain, ctx.parent_cid)?;
                let cluster_rel = rel - rel % cluster_bytes;
                let virt = extent_start_sector * SECTOR + cluster_rel;
                let want = cluster_bytes.min(ctx.capacity_bytes.saturating_sub(virt)) as usize;
                if want > 0 {
                    let mut fill = vec![0u8; want];
                    read_from_parent(parent.as_mut(), virt, &mut fill)?;
                    backend.write_at(cluster_offset, &fill)?;
                }
            }
        }
        // Durability barrier: the grain data must be observable at its new
        // location before the table entry referencing it is published.
        backend.flush()?;
    }

    let entry_value: u32 = (cluster_offset / SECTOR)
        .try_into()
        .map_err(|_| DiskError::Unsupported("extent file exceeds addressable size"))?;
    Ok(ClusterLookup::Fresh {
        cluster_offset,
        was_zero: zeroed,
        pending: entry.update(entry_value),
    })
}

/// Publishes a grain-table entry: the in-memory cached table first, then the
/// primary on-disk table, then the mirrored table when one exists. A primary
/// failure aborts before the mirror is touched.
fn publish_entry<B: StorageBackend>(extent: &mut Extent<B>, pending: &PendingUpdate) -> Result<()> {
    let Extent { backend, kind, .. } = extent;
    let params = match kind {
        ExtentKind::Sparse(p) => p,
        ExtentKind::Flat { .. } => {
            return Err(DiskError::CorruptMetadata("publication on a flat extent"))
        }
    };

    params
        .cache
        .set_entry(pending.slot, pending.l2_index, pending.entry);

    let bytes = pending.entry.to_le_bytes();
    let entry_byte = pending.l2_index as u64 * 4;
    backend.write_at(pending.gt_offset * SECTOR + entry_byte, &bytes)?;
    if let Some(backup) = pending.backup_gt_offset {
        backend.write_at(backup * SECTOR + entry_byte, &bytes)?;
    }
    Ok(())
}

/// Validates the backing chain once per session: the backing image's live
/// CID must equal the parent CID recorded in this disk's descriptor at
/// creation time. A mismatch poisons every later backing-dependent
/// operation.
fn ensure_chain(
    parent: &mut dyn BackingDisk,
    chain: &mut ChainState,
    parent_cid: u32,
) -> Result<()> {
    match *chain {
        ChainState::Valid => Ok(()),
        ChainState::Broken { expected, actual } => {
            Err(DiskError::ChainInconsistent { expected, actual })
        }
        ChainState::Unchecked => {
            let actual = parent.current_cid()?;
            if actual == parent_cid {
                *chain = ChainState::Valid;
                Ok(())
            } else {
                warn!(
                    "backing image cid mismatch: live {actual:#010x}, recorded {parent_cid:#010x}"
                );
                *chain = ChainState::Broken {
                    expected: parent_cid,
                    actual,
                };
                Err(DiskError::ChainInconsistent {
                    expected: parent_cid,
                    actual,
                })
            }
        }
    }
}

/// Reads from the backing image, zero-filling anything past its capacity.
fn read_from_parent(parent: &mut dyn BackingDisk, offset: u64, out: &mut [u8]) -> Result<()> {
    let cap = parent.capacity_bytes();
    if offset >= cap {
        out.fill(0);
        return Ok(());
    }
    let n = ((cap - offset).min(out.len() as u64)) as usize;
    parent.read_at(offset, &mut out[..n])?;
    out[n..].fill(0);
    Ok(())
}

/// A short read here means a table or grain offset points past the end of
/// its container: corrupt metadata, not an I/O failure.
fn read_exact_or<B: StorageBackend>(
    backend: &mut B,
    offset: u64,
    buf: &mut [u8],
    ctx: &'static str,
) -> Result<()> {
    match backend.read_at(offset, buf) {
        Ok(()) => Ok(()),
        Err(DiskError::OutOfBounds { .. }) => Err(DiskError::CorruptMetadata(ctx)),
        Err(e) => Err(e),
    }
}

fn sniff_sparse_magic<B: StorageBackend>(backend: &mut B) -> Result<bool> {
    if backend.len()? < 4 {
        return Ok(false);
    }
    let mut magic = [0u8; 4];
    backend.read_at(0, &mut magic)?;
    let magic = be_u32(&magic);
    Ok(magic == COWD_MAGIC || magic == KDMV_MAGIC)
}

fn load_directory<B: StorageBackend>(
    backend: &mut B,
    offset_sectors: u64,
    entries: u32,
) -> Result<Vec<u32>> {
    if entries as u64 > crate::extent::MAX_L1_ENTRIES {
        return Err(DiskError::ExtentTooLarge("grain directory length"));
    }
    let offset = offset_sectors
        .checked_mul(SECTOR)
        .ok_or(DiskError::CorruptMetadata("grain directory offset"))?;
    let mut raw = vec![0u8; entries as usize * 4];
    read_exact_or(backend, offset, &mut raw, "grain directory beyond end of file")?;
    Ok(raw.chunks_exact(4).map(le_u32).collect())
}

fn trim_region(region: &[u8]) -> &[u8] {
    let end = region.iter().position(|b| *b == 0).unwrap_or(region.len());
    &region[..end]
}

/// A freshly generated CID; never the "unknown" sentinel.
pub(crate) fn fresh_cid() -> u32 {
    loop {
        let cid = rand::random::<u32>();
        if cid != CID_UNKNOWN {
            return cid;
        }
    }
}
