//! Shared scaffolding for the integration tests: an in-memory backend with
//! shared storage (so images survive closing the disk that owns them, like
//! files do) and byte-level image builders.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use vmdk::{MemBackend, Result, StorageBackend};

pub const SECTOR: usize = 512;

#[derive(Clone, Default)]
pub struct SharedMem(Rc<RefCell<MemBackend>>);

impl SharedMem {
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.borrow().as_slice().to_vec()
    }
}

impl StorageBackend for SharedMem {
    fn len(&self) -> Result<u64> {
        self.0.borrow().len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.0.borrow_mut().set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.0.borrow_mut().read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.0.borrow_mut().write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.0.borrow_mut().flush()
    }
}

/// Named-file store backing `VmdkDisk::open_with` and `create_image`.
#[derive(Default)]
pub struct FileStore {
    files: HashMap<String, SharedMem>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: &str) -> SharedMem {
        let backend = SharedMem::default();
        self.files.insert(name.to_string(), backend.clone());
        backend
    }

    pub fn get(&self, name: &str) -> Option<SharedMem> {
        self.files.get(name).cloned()
    }

    pub fn opener(&self) -> impl FnMut(&str) -> Result<SharedMem> + '_ {
        move |name| {
            self.files
                .get(name)
                .cloned()
                .ok_or(vmdk::DiskError::Io(format!("no such extent file: {name}")))
        }
    }

    pub fn allocator(&mut self) -> impl FnMut(&str) -> Result<SharedMem> + '_ {
        move |name| Ok(self.create(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn write_le_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn write_le_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

pub fn read_le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

pub const FLAG_NL_DETECT: u32 = 1 << 0;
pub const FLAG_RGD: u32 = 1 << 1;
pub const FLAG_ZERO_GRAIN: u32 = 1 << 2;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_MARKER: u32 = 1 << 17;

/// Hand-assembled `KDMV` header sector, independent of the crate's own
/// encoder.
#[allow(clippy::too_many_arguments)]
pub fn kdmv_header(
    version: u32,
    flags: u32,
    capacity_sectors: u64,
    grain_sectors: u64,
    desc_offset: u64,
    desc_size: u64,
    gt_entries: u32,
    rgd_offset: u64,
    gd_offset: u64,
    grain_offset: u64,
    compress_algorithm: u16,
) -> [u8; SECTOR] {
    let mut raw = [0u8; SECTOR];
    raw[0..4].copy_from_slice(b"KDMV");
    write_le_u32(&mut raw, 4, version);
    write_le_u32(&mut raw, 8, flags);
    write_le_u64(&mut raw, 12, capacity_sectors);
    write_le_u64(&mut raw, 20, grain_sectors);
    write_le_u64(&mut raw, 28, desc_offset);
    write_le_u64(&mut raw, 36, desc_size);
    write_le_u32(&mut raw, 44, gt_entries);
    write_le_u64(&mut raw, 48, rgd_offset);
    write_le_u64(&mut raw, 56, gd_offset);
    write_le_u64(&mut raw, 64, grain_offset);
    raw[73] = b'\n';
    raw[74] = b' ';
    raw[75] = b'\r';
    raw[76] = b'\n';
    raw[77..79].copy_from_slice(&compress_algorithm.to_le_bytes());
    raw
}

/// Geometry of [`sparse_image`]: 1024 sectors capacity, 16-sector (8 KiB)
/// grains, 32-entry grain tables, so the image carries two grain tables per
/// directory.
pub const IMG_CAPACITY_SECTORS: u64 = 1024;
pub const IMG_GRAIN_SECTORS: u64 = 16;
pub const IMG_CLUSTER_BYTES: usize = IMG_GRAIN_SECTORS as usize * SECTOR;
pub const IMG_GT_ENTRIES: u32 = 32;
pub const IMG_RGD_SECTOR: u64 = 21;
pub const IMG_RGD_GT0: u64 = 22;
pub const IMG_GD_SECTOR: u64 = 24;
pub const IMG_GD_GT0: u64 = 25;
pub const IMG_GRAIN_OFFSET: u64 = 32;

pub const IMG_DESCRIPTOR: &str = "# Disk DescriptorFile\n\
version=1\n\
CID=fffffffe\n\
parentCID=ffffffff\n\
createType=\"monolithicSparse\"\n\
\n\
# Extent description\n\
RW 1024 SPARSE \"test.vmdk\"\n";

/// Builds the canonical small sparse image by hand: header, descriptor,
/// redundant directory at 21 with tables at 22/23, primary directory at 24
/// with tables at 25/26, grain data from sector 32.
pub fn sparse_image(extra_flags: u32) -> SharedMem {
    sparse_image_with_descriptor(extra_flags, IMG_DESCRIPTOR)
}

pub fn sparse_image_with_descriptor(extra_flags: u32, descriptor: &str) -> SharedMem {
    let version = if extra_flags & FLAG_ZERO_GRAIN != 0 { 2 } else { 1 };
    let compressed = extra_flags & FLAG_COMPRESSED != 0;
    let header = kdmv_header(
        version,
        FLAG_NL_DETECT | FLAG_RGD | extra_flags,
        IMG_CAPACITY_SECTORS,
        IMG_GRAIN_SECTORS,
        1,
        20,
        IMG_GT_ENTRIES,
        IMG_RGD_SECTOR,
        IMG_GD_SECTOR,
        IMG_GRAIN_OFFSET,
        if compressed { 1 } else { 0 },
    );

    let mut backend = SharedMem::default();
    backend
        .set_len(IMG_GRAIN_OFFSET * SECTOR as u64)
        .unwrap();
    backend.write_at(0, &header).unwrap();
    backend
        .write_at(SECTOR as u64, descriptor.as_bytes())
        .unwrap();

    // Both directories: two pre-allocated, zero-filled tables each.
    let mut rgd = [0u8; 8];
    write_le_u32(&mut rgd, 0, IMG_RGD_GT0 as u32);
    write_le_u32(&mut rgd, 4, IMG_RGD_GT0 as u32 + 1);
    backend
        .write_at(IMG_RGD_SECTOR * SECTOR as u64, &rgd)
        .unwrap();

    let mut gd = [0u8; 8];
    write_le_u32(&mut gd, 0, IMG_GD_GT0 as u32);
    write_le_u32(&mut gd, 4, IMG_GD_GT0 as u32 + 1);
    backend
        .write_at(IMG_GD_SECTOR * SECTOR as u64, &gd)
        .unwrap();

    backend
}

/// Grain-table entry for virtual `sector`, read straight from the container.
pub fn gt_entry(backend: &SharedMem, gt_sector: u64, sector: u64) -> u32 {
    let index = (sector / IMG_GRAIN_SECTORS) % IMG_GT_ENTRIES as u64;
    let bytes = backend.snapshot();
    read_le_u32(&bytes, gt_sector as usize * SECTOR + index as usize * 4)
}
