//! Sparse container headers.
//!
//! Two on-disk variants exist: the older `COWD` header (fixed 4096-entry
//! grain tables, 32-bit geometry) and the newer `KDMV` header (64-bit
//! geometry, feature flags, optional redundant grain directory, optional
//! footer at end-of-file for stream-written images). Both are decoded
//! field-by-field into one normalized [`SparseHeader`]; byte buffers are
//! never reinterpreted in place.

use crate::util::{be_u32, le_u16, le_u32, le_u64};
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

pub const COWD_MAGIC: u32 = 0x434F_5744;
pub const KDMV_MAGIC: u32 = 0x4B44_4D56;

/// `gd_offset` value redirecting to the footer copy of the header.
const GD_AT_END: u64 = u64::MAX;

const KDMV_FLAG_NL_DETECT: u32 = 1 << 0;
const KDMV_FLAG_RGD: u32 = 1 << 1;
const KDMV_FLAG_ZERO_GRAIN: u32 = 1 << 2;
const KDMV_FLAG_COMPRESSED: u32 = 1 << 16;
const KDMV_FLAG_MARKER: u32 = 1 << 17;

const COMPRESSION_DEFLATE: u16 = 1;

/// Grain-table length of every `COWD` container.
const COWD_GT_ENTRIES: u32 = 4096;

/// Upper bound on `KDMV` grain-table length.
pub const MAX_GT_ENTRIES: u32 = 512;

const MARKER_END_OF_STREAM: u32 = 0;
const MARKER_FOOTER: u32 = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SparseVariant {
    Cowd,
    Kdmv,
}

/// Normalized sparse-extent header. Offsets and sizes are in sectors.
#[derive(Clone, Debug)]
pub struct SparseHeader {
    pub variant: SparseVariant,
    pub version: u32,
    pub capacity_sectors: u64,
    pub grain_sectors: u64,
    /// Embedded descriptor region; zero `desc_size` means none.
    pub desc_offset: u64,
    pub desc_size: u64,
    pub gt_entries: u32,
    /// Redundant (mirrored) grain directory, when present.
    pub rgd_offset: Option<u64>,
    pub gd_offset: u64,
    /// First grain-data sector (`KDMV` only; informational).
    pub grain_offset: u64,
    /// Grain-directory length in entries.
    pub l1_size: u32,
    pub compressed: bool,
    pub has_marker: bool,
    pub zeroed_grain: bool,
}

impl SparseHeader {
    /// Number of virtual sectors spanned by one grain table.
    pub fn gt_coverage_sectors(&self) -> u64 {
        self.grain_sectors * self.gt_entries as u64
    }

    /// Encodes a `KDMV` header sector for a newly created extent.
    pub(crate) fn encode_kdmv(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[0..4].copy_from_slice(b"KDMV");
        raw[4..8].copy_from_slice(&self.version.to_le_bytes());

        let mut flags = KDMV_FLAG_NL_DETECT;
        if self.rgd_offset.is_some() {
            flags |= KDMV_FLAG_RGD;
        }
        if self.zeroed_grain {
            flags |= KDMV_FLAG_ZERO_GRAIN;
        }
        if self.compressed {
            flags |= KDMV_FLAG_COMPRESSED;
        }
        if self.has_marker {
            flags |= KDMV_FLAG_MARKER;
        }
        raw[8..12].copy_from_slice(&flags.to_le_bytes());

        raw[12..20].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        raw[20..28].copy_from_slice(&self.grain_sectors.to_le_bytes());
        raw[28..36].copy_from_slice(&self.desc_offset.to_le_bytes());
        raw[36..44].copy_from_slice(&self.desc_size.to_le_bytes());
        raw[44..48].copy_from_slice(&self.gt_entries.to_le_bytes());
        raw[48..56].copy_from_slice(&self.rgd_offset.unwrap_or(0).to_le_bytes());
        raw[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        raw[64..72].copy_from_slice(&self.grain_offset.to_le_bytes());
        // Check bytes guard against line-ending conversion by non-binary
        // transfer tools.
        raw[73] = b'\n';
        raw[74] = b' ';
        raw[75] = b'\r';
        raw[76] = b'\n';
        let algorithm: u16 = if self.compressed { COMPRESSION_DEFLATE } else { 0 };
        raw[77..79].copy_from_slice(&algorithm.to_le_bytes());
        raw
    }
}

/// Reads and validates the sparse header of `backend`, following the footer
/// redirection for stream-written images.
pub fn read_sparse_header<B: StorageBackend>(backend: &mut B) -> Result<SparseHeader> {
    let mut sector = [0u8; SECTOR_SIZE];
    if backend.len()? < SECTOR_SIZE as u64 {
        return Err(DiskError::MalformedHeader("file too small for a header"));
    }
    backend.read_at(0, &mut sector)?;

    match be_u32(&sector[0..4]) {
        COWD_MAGIC => parse_cowd(&sector),
        KDMV_MAGIC => {
            let header = parse_kdmv(&sector)?;
            if header.gd_offset == GD_AT_END {
                read_footer_header(backend)
            } else {
                Ok(header)
            }
        }
        _ => Err(DiskError::MalformedHeader("unrecognized magic")),
    }
}

fn parse_cowd(raw: &[u8; SECTOR_SIZE]) -> Result<SparseHeader> {
    let version = le_u32(&raw[4..8]);
    if version != 1 {
        return Err(DiskError::Unsupported("COWD header version"));
    }
    let disk_sectors = le_u32(&raw[12..16]) as u64;
    let granularity = le_u32(&raw[16..20]) as u64;
    let l1dir_offset = le_u32(&raw[20..24]) as u64;
    let l1dir_size = le_u32(&raw[24..28]);

    if granularity == 0 {
        return Err(DiskError::MalformedHeader("zero granularity"));
    }

    Ok(SparseHeader {
        variant: SparseVariant::Cowd,
        version,
        capacity_sectors: disk_sectors,
        grain_sectors: granularity,
        desc_offset: 0,
        desc_size: 0,
        gt_entries: COWD_GT_ENTRIES,
        rgd_offset: None,
        gd_offset: l1dir_offset,
        grain_offset: 0,
        l1_size: l1dir_size,
        compressed: false,
        has_marker: false,
        zeroed_grain: false,
    })
}

fn parse_kdmv(raw: &[u8; SECTOR_SIZE]) -> Result<SparseHeader> {
    let version = le_u32(&raw[4..8]);
    if version == 0 {
        return Err(DiskError::MalformedHeader("zero header version"));
    }
    if version >= 3 {
        return Err(DiskError::Unsupported("KDMV header version"));
    }

    let flags = le_u32(&raw[8..12]);
    if flags & KDMV_FLAG_NL_DETECT != 0
        && (raw[73] != b'\n' || raw[74] != b' ' || raw[75] != b'\r' || raw[76] != b'\n')
    {
        return Err(DiskError::MalformedHeader(
            "image damaged by line-ending conversion",
        ));
    }

    let capacity_sectors = le_u64(&raw[12..20]);
    let grain_sectors = le_u64(&raw[20..28]);
    let desc_offset = le_u64(&raw[28..36]);
    let desc_size = le_u64(&raw[36..44]);
    let gt_entries = le_u32(&raw[44..48]);
    let rgd_offset = le_u64(&raw[48..56]);
    let gd_offset = le_u64(&raw[56..64]);
    let grain_offset = le_u64(&raw[64..72]);
    let compress_algorithm = le_u16(&raw[77..79]);

    if grain_sectors == 0 {
        return Err(DiskError::MalformedHeader("zero granularity"));
    }
    if gt_entries == 0 || gt_entries > MAX_GT_ENTRIES {
        return Err(DiskError::Unsupported("grain table length"));
    }

    let compressed = flags & KDMV_FLAG_COMPRESSED != 0;
    if compressed && compress_algorithm != COMPRESSION_DEFLATE {
        return Err(DiskError::Unsupported("compression algorithm"));
    }

    let gt_coverage = grain_sectors * gt_entries as u64;
    let l1_size = capacity_sectors
        .div_ceil(gt_coverage)
        .try_into()
        .map_err(|_| DiskError::MalformedHeader("grain directory length"))?;

    Ok(SparseHeader {
        variant: SparseVariant::Kdmv,
        version,
        capacity_sectors,
        grain_sectors,
        desc_offset,
        desc_size,
        gt_entries,
        rgd_offset: (flags & KDMV_FLAG_RGD != 0).then_some(rgd_offset),
        gd_offset,
        grain_offset,
        l1_size,
        compressed,
        has_marker: flags & KDMV_FLAG_MARKER != 0,
        zeroed_grain: flags & KDMV_FLAG_ZERO_GRAIN != 0,
    })
}

/// Stream-written images park the authoritative header in a footer: a marker
/// sector, the header sector, then an end-of-stream marker sector.
fn read_footer_header<B: StorageBackend>(backend: &mut B) -> Result<SparseHeader> {
    const FOOTER_BYTES: u64 = 3 * SECTOR_SIZE as u64;

    let len = backend.len()?;
    if len < FOOTER_BYTES {
        return Err(DiskError::MalformedHeader("file too small for a footer"));
    }

    let mut footer = [0u8; 3 * SECTOR_SIZE];
    backend.read_at(len - FOOTER_BYTES, &mut footer)?;

    validate_marker(&footer[..SECTOR_SIZE], MARKER_FOOTER, "footer marker")?;
    validate_marker(
        &footer[2 * SECTOR_SIZE..],
        MARKER_END_OF_STREAM,
        "end-of-stream marker",
    )?;

    let mut header_sector = [0u8; SECTOR_SIZE];
    header_sector.copy_from_slice(&footer[SECTOR_SIZE..2 * SECTOR_SIZE]);
    if be_u32(&header_sector[0..4]) != KDMV_MAGIC {
        return Err(DiskError::MalformedHeader("footer header magic"));
    }

    let header = parse_kdmv(&header_sector)?;
    if header.gd_offset == GD_AT_END {
        return Err(DiskError::MalformedHeader(
            "footer header lacks a grain directory",
        ));
    }
    Ok(header)
}

fn validate_marker(sector: &[u8], expected_type: u32, what: &'static str) -> Result<()> {
    let val = le_u64(&sector[0..8]);
    let size = le_u32(&sector[8..12]);
    let marker_type = le_u32(&sector[12..16]);
    if val != 0 || size != 0 || marker_type != expected_type {
        return Err(DiskError::MalformedHeader(what));
    }
    Ok(())
}

/// Recognizes either sparse magic, or descriptor text whose first effective
/// line is a supported `version=` key. Conservative: anything else is not
/// ours.
pub fn probe(buf: &[u8]) -> bool {
    if buf.len() >= 4 {
        let magic = be_u32(&buf[0..4]);
        if magic == COWD_MAGIC || magic == KDMV_MAGIC {
            return true;
        }
    }

    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let text = String::from_utf8_lossy(&buf[..end]);
    for line in text.lines() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        return line.starts_with("version=1") || line.starts_with("version=2");
    }
    false
}
