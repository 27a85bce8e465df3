//! Compressed-grain codec.
//!
//! Log-structured extents store each grain as a marker-framed deflate
//! stream: an 8-byte little-endian starting virtual sector, a 4-byte
//! little-endian payload length, then that many bytes of zlib data. A grain
//! always encodes a full cluster; readers must tolerate the frame spilling
//! past one cluster of container space.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::util::{le_u32, le_u64};
use crate::{DiskError, Result, StorageBackend, SECTOR_SIZE};

pub(crate) const GRAIN_MARKER_BYTES: usize = 12;

#[derive(Debug)]
pub(crate) struct DecodedGrain {
    /// Virtual starting sector recorded in the marker.
    pub lba: u64,
    /// Inflated cluster contents; may be shorter than a full cluster.
    pub data: Vec<u8>,
}

/// Reads and inflates the grain whose marker starts at `phys_offset`.
pub(crate) fn read_compressed_grain<B: StorageBackend>(
    backend: &mut B,
    phys_offset: u64,
    cluster_bytes: usize,
) -> Result<DecodedGrain> {
    // A compressed grain plus its marker can occupy more than one cluster of
    // container space, but never two.
    let window_max = cluster_bytes as u64 * 2;
    let file_len = backend.len()?;
    let available = file_len
        .checked_sub(phys_offset)
        .ok_or(DiskError::CorruptGrain("marker beyond end of file"))?;
    let window: usize = available
        .min(window_max)
        .try_into()
        .map_err(|_| DiskError::OffsetOverflow)?;
    if window < GRAIN_MARKER_BYTES {
        return Err(DiskError::CorruptGrain("truncated grain marker"));
    }

    let mut frame = vec![0u8; window];
    backend.read_at(phys_offset, &mut frame)?;

    let lba = le_u64(&frame[0..8]);
    let size = le_u32(&frame[8..12]) as usize;
    if size == 0 {
        return Err(DiskError::CorruptGrain("empty grain payload"));
    }
    if size > window - GRAIN_MARKER_BYTES {
        return Err(DiskError::CorruptGrain("grain size exceeds read window"));
    }

    let payload = &frame[GRAIN_MARKER_BYTES..GRAIN_MARKER_BYTES + size];
    let mut data = vec![0u8; cluster_bytes];
    let mut inflater = Decompress::new(true);
    match inflater.decompress(payload, &mut data, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => {}
        Ok(_) => return Err(DiskError::CorruptGrain("grain inflates past one cluster")),
        Err(_) => return Err(DiskError::CorruptGrain("deflate stream")),
    }
    data.truncate(inflater.total_out() as usize);

    Ok(DecodedGrain { lba, data })
}

/// Deflates one full cluster and appends it, marker-framed and padded to a
/// sector boundary, at `phys_offset`. Returns the number of container bytes
/// written.
pub(crate) fn write_compressed_grain<B: StorageBackend>(
    backend: &mut B,
    phys_offset: u64,
    lba: u64,
    cluster: &[u8],
) -> Result<u64> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(cluster)?;
    let payload = encoder.finish()?;

    let frame_len = GRAIN_MARKER_BYTES + payload.len();
    let padded = frame_len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;

    let mut frame = vec![0u8; padded];
    frame[0..8].copy_from_slice(&lba.to_le_bytes());
    frame[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    frame[GRAIN_MARKER_BYTES..frame_len].copy_from_slice(&payload);

    backend.write_at(phys_offset, &frame)?;
    Ok(padded as u64)
}
