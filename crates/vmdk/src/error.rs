use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for the disk engine.
///
/// Metadata errors carry a `&'static str` context describing which structure
/// failed validation. Opening a disk fails closed on any of them; per-call I/O
/// errors fail that single call with no partial-success signalling.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("write beyond disk capacity: sector={sector} total={total_sectors}")]
    CapacityExceeded { sector: u64, total_sectors: u64 },

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(&'static str),

    /// A descriptor rewrite found the region in a state a well-formed
    /// descriptor can never be in (e.g. no `parentCID` line).
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("malformed sparse header: {0}")]
    MalformedHeader(&'static str),

    #[error("unsupported image feature: {0}")]
    Unsupported(&'static str),

    #[error("extent metadata implies an absurd allocation: {0}")]
    ExtentTooLarge(&'static str),

    #[error("corrupt image metadata: {0}")]
    CorruptMetadata(&'static str),

    #[error("corrupt compressed grain: {0}")]
    CorruptGrain(&'static str),

    #[error("cluster in a compressed extent is already allocated")]
    WriteOnceViolation,

    #[error("backing image has changed: live cid {actual:#010x}, recorded parent cid {expected:#010x}")]
    ChainInconsistent { expected: u32, actual: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Generic failure from the underlying storage service.
    #[error("extent i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
