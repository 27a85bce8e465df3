//! VMDK-family virtual disks: extent composition and grain address
//! translation.
//!
//! A disk presents one linear block address space backed by one or more
//! container files (flat pre-allocated regions, sparse two-level indexed
//! containers, or log-structured deflate-compressed containers), optionally
//! chained onto a read-only parent disk for copy-on-write snapshots. This
//! crate provides:
//!
//! - [`VmdkDisk`]: the engine: open, translate, allocate-on-write, CID
//!   chain validation
//! - [`StorageBackend`]: positional I/O over one container file, with
//!   [`MemBackend`] and [`StdFileBackend`] implementations
//! - [`VirtualDisk`]: byte-addressed disk interface with sector helpers
//! - [`create_image`] / [`plan_layout`]: creation-time layout planning and
//!   metadata writing
//! - [`probe`]: conservative format signature check
//!
//! Scheduling, format dispatch above [`probe`], and image-management
//! tooling live with the caller.

mod backend;
mod cache;
mod codec;
mod create;
mod descriptor;
mod disk;
mod error;
mod extent;
mod header;
mod util;
mod vmdk;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use cache::GrainTableCacheStats;
pub use create::{
    create_image, plan_layout, write_flat_extent, write_sparse_extent, CreateOptions, LayoutPlan,
    ParentLink, DEFAULT_GRAIN_SECTORS, DEFAULT_GT_ENTRIES,
};
pub use descriptor::{
    generate_descriptor, parse_extent_line, read_cid, write_cid, CreateType, Descriptor,
    ExtentLine, ExtentLineKind, CID_UNKNOWN, DESC_REGION_BYTES, DESC_REGION_SECTORS,
};
pub use disk::{BackingDisk, VirtualDisk, SECTOR_SIZE};
pub use error::{DiskError, Result};
pub use header::{probe, read_sparse_header, SparseHeader, SparseVariant};
pub use vmdk::{ExtentInfo, VmdkDisk};

#[cfg(test)]
mod proptests;
