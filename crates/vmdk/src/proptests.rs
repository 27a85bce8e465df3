use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use proptest::prelude::*;

use crate::{
    generate_descriptor, write_sparse_extent, CreateType, ExtentLine, ExtentLineKind, MemBackend,
    Result, StorageBackend, VirtualDisk, VmdkDisk, CID_UNKNOWN, SECTOR_SIZE,
};

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;
const MAX_DISK_SIZE: u32 = 512 * 1024; // 512 KiB
const MAX_DISK_SECTORS: u32 = MAX_DISK_SIZE / SECTOR_SIZE_U32;
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 8 * 1024;

/// `MemBackend` with shared storage, so an image survives closing the disk
/// that owns its backend (the moral equivalent of a file on disk).
#[derive(Clone, Default)]
struct SharedMem(Rc<RefCell<MemBackend>>);

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

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    ZeroClusters { cluster: u32, count: u32 },
    Flush,
    Reopen,
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    disk_size: u32,
    grain_sectors: u64,
    gt_entries: u32,
    zeroed_grain: bool,
}

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

fn geometry_strategy() -> impl Strategy<Value = Geometry> {
    (
        disk_size_strategy(),
        // Small grains and short tables force multi-table images and cache
        // churn even at these disk sizes.
        prop_oneof![Just(1u64), Just(2), Just(8), Just(128)],
        prop_oneof![Just(4u32), Just(16), Just(512)],
        any::<bool>(),
    )
        .prop_map(|(disk_size, grain_sectors, gt_entries, zeroed_grain)| Geometry {
            disk_size,
            grain_sectors,
            gt_entries,
            zeroed_grain,
        })
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let max_offset = disk_size;
    let any_offset = 0u32..=max_offset;
    let sector_aligned =
        (0u32..=max_offset / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let near_end = (0u32..=SECTOR_SIZE_U32).prop_map(move |d| max_offset.saturating_sub(d));

    prop_oneof![
        4 => any_offset,
        3 => sector_aligned,
        1 => near_end,
    ]
    .boxed()
}

fn write_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data })
        .boxed()
}

fn read_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len })
        .boxed()
}

fn ops_strategy(geom: Geometry) -> BoxedStrategy<Vec<Op>> {
    let cluster_bytes = geom.grain_sectors as u32 * SECTOR_SIZE_U32;
    let whole_clusters = geom.disk_size / cluster_bytes;
    let zero_op = if whole_clusters > 0 {
        (0..whole_clusters)
            .prop_flat_map(move |cluster| {
                (Just(cluster), 1..=(whole_clusters - cluster).min(4))
            })
            .prop_map(|(cluster, count)| Op::ZeroClusters { cluster, count })
            .boxed()
    } else {
        Just(Op::Flush).boxed()
    };

    prop::collection::vec(
        prop_oneof![
            5 => write_op_strategy(geom.disk_size),
            4 => read_op_strategy(geom.disk_size),
            1 => zero_op,
            1 => Just(Op::Flush),
            1 => Just(Op::Reopen),
        ],
        1..=MAX_OPS,
    )
    .boxed()
}

fn make_sparse_image(geom: Geometry) -> SharedMem {
    let capacity_sectors = (geom.disk_size / SECTOR_SIZE_U32) as u64;
    let extents = vec![ExtentLine {
        sectors: capacity_sectors,
        kind: ExtentLineKind::Sparse,
        file_name: "disk.vmdk".to_string(),
    }];
    let text = generate_descriptor(
        CreateType::MonolithicSparse,
        0xdeadbeef,
        CID_UNKNOWN,
        None,
        capacity_sectors,
        "ide",
        &extents,
    );
    let mut backend = SharedMem::default();
    write_sparse_extent(
        &mut backend,
        capacity_sectors,
        geom.grain_sectors,
        geom.gt_entries,
        false,
        geom.zeroed_grain,
        Some(&text),
    )
    .unwrap();
    backend
}

fn run_ops(geom: Geometry, storage: SharedMem, model: &mut [u8], ops: &[Op]) {
    let cluster_bytes = geom.grain_sectors * SECTOR_SIZE as u64;
    let mut disk = VmdkDisk::open(storage.clone()).unwrap();

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                disk.write_at(*offset as u64, data).unwrap();
                model[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
            }
            Op::Read { offset, len } => {
                let mut got = vec![0u8; *len];
                disk.read_at(*offset as u64, &mut got).unwrap();
                assert_eq!(
                    got.as_slice(),
                    &model[*offset as usize..*offset as usize + *len],
                    "read mismatch at offset {offset} len {len}"
                );
            }
            Op::ZeroClusters { cluster, count } => {
                let offset = *cluster as u64 * cluster_bytes;
                let len = *count as u64 * cluster_bytes;
                // The dry run must agree with the mutating call.
                let dry = disk.write_zeroes(offset, len, true);
                let wet = disk.write_zeroes(offset, len, false);
                assert_eq!(dry.is_ok(), wet.is_ok());
                if wet.is_ok() {
                    model[offset as usize..(offset + len) as usize].fill(0);
                } else {
                    assert!(!geom.zeroed_grain);
                }
            }
            Op::Flush => disk.flush().unwrap(),
            Op::Reopen => {
                drop(disk);
                disk = VmdkDisk::open(storage.clone()).unwrap();
            }
        }
    }

    // Closing scan: every byte equals the model.
    let mut all = vec![0u8; model.len()];
    disk.read_at(0, &mut all).unwrap();
    assert_eq!(all.as_slice(), model);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sparse_disk_matches_reference_model(
        (geom, ops) in geometry_strategy().prop_flat_map(|g| (Just(g), ops_strategy(g)))
    ) {
        let storage = make_sparse_image(geom);
        let mut model = vec![0u8; geom.disk_size as usize];
        run_ops(geom, storage, &mut model, &ops);
    }

    #[test]
    fn cow_child_matches_reference_model(
        (geom, ops) in geometry_strategy().prop_flat_map(|g| (Just(g), ops_strategy(g))),
        seed in any::<u64>(),
    ) {
        // Fill a parent with a deterministic pattern, then run the ops
        // against a child chained onto it.
        let parent_storage = make_sparse_image(geom);
        let mut pattern = vec![0u8; geom.disk_size as usize];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (seed as usize)
                .wrapping_mul(31)
                .wrapping_add(i)
                .wrapping_mul(167) as u8;
        }
        {
            let mut parent = VmdkDisk::open(parent_storage.clone()).unwrap();
            parent.write_at(0, &pattern).unwrap();
        }
        let mut parent = VmdkDisk::open(parent_storage).unwrap();
        let parent_cid = {
            use crate::BackingDisk;
            parent.current_cid().unwrap()
        };

        let child_storage = {
            let capacity_sectors = (geom.disk_size / SECTOR_SIZE_U32) as u64;
            let extents = vec![ExtentLine {
                sectors: capacity_sectors,
                kind: ExtentLineKind::Sparse,
                file_name: "child.vmdk".to_string(),
            }];
            let text = generate_descriptor(
                CreateType::MonolithicSparse,
                0x1,
                parent_cid,
                Some("parent.vmdk"),
                capacity_sectors,
                "ide",
                &extents,
            );
            let mut backend = SharedMem::default();
            write_sparse_extent(
                &mut backend,
                capacity_sectors,
                geom.grain_sectors,
                geom.gt_entries,
                false,
                geom.zeroed_grain,
                Some(&text),
            )
            .unwrap();
            backend
        };

        let mut disk = VmdkDisk::open(child_storage.clone()).unwrap();
        disk.attach_parent(Box::new(parent));

        // The model starts as the parent's content.
        let mut model = pattern;
        let cluster_bytes = geom.grain_sectors * SECTOR_SIZE as u64;
        for op in &ops {
            match op {
                Op::Write { offset, data } => {
                    disk.write_at(*offset as u64, data).unwrap();
                    model[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
                }
                Op::Read { offset, len } => {
                    let mut got = vec![0u8; *len];
                    disk.read_at(*offset as u64, &mut got).unwrap();
                    prop_assert_eq!(
                        got.as_slice(),
                        &model[*offset as usize..*offset as usize + *len]
                    );
                }
                Op::ZeroClusters { cluster, count } => {
                    let offset = *cluster as u64 * cluster_bytes;
                    let len = *count as u64 * cluster_bytes;
                    if disk.write_zeroes(offset, len, false).is_ok() {
                        model[offset as usize..(offset + len) as usize].fill(0);
                    }
                }
                Op::Flush => disk.flush().unwrap(),
                // Reopening would drop the attached parent; the plain sparse
                // scenario covers reopen cycles.
                Op::Reopen => {}
            }
        }

        let mut all = vec![0u8; model.len()];
        disk.read_at(0, &mut all).unwrap();
        prop_assert_eq!(all, model);
    }
}

#[test]
fn shared_mem_survives_disk_drop() {
    let storage = SharedMem::default();
    let mut a = storage.clone();
    a.write_at(0, b"persistent").unwrap();
    drop(a);
    let mut b = storage;
    let mut buf = [0u8; 10];
    b.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"persistent");
}

// Keep the descriptor-file open path honest under the same shared-storage
// trick used by the integration tests.
#[test]
fn descriptor_file_open_resolves_extents_by_name() {
    let capacity = 2048u64;
    let mut files: HashMap<String, SharedMem> = HashMap::new();

    let mut data = SharedMem::default();
    crate::write_flat_extent(&mut data, capacity).unwrap();
    files.insert("disk-flat.vmdk".to_string(), data);

    let extents = vec![ExtentLine {
        sectors: capacity,
        kind: ExtentLineKind::Flat { offset_sectors: 0 },
        file_name: "disk-flat.vmdk".to_string(),
    }];
    let text = generate_descriptor(
        CreateType::MonolithicFlat,
        0xabc,
        CID_UNKNOWN,
        None,
        capacity,
        "ide",
        &extents,
    );
    let mut desc = SharedMem::default();
    desc.write_at(0, text.as_bytes()).unwrap();

    let mut disk = VmdkDisk::open_with(desc, |name| {
        files
            .get(name)
            .cloned()
            .ok_or(crate::DiskError::Io(format!("no such extent file: {name}")))
    })
    .unwrap();

    assert_eq!(disk.capacity_bytes(), capacity * SECTOR_SIZE as u64);
    disk.write_at(100, b"flat bytes").unwrap();
    let mut got = [0u8; 10];
    disk.read_at(100, &mut got).unwrap();
    assert_eq!(&got, b"flat bytes");
}
