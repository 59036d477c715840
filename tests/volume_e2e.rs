//! End-to-end tests against freshly formatted images.
//!
//! Small volumes live in memory; the large FAT32 case uses a sparse image
//! file in a temporary directory.
//!
//! Run with: cargo test --test volume_e2e

use std::sync::Arc;
use std::thread;

use rusty_fat::fs::{EntryKind, FatType};
use rusty_fat::{
    format_volume, BlockDevice, FatError, FatVolume, FileDevice, FormatOptions, MemoryDevice,
    MountOptions, Node, OpenFlags,
};

const CREATE_FILE: OpenFlags = OpenFlags::READ
    .union(OpenFlags::WRITE)
    .union(OpenFlags::CREATE)
    .union(OpenFlags::FILE);
const CREATE_DIR: OpenFlags = OpenFlags::READ
    .union(OpenFlags::WRITE)
    .union(OpenFlags::CREATE)
    .union(OpenFlags::DIRECTORY);

fn fresh(opts: FormatOptions, size: usize) -> Arc<MemoryDevice> {
    let dev = Arc::new(MemoryDevice::new(size));
    format_volume(dev.as_ref(), &opts).unwrap();
    dev
}

fn mount(dev: &Arc<MemoryDevice>) -> FatVolume {
    FatVolume::mount(dev.clone(), MountOptions::default()).unwrap()
}

fn write_file(vol: &FatVolume, dir: &Node, name: &str, data: &[u8]) {
    let f = vol.open(dir, name, CREATE_FILE).unwrap();
    assert_eq!(vol.write(&f, 0, data).unwrap(), data.len());
    vol.close(f).unwrap();
}

fn read_file(vol: &FatVolume, dir: &Node, path: &str) -> Vec<u8> {
    let f = vol.open(dir, path, OpenFlags::READ | OpenFlags::FILE).unwrap();
    let size = vol.node_info(&f).unwrap().size as usize;
    let mut buf = vec![0u8; size];
    assert_eq!(vol.read(&f, 0, &mut buf).unwrap(), size);
    vol.close(f).unwrap();
    buf
}

// ============================================================================
// Test Group A: geometry and the allocation table
// ============================================================================

#[test]
fn test_large_fat32_image_geometry() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("large.img");
    let dev: Arc<dyn BlockDevice> = Arc::new(FileDevice::create(&path, 1 << 30).unwrap());
    format_volume(dev.as_ref(), &FormatOptions::fat32(4)).unwrap();

    let vol = FatVolume::mount(dev.clone(), MountOptions::default()).unwrap();
    let stat = vol.stat().unwrap();
    assert_eq!(stat.fat_type, FatType::Fat32);
    assert_eq!(stat.cluster_size, 2048);
    assert_eq!(stat.free_clusters, stat.total_clusters - 1);

    let mirroring = vol.bootrecord().mirroring();
    assert!(mirroring.active);
    assert_eq!(mirroring.num_fats, 2);
    assert_eq!(mirroring.primary_fat_index, 0);

    let clusters = vol.clusters();
    let c1 = clusters.extend(0).unwrap();
    let c2 = clusters.extend(0).unwrap();
    assert_ne!(c1, c2);
    assert!(clusters.is_eof(clusters.entry(c1).unwrap()));
    assert!(clusters.is_eof(clusters.entry(c2).unwrap()));
    clusters.delete(c1).unwrap();
    clusters.delete(c2).unwrap();
    vol.unmount().unwrap();

    let reopened: Arc<dyn BlockDevice> = Arc::new(FileDevice::open(&path).unwrap());
    let vol = FatVolume::mount(reopened, MountOptions::read_only()).unwrap();
    assert_eq!(vol.stat().unwrap().free_clusters, stat.free_clusters);
}

#[test]
fn test_fat_copies_stay_identical() {
    let dev = fresh(FormatOptions::fat16(4), 16 << 20);
    let vol = mount(&dev);
    let root = vol.root().unwrap();
    for i in 0..20 {
        write_file(&vol, &root, &format!("f{i}.bin"), &vec![i as u8; 3000 + i * 100]);
    }
    vol.unlink(&root, "f3.bin").unwrap();
    vol.close(root).unwrap();

    let boot = vol.bootrecord();
    let fat_bytes = (boot.sectors_per_fat() * boot.sector_size()) as usize;
    let first = boot.cluster_location_fat(0, 0) as usize;
    let second = boot.cluster_location_fat(1, 0) as usize;
    vol.unmount().unwrap();
    let image = dev.snapshot();
    assert_eq!(image[first..first + fat_bytes], image[second..second + fat_bytes]);
    assert!(matches!(vol.stat(), Err(FatError::Unmounted)));
}

// ============================================================================
// Test Group B: persistence and mount state
// ============================================================================

#[test]
fn test_tree_survives_remount() {
    for (opts, size) in [(FormatOptions::fat16(4), 16 << 20), (FormatOptions::fat32(1), 8 << 20)] {
        let dev = fresh(opts, size);
        let vol = mount(&dev);
        let root = vol.root().unwrap();
        let docs = vol.open(&root, "docs", CREATE_DIR).unwrap();
        let deep = vol.open(&docs, "deep", CREATE_DIR).unwrap();
        write_file(&vol, &deep, "notes.txt", b"remember the milk");
        let big: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();
        write_file(&vol, &root, "big.dat", &big);
        for node in [deep, docs, root] {
            vol.close(node).unwrap();
        }
        vol.unmount().unwrap();

        let vol = mount(&dev);
        let root = vol.root().unwrap();
        assert_eq!(read_file(&vol, &root, "docs/deep/notes.txt"), b"remember the milk");
        assert_eq!(read_file(&vol, &root, "big.dat"), big);

        let mut names: Vec<(String, EntryKind)> = vol
            .read_dir(&root)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            names,
            vec![
                ("BIG.DAT".to_string(), EntryKind::File),
                ("DOCS".to_string(), EntryKind::Directory),
            ]
        );
        vol.close(root).unwrap();
        vol.unmount().unwrap();
    }
}

#[test]
fn test_dirty_volume_needs_force() {
    let dev = fresh(FormatOptions::fat32(1), 8 << 20);
    {
        let vol = mount(&dev);
        let root = vol.root().unwrap();
        write_file(&vol, &root, "crash.txt", b"lost shutdown");
        // Dropped without unmounting.
    }
    assert!(matches!(
        FatVolume::mount(dev.clone(), MountOptions::default()),
        Err(FatError::DirtyVolume)
    ));
    let forced = MountOptions {
        force: true,
        ..MountOptions::default()
    };
    let vol = FatVolume::mount(dev.clone(), forced).unwrap();
    // FSInfo was never updated; the free count comes from a rescan.
    let stat = vol.stat().unwrap();
    assert_eq!(stat.free_clusters, stat.total_clusters - 2);
    let root = vol.root().unwrap();
    assert_eq!(read_file(&vol, &root, "crash.txt"), b"lost shutdown");
    vol.close(root).unwrap();
    vol.unmount().unwrap();

    // A clean unmount clears the flag again.
    mount(&dev).unmount().unwrap();
}

#[test]
fn test_read_only_mount_rejects_mutation() {
    let dev = fresh(FormatOptions::fat16(4), 16 << 20);
    let vol = mount(&dev);
    let root = vol.root().unwrap();
    write_file(&vol, &root, "keep.txt", b"unchanged");
    vol.close(root).unwrap();
    vol.unmount().unwrap();

    let before = dev.snapshot();
    let vol = FatVolume::mount(dev.clone(), MountOptions::read_only()).unwrap();
    let root = vol.root().unwrap();
    let f = vol.open(&root, "keep.txt", OpenFlags::READ).unwrap();
    assert!(matches!(vol.write(&f, 0, b"x"), Err(FatError::ReadOnly)));
    assert!(matches!(vol.set_size(&f, 0), Err(FatError::ReadOnly)));
    assert!(matches!(vol.unlink(&root, "keep.txt"), Err(FatError::ReadOnly)));
    assert!(matches!(
        vol.rename(&root, "keep.txt", &root, "moved.txt"),
        Err(FatError::ReadOnly)
    ));
    assert!(matches!(
        vol.open(&root, "keep.txt", OpenFlags::READ | OpenFlags::WRITE),
        Err(FatError::ReadOnly)
    ));
    vol.close(f).unwrap();
    vol.close(root).unwrap();
    vol.unmount().unwrap();
    assert!(dev.snapshot() == before);
}

// ============================================================================
// Test Group C: namespace semantics
// ============================================================================

#[test]
fn test_rename_and_unlink_guards() {
    let dev = fresh(FormatOptions::fat32(1), 8 << 20);
    let vol = mount(&dev);
    let root = vol.root().unwrap();
    let a = vol.open(&root, "a", CREATE_DIR).unwrap();
    let b = vol.open(&a, "b", CREATE_DIR).unwrap();
    vol.close(b).unwrap();

    vol.rename(&root, "a", &root, "a2").unwrap();
    let b = vol.open(&root, "a2/b", OpenFlags::READ).unwrap();
    // Rejected operations must not touch the image.
    let image = dev.snapshot();
    assert!(matches!(vol.rename(&root, "a2", &b, "a3"), Err(FatError::InvalidArgs(_))));
    assert!(dev.snapshot() == image, "rejected rename modified the image");
    vol.close(b).unwrap();

    assert!(matches!(vol.unlink(&root, "a2"), Err(FatError::IsActive(_))));
    assert!(dev.snapshot() == image, "rejected unlink modified the image");
    vol.close(a).unwrap();
    assert!(matches!(vol.unlink(&root, "a2"), Err(FatError::NotEmpty(_))));
    assert!(dev.snapshot() == image, "rejected unlink modified the image");
    let a = vol.open(&root, "a2", OpenFlags::READ).unwrap();
    vol.unlink(&a, "b").unwrap();
    vol.close(a).unwrap();
    vol.unlink(&root, "a2").unwrap();
    assert!(vol.read_dir(&root).unwrap().is_empty());
    vol.close(root).unwrap();
    vol.unmount().unwrap();
}

#[test]
fn test_open_unlinked_file_keeps_data_until_close() {
    let dev = fresh(FormatOptions::fat16(4), 16 << 20);
    let vol = mount(&dev);
    let root = vol.root().unwrap();
    let free = vol.stat().unwrap().free_clusters;

    let f = vol.open(&root, "tmp.dat", CREATE_FILE).unwrap();
    vol.write(&f, 0, &[0x5A; 5000]).unwrap();
    vol.unlink(&root, "tmp.dat").unwrap();
    assert!(vol.read_dir(&root).unwrap().is_empty());

    // The name can be reused while the old file is still open.
    write_file(&vol, &root, "tmp.dat", b"replacement");

    vol.write(&f, 5000, &[0xA5; 100]).unwrap();
    let mut buf = vec![0u8; 5100];
    assert_eq!(vol.read(&f, 0, &mut buf).unwrap(), 5100);
    assert!(buf[..5000].iter().all(|&b| b == 0x5A));
    assert!(buf[5000..].iter().all(|&b| b == 0xA5));
    vol.close(f).unwrap();

    assert_eq!(read_file(&vol, &root, "tmp.dat"), b"replacement");
    assert_eq!(vol.stat().unwrap().free_clusters, free - 1);
    vol.close(root).unwrap();
    vol.unmount().unwrap();
}

#[test]
fn test_renamed_open_file_flushes_to_new_entry() {
    let dev = fresh(FormatOptions::fat32(1), 8 << 20);
    let vol = mount(&dev);
    let root = vol.root().unwrap();
    let inbox = vol.open(&root, "inbox", CREATE_DIR).unwrap();
    let archive = vol.open(&root, "archive", CREATE_DIR).unwrap();

    let f = vol.open(&inbox, "mail.txt", CREATE_FILE).unwrap();
    vol.write(&f, 0, b"first").unwrap();
    vol.rename(&inbox, "mail.txt", &archive, "old.txt").unwrap();
    vol.write(&f, 5, b" and second").unwrap();
    vol.close(f).unwrap();
    for node in [archive, inbox, root] {
        vol.close(node).unwrap();
    }
    vol.unmount().unwrap();

    let vol = mount(&dev);
    let root = vol.root().unwrap();
    assert_eq!(read_file(&vol, &root, "archive/old.txt"), b"first and second");
    assert!(matches!(
        vol.open(&root, "inbox/mail.txt", OpenFlags::READ),
        Err(FatError::NotFound(_))
    ));
    vol.close(root).unwrap();
}

// ============================================================================
// Test Group D: concurrency
// ============================================================================

#[test]
fn test_concurrent_opens_share_nodes() {
    let dev = fresh(FormatOptions::fat32(1), 8 << 20);
    let vol = Arc::new(mount(&dev));
    let root = vol.root().unwrap();
    let dir = vol.open(&root, "shared", CREATE_DIR).unwrap();
    write_file(&vol, &dir, "data.bin", &[1u8; 4096]);
    vol.close(dir).unwrap();
    vol.close(root).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let vol = vol.clone();
            thread::spawn(move || {
                let root = vol.root().unwrap();
                let dir = vol.open(&root, "shared", OpenFlags::READ).unwrap();
                let file = vol.open(&root, "shared/data.bin", OpenFlags::READ).unwrap();
                vol.close(root).unwrap();
                (dir, file)
            })
        })
        .collect();
    let opened: Vec<(Node, Node)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (dir, file) in &opened[1..] {
        assert!(dir.same_node(&opened[0].0));
        assert!(file.same_node(&opened[0].1));
    }
    for (dir, file) in opened {
        vol.close(file).unwrap();
        vol.close(dir).unwrap();
    }
    vol.unmount().unwrap();
}

#[test]
fn test_parallel_writers_to_separate_directories() {
    let dev = fresh(FormatOptions::fat16(4), 16 << 20);
    let vol = Arc::new(mount(&dev));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let vol = vol.clone();
            thread::spawn(move || {
                let root = vol.root().unwrap();
                let dir = vol.open(&root, &format!("w{t}"), CREATE_DIR).unwrap();
                for i in 0..16 {
                    let payload = vec![(t * 16 + i) as u8; 1000 + i * 300];
                    write_file(&vol, &dir, &format!("f{i}"), &payload);
                }
                vol.close(dir).unwrap();
                vol.close(root).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    vol.unmount().unwrap();

    let vol = mount(&dev);
    let root = vol.root().unwrap();
    for t in 0..4usize {
        for i in 0..16usize {
            let data = read_file(&vol, &root, &format!("w{t}/f{i}"));
            assert_eq!(data.len(), 1000 + i * 300);
            assert!(data.iter().all(|&b| b == (t * 16 + i) as u8));
        }
    }
    vol.close(root).unwrap();
}
