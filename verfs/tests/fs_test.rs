use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;
use verfs::io::{BlockNumber, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use verfs::{
    Clock, FormatOptions, ManualClock, MountOptions, NodeOps, VerFS, VerFSError, VersionPolicy,
    BLOCK_SIZE,
};

fn emulator(blocks: usize) -> FileBlockEmulator {
    FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
        .with_block_count(blocks)
        .build()
        .expect("Could not initialize disk emulator.")
}

fn clocked(dev: FileBlockEmulator, secs: u32) -> (VerFS<FileBlockEmulator>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(secs));
    let mount = MountOptions::default().with_clock(clock.clone());
    let fs = VerFS::format(dev, &FormatOptions::default(), mount).unwrap();
    (fs, clock)
}

#[test]
fn can_initialize_disk_with_filesystem() {
    let tf = NamedTempFile::new().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
        .with_block_count(64)
        .build()
        .unwrap();
    drop(VerFS::create(dev).unwrap());

    let fs = VerFS::open(FileBlockEmulator::open(tf.path()).unwrap()).unwrap();
    let root = fs.root().unwrap();
    assert_eq!(root.entries().unwrap().len(), 2);
    fs.check().unwrap();
}

#[test]
fn unformatted_blocks_are_rejected() {
    let dev = emulator(64);
    match VerFS::open(dev) {
        Err(VerFSError::InvalidSuperblock(_)) => (),
        Err(e) => panic!("unexpected error {:?}", e),
        Ok(_) => panic!("mounted an unformatted device"),
    }
}

#[test]
fn old_block_content_is_retrievable_after_overwrite() {
    let (fs, clock) = clocked(emulator(256), 5_000);
    let file = fs.create_file("/a.txt").unwrap();
    file.set_versioning(VersionPolicy::KeepAll).unwrap();

    let x = vec![b'X'; BLOCK_SIZE];
    let y = vec![b'Y'; BLOCK_SIZE];
    file.write(0, &x).unwrap();
    let t2 = clock.advance(1);
    file.write(0, &y).unwrap();
    clock.advance(1);

    assert_eq!(file.retrieve(0, t2).unwrap(), x);
    assert_eq!(file.retrieve(0, clock.now()).unwrap(), y);
    assert_eq!(file.versions().unwrap().len(), 1);
}

#[test]
fn version_history_survives_remount() {
    let tf = NamedTempFile::new().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
        .with_block_count(256)
        .build()
        .unwrap();
    let (fs, clock) = clocked(dev, 7_000);
    {
        let file = fs.create_file("/log").unwrap();
        file.write(0, b"before").unwrap();
        file.set_versioning(VersionPolicy::KeepSafeVersions(4)).unwrap();
        clock.advance(1);
        file.write(0, b"after!").unwrap();
    }
    drop(fs);

    let fs = VerFS::open(FileBlockEmulator::open(tf.path()).unwrap()).unwrap();
    let file = fs.lookup_path("/log").unwrap().into_file().unwrap();
    assert_eq!(file.versioning().unwrap(), Some(VersionPolicy::KeepSafeVersions(4)));
    assert_eq!(file.read_all().unwrap(), b"after!");
    assert_eq!(file.read_at(7_000).unwrap(), b"before");
    let versions = file.versions().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].timestamp, 7_001);
    fs.check().unwrap();
}

#[test]
fn nested_paths_resolve_and_remove() {
    let fs = VerFS::create(emulator(256)).unwrap();
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    fs.create_file("/a/b/c.txt").unwrap().write(0, b"deep").unwrap();

    let node = fs.lookup_path("/a/./b/../b/c.txt").unwrap();
    assert!(!node.is_dir());
    assert_eq!(node.into_file().unwrap().read_all().unwrap(), b"deep");

    assert!(matches!(fs.remove("/a/b"), Err(VerFSError::DirectoryNotEmpty)));
    assert!(matches!(fs.create_file("/a/b/c.txt"), Err(VerFSError::AlreadyExists)));
    assert!(matches!(fs.lookup_path("a/b"), Err(VerFSError::InvalidArgument(_))));
    assert!(matches!(fs.create_file("/a/b/c.txt/d"), Err(VerFSError::NotADirectory)));

    fs.remove("/a/b/c.txt").unwrap();
    fs.remove("/a/b").unwrap();
    fs.remove("/a").unwrap();
    assert_eq!(fs.root().unwrap().entries().unwrap().len(), 2);
    fs.check().unwrap();
}

#[test]
fn counters_match_bitmaps_after_mixed_workload() {
    let (fs, clock) = clocked(emulator(512), 100);
    let before = fs.stats();
    let root = fs.root().unwrap();
    root.set_versioning(VersionPolicy::KeepSafeTime(3)).unwrap();

    for i in 0..8u32 {
        let file = root.create_file(&format!("f{}", i)).unwrap();
        file.write(0, &vec![i as u8; 3 * BLOCK_SIZE + 7]).unwrap();
        file.set_versioning(VersionPolicy::KeepSafeVersions(2)).unwrap();
    }
    for round in 0..5u8 {
        clock.advance(1);
        for i in 0..8u32 {
            let file = root.open(&format!("f{}", i)).unwrap().into_file().unwrap();
            file.write(BLOCK_SIZE as u32, &[round; 16]).unwrap();
        }
    }
    for i in 0..8u32 {
        let file = root.open(&format!("f{}", i)).unwrap();
        assert_eq!(file.prune().unwrap(), 3);
        assert_eq!(file.versions().unwrap().len(), 2);
    }
    fs.check().unwrap();

    for i in 0..8u32 {
        root.remove(&format!("f{}", i)).unwrap();
    }
    fs.check().unwrap();
    let after = fs.stats();
    assert_eq!(after.free_inodes, before.free_inodes);
    assert!(after.free_blocks < before.free_blocks);
}

#[test]
fn concurrent_writers_keep_allocation_consistent() {
    let fs = VerFS::create(emulator(1024)).unwrap();
    std::thread::scope(|s| {
        for t in 0..4u8 {
            let fs = &fs;
            s.spawn(move || {
                let file = fs.create_file(format!("/w{}", t)).unwrap();
                for block in 0..8u32 {
                    file.write(block * BLOCK_SIZE as u32, &[t; BLOCK_SIZE]).unwrap();
                }
            });
        }
    });

    for t in 0..4u8 {
        let file = fs.lookup_path(format!("/w{}", t)).unwrap().into_file().unwrap();
        assert_eq!(file.read_all().unwrap(), vec![t; 8 * BLOCK_SIZE]);
    }
    fs.check().unwrap();
}

/// Passes through to a file emulator until told to fail.
struct FlakyDisk {
    inner: FileBlockEmulator,
    fail: Arc<AtomicBool>,
}

impl FlakyDisk {
    fn check(&self) -> std::io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected failure"));
        }
        Ok(())
    }
}

impl BlockStorage for FlakyDisk {
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize) -> std::io::Result<Self> {
        Ok(FlakyDisk {
            inner: FileBlockEmulator::open_disk(path, nblocks)?,
            fail: Arc::new(AtomicBool::new(false)),
        })
    }

    fn block_count(&self) -> usize {
        self.inner.block_count()
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check()?;
        self.inner.read_block(blocknr, buf)
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check()?;
        self.inner.write_block(blocknr, buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.check()?;
        self.inner.sync_disk()
    }
}

#[test]
fn device_errors_surface_as_io() {
    let fail = Arc::new(AtomicBool::new(false));
    let disk = FlakyDisk {
        inner: emulator(128),
        fail: fail.clone(),
    };
    let fs = VerFS::create(disk).unwrap();
    fs.create_file("/pending").unwrap().write(0, b"data").unwrap();

    fail.store(true, Ordering::SeqCst);
    assert!(matches!(fs.sync(), Err(VerFSError::Io(_))));

    fail.store(false, Ordering::SeqCst);
    assert!(fs.sync().unwrap() > 0);
    fs.check().unwrap();
}

#[test]
fn mount_fails_when_the_device_cannot_be_read() {
    let disk = FlakyDisk {
        inner: emulator(64),
        fail: Arc::new(AtomicBool::new(true)),
    };
    assert!(matches!(VerFS::open(disk), Err(VerFSError::Io(_))));
}
