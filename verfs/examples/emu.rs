use std::sync::Arc;

use verfs::io::FileBlockEmulatorBuilder;
use verfs::{FormatOptions, ManualClock, MountOptions, NodeOps, VerFS, VersionPolicy};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(256)
        .build()
        .expect("Could not initialize disk emulator.");

    // Drive version timestamps by hand so the history is easy to follow.
    let clock = Arc::new(ManualClock::new(1_000));
    let mount = MountOptions::default().with_clock(clock.clone());
    let fs = VerFS::format(dev, &FormatOptions::default().with_name("demo"), mount)
        .expect("should format");

    let notes = fs.create_file("/notes.txt").unwrap();
    notes.write(0, b"first draft").unwrap();
    notes.set_versioning(VersionPolicy::KeepSafeVersions(2)).unwrap();

    for text in ["second draft", "third draft", "final draft"] {
        clock.advance(1);
        notes.write(0, text.as_bytes()).unwrap();
    }

    for entry in notes.versions().unwrap() {
        let old = notes.retrieve(0, entry.timestamp).unwrap();
        println!("t={} {:?}", entry.timestamp, String::from_utf8_lossy(&old));
    }
    println!("pruned {} versions", notes.prune().unwrap());
    println!("now {:?}", String::from_utf8_lossy(&notes.read_all().unwrap()));
    println!("{:#?}", fs.stats());
}
