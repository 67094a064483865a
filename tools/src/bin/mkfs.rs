use anyhow::{bail, Context};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use verfs::io::{FileBlockEmulator, FileBlockEmulatorBuilder};
use verfs::{FormatOptions, MountOptions, VerFS, BLOCK_SIZE, DEFAULT_BYTES_PER_INODE};

/// Formats a disk image with an empty versioning file system.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the disk image
    #[arg(short, long)]
    disk: PathBuf,

    /// Create the image with this many blocks instead of using its current size
    #[arg(short, long)]
    blocks: Option<usize>,

    /// Number of inodes, derived from the image size when omitted
    #[arg(short, long)]
    inodes: Option<u32>,

    /// Bytes of disk per inode when the inode count is derived
    #[arg(long, default_value_t = DEFAULT_BYTES_PER_INODE)]
    bytes_per_inode: u64,

    /// Volume name stored in the super block
    #[arg(short, long, default_value = "verfs")]
    name: String,

    /// Overwrite an existing image when --blocks is given
    #[arg(short, long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let dev = match cli.blocks {
        Some(blocks) => {
            if cli.disk.exists() && !cli.force {
                bail!("{} already exists, use --force to overwrite it", cli.disk.display());
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&cli.disk)
                .with_context(|| format!("creating {}", cli.disk.display()))?;
            FileBlockEmulatorBuilder::from(file)
                .with_block_count(blocks)
                .build()
                .with_context(|| format!("sizing {} to {} blocks", cli.disk.display(), blocks))?
        }
        None => FileBlockEmulator::open(&cli.disk)
            .with_context(|| format!("opening {}", cli.disk.display()))?,
    };

    let mut opts = FormatOptions::default()
        .with_name(cli.name)
        .with_bytes_per_inode(cli.bytes_per_inode);
    if let Some(inodes) = cli.inodes {
        opts = opts.with_inode_count(inodes);
    }

    println!("Formatting {}...", cli.disk.display());
    let fs = VerFS::format(dev, &opts, MountOptions::default())
        .with_context(|| format!("formatting {}", cli.disk.display()))?;
    fs.sync()?;

    let stats = fs.stats();
    println!("volume:       {}", stats.name);
    println!("block size:   {}", BLOCK_SIZE);
    println!("blocks:       {} ({} free)", stats.total_blocks, stats.free_blocks);
    println!("inodes:       {} ({} free)", stats.total_inodes, stats.free_inodes);
    println!("data start:   block {}", stats.data_start);
    Ok(())
}
