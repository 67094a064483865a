use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use std::path::PathBuf;
use verfs::io::FileBlockEmulator;
use verfs::{Clock, MountOptions, Node, NodeOps, SystemClock, VerFS, VersionPolicy};

/// Inspects and manages the version history of a verfs image.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the disk image
    #[arg(short, long)]
    disk: PathBuf,

    /// Blocks kept in memory between device accesses
    #[arg(long, default_value_t = 256)]
    cache_blocks: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    /// Keep every version
    All,
    /// Keep the newest PARAM versions
    Versions,
    /// Keep versions younger than PARAM seconds
    Time,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn versioning on for a file or directory
    Version {
        path: String,
        #[arg(value_enum, default_value_t = Policy::All)]
        policy: Policy,
        #[arg(default_value_t = 0)]
        param: u32,
    },
    /// Turn versioning off, keeping the recorded history
    Unversion { path: String },
    /// Apply the retention policy
    Prune { path: String },
    /// Print a file, optionally as it was at a past time
    Cat {
        path: String,
        /// Unix time in seconds
        #[arg(long)]
        at: Option<u32>,
    },
    /// List a directory, optionally as it was at a past time
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Unix time in seconds
        #[arg(long)]
        at: Option<u32>,
    },
    /// Restore a file or directory to its content at a past time
    Rollback {
        path: String,
        /// Unix time in seconds
        #[arg(long)]
        at: u32,
    },
    /// Write a host file over the start of a file, creating it if needed
    Put { path: String, source: PathBuf },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file or an empty directory
    Rm { path: String },
    /// Show node details and its version history
    Stat { path: String },
    /// Show file system usage and verify the allocation bitmaps
    Df,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let dev = FileBlockEmulator::open(&cli.disk)
        .with_context(|| format!("opening {}", cli.disk.display()))?;
    let opts = MountOptions::default().with_cache_blocks(cli.cache_blocks);
    let fs = VerFS::open_with(dev, opts).with_context(|| format!("mounting {}", cli.disk.display()))?;

    debug!("mounted {}: {:?}", cli.disk.display(), fs.stats());

    match cli.command {
        Commands::Version { path, policy, param } => {
            let policy = match policy {
                Policy::All => VersionPolicy::KeepAll,
                Policy::Versions => VersionPolicy::KeepSafeVersions(param),
                Policy::Time => VersionPolicy::KeepSafeTime(param),
            };
            fs.lookup_path(&path)?.set_versioning(policy)?;
            println!("{}: {:?}", path, policy);
        }
        Commands::Unversion { path } => {
            fs.lookup_path(&path)?.clear_versioning()?;
            println!("{}: versioning off", path);
        }
        Commands::Prune { path } => {
            let freed = fs.lookup_path(&path)?.prune()?;
            println!("{}: freed {} versions", path, freed);
        }
        Commands::Cat { path, at } => {
            let file = fs.lookup_path(&path)?.into_file()?;
            let data = match at {
                Some(at) => file.read_at(at)?,
                None => file.read_all()?,
            };
            print!("{}", String::from_utf8_lossy(&data));
        }
        Commands::Ls { path, at } => {
            let dir = fs.lookup_path(&path)?.into_dir()?;
            let entries = match at {
                Some(at) => dir.entries_at(at)?,
                None => dir.entries()?,
            };
            for (name, inum) in entries {
                println!("{:>8} {}", inum, name);
            }
        }
        Commands::Rollback { path, at } => match fs.lookup_path(&path)? {
            Node::File(file) => {
                let size = file.rollback(at)?;
                println!("{}: restored {} bytes from {}", path, size, at);
            }
            Node::Directory(dir) => {
                let size = dir.rollback(at)?;
                println!("{}: restored {} bytes of entries from {}", path, size, at);
            }
        },
        Commands::Put { path, source } => {
            let data = std::fs::read(&source)
                .with_context(|| format!("reading {}", source.display()))?;
            let file = match fs.lookup_path(&path) {
                Ok(node) => node.into_file()?,
                Err(verfs::VerFSError::DoesNotExist) => fs.create_file(&path)?,
                Err(e) => return Err(e.into()),
            };
            let written = file.write(0, &data)?;
            println!("{}: wrote {} bytes", path, written);
        }
        Commands::Mkdir { path } => {
            let dir = fs.mkdir(&path)?;
            println!("{}: inode {}", path, dir.inum());
        }
        Commands::Rm { path } => {
            fs.remove(&path)?;
        }
        Commands::Stat { path } => {
            let node = fs.lookup_path(&path)?;
            println!("inode:      {}", node.inum());
            println!("kind:       {:?}", node.kind());
            println!("size:       {}", node.size()?);
            println!("links:      {}", node.nlink()?);
            match node.versioning()? {
                Some(policy) => println!("versioning: {:?}", policy),
                None => println!("versioning: off"),
            }
            let chain = node.history_blocks()?;
            println!("history:    {} metadata blocks {:?}", chain.len(), chain);
            let current = SystemClock.now();
            for entry in node.versions()? {
                println!(
                    "  block {:>6}  saved in {:>8}  {:>4} bytes  {}s ago",
                    entry.logical_block,
                    entry.version_block,
                    entry.bytes_valid,
                    current.saturating_sub(entry.timestamp)
                );
            }
        }
        Commands::Df => {
            let stats = fs.stats();
            println!("volume: {}", stats.name);
            println!("blocks: {} of {} free", stats.free_blocks, stats.total_blocks);
            println!("inodes: {} of {} free", stats.free_inodes, stats.total_inodes);
            fs.check()?;
            println!("bitmaps consistent");
        }
    }

    fs.sync()?;
    Ok(())
}
