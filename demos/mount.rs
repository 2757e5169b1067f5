//! Mounts a NaiveFS image through FUSE.
//!
//! Usage:
//!   cargo run --example mount --features fuse -- -i naivefs.img -s 256 /mnt/naivefs

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;
use naivefs::{fuse, FileDisk, LfsConfig, NaiveFs};

#[derive(Parser)]
#[command(name = "naivefs-mount")]
#[command(about = "Mount a NaiveFS image with FUSE")]
struct Args {
    /// Image file, created when missing
    #[arg(short, long)]
    image: PathBuf,

    /// Image size in MiB when it has to be created or grown
    #[arg(short, long, default_value_t = 256)]
    size_mb: u64,

    /// JSON file overriding the default configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to mount
    mountpoint: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => LfsConfig::from_json(&std::fs::read(path)?)?,
        None => LfsConfig::default(),
    };
    let disk = Arc::new(FileDisk::open(&args.image, args.size_mb << 20)?);
    let fs = Arc::new(NaiveFs::mount(disk, config)?);
    info!("{:?}", fs.statfs());
    fuse::mount(fs, &args.mountpoint)?;
    Ok(())
}
