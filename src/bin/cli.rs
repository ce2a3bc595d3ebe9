//! AnvilDB CLI
//!
//! Command-line interface for reading, writing and inspecting a level
//! directory of region files.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anvildb::concurrency::WorkerPool;
use anvildb::region::{region_file_name, SectorFile};
use anvildb::{ChunkPos, Compression, Config, LevelStorage, Reporter};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AnvilDB CLI
#[derive(Parser, Debug)]
#[command(name = "anvil-cli")]
#[command(about = "CLI for AnvilDB region-file storage")]
#[command(version)]
struct Args {
    /// Level directory holding the region files
    #[arg(short, long, default_value = "./anvildb_data")]
    data_dir: PathBuf,

    /// Compression for new writes (gzip, deflate, none)
    #[arg(short, long, default_value = "deflate")]
    compression: Compression,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the bytes stored for a chunk
    Get {
        /// Chunk X coordinate
        #[arg(allow_hyphen_values = true)]
        x: i32,

        /// Chunk Z coordinate
        #[arg(allow_hyphen_values = true)]
        z: i32,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store bytes for a chunk
    Put {
        /// Chunk X coordinate
        #[arg(allow_hyphen_values = true)]
        x: i32,

        /// Chunk Z coordinate
        #[arg(allow_hyphen_values = true)]
        z: i32,

        /// Read the value from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Delete a chunk
    Del {
        /// Chunk X coordinate
        #[arg(allow_hyphen_values = true)]
        x: i32,

        /// Chunk Z coordinate
        #[arg(allow_hyphen_values = true)]
        z: i32,
    },

    /// Show the allocation summary of one region file
    Inspect {
        /// Region X coordinate
        #[arg(allow_hyphen_values = true)]
        region_x: i32,

        /// Region Z coordinate
        #[arg(allow_hyphen_values = true)]
        region_z: i32,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,anvildb=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("AnvilDB CLI v{}", anvildb::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> anvildb::Result<()> {
    if let Commands::Inspect { region_x, region_z } = args.command {
        return inspect(&args.data_dir, region_x, region_z);
    }

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .compression(args.compression)
        .build();
    let storage = LevelStorage::open(config)?;

    match args.command {
        Commands::Get { x, z, output } => {
            let pos = ChunkPos::new(x, z);
            match storage.get(pos)? {
                Some(bytes) => match output {
                    Some(path) => std::fs::write(path, &bytes)?,
                    None => io::stdout().write_all(&bytes)?,
                },
                None => {
                    eprintln!("(nil) {}", pos);
                }
            }
        }
        Commands::Put { x, z, input } => {
            let value = match input {
                Some(path) => std::fs::read(path)?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let len = value.len();
            storage.set(ChunkPos::new(x, z), value)?;
            eprintln!("OK ({} bytes)", len);
        }
        Commands::Del { x, z } => {
            storage.delete(ChunkPos::new(x, z))?;
            eprintln!("OK");
        }
        Commands::Inspect { .. } => {}
    }

    storage.close()
}

fn inspect(data_dir: &Path, region_x: i32, region_z: i32) -> anvildb::Result<()> {
    let path = data_dir.join(region_file_name(region_x, region_z));
    if !path.is_file() {
        eprintln!("no region file at {}", path.display());
        return Ok(());
    }

    let lane = WorkerPool::new("anvil-inspect", 1)?;
    let file = SectorFile::open(&path, lane.handle(), Reporter::tracing())?;
    let stats = file.stats()?;

    println!("{}", path.display());
    println!("  entries:          {}", stats.entries);
    println!("  allocated:        {} sectors", stats.allocated_sectors);
    println!("  used (w/ header): {} sectors", stats.used_sectors);
    println!("  file length:      {} bytes", stats.file_len);

    for index in 0..anvildb::pos::REGION_CHUNKS as u16 {
        let word = file.allocation(index);
        if word.is_empty() {
            continue;
        }
        let pos = ChunkPos::from_region_index(region_x, region_z, index);
        println!(
            "  {:>4} {:<14} start={:<6} sectors={:<3} modified={}",
            index,
            pos.to_string(),
            word.start(),
            word.count(),
            file.timestamp(index)
        );
    }

    // Nothing was written, so closing only pads and syncs
    file.close()?;
    lane.shutdown();
    Ok(())
}
