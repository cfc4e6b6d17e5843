//! Region file inspector.
//!
//! Prints the layout of a region file, dumps single chunk records, and checks
//! that every stored chunk decodes. Files are opened read-only and never
//! modified, damaged or not.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p tessera-inspect -- world/region/r.0.0.mca
//! cargo run -p tessera-inspect -- world/region/r.0.0.mca --slots
//! cargo run -p tessera-inspect -- world/region/r.0.0.mca --extract 3 7 > chunk.bin
//! cargo run -p tessera-inspect -- world/region/r.-1.2.mca --check
//! ```

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use tessera_core::constants::REGION_SIZE;
use tessera_core::{ChunkPos, RegionPos};
use tessera_region::{RegionFile, RegionOptions};
use tessera_world::Chunk;
use tracing::{error, info, warn};

const USAGE: &str = "usage: tessera-inspect <region-file> [--slots] [--extract <x> <z>] [--check]";

#[derive(Debug, Default)]
struct Args {
    path: PathBuf,
    slots: bool,
    extract: Option<ChunkPos>,
    check: bool,
}

fn parse_args(mut iter: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut path = None;

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--slots" | "-s" => args.slots = true,
            "--check" | "-c" => args.check = true,
            "--extract" | "-x" => {
                let (Some(x), Some(z)) = (iter.next(), iter.next()) else {
                    bail!("--extract needs two chunk coordinates\n{USAGE}");
                };
                let x = x.parse().with_context(|| format!("bad chunk x: {x}"))?;
                let z = z.parse().with_context(|| format!("bad chunk z: {z}"))?;
                args.extract = Some(ChunkPos::new(x, z));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option {other}\n{USAGE}"),
            other => path = Some(PathBuf::from(other)),
        }
    }

    let Some(path) = path else {
        bail!("{USAGE}");
    };
    args.path = path;
    Ok(args)
}

fn slot_pos(region: RegionPos, index: usize) -> ChunkPos {
    region
        .min_chunk()
        .offset((index % REGION_SIZE) as i32, (index / REGION_SIZE) as i32)
}

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    run(&args, &mut io::stdout().lock())
}

fn run(args: &Args, out: &mut impl Write) -> anyhow::Result<()> {
    let region_pos = args
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(RegionPos::parse_file_name)
        .unwrap_or_else(|| {
            warn!(path = %args.path.display(), "not a region file name, assuming r.0.0");
            RegionPos::new(0, 0)
        });

    let mut region = RegionFile::open_read_only(&args.path, RegionOptions::default())
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let slots: Vec<_> = region.occupied_slots().collect();

    if let Some(pos) = args.extract {
        if !region_pos.contains(pos) {
            bail!("chunk {pos} is not in region {region_pos}");
        }
        let Some(record) = region.read(pos)? else {
            bail!("chunk {pos} is not stored in {}", args.path.display());
        };
        out.write_all(&record)?;
        return Ok(());
    }

    writeln!(out, "{}", args.path.display())?;
    writeln!(out, "  region:        {region_pos}")?;
    writeln!(out, "  chunks:        {}", slots.len())?;
    writeln!(out, "  sectors:       {}", region.sector_count())?;
    writeln!(out, "  free sectors:  {}", region.free_sector_count())?;

    if args.slots {
        writeln!(out)?;
        writeln!(out, "{:>5}  {:>14}  {:>8}  {:>5}  {:>10}", "slot", "chunk", "offset", "count", "timestamp")?;
        for (index, range) in &slots {
            writeln!(
                out,
                "{:>5}  {:>14}  {:>8}  {:>5}  {:>10}",
                index,
                slot_pos(region_pos, *index).to_string(),
                range.offset,
                range.count,
                region.timestamp(*index)
            )?;
        }
    }

    if args.check {
        let mut bad = 0usize;
        for (index, _) in &slots {
            let pos = slot_pos(region_pos, *index);
            match region.read(pos) {
                Ok(Some(record)) => match Chunk::from_bytes(&record) {
                    Ok(chunk) if chunk.pos == pos => {}
                    Ok(chunk) => {
                        error!(%pos, stored = %chunk.pos, "chunk stored in the wrong slot");
                        bad += 1;
                    }
                    Err(e) => {
                        error!(%pos, error = %e, "chunk record does not decode");
                        bad += 1;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    error!(%pos, error = %e, "chunk unreadable");
                    bad += 1;
                }
            }
        }
        if bad > 0 {
            bail!("{bad} of {} chunks failed the check", slots.len());
        }
        info!(chunks = slots.len(), "all chunks decode");
    }

    region.close()?;
    Ok(())
}
