use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use hubmirror_cache::{BlockCache, CacheHeader, CacheOps};
use hubmirror_cache_store_std::{StdCacheOps, export_to_path};

const BITMAP_LINE_WIDTH: usize = 50;

#[derive(Args)]
pub struct InspectArgs {
    /// Cache file to inspect.
    #[arg(short, long)]
    pub file: PathBuf,
    /// Write the cached file's contents here when every block is present.
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}

pub async fn run_inspect(args: InspectArgs) -> Result<()> {
    let ops = StdCacheOps::open_existing(&args.file)
        .with_context(|| format!("opening cache file {}", args.file.display()))?;
    let cache_len = ops.file_len().await.context("reading cache file size")?;
    let cache = BlockCache::open_existing(ops)
        .await
        .with_context(|| format!("reading cache header of {}", args.file.display()))?;
    let header = cache.header().await;

    println!("File: {}", args.file.display());
    print!("{}", render_report(&header, cache_len));

    if let Some(dest) = &args.export {
        if header.is_complete() {
            export_to_path(&cache, dest)
                .await
                .with_context(|| format!("exporting to {}", dest.display()))?;
            println!("Exported to {}", dest.display());
        } else {
            println!("Some blocks are not cached, so the export is skipped.");
        }
    }
    Ok(())
}

fn render_report(header: &CacheHeader, cache_len: u64) -> String {
    let cached = header.block_mask.count_ones();
    let mut out = String::new();
    out.push_str(&format!("Cache Version: {}\n", header.version));
    out.push_str(&format!("File Size: {}\n", human_size(header.file_size)));
    out.push_str(&format!("Cache Total Size: {}\n", human_size(cache_len)));
    out.push_str(&format!("Block Size: {}\n", header.block_size));
    out.push_str(&format!("Block Number: {}\n", header.block_number));
    out.push_str(&format!("Cached Blocks: {cached}/{}\n", header.block_number));
    out.push_str("Cache Status:\n");
    for line in render_bitmap(header).as_bytes().chunks(BITMAP_LINE_WIDTH) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out
}

fn render_bitmap(header: &CacheHeader) -> String {
    (0..header.block_number)
        .map(|index| match header.block_mask.test(index) {
            Ok(true) => '1',
            _ => '0',
        })
        .collect()
}

fn human_size(size: u64) -> String {
    const KIB: f64 = 1024.0;
    let size_f = size as f64;
    if size_f > KIB * KIB * KIB {
        format!("{:.4}GB", size_f / (KIB * KIB * KIB))
    } else if size_f > KIB * KIB {
        format!("{:.4}MB", size_f / (KIB * KIB))
    } else if size_f > KIB {
        format!("{:.4}KB", size_f / KIB)
    } else {
        format!("{size}B")
    }
}
