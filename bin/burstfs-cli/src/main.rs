//! BurstFS CLI - Client engine inspection
//!
//! Shows the effective client configuration and the superblock layout it
//! produces, and runs a self-contained write/read smoke test against an
//! anonymous superblock.

use anyhow::{Context, Result, bail};
use burstfs_client::{Client, Geometry, InMemoryMetaService, Layout, Span};
use burstfs_common::{ClientConfig, OpenFlags, RegionBacking};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "burstfs-cli")]
#[command(about = "BurstFS client engine CLI")]
#[command(version)]
struct Args {
    /// Client configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,
    /// Print the superblock layout
    Layout,
    /// Write and read back files through a private client
    Smoke {
        /// Mount prefix
        #[arg(long, default_value = "/burstfs")]
        prefix: String,

        /// Number of files
        #[arg(long, default_value = "4")]
        files: usize,

        /// Bytes per file
        #[arg(long, default_value = "1048576")]
        size: u64,
    },
}

fn print_span(name: &str, span: Option<Span>) {
    match span {
        Some(span) => println!(
            "{name:<16} {:>12} {:>12} {:>12}",
            span.offset,
            span.len,
            span.end()
        ),
        None => println!("{name:<16} {:>12}", "-"),
    }
}

fn show_layout(config: &ClientConfig) -> Result<()> {
    let geo = Geometry::from_config(config)?;
    let layout = Layout::compute(&geo)?;

    println!("Geometry");
    println!("========");
    println!("Page size:       {}", geo.page_size);
    println!("Max files:       {}", geo.max_files);
    println!("Chunk size:      {} bytes", geo.chunk_size());
    println!("Memory chunks:   {}", geo.max_chunks);
    println!("Spill chunks:    {}", geo.spill_max_chunks);
    println!("Max file size:   {} bytes", geo.max_file_size());
    println!("Index entries:   {}", geo.max_index_entries);
    println!("Attr entries:    {}", geo.max_fattr_entries);
    println!();
    println!("{:<16} {:>12} {:>12} {:>12}", "Region", "Offset", "Length", "End");
    print_span("header", Some(layout.header));
    print_span("fid stack", Some(layout.fid_stack));
    print_span("names", Some(layout.names));
    print_span("file meta", Some(layout.metas));
    print_span("chunk lists", Some(layout.chunk_metas));
    print_span("chunk stack", Some(layout.chunk_stack));
    print_span("spill stack", layout.spill_stack);
    print_span("chunk data", layout.chunks);
    print_span("index header", Some(layout.index_header));
    print_span("index", Some(layout.index_entries));
    print_span("attr header", Some(layout.attr_header));
    print_span("attrs", Some(layout.attr_entries));
    println!();
    println!("Total: {} bytes ({} MB)", layout.total, layout.total / 1024 / 1024);
    Ok(())
}

/// Byte `i` of file `n`
fn pattern(n: usize, i: u64) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let byte = (i.wrapping_mul(31) ^ (n as u64).wrapping_mul(0x9E37)) as u8;
    byte
}

fn smoke(config: ClientConfig, prefix: &str, files: usize, size: u64) -> Result<()> {
    let config = ClientConfig {
        region: RegionBacking::Anonymous,
        ..config
    };
    let service = InMemoryMetaService::new();
    let mut client = Client::mount(prefix, config, Arc::new(service.clone()))
        .context("failed to mount client")?;
    let spill_path = client.descriptor().spillover_path;

    let len = usize::try_from(size).context("file size does not fit in memory")?;
    for n in 0..files {
        let path = format!("{}/file{n}", prefix.trim_end_matches('/'));
        let fid = client
            .open(&path, OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::RDWR)
            .with_context(|| format!("failed to create {path}"))?
            .fid;
        let data: Vec<u8> = (0..size).map(|i| pattern(n, i)).collect();
        client.extend(fid, size)?;
        client.write(fid, 0, &data)?;
        client.sync(fid)?;

        let mut back = vec![0u8; len];
        client.read(fid, 0, &mut back)?;
        if back != data {
            bail!("{path}: data read back differs from data written");
        }
        let chunks = client.chunk_list(&path)?;
        debug!("{} verified across {} chunks", path, chunks.len());
        println!("{path}: {size} bytes in {} chunks, ok", chunks.len());
    }

    let entries = client.take_index_entries()?;
    println!("Log index entries: {}", entries.len());
    println!("Published files:   {}", service.len());

    client.unmount()?;
    if let Some(path) = spill_path {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    info!("Smoke test passed");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::load(args.config.as_deref()).context("failed to load config")?;

    match args.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Layout => show_layout(&config)?,
        Commands::Smoke {
            prefix,
            files,
            size,
        } => smoke(config, &prefix, files, size)?,
    }
    Ok(())
}
