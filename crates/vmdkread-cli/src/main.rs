//! vmdkread CLI - Inspect and dump multi-segment VMware virtual disks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use vmdkread_core::{AccessFlags, Handle, HandleOptions, Segment};

/// Read-only access to VMware virtual disk images.
#[derive(Parser)]
#[command(name = "vmdkread")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Skip verifying the secondary grain directory.
    #[arg(long, global = true)]
    primary_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the segments and grain layout of a disk.
    Info {
        /// Descriptor and extent files of the disk.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show where a logical offset is stored.
    Map {
        /// Descriptor and extent files of the disk.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Logical byte offset.
        #[arg(short = 'O', long)]
        offset: u64,
    },

    /// Write the logical disk contents to a file.
    Dump {
        /// Descriptor and extent files of the disk.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,

        /// Chunk size in megabytes for reading.
        #[arg(long, default_value = "4")]
        chunk_size: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = if cli.primary_only {
        HandleOptions::primary_only()
    } else {
        HandleOptions::default()
    };

    match cli.command {
        Commands::Info { files } => show_info(&files, options)?,
        Commands::Map { files, offset } => show_mapping(&files, options, offset)?,
        Commands::Dump {
            files,
            output,
            chunk_size,
            quiet,
        } => run_dump(&files, options, &output, chunk_size, quiet)?,
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn open_disk(files: &[PathBuf], options: HandleOptions) -> Result<Handle> {
    let mut handle = Handle::with_options(options);
    handle
        .open(files, AccessFlags::READ)
        .with_context(|| format!("failed to open disk from {} file(s)", files.len()))?;
    tracing::info!(
        segments = handle.number_of_segments()?,
        media_size = handle.media_size()?,
        "disk opened"
    );
    Ok(handle)
}

fn show_info(files: &[PathBuf], options: HandleOptions) -> Result<()> {
    let mut handle = open_disk(files, options)?;
    let pool = handle.pool()?;

    println!("Disk Information");
    println!("================");
    println!();

    if let Some(descriptor) = handle.descriptor() {
        println!("Type:      {}", descriptor.create_type);
        println!("CID:       {:08x}", descriptor.cid);
        if descriptor.has_parent() {
            println!("Parent:    {:08x}", descriptor.parent_cid);
        }
        println!();
    }

    println!("Segments:");
    for index in 1..=handle.number_of_segments()? {
        let segment = handle.segment(index)?;
        let name = pool.name(segment.pool_entry())?;
        match segment {
            Segment::Descriptor { .. } => println!("  {}. {} - descriptor", index, name),
            Segment::Extent(extent) => {
                let header = extent.header()?;
                println!(
                    "  {}. {} - {} sparse v{}, {} ({} grains of {})",
                    index,
                    name,
                    header.format,
                    header.version,
                    format_bytes(extent.capacity_bytes()?),
                    extent.number_of_grains()?,
                    format_bytes(extent.grain_size_bytes()?)
                );
            }
            Segment::RawData { size, offset, .. } => println!(
                "  {}. {} - raw data, {} at offset {}",
                index,
                name,
                format_bytes(*size),
                offset
            ),
        }
    }
    println!();

    let offset_table = handle.offset_table()?;
    let allocated = offset_table
        .grain_offsets()
        .iter()
        .filter(|g| !g.is_sparse())
        .count();
    println!("Media size:       {}", format_bytes(handle.media_size()?));
    println!(
        "Grains:           {} ({} allocated)",
        handle.number_of_grains()?,
        allocated
    );
    println!(
        "Mismatched grains: {}",
        handle.number_of_mismatched_grains()?
    );

    handle.close()?;
    Ok(())
}

fn show_mapping(files: &[PathBuf], options: HandleOptions, offset: u64) -> Result<()> {
    let mut handle = open_disk(files, options)?;
    let mapping = handle.map_offset(offset)?;
    let name = handle.pool()?.name(mapping.pool_entry)?.to_string();

    println!("Offset:    {} (0x{:x})", offset, offset);
    println!("Segment:   {} ({})", mapping.segment, name);
    if let Some(grain) = mapping.grain {
        println!("Grain:     {}", grain);
    }
    match mapping.physical_offset {
        Some(physical) => println!("Physical:  {} (0x{:x})", physical, physical),
        None => println!("Physical:  unallocated (reads as zeros)"),
    }
    println!("Length:    {}", mapping.length);
    if mapping.corrupted {
        println!("Corrupted: yes");
    }

    handle.close()?;
    Ok(())
}

fn run_dump(
    files: &[PathBuf],
    options: HandleOptions,
    output: &Path,
    chunk_size_mb: usize,
    quiet: bool,
) -> Result<()> {
    let mut handle = open_disk(files, options)?;
    let media_size = handle.media_size()?;

    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(media_size);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let mut buffer = vec![0u8; chunk_size_mb.max(1) * 1024 * 1024];
    let mut offset = 0u64;
    while offset < media_size {
        let count = handle.read_at(offset, &mut buffer)?;
        if count == 0 {
            break;
        }
        writer.write_all(&buffer[..count])?;
        hasher.update(&buffer[..count]);
        offset += count as u64;
        if let Some(pb) = &progress_bar {
            pb.set_position(offset);
        }
    }
    writer.flush()?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }

    handle.close()?;

    if !quiet {
        println!();
        println!("Wrote {} to {}", format_bytes(offset), output.display());
    }
    println!("SHA256: {:x}", hasher.finalize());
    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
