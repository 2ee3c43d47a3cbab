//! Changelog Tool Binary
//!
//! Inspects, verifies, dumps and truncates changelog segments.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use changelog::changelog::{self as segment, Decoded, RecordReader, LOG_HEADER_SIZE};
use changelog::{Changelog, Config, Result};

/// Changelog Tool
#[derive(Parser, Debug)]
#[command(name = "changelog-tool")]
#[command(about = "Inspect and repair changelog segments")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header and what recovery would do
    Inspect {
        /// Path of the data file
        path: PathBuf,
    },

    /// Exit with status 1 if opening the segment would trim it
    Verify {
        /// Path of the data file
        path: PathBuf,
    },

    /// Print records
    Dump {
        /// Path of the data file
        path: PathBuf,

        /// First record id to print
        #[arg(short, long, default_value = "0")]
        from: u32,

        /// Maximum number of records to print
        #[arg(short, long, default_value = "100")]
        count: usize,
    },

    /// Drop every record with id >= count
    Truncate {
        /// Path of the data file
        path: PathBuf,

        /// Number of records to keep
        count: u32,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,changelog=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Inspect { path } => inspect(&path),
        Commands::Verify { path } => verify(&path),
        Commands::Dump { path, from, count } => dump(&path, from, count),
        Commands::Truncate { path, count } => truncate(&path, count),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn inspect(path: &Path) -> Result<ExitCode> {
    let (header, report) = segment::verify(path)?;

    println!("Changelog:          {}", header.changelog_id);
    println!("Epoch:              {}", header.epoch);
    println!("PrevRecordCount:    {}", header.prev_record_count);
    println!("Finalized:          {}", header.finalized);
    println!("RecordCount:        {}", report.record_count);
    println!("IndexEntries:       {}", report.index_entries_loaded);
    println!("IndexEntriesBad:    {}", report.index_entries_dropped);
    println!("RecordsReplayed:    {}", report.records_replayed);
    match report.trim {
        Some(trim) => println!(
            "TornTail:           record {} at offset {} ({} bytes, {:?})",
            trim.record_id, trim.offset, trim.bytes, trim.damage
        ),
        None => println!("TornTail:           none"),
    }

    Ok(ExitCode::SUCCESS)
}

fn verify(path: &Path) -> Result<ExitCode> {
    let (header, report) = segment::verify(path)?;

    match report.trim {
        Some(trim) => {
            println!(
                "changelog {}: {} records, would trim {} bytes at offset {}",
                header.changelog_id, report.record_count, trim.bytes, trim.offset
            );
            Ok(ExitCode::FAILURE)
        }
        None => {
            println!(
                "changelog {}: {} records, ok",
                header.changelog_id, report.record_count
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Scan records linearly without modifying the file
fn dump(path: &Path, from: u32, count: usize) -> Result<ExitCode> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(LOG_HEADER_SIZE))?;
    let mut reader = RecordReader::new(BufReader::new(file), LOG_HEADER_SIZE);

    let mut printed = 0usize;
    while printed < count {
        let position = reader.position();
        match reader.next_record()? {
            Decoded::Record(record) => {
                if record.record_id < from {
                    continue;
                }
                println!(
                    "#{:<8} offset={:<10} len={:<8} {}",
                    record.record_id,
                    position,
                    record.payload.len(),
                    preview(&record.payload)
                );
                printed += 1;
            }
            Decoded::EndOfRecords => break,
            Decoded::Corrupt(corruption) => {
                println!("corrupt record at offset {}: {}", position, corruption);
                break;
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn truncate(path: &Path, count: u32) -> Result<ExitCode> {
    let mut changelog = Changelog::open(path, &Config::default())?;
    let before = changelog.record_count();
    changelog.truncate(count)?;
    changelog.close()?;

    println!("truncated {}: {} -> {} records", path.display(), before, count);
    Ok(ExitCode::SUCCESS)
}

/// Printable prefix of a payload
fn preview(payload: &[u8]) -> String {
    const MAX_PREVIEW: usize = 48;

    let shown = &payload[..payload.len().min(MAX_PREVIEW)];
    let text: String = if shown.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(shown).into_owned()
    } else {
        shown.iter().map(|b| format!("{:02x}", b)).collect()
    };

    if payload.len() > MAX_PREVIEW {
        format!("{}...", text)
    } else {
        text
    }
}
