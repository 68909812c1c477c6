//! Offline inspector for map chunk files and redo logs.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use strata::storage::btree::{census, PageCensus};
use strata::storage::{ChunkStore, FileChunkStore};
use strata::txn::RedoLog;
use strata::{Config, Result};

#[derive(Parser, Debug)]
#[command(
    name = "strata-inspect",
    version,
    about = "Inspect strata map files and redo logs",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk a map file from its root, verify every page checksum and count pages.
    Census {
        #[arg(value_name = "MAP_FILE")]
        path: PathBuf,
    },
    /// List the committed transactions held in a redo log.
    Redo {
        #[arg(value_name = "REDO_LOG")]
        path: PathBuf,
    },
    /// Parse a node configuration file and print the effective settings.
    Config {
        #[arg(value_name = "CONFIG")]
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct CensusReport {
    path: PathBuf,
    root: Option<u64>,
    #[serde(flatten)]
    census: PageCensus,
}

#[derive(Serialize)]
struct RedoEntry {
    tid: u64,
    bytes: usize,
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Census { path } => {
            let store = FileChunkStore::open(&path)?;
            let root = store.root()?;
            let census = match root {
                Some(pos) => census(&store, pos)?,
                None => PageCensus::default(),
            };
            let report = CensusReport {
                path,
                root: root.map(|pos| pos.0),
                census,
            };
            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    println!("map file      {}", report.path.display());
                    match report.root {
                        Some(pos) => println!("root          @{pos}"),
                        None => println!("root          (never saved)"),
                    }
                    println!("depth         {}", report.census.depth);
                    println!("nodes         {}", report.census.nodes);
                    println!("leaves        {}", report.census.leaves);
                    println!("remote pages  {}", report.census.remotes);
                    println!("column pages  {}", report.census.column_pages);
                    println!("rows          {}", report.census.rows);
                    println!("bytes         {}", report.census.bytes);
                }
            }
        }
        Command::Redo { path } => {
            let log = RedoLog::open_path(&path)?;
            let entries: Vec<RedoEntry> = log
                .records()?
                .into_iter()
                .map(|record| RedoEntry {
                    tid: record.tid.0,
                    bytes: record.payload.len(),
                })
                .collect();
            match cli.format {
                OutputFormat::Json => print_json(&entries)?,
                OutputFormat::Text => {
                    for entry in &entries {
                        println!("tx#{:<10} {:>8} bytes", entry.tid, entry.bytes);
                    }
                    println!("{} committed transactions", entries.len());
                }
            }
        }
        Command::Config { path } => {
            let config = Config::load(&path)?;
            match cli.format {
                OutputFormat::Json => print_json(&config)?,
                OutputFormat::Text => print!("{}", config.to_toml()?),
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| strata::StrataError::Internal(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("strata-inspect: {err}");
            ExitCode::FAILURE
        }
    }
}
