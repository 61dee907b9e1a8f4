//! `eavesarp` command-line entry point (spec.md §6): `start` runs the
//! discovery/AITM engine until interrupted, `dump-snacs` reports what a
//! prior run persisted.

mod dump_snacs;
mod error;
mod logging;
mod start;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use dump_snacs::DumpFormat;
use error::Error;

#[derive(Debug, Parser)]
#[command(name = "eavesarp")]
#[command(about = "Detect stale network address configurations and relay traffic through them")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture ARP/DNS traffic, detect SNACs, and attack them as they appear.
    Start(start::StartArgs),
    /// Report the SNACs, attacks, and ports recorded in a store.
    DumpSnacs {
        #[arg(long)]
        db_file: PathBuf,
        #[arg(long, value_enum, default_value = "csv")]
        fmt: DumpFormat,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Start(args) => start::run(args).await,
        Command::DumpSnacs { db_file, fmt } => dump_snacs::run(&db_file, fmt),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn print_error(e: &Error) {
    eprintln!("error: {e}");
}
