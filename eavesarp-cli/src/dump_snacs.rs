//! `dump-snacs`: a read-only report over the persisted store (spec.md §6).

use std::path::PathBuf;

use clap::ValueEnum;
use serde::Serialize;

use eavesarp_core::store::Store;

use crate::error::Result;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DumpFormat {
    Csv,
    Json,
    Jsonl,
}

#[derive(Serialize)]
struct SnacRecord {
    sender_ip: String,
    target_ip: String,
    arp_count: i64,
    attack_count: i64,
    port_count: i64,
}

pub fn run(db_file: &PathBuf, fmt: DumpFormat) -> Result<()> {
    let store = Store::open(db_file)?;
    let rows = store.dump_snacs()?;
    let records: Vec<SnacRecord> = rows
        .into_iter()
        .map(|r| SnacRecord {
            sender_ip: r.sender_ip.to_string(),
            target_ip: r.target_ip.to_string(),
            arp_count: r.arp_count,
            attack_count: r.attack_count,
            port_count: r.port_count,
        })
        .collect();

    match fmt {
        DumpFormat::Csv => {
            let mut writer = csv::WriterBuilder::new().from_writer(std::io::stdout());
            writer.write_record(["sender_ip", "target_ip", "arp_count", "attack_count", "port_count"])?;
            for r in &records {
                writer.write_record(&[
                    r.sender_ip.clone(),
                    r.target_ip.clone(),
                    r.arp_count.to_string(),
                    r.attack_count.to_string(),
                    r.port_count.to_string(),
                ])?;
            }
            writer.flush()?;
        }
        DumpFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        DumpFormat::Jsonl => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            for r in &records {
                serde_json::to_writer(&mut lock, r)?;
                use std::io::Write;
                writeln!(lock)?;
            }
        }
    }
    Ok(())
}

impl From<csv::Error> for crate::error::Error {
    fn from(e: csv::Error) -> Self {
        crate::error::Error::Config(format!("csv: {e}"))
    }
}

impl From<serde_json::Error> for crate::error::Error {
    fn from(e: serde_json::Error) -> Self {
        crate::error::Error::Config(format!("json: {e}"))
    }
}
