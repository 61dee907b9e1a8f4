//! The JSON-Lines data log: one record per proxied chunk (spec.md §6).

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use eavesarp_core::addr::Transport;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Victim,
    Downstream,
}

/// Serialises a `u16` port as a quoted string, matching spec.md §6's
/// wire format for every address sub-field (`"src_port":"…"`,
/// `"port":"…"`) — ports stay `u16` in memory so arithmetic and
/// comparisons elsewhere are unaffected; only the JSON representation
/// is stringified.
fn serialize_port_as_string<S: serde::Serializer>(port: &u16, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(port)
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VictimAddress {
    pub ip: std::net::Ipv4Addr,
    #[serde(serialize_with = "serialize_port_as_string")]
    pub src_port: u16,
    #[serde(serialize_with = "serialize_port_as_string")]
    pub dst_port: u16,
    pub transport: Transport,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AddressDuo {
    pub ip: std::net::Ipv4Addr,
    #[serde(serialize_with = "serialize_port_as_string")]
    pub port: u16,
    pub transport: Transport,
}

/// Everything about a flow that stays constant across every chunk logged
/// for it.
#[derive(Debug, Clone, Copy)]
pub struct LogContext {
    pub victim_address: VictimAddress,
    pub spoofed_address: AddressDuo,
    pub proxy_address: AddressDuo,
    pub downstream_address: Option<AddressDuo>,
    pub transport: Transport,
}

#[derive(Serialize)]
struct DataLogRecord {
    time: String,
    sender: Sender,
    victim_address: VictimAddress,
    spoofed_address: AddressDuo,
    proxy_address: AddressDuo,
    downstream_address: Option<AddressDuo>,
    transport: Transport,
    data: String,
}

struct LogEntry {
    sender: Sender,
    ctx: LogContext,
    data: Vec<u8>,
}

/// Appends data-log records to a file via a single background writer
/// task, following the bounded-channel-plus-background-task pattern of
/// spec.md §4.4 ("a bounded channel feeds a single background task; a
/// boolean dead flag guards double-close").
pub struct DataLogSink {
    tx: mpsc::Sender<LogEntry>,
    dead: std::sync::atomic::AtomicBool,
}

impl DataLogSink {
    pub fn spawn(path: &Path) -> Result<Arc<Self>> {
        let path = path.to_path_buf();
        let (tx, mut rx) = mpsc::channel::<LogEntry>(100);
        tokio::spawn(async move {
            let file = match File::create(&path).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "failed to open data log file");
                    return;
                }
            };
            let mut file = file;
            while let Some(entry) = rx.recv().await {
                let record = DataLogRecord {
                    time: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
                    sender: entry.sender,
                    victim_address: entry.ctx.victim_address,
                    spoofed_address: entry.ctx.spoofed_address,
                    proxy_address: entry.ctx.proxy_address,
                    downstream_address: entry.ctx.downstream_address,
                    transport: entry.ctx.transport,
                    data: BASE64.encode(&entry.data),
                };
                match serde_json::to_vec(&record) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        if let Err(e) = file.write_all(&line).await {
                            warn!(error = %e, "data log write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "data log serialization failed"),
                }
            }
        });
        Ok(Arc::new(Self {
            tx,
            dead: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    /// Enqueues a chunk for logging. Drops the chunk rather than
    /// blocking the proxy's copy loop if the writer is backed up.
    pub fn log(&self, sender: Sender, ctx: LogContext, data: &[u8]) {
        if self.dead.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let entry = LogEntry {
            sender,
            ctx,
            data: data.to_vec(),
        };
        if self.tx.try_send(entry).is_err() {
            warn!("data log channel full, dropping chunk");
        }
    }

    pub fn close(&self) {
        self.dead.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

pub fn decode_for_test(data: &str) -> Result<Vec<u8>> {
    BASE64.decode(data).map_err(|e| Error::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips() {
        let data = b"hello downstream";
        let encoded = BASE64.encode(data);
        let decoded = decode_for_test(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}
