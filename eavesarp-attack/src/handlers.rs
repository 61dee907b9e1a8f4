//! Pluggable per-frame handlers an attack fans captured traffic out to
//! (spec.md §4.4): a packet counter, an attack-port recorder, a
//! packet-limit terminator, and an optional pcap writer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use tokio::sync::mpsc;
use tracing::{info, warn};

use eavesarp_core::addr::Transport;
use eavesarp_core::store::Store;

use crate::error::{Error, Result};

/// Observes every frame an attack relays or is poisoned with.
/// Implementations must not block the dispatch loop; expensive work
/// belongs on its own task.
pub trait PacketHandler: Send + Sync {
    fn on_frame(&self, frame: &[u8]);
}

/// Per-handler bounded channel plus its single background task (spec.md
/// §4.4, §5): the dispatch loop only ever enqueues; a slow handler
/// backpressures just itself, never the capture/dispatch loop or its
/// sibling handlers. A boolean "dead" flag guards double-close, set when
/// the attack's cancellation token fires.
pub struct HandlerChannel {
    tx: mpsc::Sender<Vec<u8>>,
    dead: AtomicBool,
}

const HANDLER_CHANNEL_CAPACITY: usize = 100;

impl HandlerChannel {
    /// Spawns the background task that drains frames into `handler`, in
    /// the order they were submitted.
    pub fn spawn(handler: Arc<dyn PacketHandler>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(HANDLER_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                handler.on_frame(&frame);
            }
        });
        Arc::new(Self {
            tx,
            dead: AtomicBool::new(false),
        })
    }

    /// Enqueues `frame` for this handler. Drops it silently when the
    /// channel is full or the handler has been closed — the dispatch
    /// loop must never block on a slow handler.
    pub fn dispatch(&self, frame: &[u8]) {
        if self.dead.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.try_send(frame.to_vec()).is_err() {
            warn!("handler channel full or closed, dropping packet for this handler");
        }
    }

    /// Marks the channel dead so further `dispatch` calls are no-ops.
    /// The background task drains whatever is already queued and exits
    /// once every sender clone (including this one, on drop) is gone.
    pub fn close(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }
}

/// Counts frames seen, emitting the current count on a broadcast channel
/// every `log_every`th frame (0 disables emission and just counts;
/// spec.md §4.4: "emits current count on a channel (optionally
/// throttled to every Nth packet)"). `tokio::sync::broadcast` is used
/// rather than `mpsc` since a count has no single designated consumer —
/// any number of subscribers may want to watch an attack's throughput.
pub struct PacketCounter {
    count: AtomicU64,
    log_every: u64,
    tx: tokio::sync::broadcast::Sender<u64>,
}

impl PacketCounter {
    pub fn new(log_every: u64) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        Self {
            count: AtomicU64::new(0),
            log_every,
            tx,
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Subscribes to count updates; emitted every `log_every`th frame.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl PacketHandler for PacketCounter {
    fn on_frame(&self, _frame: &[u8]) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.log_every > 0 && n % self.log_every == 0 {
            info!(count = n, "attack packet counter");
            let _ = self.tx.send(n);
        }
    }
}

/// Persists transport ports opportunistically observed during an attack
/// to `attack_port` (spec.md §6).
pub struct AttackPortRecorder {
    store: Arc<Store>,
    attack_id: i64,
}

impl AttackPortRecorder {
    pub fn new(store: Arc<Store>, attack_id: i64) -> Self {
        Self { store, attack_id }
    }

    pub fn record(&self, number: u16, protocol: Transport) {
        if let Err(e) = self.store.insert_attack_port(self.attack_id, number, protocol) {
            warn!(error = %e, port = number, "failed to record attack port");
        }
    }
}

/// Invokes `on_limit` exactly once after `max_packets` frames have been
/// observed, so the caller can cancel the attack on a packet budget.
pub struct PacketLimitTerminator<F: Fn() + Send + Sync> {
    count: AtomicU64,
    max_packets: u64,
    fired: AtomicBool,
    on_limit: F,
}

impl<F: Fn() + Send + Sync> PacketLimitTerminator<F> {
    pub fn new(max_packets: u64, on_limit: F) -> Self {
        Self {
            count: AtomicU64::new(0),
            max_packets,
            fired: AtomicBool::new(false),
            on_limit,
        }
    }
}

impl<F: Fn() + Send + Sync> PacketHandler for PacketLimitTerminator<F> {
    fn on_frame(&self, _frame: &[u8]) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.max_packets && !self.fired.swap(true, Ordering::Relaxed) {
            (self.on_limit)();
        }
    }
}

/// Writes every non-ARP frame to a pcap file, excluding the poisoning
/// traffic itself (spec.md §4.4).
pub struct PcapHandler {
    writer: Mutex<PcapWriter<std::fs::File>>,
}

impl PcapHandler {
    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::File::create(path).map_err(|e| Error::Capture(e.to_string()))?;
        let writer = PcapWriter::with_header(file, PcapHeader::default()).map_err(|e| Error::Capture(e.to_string()))?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

impl PacketHandler for PcapHandler {
    fn on_frame(&self, frame: &[u8]) {
        if let Some(eth) = EthernetPacket::new(frame) {
            if eth.get_ethertype() == EtherTypes::Arp {
                return;
            }
        }
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let packet = PcapPacket::new(since_epoch, frame.len() as u32, frame);
        match self.writer.lock() {
            Ok(mut w) => {
                if let Err(e) = w.write_packet(&packet) {
                    warn!(error = %e, "pcap write failed");
                }
            }
            Err(_) => warn!("pcap writer mutex poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[test]
    fn packet_counter_counts() {
        let counter = PacketCounter::new(0);
        counter.on_frame(&[]);
        counter.on_frame(&[]);
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn limit_terminator_fires_once() {
        let fired = Arc::new(StdAtomicBool::new(false));
        let fired_clone = fired.clone();
        let terminator = PacketLimitTerminator::new(2, move || {
            fired_clone.store(true, Ordering::Relaxed);
        });
        terminator.on_frame(&[]);
        assert!(!fired.load(Ordering::Relaxed));
        terminator.on_frame(&[]);
        assert!(fired.load(Ordering::Relaxed));
        fired.store(false, Ordering::Relaxed);
        terminator.on_frame(&[]);
        assert!(!fired.load(Ordering::Relaxed), "must not re-fire");
    }

    #[tokio::test]
    async fn handler_channel_delivers_frames_in_order() {
        let counter = Arc::new(PacketCounter::new(0));
        let channel = HandlerChannel::spawn(counter.clone());
        for _ in 0..5 {
            channel.dispatch(&[0xaa]);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.count(), 5);
    }

    #[tokio::test]
    async fn handler_channel_drops_after_close() {
        let counter = Arc::new(PacketCounter::new(0));
        let channel = HandlerChannel::spawn(counter.clone());
        channel.dispatch(&[0xaa]);
        channel.close();
        channel.dispatch(&[0xaa]);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.count(), 1, "dispatch after close must be a no-op");
    }
}
