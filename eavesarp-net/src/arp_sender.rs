//! Serialised ARP emission behind the rate gate (spec.md §4.2).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pnet::util::MacAddr;
use pnet_packet::arp::{ArpOperation, ArpOperations};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use eavesarp_core::config::ArpSenderConfig;
use eavesarp_core::error::Result;
use eavesarp_core::store::Store;

use crate::frame::build_arp_frame;
use crate::rate_gate::RateGate;
use crate::sink::FrameSink;

/// An outstanding probe the engine itself issued and awaits a reply for
/// (spec.md §3: "Active ARP").
#[derive(Clone)]
pub struct ActiveArpEntry {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

pub type ActiveArpMap = Arc<DashMap<Ipv4Addr, ActiveArpEntry>>;

#[derive(Debug, Clone)]
pub struct ArpSendRequest {
    pub operation: ArpOperation,
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: Option<MacAddr>,
    pub target_ip: Ipv4Addr,
    /// Retries remaining for this request; `None` selects the sender's
    /// configured default.
    pub retries: Option<u32>,
    /// Timeout for this request; `None` selects the sender's configured
    /// default (spec.md §4.2: 4s).
    pub timeout: Option<Duration>,
    /// The IP the Store's `ip_id` resolves from, used to persist
    /// `arp_resolved` on retry exhaustion. Only meaningful for requests.
    pub target_ip_id: Option<i64>,
}

pub struct ArpSender {
    config: ArpSenderConfig,
    rate_gate: Arc<RateGate>,
    sink: Arc<dyn FrameSink>,
    store: Arc<Store>,
    active: ActiveArpMap,
    queue_tx: mpsc::Sender<ArpSendRequest>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<ArpSendRequest>>,
}

impl ArpSender {
    pub fn new(config: ArpSenderConfig, rate_gate: Arc<RateGate>, sink: Arc<dyn FrameSink>, store: Arc<Store>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        Arc::new(Self {
            config,
            rate_gate,
            sink,
            store,
            active: Arc::new(DashMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        })
    }

    pub fn active_arp(&self) -> ActiveArpMap {
        self.active.clone()
    }

    pub fn queue_handle(&self) -> mpsc::Sender<ArpSendRequest> {
        self.queue_tx.clone()
    }

    /// Registers an Active ARP entry for `target_ip` if none exists.
    /// Returns `Err(AlreadySet)` if one is already outstanding — the
    /// caller should skip enqueuing a duplicate probe.
    pub fn try_mark_active(&self, target_ip: Ipv4Addr, timeout: Duration) -> Result<CancellationToken> {
        use dashmap::mapref::entry::Entry;
        match self.active.entry(target_ip) {
            Entry::Occupied(_) => Err(eavesarp_core::Error::AlreadySet(target_ip.to_string())),
            Entry::Vacant(v) => {
                let cancel = CancellationToken::new();
                v.insert(ActiveArpEntry {
                    deadline: Instant::now() + timeout,
                    cancel: cancel.clone(),
                });
                Ok(cancel)
            }
        }
    }

    /// Cancels and removes an Active ARP entry, e.g. because a matching
    /// reply arrived. Returns `true` if an entry was present.
    pub fn resolve_active(&self, target_ip: Ipv4Addr) -> bool {
        if let Some((_, entry)) = self.active.remove(&target_ip) {
            entry.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub async fn enqueue(&self, req: ArpSendRequest) -> Result<()> {
        self.queue_tx
            .send(req)
            .await
            .map_err(|_| eavesarp_core::Error::Io(std::io::Error::other("arp sender queue closed")))
    }

    /// Runs the serialised send loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.queue_rx.lock().await;
        loop {
            let req = tokio::select! {
                _ = cancel.cancelled() => break,
                req = rx.recv() => match req {
                    Some(r) => r,
                    None => break,
                },
            };
            self.rate_gate.wait().await;
            if let Err(e) = self.process(req.clone(), &cancel).await {
                warn!(error = %e, target = %req.target_ip, "arp send failed");
            }
        }
    }

    async fn process(self: &Arc<Self>, req: ArpSendRequest, root_cancel: &CancellationToken) -> Result<()> {
        let frame = build_arp_frame(req.operation, req.sender_hw, req.sender_ip, req.target_hw, req.target_ip)?;
        self.sink.send_frame(&frame)?;

        if req.operation != ArpOperations::Request {
            return Ok(());
        }

        let timeout = req.timeout.unwrap_or(self.config.timeout);
        let retries = req.retries.unwrap_or(self.config.retries);

        let entry = self.active.get(&req.target_ip).map(|e| e.clone());
        let cancel = match entry {
            Some(e) => e.cancel,
            // A retried request re-enters `process` without re-registering;
            // the original entry already tracks it.
            None => CancellationToken::new(),
        };

        let this = Arc::clone(self);
        let target_ip = req.target_ip;
        let target_ip_id = req.target_ip_id;
        let root_cancel = root_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = root_cancel.cancelled() => {}
                _ = cancel.cancelled() => {
                    debug!(target = %target_ip, "arp reply observed before timeout");
                }
                _ = tokio::time::sleep(timeout) => {
                    if retries > 0 {
                        let retry = ArpSendRequest {
                            retries: Some(retries - 1),
                            ..req
                        };
                        let _ = this.queue_tx.send(retry).await;
                    } else {
                        if let Some(id) = target_ip_id {
                            if let Err(e) = this.store.mark_arp_resolved(id) {
                                warn!(error = %e, target = %target_ip, "failed to mark arp_resolved on retry exhaustion");
                            }
                        }
                        this.active.remove(&target_ip);
                        debug!(target = %target_ip, "arp retries exhausted");
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eavesarp_core::config::RateGateConfig;
    use eavesarp_core::model::DiscoveryMethod;
    use eavesarp_core::store::Store;
    use std::time::Duration as StdDuration;

    use crate::sink::RecordingSink;

    fn fast_rate_gate() -> Arc<RateGate> {
        Arc::new(RateGate::with_seed(
            RateGateConfig {
                min: StdDuration::from_millis(0),
                max: StdDuration::from_millis(1),
                jitter_pct: 0.0,
            },
            1,
        ))
    }

    #[tokio::test]
    async fn request_emits_broadcast_frame_with_known_target_ip() {
        let store = Arc::new(Store::open_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let sender = ArpSender::new(ArpSenderConfig::default(), fast_rate_gate(), sink.clone(), store.clone());
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(Arc::clone(&sender).run(cancel.clone()));

        let target_ip: Ipv4Addr = "10.0.0.20".parse().unwrap();
        let ip_id = store.upsert_ip(target_ip, DiscoveryMethod::PassiveArp).unwrap();
        let active_cancel = sender.try_mark_active(target_ip, Duration::from_millis(20)).unwrap();

        sender
            .enqueue(ArpSendRequest {
                operation: ArpOperations::Request,
                sender_hw: MacAddr::new(1, 2, 3, 4, 5, 6),
                sender_ip: "10.0.0.5".parse().unwrap(),
                target_hw: None,
                target_ip,
                retries: Some(0),
                timeout: Some(Duration::from_millis(20)),
                target_ip_id: Some(ip_id),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        let ip = store.get_ip(target_ip).unwrap().unwrap();
        assert!(ip.arp_resolved, "retry exhaustion should mark arp_resolved");
        assert!(!active_cancel.is_cancelled());

        cancel.cancel();
        let _ = run_handle.await;
    }
}
