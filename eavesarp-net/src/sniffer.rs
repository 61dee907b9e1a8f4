//! Single raw-capture loop; dispatches ARP frames, maintains per-IP
//! active-ARP/active-DNS bookkeeping, and persists conversations
//! (spec.md §4.1).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;
use pnet_packet::arp::{ArpOperations, ArpPacket};
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use eavesarp_core::config::Config;
use eavesarp_core::model::DiscoveryMethod;
use eavesarp_core::store::Store;

use crate::arp_sender::{ArpSendRequest, ArpSender};
use crate::dns_resolver::DnsResolver;
use crate::error::Result;

/// Opens a raw capture and forwards whole Ethernet frames onto a bounded
/// channel. `pnet_datalink`'s receive loop is blocking, so it runs on a
/// dedicated OS thread via `spawn_blocking`; filtering to ARP frames only
/// happens after capture, by ethertype, since `pnet_datalink` (unlike
/// libpcap) exposes no BPF filter knob.
pub fn spawn_capture_thread(
    interface: pnet_datalink::NetworkInterface,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let channel = pnet_datalink::channel(&interface, Default::default())
        .map_err(|e| crate::error::Error::Capture(e.to_string()))?;
    let mut rx = match channel {
        pnet_datalink::Channel::Ethernet(_, rx) => rx,
        _ => return Err(crate::error::Error::Capture("unsupported channel type".into())),
    };

    Ok(tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            match rx.next() {
                Ok(frame) => {
                    if tx.blocking_send(frame.to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "capture read failed");
                    break;
                }
            }
        }
    }))
}

pub struct Sniffer {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub arp_sender: Arc<ArpSender>,
    pub dns_resolver: Arc<DnsResolver>,
    pub interface_mac: MacAddr,
}

impl Sniffer {
    /// Drives the dispatch loop until `frames` closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut frames: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(f) => f,
                    None => break,
                },
            };
            if let Err(e) = self.handle_frame(&frame).await {
                debug!(error = %e, "dropping unparseable frame");
            }
        }
    }

    pub async fn handle_frame(&self, raw: &[u8]) -> Result<()> {
        let eth = match EthernetPacket::new(raw) {
            Some(p) => p,
            None => return Ok(()),
        };
        if eth.get_ethertype() != EtherTypes::Arp {
            return Ok(());
        }
        if eth.get_source() == self.interface_mac {
            return Ok(());
        }
        let arp = match ArpPacket::new(eth.payload()) {
            Some(p) => p,
            None => return Ok(()),
        };

        let sender_mac = arp.get_sender_hw_addr();
        let sender_ip = arp.get_sender_proto_addr();
        let target_ip = arp.get_target_proto_addr();

        match arp.get_operation() {
            op if op == ArpOperations::Request => self.handle_request(sender_mac, sender_ip, target_ip).await,
            op if op == ArpOperations::Reply => self.handle_reply(sender_mac, sender_ip).await,
            _ => Ok(()),
        }
    }

    async fn handle_request(&self, sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Result<()> {
        if sender_ip == Ipv4Addr::UNSPECIFIED || !self.in_subnet(sender_ip) || !self.in_subnet(target_ip) {
            trace!(%sender_ip, %target_ip, "ignoring out-of-subnet or unspecified-sender request");
            return Ok(());
        }

        if target_ip == self.config.interface_addr {
            // "sender wants us": record passively, nothing more to do.
            let mac_id = self.store.upsert_mac(&mac_to_string(sender_mac), DiscoveryMethod::PassiveArp)?;
            let ip_id = self.store.upsert_ip(sender_ip, DiscoveryMethod::PassiveArp)?;
            self.store.set_ip_mac(ip_id, mac_id)?;
            return Ok(());
        }

        let mac_id = self.store.upsert_mac(&mac_to_string(sender_mac), DiscoveryMethod::PassiveArp)?;
        let sender_ip_id = self.store.upsert_ip(sender_ip, DiscoveryMethod::PassiveArp)?;
        self.store.set_ip_mac(sender_ip_id, mac_id)?;
        let target_ip_id = self.store.upsert_ip(target_ip, DiscoveryMethod::PassiveArp)?;

        let (count, transitioned) = self.store.increment_arp_count(sender_ip_id, target_ip_id)?;
        if transitioned {
            debug!(%sender_ip, %target_ip, "new conversation");
        }
        trace!(%sender_ip, %target_ip, count, "arp request observed");

        let target = self.store.get_ip(target_ip)?;
        let needs_probe = target.as_ref().map(|t| t.mac_id.is_none() && !t.arp_resolved).unwrap_or(true);
        if needs_probe {
            let timeout = self.config.arp_sender.timeout;
            if let Ok(_cancel) = self.arp_sender.try_mark_active(target_ip, timeout) {
                let req = ArpSendRequest {
                    operation: ArpOperations::Request,
                    sender_hw: self.interface_mac,
                    sender_ip: self.config.interface_addr,
                    target_hw: None,
                    target_ip,
                    retries: None,
                    timeout: None,
                    target_ip_id: Some(target_ip_id),
                };
                self.arp_sender.enqueue(req).await.ok();
            }
        }

        self.maybe_follow_up_dns(sender_ip, target_ip).await;

        Ok(())
    }

    async fn handle_reply(&self, sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Result<()> {
        let mac_id = self.store.upsert_mac(&mac_to_string(sender_mac), DiscoveryMethod::PassiveArp)?;
        let ip_id = self.store.upsert_ip(sender_ip, DiscoveryMethod::ActiveArp)?;
        self.store.set_ip_mac(ip_id, mac_id)?;

        if self.arp_sender.resolve_active(sender_ip) {
            self.store.mark_arp_resolved(ip_id)?;
            debug!(%sender_ip, "active arp resolved by reply");
        } else {
            trace!(%sender_ip, "passive arp reply observed");
        }
        Ok(())
    }

    /// Spawns a follow-up PTR walk per eligible IP rather than awaiting it
    /// inline, so a slow DNS server cannot stall the capture dispatch
    /// loop (DESIGN NOTES §9: break the sniffer/resolver cycle via a
    /// bounded follow-up queue; `tokio::spawn` plus the resolver's own
    /// in-flight/budget guards play that role here).
    async fn maybe_follow_up_dns(&self, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) {
        if self.dns_resolver.budget_exceeded() {
            return;
        }
        for ip in [sender_ip, target_ip] {
            let resolved = self.store.get_ip(ip).ok().flatten().map(|i| i.ptr_resolved).unwrap_or(false);
            if resolved {
                continue;
            }
            let resolver = Arc::clone(&self.dns_resolver);
            tokio::spawn(async move {
                // Each walk's own starting IP is the SNAC it is resolving
                // on behalf of (spec.md §4.3: "the originating SNAC
                // target IP"), not unconditionally `target_ip` — a
                // PTR walk started from `sender_ip` must not attribute
                // its forward-resolved addresses to `target_ip`.
                resolver.resolve_ptr(ip, ip, 0).await;
            });
        }
    }

    fn in_subnet(&self, ip: Ipv4Addr) -> bool {
        let network: Ipv4Network = self.config.subnet;
        network.contains(ip)
    }
}

fn mac_to_string(mac: MacAddr) -> String {
    mac.to_string().to_lowercase()
}

#[allow(dead_code)]
pub(crate) const DEFAULT_ARP_TIMEOUT: Duration = Duration::from_secs(4);
