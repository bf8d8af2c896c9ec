//! QUIC Transport
//!
//! Point-to-point encrypted delivery of individual sync packets over QUIC
//! (via Quinn). Every packet occupies its own bidirectional stream, framed
//! with a 4-byte big-endian length prefix. Channel security uses a
//! self-signed certificate generated at listener startup; the dialing side
//! skips peer verification, so trust is anchored solely in possession of
//! the shared packet-encryption key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig, VarInt};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::error::SyncError;
use crate::protocol::{SyncPacket, KEY_LEN};

/// Upper bound for a single framed payload. Anything larger is rejected
/// before the body is read, bounding memory against a hostile peer.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// QUIC keep-alive period for idle connections.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Server name presented when dialing; never verified by the peer.
const SERVER_NAME: &str = "localhost";

/// Receiver side of the transport: invoked once per decoded packet.
#[async_trait::async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn handle(&self, packet: SyncPacket, remote_addr: String) -> Result<(), SyncError>;
}

/// QUIC transport with a shared address→connection cache.
///
/// `send` dials lazily and caches connections; `listen` runs the accept
/// loop and dispatches decoded packets to the registered handler. The same
/// endpoint backs both directions, so outbound dials originate from the
/// listening port.
pub struct QuicTransport {
    key: [u8; KEY_LEN],
    endpoint: OnceLock<Endpoint>,
    conns: Arc<RwLock<HashMap<String, Connection>>>,
    /// Per-address dial gates. Serializes dialers to the same address
    /// without holding the cache lock across the handshake.
    dialing: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    shutdown: Arc<AtomicBool>,
}

impl QuicTransport {
    /// Create a transport bound to the shared packet-encryption key.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            endpoint: OnceLock::new(),
            conns: Arc::new(RwLock::new(HashMap::new())),
            dialing: AsyncMutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Local address of the listening endpoint, once `listen` has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.get().and_then(|e| e.local_addr().ok())
    }

    /// Number of cached live connections.
    pub async fn cached_connections(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Start listening on `port` and dispatch inbound packets to `handler`.
    ///
    /// Certificate generation failure is a recoverable startup error, not a
    /// panic.
    pub fn listen(&self, port: u16, handler: Arc<dyn PacketHandler>) -> Result<(), SyncError> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| SyncError::Transport(format!("certificate generation failed: {}", e)))?;

        let cert_der = rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec());
        let key_der = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| SyncError::Transport(format!("failed to parse private key: {:?}", e)))?;

        let server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| SyncError::Transport(format!("server tls config: {}", e)))?;

        let mut transport_config = TransportConfig::default();
        transport_config.keep_alive_interval(Some(KEEP_ALIVE));
        let transport_config = Arc::new(transport_config);

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| SyncError::Transport(format!("quic server config: {}", e)))?,
        ));
        server_config.transport_config(transport_config.clone());

        // Trust is anchored in the shared packet key, not transport identity.
        let client_crypto = quinn::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| SyncError::Transport(format!("quic client config: {}", e)))?,
        ));
        client_config.transport_config(transport_config);

        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let mut endpoint = Endpoint::server(server_config, bind_addr)
            .map_err(|e| SyncError::Transport(format!("failed to bind {}: {}", bind_addr, e)))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        tracing::info!(addr = %local_addr, "transport listening");

        let accept_endpoint = endpoint.clone();
        self.endpoint
            .set(endpoint)
            .map_err(|_| SyncError::Transport("transport already listening".to_string()))?;

        let key = self.key;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let handler = handler.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => Self::handle_connection(conn, key, handler).await,
                        Err(e) => tracing::warn!("failed to accept connection: {}", e),
                    }
                });
            }
        });

        Ok(())
    }

    /// Encrypt `packet` and deliver it to `addr` on a fresh stream.
    ///
    /// No retry here; retry policy belongs to the master's fan-out.
    pub async fn send(&self, addr: &str, packet: &SyncPacket) -> Result<(), SyncError> {
        let data = packet.encrypt(&self.key)?;

        let conn = self.connection(addr).await?;

        let (mut send, _recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(format!("open stream to {}: {}", addr, e)))?;

        let len = (data.len() as u32).to_be_bytes();
        send.write_all(&len)
            .await
            .map_err(|e| SyncError::Transport(format!("write length to {}: {}", addr, e)))?;
        send.write_all(&data)
            .await
            .map_err(|e| SyncError::Transport(format!("write payload to {}: {}", addr, e)))?;
        send.finish()
            .map_err(|e| SyncError::Transport(format!("finish stream to {}: {}", addr, e)))?;

        tracing::debug!(%addr, op = %packet.op, path = %packet.path, "packet sent");
        Ok(())
    }

    /// Cached-or-dialed connection for `addr`.
    ///
    /// Dialers to the same address serialize on a per-address gate; the
    /// shared cache lock is never held across resolution or the QUIC
    /// handshake, so a slow or unreachable target cannot stall senders to
    /// other addresses.
    async fn connection(&self, addr: &str) -> Result<Connection, SyncError> {
        if let Some(conn) = self.cached(addr).await {
            return Ok(conn);
        }

        let gate = {
            let mut dialing = self.dialing.lock().await;
            dialing
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _dial = gate.lock().await;

        // A concurrent dialer may have won the gate first.
        if let Some(conn) = self.cached(addr).await {
            return Ok(conn);
        }

        let endpoint = self
            .endpoint
            .get()
            .ok_or_else(|| SyncError::Transport("transport not started".to_string()))?;

        let socket_addr = resolve(addr).await?;
        let conn = endpoint
            .connect(socket_addr, SERVER_NAME)
            .map_err(|e| SyncError::Transport(format!("dial {}: {}", addr, e)))?
            .await
            .map_err(|e| SyncError::Transport(format!("connect {}: {}", addr, e)))?;

        tracing::info!(%addr, "new connection established");
        self.conns
            .write()
            .await
            .insert(addr.to_string(), conn.clone());

        // Evict the cache entry the moment the session terminates, but
        // only if it still holds this connection and not a replacement.
        let cache = self.conns.clone();
        let watched = conn.clone();
        let cache_key = addr.to_string();
        tokio::spawn(async move {
            let reason = watched.closed().await;
            let mut cache = cache.write().await;
            if cache
                .get(&cache_key)
                .is_some_and(|c| c.stable_id() == watched.stable_id())
            {
                cache.remove(&cache_key);
                tracing::debug!(addr = %cache_key, %reason, "connection removed from cache");
            }
        });

        Ok(conn)
    }

    async fn cached(&self, addr: &str) -> Option<Connection> {
        let conns = self.conns.read().await;
        conns
            .get(addr)
            .filter(|conn| conn.close_reason().is_none())
            .cloned()
    }

    async fn handle_connection(conn: Connection, key: [u8; KEY_LEN], handler: Arc<dyn PacketHandler>) {
        let remote = conn.remote_address();
        tracing::debug!(%remote, "accepted connection");

        loop {
            match conn.accept_bi().await {
                Ok((_send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        Self::handle_stream(recv, key, handler, remote).await;
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_)) => break,
                Err(e) => {
                    tracing::debug!(%remote, "connection ended: {}", e);
                    break;
                }
            }
        }
    }

    /// One-shot stream handler: length prefix, bound check, payload,
    /// decrypt, dispatch. Handler errors are logged and do not affect the
    /// session.
    async fn handle_stream(
        mut recv: quinn::RecvStream,
        key: [u8; KEY_LEN],
        handler: Arc<dyn PacketHandler>,
        remote: SocketAddr,
    ) {
        let mut len_buf = [0u8; 4];
        if let Err(e) = recv.read_exact(&mut len_buf).await {
            tracing::debug!(%remote, "failed to read frame length: {}", e);
            return;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            tracing::warn!(%remote, len, "rejecting frame with invalid length");
            return;
        }

        let mut data = vec![0u8; len];
        if let Err(e) = recv.read_exact(&mut data).await {
            tracing::debug!(%remote, "failed to read frame payload: {}", e);
            return;
        }

        let packet = match SyncPacket::decrypt(&data, &key) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%remote, "dropping undecodable packet: {}", e);
                return;
            }
        };

        tracing::debug!(%remote, op = %packet.op, path = %packet.path, "packet received");

        if let Err(e) = handler.handle(packet, remote.to_string()).await {
            tracing::warn!(%remote, "packet handler failed: {}", e);
        }
    }

    /// Stop accepting, force-close every cached connection, and close the
    /// endpoint. Calls already in flight run to completion or failure on
    /// their own.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let mut conns = self.conns.write().await;
        for (addr, conn) in conns.drain() {
            tracing::debug!(%addr, "closing connection");
            conn.close(VarInt::from_u32(0), b"shutdown");
        }
        drop(conns);

        if let Some(endpoint) = self.endpoint.get() {
            endpoint.close(VarInt::from_u32(0), b"shutdown");
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, SyncError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| SyncError::Transport(format!("resolve {}: {}", addr, e)))?;
    addrs
        .next()
        .ok_or_else(|| SyncError::Transport(format!("no address for {}", addr)))
}

/// Skip server certificate verification; peers present self-signed certs.
#[derive(Debug)]
struct SkipServerVerification;

impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        vec![
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            quinn::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            quinn::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            quinn::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA256,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA384,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA512,
            quinn::rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;
    use std::sync::Once;
    use tokio::sync::mpsc;

    static INIT: Once = Once::new();

    fn init_crypto() {
        INIT.call_once(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("failed to install rustls crypto provider");
        });
    }

    fn test_key() -> [u8; KEY_LEN] {
        *b"0123456789abcdef0123456789abcdef"
    }

    struct ChannelHandler {
        tx: mpsc::Sender<(SyncPacket, String)>,
    }

    #[async_trait::async_trait]
    impl PacketHandler for ChannelHandler {
        async fn handle(&self, packet: SyncPacket, remote_addr: String) -> Result<(), SyncError> {
            let _ = self.tx.send((packet, remote_addr)).await;
            Ok(())
        }
    }

    #[test]
    fn test_transport_creation() {
        let transport = QuicTransport::new(test_key());
        assert!(!transport.is_shutdown());
        assert!(transport.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_send_without_listen_fails() {
        let transport = QuicTransport::new(test_key());
        let packet = SyncPacket::new(Op::Heartbeat, "node-1", vec![]);
        let err = transport.send("127.0.0.1:1", &packet).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn test_close_sets_shutdown() {
        let transport = QuicTransport::new(test_key());
        transport.close().await;
        assert!(transport.is_shutdown());
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        init_crypto();
        let transport = QuicTransport::new(test_key());
        let (tx, _rx) = mpsc::channel(8);
        transport
            .listen(0, Arc::new(ChannelHandler { tx }))
            .unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        init_crypto();
        let transport = QuicTransport::new(test_key());
        let (tx, _rx) = mpsc::channel(8);
        transport
            .listen(0, Arc::new(ChannelHandler { tx: tx.clone() }))
            .unwrap();
        let err = transport
            .listen(0, Arc::new(ChannelHandler { tx }))
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_send_and_receive_packet() {
        init_crypto();
        let key = test_key();

        let receiver = QuicTransport::new(key);
        let (tx, mut rx) = mpsc::channel(8);
        receiver.listen(0, Arc::new(ChannelHandler { tx })).unwrap();
        let addr = receiver.local_addr().unwrap();
        let target = format!("127.0.0.1:{}", addr.port());

        let sender = QuicTransport::new(key);
        let (stx, _srx) = mpsc::channel(8);
        sender.listen(0, Arc::new(ChannelHandler { tx: stx })).unwrap();

        let packet = SyncPacket::new(Op::Create, "a/b.txt", b"hello".to_vec());
        sender.send(&target, &packet).await.unwrap();

        let (received, remote) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for packet")
                .expect("channel closed");

        assert_eq!(received, packet);
        assert!(remote.starts_with("127.0.0.1:"));

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_connection_is_cached_and_reused() {
        init_crypto();
        let key = test_key();

        let receiver = QuicTransport::new(key);
        let (tx, mut rx) = mpsc::channel(16);
        receiver.listen(0, Arc::new(ChannelHandler { tx })).unwrap();
        let target = format!("127.0.0.1:{}", receiver.local_addr().unwrap().port());

        let sender = QuicTransport::new(key);
        let (stx, _srx) = mpsc::channel(8);
        sender.listen(0, Arc::new(ChannelHandler { tx: stx })).unwrap();

        for i in 0..3 {
            let packet = SyncPacket::new(Op::Modify, format!("f{}.txt", i), vec![i as u8]);
            sender.send(&target, &packet).await.unwrap();
        }
        assert_eq!(sender.cached_connections().await, 1);

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
        }

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_wrong_key_packet_is_dropped() {
        init_crypto();

        let receiver = QuicTransport::new(test_key());
        let (tx, mut rx) = mpsc::channel(8);
        receiver.listen(0, Arc::new(ChannelHandler { tx })).unwrap();
        let target = format!("127.0.0.1:{}", receiver.local_addr().unwrap().port());

        let sender = QuicTransport::new(*b"ffffffffffffffffffffffffffffffff");
        let (stx, _srx) = mpsc::channel(8);
        sender.listen(0, Arc::new(ChannelHandler { tx: stx })).unwrap();

        let packet = SyncPacket::new(Op::Create, "x.txt", b"secret".to_vec());
        sender.send(&target, &packet).await.unwrap();

        // The receiver cannot authenticate the packet; nothing reaches the
        // handler.
        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err());

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage() {
        let err = resolve("not-an-address").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
