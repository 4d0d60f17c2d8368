//! Listener lifecycle, the admission pipeline, and the accept queue.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, trace};

use crate::buffer::ReceivedPacket;
use crate::cid::ConnectionId;
use crate::config::{
    default_accept_token, populate_server_config, validate_server_config, AcceptToken, Config,
    ConfigError, DropReason, EndpointTracer,
};
use crate::demux::{Demultiplexer, PacketHandler, PacketHandlerMap, UnknownPacketHandler};
use crate::packet::{Header, PacketDecodeError};
use crate::reply;
use crate::session::{Session, SessionFactory, SessionParams};
use crate::token::TokenGenerator;
use crate::{MAX_ACCEPT_QUEUE_SIZE, MIN_INITIAL_DST_CID_LEN, MIN_INITIAL_PACKET_SIZE};

/// Unknown-CID packets buffered between the demultiplexer and the intake
/// task. The demultiplexer never blocks: overflow is dropped.
const RECEIVED_PACKETS_BOUND: usize = 1000;

/// Ceiling on in-flight reply sends. Retry, Version Negotiation, and
/// server-busy replies are fire-and-forget; bounding them keeps a flood of
/// spoofed Initials from fanning out into unbounded tasks.
const MAX_CONCURRENT_REPLIES: usize = 64;

/// A QUIC listener accepting sessions once their handshake completes.
pub struct Listener {
    inner: Arc<ServerInner>,
}

/// A QUIC listener accepting sessions as soon as early data can be read,
/// which may be before the TLS handshake completes.
pub struct EarlyListener {
    inner: Arc<ServerInner>,
}

/// Creates a listener on a freshly bound UDP socket.
///
/// The TLS configuration must advertise at least one ALPN protocol. Closing
/// the listener tears down the socket.
pub async fn listen_addr(
    addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
    config: Option<Config>,
    sessions: SessionFactory,
) -> Result<Listener, ListenError> {
    let socket = UdpSocket::bind(addr).await?;
    Ok(Listener {
        inner: bind(socket, tls_config, config, sessions, false, true)?,
    })
}

/// Like [`listen_addr`], but sessions become acceptable at early-data time.
pub async fn listen_addr_early(
    addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
    config: Option<Config>,
    sessions: SessionFactory,
) -> Result<EarlyListener, ListenError> {
    let socket = UdpSocket::bind(addr).await?;
    Ok(EarlyListener {
        inner: bind(socket, tls_config, config, sessions, true, true)?,
    })
}

/// Creates a listener over a caller-provided socket.
///
/// The socket stays open when the listener is closed; the caller owns it.
/// Must be called within a tokio runtime.
pub fn listen(
    socket: UdpSocket,
    tls_config: Arc<rustls::ServerConfig>,
    config: Option<Config>,
    sessions: SessionFactory,
) -> Result<Listener, ListenError> {
    Ok(Listener {
        inner: bind(socket, tls_config, config, sessions, false, false)?,
    })
}

/// Like [`listen`], but sessions become acceptable at early-data time.
pub fn listen_early(
    socket: UdpSocket,
    tls_config: Arc<rustls::ServerConfig>,
    config: Option<Config>,
    sessions: SessionFactory,
) -> Result<EarlyListener, ListenError> {
    Ok(EarlyListener {
        inner: bind(socket, tls_config, config, sessions, true, false)?,
    })
}

/// Creates a listener over an externally managed demultiplexer.
///
/// `socket` is used for replies only; datagram intake is whatever the
/// demultiplexer routes to the listener via
/// [`UnknownPacketHandler::handle_packet`].
pub fn listen_with(
    demux: Arc<dyn Demultiplexer>,
    socket: Arc<UdpSocket>,
    tls_config: Arc<rustls::ServerConfig>,
    config: Option<Config>,
    sessions: SessionFactory,
) -> Result<Listener, ListenError> {
    Ok(Listener {
        inner: ServerInner::start(demux, socket, tls_config, config, sessions, false, false)?,
    })
}

fn bind(
    socket: UdpSocket,
    tls_config: Arc<rustls::ServerConfig>,
    config: Option<Config>,
    sessions: SessionFactory,
    accept_early: bool,
    created_socket: bool,
) -> Result<Arc<ServerInner>, ListenError> {
    let config = populate_server_config(config);
    validate_server_config(&config)?;
    let socket = Arc::new(socket);
    let demux = PacketHandlerMap::new(
        socket.clone(),
        config.connection_id_length,
        config.stateless_reset_key.as_deref(),
    );
    ServerInner::start(
        demux,
        socket,
        tls_config,
        Some(config),
        sessions,
        accept_early,
        created_socket,
    )
}

impl Listener {
    /// Returns the next session whose handshake has completed.
    ///
    /// Multiple concurrent callers are served in FIFO order. Dropping the
    /// returned future abandons nothing; a session not yet received stays
    /// queued. After [`close`](Listener::close), returns the listener's
    /// terminal error.
    pub async fn accept(&self) -> Result<Arc<dyn Session>, ServerError> {
        self.inner.accept().await
    }

    /// Shuts the listener down. Idempotent; established sessions continue.
    pub fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    /// The local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }
}

impl EarlyListener {
    /// Returns the next session that is ready for early data.
    pub async fn accept(&self) -> Result<Arc<dyn Session>, ServerError> {
        self.inner.accept().await
    }

    /// Shuts the listener down. Idempotent; established sessions continue.
    pub fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    /// The local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }
}

/// Errors creating a listener
#[derive(Debug, Error)]
pub enum ListenError {
    /// QUIC requires ALPN; a TLS configuration without it can never
    /// complete a handshake
    #[error("TLS configuration must advertise at least one ALPN protocol")]
    MissingAlpn,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Terminal listener errors, as returned by `accept` once the listener is
/// closed or its socket has died
#[derive(Debug, Error, Clone)]
pub enum ServerError {
    #[error("server closed")]
    Closed,
    #[error("listener I/O error: {0}")]
    Io(Arc<io::Error>),
}

struct ListenerState {
    closed: bool,
    error: Option<ServerError>,
}

pub(crate) struct ServerInner {
    config: Arc<Config>,
    accept_token: AcceptToken,
    tls_config: Arc<rustls::ServerConfig>,
    socket: Arc<UdpSocket>,
    created_socket: bool,
    accept_early: bool,
    demux: Arc<dyn Demultiplexer>,
    token_generator: Arc<TokenGenerator>,
    new_session: SessionFactory,
    packet_tx: mpsc::Sender<ReceivedPacket>,
    session_queue_tx: mpsc::Sender<Arc<dyn Session>>,
    session_queue_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<dyn Session>>>,
    /// Sessions offered to `accept` but not yet consumed. Read by the
    /// admission check; written by handoff tasks and `accept`.
    queue_len: AtomicUsize,
    state: Mutex<ListenerState>,
    close_signal: watch::Sender<bool>,
    reply_limiter: Arc<Semaphore>,
}

impl ServerInner {
    pub(crate) fn start(
        demux: Arc<dyn Demultiplexer>,
        socket: Arc<UdpSocket>,
        tls_config: Arc<rustls::ServerConfig>,
        config: Option<Config>,
        sessions: SessionFactory,
        accept_early: bool,
        created_socket: bool,
    ) -> Result<Arc<Self>, ListenError> {
        if tls_config.alpn_protocols.is_empty() {
            return Err(ListenError::MissingAlpn);
        }
        let config = populate_server_config(config);
        validate_server_config(&config)?;
        let accept_token = config
            .accept_token
            .clone()
            .unwrap_or_else(|| Arc::new(default_accept_token));

        let (packet_tx, packet_rx) = mpsc::channel(RECEIVED_PACKETS_BOUND);
        let (session_queue_tx, session_queue_rx) = mpsc::channel(1);
        let (close_signal, _) = watch::channel(false);
        let inner = Arc::new(Self {
            config: Arc::new(config),
            accept_token,
            tls_config,
            socket,
            created_socket,
            accept_early,
            demux: demux.clone(),
            token_generator: Arc::new(TokenGenerator::new()),
            new_session: sessions,
            packet_tx,
            session_queue_tx,
            session_queue_rx: tokio::sync::Mutex::new(session_queue_rx),
            queue_len: AtomicUsize::new(0),
            state: Mutex::new(ListenerState {
                closed: false,
                error: None,
            }),
            close_signal,
            reply_limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_REPLIES)),
        });
        tokio::spawn(inner.clone().run_intake(packet_rx));
        demux.set_server(inner.clone());
        debug!(
            addr = ?inner.socket.local_addr().ok(),
            early = accept_early,
            "listening for QUIC connections"
        );
        Ok(inner)
    }

    async fn run_intake(self: Arc<Self>, mut packets: mpsc::Receiver<ReceivedPacket>) {
        let mut closed = self.close_signal.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return,
                packet = packets.recv() => match packet {
                    Some(packet) => self.process_packet(packet),
                    None => return,
                },
            }
        }
    }

    /// Classifies one unknown-CID datagram and decides its fate. Never
    /// blocks: replies and session work are spawned onto their own tasks.
    fn process_packet(self: &Arc<Self>, packet: ReceivedPacket) {
        if packet.data().len() < MIN_INITIAL_PACKET_SIZE {
            trace!(
                len = packet.data().len(),
                "dropping datagram too small to be a valid Initial"
            );
            self.packet_dropped(&packet, DropReason::TooSmall);
            return;
        }
        let header = match Header::decode(
            packet.data(),
            self.config.connection_id_length,
            &self.config.versions,
        ) {
            Ok(header) => header,
            Err(PacketDecodeError::UnsupportedVersion {
                version,
                dst_cid,
                src_cid,
            }) => {
                trace!(version, "client offered unsupported version, sending version negotiation");
                self.send_version_negotiation(packet.remote_addr, version, dst_cid, src_cid);
                return;
            }
            Err(e) => {
                debug!(error = %e, "dropping undecodable packet");
                self.packet_dropped(&packet, DropReason::MalformedHeader);
                return;
            }
        };
        match header {
            Header::Initial {
                version,
                dst_cid,
                src_cid,
                token,
                ..
            } => self.handle_initial(packet, version, dst_cid, src_cid, token),
            Header::Short { .. } => {
                // No session, so nothing to reset safely: the peer may never
                // have been given a stateless reset token.
                trace!("dropping short header packet for unknown connection");
                self.packet_dropped(&packet, DropReason::ShortHeader);
            }
            Header::Long { ty, .. } => {
                debug!(%ty, "dropping long header packet for unknown connection");
                self.packet_dropped(&packet, DropReason::UnexpectedPacketType);
            }
            Header::Retry { .. } | Header::VersionNegotiate { .. } => {
                self.packet_dropped(&packet, DropReason::UnexpectedPacketType);
            }
        }
    }

    fn handle_initial(
        self: &Arc<Self>,
        packet: ReceivedPacket,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_bytes: Bytes,
    ) {
        if token_bytes.is_empty() && dst_cid.len() < MIN_INITIAL_DST_CID_LEN {
            debug!(
                len = dst_cid.len(),
                "dropping Initial with too-short connection ID"
            );
            self.packet_dropped(&packet, DropReason::InitialDstCidTooShort);
            return;
        }

        let mut token = None;
        let mut orig_dst_cid = dst_cid;
        if !token_bytes.is_empty() {
            // Undecodable tokens are treated as absent: they may come from a
            // previous process or an incompatible neighbor behind the same
            // address, and the client deserves a Retry rather than a drop.
            if let Ok(decoded) = self.token_generator.decode_token(&token_bytes) {
                if let Some(cid) = decoded.original_dcid {
                    orig_dst_cid = cid;
                }
                token = Some(decoded);
            }
        }

        if !(self.accept_token)(&packet.remote_addr, token.as_ref()) {
            self.send_retry(packet.remote_addr, version, dst_cid, src_cid);
            return;
        }

        let queue_len = self.queue_len.load(Ordering::SeqCst);
        if queue_len >= MAX_ACCEPT_QUEUE_SIZE {
            debug!(queue_len, "rejecting new connection, server busy");
            if let Some(tracer) = &self.config.tracer {
                tracer.connection_refused(packet.remote_addr);
            }
            self.send_server_busy(packet.remote_addr, version, dst_cid, src_cid);
            return;
        }

        let server_scid =
            ConnectionId::random(&mut rand::thread_rng(), self.config.connection_id_length);
        trace!(scid = %server_scid, "issuing connection ID");
        let session = (self.new_session)(SessionParams {
            remote_addr: packet.remote_addr,
            orig_dst_cid,
            client_dst_cid: dst_cid,
            dst_cid: src_cid,
            src_cid: server_scid,
            stateless_reset_token: self.demux.stateless_reset_token(&server_scid),
            version,
            tls_config: self.tls_config.clone(),
            config: self.config.clone(),
            token_generator: self.token_generator.clone(),
            early_data_enabled: self.accept_early,
        });
        if !self.demux.add(dst_cid, session.clone()) {
            // A concurrent duplicate of this Initial already created the
            // session; this copy and its packet are discarded.
            debug!(dcid = %dst_cid, "dropping duplicate Initial");
            self.packet_dropped(&packet, DropReason::DuplicateConnectionId);
            return;
        }
        self.demux.add(server_scid, session.clone());
        // Registration precedes dispatch, so packets the demultiplexer
        // routes from here on cannot overtake the Initial.
        session.handle_packet(packet);
        let driver = session.clone();
        tokio::spawn(async move {
            if let Err(error) = driver.run().await {
                debug!(%error, "session terminated");
            }
        });
        tokio::spawn(self.clone().deliver_session(session));
    }

    /// Holds an admitted session until it is ready for the application,
    /// then offers it to `accept`. Sessions that die first vanish silently.
    async fn deliver_session(self: Arc<Self>, session: Arc<dyn Session>) {
        let mut ready = if self.accept_early {
            session.early_ready()
        } else {
            session.handshake_complete()
        };
        let mut closed = session.closed();
        tokio::select! {
            result = ready.wait_for(|ready| *ready) => {
                if result.is_err() {
                    // Signal source dropped: the session is gone
                    return;
                }
            }
            _ = closed_or_lost(&mut closed) => return,
        }

        self.queue_len.fetch_add(1, Ordering::SeqCst);
        let mut closed = session.closed();
        tokio::select! {
            result = self.session_queue_tx.send(session.clone()) => {
                if result.is_err() {
                    self.queue_len.fetch_sub(1, Ordering::SeqCst);
                }
            }
            _ = closed_or_lost(&mut closed) => {
                // Died while waiting to be accepted
                self.queue_len.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    async fn accept(self: &Arc<Self>) -> Result<Arc<dyn Session>, ServerError> {
        let mut closed = self.close_signal.subscribe();
        let mut queue = self.session_queue_rx.lock().await;
        tokio::select! {
            // Checked first: once the listener is closed, queued sessions
            // must not surface.
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(self.server_error()),
            session = queue.recv() => match session {
                Some(session) => {
                    self.queue_len.fetch_sub(1, Ordering::SeqCst);
                    Ok(session)
                }
                None => Err(self.server_error()),
            },
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        self.demux.close_server();
        if state.error.is_none() {
            state.error = Some(ServerError::Closed);
        }
        let mut result = Ok(());
        if self.created_socket {
            result = self.demux.destroy();
        }
        state.closed = true;
        let _ = self.close_signal.send(true);
        result
    }

    fn server_error(&self) -> ServerError {
        self.state
            .lock()
            .unwrap()
            .error
            .clone()
            .unwrap_or(ServerError::Closed)
    }

    fn packet_dropped(&self, packet: &ReceivedPacket, reason: DropReason) {
        if let Some(tracer) = &self.config.tracer {
            tracer.packet_dropped(packet.remote_addr, reason);
        }
    }

    fn send_version_negotiation(
        &self,
        remote: SocketAddr,
        offered: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    ) {
        let buf = reply::compose_version_negotiation(
            &mut rand::thread_rng(),
            offered,
            &dst_cid,
            &src_cid,
            &self.config.versions,
        );
        self.send_reply(remote, buf, ReplyKind::VersionNegotiation);
    }

    fn send_retry(
        &self,
        remote: SocketAddr,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    ) {
        let token = self.token_generator.new_retry_token(&remote, &dst_cid);
        let server_scid =
            ConnectionId::random(&mut rand::thread_rng(), self.config.connection_id_length);
        trace!(scid = %server_scid, "sending Retry");
        let buf = reply::compose_retry(version, &dst_cid, &src_cid, &server_scid, &token);
        self.send_reply(remote, buf, ReplyKind::Retry);
    }

    fn send_server_busy(
        &self,
        remote: SocketAddr,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    ) {
        let buf = reply::compose_server_busy(version, &dst_cid, &src_cid);
        self.send_reply(remote, buf, ReplyKind::ServerBusy);
    }

    /// Ships one reply datagram on its own task. Failures are logged and
    /// forgotten: the client retransmits its Initial and we try again.
    fn send_reply(&self, remote: SocketAddr, buf: Vec<u8>, kind: ReplyKind) {
        let permit = match self.reply_limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(%kind, "dropping reply, fan-out limit reached");
                return;
            }
        };
        let socket = self.socket.clone();
        let tracer = self.config.tracer.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match socket.send_to(&buf, remote).await {
                Ok(_) => {
                    if let Some(tracer) = tracer {
                        match kind {
                            ReplyKind::Retry => tracer.retry_sent(remote),
                            ReplyKind::VersionNegotiation => {
                                tracer.version_negotiation_sent(remote)
                            }
                            ReplyKind::ServerBusy => {}
                        }
                    }
                }
                Err(error) => debug!(%remote, %error, %kind, "failed to send reply"),
            }
        });
    }
}

/// Resolves when the session is closed, including when its signal source
/// has been dropped outright.
async fn closed_or_lost(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

impl UnknownPacketHandler for ServerInner {
    fn handle_packet(&self, packet: ReceivedPacket) {
        match self.packet_tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                trace!("dropping packet, intake queue full");
                self.packet_dropped(&packet, DropReason::QueueFull);
            }
            // Intake has shut down; nothing left to do with the packet
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn set_close_error(&self, error: ServerError) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        state.error = Some(error);
        let _ = self.close_signal.send(true);
    }
}

#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    Retry,
    VersionNegotiation,
    ServerBusy,
}

impl std::fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyKind::Retry => f.write_str("Retry"),
            ReplyKind::VersionNegotiation => f.write_str("Version Negotiation"),
            ReplyKind::ServerBusy => f.write_str("server busy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::coding::BufMutExt;
    use crate::crypto::{self, is_valid_retry, TAG_LEN};
    use crate::session::SessionError;
    use crate::{Side, VERSION_1};
    use std::collections::HashMap;
    use std::future::Future;
    use std::net::Ipv4Addr;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct TestSession {
        params: SessionParams,
        packets: Mutex<Vec<usize>>,
        handshake: watch::Sender<bool>,
        early: watch::Sender<bool>,
        closed_tx: watch::Sender<bool>,
    }

    impl TestSession {
        fn new(params: SessionParams) -> Arc<Self> {
            Arc::new(Self {
                params,
                packets: Mutex::new(Vec::new()),
                handshake: watch::channel(false).0,
                early: watch::channel(false).0,
                closed_tx: watch::channel(false).0,
            })
        }

        fn complete_handshake(&self) {
            let _ = self.handshake.send(true);
        }

        fn ready_early(&self) {
            let _ = self.early.send(true);
        }

        fn kill(&self) {
            let _ = self.closed_tx.send(true);
        }
    }

    impl PacketHandler for TestSession {
        fn handle_packet(&self, packet: ReceivedPacket) {
            self.packets.lock().unwrap().push(packet.data().len());
        }
    }

    impl Session for TestSession {
        fn run(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send>> {
            Box::pin(async move {
                let mut closed = self.closed_tx.subscribe();
                let _ = closed.wait_for(|closed| *closed).await;
                Ok(())
            })
        }

        fn destroy(&self, _error: SessionError) {
            self.kill();
        }

        fn shutdown(&self) {
            self.kill();
        }

        fn handshake_complete(&self) -> watch::Receiver<bool> {
            self.handshake.subscribe()
        }

        fn early_ready(&self) -> watch::Receiver<bool> {
            self.early.subscribe()
        }

        fn closed(&self) -> watch::Receiver<bool> {
            self.closed_tx.subscribe()
        }

        fn close_for_recreate(&self) -> u64 {
            self.kill();
            0
        }
    }

    #[derive(Default)]
    struct TestDemux {
        handlers: Mutex<HashMap<ConnectionId, Arc<dyn PacketHandler>>>,
        server: Mutex<Option<Arc<dyn UnknownPacketHandler>>>,
    }

    impl TestDemux {
        fn registered(&self) -> usize {
            self.handlers.lock().unwrap().len()
        }

        fn has(&self, cid: &ConnectionId) -> bool {
            self.handlers.lock().unwrap().contains_key(cid)
        }
    }

    impl Demultiplexer for TestDemux {
        fn add(&self, cid: ConnectionId, handler: Arc<dyn PacketHandler>) -> bool {
            use std::collections::hash_map::Entry;
            match self.handlers.lock().unwrap().entry(cid) {
                Entry::Occupied(_) => false,
                Entry::Vacant(e) => {
                    e.insert(handler);
                    true
                }
            }
        }

        fn remove(&self, cid: &ConnectionId) {
            self.handlers.lock().unwrap().remove(cid);
        }

        fn stateless_reset_token(&self, cid: &ConnectionId) -> [u8; 16] {
            [cid.first().copied().unwrap_or(0); 16]
        }

        fn set_server(&self, server: Arc<dyn UnknownPacketHandler>) {
            *self.server.lock().unwrap() = Some(server);
        }

        fn close_server(&self) {
            *self.server.lock().unwrap() = None;
        }

        fn destroy(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTracer {
        drops: Mutex<Vec<DropReason>>,
        refused: AtomicUsize,
    }

    impl EndpointTracer for RecordingTracer {
        fn packet_dropped(&self, _remote: SocketAddr, reason: DropReason) {
            self.drops.lock().unwrap().push(reason);
        }

        fn connection_refused(&self, _remote: SocketAddr) {
            self.refused.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        inner: Arc<ServerInner>,
        demux: Arc<TestDemux>,
        tracer: Arc<RecordingTracer>,
        client: UdpSocket,
        client_addr: SocketAddr,
        sessions: Arc<Mutex<Vec<Arc<TestSession>>>>,
        pool: Arc<BufferPool>,
    }

    impl Harness {
        async fn new(mut config: Config, accept_early: bool) -> Self {
            let server_socket = Arc::new(
                UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
                    .await
                    .unwrap(),
            );
            let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            client
                .connect(server_socket.local_addr().unwrap())
                .await
                .unwrap();
            let client_addr = client.local_addr().unwrap();

            let tracer = Arc::new(RecordingTracer::default());
            config.tracer = Some(tracer.clone());
            let demux = Arc::new(TestDemux::default());
            let sessions = Arc::new(Mutex::new(Vec::new()));
            let created = sessions.clone();
            let factory: SessionFactory =
                Arc::new(move |params: SessionParams| -> Arc<dyn Session> {
                    let session = TestSession::new(params);
                    created.lock().unwrap().push(session.clone());
                    session
                });
            let inner = ServerInner::start(
                demux.clone(),
                server_socket,
                test_tls_config(),
                Some(config),
                factory,
                accept_early,
                false,
            )
            .unwrap();
            Self {
                inner,
                demux,
                tracer,
                client,
                client_addr,
                sessions,
                pool: BufferPool::new(),
            }
        }

        fn feed(&self, data: &[u8]) {
            let mut buffer = self.pool.get();
            buffer.data_mut()[..data.len()].copy_from_slice(data);
            buffer.data_mut().truncate(data.len());
            UnknownPacketHandler::handle_packet(
                &*self.inner,
                ReceivedPacket::new(self.client_addr, buffer),
            );
        }

        async fn reply(&self) -> Option<Vec<u8>> {
            let mut buf = vec![0u8; 2048];
            match timeout(Duration::from_secs(2), self.client.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    Some(buf)
                }
                _ => None,
            }
        }

        async fn assert_no_reply(&self) {
            let mut buf = vec![0u8; 2048];
            assert!(
                timeout(Duration::from_millis(200), self.client.recv(&mut buf))
                    .await
                    .is_err(),
                "unexpected reply datagram"
            );
        }

        fn session_count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }

        fn session(&self, i: usize) -> Arc<TestSession> {
            self.sessions.lock().unwrap()[i].clone()
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("never happened: {what}");
    }

    fn test_tls_config() -> Arc<rustls::ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = rustls::PrivateKey(cert.serialize_private_key_der());
        let cert = rustls::Certificate(cert.serialize_der().unwrap());
        let mut config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        config.alpn_protocols = vec![b"hq-interop".to_vec()];
        Arc::new(config)
    }

    fn accept_all() -> Config {
        let accept: AcceptToken = Arc::new(|_, _| true);
        Config {
            accept_token: Some(accept),
            ..Config::default()
        }
    }

    fn build_initial(version: u32, dcid: &[u8], scid: &[u8], token: &[u8], size: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write(0xc3u8);
        buf.write(version);
        buf.push(dcid.len() as u8);
        buf.extend_from_slice(dcid);
        buf.push(scid.len() as u8);
        buf.extend_from_slice(scid);
        buf.write_var(token.len() as u64);
        buf.extend_from_slice(token);
        buf.write_var(1100);
        assert!(buf.len() < size);
        buf.resize(size, 0);
        buf
    }

    const CLIENT_DCID: [u8; 8] = [0x11; 8];
    const CLIENT_SCID: [u8; 5] = [0x22; 5];

    #[tokio::test]
    async fn happy_path_creates_and_accepts_session() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        eventually("session created", || h.session_count() == 1).await;

        let session = h.session(0);
        assert_eq!(&session.params.orig_dst_cid[..], &CLIENT_DCID);
        assert_eq!(&session.params.client_dst_cid[..], &CLIENT_DCID);
        assert_eq!(&session.params.dst_cid[..], &CLIENT_SCID);
        assert_eq!(session.params.src_cid.len(), 4);
        assert_eq!(session.params.version, VERSION_1);
        // Registered under the client's DCID and the issued SCID, and the
        // triggering packet was dispatched to the session.
        assert_eq!(h.demux.registered(), 2);
        assert!(h.demux.has(&ConnectionId::new(&CLIENT_DCID)));
        assert!(h.demux.has(&session.params.src_cid));
        eventually("packet dispatched", || {
            *session.packets.lock().unwrap() == vec![1200]
        })
        .await;

        // Not acceptable until the handshake completes
        assert!(
            timeout(Duration::from_millis(200), h.inner.accept())
                .await
                .is_err()
        );
        session.complete_handshake();
        let accepted = timeout(Duration::from_secs(5), h.inner.accept())
            .await
            .expect("accept timed out")
            .expect("accept failed");
        assert!(*accepted.handshake_complete().borrow());
        eventually("queue drained", || {
            h.inner.queue_len.load(Ordering::SeqCst) == 0
        })
        .await;
    }

    #[tokio::test]
    async fn tokenless_initial_gets_retry_then_session() {
        // Default accept_token: no token means Retry
        let h = Harness::new(Config::default(), false).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));

        let retry = h.reply().await.expect("no Retry received");
        assert_eq!(h.session_count(), 0);
        let (retry_scid, token) = match Header::decode(&retry, 4, &[VERSION_1]).unwrap() {
            Header::Retry {
                version,
                dst_cid,
                src_cid,
            } => {
                assert_eq!(version, VERSION_1);
                assert_eq!(&dst_cid[..], &CLIENT_SCID);
                let token_start = 7 + dst_cid.len() + src_cid.len();
                (src_cid, retry[token_start..retry.len() - TAG_LEN].to_vec())
            }
            h => panic!("expected Retry, got {:?}", h),
        };
        // Integrity tag binds the client's original DCID
        assert!(is_valid_retry(&ConnectionId::new(&CLIENT_DCID), &retry));
        assert!(!token.is_empty());

        // Second Initial: DCID is the Retry's SCID, token echoed
        h.feed(&build_initial(
            VERSION_1,
            &retry_scid,
            &CLIENT_SCID,
            &token,
            1200,
        ));
        eventually("session created after token validation", || {
            h.session_count() == 1
        })
        .await;
        let session = h.session(0);
        // The original DCID is recovered from the token
        assert_eq!(&session.params.orig_dst_cid[..], &CLIENT_DCID);
        assert_eq!(session.params.client_dst_cid, retry_scid);
    }

    #[tokio::test]
    async fn unsupported_version_gets_version_negotiation() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(
            0x1a2a_3a4a,
            &CLIENT_DCID,
            &CLIENT_SCID,
            b"",
            1200,
        ));

        let vn = h.reply().await.expect("no Version Negotiation received");
        assert_eq!(h.session_count(), 0);
        assert_eq!(vn[0] & 0x80, 0x80);
        assert_eq!(&vn[1..5], &[0, 0, 0, 0]);
        let dcil = vn[5] as usize;
        assert_eq!(&vn[6..6 + dcil], &CLIENT_SCID);
        let scil_at = 6 + dcil;
        let scil = vn[scil_at] as usize;
        assert_eq!(&vn[scil_at + 1..scil_at + 1 + scil], &CLIENT_DCID);
        let mut versions = Vec::new();
        for chunk in vn[scil_at + 1 + scil..].chunks(4) {
            versions.push(u32::from_be_bytes(chunk.try_into().unwrap()));
        }
        assert!(versions.contains(&VERSION_1));
        assert!(!versions.contains(&0x1a2a_3a4a));
    }

    #[tokio::test]
    async fn full_accept_queue_rejects_with_server_busy() {
        let h = Harness::new(accept_all(), false).await;
        for i in 0..MAX_ACCEPT_QUEUE_SIZE {
            let mut dcid = [0u8; 8];
            dcid[..2].copy_from_slice(&(i as u16).to_be_bytes());
            dcid[2..].copy_from_slice(&[0xee; 6]);
            h.feed(&build_initial(VERSION_1, &dcid, &CLIENT_SCID, b"", 1200));
            eventually("session created", || h.session_count() == i + 1).await;
            h.session(i).complete_handshake();
        }
        eventually("accept queue filled", || {
            h.inner.queue_len.load(Ordering::SeqCst) == MAX_ACCEPT_QUEUE_SIZE
        })
        .await;

        let busy_dcid = [0xdd; 8];
        h.feed(&build_initial(VERSION_1, &busy_dcid, &CLIENT_SCID, b"", 1200));
        let mut busy = h.reply().await.expect("no server-busy reply received");
        assert_eq!(h.session_count(), MAX_ACCEPT_QUEUE_SIZE);
        assert_eq!(h.tracer.refused.load(Ordering::SeqCst), 1);

        // Decrypt as the client would: Initial keys from its own DCID
        let keys = crypto::initial_keys(&ConnectionId::new(&busy_dcid), Side::Client);
        let pn_offset = busy.len() - (4 + 4 + TAG_LEN);
        let pn_len = keys.remote.unprotect_header(pn_offset, &mut busy);
        assert_eq!(pn_len, 4);
        let (header, payload) = busy.split_at_mut(pn_offset + 4);
        let n = keys.remote.open(0, header, payload).unwrap();
        assert_eq!(&payload[..n], &[0x1c, 0x02, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn duplicate_initial_creates_one_registered_session() {
        let h = Harness::new(accept_all(), false).await;
        let initial = build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200);
        h.feed(&initial);
        h.feed(&initial);
        eventually("duplicate observed", || {
            h.tracer
                .drops
                .lock()
                .unwrap()
                .contains(&DropReason::DuplicateConnectionId)
        })
        .await;

        // The duplicate's session was discarded before registration
        let first = h.session(0);
        assert_eq!(h.demux.registered(), 2);
        assert!(h.demux.has(&first.params.src_cid));
        assert_eq!(first.packets.lock().unwrap().len(), 1);
        for i in 1..h.session_count() {
            assert!(!h.demux.has(&h.session(i).params.src_cid));
            assert!(h.session(i).packets.lock().unwrap().is_empty());
        }

        // Only the surviving session is ever surfaced
        first.complete_handshake();
        timeout(Duration::from_secs(5), h.inner.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(
            timeout(Duration::from_millis(200), h.inner.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn undersized_datagram_is_ignored() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1199));
        eventually("drop recorded", || {
            h.tracer.drops.lock().unwrap().contains(&DropReason::TooSmall)
        })
        .await;
        assert_eq!(h.session_count(), 0);
        h.assert_no_reply().await;
    }

    #[tokio::test]
    async fn malformed_header_does_not_kill_intake() {
        let h = Harness::new(accept_all(), false).await;
        let mut garbage = vec![0xc3, 0, 0, 0, 1, 0xff];
        garbage.resize(1200, 0xff);
        h.feed(&garbage);
        eventually("malformed drop recorded", || {
            h.tracer
                .drops
                .lock()
                .unwrap()
                .contains(&DropReason::MalformedHeader)
        })
        .await;
        h.assert_no_reply().await;

        // Intake keeps running: a valid Initial still creates a session
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        eventually("session created after garbage", || h.session_count() == 1).await;
    }

    #[tokio::test]
    async fn short_header_and_non_initial_long_headers_dropped() {
        let h = Harness::new(accept_all(), false).await;
        let mut short = vec![0x40u8];
        short.resize(1200, 0x07);
        h.feed(&short);
        eventually("short header drop", || {
            h.tracer.drops.lock().unwrap().contains(&DropReason::ShortHeader)
        })
        .await;

        // Handshake packet for an unknown connection
        let mut handshake = build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200);
        handshake[0] = 0xe3;
        h.feed(&handshake);
        eventually("non-initial drop", || {
            h.tracer
                .drops
                .lock()
                .unwrap()
                .contains(&DropReason::UnexpectedPacketType)
        })
        .await;
        assert_eq!(h.session_count(), 0);
        h.assert_no_reply().await;
    }

    #[tokio::test]
    async fn tokenless_short_dcid_is_dropped() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(VERSION_1, &[0x11; 7], &CLIENT_SCID, b"", 1200));
        eventually("short DCID drop", || {
            h.tracer
                .drops
                .lock()
                .unwrap()
                .contains(&DropReason::InitialDstCidTooShort)
        })
        .await;
        assert_eq!(h.session_count(), 0);
        h.assert_no_reply().await;
    }

    #[tokio::test]
    async fn early_listener_accepts_at_early_ready() {
        let h = Harness::new(accept_all(), true).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        eventually("session created", || h.session_count() == 1).await;
        let session = h.session(0);
        assert!(session.params.early_data_enabled);

        assert!(
            timeout(Duration::from_millis(200), h.inner.accept())
                .await
                .is_err()
        );
        session.ready_early();
        timeout(Duration::from_secs(5), h.inner.accept())
            .await
            .expect("accept timed out")
            .expect("accept failed");
    }

    #[tokio::test]
    async fn normal_listener_ignores_early_ready() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        eventually("session created", || h.session_count() == 1).await;
        h.session(0).ready_early();
        assert!(
            timeout(Duration::from_millis(200), h.inner.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn session_death_before_ready_is_silent() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        eventually("session created", || h.session_count() == 1).await;
        h.session(0).kill();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.inner.queue_len.load(Ordering::SeqCst), 0);
        assert!(
            timeout(Duration::from_millis(200), h.inner.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unblocks_accept() {
        let h = Harness::new(accept_all(), false).await;
        let inner = h.inner.clone();
        let pending = tokio::spawn(async move { inner.accept().await });
        sleep(Duration::from_millis(50)).await;

        h.inner.close().unwrap();
        let result = timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ServerError::Closed)));
        // Unknown-CID routing is withdrawn from the demultiplexer
        assert!(h.demux.server.lock().unwrap().is_none());
        // Idempotent
        h.inner.close().unwrap();
        assert!(matches!(h.inner.accept().await, Err(ServerError::Closed)));

        // Packets after close create nothing
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.session_count(), 0);
    }

    #[tokio::test]
    async fn queued_session_not_surfaced_after_close() {
        let h = Harness::new(accept_all(), false).await;
        h.feed(&build_initial(VERSION_1, &CLIENT_DCID, &CLIENT_SCID, b"", 1200));
        eventually("session created", || h.session_count() == 1).await;
        h.session(0).complete_handshake();
        eventually("session queued", || {
            h.inner.queue_len.load(Ordering::SeqCst) == 1
        })
        .await;

        h.inner.close().unwrap();
        assert!(matches!(h.inner.accept().await, Err(ServerError::Closed)));
    }

    #[tokio::test]
    async fn fatal_socket_error_reaches_accept() {
        let h = Harness::new(accept_all(), false).await;
        UnknownPacketHandler::set_close_error(
            &*h.inner,
            ServerError::Io(Arc::new(io::Error::new(io::ErrorKind::Other, "socket died"))),
        );
        match h.inner.accept().await {
            Err(ServerError::Io(e)) => assert_eq!(e.to_string(), "socket died"),
            r => panic!("unexpected accept result: {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rejects_tls_config_without_alpn() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = rustls::PrivateKey(cert.serialize_private_key_der());
        let cert = rustls::Certificate(cert.serialize_der().unwrap());
        let tls = Arc::new(
            rustls::ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(vec![cert], key)
                .unwrap(),
        );
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let factory: SessionFactory =
            Arc::new(|params: SessionParams| -> Arc<dyn Session> { TestSession::new(params) });
        let result = ServerInner::start(
            Arc::new(TestDemux::default()),
            socket,
            tls,
            None,
            factory,
            false,
            false,
        );
        assert!(matches!(result, Err(ListenError::MissingAlpn)));
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let factory: SessionFactory =
            Arc::new(|params: SessionParams| -> Arc<dyn Session> { TestSession::new(params) });
        let result = ServerInner::start(
            Arc::new(TestDemux::default()),
            socket,
            test_tls_config(),
            Some(Config {
                versions: vec![0x0bad_0bad],
                ..Config::default()
            }),
            factory,
            false,
            false,
        );
        assert!(matches!(result, Err(ListenError::Config(_))));
    }
}
