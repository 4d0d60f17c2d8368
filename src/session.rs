//! The interface the admission core expects from per-session state machines.
//!
//! Sessions are external collaborators: the listener creates them through a
//! [`SessionFactory`], registers their connection IDs, feeds them packets,
//! and watches their signals to decide when to surface them from `accept()`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::cid::ConnectionId;
use crate::config::Config;
use crate::demux::PacketHandler;
use crate::token::TokenGenerator;
use crate::RESET_TOKEN_SIZE;

/// A QUIC session as seen by the listener.
///
/// Signal accessors return fresh [`watch`] subscriptions; a signal is
/// "fired" once its value becomes `true` and never unfires. Implementations
/// must make every method safe to call from the intake task while the
/// session is being driven on its own task.
pub trait Session: PacketHandler {
    /// Drives the session state machine to completion.
    fn run(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send>>;

    /// Tears the session down immediately with `error`; no packets are sent.
    fn destroy(&self, error: SessionError);

    /// Closes the session gracefully.
    fn shutdown(&self);

    /// Fires when the TLS handshake has completed.
    fn handshake_complete(&self) -> watch::Receiver<bool>;

    /// Fires when early data can be read, which may be before
    /// [`handshake_complete`](Session::handshake_complete).
    fn early_ready(&self) -> watch::Receiver<bool>;

    /// Fires when the session is gone for any reason, including handshake
    /// failure or abort.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Winds the session down so the connection can be re-established,
    /// returning the last packet number used so the successor can continue
    /// the sequence.
    fn close_for_recreate(&self) -> u64;
}

/// Everything a factory needs to construct a session for an admitted
/// Initial.
pub struct SessionParams {
    pub remote_addr: SocketAddr,
    /// DCID of the client's very first Initial: recovered from the Retry
    /// token when one was presented, otherwise the DCID of this packet
    pub orig_dst_cid: ConnectionId,
    /// DCID the client chose for this packet; Initial keys derive from it
    pub client_dst_cid: ConnectionId,
    /// The client's source CID, i.e. where our packets should be addressed
    pub dst_cid: ConnectionId,
    /// The CID this server issued for the session
    pub src_cid: ConnectionId,
    pub stateless_reset_token: [u8; RESET_TOKEN_SIZE],
    pub version: u32,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub config: Arc<Config>,
    pub token_generator: Arc<TokenGenerator>,
    /// Whether the listener surfaces the session at early-data time
    pub early_data_enabled: bool,
}

/// Instantiates sessions for admitted connections
pub type SessionFactory = Arc<dyn Fn(SessionParams) -> Arc<dyn Session> + Send + Sync>;

/// Terminal outcome of a session
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    Closed,
}
