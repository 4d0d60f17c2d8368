//! Server-side connection admission for a QUIC endpoint.
//!
//! This crate owns the intake half of a QUIC server: it reads datagrams from
//! a UDP socket, routes them to established sessions by connection ID, and
//! runs the admission handshake for new peers: address validation with
//! stateless Retry tokens, version negotiation, and server-busy backpressure.
//! Admitted sessions are handed to the application through
//! [`Listener::accept`] once their handshake completes (or, for an
//! [`EarlyListener`], as soon as early data can be read).
//!
//! The per-session QUIC state machine and the TLS stack are collaborators,
//! not part of this crate: sessions are created through a [`SessionFactory`]
//! and driven behind the [`Session`] trait.

mod buffer;
mod cid;
mod coding;
mod config;
mod crypto;
mod demux;
mod frame;
mod packet;
mod reply;
mod server;
mod session;
mod ticket;
mod token;

pub use crate::buffer::{BufferPool, PooledBuffer, ReceivedPacket};
pub use crate::cid::ConnectionId;
pub use crate::config::{
    default_accept_token, AcceptToken, Config, ConfigError, DropReason, EndpointTracer,
};
pub use crate::demux::{Demultiplexer, PacketHandler, PacketHandlerMap, UnknownPacketHandler};
pub use crate::server::{
    listen, listen_addr, listen_addr_early, listen_early, listen_with, EarlyListener, ListenError,
    Listener, ServerError,
};
pub use crate::session::{Session, SessionError, SessionFactory, SessionParams};
pub use crate::ticket::{TicketDecodeError, TicketPayload};
pub use crate::token::{Token, TokenGenerator, TokenKind, TokenStore};

/// QUIC version 1 (RFC 9000)
pub const VERSION_1: u32 = 0x0000_0001;

/// Versions this implementation can speak
pub(crate) const SUPPORTED_VERSIONS: &[u32] = &[VERSION_1];

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub(crate) fn is_client(self) -> bool {
        self == Side::Client
    }
}

//
// Useful internal constants
//

pub(crate) const MAX_CID_SIZE: usize = 20;
pub(crate) const MIN_CID_SIZE: usize = 4;
/// Ceiling for CIDs this server issues; peers may use anything up to
/// [`MAX_CID_SIZE`].
pub(crate) const MAX_ISSUED_CID_SIZE: usize = 18;
/// Connection IDs chosen by clients for their first Initial must be at least
/// this long unless they present a token.
pub(crate) const MIN_INITIAL_DST_CID_LEN: usize = 8;
/// Datagrams below this size cannot carry a genuine Initial and are dropped
/// before any state is touched.
pub(crate) const MIN_INITIAL_PACKET_SIZE: usize = 1200;
pub(crate) const MAX_RECEIVE_PACKET_SIZE: usize = 1452;
pub(crate) const MAX_ACCEPT_QUEUE_SIZE: usize = 32;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
