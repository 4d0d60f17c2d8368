use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::token::{Token, TokenKind, TokenStore};
use crate::{MAX_ISSUED_CID_SIZE, MIN_CID_SIZE, SUPPORTED_VERSIONS};

/// How long a Retry token proves address ownership. Clients echo these
/// within one round trip, so the window is tight.
pub(crate) const RETRY_TOKEN_VALIDITY: Duration = Duration::from_secs(5);
/// How long a NEW_TOKEN-frame token stays acceptable.
pub(crate) const TOKEN_VALIDITY: Duration = Duration::from_secs(24 * 3600);

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECTION_ID_LENGTH: usize = 4;
const DEFAULT_MAX_RECEIVE_STREAM_WINDOW: u64 = 6 * (1 << 20);
const DEFAULT_MAX_RECEIVE_CONNECTION_WINDOW: u64 = 15 * (1 << 20);
const DEFAULT_MAX_INCOMING_STREAMS: i64 = 100;
const DEFAULT_MAX_INCOMING_UNI_STREAMS: i64 = 100;

/// Predicate deciding whether an Initial's token is sufficient proof of
/// address ownership, or whether the client must be bounced through a Retry.
pub type AcceptToken = Arc<dyn Fn(&SocketAddr, Option<&Token>) -> bool + Send + Sync>;

/// Listener configuration.
///
/// Zero values mean "use the default"; [`populate_server_config`] resolves
/// them into a fully-populated copy without mutating the caller's value.
#[derive(Clone, Default)]
pub struct Config {
    /// QUIC versions advertised and accepted; empty for the built-in list
    pub versions: Vec<u32>,
    /// Per-session handshake deadline; zero for 10 s
    pub handshake_timeout: Duration,
    /// Idle timeout advertised to peers; zero for 30 s
    pub max_idle_timeout: Duration,
    /// Token gate for new connections; `None` for [`default_accept_token`]
    pub accept_token: Option<AcceptToken>,
    /// Send PING frames to keep idle connections alive
    pub keep_alive: bool,
    /// Per-stream receive window ceiling; zero for the implementation default
    pub max_receive_stream_flow_control_window: u64,
    /// Per-connection receive window ceiling; zero for the implementation default
    pub max_receive_connection_flow_control_window: u64,
    /// Peer-initiated bidirectional stream limit; zero for the default,
    /// negative for none at all
    pub max_incoming_streams: i64,
    /// Peer-initiated unidirectional stream limit; zero for the default,
    /// negative for none at all
    pub max_incoming_uni_streams: i64,
    /// Length of server-issued connection IDs; zero for 4
    pub connection_id_length: usize,
    /// Keys the stateless-reset-token PRF; a fresh random key (resets
    /// unrecognizable across restarts) when absent
    pub stateless_reset_key: Option<Vec<u8>>,
    /// Client-side cache for NEW_TOKEN tokens; servers leave this `None`
    pub token_store: Option<Arc<dyn TokenStore>>,
    /// Sink for admission events; `None` discards them
    pub tracer: Option<Arc<dyn EndpointTracer>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("versions", &self.versions)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("keep_alive", &self.keep_alive)
            .field(
                "max_receive_stream_flow_control_window",
                &self.max_receive_stream_flow_control_window,
            )
            .field(
                "max_receive_connection_flow_control_window",
                &self.max_receive_connection_flow_control_window,
            )
            .field("max_incoming_streams", &self.max_incoming_streams)
            .field("max_incoming_uni_streams", &self.max_incoming_uni_streams)
            .field("connection_id_length", &self.connection_id_length)
            .finish_non_exhaustive()
    }
}

/// Accepts a token that is fresh for its kind and was issued to the
/// client's current IP. No token, or a stale or misaddressed one, triggers
/// a Retry.
pub fn default_accept_token(remote: &SocketAddr, token: Option<&Token>) -> bool {
    let token = match token {
        Some(token) => token,
        None => return false,
    };
    let validity = match token.kind {
        TokenKind::Retry => RETRY_TOKEN_VALIDITY,
        TokenKind::NewToken => TOKEN_VALIDITY,
    };
    match SystemTime::now().duration_since(token.issued_at) {
        Ok(age) if age <= validity => {}
        // Stale, or issued_at claims to be in the future
        _ => return false,
    }
    remote.ip().to_string() == token.remote_ip
}

/// Fills every defaulted field of a server configuration.
///
/// Pure: the input is consumed and a fully-populated value returned; callers
/// holding a copy never observe mutation.
pub(crate) fn populate_server_config(config: Option<Config>) -> Config {
    let mut config = populate_config(config);
    if config.connection_id_length == 0 {
        config.connection_id_length = DEFAULT_CONNECTION_ID_LENGTH;
    }
    if config.accept_token.is_none() {
        config.accept_token = Some(Arc::new(default_accept_token));
    }
    config
}

fn populate_config(config: Option<Config>) -> Config {
    let mut config = config.unwrap_or_default();
    if config.versions.is_empty() {
        config.versions = SUPPORTED_VERSIONS.to_vec();
    }
    if config.handshake_timeout == Duration::ZERO {
        config.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;
    }
    if config.max_idle_timeout == Duration::ZERO {
        config.max_idle_timeout = DEFAULT_MAX_IDLE_TIMEOUT;
    }
    if config.max_receive_stream_flow_control_window == 0 {
        config.max_receive_stream_flow_control_window = DEFAULT_MAX_RECEIVE_STREAM_WINDOW;
    }
    if config.max_receive_connection_flow_control_window == 0 {
        config.max_receive_connection_flow_control_window = DEFAULT_MAX_RECEIVE_CONNECTION_WINDOW;
    }
    config.max_incoming_streams = match config.max_incoming_streams {
        0 => DEFAULT_MAX_INCOMING_STREAMS,
        n if n < 0 => 0,
        n => n,
    };
    config.max_incoming_uni_streams = match config.max_incoming_uni_streams {
        0 => DEFAULT_MAX_INCOMING_UNI_STREAMS,
        n if n < 0 => 0,
        n => n,
    };
    config
}

/// Validates a populated server configuration.
pub(crate) fn validate_server_config(config: &Config) -> Result<(), ConfigError> {
    for &v in &config.versions {
        if !SUPPORTED_VERSIONS.contains(&v) {
            return Err(ConfigError::UnsupportedVersion(v));
        }
    }
    if !(MIN_CID_SIZE..=MAX_ISSUED_CID_SIZE).contains(&config.connection_id_length) {
        return Err(ConfigError::IllegalValue(
            "connection_id_length must be in [4, 18]",
        ));
    }
    Ok(())
}

/// Errors in the configuration of a listener
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
    /// A configured version is not one this implementation can speak
    #[error("{0:#010x} is not a supported QUIC version")]
    UnsupportedVersion(u32),
}

/// Why the admission pipeline discarded a datagram
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DropReason {
    /// Below the 1200-byte Initial minimum
    TooSmall,
    /// Header did not parse
    MalformedHeader,
    /// Short header with no matching session
    ShortHeader,
    /// Long header other than Initial with no matching session
    UnexpectedPacketType,
    /// Tokenless Initial with a DCID under 8 bytes
    InitialDstCidTooShort,
    /// Concurrent duplicate of an Initial that already created a session
    DuplicateConnectionId,
    /// Intake queue was full
    QueueFull,
}

/// Sink for admission-pipeline events.
///
/// All methods default to no-ops; implement the ones of interest.
pub trait EndpointTracer: Send + Sync {
    fn packet_dropped(&self, _remote: SocketAddr, _reason: DropReason) {}
    fn retry_sent(&self, _remote: SocketAddr) {}
    fn version_negotiation_sent(&self, _remote: SocketAddr) {}
    fn connection_refused(&self, _remote: SocketAddr) {}
}
