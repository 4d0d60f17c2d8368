//! Stateless address-validation tokens.
//!
//! Tokens are an authenticated encryption of `{kind, client IP, issue time,
//! original DCID}` under a key generated once per process. Nothing is looked
//! up on validation; the ciphertext itself is the state. Restarting the
//! process invalidates all outstanding tokens, which is intended: a Retry
//! token is only good for a few seconds anyway.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};
use rand::RngCore;
use ring::aead;
use thiserror::Error;

use crate::cid::ConnectionId;
use crate::coding::BufExt;
use crate::MAX_CID_SIZE;

const NONCE_LEN: usize = 12;

/// How a token reached the client
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TokenKind {
    /// Returned immediately in response to a Retry packet
    Retry,
    /// Delivered in a NEW_TOKEN frame for a future connection
    NewToken,
}

/// Decoded contents of an address-validation token
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Textual form of the IP the token was issued to. Ports are excluded:
    /// NAT rebinding may move the client's port within the validity window.
    pub remote_ip: String,
    pub issued_at: SystemTime,
    /// The DCID from the client's first Initial; present only in Retry
    /// tokens, where the handshake needs it for transport-parameter echo.
    pub original_dcid: Option<ConnectionId>,
}

/// Mints and validates address-validation tokens.
///
/// The key is sampled at construction and never persisted.
pub struct TokenGenerator {
    key: aead::LessSafeKey,
}

impl TokenGenerator {
    pub fn new() -> Self {
        let mut key = [0; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key: aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &key).unwrap()),
        }
    }

    /// Mints the token to embed in a Retry packet.
    pub fn new_retry_token(&self, remote: &SocketAddr, orig_dst_cid: &ConnectionId) -> Vec<u8> {
        self.seal(TokenKind::Retry, remote, Some(orig_dst_cid))
    }

    /// Mints a token for a NEW_TOKEN frame.
    pub fn new_token(&self, remote: &SocketAddr) -> Vec<u8> {
        self.seal(TokenKind::NewToken, remote, None)
    }

    fn seal(
        &self,
        kind: TokenKind,
        remote: &SocketAddr,
        orig_dst_cid: Option<&ConnectionId>,
    ) -> Vec<u8> {
        let ip = remote.ip().to_string();
        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut buf = Vec::with_capacity(64);
        buf.push(match kind {
            TokenKind::Retry => 0,
            TokenKind::NewToken => 1,
        });
        buf.push(ip.len() as u8);
        buf.extend_from_slice(ip.as_bytes());
        buf.extend_from_slice(&issued.to_be_bytes());
        if let Some(cid) = orig_dst_cid {
            buf.push(cid.len() as u8);
            buf.extend_from_slice(cid);
        }

        let mut nonce = [0; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut buf,
            )
            .unwrap();

        let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buf);
        out
    }

    /// Authenticates and deserializes a token presented by a client.
    ///
    /// Failure is not suspicious by itself: the token may come from a
    /// previous process or an unrelated server behind the same address, so
    /// callers treat an error as "no token presented".
    pub fn decode_token(&self, raw: &[u8]) -> Result<Token, TokenDecodeError> {
        if raw.len() < NONCE_LEN {
            return Err(TokenDecodeError::TooShort);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let mut sealed = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce.try_into().unwrap()),
                aead::Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| TokenDecodeError::AuthenticationFailed)?;

        let mut reader = io::Cursor::new(Bytes::copy_from_slice(plain));
        let kind = match reader.get::<u8>()? {
            0 => TokenKind::Retry,
            1 => TokenKind::NewToken,
            _ => return Err(TokenDecodeError::Malformed),
        };
        let ip_len = reader.get::<u8>()? as usize;
        if reader.remaining() < ip_len {
            return Err(TokenDecodeError::Malformed);
        }
        let pos = reader.position() as usize;
        let remote_ip = std::str::from_utf8(&reader.get_ref()[pos..pos + ip_len])
            .map_err(|_| TokenDecodeError::Malformed)?
            .to_owned();
        reader.advance(ip_len);
        let issued_at = UNIX_EPOCH + Duration::from_millis(reader.get::<u64>()?);

        let original_dcid = match kind {
            TokenKind::NewToken => None,
            TokenKind::Retry => {
                let len = reader.get::<u8>()? as usize;
                if len > MAX_CID_SIZE || reader.remaining() < len {
                    return Err(TokenDecodeError::Malformed);
                }
                let pos = reader.position() as usize;
                let cid = ConnectionId::new(&reader.get_ref()[pos..pos + len]);
                reader.advance(len);
                Some(cid)
            }
        };
        if reader.has_remaining() {
            // Trailing bytes mean this was sealed by an incompatible encoder
            return Err(TokenDecodeError::Malformed);
        }

        Ok(Token {
            kind,
            remote_ip,
            issued_at,
            original_dcid,
        })
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl From<crate::coding::UnexpectedEnd> for TokenDecodeError {
    fn from(_: crate::coding::UnexpectedEnd) -> Self {
        TokenDecodeError::Malformed
    }
}

/// Reasons a presented token did not validate
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum TokenDecodeError {
    #[error("token too short")]
    TooShort,
    #[error("token failed authentication")]
    AuthenticationFailed,
    #[error("token contents malformed")]
    Malformed,
}

/// Client-side cache for tokens received in NEW_TOKEN frames.
///
/// Servers have no use for this; it exists so a client built on the same
/// configuration surface can resume address validation across connections.
pub trait TokenStore: Send + Sync {
    /// Potentially store a token for later one-time use
    fn insert(&self, server_name: &str, token: Bytes);

    /// Find and take a token stored for `server_name`
    ///
    /// The same token must never be returned twice.
    fn take(&self, server_name: &str) -> Option<Bytes>;
}
