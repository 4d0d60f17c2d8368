//! Resumption side-channel carried inside the TLS session ticket.
//!
//! A server session stashes the data it needs back at 0-RTT resumption time
//! (the original ticket nonce, opaque application data, and the measured
//! round-trip time) inside the ticket's opaque blob. The encoding is a
//! versioned, self-delimiting byte format so that tickets minted by a
//! different build are detected and ignored rather than misparsed:
//!
//! ```text
//! u32 revision (currently 1)
//! u16 nonce length      || nonce bytes
//! u32 app data length   || app data bytes
//! u64 round-trip time in nanoseconds
//! ```

use std::io;
use std::time::Duration;

use bytes::Buf;
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt};

const REVISION: u32 = 1;

/// Session state smuggled through the TLS session ticket
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TicketPayload {
    /// The ticket nonce the TLS stack originally issued
    pub nonce: Vec<u8>,
    /// Opaque application data to replay to the 0-RTT acceptor
    pub app_data: Vec<u8>,
    /// Smoothed round-trip time at ticket issue, seeding the resumed
    /// connection's RTT estimator
    pub rtt: Duration,
}

impl TicketPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + self.nonce.len() + self.app_data.len());
        buf.write(REVISION);
        buf.write(self.nonce.len() as u16);
        buf.extend_from_slice(&self.nonce);
        buf.write(self.app_data.len() as u32);
        buf.extend_from_slice(&self.app_data);
        buf.write(self.rtt.as_nanos() as u64);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, TicketDecodeError> {
        let mut buf = io::Cursor::new(data);
        let revision = buf.get::<u32>()?;
        if revision != REVISION {
            return Err(TicketDecodeError::UnknownRevision(revision));
        }
        let nonce_len = buf.get::<u16>()? as usize;
        let nonce = read_block(&mut buf, nonce_len)?;
        let app_data_len = buf.get::<u32>()? as usize;
        let app_data = read_block(&mut buf, app_data_len)?;
        let rtt = Duration::from_nanos(buf.get::<u64>()?);
        if buf.has_remaining() {
            return Err(TicketDecodeError::TrailingBytes);
        }
        Ok(Self {
            nonce,
            app_data,
            rtt,
        })
    }
}

fn read_block(buf: &mut io::Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, TicketDecodeError> {
    if buf.remaining() < len {
        return Err(TicketDecodeError::Truncated);
    }
    let pos = buf.position() as usize;
    let out = buf.get_ref()[pos..pos + len].to_vec();
    buf.advance(len);
    Ok(out)
}

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum TicketDecodeError {
    #[error("ticket payload truncated")]
    Truncated,
    #[error("unknown ticket revision {0}")]
    UnknownRevision(u32),
    #[error("trailing bytes after ticket payload")]
    TrailingBytes,
}

impl From<crate::coding::UnexpectedEnd> for TicketDecodeError {
    fn from(_: crate::coding::UnexpectedEnd) -> Self {
        TicketDecodeError::Truncated
    }
}
