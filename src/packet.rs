use std::io;

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::cid::ConnectionId;
use crate::coding::{self, BufExt};
use crate::MAX_CID_SIZE;

// Packet number encryption makes the tail of a header (packet number,
// payload) undecodable without crypto context, and the crypto context for
// anything but an Initial lives in the session the packet is routed to. The
// admission path therefore decodes only the version-invariant part of the
// header: enough to classify the packet, route by destination CID, and pull
// out the token of an Initial.
#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        /// Remainder-of-packet length claimed by the sender. Recorded for
        /// completeness; never trusted for slicing.
        len: u64,
    },
    Long {
        ty: LongType,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    /// Version 0 marks a Version Negotiation packet. Only servers send
    /// these; one arriving at a server is bogus and gets dropped upstream.
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
    },
}

impl Header {
    /// Decodes the invariant header of `data`.
    ///
    /// `local_cid_len` sizes the DCID of short headers (which carry no
    /// length prefix). A long-header version outside `supported_versions`
    /// yields [`PacketDecodeError::UnsupportedVersion`] carrying the CIDs a
    /// Version Negotiation reply needs.
    pub(crate) fn decode(
        data: &[u8],
        local_cid_len: usize,
        supported_versions: &[u32],
    ) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(data);
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader(
                    "datagram too short for connection ID",
                ));
            }
            let dst_cid = Self::get_cid(&mut buf, local_cid_len)?;
            return Ok(Self::Short { dst_cid });
        }

        let version = buf.get::<u32>()?;
        let dcil = buf.get::<u8>()? as usize;
        let dst_cid = Self::get_cid(&mut buf, dcil)?;
        let scil = buf.get::<u8>()? as usize;
        let src_cid = Self::get_cid(&mut buf, scil)?;

        if version == 0 {
            return Ok(Self::VersionNegotiate { dst_cid, src_cid });
        }
        if !supported_versions.contains(&version) {
            return Err(PacketDecodeError::UnsupportedVersion {
                version,
                dst_cid,
                src_cid,
            });
        }

        match LongHeaderType::from_byte(first)? {
            LongHeaderType::Initial => {
                let token_len = buf.get_var()? as usize;
                if token_len > buf.remaining() {
                    return Err(PacketDecodeError::InvalidHeader(
                        "token longer than packet",
                    ));
                }
                let token_start = buf.position() as usize;
                let token = Bytes::copy_from_slice(&data[token_start..token_start + token_len]);
                buf.advance(token_len);
                let len = buf.get_var()?;
                Ok(Self::Initial {
                    version,
                    dst_cid,
                    src_cid,
                    token,
                    len,
                })
            }
            LongHeaderType::Retry => Ok(Self::Retry {
                version,
                dst_cid,
                src_cid,
            }),
            LongHeaderType::Standard(ty) => Ok(Self::Long {
                ty,
                version,
                dst_cid,
                src_cid,
                len: buf.get_var()?,
            }),
        }
    }

    fn get_cid(buf: &mut io::Cursor<&[u8]>, len: usize) -> Result<ConnectionId, PacketDecodeError> {
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        if buf.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader(
                "connection ID longer than packet",
            ));
        }
        let pos = buf.position() as usize;
        let cid = ConnectionId::new(&buf.get_ref()[pos..pos + len]);
        buf.advance(len);
        Ok(cid)
    }
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Retry,
    Standard(LongType),
}

impl LongHeaderType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use self::{LongHeaderType::*, LongType::*};
        if b & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => Standard(ZeroRtt),
            0x2 => Standard(Handshake),
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> u8 {
        use self::{LongHeaderType::*, LongType::*};
        match ty {
            Initial => LONG_HEADER_FORM | FIXED_BIT,
            Standard(ZeroRtt) => LONG_HEADER_FORM | FIXED_BIT | (0x1 << 4),
            Standard(Handshake) => LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4),
            Retry => LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4),
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

impl std::fmt::Display for LongType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LongType::Handshake => f.write_str("Handshake"),
            LongType::ZeroRtt => f.write_str("0-RTT"),
        }
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version {version:#010x}")]
    UnsupportedVersion {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
