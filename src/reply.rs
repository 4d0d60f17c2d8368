//! Builders for the three stateless replies the admission pipeline can send.
//!
//! Each builder returns one complete datagram; the caller ships it with a
//! single `send_to`. Nothing here touches per-connection state.

use rand::Rng;

use crate::cid::ConnectionId;
use crate::coding::BufMutExt;
use crate::crypto::{self, TAG_LEN};
use crate::frame::{ConnectionClose, TransportErrorCode};
use crate::packet::{LongHeaderType, LONG_HEADER_FORM};
use crate::Side;

/// Builds a Retry packet carrying `token`.
///
/// The client is told to come back with `server_scid` as its new DCID; the
/// integrity tag binds the packet to the DCID of the Initial that provoked
/// it, which the client checks against what it originally sent.
pub(crate) fn compose_retry(
    version: u32,
    client_dcid: &ConnectionId,
    client_scid: &ConnectionId,
    server_scid: &ConnectionId,
    token: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + token.len());
    buf.write(u8::from(LongHeaderType::Retry));
    buf.write(version);
    encode_cids(&mut buf, client_scid, server_scid);
    buf.extend_from_slice(token);
    let tag = crypto::retry_integrity_tag(client_dcid, &buf);
    buf.extend_from_slice(&tag);
    buf
}

/// Builds a Version Negotiation packet listing `versions`.
///
/// A greased reserved version is prepended to keep clients from hardcoding
/// the list; it is re-rolled if it happens to collide with what the client
/// offered, since the client must not find its own version in the reply.
pub(crate) fn compose_version_negotiation<R: Rng>(
    rng: &mut R,
    offered: u32,
    client_dcid: &ConnectionId,
    client_scid: &ConnectionId,
    versions: &[u32],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 4 * (versions.len() + 1));
    buf.write(LONG_HEADER_FORM | (rng.gen::<u8>() & !LONG_HEADER_FORM));
    buf.write(0u32);
    encode_cids(&mut buf, client_scid, client_dcid);
    let mut grease = reserved_version(rng);
    while grease == offered {
        grease = reserved_version(rng);
    }
    buf.write(grease);
    for &version in versions {
        buf.write(version);
    }
    buf
}

/// Builds the server-busy refusal: an Initial packet with packet number 0
/// whose only frame is CONNECTION_CLOSE(SERVER_BUSY).
///
/// The payload is sealed under the Initial keys derived from the client's
/// DCID, exactly as the client derives them, so the refusal authenticates
/// without any shared state.
pub(crate) fn compose_server_busy(
    version: u32,
    client_dcid: &ConnectionId,
    client_scid: &ConnectionId,
) -> Vec<u8> {
    const PN_LEN: usize = 4;

    let mut frame = Vec::new();
    ConnectionClose::new(TransportErrorCode::SERVER_BUSY).encode(&mut frame);

    let mut buf = Vec::with_capacity(64 + frame.len());
    buf.write(u8::from(LongHeaderType::Initial) | (PN_LEN - 1) as u8);
    buf.write(version);
    encode_cids(&mut buf, client_scid, client_dcid);
    buf.write_var(0); // no token
    buf.write_var((PN_LEN + frame.len() + TAG_LEN) as u64);
    let pn_offset = buf.len();
    buf.write(0u32); // packet number 0, encoded on 4 bytes
    let header_len = buf.len();
    buf.extend_from_slice(&frame);

    let keys = crypto::initial_keys(client_dcid, Side::Server);
    keys.local.seal(0, &mut buf, header_len);
    keys.local.protect_header(pn_offset, PN_LEN, &mut buf);
    buf
}

fn encode_cids(buf: &mut Vec<u8>, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
    buf.push(dst_cid.len() as u8);
    buf.extend_from_slice(dst_cid);
    buf.push(src_cid.len() as u8);
    buf.extend_from_slice(src_cid);
}

/// Samples a version of the reserved `0x?a?a?a?a` pattern (RFC 9000 §15)
fn reserved_version<R: Rng>(rng: &mut R) -> u32 {
    (rng.gen::<u32>() & 0xf0f0_f0f0) | 0x0a0a_0a0a
}
