//! Initial packet protection and Retry integrity (RFC 9001).
//!
//! Initial keys are derived from the client's destination connection ID, so
//! both peers can compute them statelessly; the server-busy reply leans on
//! this to send an encrypted CONNECTION_CLOSE without a session.

use ring::aead::{self, quic};
use ring::hkdf;

use crate::cid::ConnectionId;
use crate::Side;

const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

const RETRY_INTEGRITY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

pub(crate) const TAG_LEN: usize = 16;
pub(crate) const SAMPLE_LEN: usize = 16;

/// Packet protection keys for one direction of the Initial space
pub(crate) struct PacketKeys {
    key: aead::LessSafeKey,
    iv: [u8; 12],
    hp: quic::HeaderProtectionKey,
}

impl PacketKeys {
    fn from_secret(secret: &hkdf::Prk) -> Self {
        let mut key = [0; 16];
        hkdf_expand_label(secret, b"quic key", &mut key);
        let mut iv = [0; 12];
        hkdf_expand_label(secret, b"quic iv", &mut iv);
        let mut hp = [0; 16];
        hkdf_expand_label(secret, b"quic hp", &mut hp);
        Self {
            key: aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap()),
            iv,
            hp: quic::HeaderProtectionKey::new(&quic::AES_128, &hp).unwrap(),
        }
    }

    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, n) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *b ^= n;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Seals `buf[header_len..]` in place with the header as associated data
    /// and appends the 16-byte tag.
    pub(crate) fn seal(&self, packet_number: u64, buf: &mut Vec<u8>, header_len: usize) {
        let (header, payload) = buf.split_at_mut(header_len);
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet_number), aead::Aad::from(header), payload)
            .unwrap();
        buf.extend_from_slice(tag.as_ref());
    }

    /// Opens a sealed payload in place, returning the plaintext length.
    pub(crate) fn open(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let plain = self
            .key
            .open_in_place(self.nonce(packet_number), aead::Aad::from(header), payload)
            .map_err(|_| CryptoError)?;
        Ok(plain.len())
    }

    /// Masks the first byte and packet-number bytes, sampling the 16 bytes
    /// of ciphertext starting 4 bytes past the packet-number offset.
    pub(crate) fn protect_header(&self, pn_offset: usize, pn_len: usize, packet: &mut [u8]) {
        debug_assert!(pn_len <= 4);
        let sample = &packet[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN];
        let mask = self.hp.new_mask(sample).unwrap();
        if packet[0] & 0x80 != 0 {
            packet[0] ^= mask[0] & 0x0f;
        } else {
            packet[0] ^= mask[0] & 0x1f;
        }
        for (b, m) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
            *b ^= m;
        }
    }

    /// Reverses header protection; returns the recovered packet-number
    /// length.
    pub(crate) fn unprotect_header(&self, pn_offset: usize, packet: &mut [u8]) -> usize {
        let sample = &packet[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN];
        let mask = self.hp.new_mask(sample).unwrap();
        if packet[0] & 0x80 != 0 {
            packet[0] ^= mask[0] & 0x0f;
        } else {
            packet[0] ^= mask[0] & 0x1f;
        }
        let pn_len = (packet[0] & 0x03) as usize + 1;
        for (b, m) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
            *b ^= m;
        }
        pn_len
    }
}

/// Both directions of the Initial-space keys derived from `dst_cid`
pub(crate) struct InitialKeys {
    /// Keys this side seals with
    pub(crate) local: PacketKeys,
    /// Keys the peer seals with
    pub(crate) remote: PacketKeys,
}

pub(crate) fn initial_keys(dst_cid: &ConnectionId, side: Side) -> InitialKeys {
    let initial = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT_V1).extract(dst_cid);
    let client = expand_secret(&initial, b"client in");
    let server = expand_secret(&initial, b"server in");
    let (local, remote) = if side.is_client() {
        (client, server)
    } else {
        (server, client)
    };
    InitialKeys {
        local: PacketKeys::from_secret(&local),
        remote: PacketKeys::from_secret(&remote),
    }
}

fn expand_secret(prk: &hkdf::Prk, label: &[u8]) -> hkdf::Prk {
    let mut secret = [0; 32];
    hkdf_expand_label(prk, label, &mut secret);
    hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secret)
}

/// HKDF-Expand-Label from TLS 1.3 (RFC 8446 §7.1) with an empty context
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const PREFIX: &[u8] = b"tls13 ";
    const EMPTY_CONTEXT: &[u8] = &[0];
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let info = [&out_len[..], &label_len[..], PREFIX, label, EMPTY_CONTEXT];
    prk.expand(&info, OkmLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Computes the Retry Integrity Tag over the pseudo-packet formed by the
/// length-prefixed original DCID followed by the Retry packet so far.
pub(crate) fn retry_integrity_tag(orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; TAG_LEN] {
    let mut pseudo_packet = Vec::with_capacity(packet.len() + orig_dst_cid.len() + 1);
    pseudo_packet.push(orig_dst_cid.len() as u8);
    pseudo_packet.extend_from_slice(orig_dst_cid);
    pseudo_packet.extend_from_slice(packet);

    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE_V1);
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY_V1).unwrap(),
    );
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo_packet), &mut [])
        .unwrap();
    let mut result = [0; TAG_LEN];
    result.copy_from_slice(tag.as_ref());
    result
}

/// Checks the trailing integrity tag of a complete Retry packet.
pub(crate) fn is_valid_retry(orig_dst_cid: &ConnectionId, packet: &[u8]) -> bool {
    let tag_start = match packet.len().checked_sub(TAG_LEN) {
        Some(x) => x,
        None => return false,
    };
    let tag = retry_integrity_tag(orig_dst_cid, &packet[..tag_start]);
    // The tag is an AEAD output over attacker-visible data; plain comparison
    // leaks nothing useful.
    tag[..] == packet[tag_start..]
}

/// Authentication failure during packet decryption
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct CryptoError;
