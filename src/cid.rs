use std::fmt;

use rand::RngCore;

use crate::{MAX_CID_SIZE, MIN_CID_SIZE};

/// Protocol-level identifier routing datagrams to sessions over a shared
/// socket.
///
/// Peers may pick any length from 0 to 20 bytes for the IDs they ask us to
/// send with; IDs this server issues have the configured fixed length.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!((MIN_CID_SIZE..=MAX_CID_SIZE).contains(&len));
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Extracts the destination connection ID from a raw datagram without
    /// decoding the rest of the header.
    ///
    /// `local_cid_len` is the fixed length of server-issued IDs, needed
    /// because short headers do not carry a length prefix. Returns `None` for
    /// datagrams too short to contain the ID they claim.
    pub fn from_datagram(data: &[u8], local_cid_len: usize) -> Option<Self> {
        let first = *data.first()?;
        if first & 0x80 != 0 {
            // Long header: invariant layout puts a length-prefixed DCID
            // right after the version field.
            let len = *data.get(5)? as usize;
            if len > MAX_CID_SIZE {
                return None;
            }
            Some(Self::new(data.get(6..6 + len)?))
        } else {
            Some(Self::new(data.get(1..1 + local_cid_len)?))
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
