use std::fmt;

use crate::coding::BufMutExt;

/// Transport-level error code carried in CONNECTION_CLOSE (type 0x1c)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct TransportErrorCode(pub(crate) u64);

impl TransportErrorCode {
    /// The server refused the connection for capacity reasons
    pub(crate) const SERVER_BUSY: Self = Self(0x2);
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SERVER_BUSY => f.write_str("SERVER_BUSY"),
            Self(x) => write!(f, "{:#x}", x),
        }
    }
}

/// A transport CONNECTION_CLOSE frame
#[derive(Debug, Clone)]
pub(crate) struct ConnectionClose {
    pub(crate) error_code: TransportErrorCode,
    /// Type of the frame that provoked the close; 0 when none in particular
    pub(crate) frame_type: u64,
    pub(crate) reason: &'static str,
}

impl ConnectionClose {
    pub(crate) fn new(error_code: TransportErrorCode) -> Self {
        Self {
            error_code,
            frame_type: 0,
            reason: "",
        }
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_var(0x1c);
        buf.write_var(self.error_code.0);
        buf.write_var(self.frame_type);
        buf.write_var(self.reason.len() as u64);
        buf.extend_from_slice(self.reason.as_bytes());
    }
}
