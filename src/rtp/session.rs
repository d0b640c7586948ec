//! RTP session endpoints.

use std::fmt;
use std::net::Ipv4Addr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default RTP/RTCP port pair.
pub const DEFAULT_RTP_PORT: u16 = 5004;
pub const DEFAULT_RTCP_PORT: u16 = 5005;

/// The endpoint a receiver listens on or a sender transmits to: a connection
/// address plus the RTP and RTCP ports. By convention `rtcp_port` is
/// `rtp_port + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Session {
    pub connection_address: Ipv4Addr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

impl Session {
    /// Creates a session with the conventional `rtp_port + 1` RTCP port.
    pub const fn new(connection_address: Ipv4Addr, rtp_port: u16) -> Self {
        Self {
            connection_address,
            rtp_port,
            rtcp_port: rtp_port + 1,
        }
    }

    /// A session is valid when the address is specified and both ports are
    /// non-zero.
    pub fn is_valid(&self) -> bool {
        !self.connection_address.is_unspecified() && self.rtp_port != 0 && self.rtcp_port != 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection_address: Ipv4Addr::UNSPECIFIED,
            rtp_port: 0,
            rtcp_port: 0,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.connection_address, self.rtp_port, self.rtcp_port)
    }
}
