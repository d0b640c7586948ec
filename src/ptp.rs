//! The PTP-facing surface of the core.
//!
//! The PTP stack itself lives outside this library; the core only consumes
//! the identity of the grandmaster and the local port state. A sender is
//! allowed to transmit only while the port is locked to the domain, i.e. in
//! the slave or master state.

use std::fmt;

/// The 8-byte clock identity of a PTP grandmaster.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrandmasterId(pub [u8; 8]);

impl fmt::Display for GrandmasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// IEEE 1588 port states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl PortState {
    /// True in the states in which the media clock is usable for
    /// transmission.
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Slave | Self::Master)
    }
}

/// Events delivered by the external PTP stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpEvent {
    /// The elected grandmaster changed.
    ParentChanged(GrandmasterId),
    /// The local port changed state.
    PortStateChanged(PortState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_by_state() {
        assert!(PortState::Slave.is_stable());
        assert!(PortState::Master.is_stable());
        assert!(!PortState::Listening.is_stable());
        assert!(!PortState::Uncalibrated.is_stable());
    }

    #[test]
    fn grandmaster_id_formats_as_hex() {
        let id = GrandmasterId([0x00, 0x1d, 0xc1, 0xff, 0xfe, 0x12, 0x34, 0x56]);
        assert_eq!(id.to_string(), "00-1D-C1-FF-FE-12-34-56");
    }
}
