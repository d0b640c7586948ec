//! Source filtering for incoming RTP packets.

use std::net::Ipv4Addr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Accepts or rejects packets by their (connection, source) address pair.
///
/// Matching: if any exclude entry matches the source it is rejected; else if
/// include entries exist the source must match one of them; an empty filter
/// accepts every source at the connection address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Filter {
    connection_address: Ipv4Addr,
    entries: Vec<(FilterMode, Ipv4Addr)>,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            connection_address: Ipv4Addr::UNSPECIFIED,
            entries: Vec::new(),
        }
    }
}

impl Filter {
    pub fn new(connection_address: Ipv4Addr) -> Self {
        Self {
            connection_address,
            entries: Vec::new(),
        }
    }

    /// Convenience constructor with one entry already added.
    pub fn with_source(connection_address: Ipv4Addr, source: Ipv4Addr, mode: FilterMode) -> Self {
        let mut filter = Self::new(connection_address);
        filter.add_entry(source, mode);
        filter
    }

    pub fn add_entry(&mut self, source: Ipv4Addr, mode: FilterMode) {
        self.entries.push((mode, source));
    }

    pub fn connection_address(&self) -> Ipv4Addr {
        self.connection_address
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if a packet sent from `source` to `connection_address` passes the
    /// filter. Exclude entries take priority over include entries.
    pub fn is_valid_source(&self, connection_address: Ipv4Addr, source: Ipv4Addr) -> bool {
        if self.connection_address != connection_address {
            return false;
        }

        if self.entries.is_empty() {
            return true;
        }

        let mut has_includes = false;
        let mut included = false;

        for (mode, address) in &self.entries {
            match mode {
                FilterMode::Exclude if *address == source => return false,
                FilterMode::Include => {
                    has_includes = true;
                    if *address == source {
                        included = true;
                    }
                }
                _ => {}
            }
        }

        if has_includes {
            included
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 15, 52);
    const SRC_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SRC_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn empty_filter_accepts_all_sources() {
        let filter = Filter::new(GROUP);
        assert!(filter.is_valid_source(GROUP, SRC_A));
        assert!(filter.is_valid_source(GROUP, SRC_B));
    }

    #[test]
    fn connection_address_must_match() {
        let filter = Filter::new(GROUP);
        assert!(!filter.is_valid_source(Ipv4Addr::new(239, 2, 15, 52), SRC_A));
    }

    #[test]
    fn include_list_restricts() {
        let filter = Filter::with_source(GROUP, SRC_A, FilterMode::Include);
        assert!(filter.is_valid_source(GROUP, SRC_A));
        assert!(!filter.is_valid_source(GROUP, SRC_B));
    }

    #[test]
    fn exclude_wins_over_include() {
        let mut filter = Filter::with_source(GROUP, SRC_A, FilterMode::Include);
        filter.add_entry(SRC_A, FilterMode::Exclude);
        assert!(!filter.is_valid_source(GROUP, SRC_A));
    }

    #[test]
    fn exclude_only_accepts_everything_else() {
        let filter = Filter::with_source(GROUP, SRC_A, FilterMode::Exclude);
        assert!(!filter.is_valid_source(GROUP, SRC_A));
        assert!(filter.is_valid_source(GROUP, SRC_B));
    }
}
