//! Route entry data model.

use crate::address::{ElementRange, UnicastAddress};
use tokio::time::Instant;

/// Opaque handle to a slot in the route entry pool.
///
/// Indices, not pointers: deletion is by index, which makes use-after-free
/// mechanically impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteList {
    Valid,
    Invalid,
}

/// The unit managed by the pool and routing table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub source_address: UnicastAddress,
    pub source_number_of_elements: u16,
    pub destination_address: UnicastAddress,
    pub destination_number_of_elements: u16,
    pub destination_sequence_number: u32,
    pub next_hop: UnicastAddress,
    pub hop_count: u8,
    /// Averaged link quality.
    pub rssi: i8,
    /// Reserved; set by the RREP originator.
    pub repairable: bool,
    pub net_idx: u16,
    /// Which list the entry currently lives in.
    pub(crate) list: RouteList,
    /// Absolute deadline; swept by the maintenance task.
    pub(crate) deadline: Instant,
    /// Set on the reverse entry created by an RREQ received at the local
    /// destination: on deadline expiry the maintenance task validates this
    /// entry and sends the RREP, instead of freeing it.
    pub(crate) pending_reply_on_expiry: bool,
}

impl RouteEntry {
    pub fn source_range(&self) -> ElementRange {
        ElementRange::new(self.source_address, self.source_number_of_elements)
    }

    pub fn destination_range(&self) -> ElementRange {
        ElementRange::new(self.destination_address, self.destination_number_of_elements)
    }

    /// Combined hop-count/RSSI metric. Lower wins.
    pub fn combined_metric(&self, rssi_min: i32) -> i32 {
        combined_metric(self.hop_count, self.rssi, rssi_min)
    }
}

pub fn combined_metric(hop_count: u8, rssi: i8, rssi_min: i32) -> i32 {
    hop_count as i32 * 10 + (rssi as i32 * 10) / rssi_min
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_metric_prefers_lower_hop_and_rssi() {
        // hop=3, rssi=-60 -> 36.x (truncated toward zero).
        assert_eq!(combined_metric(3, -60, -90), 36);
        // hop=2, rssi=-80 -> 28.x, lower, wins.
        assert_eq!(combined_metric(2, -80, -90), 28);
    }
}
