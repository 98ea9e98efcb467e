//! Routing table: lookup/insert/transition operations over the entry pool.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::address::UnicastAddress;
pub use crate::entry::{RouteEntry, RouteHandle, RouteList};
use crate::error::RoutingError;
use crate::pool::BoundedSlab;

pub struct RoutingTable {
    pool: BoundedSlab<RouteEntry>,
    /// Lock order is always `valid` before `invalid`, a fixed global
    /// ordering for the pair of lists this component owns.
    valid: Mutex<Vec<usize>>,
    invalid: Mutex<Vec<usize>>,
    allocation_interval: Duration,
}

/// A freshly-built entry awaiting insertion; the pool assigns its list
/// membership and deadline.
pub struct NewRouteEntry {
    pub source_address: UnicastAddress,
    pub source_number_of_elements: u16,
    pub destination_address: UnicastAddress,
    pub destination_number_of_elements: u16,
    pub destination_sequence_number: u32,
    pub next_hop: UnicastAddress,
    pub hop_count: u8,
    pub rssi: i8,
    pub repairable: bool,
    pub net_idx: u16,
    pub pending_reply_on_expiry: bool,
}

impl RoutingTable {
    pub fn new(capacity: usize, allocation_interval: Duration) -> Self {
        Self {
            pool: BoundedSlab::new(capacity),
            valid: Mutex::new(Vec::new()),
            invalid: Mutex::new(Vec::new()),
            allocation_interval,
        }
    }

    fn list_mutex(&self, list: RouteList) -> &Mutex<Vec<usize>> {
        match list {
            RouteList::Valid => &self.valid,
            RouteList::Invalid => &self.invalid,
        }
    }

    /// Reserve a slot, append to `list`, arm its lifetime.
    pub async fn alloc_into(
        &self,
        list: RouteList,
        new_entry: NewRouteEntry,
        lifetime: Duration,
    ) -> Result<RouteHandle, RoutingError> {
        let entry = RouteEntry {
            source_address: new_entry.source_address,
            source_number_of_elements: new_entry.source_number_of_elements,
            destination_address: new_entry.destination_address,
            destination_number_of_elements: new_entry.destination_number_of_elements,
            destination_sequence_number: new_entry.destination_sequence_number,
            next_hop: new_entry.next_hop,
            hop_count: new_entry.hop_count,
            rssi: new_entry.rssi,
            repairable: new_entry.repairable,
            net_idx: new_entry.net_idx,
            list,
            deadline: Instant::now() + lifetime,
            pending_reply_on_expiry: new_entry.pending_reply_on_expiry,
        };
        let idx = self.pool.alloc(entry, self.allocation_interval).await?;
        self.list_mutex(list).lock().await.push(idx);
        Ok(RouteHandle(idx))
    }

    /// Stop the timer, remove from its list, and return the slot.
    pub async fn free(&self, handle: RouteHandle) {
        let Some(entry) = self.pool.get_cloned(handle.0).await else { return };
        let mut list = self.list_mutex(entry.list).lock().await;
        list.retain(|&idx| idx != handle.0);
        drop(list);
        self.pool.free(handle.0).await;
    }

    /// Rearm the timer in place.
    pub async fn refresh(&self, handle: RouteHandle, new_duration: Duration) {
        self.pool
            .with_mut(handle.0, |entry| entry.deadline = Instant::now() + new_duration)
            .await;
    }

    pub async fn refresh_lifetime_valid(&self, handle: RouteHandle, lifetime_valid: Duration) {
        self.refresh(handle, lifetime_valid).await;
    }

    pub async fn refresh_lifetime_invalid(&self, handle: RouteHandle, rreq_wait: Duration) {
        self.refresh(handle, rreq_wait).await;
    }

    /// Atomic transition between lists. Locks are always acquired `valid`
    /// then `invalid` regardless of direction, which precludes deadlock
    /// against any other table operation.
    pub async fn move_entry(&self, handle: RouteHandle, to: RouteList, new_duration: Duration) {
        let mut valid = self.valid.lock().await;
        let mut invalid = self.invalid.lock().await;

        let from = match to {
            RouteList::Valid => RouteList::Invalid,
            RouteList::Invalid => RouteList::Valid,
        };
        let from_list = match from {
            RouteList::Valid => &mut *valid,
            RouteList::Invalid => &mut *invalid,
        };
        if let Some(pos) = from_list.iter().position(|&idx| idx == handle.0) {
            from_list.remove(pos);
        } else {
            // Already in `to` (or unknown) - nothing to relocate.
            return;
        }
        match to {
            RouteList::Valid => valid.push(handle.0),
            RouteList::Invalid => invalid.push(handle.0),
        }
        drop(valid);
        drop(invalid);

        self.pool
            .with_mut(handle.0, |entry| {
                entry.list = to;
                entry.deadline = Instant::now() + new_duration;
                if to == RouteList::Valid {
                    entry.pending_reply_on_expiry = false;
                }
            })
            .await;
    }

    /// `validate_route`: INVALID -> VALID with `LIFETIME_VALID`.
    pub async fn validate_route(&self, handle: RouteHandle, lifetime_valid: Duration) {
        self.move_entry(handle, RouteList::Valid, lifetime_valid).await;
    }

    /// `invalidate_route`: VALID -> INVALID, kept alive for `LIFETIME_VALID`
    /// so reverse-lookup by RERR may still consult sequence numbers.
    pub async fn invalidate_route(&self, handle: RouteHandle, lifetime_valid: Duration) {
        self.move_entry(handle, RouteList::Invalid, lifetime_valid).await;
    }

    pub async fn get(&self, handle: RouteHandle) -> Option<RouteEntry> {
        self.pool.get_cloned(handle.0).await
    }

    async fn snapshot(&self, list: RouteList) -> Vec<(RouteHandle, RouteEntry)> {
        let indices = self.list_mutex(list).lock().await.clone();
        let mut out = Vec::with_capacity(indices.len());
        for idx in indices {
            if let Some(entry) = self.pool.get_cloned(idx).await {
                out.push((RouteHandle(idx), entry));
            }
        }
        out
    }

    /// Generic predicate search, the building block every named search kind
    /// below is expressed with. The lock is never held while a caller
    /// processes the result: matches are collected first, then the lock is
    /// released, which keeps callback-during-iteration safe without
    /// borrowing across an await point.
    pub async fn find_one(
        &self,
        list: RouteList,
        pred: impl Fn(&RouteEntry) -> bool,
    ) -> Option<(RouteHandle, RouteEntry)> {
        self.snapshot(list).await.into_iter().find(|(_, entry)| pred(entry))
    }

    pub async fn find_all(
        &self,
        list: RouteList,
        pred: impl Fn(&RouteEntry) -> bool,
    ) -> Vec<(RouteHandle, RouteEntry)> {
        self.snapshot(list).await.into_iter().filter(|(_, entry)| pred(entry)).collect()
    }

    // --- Named search kinds --------------------------------------------

    pub async fn find_by_source_destination(
        &self,
        list: RouteList,
        source: UnicastAddress,
        destination: UnicastAddress,
        net_idx: Option<u16>,
    ) -> Option<(RouteHandle, RouteEntry)> {
        self.find_one(list, |e| {
            e.source_range().contains(source)
                && e.destination_range().contains(destination)
                && net_idx.map(|n| n == e.net_idx).unwrap_or(true)
        })
        .await
    }

    /// Exact-address variant of [`Self::find_by_source_destination`], used
    /// wherever a reverse entry must be located by the precise addresses it
    /// was created with rather than by range containment.
    pub async fn find_by_source_destination_exact(
        &self,
        list: RouteList,
        source: UnicastAddress,
        destination: UnicastAddress,
        net_idx: u16,
    ) -> Option<(RouteHandle, RouteEntry)> {
        self.find_one(list, |e| {
            e.source_address == source && e.destination_address == destination && e.net_idx == net_idx
        })
        .await
    }

    pub async fn find_by_destination(
        &self,
        list: RouteList,
        destination: UnicastAddress,
        net_idx: Option<u16>,
    ) -> Option<(RouteHandle, RouteEntry)> {
        self.find_one(list, |e| {
            e.destination_range().contains(destination)
                && net_idx.map(|n| n == e.net_idx).unwrap_or(true)
        })
        .await
    }

    pub async fn find_by_source(
        &self,
        list: RouteList,
        source: UnicastAddress,
        net_idx: Option<u16>,
    ) -> Option<(RouteHandle, RouteEntry)> {
        self.find_one(list, |e| {
            e.source_range().contains(source) && net_idx.map(|n| n == e.net_idx).unwrap_or(true)
        })
        .await
    }

    /// Exact-source, ranged-destination variant: the candidate's
    /// `destination_address` must lie within `[dst, dst + range)` while
    /// `source_address` matches exactly.
    pub async fn find_by_source_exact_destination_range(
        &self,
        list: RouteList,
        source: UnicastAddress,
        destination_range_start: UnicastAddress,
        destination_range: u16,
        net_idx: Option<u16>,
    ) -> Option<(RouteHandle, RouteEntry)> {
        let query = crate::address::ElementRange::new(destination_range_start, destination_range);
        self.find_one(list, |e| {
            e.source_address == source
                && query.contains(e.destination_address)
                && net_idx.map(|n| n == e.net_idx).unwrap_or(true)
        })
        .await
    }

    /// Symmetric variant: exact destination, ranged source.
    pub async fn find_by_destination_exact_source_range(
        &self,
        list: RouteList,
        destination: UnicastAddress,
        source_range_start: UnicastAddress,
        source_range: u16,
        net_idx: Option<u16>,
    ) -> Option<(RouteHandle, RouteEntry)> {
        let query = crate::address::ElementRange::new(source_range_start, source_range);
        self.find_one(list, |e| {
            e.destination_address == destination
                && query.contains(e.source_address)
                && net_idx.map(|n| n == e.net_idx).unwrap_or(true)
        })
        .await
    }

    /// Destination+next_hop+net_idx, every match (RERR fan-out).
    pub async fn find_all_by_destination_next_hop(
        &self,
        list: RouteList,
        destination: UnicastAddress,
        next_hop: UnicastAddress,
        net_idx: u16,
    ) -> Vec<(RouteHandle, RouteEntry)> {
        self.find_all(list, |e| {
            e.destination_range().contains(destination)
                && e.next_hop == next_hop
                && e.net_idx == net_idx
        })
        .await
    }

    /// next_hop+net_idx, any single match.
    pub async fn find_by_next_hop(
        &self,
        list: RouteList,
        next_hop: UnicastAddress,
        net_idx: u16,
    ) -> Option<(RouteHandle, RouteEntry)> {
        self.find_one(list, |e| e.next_hop == next_hop && e.net_idx == net_idx).await
    }

    /// next_hop+net_idx, every match (link drop fan-out).
    pub async fn find_all_by_next_hop(
        &self,
        list: RouteList,
        next_hop: UnicastAddress,
        net_idx: u16,
    ) -> Vec<(RouteHandle, RouteEntry)> {
        self.find_all(list, |e| e.next_hop == next_hop && e.net_idx == net_idx).await
    }

    /// source+net_idx, every match (used when a neighbour goes silent and
    /// reverse entries sourced from it must be reconsidered).
    pub async fn find_all_by_source(
        &self,
        list: RouteList,
        source: UnicastAddress,
        net_idx: u16,
    ) -> Vec<(RouteHandle, RouteEntry)> {
        self.find_all(list, |e| e.source_range().contains(source) && e.net_idx == net_idx).await
    }

    /// Applies an in-place field update without changing list membership.
    /// Used by the RREQ-receive metric tie-break to replace
    /// sequence/hop/next_hop/rssi on a losing invalid entry.
    pub async fn update(&self, handle: RouteHandle, f: impl FnOnce(&mut RouteEntry)) {
        self.pool.with_mut(handle.0, f).await;
    }

    /// Sweeps both lists for entries whose deadline has passed, freeing
    /// them. Entries awaiting an RREP-on-expiry callback are left alone;
    /// see [`Self::take_pending_replies_due`]. Driven by the maintenance
    /// task.
    pub async fn sweep_expired(&self, now: Instant) -> Vec<RouteEntry> {
        let mut expired = Vec::new();
        for list in [RouteList::Valid, RouteList::Invalid] {
            let candidates = self.snapshot(list).await;
            for (handle, entry) in candidates {
                if entry.deadline <= now && !entry.pending_reply_on_expiry {
                    self.free(handle).await;
                    expired.push(entry);
                }
            }
        }
        expired
    }

    /// Reverse entries created by an RREQ-receive at the local destination
    /// whose RREQ_WAIT has elapsed: the caller validates each and sends the
    /// RREP.
    pub async fn take_pending_replies_due(&self, now: Instant) -> Vec<(RouteHandle, RouteEntry)> {
        self.snapshot(RouteList::Invalid)
            .await
            .into_iter()
            .filter(|(_, e)| e.pending_reply_on_expiry && e.deadline <= now)
            .collect()
    }

    pub async fn valid_count(&self) -> usize {
        self.valid.lock().await.len()
    }

    pub async fn invalid_count(&self) -> usize {
        self.invalid.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn sample(src: u16, dst: u16) -> NewRouteEntry {
        NewRouteEntry {
            source_address: src,
            source_number_of_elements: 1,
            destination_address: dst,
            destination_number_of_elements: 1,
            destination_sequence_number: 1,
            next_hop: src,
            hop_count: 1,
            rssi: -40,
            repairable: false,
            net_idx: 0,
            pending_reply_on_expiry: false,
        }
    }

    #[tokio::test]
    async fn validate_moves_entry_between_lists() {
        let table = RoutingTable::new(4, StdDuration::from_millis(100));
        let handle = table
            .alloc_into(RouteList::Invalid, sample(1, 2), StdDuration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(table.invalid_count().await, 1);
        table.validate_route(handle, StdDuration::from_secs(60)).await;
        assert_eq!(table.invalid_count().await, 0);
        assert_eq!(table.valid_count().await, 1);
    }

    #[tokio::test]
    async fn element_range_queries_match_boundaries() {
        let table = RoutingTable::new(4, StdDuration::from_millis(100));
        let mut entry = sample(0x0010, 0x0020);
        entry.destination_number_of_elements = 4;
        let handle =
            table.alloc_into(RouteList::Valid, entry, StdDuration::from_secs(60)).await.unwrap();

        assert!(table
            .find_by_source_destination(RouteList::Valid, 0x0010, 0x0023, None)
            .await
            .is_some());
        assert!(table
            .find_by_source_destination(RouteList::Valid, 0x0010, 0x0024, None)
            .await
            .is_none());
        table.free(handle).await;
    }

    #[tokio::test]
    async fn alloc_into_fails_when_pool_exhausted() {
        let table = RoutingTable::new(1, StdDuration::from_millis(20));
        table.alloc_into(RouteList::Valid, sample(1, 2), StdDuration::from_secs(60)).await.unwrap();
        let err = table
            .alloc_into(RouteList::Valid, sample(3, 4), StdDuration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::PoolExhausted));
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let table = RoutingTable::new(2, StdDuration::from_millis(20));
        table
            .alloc_into(RouteList::Valid, sample(1, 2), StdDuration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let expired = table.sweep_expired(Instant::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(table.valid_count().await, 0);
    }
}
