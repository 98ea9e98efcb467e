//! Auxiliary lists that sit alongside the routing table: the pending-reply
//! list (ring search and RWAIT bookkeeping), the RERR batch list (link-drop
//! fan-out coalescing), and the neighbour list (HELLO liveness).
//!
//! All three share the same bounded-slab-plus-index-list shape as
//! [`crate::table::RoutingTable`], so they reuse [`BoundedSlab`] directly
//! rather than re-deriving it.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

use crate::address::UnicastAddress;
use crate::error::RoutingError;
use crate::pool::BoundedSlab;

/// A handle into one of the auxiliary lists. Not interchangeable with
/// [`crate::entry::RouteHandle`]; each list has its own index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuxHandle(pub(crate) usize);

// --- Pending-reply list --------------------------------------------------

/// What kind of hint a pending-reply record carries for the ring-search
/// poller. Kept as an explicit tag rather than overloading `hop_count == 0`,
/// since a genuine RREP can legitimately carry a zero-looking hop count for
/// a one-hop neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReplyKind {
    /// A RWAIT arrived: extend the ring timer and keep polling.
    RwaitHint { hop_count: u8 },
    /// A RREP arrived for this destination: ring search succeeds.
    RrepArrived { hop_count: u8 },
}

/// One outstanding route request: the originator (or an intermediate relay
/// waiting on a RWAIT) is blocked until a matching RREP/RWAIT arrives or the
/// ring search gives up.
#[derive(Clone)]
pub struct PendingReply {
    pub destination_address: UnicastAddress,
    pub net_idx: u16,
    pub kind: PendingReplyKind,
    /// Woken by `rrep_recv`/`rwait_recv` when a matching reply lands.
    pub notify: Arc<Notify>,
    deadline: Instant,
}

pub struct PendingReplyList {
    pool: BoundedSlab<PendingReply>,
    indices: Mutex<Vec<usize>>,
    allocation_interval: Duration,
}

impl PendingReplyList {
    pub fn new(capacity: usize, allocation_interval: Duration) -> Self {
        Self {
            pool: BoundedSlab::new(capacity),
            indices: Mutex::new(Vec::new()),
            allocation_interval,
        }
    }

    pub async fn insert(
        &self,
        destination_address: UnicastAddress,
        net_idx: u16,
        kind: PendingReplyKind,
        wait: Duration,
    ) -> Result<(AuxHandle, Arc<Notify>), RoutingError> {
        let notify = Arc::new(Notify::new());
        let record = PendingReply {
            destination_address,
            net_idx,
            kind,
            notify: notify.clone(),
            deadline: Instant::now() + wait,
        };
        let idx = self.pool.alloc(record, self.allocation_interval).await?;
        self.indices.lock().await.push(idx);
        Ok((AuxHandle(idx), notify))
    }

    pub async fn remove(&self, handle: AuxHandle) {
        self.indices.lock().await.retain(|&idx| idx != handle.0);
        self.pool.free(handle.0).await;
    }

    /// Find (and leave in place) the pending reply waiting on `destination`,
    /// used by `rrep_recv`/`rwait_recv` to wake the right waiter.
    pub async fn find_by_destination(
        &self,
        destination: UnicastAddress,
        net_idx: u16,
    ) -> Option<(AuxHandle, PendingReply)> {
        let indices = self.indices.lock().await.clone();
        for idx in indices {
            if let Some(record) = self.pool.get_cloned(idx).await {
                if record.destination_address == destination && record.net_idx == net_idx {
                    return Some((AuxHandle(idx), record));
                }
            }
        }
        None
    }

    /// Snapshot of every currently pending record, for the ring-search
    /// poller to scan without holding the list lock while it decides what
    /// to do with each one.
    pub async fn snapshot(&self) -> Vec<(AuxHandle, PendingReply)> {
        let indices = self.indices.lock().await.clone();
        let mut out = Vec::with_capacity(indices.len());
        for idx in indices {
            if let Some(record) = self.pool.get_cloned(idx).await {
                out.push((AuxHandle(idx), record));
            }
        }
        out
    }

    pub async fn sweep_expired(&self, now: Instant) -> Vec<PendingReply> {
        let indices = self.indices.lock().await.clone();
        let mut expired = Vec::new();
        for idx in indices {
            if let Some(record) = self.pool.get_cloned(idx).await {
                if record.deadline <= now {
                    self.remove(AuxHandle(idx)).await;
                    expired.push(record);
                }
            }
        }
        expired
    }
}

// --- RERR batch list ------------------------------------------------------

/// One unreachable destination reported in a batched RERR.
#[derive(Debug, Clone, Copy)]
pub struct UnreachableDestination {
    pub destination_address: UnicastAddress,
    pub destination_sequence_number: u32,
}

/// A batch of unreachable destinations all forwarded through the same
/// `next_hop`, coalesced into a single outgoing RERR. The destination
/// sublist is drained fully when the batch is deleted rather than cleared
/// piecemeal.
#[derive(Clone)]
pub struct RerrBatch {
    pub next_hop: UnicastAddress,
    pub net_idx: u16,
    pub destinations: Vec<UnreachableDestination>,
    deadline: Instant,
}

pub struct RerrBatchList {
    pool: BoundedSlab<RerrBatch>,
    indices: Mutex<Vec<usize>>,
    allocation_interval: Duration,
}

impl RerrBatchList {
    pub fn new(capacity: usize, allocation_interval: Duration) -> Self {
        Self {
            pool: BoundedSlab::new(capacity),
            indices: Mutex::new(Vec::new()),
            allocation_interval,
        }
    }

    /// Appends `destination` to the batch for `(next_hop, net_idx)`,
    /// creating one if none exists yet. Batches are flushed by the caller
    /// (e.g. on a short coalescing timer) via [`Self::take_all`].
    pub async fn add(
        &self,
        next_hop: UnicastAddress,
        net_idx: u16,
        destination: UnreachableDestination,
        batch_window: Duration,
    ) -> Result<(), RoutingError> {
        let indices = self.indices.lock().await.clone();
        for idx in indices {
            let matched = self
                .pool
                .with_mut(idx, |batch| {
                    if batch.next_hop == next_hop && batch.net_idx == net_idx {
                        batch.destinations.push(destination);
                        true
                    } else {
                        false
                    }
                })
                .await;
            if matched == Some(true) {
                return Ok(());
            }
        }

        let batch = RerrBatch {
            next_hop,
            net_idx,
            destinations: vec![destination],
            deadline: Instant::now() + batch_window,
        };
        let idx = self.pool.alloc(batch, self.allocation_interval).await?;
        self.indices.lock().await.push(idx);
        Ok(())
    }

    /// Drains every batch, returning them for the caller to encode and
    /// send. Each batch's destination sublist is moved out wholesale.
    pub async fn take_all(&self) -> Vec<RerrBatch> {
        let mut indices = self.indices.lock().await;
        let drained: Vec<usize> = indices.drain(..).collect();
        drop(indices);
        let mut batches = Vec::with_capacity(drained.len());
        for idx in drained {
            if let Some(batch) = self.pool.free(idx).await {
                batches.push(batch);
            }
        }
        batches
    }

    pub async fn take_expired(&self, now: Instant) -> Vec<RerrBatch> {
        let indices = self.indices.lock().await.clone();
        let mut expired = Vec::new();
        for idx in indices {
            let is_due = self.pool.get_cloned(idx).await.map(|b| b.deadline <= now).unwrap_or(false);
            if is_due {
                self.indices.lock().await.retain(|&i| i != idx);
                if let Some(batch) = self.pool.free(idx).await {
                    expired.push(batch);
                }
            }
        }
        expired
    }
}

// --- Neighbour (HELLO) list ------------------------------------------------

/// A directly-heard neighbour, kept alive by periodic HELLO messages.
#[derive(Debug, Clone, Copy)]
pub struct Neighbour {
    pub address: UnicastAddress,
    pub net_idx: u16,
    pub rssi: i8,
    deadline: Instant,
}

pub struct NeighbourList {
    pool: BoundedSlab<Neighbour>,
    indices: Mutex<Vec<usize>>,
    allocation_interval: Duration,
}

impl NeighbourList {
    pub fn new(capacity: usize, allocation_interval: Duration) -> Self {
        Self {
            pool: BoundedSlab::new(capacity),
            indices: Mutex::new(Vec::new()),
            allocation_interval,
        }
    }

    /// HELLO received from a known neighbour refreshes its lifetime and
    /// RSSI in place; from an unknown one, allocates a fresh entry.
    pub async fn add_or_refresh(
        &self,
        address: UnicastAddress,
        net_idx: u16,
        rssi: i8,
        lifetime: Duration,
    ) -> Result<AuxHandle, RoutingError> {
        if let Some((handle, _)) = self.find(address, net_idx).await {
            self.pool
                .with_mut(handle.0, |n| {
                    n.rssi = rssi;
                    n.deadline = Instant::now() + lifetime;
                })
                .await;
            return Ok(handle);
        }
        let record = Neighbour { address, net_idx, rssi, deadline: Instant::now() + lifetime };
        let idx = self.pool.alloc(record, self.allocation_interval).await?;
        self.indices.lock().await.push(idx);
        Ok(AuxHandle(idx))
    }

    pub async fn remove(&self, handle: AuxHandle) {
        self.indices.lock().await.retain(|&idx| idx != handle.0);
        self.pool.free(handle.0).await;
    }

    pub async fn find(&self, address: UnicastAddress, net_idx: u16) -> Option<(AuxHandle, Neighbour)> {
        let indices = self.indices.lock().await.clone();
        for idx in indices {
            if let Some(record) = self.pool.get_cloned(idx).await {
                if record.address == address && record.net_idx == net_idx {
                    return Some((AuxHandle(idx), record));
                }
            }
        }
        None
    }

    pub async fn sweep_expired(&self, now: Instant) -> Vec<Neighbour> {
        let indices = self.indices.lock().await.clone();
        let mut expired = Vec::new();
        for idx in indices {
            if let Some(record) = self.pool.get_cloned(idx).await {
                if record.deadline <= now {
                    self.remove(AuxHandle(idx)).await;
                    expired.push(record);
                }
            }
        }
        expired
    }
}
