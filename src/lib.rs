//! AODV-style on-demand routing core for a Bluetooth Mesh transport.
//!
//! [`Routing`] is the process-wide context: it owns the routing table and
//! the three auxiliary lists, and exposes the downward interface the host
//! transport calls into (`rreq_recv`, `rrep_recv`, `rwait_recv`,
//! `rerr_recv`, `hello_msg_recv`, `ring_search`).

pub mod address;
pub mod aodv;
pub mod aux;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
mod maintenance;
pub mod pool;
pub mod table;
pub mod transport;

use std::sync::Arc;

use log::trace;

use address::UnicastAddress;
use aux::{NeighbourList, PendingReplyList, RerrBatchList};
use codec::RreqFlags;
use config::RoutingConfig;
use entry::RouteEntry;
use error::RoutingError;
use table::RoutingTable;
use transport::CtlTransport;

pub use maintenance::MaintenanceHandle;

/// Owns the routing table, the auxiliary lists, and a handle to the host
/// transport. One instance per mesh node.
pub struct Routing<T: CtlTransport> {
    pub(crate) table: RoutingTable,
    pub(crate) pending: PendingReplyList,
    pub(crate) rerr_batches: RerrBatchList,
    pub(crate) neighbours: NeighbourList,
    pub(crate) config: RoutingConfig,
    pub(crate) transport: Arc<T>,
}

impl<T: CtlTransport> Routing<T> {
    /// Read-only access to the routing table, for introspection by hosts
    /// and tests (e.g. priming a cached route before exercising RWAIT).
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn new(config: RoutingConfig, transport: Arc<T>) -> Self {
        Self {
            table: RoutingTable::new(config.number_of_entries, config.allocation_interval),
            pending: PendingReplyList::new(config.number_of_entries, config.allocation_interval),
            rerr_batches: RerrBatchList::new(config.number_of_entries, config.allocation_interval),
            neighbours: NeighbourList::new(config.number_of_entries, config.allocation_interval),
            config,
            transport,
        }
    }

    /// Expanding-ring search, invoked by the transport when it has no valid
    /// route to `destination_address`. Blocks the caller until a route
    /// resolves or `NoReply`.
    pub async fn ring_search(
        &self,
        destination_address: UnicastAddress,
        net_idx: u16,
    ) -> Result<RouteEntry, RoutingError> {
        let mut ttl = self.config.ring_search_initial_ttl;

        loop {
            if ttl > self.config.rreq_ring_search_max_ttl {
                return Err(RoutingError::NoReply(destination_address));
            }

            let request = codec::RreqMessage {
                source_address: self.transport.primary_addr(),
                destination_address,
                source_number_of_elements: self.transport.elem_count(),
                hop_count: 0,
                rssi: 0,
                flags: RreqFlags { unknown_seq: true, ..RreqFlags::default() },
                source_sequence_number: self.transport.current_seq(),
                destination_sequence_number: None,
            };
            self.send_rreq(&request, net_idx, ttl).await?;

            let mut ring_wait = self.config.rreq_ring_search_wait_interval;
            let mut ring_deadline = tokio::time::Instant::now() + ring_wait;

            loop {
                if tokio::time::Instant::now() >= ring_deadline {
                    break;
                }
                tokio::time::sleep(self.config.ring_search_poll_interval).await;

                let Some((handle, record)) =
                    self.pending.find_by_destination(destination_address, net_idx).await
                else {
                    continue;
                };

                match record.kind {
                    aux::PendingReplyKind::RwaitHint { hop_count } => {
                        trace!("ring search for {destination_address}: rwait hint, hop={hop_count}");
                        self.pending.remove(handle).await;
                        ring_wait = self.config.rreq_ring_search_wait_interval * 4;
                        ring_deadline = tokio::time::Instant::now() + ring_wait;
                    }
                    aux::PendingReplyKind::RrepArrived { .. } => {
                        self.pending.remove(handle).await;
                        if let Some((_, entry)) = self
                            .table
                            .find_by_source_destination(
                                table::RouteList::Valid,
                                self.transport.primary_addr(),
                                destination_address,
                                Some(net_idx),
                            )
                            .await
                        {
                            return Ok(entry);
                        }
                    }
                }
            }

            ttl += 1;
        }
    }
}
