//! Periodic sweep task: rather than one timer per entry, a single task wakes
//! on the shortest configured interval and sweeps every list for expiry.

use std::sync::Arc;

use log::warn;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::RrepMessage;
use crate::transport::CtlTransport;
use crate::Routing;

/// Handle to the spawned maintenance task; dropping it does not stop the
/// task (`tokio::spawn` detaches), abort explicitly if shutdown is needed.
pub struct MaintenanceHandle(JoinHandle<()>);

impl MaintenanceHandle {
    pub fn abort(&self) {
        self.0.abort();
    }
}

impl<T: CtlTransport + 'static> Routing<T> {
    /// Spawns the maintenance task on the current tokio runtime.
    pub fn spawn_maintenance(self: Arc<Self>) -> MaintenanceHandle {
        let interval = self.config.ring_search_poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.run_maintenance_tick(Instant::now()).await;
            }
        });
        MaintenanceHandle(handle)
    }

    async fn run_maintenance_tick(&self, now: Instant) {
        for (handle, entry) in self.table.take_pending_replies_due(now).await {
            self.table.update(handle, |e| e.pending_reply_on_expiry = false).await;
            self.table.validate_route(handle, self.config.lifetime_valid).await;

            let rrep = RrepMessage {
                repairable: false,
                source_address: entry.destination_address,
                destination_address: entry.source_address,
                destination_sequence_number: self.transport.current_seq(),
                hop_count: entry.hop_count,
                destination_number_of_elements: self.transport.elem_count(),
            };
            if let Err(err) = self.send_rrep(&rrep, &entry).await {
                warn!("failed to send deferred rrep for {}: {err}", entry.destination_address);
            }
        }

        self.table.sweep_expired(now).await;

        for batch in self.rerr_batches.take_expired(now).await {
            self.flush_one_batch(batch).await;
        }

        for neighbour in self.neighbours.sweep_expired(now).await {
            self.on_neighbour_lost(neighbour.address, neighbour.net_idx).await;
        }
    }
}
