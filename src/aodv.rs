//! AODV state machine: RREQ/RREP/RWAIT/RERR handling, ring search, and
//! neighbour heartbeat.

use log::{debug, trace, warn};

use crate::address::{seq_ge, seq_gt, UnicastAddress};
use crate::aux::{PendingReplyKind, UnreachableDestination};
use crate::codec::{RerrDestination, RerrMessage, RreqFlags, RreqMessage, RrepMessage, RwaitMessage};
use crate::entry::{RouteEntry, RouteList};
use crate::error::RoutingError;
use crate::table::NewRouteEntry;
use crate::transport::{CtlTransport, Opcode};
use crate::Routing;

/// Receive-side framing the lower layer supplies alongside a control-message
/// buffer.
#[derive(Debug, Clone, Copy)]
pub struct RxContext {
    /// Link-layer address of the node that forwarded this frame to us.
    pub prev_hop: UnicastAddress,
    pub net_idx: u16,
    pub recv_ttl: u8,
    /// RSSI this node measured receiving the frame.
    pub local_rx_rssi: i8,
}

fn averaged_rssi(peer_reported: i8, hop: u8, local_rx_rssi: i8) -> i8 {
    let hop = hop as i32;
    let avg = (peer_reported as i32 * hop + local_rx_rssi as i32) / (hop + 1);
    avg.clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

fn frame_overhead_estimate(payload_len: usize) -> usize {
    // One mesh-transport segment header per 11 bytes of payload.
    const SEGMENT_OVERHEAD: usize = 4;
    const SEGMENT_PAYLOAD: usize = 11;
    let segments = payload_len.div_ceil(SEGMENT_PAYLOAD).max(1);
    segments * SEGMENT_OVERHEAD + payload_len
}

impl<T: CtlTransport> Routing<T> {
    fn build_reverse_entry(
        &self,
        msg: &RreqMessage,
        prev_hop: UnicastAddress,
        rssi_avg: i8,
        net_idx: u16,
        pending_reply_on_expiry: bool,
    ) -> NewRouteEntry {
        NewRouteEntry {
            source_address: msg.destination_address,
            source_number_of_elements: 1,
            destination_address: msg.source_address,
            destination_number_of_elements: msg.source_number_of_elements,
            destination_sequence_number: msg.source_sequence_number,
            next_hop: prev_hop,
            hop_count: msg.hop_count,
            rssi: rssi_avg,
            repairable: false,
            net_idx,
            pending_reply_on_expiry,
        }
    }

    /// Broadcasts unless `flags.intermediate` is set and a valid route to
    /// the destination exists, in which case the message is sent directly
    /// to that route's next hop.
    pub(crate) async fn send_rreq(
        &self,
        msg: &RreqMessage,
        net_idx: u16,
        send_ttl: u8,
    ) -> Result<(), RoutingError> {
        let next_hop = if msg.flags.intermediate {
            match self.table.find_by_destination(RouteList::Valid, msg.destination_address, Some(net_idx)).await {
                Some((_, entry)) => entry.next_hop,
                None => crate::address::ALL_NODES,
            }
        } else {
            crate::address::ALL_NODES
        };
        let payload = msg.encode();
        trace!("rreq tx: ~{} bytes on air", frame_overhead_estimate(payload.len()));
        self.transport.ctl_send(next_hop, net_idx, send_ttl, Opcode::Rreq, &payload).await
    }

    /// Dispatches a received RREQ to the destination, known-route, or
    /// pure-relay handler depending on local state.
    pub async fn rreq_recv(&self, ctx: RxContext, buf: &[u8]) -> Result<(), RoutingError> {
        let msg = RreqMessage::decode(buf)?;
        trace!("rreq rx: ~{} bytes on air", frame_overhead_estimate(buf.len()));

        if self.transport.elem_find(msg.source_address) {
            return Err(RoutingError::LocalSource(msg.source_address));
        }

        let rssi_avg = averaged_rssi(msg.rssi, msg.hop_count, ctx.local_rx_rssi);

        if self.transport.elem_find(msg.destination_address) {
            return self.rreq_recv_at_destination(&msg, ctx, rssi_avg).await;
        }

        if self.transport.relay_enabled()
            && !msg.flags.destination_only
            && !msg.flags.intermediate
        {
            if let Some((_, valid)) = self
                .table
                .find_by_destination(RouteList::Valid, msg.destination_address, Some(ctx.net_idx))
                .await
            {
                return self.rreq_recv_via_known_route(&msg, ctx, rssi_avg, valid).await;
            }
        }

        self.rreq_recv_pure_relay(&msg, ctx, rssi_avg).await
    }

    async fn rreq_recv_at_destination(
        &self,
        msg: &RreqMessage,
        ctx: RxContext,
        rssi_avg: i8,
    ) -> Result<(), RoutingError> {
        if self
            .table
            .find_by_source_destination(RouteList::Valid, msg.destination_address, msg.source_address, Some(ctx.net_idx))
            .await
            .is_some()
        {
            return Err(RoutingError::AlreadyReplied(msg.destination_address));
        }

        if let Some((handle, existing)) = self
            .table
            .find_by_source_destination(RouteList::Invalid, msg.destination_address, msg.source_address, Some(ctx.net_idx))
            .await
        {
            let incoming_metric = crate::entry::combined_metric(msg.hop_count, rssi_avg, self.config.rssi_min);
            let existing_metric = existing.combined_metric(self.config.rssi_min);
            if incoming_metric < existing_metric {
                self.table
                    .update(handle, |e| {
                        e.destination_sequence_number = msg.source_sequence_number;
                        e.hop_count = msg.hop_count;
                        e.next_hop = ctx.prev_hop;
                        e.rssi = rssi_avg;
                    })
                    .await;
            }
            return Ok(());
        }

        let new_entry = self.build_reverse_entry(msg, ctx.prev_hop, rssi_avg, ctx.net_idx, true);
        self.table.alloc_into(RouteList::Invalid, new_entry, self.config.rreq_wait).await?;
        Ok(())
    }

    async fn rreq_recv_via_known_route(
        &self,
        msg: &RreqMessage,
        ctx: RxContext,
        rssi_avg: i8,
        valid: RouteEntry,
    ) -> Result<(), RoutingError> {
        let new_entry = self.build_reverse_entry(msg, ctx.prev_hop, rssi_avg, ctx.net_idx, false);
        self.table.alloc_into(RouteList::Invalid, new_entry, self.config.rreq_wait).await?;
        self.add_neighbour(ctx.prev_hop, ctx.net_idx, ctx.local_rx_rssi).await;

        let required = msg.destination_sequence_number.unwrap_or(0);
        if seq_ge(valid.destination_sequence_number, required) {
            let directed = RreqMessage {
                source_address: msg.source_address,
                destination_address: msg.destination_address,
                source_number_of_elements: msg.source_number_of_elements,
                hop_count: msg.hop_count + 1,
                rssi: rssi_avg,
                flags: RreqFlags { intermediate: true, ..msg.flags },
                source_sequence_number: msg.source_sequence_number,
                destination_sequence_number: msg.destination_sequence_number,
            };
            self.send_rreq(&directed, ctx.net_idx, ctx.recv_ttl.saturating_sub(1)).await?;

            let rwait = RwaitMessage {
                destination_address: msg.destination_address,
                source_address: msg.source_address,
                source_sequence_number: msg.source_sequence_number,
                hop_count: valid.hop_count,
            };
            self.transport
                .ctl_send(ctx.prev_hop, ctx.net_idx, 0, Opcode::Rwait, &rwait.encode())
                .await?;
            Ok(())
        } else {
            self.relay_rreq(msg, ctx, rssi_avg).await
        }
    }

    async fn rreq_recv_pure_relay(
        &self,
        msg: &RreqMessage,
        ctx: RxContext,
        rssi_avg: i8,
    ) -> Result<(), RoutingError> {
        if !self.transport.relay_enabled() {
            debug!("relay disabled, dropping rreq for {}", msg.destination_address);
            return Ok(());
        }

        match self
            .table
            .find_by_source_destination(RouteList::Invalid, msg.destination_address, msg.source_address, Some(ctx.net_idx))
            .await
        {
            Some((handle, existing)) => {
                if seq_gt(msg.source_sequence_number, existing.destination_sequence_number) {
                    self.table
                        .update(handle, |e| {
                            e.destination_sequence_number = msg.source_sequence_number;
                            e.hop_count = msg.hop_count;
                            e.next_hop = ctx.prev_hop;
                            e.rssi = rssi_avg;
                        })
                        .await;
                    self.table.refresh_lifetime_invalid(handle, self.config.rreq_wait).await;
                    self.relay_rreq(msg, ctx, rssi_avg).await
                } else {
                    Ok(())
                }
            }
            None => {
                let new_entry = self.build_reverse_entry(msg, ctx.prev_hop, rssi_avg, ctx.net_idx, false);
                self.table.alloc_into(RouteList::Invalid, new_entry, self.config.rreq_wait).await?;
                self.relay_rreq(msg, ctx, rssi_avg).await
            }
        }
    }

    async fn relay_rreq(&self, msg: &RreqMessage, ctx: RxContext, rssi_avg: i8) -> Result<(), RoutingError> {
        if ctx.recv_ttl <= 1 {
            return Ok(());
        }
        let relayed = RreqMessage { hop_count: msg.hop_count + 1, rssi: rssi_avg, ..msg.clone() };
        self.send_rreq(&relayed, ctx.net_idx, ctx.recv_ttl - 1).await
    }

    /// `send_ttl = 0`, sent directly to `reverse.next_hop`.
    pub(crate) async fn send_rrep(&self, msg: &RrepMessage, reverse: &RouteEntry) -> Result<(), RoutingError> {
        let payload = msg.encode();
        trace!("rrep tx: ~{} bytes on air", frame_overhead_estimate(payload.len()));
        self.transport.ctl_send(reverse.next_hop, reverse.net_idx, 0, Opcode::Rrep, &payload).await
    }

    /// Handles a received RREP as either the original requester (resolving
    /// a ring search) or an intermediate relay (validating the reverse
    /// entry and forwarding toward it).
    pub async fn rrep_recv(&self, ctx: RxContext, buf: &[u8]) -> Result<(), RoutingError> {
        let msg = RrepMessage::decode(buf)?;
        trace!("rrep rx: ~{} bytes on air", frame_overhead_estimate(buf.len()));

        if self.transport.elem_find(msg.source_address) {
            let existing = self
                .table
                .find_by_source_destination(RouteList::Valid, msg.source_address, msg.destination_address, None)
                .await;

            let should_create = match &existing {
                None => true,
                Some((handle, stored)) => {
                    if seq_gt(msg.destination_sequence_number, stored.destination_sequence_number) {
                        self.table.free(*handle).await;
                        true
                    } else {
                        false
                    }
                }
            };

            if should_create {
                let forward = NewRouteEntry {
                    source_address: msg.source_address,
                    source_number_of_elements: self.transport.elem_count(),
                    destination_address: msg.destination_address,
                    destination_number_of_elements: msg.destination_number_of_elements,
                    destination_sequence_number: msg.destination_sequence_number,
                    next_hop: ctx.prev_hop,
                    hop_count: msg.hop_count,
                    rssi: ctx.local_rx_rssi,
                    repairable: msg.repairable,
                    net_idx: ctx.net_idx,
                    pending_reply_on_expiry: false,
                };
                self.table.alloc_into(RouteList::Valid, forward, self.config.lifetime_valid).await?;

                if let Some((_, pending)) = self.pending.find_by_destination(msg.destination_address, ctx.net_idx).await {
                    pending.notify.notify_one();
                } else {
                    let (_, notify) = self
                        .pending
                        .insert(
                            msg.destination_address,
                            ctx.net_idx,
                            PendingReplyKind::RrepArrived { hop_count: msg.hop_count },
                            self.config.ring_search_poll_interval,
                        )
                        .await?;
                    notify.notify_one();
                }
            }

            self.add_neighbour(ctx.prev_hop, ctx.net_idx, ctx.local_rx_rssi).await;
            return Ok(());
        }

        let (handle, reverse) = match self
            .table
            .find_by_source_destination_exact(RouteList::Invalid, msg.destination_address, msg.source_address, ctx.net_idx)
            .await
        {
            Some(found) => found,
            None => {
                warn!("rrep for {} has no matching reverse entry, dropping", msg.destination_address);
                return Ok(());
            }
        };

        self.table
            .update(handle, |e| {
                e.source_number_of_elements = msg.destination_number_of_elements;
            })
            .await;
        self.table.validate_route(handle, self.config.lifetime_valid).await;

        let forward = NewRouteEntry {
            source_address: reverse.destination_address,
            source_number_of_elements: msg.destination_number_of_elements,
            destination_address: reverse.source_address,
            destination_number_of_elements: reverse.destination_number_of_elements,
            destination_sequence_number: msg.destination_sequence_number,
            next_hop: ctx.prev_hop,
            hop_count: msg.hop_count,
            rssi: ctx.local_rx_rssi,
            repairable: msg.repairable,
            net_idx: ctx.net_idx,
            pending_reply_on_expiry: false,
        };
        self.table.alloc_into(RouteList::Valid, forward, self.config.lifetime_valid).await?;

        self.add_neighbour(ctx.prev_hop, ctx.net_idx, ctx.local_rx_rssi).await;

        let forwarded = RrepMessage { hop_count: msg.hop_count + 1, ..msg };
        self.send_rrep(&forwarded, &reverse).await
    }

    /// Records a pending RWAIT hint for an originator still waiting on a
    /// ring search, or relays it onward when this node is only forwarding.
    pub async fn rwait_recv(&self, ctx: RxContext, buf: &[u8]) -> Result<(), RoutingError> {
        let msg = RwaitMessage::decode(buf)?;

        if self.transport.elem_find(msg.source_address) {
            if self
                .table
                .find_by_source_destination(RouteList::Valid, msg.source_address, msg.destination_address, None)
                .await
                .is_none()
            {
                if let Some((_, pending)) = self.pending.find_by_destination(msg.destination_address, ctx.net_idx).await {
                    pending.notify.notify_one();
                } else {
                    let (_, notify) = self
                        .pending
                        .insert(
                            msg.destination_address,
                            ctx.net_idx,
                            PendingReplyKind::RwaitHint { hop_count: msg.hop_count },
                            self.config.ring_search_poll_interval,
                        )
                        .await?;
                    notify.notify_one();
                }
            }
            return Ok(());
        }

        if self
            .table
            .find_by_source_destination_exact(RouteList::Invalid, msg.destination_address, msg.source_address, ctx.net_idx)
            .await
            .is_none()
        {
            debug!("relaying rwait for {}, no local reverse entry", msg.destination_address);
            self.transport.ctl_send(ctx.prev_hop, ctx.net_idx, 0, Opcode::Rwait, buf).await?;
        }
        Ok(())
    }

    pub(crate) async fn add_neighbour(&self, address: UnicastAddress, net_idx: u16, rssi: i8) {
        if let Err(err) = self.neighbours.add_or_refresh(address, net_idx, rssi, self.config.hello_lifetime).await {
            warn!("failed to record neighbour {address}: {err}");
        }
    }

    pub(crate) async fn remove_neighbour(&self, address: UnicastAddress, net_idx: u16) {
        if self.table.find_by_next_hop(RouteList::Valid, address, net_idx).await.is_none() {
            if let Some((handle, _)) = self.neighbours.find(address, net_idx).await {
                self.neighbours.remove(handle).await;
            }
        }
    }

    /// Link drop fan-out, triggered when a neighbour's HELLO_LIFETIME
    /// expires: every route through it is invalidated and, where a reverse
    /// path exists, batched into an RERR toward the route's source.
    pub(crate) async fn on_neighbour_lost(&self, failed: UnicastAddress, net_idx: u16) {
        let matches = self.table.find_all_by_next_hop(RouteList::Valid, failed, net_idx).await;
        for (handle, entry) in matches {
            if self.transport.elem_find(entry.source_address) {
                self.table.invalidate_route(handle, self.config.lifetime_valid).await;
                continue;
            }

            let reverse = self
                .table
                .find_by_source_destination_exact(RouteList::Valid, entry.destination_address, entry.source_address, net_idx)
                .await
                .or(
                    self.table
                        .find_by_source_destination_exact(RouteList::Invalid, entry.destination_address, entry.source_address, net_idx)
                        .await,
                );

            self.table.invalidate_route(handle, self.config.lifetime_valid).await;
            if let Some((reverse_handle, reverse_entry)) = reverse {
                self.table.invalidate_route(reverse_handle, self.config.lifetime_valid).await;
                if let Err(err) = self
                    .rerr_batches
                    .add(
                        reverse_entry.next_hop,
                        net_idx,
                        UnreachableDestination {
                            destination_address: entry.destination_address,
                            destination_sequence_number: entry.destination_sequence_number,
                        },
                        self.config.ring_search_poll_interval,
                    )
                    .await
                {
                    warn!("rerr batch exhausted while reporting {}: {err}", entry.destination_address);
                }
            }
        }

        self.remove_neighbour(failed, net_idx).await;
        self.flush_rerr_batches().await;
    }

    pub(crate) async fn flush_rerr_batches(&self) {
        for batch in self.rerr_batches.take_all().await {
            self.flush_one_batch(batch).await;
        }
    }

    pub(crate) async fn flush_one_batch(&self, batch: crate::aux::RerrBatch) {
        let msg = RerrMessage {
            destinations: batch
                .destinations
                .iter()
                .map(|d| RerrDestination {
                    destination_address: d.destination_address,
                    destination_sequence_number: d.destination_sequence_number,
                })
                .collect(),
        };
        let payload = msg.encode();
        trace!("rerr tx: ~{} bytes on air", frame_overhead_estimate(payload.len()));
        if let Err(err) = self.transport.ctl_send(batch.next_hop, batch.net_idx, 0, Opcode::Rerr, &payload).await {
            warn!("failed to send rerr batch to {}: {err}", batch.next_hop);
        }
    }

    /// Invalidates every route through the reporting neighbour that matches
    /// an unreachable destination, re-batching toward each route's source
    /// where a reverse path survives.
    pub async fn rerr_recv(&self, ctx: RxContext, buf: &[u8]) -> Result<(), RoutingError> {
        let msg = RerrMessage::decode(buf)?;
        trace!("rerr rx: ~{} bytes on air", frame_overhead_estimate(buf.len()));

        for dest in &msg.destinations {
            let matches = self
                .table
                .find_all_by_destination_next_hop(RouteList::Valid, dest.destination_address, ctx.prev_hop, ctx.net_idx)
                .await;
            for (handle, entry) in matches {
                if self.transport.elem_find(entry.source_address) {
                    self.table.invalidate_route(handle, self.config.lifetime_valid).await;
                    continue;
                }
                let reverse = self
                    .table
                    .find_by_source_destination_exact(RouteList::Valid, entry.destination_address, entry.source_address, ctx.net_idx)
                    .await;
                self.table.invalidate_route(handle, self.config.lifetime_valid).await;
                if let Some((reverse_handle, reverse_entry)) = reverse {
                    self.table.invalidate_route(reverse_handle, self.config.lifetime_valid).await;
                    let _ = self
                        .rerr_batches
                        .add(
                            reverse_entry.next_hop,
                            ctx.net_idx,
                            UnreachableDestination {
                                destination_address: dest.destination_address,
                                destination_sequence_number: dest.destination_sequence_number,
                            },
                            self.config.ring_search_poll_interval,
                        )
                        .await;
                }
            }
        }

        self.remove_neighbour(ctx.prev_hop, ctx.net_idx).await;
        self.flush_rerr_batches().await;
        Ok(())
    }

    /// Refreshes an already-known neighbour's liveness deadline; ignores
    /// HELLOs from addresses this node hasn't recorded as neighbours.
    pub async fn hello_msg_recv(&self, src_addr: UnicastAddress, net_idx: u16) {
        if self.neighbours.find(src_addr, net_idx).await.is_some() {
            self.add_neighbour(src_addr, net_idx, 0).await;
        } else {
            debug!("hello from {src_addr} not of interest");
        }
    }
}
