//! The boundary between this routing core and the host mesh stack: the core
//! never owns a socket or a radio, it only calls down through a narrow
//! trait.

use async_trait::async_trait;

use crate::address::UnicastAddress;
use crate::error::RoutingError;

/// Control-message opcode, defined by the host mesh stack; this core treats
/// the values as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rreq,
    Rrep,
    Rwait,
    Rerr,
    Heartbeat,
}

/// Everything the routing core needs from the host mesh stack to send a
/// control message and to answer identity/capability queries about the
/// local node.
#[async_trait]
pub trait CtlTransport: Send + Sync {
    /// Sends `payload` with the given `opcode` to `next_hop` on `net_idx`,
    /// with `send_ttl` hop budget. `send_ttl = 0` means "do not decrement
    /// further" (used by RREP send).
    async fn ctl_send(
        &self,
        next_hop: UnicastAddress,
        net_idx: u16,
        send_ttl: u8,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), RoutingError>;

    /// This node's primary unicast address.
    fn primary_addr(&self) -> UnicastAddress;

    /// Number of elements owned by this node, starting at `primary_addr`.
    fn elem_count(&self) -> u16;

    /// True if `addr` falls within one of this node's owned element ranges.
    fn elem_find(&self, addr: UnicastAddress) -> bool;

    /// Current originating sequence number.
    fn current_seq(&self) -> u32;

    /// Whether this node forwards RREQs it is not the destination of.
    fn relay_enabled(&self) -> bool;

    /// Whether the node has completed mesh provisioning.
    fn is_provisioned(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// A loopback transport that records every send instead of putting it
    /// on the air, for use by unit and integration tests.
    pub struct RecordingTransport {
        pub addr: UnicastAddress,
        pub count: u16,
        pub relay: bool,
        pub provisioned: bool,
        pub seq: AtomicU32,
        pub sent: Mutex<Vec<(UnicastAddress, u16, u8, Opcode, Vec<u8>)>>,
    }

    impl RecordingTransport {
        pub fn new(addr: UnicastAddress) -> Self {
            Self {
                addr,
                count: 1,
                relay: true,
                provisioned: true,
                seq: AtomicU32::new(1),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CtlTransport for RecordingTransport {
        async fn ctl_send(
            &self,
            next_hop: UnicastAddress,
            net_idx: u16,
            send_ttl: u8,
            opcode: Opcode,
            payload: &[u8],
        ) -> Result<(), RoutingError> {
            self.sent.lock().unwrap().push((next_hop, net_idx, send_ttl, opcode, payload.to_vec()));
            Ok(())
        }

        fn primary_addr(&self) -> UnicastAddress {
            self.addr
        }

        fn elem_count(&self) -> u16 {
            self.count
        }

        fn elem_find(&self, addr: UnicastAddress) -> bool {
            crate::address::ElementRange::new(self.addr, self.count).contains(addr)
        }

        fn current_seq(&self) -> u32 {
            self.seq.fetch_add(1, Ordering::SeqCst)
        }

        fn relay_enabled(&self) -> bool {
            self.relay
        }

        fn is_provisioned(&self) -> bool {
            self.provisioned
        }
    }
}
