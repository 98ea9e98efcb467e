//! Error taxonomy for the routing core.

use crate::address::UnicastAddress;

/// Errors raised by the routing core.
///
/// Receive-path errors are logged and dropped by the caller; send-path and
/// ring-search errors propagate to the originating transport call. No
/// variant here is raised mid-mutation: operations either complete or leave
/// the routing table/auxiliary lists exactly as they were found.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The RREQ's source address belongs to a local element; dropped to
    /// prevent loopback from adjacent elements.
    #[error("rreq source {0} is a local element")]
    LocalSource(UnicastAddress),

    /// A valid reverse entry already answers this RREQ; dropped.
    #[error("already replied to rreq for destination {0}")]
    AlreadyReplied(UnicastAddress),

    /// A slab allocation could not complete within `ALLOCATION_INTERVAL`.
    #[error("route entry pool exhausted")]
    PoolExhausted,

    /// Ring search reached `RREQ_RING_SEARCH_MAX_TTL` with no reply.
    #[error("no reply to route request for {0}")]
    NoReply(UnicastAddress),

    /// A decoded control message was shorter than its wire format requires.
    #[error("malformed control message: need {expected} bytes, got {got}")]
    MalformedBuffer { expected: usize, got: usize },

    /// The lower layer rejected the operation because the node is not
    /// provisioned.
    #[error("node is not provisioned")]
    NotProvisioned,

    /// `ctl_send` returned a nonzero/failed outcome.
    #[error("ctl_send failed")]
    SendFailed,
}
