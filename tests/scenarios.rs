//! End-to-end scenarios wiring multiple [`Routing`] instances through an
//! in-memory broadcast network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, Once};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aodv_router::address::{ElementRange, UnicastAddress, ALL_NODES};
use aodv_router::aodv::RxContext;
use aodv_router::codec::RreqMessage;
use aodv_router::config::RoutingConfig;
use aodv_router::error::RoutingError;
use aodv_router::transport::{CtlTransport, Opcode};
use aodv_router::Routing;

fn setup_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

fn test_config() -> RoutingConfig {
    RoutingConfig {
        number_of_entries: 20,
        allocation_interval: Duration::from_millis(50),
        lifetime_valid: Duration::from_secs(2),
        rreq_wait: Duration::from_millis(30),
        rreq_ring_search_wait_interval: Duration::from_millis(200),
        rreq_ring_search_max_ttl: 5,
        hello_lifetime: Duration::from_millis(300),
        rssi_min: -90,
        ring_search_poll_interval: Duration::from_millis(10),
        ring_search_initial_ttl: 2,
    }
}

struct SimNetwork {
    nodes: Mutex<HashMap<UnicastAddress, Arc<Routing<SimTransport>>>>,
    neighbours: Mutex<HashMap<UnicastAddress, Vec<UnicastAddress>>>,
}

impl SimNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self { nodes: Mutex::new(HashMap::new()), neighbours: Mutex::new(HashMap::new()) })
    }

    fn link(&self, a: UnicastAddress, b: UnicastAddress) {
        self.neighbours.lock().unwrap().entry(a).or_default().push(b);
        self.neighbours.lock().unwrap().entry(b).or_default().push(a);
    }

    fn register(&self, addr: UnicastAddress, routing: Arc<Routing<SimTransport>>) {
        self.nodes.lock().unwrap().insert(addr, routing);
    }
}

struct SimTransport {
    addr: UnicastAddress,
    network: Arc<SimNetwork>,
    seq: AtomicU32,
}

impl SimTransport {
    async fn deliver(&self, target: UnicastAddress, net_idx: u16, send_ttl: u8, opcode: Opcode, payload: &[u8]) {
        let node = self.network.nodes.lock().unwrap().get(&target).cloned();
        let Some(node) = node else { return };
        let ctx = RxContext { prev_hop: self.addr, net_idx, recv_ttl: send_ttl, local_rx_rssi: -50 };
        let result = match opcode {
            Opcode::Rreq => node.rreq_recv(ctx, payload).await,
            Opcode::Rrep => node.rrep_recv(ctx, payload).await,
            Opcode::Rwait => node.rwait_recv(ctx, payload).await,
            Opcode::Rerr => node.rerr_recv(ctx, payload).await,
            Opcode::Heartbeat => {
                node.hello_msg_recv(self.addr, net_idx).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            log::debug!("node {target:#06x} dropped frame from {:#06x}: {err}", self.addr);
        }
    }
}

#[async_trait]
impl CtlTransport for SimTransport {
    async fn ctl_send(
        &self,
        next_hop: UnicastAddress,
        net_idx: u16,
        send_ttl: u8,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), RoutingError> {
        if next_hop == ALL_NODES {
            let targets = self.network.neighbours.lock().unwrap().get(&self.addr).cloned().unwrap_or_default();
            for target in targets {
                self.deliver(target, net_idx, send_ttl, opcode, payload).await;
            }
        } else {
            self.deliver(next_hop, net_idx, send_ttl, opcode, payload).await;
        }
        Ok(())
    }

    fn primary_addr(&self) -> UnicastAddress {
        self.addr
    }

    fn elem_count(&self) -> u16 {
        1
    }

    fn elem_find(&self, addr: UnicastAddress) -> bool {
        ElementRange::new(self.addr, 1).contains(addr)
    }

    fn current_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn relay_enabled(&self) -> bool {
        true
    }

    fn is_provisioned(&self) -> bool {
        true
    }
}

fn spawn_node(network: &Arc<SimNetwork>, addr: UnicastAddress) -> Arc<Routing<SimTransport>> {
    let transport = Arc::new(SimTransport { addr, network: network.clone(), seq: AtomicU32::new(1) });
    let routing = Arc::new(Routing::new(test_config(), transport));
    network.register(addr, routing.clone());
    routing.clone().spawn_maintenance();
    routing
}

/// Three-node discovery over A -> B -> C.
#[tokio::test]
async fn three_node_discovery_resolves_a_route() {
    setup_logging();
    let network = SimNetwork::new();
    network.link(0x0001, 0x0002);
    network.link(0x0002, 0x0003);

    let a = spawn_node(&network, 0x0001);
    let _b = spawn_node(&network, 0x0002);
    let _c = spawn_node(&network, 0x0003);

    let route = tokio::time::timeout(Duration::from_secs(3), a.ring_search(0x0003, 0))
        .await
        .expect("ring search timed out")
        .expect("ring search failed");

    assert_eq!(route.next_hop, 0x0002);
    assert_eq!(route.hop_count, 2);
}

/// An intermediate node with a cached route replies with RWAIT while a
/// fresh RREQ continues toward the real destination.
#[tokio::test]
async fn rwait_extends_ring_search_until_rrep_arrives() {
    setup_logging();
    let network = SimNetwork::new();
    network.link(0x0001, 0x0002);
    network.link(0x0002, 0x0003);

    let a = spawn_node(&network, 0x0001);
    let b = spawn_node(&network, 0x0002);
    let _c = spawn_node(&network, 0x0003);

    // Prime B with a cached valid route to C before A's search begins.
    let primed_entry = aodv_router::table::NewRouteEntry {
        source_address: 0x0002,
        source_number_of_elements: 1,
        destination_address: 0x0003,
        destination_number_of_elements: 1,
        destination_sequence_number: 5,
        next_hop: 0x0003,
        hop_count: 1,
        rssi: -40,
        repairable: false,
        net_idx: 0,
        pending_reply_on_expiry: false,
    };
    b.table().alloc_into(aodv_router::table::RouteList::Valid, primed_entry, Duration::from_secs(5))
        .await
        .unwrap();

    let route = tokio::time::timeout(Duration::from_secs(3), a.ring_search(0x0003, 0))
        .await
        .expect("ring search timed out")
        .expect("ring search failed");

    assert_eq!(route.destination_address, 0x0003);
}

/// Ring search exhausts every TTL step with no reply.
#[tokio::test]
async fn ring_search_exhaustion_reports_no_reply() {
    setup_logging();
    let network = SimNetwork::new();
    network.link(0x0001, 0x0002);

    let a = spawn_node(&network, 0x0001);
    let _b = spawn_node(&network, 0x0002);

    let result = tokio::time::timeout(Duration::from_secs(3), a.ring_search(0x00AA, 0)).await.unwrap();
    assert!(matches!(result, Err(RoutingError::NoReply(0x00AA))));
}

/// RREQ/RREP/RWAIT/RERR round-trip through the public receive entry points,
/// not just the codec (complements the unit-level codec round-trip tests).
#[tokio::test]
async fn local_destination_receives_rreq_and_answers() {
    setup_logging();
    let network = SimNetwork::new();
    network.link(0x0001, 0x0002);

    let _a = spawn_node(&network, 0x0001);
    let b = spawn_node(&network, 0x0002);

    let rreq = RreqMessage {
        source_address: 0x0001,
        destination_address: 0x0002,
        source_number_of_elements: 1,
        hop_count: 0,
        rssi: -40,
        flags: aodv_router::codec::RreqFlags::default(),
        source_sequence_number: 1,
        destination_sequence_number: Some(0),
    };
    let ctx = RxContext { prev_hop: 0x0001, net_idx: 0, recv_ttl: 2, local_rx_rssi: -45 };
    b.rreq_recv(ctx, &rreq.encode()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let found = b
        .table()
        .find_by_source_destination(aodv_router::table::RouteList::Valid, 0x0002, 0x0001, None)
        .await;
    assert!(found.is_some(), "destination should have validated its reverse route and replied");
}
