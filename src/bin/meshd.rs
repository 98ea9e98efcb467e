use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use log::{info, warn};

use aodv_router::address::{ElementRange, UnicastAddress};
use aodv_router::config::RoutingConfig;
use aodv_router::error::RoutingError;
use aodv_router::transport::{CtlTransport, Opcode};
use aodv_router::Routing;

#[derive(Parser, Debug)]
#[command(name = "meshd")]
struct Args {
    /// This node's primary unicast address, e.g. 0x0001.
    #[arg(long, value_parser = parse_hex_u16, default_value = "0x0001")]
    addr: UnicastAddress,

    /// Number of elements this node owns, starting at `addr`.
    #[arg(long, default_value_t = 1)]
    elements: u16,

    /// Destination to ring-search for on startup, if any.
    #[arg(long, value_parser = parse_hex_u16)]
    find: Option<UnicastAddress>,

    /// Path to a TOML file overriding the default routing parameters.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_hex_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Prints every control message instead of putting it on the air; stands in
/// for the lower mesh stack this core would otherwise be wired to.
struct LoggingTransport {
    addr: UnicastAddress,
    elements: u16,
    seq: AtomicU32,
}

#[async_trait]
impl CtlTransport for LoggingTransport {
    async fn ctl_send(
        &self,
        next_hop: UnicastAddress,
        net_idx: u16,
        send_ttl: u8,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), RoutingError> {
        info!(
            "ctl_send next_hop={next_hop:#06x} net_idx={net_idx} ttl={send_ttl} opcode={opcode:?} len={}",
            payload.len()
        );
        Ok(())
    }

    fn primary_addr(&self) -> UnicastAddress {
        self.addr
    }

    fn elem_count(&self) -> u16 {
        self.elements
    }

    fn elem_find(&self, addr: UnicastAddress) -> bool {
        ElementRange::new(self.addr, self.elements).contains(addr)
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

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RoutingConfig::from_path(path).unwrap_or_else(|err| {
            warn!("failed to load {}: {err}, using defaults", path.display());
            RoutingConfig::default()
        }),
        None => RoutingConfig::default(),
    };

    let transport =
        Arc::new(LoggingTransport { addr: args.addr, elements: args.elements, seq: AtomicU32::new(1) });
    let routing = Arc::new(Routing::new(config, transport));
    let _maintenance = routing.clone().spawn_maintenance();

    info!("meshd started: addr={:#06x} elements={}", args.addr, args.elements);

    if let Some(destination) = args.find {
        match routing.ring_search(destination, 0).await {
            Ok(entry) => info!("route found: next_hop={:#06x} hop_count={}", entry.next_hop, entry.hop_count),
            Err(err) => info!("ring search failed: {err}"),
        }
    }
}
