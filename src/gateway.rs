use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use igd_next::{PortMappingProtocol, SearchOptions};
use tracing::debug;

use crate::error::GatewayError;

/// Label the mapping carries in the router's port table.
const MAPPING_DESCRIPTION: &str = "botlink control server";

/// How long gateway discovery may take before we give up.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Registers and removes the TCP port-forwarding rule that makes the server
/// reachable from outside the local network.
///
/// Both operations are recoverable from the server's point of view: a failed
/// `open_mapping` leaves the server listening locally, and a failed
/// `close_mapping` is logged and swallowed on the shutdown path.
#[async_trait]
pub trait GatewayMapper: Send + Sync {
    /// Ask the gateway to forward `port`/TCP to `internal:port` and return
    /// the gateway-reported external IP.
    async fn open_mapping(&self, internal: Ipv4Addr, port: u16) -> Result<IpAddr, GatewayError>;

    /// Best-effort removal of the rule for `port`/TCP.
    async fn close_mapping(&self, port: u16) -> Result<(), GatewayError>;
}

/// Production mapper speaking UPnP IGD via `igd-next`. The igd-next API is
/// blocking network I/O, so every call runs on the blocking thread pool.
///
/// The mapping is requested with lease 0 (permanent); it lives until
/// `close_mapping` removes it, so removal is tied to the server's shutdown
/// sequence rather than to anything non-deterministic.
#[derive(Default)]
pub struct UpnpMapper;

impl UpnpMapper {
    pub fn new() -> Self {
        Self
    }

    async fn discover() -> Result<igd_next::Gateway, GatewayError> {
        let gateway = tokio::task::spawn_blocking(|| {
            igd_next::search_gateway(SearchOptions {
                timeout: Some(SEARCH_TIMEOUT),
                ..Default::default()
            })
        })
        .await
        .map_err(|e| GatewayError::Unavailable(format!("discovery task failed: {e}")))?
        .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        debug!(gateway = %gateway.addr, "UPnP gateway discovered");
        Ok(gateway)
    }
}

#[async_trait]
impl GatewayMapper for UpnpMapper {
    async fn open_mapping(&self, internal: Ipv4Addr, port: u16) -> Result<IpAddr, GatewayError> {
        let gateway = Self::discover().await?;

        let local = SocketAddr::V4(SocketAddrV4::new(internal, port));
        let gw = gateway.clone();
        tokio::task::spawn_blocking(move || {
            gw.add_port(PortMappingProtocol::TCP, port, local, 0, MAPPING_DESCRIPTION)
        })
        .await
        .map_err(|e| GatewayError::Rejected(format!("mapping task failed: {e}")))?
        .map_err(|e| GatewayError::Rejected(e.to_string()))?;

        tokio::task::spawn_blocking(move || gateway.get_external_ip())
            .await
            .map_err(|e| GatewayError::Unavailable(format!("external-ip task failed: {e}")))?
            .map_err(|e| GatewayError::Unavailable(e.to_string()))
    }

    async fn close_mapping(&self, port: u16) -> Result<(), GatewayError> {
        // Fresh discovery: by the time we unmap, the handle from startup may
        // be long stale.
        let gateway = Self::discover().await?;

        tokio::task::spawn_blocking(move || gateway.remove_port(PortMappingProtocol::TCP, port))
            .await
            .map_err(|e| GatewayError::Rejected(format!("unmapping task failed: {e}")))?
            .map_err(|e| GatewayError::Rejected(e.to_string()))
    }
}
