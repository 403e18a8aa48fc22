//! PTP/IP discovery.
//!
//! The core never joins networks. It asks the [`NetworkEnvironment`] what
//! the host is currently connected to and searches within that:
//!
//! - **Access point**: the host joined the camera's own network, so the
//!   gateway is the camera. It is the only candidate; a TCP probe sets the
//!   online flag.
//! - **Station**: camera and host share a network. Every host address of the
//!   local subnet (minus our own) is probed on the PTP/IP port, a bounded
//!   number at a time. Only responders become candidates.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::transport::TransportKind;

use super::{DeviceCandidate, DeviceIdentity, DiscoveryService};

// ============================================================================
// NetworkEnvironment
// ============================================================================

/// The network the host is currently joined to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIdentity {
    /// Wireless network name, if known.
    pub ssid: Option<String>,
    /// Host address on this network.
    pub local_addr: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// Default gateway.
    pub gateway: Option<Ipv4Addr>,
}

/// Wireless network subsystem boundary.
pub trait NetworkEnvironment: Send + Sync {
    /// Returns the current network, or `None` when not connected.
    fn identity(&self) -> Option<NetworkIdentity>;
}

/// Fixed network identity.
#[derive(Debug, Clone)]
pub struct StaticNetwork(Option<NetworkIdentity>);

impl StaticNetwork {
    /// A host joined to `identity`.
    #[must_use]
    pub fn new(identity: NetworkIdentity) -> Self {
        Self(Some(identity))
    }

    /// A host without a network.
    #[must_use]
    pub fn offline() -> Self {
        Self(None)
    }
}

impl NetworkEnvironment for StaticNetwork {
    fn identity(&self) -> Option<NetworkIdentity> {
        self.0.clone()
    }
}

// ============================================================================
// PtpIpDiscovery
// ============================================================================

/// Finds PTP/IP responders in one of the two network modes.
#[derive(Clone)]
pub struct PtpIpDiscovery {
    env: Arc<dyn NetworkEnvironment>,
    kind: TransportKind,
    port: u16,
    probe_timeout: Duration,
    concurrency: usize,
    host_limit: usize,
}

impl PtpIpDiscovery {
    /// Discovery for a camera-hosted access point.
    #[must_use]
    pub fn access_point(env: Arc<dyn NetworkEnvironment>, port: u16, probe_timeout: Duration) -> Self {
        Self {
            env,
            kind: TransportKind::PtpIpAccessPoint,
            port,
            probe_timeout,
            concurrency: 1,
            host_limit: 1,
        }
    }

    /// Discovery on a shared network.
    #[must_use]
    pub fn station(
        env: Arc<dyn NetworkEnvironment>,
        port: u16,
        probe_timeout: Duration,
        concurrency: usize,
        host_limit: usize,
    ) -> Self {
        Self {
            env,
            kind: TransportKind::PtpIpStation,
            port,
            probe_timeout,
            concurrency: concurrency.max(1),
            host_limit,
        }
    }

    /// Returns the network environment.
    #[inline]
    #[must_use]
    pub fn environment(&self) -> &Arc<dyn NetworkEnvironment> {
        &self.env
    }

    /// Returns the probed port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn discover_access_point(&self, identity: NetworkIdentity) -> BoxStream<'static, DeviceCandidate> {
        let Some(gateway) = identity.gateway else {
            warn!(ssid = ?identity.ssid, "Joined network has no gateway");
            return stream::empty().boxed();
        };

        let addr = SocketAddr::new(IpAddr::V4(gateway), self.port);
        let probe_timeout = self.probe_timeout;
        let display_name = identity
            .ssid
            .unwrap_or_else(|| format!("Camera access point {gateway}"));

        stream::once(async move {
            let online = probe(addr, probe_timeout).await;
            debug!(%addr, online, "Access point probed");
            DeviceCandidate {
                identity: DeviceIdentity::Network { addr },
                display_name,
                transport_kind: TransportKind::PtpIpAccessPoint,
                online,
            }
        })
        .boxed()
    }

    fn discover_station(&self, identity: &NetworkIdentity) -> BoxStream<'static, DeviceCandidate> {
        let hosts = subnet_hosts(identity.local_addr, identity.prefix_len, self.host_limit);
        debug!(
            local = %identity.local_addr,
            prefix = identity.prefix_len,
            hosts = hosts.len(),
            concurrency = self.concurrency,
            "Station scan started"
        );

        let port = self.port;
        let probe_timeout = self.probe_timeout;

        stream::iter(hosts)
            .map(move |ip| async move {
                let addr = SocketAddr::new(IpAddr::V4(ip), port);
                probe(addr, probe_timeout).await.then(|| DeviceCandidate {
                    identity: DeviceIdentity::Network { addr },
                    display_name: format!("PTP/IP camera at {ip}"),
                    transport_kind: TransportKind::PtpIpStation,
                    online: true,
                })
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|candidate| async move { candidate })
            .boxed()
    }
}

impl DiscoveryService for PtpIpDiscovery {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn discover(&self) -> BoxStream<'static, DeviceCandidate> {
        let Some(identity) = self.env.identity() else {
            warn!(kind = %self.kind, "Not connected to a network");
            return stream::empty().boxed();
        };

        match self.kind {
            TransportKind::PtpIpAccessPoint => self.discover_access_point(identity),
            _ => self.discover_station(&identity),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns `true` if a TCP connection to `addr` succeeds within `deadline`.
pub async fn probe(addr: SocketAddr, deadline: Duration) -> bool {
    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!(%addr, error = %e, "Probe refused");
            false
        }
        Err(_) => false,
    }
}

/// Host addresses of `local`'s subnet, excluding `local`, at most `limit`.
///
/// Network and broadcast addresses are skipped for prefixes up to /30.
#[must_use]
pub fn subnet_hosts(local: Ipv4Addr, prefix_len: u8, limit: usize) -> Vec<Ipv4Addr> {
    let prefix_len = prefix_len.min(32);
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    };
    let network = u32::from(local) & mask;
    let broadcast = network | !mask;

    let (start, end) = if prefix_len >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };

    (start..=end)
        .map(Ipv4Addr::from)
        .filter(|ip| *ip != local)
        .take(limit)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
