//! Local network interface discovery

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::SockaddrStorage;
use tokio::net::{lookup_host, TcpSocket};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{AddressBinding, InterfaceAddress};

/// Read-only view of the host's interface addresses
#[async_trait]
pub trait InterfaceQuery: Send + Sync {
    /// Globally routable addresses on every interface
    fn global_addresses(&self) -> Result<Vec<InterfaceAddress>>;

    /// Best-effort private LAN address
    fn lan_address(&self) -> Option<Ipv4Addr>;

    /// Global IPv6 addresses on one interface
    fn addresses_on(&self, interface: &str) -> Result<Vec<AddressBinding>> {
        Ok(self
            .global_addresses()?
            .into_iter()
            .filter(|entry| entry.interface_name == interface)
            .filter_map(|entry| match entry.address {
                IpAddr::V6(address) => Some(AddressBinding::new(address, entry.prefix_length)),
                IpAddr::V4(_) => None,
            })
            .collect())
    }

    /// Whether the host reaches the outside world over IPv6, optionally
    /// from a specific source address
    async fn test_connectivity(&self, source: Option<Ipv6Addr>) -> bool;
}

pub type SharedInterfaces = Arc<dyn InterfaceQuery>;

/// Whether an IPv6 address is routable beyond the local link
pub fn is_global_v6(address: &Ipv6Addr) -> bool {
    let link_local = (address.segments()[0] & 0xffc0) == 0xfe80;
    !(address.is_loopback() || address.is_unspecified() || address.is_multicast() || link_local)
}

/// RFC 1918 check
pub fn is_private_v4(address: &Ipv4Addr) -> bool {
    address.is_private()
}

fn netmask_len(netmask: Option<&SockaddrStorage>) -> Option<u8> {
    let netmask = netmask?;
    if let Some(v6) = netmask.as_sockaddr_in6() {
        return Some(u128::from(v6.ip()).count_ones() as u8);
    }
    netmask
        .as_sockaddr_in()
        .map(|v4| u32::from(v4.ip()).count_ones() as u8)
}

/// Interface query backed by `getifaddrs(3)`
pub struct SystemInterfaces {
    /// `host:port` dialed by the connectivity test
    connectivity_target: String,
    connectivity_timeout: Duration,
}

impl SystemInterfaces {
    pub fn new(connectivity_target: impl Into<String>, connectivity_timeout: Duration) -> Self {
        Self {
            connectivity_target: connectivity_target.into(),
            connectivity_timeout,
        }
    }

    async fn connect_v6(&self, source: Option<Ipv6Addr>) -> io::Result<()> {
        let remote = lookup_host(self.connectivity_target.as_str())
            .await?
            .find(SocketAddr::is_ipv6)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "target has no IPv6 address"))?;

        let socket = TcpSocket::new_v6()?;
        if let Some(source) = source {
            socket.bind(SocketAddr::new(IpAddr::V6(source), 0))?;
        }
        socket.connect(remote).await?;
        Ok(())
    }
}

#[async_trait]
impl InterfaceQuery for SystemInterfaces {
    fn global_addresses(&self) -> Result<Vec<InterfaceAddress>> {
        let mut found = Vec::new();

        for entry in getifaddrs().map_err(std::io::Error::from)? {
            if entry.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
                continue;
            }
            let Some(address) = entry.address.as_ref() else {
                continue;
            };
            let Some(v6) = address.as_sockaddr_in6() else {
                continue;
            };

            let ip = v6.ip();
            if !is_global_v6(&ip) {
                continue;
            }

            found.push(InterfaceAddress {
                interface_name: entry.interface_name.clone(),
                address: IpAddr::V6(ip),
                prefix_length: netmask_len(entry.netmask.as_ref()).unwrap_or(64),
            });
        }

        debug!(count = found.len(), "Enumerated global IPv6 addresses");
        Ok(found)
    }

    fn lan_address(&self) -> Option<Ipv4Addr> {
        let addresses = getifaddrs().ok()?;

        for entry in addresses {
            if entry.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
                continue;
            }
            let Some(v4) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                continue;
            };
            let ip = v4.ip();
            if is_private_v4(&ip) {
                return Some(ip);
            }
        }

        None
    }

    async fn test_connectivity(&self, source: Option<Ipv6Addr>) -> bool {
        match tokio::time::timeout(self.connectivity_timeout, self.connect_v6(source)).await {
            Ok(Ok(())) => {
                debug!(endpoint = %self.connectivity_target, ?source, "IPv6 connectivity confirmed");
                true
            }
            Ok(Err(e)) => {
                warn!(endpoint = %self.connectivity_target, ?source, error = %e, "IPv6 connectivity test failed");
                false
            }
            Err(_) => {
                warn!(endpoint = %self.connectivity_target, ?source, "IPv6 connectivity test timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_global_v6() {
        assert!(is_global_v6(&"2001:db8::1".parse().unwrap()));
        assert!(is_global_v6(&"fd00::1".parse().unwrap()));
        assert!(!is_global_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_global_v6(&"febf::1".parse().unwrap()));
        assert!(!is_global_v6(&"::1".parse().unwrap()));
        assert!(!is_global_v6(&"ff02::1".parse().unwrap()));
        assert!(!is_global_v6(&Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_is_private_v4() {
        assert!(is_private_v4(&Ipv4Addr::new(192, 168, 1, 20)));
        assert!(is_private_v4(&Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_private_v4(&Ipv4Addr::new(172, 20, 0, 1)));
        assert!(!is_private_v4(&Ipv4Addr::new(172, 32, 0, 1)));
        assert!(!is_private_v4(&Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_system_interfaces_only_report_global_v6() {
        let interfaces = SystemInterfaces::new("localhost:443", Duration::from_secs(1));
        let addresses = interfaces.global_addresses().unwrap();
        for entry in addresses {
            match entry.address {
                IpAddr::V6(v6) => assert!(is_global_v6(&v6)),
                IpAddr::V4(_) => panic!("unexpected IPv4 entry"),
            }
            assert!(entry.prefix_length <= 128);
        }
    }

    #[tokio::test]
    async fn test_connectivity_fails_when_source_is_not_local() {
        let listener = tokio::net::TcpListener::bind("[::1]:0").await;
        let Ok(listener) = listener else {
            // Host without IPv6 loopback
            return;
        };
        let target = listener.local_addr().unwrap().to_string();
        let interfaces = SystemInterfaces::new(target, Duration::from_secs(1));

        assert!(interfaces.test_connectivity(None).await);
        // 2001:db8::/32 is reserved for documentation and never assigned
        assert!(!interfaces.test_connectivity(Some("2001:db8::1".parse().unwrap())).await);
    }
}
