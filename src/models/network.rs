use std::net::{IpAddr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// An address plus the prefix length it is configured with on an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBinding {
    pub address: Ipv6Addr,
    pub prefix_length: u8,
}

impl AddressBinding {
    pub fn new(address: Ipv6Addr, prefix_length: u8) -> Self {
        Self {
            address,
            prefix_length,
        }
    }
}

/// Globally routable address found on a local interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceAddress {
    pub interface_name: String,
    pub address: IpAddr,
    pub prefix_length: u8,
}

/// Network interface the pool allocates addresses on, as persisted by the config store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceDescriptor {
    pub name: String,
    pub address: Ipv6Addr,
    pub prefix_length: u8,
    pub prefix_base: Ipv6Addr,
}

impl NetworkInterfaceDescriptor {
    /// Build a descriptor from an interface address, deriving the prefix base
    pub fn from_interface_address(name: &str, address: Ipv6Addr, prefix_length: u8) -> Self {
        Self {
            name: name.to_string(),
            address,
            prefix_length,
            prefix_base: crate::pool::allocator::prefix_base(address, prefix_length),
        }
    }
}
