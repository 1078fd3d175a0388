//! Network types for the per-container veth + NAT wiring.
//!
//! Every container gets a point-to-point /24 between the host end of a veth
//! pair and the container end. Outbound traffic from the container address
//! is masqueraded behind the host's external interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 interface address with prefix length (e.g. "10.0.0.1/24").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceAddr {
    /// Host address assigned to the interface.
    pub address: Ipv4Addr,
    /// Prefix length of the attached subnet.
    pub prefix_len: u8,
}

impl InterfaceAddr {
    pub const fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Network address of the attached subnet.
    pub fn network(&self) -> Ipv4Addr {
        if self.prefix_len == 0 {
            return Ipv4Addr::UNSPECIFIED;
        }
        let mask = u32::MAX << (32 - self.prefix_len as u32);
        Ipv4Addr::from(u32::from(self.address) & mask)
    }

    /// Whether `other` lies in the same subnet as this address.
    pub fn contains(&self, other: Ipv4Addr) -> bool {
        InterfaceAddr::new(other, self.prefix_len).network() == self.network()
    }
}

impl FromStr for InterfaceAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR notation: {}", s))?;

        let address: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid prefix length '{}': {}", prefix, e))?;

        if prefix_len > 32 {
            return Err(format!("prefix length {} out of range", prefix_len));
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }
}

impl TryFrom<String> for InterfaceAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InterfaceAddr> for String {
    fn from(value: InterfaceAddr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for InterfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Veth pair and NAT settings for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Wire the container network at all.
    pub enabled: bool,

    /// Name of the veth end that stays on the host.
    pub host_veth: String,

    /// Name of the veth end moved into the container namespace.
    pub container_veth: String,

    /// Address of the host end; also the container's default gateway.
    pub host_addr: InterfaceAddr,

    /// Address of the container end.
    pub container_addr: InterfaceAddr,

    /// Dedicated nftables table holding the masquerade rule.
    pub nat_table: String,

    /// Host egress interface. Detected from the default route when unset.
    pub external_interface: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_veth: "mbx-host0".to_string(),
            container_veth: "mbx-ctr0".to_string(),
            host_addr: InterfaceAddr::new(Ipv4Addr::new(10, 0, 0, 1), 24),
            container_addr: InterfaceAddr::new(Ipv4Addr::new(10, 0, 0, 2), 24),
            nat_table: "minibox-nat".to_string(),
            external_interface: None,
        }
    }
}

impl BridgeConfig {
    /// Gateway the container routes through.
    pub fn gateway(&self) -> Ipv4Addr {
        self.host_addr.address
    }

    /// Check the settings are usable before touching any host state.
    pub fn validate(&self) -> Result<(), String> {
        for name in [&self.host_veth, &self.container_veth] {
            // IFNAMSIZ includes the trailing NUL
            if name.is_empty() || name.len() > 15 {
                return Err(format!("invalid interface name '{}'", name));
            }
        }
        if self.host_veth == self.container_veth {
            return Err("host and container veth names must differ".to_string());
        }
        if !self.host_addr.contains(self.container_addr.address) {
            return Err(format!(
                "container address {} is not in host subnet {}",
                self.container_addr, self.host_addr
            ));
        }
        if self.host_addr.address == self.container_addr.address {
            return Err("host and container addresses must differ".to_string());
        }
        if self.nat_table.is_empty() {
            return Err("NAT table name must not be empty".to_string());
        }
        Ok(())
    }
}
