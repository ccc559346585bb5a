//! Network interface enumeration for the UDP beacon's broadcast step: for
//! each configured outbound interface, computes broadcast address as
//! `ipv4 | ~subnet_mask` and skips non-operational interfaces.
//!
//! No repo in the retrieval pack enumerates interfaces with netmasks, so this
//! reaches for `if-addrs`, a small, widely used crate dedicated to exactly
//! this (see DESIGN.md).

use std::net::Ipv4Addr;

use crate::errors::DiscoveryError;

/// A viable IPv4 interface: its own address and the directed broadcast
/// address derived from its netmask.
#[derive(Clone, Debug)]
pub struct ViableInterface {
    pub name: String,
    pub address: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

fn broadcast_address(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let addr_bits = u32::from(address);
    let mask_bits = u32::from(netmask);
    Ipv4Addr::from(addr_bits | !mask_bits)
}

/// Resolves a single named interface's own IPv4 address, for binding the
/// input step's data listener.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, DiscoveryError> {
    let all = if_addrs::get_if_addrs().map_err(DiscoveryError::Io)?;
    for iface in all {
        if iface.name != name || iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            return Ok(v4.ip);
        }
    }
    Err(DiscoveryError::NoViableInterface)
}

/// Returns every operational IPv4 interface matching one of `names`, with its
/// broadcast address computed from its netmask. Fails if none are viable.
pub fn viable_interfaces(names: &[String]) -> Result<Vec<ViableInterface>, DiscoveryError> {
    let all = if_addrs::get_if_addrs().map_err(DiscoveryError::Io)?;
    let mut out = Vec::new();
    for iface in all {
        if !names.iter().any(|n| n == &iface.name) {
            continue;
        }
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            out.push(ViableInterface {
                name: iface.name,
                address: v4.ip,
                broadcast: broadcast_address(v4.ip, v4.netmask),
            });
        }
    }
    if out.is_empty() {
        return Err(DiscoveryError::NoViableInterface);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_class_c_broadcast_address() {
        let addr: Ipv4Addr = "192.168.1.42".parse().unwrap();
        let mask: Ipv4Addr = "255.255.255.0".parse().unwrap();
        assert_eq!(
            broadcast_address(addr, mask),
            "192.168.1.255".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn computes_class_b_broadcast_address() {
        let addr: Ipv4Addr = "172.16.5.9".parse().unwrap();
        let mask: Ipv4Addr = "255.255.0.0".parse().unwrap();
        assert_eq!(
            broadcast_address(addr, mask),
            "172.16.255.255".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn unknown_interface_name_yields_no_viable_interface() {
        let err = viable_interfaces(&["definitely-not-a-real-iface-0".to_string()]).unwrap_err();
        assert!(matches!(err, DiscoveryError::NoViableInterface));
    }
}
