//! Core data model shared by the descriptor reader, desired-state builder and workers.

use std::net::Ipv4Addr;

use cidr::Ipv4Cidr;
use serde::Serialize;

/// One VM's intent on one of its virtual NICs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub vm_id: u32,
    pub nic_index: u32,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub dns_server: Option<Ipv4Addr>,
    pub dns_search: Option<String>,
}

impl Reservation {
    /// Sort key used everywhere the spec requires `(vm_id, nic_index)` ordering.
    pub fn sort_key(&self) -> (u32, u32) {
        (self.vm_id, self.nic_index)
    }
}

/// The identity of a broadcast domain on the host. Two reservations belong to the
/// same worker iff their `BridgeKey` is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeKey {
    pub display_name: String,
    pub vlan_tag: u16,
}

impl BridgeKey {
    pub fn new(display_name: impl Into<String>, vlan_tag: u16) -> Self {
        BridgeKey {
            display_name: display_name.into(),
            vlan_tag,
        }
    }

    /// Derive a `BridgeKey` (and its backing link) from a parsed NIC stanza, per the
    /// firewall > tag > plain-bridge precedence rule.
    pub fn derive(nic: &NicConfig, vm_id: u32, nic_index: u32) -> (BridgeKey, String) {
        if nic.firewall {
            let name = format!("fwbr{vm_id}i{nic_index}");
            (BridgeKey::new(name.clone(), 0), name)
        } else if let Some(tag) = nic.tag {
            (
                BridgeKey::new(format!("{}.{}", nic.bridge, tag), tag),
                nic.bridge.clone(),
            )
        } else {
            (BridgeKey::new(nic.bridge.clone(), 0), nic.bridge.clone())
        }
    }
}

/// Typed, validated form of a `net<k>` stanza. Replaces the stringly-typed
/// key=value list as soon as it is parsed, per the source's REDESIGN FLAGS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicConfig {
    pub bridge: String,
    pub tag: Option<u16>,
    pub firewall: bool,
    pub mac: Option<String>,
}

/// Typed, validated form of an `ipconfig<k>` stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub ip: Option<(Ipv4Addr, u8)>,
    pub gw: Option<Ipv4Addr>,
}

/// Desired state for one bridge/VLAN broadcast domain, aggregated by the
/// desired-state builder from every VM's reservations that target it.
#[derive(Debug, Clone)]
pub struct BridgeGroup {
    pub key: BridgeKey,
    pub display_name: String,
    pub backing_link: String,
    pub vlan_tag: u16,
    pub subnet: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub reservations: Vec<Reservation>,
}

impl BridgeGroup {
    pub fn new(
        key: BridgeKey,
        backing_link: String,
        subnet: Ipv4Cidr,
        gateway: Option<Ipv4Addr>,
    ) -> Self {
        BridgeGroup {
            display_name: key.display_name.clone(),
            vlan_tag: key.vlan_tag,
            key,
            backing_link,
            subnet,
            gateway,
            reservations: Vec::new(),
        }
    }

    /// Reservations sorted by `(vm_id, nic_index)`, the order the config emitter
    /// and any byte-equality comparison must use.
    pub fn sorted_reservations(&self) -> Vec<&Reservation> {
        let mut sorted: Vec<&Reservation> = self.reservations.iter().collect();
        sorted.sort_by_key(|r| r.sort_key());
        sorted
    }
}

/// Read-only view of a `BridgeGroup` used to serialize `/stats_raw`.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeGroupView {
    pub display_name: String,
    pub backing_link: String,
    pub vlan_tag: u16,
    pub subnet: String,
    pub gateway: Option<Ipv4Addr>,
    pub reservations: Vec<Reservation>,
}

impl From<&BridgeGroup> for BridgeGroupView {
    fn from(group: &BridgeGroup) -> Self {
        BridgeGroupView {
            display_name: group.display_name.clone(),
            backing_link: group.backing_link.clone(),
            vlan_tag: group.vlan_tag,
            subnet: group.subnet.to_string(),
            gateway: group.gateway,
            reservations: group.sorted_reservations().into_iter().cloned().collect(),
        }
    }
}

/// Given a subnet, return the first usable address (`S[1]`) and the last usable
/// address (`S[-2]`) per the spec's pool-range definition.
pub fn usable_range(subnet: &Ipv4Cidr) -> (Ipv4Addr, Ipv4Addr) {
    let network = u32::from(subnet.first_address());
    let broadcast = u32::from(subnet.last_address());
    (Ipv4Addr::from(network + 1), Ipv4Addr::from(broadcast - 1))
}

/// The worker-side address `A = S[-2]`: the second-to-last host address of `S`.
pub fn worker_address(subnet: &Ipv4Cidr) -> Ipv4Addr {
    let broadcast = u32::from(subnet.last_address());
    Ipv4Addr::from(broadcast - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn bridge_key_plain() {
        let nic = NicConfig {
            bridge: "vmbr0".into(),
            tag: None,
            firewall: false,
            mac: None,
        };
        let (key, backing) = BridgeKey::derive(&nic, 100, 0);
        assert_eq!(key, BridgeKey::new("vmbr0", 0));
        assert_eq!(backing, "vmbr0");
    }

    #[test]
    fn bridge_key_tagged() {
        let nic = NicConfig {
            bridge: "vmbr0".into(),
            tag: Some(100),
            firewall: false,
            mac: None,
        };
        let (key, backing) = BridgeKey::derive(&nic, 100, 0);
        assert_eq!(key, BridgeKey::new("vmbr0.100", 100));
        assert_eq!(backing, "vmbr0");
    }

    #[test]
    fn bridge_key_firewall_overrides_tag() {
        let nic = NicConfig {
            bridge: "vmbr0".into(),
            tag: Some(50),
            firewall: true,
            mac: None,
        };
        let (key, backing) = BridgeKey::derive(&nic, 100, 0);
        assert_eq!(key, BridgeKey::new("fwbr100i0", 0));
        assert_eq!(backing, "fwbr100i0");
    }

    #[test]
    fn pool_range_endpoints() {
        let subnet = Ipv4Cidr::from_str("192.168.10.0/24").unwrap();
        let (first, last) = usable_range(&subnet);
        assert_eq!(first, Ipv4Addr::new(192, 168, 10, 1));
        assert_eq!(last, Ipv4Addr::new(192, 168, 10, 254));
        assert_eq!(worker_address(&subnet), Ipv4Addr::new(192, 168, 10, 254));
    }
}
