//! Desired-State Builder (component B): aggregates parsed descriptors into
//! per-bridge groups and validates cross-VM consistency.

use std::collections::{BTreeMap, HashSet};

use cidr::Ipv4Cidr;
use tracing::debug;

use crate::descriptor::{DescriptorSkip, VmDescriptor};
use crate::model::{BridgeGroup, BridgeKey, Reservation};

/// Human-readable consistency warning, surfaced through the tick error list but
/// never rejecting the offending reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyWarning(pub String);

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builds the desired state (`BridgeKey` → `BridgeGroup`) from a set of parsed VM
/// descriptors, plus the combined list of descriptor-skip and consistency errors.
///
/// Returns a `BTreeMap`, not a `HashMap`: `BridgeKey` orders by
/// `(display_name, vlan_tag)` specifically so that registry/desired iteration
/// order is stable across runs, per §5's "stable for testability" ordering
/// guarantee.
pub fn build_desired_state(
    descriptors: &[VmDescriptor],
    descriptor_errors: Vec<DescriptorSkip>,
) -> (BTreeMap<BridgeKey, BridgeGroup>, Vec<String>) {
    let mut groups: BTreeMap<BridgeKey, BridgeGroup> = BTreeMap::new();
    let mut errors: Vec<String> = descriptor_errors.iter().map(|e| e.to_string()).collect();

    for vm in descriptors {
        for parsed in &vm.nics {
            let Some((ip, prefix)) = parsed.ip.ip else {
                errors.push(format!(
                    "VM {}: net{} has no matching ipconfig ip=",
                    vm.vm_id, parsed.index
                ));
                continue;
            };

            let Some(mac) = parsed.nic.mac.clone() else {
                errors.push(format!(
                    "VM {}: net{} has no MAC address",
                    vm.vm_id, parsed.index
                ));
                continue;
            };

            let Ok(subnet) = Ipv4Cidr::new(ip, prefix) else {
                errors.push(format!(
                    "VM {}: net{} has an invalid subnet {ip}/{prefix}",
                    vm.vm_id, parsed.index
                ));
                continue;
            };
            let subnet = subnet.first_address();
            let Ok(subnet) = Ipv4Cidr::new(subnet, prefix) else {
                errors.push(format!(
                    "VM {}: net{} has an invalid subnet {ip}/{prefix}",
                    vm.vm_id, parsed.index
                ));
                continue;
            };

            let (key, backing_link) = BridgeKey::derive(&parsed.nic, vm.vm_id, parsed.index);

            let reservation = Reservation {
                vm_id: vm.vm_id,
                nic_index: parsed.index,
                mac,
                ip,
                dns_server: vm.dns_server,
                dns_search: vm.dns_search.clone(),
            };

            let group = groups.entry(key.clone()).or_insert_with(|| {
                debug!("creating new bridge group for {}", key.display_name);
                BridgeGroup::new(key.clone(), backing_link, subnet, parsed.ip.gw)
            });

            check_invariants(group, &reservation, parsed.ip.gw, vm.vm_id, &mut errors);

            group.reservations.push(reservation);
        }
    }

    (groups, errors)
}

fn check_invariants(
    group: &BridgeGroup,
    reservation: &Reservation,
    declared_gateway: Option<std::net::Ipv4Addr>,
    vm_id: u32,
    errors: &mut Vec<String>,
) {
    if !group.subnet.contains(&reservation.ip) {
        errors.push(format!(
            "VM {vm_id}: reservation ip {} is outside subnet {} of bridge {}",
            reservation.ip, group.subnet, group.display_name
        ));
    }

    if declared_gateway != group.gateway {
        errors.push(format!(
            "VM {vm_id}: gateway {:?} does not match bridge {}'s gateway {:?}",
            declared_gateway, group.display_name, group.gateway
        ));
    }

    if group.reservations.iter().any(|r| r.mac == reservation.mac) {
        errors.push(format!(
            "VM {vm_id}: MAC address {} is already used on bridge {}",
            reservation.mac, group.display_name
        ));
    }

    // Recommended (not required) by the spec: also flag duplicate IPs within a bridge.
    if group.reservations.iter().any(|r| r.ip == reservation.ip) {
        errors.push(format!(
            "VM {vm_id}: IP address {} is already used on bridge {}",
            reservation.ip, group.display_name
        ));
    }
}

/// Distinct MAC addresses declared across a set of groups, used by tests and by
/// callers that want a quick uniqueness check across the whole desired state.
#[allow(dead_code)]
pub fn all_macs(groups: &BTreeMap<BridgeKey, BridgeGroup>) -> HashSet<String> {
    groups
        .values()
        .flat_map(|g| g.reservations.iter().map(|r| r.mac.clone()))
        .collect()
}
