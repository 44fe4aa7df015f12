//! DHCP Config Emitter (component E): renders the DHCP server configuration
//! document and initial lease file for one worker.

use serde::Serialize;

use crate::model::{usable_range, BridgeGroup};

/// The canonical lease-file column schema (memfile backend), header only.
pub const LEASE_FILE_HEADER: &str =
    "address,hwaddr,client_id,valid_lifetime,expire,subnet_id,fqdn_fwd,fqdn_rev,hostname,state,user_context,pool_id\n";

#[derive(Serialize)]
struct RootDocument {
    #[serde(rename = "Dhcp4")]
    dhcp4: Dhcp4,
}

#[derive(Serialize)]
struct Dhcp4 {
    #[serde(rename = "interfaces-config")]
    interfaces_config: InterfacesConfig,
    #[serde(rename = "lease-database")]
    lease_database: LeaseDatabase,
    #[serde(rename = "client-classes")]
    client_classes: Vec<ClientClass>,
    #[serde(rename = "option-data", skip_serializing_if = "Vec::is_empty")]
    option_data: Vec<OptionData>,
    subnet4: Vec<Subnet4>,
}

#[derive(Serialize)]
struct InterfacesConfig {
    interfaces: Vec<String>,
}

#[derive(Serialize)]
struct LeaseDatabase {
    #[serde(rename = "type")]
    kind: String,
    persist: bool,
    name: String,
    #[serde(rename = "lfc-interval")]
    lfc_interval: u32,
}

#[derive(Serialize)]
struct ClientClass {
    name: String,
}

#[derive(Serialize)]
struct OptionData {
    name: String,
    data: String,
    #[serde(rename = "always-send", skip_serializing_if = "is_false")]
    always_send: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize)]
struct Subnet4 {
    id: u32,
    subnet: String,
    pools: Vec<Pool>,
    #[serde(rename = "option-data", skip_serializing_if = "Vec::is_empty")]
    option_data: Vec<OptionData>,
    reservations: Vec<HostReservation>,
}

#[derive(Serialize)]
struct Pool {
    pool: String,
    #[serde(rename = "client-class")]
    client_class: String,
}

#[derive(Serialize)]
struct HostReservation {
    #[serde(rename = "hw-address")]
    hw_address: String,
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "client-classes")]
    client_classes: Vec<String>,
    #[serde(rename = "option-data", skip_serializing_if = "Vec::is_empty")]
    option_data: Vec<OptionData>,
}

const CLOUDINIT_CLASS: &str = "cloudinit";

/// Renders the deterministic DHCPv4 configuration document for a worker's
/// interface `kn_<display_name>`, given its reservation set. Byte-identical output
/// for byte-identical (subnet, gateway, sorted reservations) input — the
/// comparison the supervisor uses to decide whether a worker needs a rebuild.
pub fn render_config(group: &BridgeGroup, config_dir: &str) -> Vec<u8> {
    let (first_usable, last_usable) = usable_range(&group.subnet);

    let mut top_level_options = Vec::new();
    if let Some(gateway) = group.gateway {
        top_level_options.push(OptionData {
            name: "routers".to_string(),
            data: gateway.to_string(),
            always_send: false,
        });
    }

    let reservations = group
        .sorted_reservations()
        .into_iter()
        .map(|r| {
            let mut option_data = Vec::new();
            if let Some(dns) = r.dns_server {
                option_data.push(OptionData {
                    name: "domain-name-servers".to_string(),
                    data: dns.to_string(),
                    always_send: true,
                });
            }
            if let Some(search) = &r.dns_search {
                option_data.push(OptionData {
                    name: "domain-name".to_string(),
                    data: search.clone(),
                    always_send: true,
                });
            }

            HostReservation {
                hw_address: r.mac.clone(),
                ip_address: r.ip.to_string(),
                client_classes: vec![CLOUDINIT_CLASS.to_string()],
                option_data,
            }
        })
        .collect();

    let document = RootDocument {
        dhcp4: Dhcp4 {
            interfaces_config: InterfacesConfig {
                interfaces: vec![format!("kn_{}", group.display_name)],
            },
            lease_database: LeaseDatabase {
                kind: "memfile".to_string(),
                persist: true,
                name: format!("{config_dir}/leases.csv"),
                lfc_interval: 0,
            },
            client_classes: vec![ClientClass {
                name: CLOUDINIT_CLASS.to_string(),
            }],
            option_data: top_level_options,
            subnet4: vec![Subnet4 {
                id: 1,
                subnet: group.subnet.to_string(),
                pools: vec![Pool {
                    pool: format!("{first_usable}-{last_usable}"),
                    client_class: CLOUDINIT_CLASS.to_string(),
                }],
                option_data: Vec::new(),
                reservations,
            }],
        },
    };

    // `serde_json::to_vec` walks the struct fields in declaration order, so this
    // is deterministic without needing a key-order-preserving map.
    serde_json::to_vec_pretty(&document).expect("Dhcp4 document is always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BridgeGroup, BridgeKey, Reservation};
    use cidr::Ipv4Cidr;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn sample_group() -> BridgeGroup {
        let mut group = BridgeGroup::new(
            BridgeKey::new("vmbr0", 0),
            "vmbr0".to_string(),
            Ipv4Cidr::from_str("192.168.10.0/24").unwrap(),
            Some(Ipv4Addr::new(192, 168, 10, 1)),
        );
        group.reservations.push(Reservation {
            vm_id: 100,
            nic_index: 0,
            mac: "AA:BB:CC:DD:EE:01".to_string(),
            ip: Ipv4Addr::new(192, 168, 10, 5),
            dns_server: Some(Ipv4Addr::new(1, 1, 1, 1)),
            dns_search: Some("example.com".to_string()),
        });
        group
    }

    #[test]
    fn renders_expected_fields() {
        let group = sample_group();
        let bytes = render_config(&group, "/etc/pkci/vmbr0");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"kn_vmbr0\""));
        assert!(text.contains("\"routers\""));
        assert!(text.contains("192.168.10.1"));
        assert!(text.contains("AA:BB:CC:DD:EE:01"));
        assert!(text.contains("domain-name-servers"));
        assert!(text.contains("always-send"));
    }

    #[test]
    fn rendering_is_pure_and_deterministic() {
        let group = sample_group();
        let a = render_config(&group, "/etc/pkci/vmbr0");
        let b = render_config(&group, "/etc/pkci/vmbr0");
        assert_eq!(a, b);
    }

    #[test]
    fn reservation_order_is_vm_id_then_nic_index() {
        let mut group = sample_group();
        group.reservations.push(Reservation {
            vm_id: 99,
            nic_index: 1,
            mac: "AA:BB:CC:DD:EE:02".to_string(),
            ip: Ipv4Addr::new(192, 168, 10, 6),
            dns_server: None,
            dns_search: None,
        });
        let sorted = group.sorted_reservations();
        assert_eq!(sorted[0].vm_id, 99);
        assert_eq!(sorted[1].vm_id, 100);
    }

    #[test]
    fn different_reservation_sets_render_different_bytes() {
        let mut a = sample_group();
        let b = a.clone();
        a.reservations[0].ip = Ipv4Addr::new(192, 168, 10, 6);
        assert_ne!(
            render_config(&a, "/etc/pkci/vmbr0"),
            render_config(&b, "/etc/pkci/vmbr0")
        );
    }

    #[test]
    fn lease_header_has_no_rows() {
        assert!(LEASE_FILE_HEADER.ends_with('\n'));
        assert_eq!(LEASE_FILE_HEADER.lines().count(), 1);
    }
}
