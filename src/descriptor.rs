//! Descriptor Reader (component A): lists VM descriptor files and extracts typed
//! per-interface reservations from their `net<k>`/`ipconfig<k>` stanzas.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::model::{IpConfig, NicConfig};

/// A parsed `net<k>`/`ipconfig<k>` pair, together with the VM-wide DNS options.
#[derive(Debug, Clone)]
pub struct ParsedNic {
    pub index: u32,
    pub nic: NicConfig,
    pub ip: IpConfig,
}

/// Everything the descriptor reader extracted from a single VM descriptor file.
#[derive(Debug, Clone)]
pub struct VmDescriptor {
    pub vm_id: u32,
    pub dns_server: Option<Ipv4Addr>,
    pub dns_search: Option<String>,
    pub nics: Vec<ParsedNic>,
}

/// One failure while reading a single VM's descriptor; never aborts the whole tick.
#[derive(Debug, Clone)]
pub struct DescriptorSkip {
    pub vm_id: Option<u32>,
    pub message: String,
}

impl std::fmt::Display for DescriptorSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.vm_id {
            Some(id) => write!(f, "VM {id}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn mac_pattern() -> Regex {
    Regex::new(r"(?i)^([0-9A-F]{2}:){5}[0-9A-F]{2}$").unwrap()
}

/// Reads every `<vm_id>.conf` file in `dir`, returning one `VmDescriptor` per VM
/// that parsed successfully and one `DescriptorSkip` per VM that didn't.
///
/// A failure to read the directory itself is returned as `Err` and aborts the tick,
/// per the spec's directory-vs-per-VM failure split.
pub fn read_descriptors(dir: &Path) -> anyhow::Result<(Vec<VmDescriptor>, Vec<DescriptorSkip>)> {
    let entries = fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("cannot list descriptor directory {}: {e}", dir.display()))?;

    let mut descriptors = Vec::new();
    let mut errors = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                errors.push(DescriptorSkip {
                    vm_id: None,
                    message: format!("cannot read directory entry: {e}"),
                });
                continue;
            }
        };

        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
            continue;
        };
        if ext != "conf" {
            continue;
        }

        let Ok(vm_id) = stem.parse::<u32>() else {
            trace!("skipping non-numeric descriptor file name {}", stem);
            continue;
        };

        match parse_descriptor_file(vm_id, &path) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(message) => errors.push(DescriptorSkip {
                vm_id: Some(vm_id),
                message,
            }),
        }
    }

    debug!(
        "read {} descriptor(s), {} skipped",
        descriptors.len(),
        errors.len()
    );

    Ok((descriptors, errors))
}

fn parse_descriptor_file(vm_id: u32, path: &Path) -> Result<VmDescriptor, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("cannot open descriptor file: {e}"))?;

    let options = parse_kv_lines(&content);

    let dns_server = options
        .get("nameserver")
        .and_then(|v| Ipv4Addr::from_str(v).ok());
    let dns_search = options.get("searchdomain").cloned();

    let mut nics = Vec::new();
    for (key, value) in &options {
        let Some(suffix) = key.strip_prefix("net") else {
            continue;
        };
        let Ok(index) = suffix.parse::<u32>() else {
            continue;
        };
        let ipconfig_key = format!("ipconfig{index}");
        let Some(ipconfig_value) = options.get(&ipconfig_key) else {
            continue;
        };

        let nic = parse_nic_stanza(value)
            .map_err(|e| format!("net{index} stanza is invalid: {e}"))?;
        let ip = parse_ipconfig_stanza(ipconfig_value)
            .map_err(|e| format!("ipconfig{index} stanza is invalid: {e}"))?;

        nics.push(ParsedNic { index, nic, ip });
    }

    nics.sort_by_key(|n| n.index);

    Ok(VmDescriptor {
        vm_id,
        dns_server,
        dns_search,
        nics,
    })
}

/// Parses `key: value` lines, skipping blanks and `#`-comments. Matches the spec's
/// "single separator after first `\": \"`" rule.
fn parse_kv_lines(content: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();
    for line in content.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            options.insert(key.to_string(), value.to_string());
        }
    }
    options
}

/// Parses a comma-separated `key=value` list, single `=` separator on first
/// occurrence, matching the `net<k>`/`ipconfig<k>` value grammar.
fn parse_kv_list(value: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for item in value.split(',') {
        if let Some((k, v)) = item.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn parse_nic_stanza(value: &str) -> Result<NicConfig, String> {
    let fields = parse_kv_list(value);
    let mac_re = mac_pattern();

    let mac = fields
        .values()
        .find(|v| mac_re.is_match(v))
        .map(|v| v.to_uppercase());

    let bridge = fields
        .get("bridge")
        .cloned()
        .ok_or_else(|| "missing bridge=".to_string())?;

    let tag = match fields.get("tag") {
        Some(v) => Some(
            v.parse::<u16>()
                .map_err(|e| format!("invalid tag={v}: {e}"))?,
        ),
        None => None,
    };

    let firewall = matches!(fields.get("firewall").map(|s| s.as_str()), Some("1"));

    Ok(NicConfig {
        bridge,
        tag,
        firewall,
        mac,
    })
}

fn parse_ipconfig_stanza(value: &str) -> Result<IpConfig, String> {
    let fields = parse_kv_list(value);

    let ip = match fields.get("ip") {
        Some(v) => Some(parse_address_with_prefix(v)?),
        None => None,
    };

    let gw = match fields.get("gw") {
        Some(v) => Some(
            Ipv4Addr::from_str(v).map_err(|e| format!("invalid gw={v}: {e}"))?,
        ),
        None => None,
    };

    Ok(IpConfig { ip, gw })
}

fn parse_address_with_prefix(value: &str) -> Result<(Ipv4Addr, u8), String> {
    let (addr, prefix) = value
        .split_once('/')
        .ok_or_else(|| format!("ip={value} is missing a /prefix"))?;
    let addr =
        Ipv4Addr::from_str(addr).map_err(|e| format!("invalid ip address {addr}: {e}"))?;
    let prefix = prefix
        .parse::<u8>()
        .map_err(|e| format!("invalid prefix {prefix}: {e}"))?;
    Ok((addr, prefix))
}

#[allow(dead_code)]
pub(crate) fn log_skip(skip: &DescriptorSkip) {
    warn!("{skip}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_kv_lines_and_ignores_comments() {
        let content = "# comment\nnameserver: 1.1.1.1\nsearchdomain: example.com\nnet0: bridge=vmbr0\nmalformed line\n";
        let options = parse_kv_lines(content);
        assert_eq!(options.get("nameserver").unwrap(), "1.1.1.1");
        assert_eq!(options.get("searchdomain").unwrap(), "example.com");
        assert_eq!(options.get("net0").unwrap(), "bridge=vmbr0");
        assert_eq!(options.len(), 3);
    }

    #[test]
    fn mac_extraction_is_case_insensitive_and_normalizes_upper() {
        let nic = parse_nic_stanza("virtio=aa:bb:cc:dd:ee:01,bridge=vmbr0").unwrap();
        assert_eq!(nic.mac.as_deref(), Some("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn firewall_flag_parsed() {
        let nic = parse_nic_stanza("bridge=vmbr0,tag=50,firewall=1").unwrap();
        assert!(nic.firewall);
        assert_eq!(nic.tag, Some(50));
    }

    #[test]
    fn ipconfig_parses_ip_and_gateway() {
        let ip = parse_ipconfig_stanza("ip=192.168.10.5/24,gw=192.168.10.1").unwrap();
        assert_eq!(
            ip.ip,
            Some((Ipv4Addr::new(192, 168, 10, 5), 24))
        );
        assert_eq!(ip.gw, Some(Ipv4Addr::new(192, 168, 10, 1)));
    }

    #[test]
    fn s1_single_vm_descriptor_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("100.conf")).unwrap();
        writeln!(file, "net0: virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0").unwrap();
        writeln!(file, "ipconfig0: ip=192.168.10.5/24,gw=192.168.10.1").unwrap();
        drop(file);

        let (descriptors, errors) = read_descriptors(dir.path()).unwrap();
        assert!(errors.is_empty());
        assert_eq!(descriptors.len(), 1);
        let vm = &descriptors[0];
        assert_eq!(vm.vm_id, 100);
        assert_eq!(vm.nics.len(), 1);
        assert_eq!(vm.nics[0].nic.bridge, "vmbr0");
        assert_eq!(vm.nics[0].ip.gw, Some(Ipv4Addr::new(192, 168, 10, 1)));
    }

    #[test]
    fn non_numeric_filename_is_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("not-a-vm.conf"), "net0: bridge=vmbr0\n").unwrap();
        let (descriptors, errors) = read_descriptors(dir.path()).unwrap();
        assert!(descriptors.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn missing_bridge_is_a_descriptor_skip_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("101.conf"), "net0: tag=5\nipconfig0: ip=10.0.0.2/24\n").unwrap();
        let (descriptors, errors) = read_descriptors(dir.path()).unwrap();
        assert!(descriptors.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].vm_id, Some(101));
    }
}
