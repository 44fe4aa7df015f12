//! Host-Network Effector (component D): issues idempotent host commands to
//! create/destroy namespaces, veth pairs, addresses and VLAN filters for one
//! worker.

use std::time::Duration;

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use mockall::automock;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::model::worker_address;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of a single mandatory plumbing step.
#[derive(Debug)]
pub struct PlumbingFailure {
    pub step: &'static str,
    pub message: String,
}

impl std::fmt::Display for PlumbingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plumbing step '{}' failed: {}", self.step, self.message)
    }
}

impl std::error::Error for PlumbingFailure {}

/// Host-side names for a worker identified by its display name `I`.
pub fn namespace_name(display_name: &str) -> String {
    format!("kea_{display_name}")
}

pub fn host_veth_name(display_name: &str) -> String {
    format!("kh_{display_name}")
}

pub fn ns_veth_name(display_name: &str) -> String {
    format!("kn_{display_name}")
}

/// The side effects a worker needs from the host network stack. Mocked in tests
/// via `MockHostNetworkEffector` so the reconciliation logic can be exercised
/// without a real network namespace.
#[automock]
#[async_trait]
pub trait HostNetworkEffector: Send + Sync {
    /// Provisions the namespace, veth pair and (if tagged) VLAN filter for a
    /// worker. Mandatory steps abort on the first failure.
    async fn provision(
        &self,
        display_name: &str,
        backing_link: &str,
        vlan_tag: u16,
        subnet: Ipv4Cidr,
    ) -> Result<(), PlumbingFailure>;

    /// Best-effort teardown of the namespace and host veth. Never fails.
    async fn teardown(&self, display_name: &str);
}

/// Real effector, driving `ip` and `bridge` via argv-form child process
/// invocations, each bounded by a per-command timeout.
#[derive(Default)]
pub struct RealHostNetworkEffector;

#[async_trait]
impl HostNetworkEffector for RealHostNetworkEffector {
    async fn provision(
        &self,
        display_name: &str,
        backing_link: &str,
        vlan_tag: u16,
        subnet: Ipv4Cidr,
    ) -> Result<(), PlumbingFailure> {
        let ns = namespace_name(display_name);
        let host_veth = host_veth_name(display_name);
        let ns_veth = ns_veth_name(display_name);
        let address = worker_address(&subnet);
        let prefix = subnet.network_length();

        debug!("provisioning worker {display_name} (ns={ns}, veth={host_veth}/{ns_veth})");

        run_required("create namespace", "ip", &["netns", "add", &ns]).await?;

        // Best-effort: an existing stale veth from a prior crashed run is removed,
        // but its absence is not a failure.
        let _ = run("ip", &["link", "delete", &host_veth]).await;

        run_required(
            "create veth pair",
            "ip",
            &[
                "link", "add", &host_veth, "type", "veth", "peer", "name", &ns_veth,
            ],
        )
        .await?;

        run_required(
            "move veth into namespace",
            "ip",
            &["link", "set", &ns_veth, "netns", &ns],
        )
        .await?;

        run_required(
            "bring up loopback in namespace",
            "ip",
            &["-n", &ns, "link", "set", "lo", "up"],
        )
        .await?;
        run_required(
            "bring up namespace veth",
            "ip",
            &["-n", &ns, "link", "set", &ns_veth, "up"],
        )
        .await?;
        run_required(
            "assign namespace address",
            "ip",
            &[
                "-n",
                &ns,
                "addr",
                "add",
                &format!("{address}/{prefix}"),
                "broadcast",
                "+",
                "dev",
                &ns_veth,
            ],
        )
        .await?;

        if vlan_tag != 0 {
            run_required(
                "enslave host veth to backing link",
                "ip",
                &["link", "set", &host_veth, "master", backing_link],
            )
            .await?;
        } else {
            run_required(
                "enslave host veth to bridge",
                "ip",
                &["link", "set", &host_veth, "master", display_name],
            )
            .await?;
        }

        run_required(
            "bring up host veth",
            "ip",
            &["link", "set", &host_veth, "up"],
        )
        .await?;

        if vlan_tag != 0 {
            run_required(
                "remove default vlan",
                "bridge",
                &["vlan", "del", "vid", "1", "dev", &host_veth],
            )
            .await?;
            run_required(
                "add tagged vlan",
                "bridge",
                &[
                    "vlan", "add", "vid", &vlan_tag.to_string(), "dev", &host_veth, "pvid",
                    "untagged",
                ],
            )
            .await?;
        }

        debug!("worker {display_name} provisioned");
        Ok(())
    }

    async fn teardown(&self, display_name: &str) {
        let ns = namespace_name(display_name);
        let host_veth = host_veth_name(display_name);

        let _ = run("ip", &["netns", "del", &ns]).await;
        let _ = run("ip", &["link", "del", &host_veth]).await;
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), PlumbingFailure> {
    trace!("running: {program} {}", args.join(" "));

    let output = timeout(COMMAND_TIMEOUT, Command::new(program).args(args).output())
        .await
        .map_err(|_| PlumbingFailure {
            step: "command",
            message: format!("{program} {} timed out", args.join(" ")),
        })?
        .map_err(|e| PlumbingFailure {
            step: "command",
            message: format!("failed to execute {program}: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlumbingFailure {
            step: "command",
            message: format!("{program} {} exited with {}: {stderr}", args.join(" "), output.status),
        });
    }

    Ok(())
}

async fn run_required(step: &'static str, program: &str, args: &[&str]) -> Result<(), PlumbingFailure> {
    run(program, args).await.map_err(|e| {
        warn!("{step} failed: {e}");
        PlumbingFailure {
            step,
            message: e.message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_names_follow_naming_scheme() {
        assert_eq!(namespace_name("vmbr0"), "kea_vmbr0");
        assert_eq!(host_veth_name("vmbr0"), "kh_vmbr0");
        assert_eq!(ns_veth_name("vmbr0"), "kn_vmbr0");
    }

    #[test]
    fn vlan_naming_scheme() {
        assert_eq!(namespace_name("vmbr0.100"), "kea_vmbr0.100");
        assert_eq!(host_veth_name("vmbr0.100"), "kh_vmbr0.100");
    }

    #[tokio::test]
    async fn mock_effector_can_simulate_failure() {
        let mut mock = MockHostNetworkEffector::new();
        mock.expect_provision()
            .returning(|_, _, _, _| {
                Err(PlumbingFailure {
                    step: "create namespace",
                    message: "ip netns add failed".to_string(),
                })
            });

        let subnet: Ipv4Cidr = "192.168.10.0/24".parse().unwrap();
        let result = mock.provision("vmbr0", "vmbr0", 0, subnet).await;
        assert!(result.is_err());
    }
}
