//! Interface Worker (component C): the long-lived unit that owns one bridge's
//! namespace, veth pair, DHCP child process and reservation set.

pub mod config_emitter;
pub mod net;

use std::collections::HashSet;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::BridgeGroup;
use crate::worker::net::HostNetworkEffector;

/// Binary invoked as the DHCP server child process. Out of scope per the spec;
/// this crate only knows how to spawn and supervise it.
const DHCP_BINARY: &str = "kea-dhcp4";

/// Subdirectory, relative to a worker's config dir, mounted as a private tmpfs
/// for the DHCP child's own runtime state (pid file, control socket).
const DHCP_RUNTIME_DIR: &str = "run";

#[derive(Debug)]
pub enum Error {
    Plumbing(net::PlumbingFailure),
    Io(std::io::Error),
    SpawnFailed(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Plumbing(e) => write!(f, "plumbing failure: {e}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::SpawnFailed(e) => write!(f, "failed to spawn dhcp child: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<net::PlumbingFailure> for Error {
    fn from(e: net::PlumbingFailure) -> Self {
        Error::Plumbing(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// The worker's position in its state machine, per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    NotStarted,
    PendingRebuild,
    Running,
    FailedStart,
    ExitedUnexpectedly,
    NoLongerNeeded,
}

impl WorkerStatus {
    /// States for which the supervisor must run a rebuild this tick.
    pub fn needs_rebuild(self) -> bool {
        matches!(
            self,
            WorkerStatus::NotStarted | WorkerStatus::PendingRebuild | WorkerStatus::ExitedUnexpectedly
        )
    }
}

/// Live counterpart of a `BridgeGroup`: owns plumbing, config and the DHCP
/// child process for one broadcast domain.
pub struct Worker {
    pub display_name: String,
    pub backing_link: String,
    pub vlan_tag: u16,
    pub subnet: cidr::Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub reservations: Vec<crate::model::Reservation>,
    allocated: Arc<Mutex<HashSet<Ipv4Addr>>>,
    pub status: WorkerStatus,
    applied_config: Option<Vec<u8>>,
    config_dir: PathBuf,
    child: Option<Child>,
    reader_task: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates a brand-new, `NotStarted` worker for a bridge group. Per the
    /// spec's "replace the worker value" design note, rebuilds never mutate an
    /// existing `Worker` across the stop/start boundary — they construct a new
    /// one with this function.
    pub fn new(group: &BridgeGroup, worker_root: &std::path::Path) -> Self {
        Worker {
            display_name: group.display_name.clone(),
            backing_link: group.backing_link.clone(),
            vlan_tag: group.vlan_tag,
            subnet: group.subnet,
            gateway: group.gateway,
            reservations: group.reservations.clone(),
            allocated: Arc::new(Mutex::new(HashSet::new())),
            status: WorkerStatus::NotStarted,
            applied_config: None,
            config_dir: worker_root.join(&group.display_name),
            child: None,
            reader_task: None,
        }
    }

    /// Renders the candidate configuration for `group` against this worker's
    /// currently applied configuration and reports whether they differ — the
    /// byte-for-byte comparison the supervisor uses to decide on a rebuild.
    pub fn config_changed(&self, group: &BridgeGroup) -> bool {
        let candidate = config_emitter::render_config(group, &self.config_dir.to_string_lossy());
        self.applied_config.as_deref() != Some(candidate.as_slice())
    }

    /// Updates the in-memory reservation set from a new `BridgeGroup` without
    /// touching plumbing; used when marking a worker `PendingRebuild`.
    pub fn adopt(&mut self, group: &BridgeGroup) {
        self.subnet = group.subnet;
        self.gateway = group.gateway;
        self.reservations = group.reservations.clone();
        self.vlan_tag = group.vlan_tag;
        self.backing_link = group.backing_link.clone();
    }

    /// Runs the Host-Network Effector, writes the rendered configuration and
    /// initial lease file, and spawns the DHCP child. Transitions to `Running`
    /// on success or `FailedStart` on any mandatory-step failure.
    pub async fn start(
        &mut self,
        effector: &(dyn HostNetworkEffector),
        group: &BridgeGroup,
    ) -> Result<(), Error> {
        match self.try_start(effector, group).await {
            Ok(()) => {
                self.status = WorkerStatus::Running;
                Ok(())
            }
            Err(e) => {
                self.status = WorkerStatus::FailedStart;
                Err(e)
            }
        }
    }

    async fn try_start(
        &mut self,
        effector: &(dyn HostNetworkEffector),
        group: &BridgeGroup,
    ) -> Result<(), Error> {
        effector
            .provision(&self.display_name, &self.backing_link, self.vlan_tag, self.subnet)
            .await?;

        fs::create_dir_all(&self.config_dir).await?;

        let config_bytes =
            config_emitter::render_config(group, &self.config_dir.to_string_lossy());
        fs::write(self.config_dir.join("kea-dhcp4.json"), &config_bytes).await?;
        fs::write(
            self.config_dir.join("leases.csv"),
            config_emitter::LEASE_FILE_HEADER,
        )
        .await?;

        let runtime_dir = self.config_dir.join(DHCP_RUNTIME_DIR);
        fs::create_dir_all(&runtime_dir).await?;

        let ns = net::namespace_name(&self.display_name);
        let config_path = self.config_dir.join("kea-dhcp4.json");
        // The private mount namespace from `unshare -m` is only visible to this
        // child, so the tmpfs mounted onto `runtime_dir` never touches the host
        // or other workers; the `exec` hands off to the DHCP binary inside the
        // namespace without an extra shell surviving as its parent.
        let shell_cmd = format!(
            "mount -t tmpfs tmpfs {runtime_dir} && exec ip netns exec {ns} {DHCP_BINARY} -c {config_path}",
            runtime_dir = runtime_dir.display(),
            config_path = config_path.display(),
        );
        let mut child = Command::new("unshare")
            .args(["-m", "--"])
            .arg("sh")
            .arg("-c")
            .arg(shell_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::SpawnFailed)?;

        let stderr = child.stderr.take().expect("stderr was piped");
        let stdout = child.stdout.take();
        let log_path = self.config_dir.join("log");
        let allocated = self.allocated.clone();
        let reader_task = tokio::spawn(supervise_child_output(stderr, stdout, log_path, allocated));

        self.child = Some(child);
        self.reader_task = Some(reader_task);
        self.applied_config = Some(config_bytes);
        self.reservations = group.reservations.clone();

        info!("worker {} started (ns={ns})", self.display_name);
        Ok(())
    }

    /// Non-blocking check for whether the child process has exited on its own.
    /// Transitions to `ExitedUnexpectedly` if so.
    pub fn poll_child_exit(&mut self) {
        if self.status != WorkerStatus::Running {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(
                    "dhcp child for worker {} exited unexpectedly: {status}",
                    self.display_name
                );
                self.status = WorkerStatus::ExitedUnexpectedly;
            }
        }
    }

    /// Idempotent teardown: deletes the namespace and veth (best-effort), kills
    /// the child if one was spawned, and waits for the reader task to quiesce.
    pub async fn stop(&mut self, effector: &(dyn HostNetworkEffector)) {
        effector.teardown(&self.display_name).await;

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if let Some(reader_task) = self.reader_task.take() {
            let _ = reader_task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// A snapshot of the IPs observed as allocated so far, for the status view.
    pub async fn allocated_snapshot(&self) -> HashSet<Ipv4Addr> {
        self.allocated.lock().await.clone()
    }
}

/// Consumes the child's stderr line-by-line until EOF (never by blocking on a
/// single read after the process has exited), scanning for lease-allocation
/// lines, and tees both stdout and stderr to the worker's log file.
async fn supervise_child_output(
    stderr: tokio::process::ChildStderr,
    stdout: Option<tokio::process::ChildStdout>,
    log_path: PathBuf,
    allocated: Arc<Mutex<HashSet<Ipv4Addr>>>,
) {
    let lease_pattern = Regex::new(r"lease (\S+) has been allocated").unwrap();

    let mut log_file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            error!("failed to open worker log file {}: {e}", log_path.display());
            None
        }
    };

    if let Some(stdout) = stdout {
        let log_path = log_path.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
                .ok();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(file) = file.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
            }
        });
    }

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(file) = log_file.as_mut() {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }

        if let Some(ip) = find_allocated_ip(&line, &lease_pattern) {
            debug!("lease allocated: {ip}");
            allocated.lock().await.insert(ip);
        }
    }
}

/// Matches a lease-allocation log line against a worker's reservation set and
/// returns the IP that was allocated, if any is present in the line.
pub fn find_allocated_ip(line: &str, pattern: &Regex) -> Option<Ipv4Addr> {
    pattern
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<Ipv4Addr>().ok())
}
