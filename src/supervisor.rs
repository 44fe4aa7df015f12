//! Reconciliation Supervisor (component F): the periodic loop that reads
//! desired state, diffs it against the live worker registry, and drives every
//! worker's create/reconfigure/destroy lifecycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PkciConfig;
use crate::desired::build_desired_state;
use crate::descriptor::read_descriptors;
use crate::model::{BridgeGroup, BridgeGroupView, BridgeKey, Reservation};
use crate::worker::net::HostNetworkEffector;
use crate::worker::{Worker, WorkerStatus};

pub type SupervisorStateRef = Arc<Mutex<SupervisorState>>;
pub type ReconcilerRef = Arc<Mutex<Reconciler>>;

/// A live worker's state as exposed to the status view: everything in
/// `BridgeGroupView` plus what only the worker itself knows.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerView {
    pub display_name: String,
    pub status: WorkerStatus,
    pub vlan_tag: u16,
    pub subnet: String,
    pub gateway: Option<std::net::Ipv4Addr>,
    pub reservations: Vec<Reservation>,
    pub allocated_reservations: Vec<Reservation>,
}

/// Read-only snapshot published by the reconciliation task after a tick
/// completes. This is the only state the status view touches: it is replaced
/// wholesale, never mutated field-by-field while a reader might be looking at
/// it, and the supervisor never holds this lock across a host command or
/// child spawn (see `Reconciler`, which owns the mutable registry instead).
pub struct SupervisorState {
    desired: Vec<BridgeGroupView>,
    workers: Vec<WorkerView>,
    errors: Vec<String>,
    crash: Option<String>,
}

impl SupervisorState {
    pub fn new() -> Self {
        SupervisorState {
            desired: Vec::new(),
            workers: Vec::new(),
            errors: Vec::new(),
            crash: None,
        }
    }

    pub fn desired_views(&self) -> Vec<BridgeGroupView> {
        self.desired.clone()
    }

    pub fn worker_views(&self) -> Vec<WorkerView> {
        self.workers.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.clone()
    }

    pub fn crash(&self) -> Option<String> {
        self.crash.clone()
    }

    fn publish_crash(&mut self, crash: String) {
        self.crash = Some(crash);
    }

    fn publish_tick(&mut self, desired: Vec<BridgeGroupView>, workers: Vec<WorkerView>, errors: Vec<String>) {
        self.desired = desired;
        self.workers = workers;
        self.errors = errors;
        self.crash = None;
    }
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

/// The reconciliation task's own mutable state: the last-computed desired
/// state and the live worker registry. Held behind its own mutex so a
/// shutdown handler can wait for an in-flight tick to finish before tearing
/// workers down, but this mutex is never shared with the status view — the
/// view only ever reads `SupervisorState` snapshots.
///
/// Both maps are `BTreeMap`, not `HashMap`: `BridgeKey` derives `Ord`
/// specifically so registry iteration order (used for rebuild ordering in
/// step 5) is deterministic across runs rather than dependent on a
/// per-process hash seed, per §5's "stable for testability" requirement.
pub struct Reconciler {
    desired: BTreeMap<BridgeKey, BridgeGroup>,
    workers: BTreeMap<BridgeKey, Worker>,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler {
            desired: BTreeMap::new(),
            workers: BTreeMap::new(),
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one reconciliation tick, per §4.6 steps 1-7. All host commands and
/// child spawns happen against `reconciler`, which only this task touches;
/// `state` (shared with the status view) is locked only once, briefly, to
/// publish the resulting snapshot — so a tick that takes several seconds to
/// rebuild workers never blocks a `/stats` or `/stats_raw` reader.
pub async fn tick(
    reconciler: &mut Reconciler,
    state: &SupervisorStateRef,
    descriptor_dir: &Path,
    worker_root: &Path,
    effector: &(dyn HostNetworkEffector),
) {
    let (descriptors, descriptor_errors) = match read_descriptors(descriptor_dir) {
        Ok(result) => result,
        Err(e) => {
            error!("reconciliation tick aborted: {e}");
            state
                .lock()
                .await
                .publish_crash(format!("failed to read descriptor directory: {e}"));
            return;
        }
    };

    let (desired, mut errors) = build_desired_state(&descriptors, descriptor_errors);
    reconciler.desired = desired;

    // Step 3: create/mark-for-rebuild every worker whose desired config changed.
    for (key, group) in &reconciler.desired {
        if let Some(worker) = reconciler.workers.get_mut(key) {
            if worker.config_changed(group) {
                debug!("worker {} needs rebuild: configuration changed", group.display_name);
                worker.adopt(group);
                worker.status = WorkerStatus::PendingRebuild;
            }
        } else {
            debug!("creating new worker for {}", group.display_name);
            let worker = Worker::new(group, worker_root);
            reconciler.workers.insert(key.clone(), worker);
        }
    }

    // Step 4: retire workers no longer present in desired state.
    let stale: Vec<BridgeKey> = reconciler
        .workers
        .keys()
        .filter(|key| !reconciler.desired.contains_key(key))
        .cloned()
        .collect();
    for key in stale {
        if let Some(mut worker) = reconciler.workers.remove(&key) {
            info!("retiring worker {}", worker.display_name);
            worker.stop(effector).await;
        }
    }

    // Step 5/6: rebuild every worker that needs it, in registry (BTreeMap)
    // order; replace the Worker value rather than restarting it in place (see
    // worker::Worker::new docs).
    let rebuild_keys: Vec<BridgeKey> = reconciler
        .workers
        .iter()
        .filter(|(_, w)| w.status.needs_rebuild())
        .map(|(k, _)| k.clone())
        .collect();

    for key in rebuild_keys {
        let Some(group) = reconciler.desired.get(&key).cloned() else {
            continue;
        };

        if let Some(mut old) = reconciler.workers.remove(&key) {
            old.stop(effector).await;
        }

        let mut fresh = Worker::new(&group, worker_root);
        match fresh.start(effector, &group).await {
            Ok(()) => info!("worker {} rebuilt and running", group.display_name),
            Err(e) => {
                warn!("worker {} failed to start: {e}", group.display_name);
                errors.push(format!("worker {} failed to start: {e}", group.display_name));
            }
        }
        reconciler.workers.insert(key, fresh);
    }

    for worker in reconciler.workers.values_mut() {
        worker.poll_child_exit();
    }

    let desired_views = reconciler.desired.values().map(BridgeGroupView::from).collect();
    let worker_views = build_worker_views(&reconciler.workers).await;

    state.lock().await.publish_tick(desired_views, worker_views, errors);
}

/// Builds the status view's per-worker snapshot, cross-referencing each
/// worker's observed-allocated IPs back against its reservation set so
/// `/stats` reports allocated *reservations* (with their vm_id/mac), not bare
/// addresses.
async fn build_worker_views(workers: &BTreeMap<BridgeKey, Worker>) -> Vec<WorkerView> {
    let mut views = Vec::with_capacity(workers.len());
    for worker in workers.values() {
        let allocated = worker.allocated_snapshot().await;
        let allocated_reservations = worker
            .reservations
            .iter()
            .filter(|r| allocated.contains(&r.ip))
            .cloned()
            .collect();

        views.push(WorkerView {
            display_name: worker.display_name.clone(),
            status: worker.status,
            vlan_tag: worker.vlan_tag,
            subnet: worker.subnet.to_string(),
            gateway: worker.gateway,
            reservations: worker.reservations.clone(),
            allocated_reservations,
        });
    }
    views
}

/// Runs the reconciliation loop forever, sleeping `poll_interval` between
/// ticks. Ticks never overlap: the sleep only starts once the prior tick has
/// published its snapshot.
pub async fn run(
    reconciler: ReconcilerRef,
    state: SupervisorStateRef,
    config: PkciConfig,
    effector: Arc<dyn HostNetworkEffector>,
) {
    let descriptor_dir = PathBuf::from(&config.api.descriptor_dir);
    let worker_root = PathBuf::from(&config.api.worker_dir);
    let poll_interval = Duration::from_secs(config.api.poll_interval_secs);

    loop {
        {
            let mut reconciler = reconciler.lock().await;
            tick(&mut reconciler, &state, &descriptor_dir, &worker_root, effector.as_ref()).await;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Best-effort teardown of every worker in the registry, for graceful
/// shutdown. Callers stop the poll task first (so no new tick can start),
/// then call this, which waits for any tick already in flight to finish
/// before tearing every worker down.
pub async fn shutdown(reconciler: &ReconcilerRef, effector: &(dyn HostNetworkEffector)) {
    let mut reconciler = reconciler.lock().await;
    for (_, mut worker) in std::mem::take(&mut reconciler.workers) {
        worker.stop(effector).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::net::MockHostNetworkEffector;
    use std::io::Write;

    fn write_descriptor(dir: &Path, vm_id: u32, contents: &str) {
        let mut file = std::fs::File::create(dir.join(format!("{vm_id}.conf"))).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn tick_creates_worker_for_new_bridge() {
        let descriptor_dir = tempfile::tempdir().unwrap();
        let worker_root = tempfile::tempdir().unwrap();
        write_descriptor(
            descriptor_dir.path(),
            100,
            "net0: virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0\nipconfig0: ip=192.168.10.5/24,gw=192.168.10.1\n",
        );

        let mut reconciler = Reconciler::new();
        let state = Arc::new(Mutex::new(SupervisorState::new()));
        let effector = MockHostNetworkEffector::new();

        tick(&mut reconciler, &state, descriptor_dir.path(), worker_root.path(), &effector).await;

        assert_eq!(reconciler.workers.len(), 1);
        assert_eq!(reconciler.desired.len(), 1);
        let locked = state.lock().await;
        assert_eq!(locked.worker_views().len(), 1);
        assert!(locked.crash().is_none());
    }

    #[tokio::test]
    async fn tick_retires_worker_when_descriptor_removed() {
        let descriptor_dir = tempfile::tempdir().unwrap();
        let worker_root = tempfile::tempdir().unwrap();
        write_descriptor(
            descriptor_dir.path(),
            100,
            "net0: virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0\nipconfig0: ip=192.168.10.5/24,gw=192.168.10.1\n",
        );

        let mut reconciler = Reconciler::new();
        let state = Arc::new(Mutex::new(SupervisorState::new()));
        let mut effector = MockHostNetworkEffector::new();
        effector.expect_teardown().returning(|_| ());

        tick(&mut reconciler, &state, descriptor_dir.path(), worker_root.path(), &effector).await;
        std::fs::remove_file(descriptor_dir.path().join("100.conf")).unwrap();
        tick(&mut reconciler, &state, descriptor_dir.path(), worker_root.path(), &effector).await;

        assert_eq!(reconciler.workers.len(), 0);
        let locked = state.lock().await;
        assert!(locked.worker_views().is_empty());
    }

    #[tokio::test]
    async fn tick_records_crash_on_unreadable_descriptor_dir() {
        let worker_root = tempfile::tempdir().unwrap();
        let missing = PathBuf::from("/nonexistent/pkci-descriptor-dir");

        let mut reconciler = Reconciler::new();
        let state = Arc::new(Mutex::new(SupervisorState::new()));
        let effector = MockHostNetworkEffector::new();

        tick(&mut reconciler, &state, &missing, worker_root.path(), &effector).await;

        let locked = state.lock().await;
        assert!(locked.crash().is_some());
    }

    #[tokio::test]
    async fn rebuild_order_is_deterministic_across_bridges() {
        let descriptor_dir = tempfile::tempdir().unwrap();
        let worker_root = tempfile::tempdir().unwrap();
        write_descriptor(
            descriptor_dir.path(),
            100,
            "net0: virtio=AA:BB:CC:DD:EE:01,bridge=vmbr9\nipconfig0: ip=192.168.9.5/24,gw=192.168.9.1\n",
        );
        write_descriptor(
            descriptor_dir.path(),
            101,
            "net0: virtio=AA:BB:CC:DD:EE:02,bridge=vmbr1\nipconfig0: ip=192.168.1.5/24,gw=192.168.1.1\n",
        );

        let mut reconciler = Reconciler::new();
        let state = Arc::new(Mutex::new(SupervisorState::new()));
        let effector = MockHostNetworkEffector::new();

        tick(&mut reconciler, &state, descriptor_dir.path(), worker_root.path(), &effector).await;

        let keys: Vec<String> = reconciler.workers.keys().map(|k| k.display_name.clone()).collect();
        assert_eq!(keys, vec!["vmbr1".to_string(), "vmbr9".to_string()]);
    }
}
