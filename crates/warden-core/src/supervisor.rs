//! Fleet supervisor: the public face of the engine.
//!
//! Callers queue activation requests with [`Supervisor::add_device`] and
//! [`Supervisor::remove_device`]. A manager task wakes every reconcile
//! interval, drains the queued requests and starts or stops device workers
//! so that a device has a live worker exactly when it is in the active set.

use std::collections::HashMap;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::DeviceDirectory;
use crate::harness::Harness;
use crate::project::ProjectBuilder;
use crate::registry::{ActiveDevices, DeviceRegistry};
use crate::sink::LogSink;
use crate::worker::{DeviceWorker, WorkerConfig, WorkerHandle, WorkerState};
use crate::{Device, DeviceId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding the project; the build runs here.
    pub root_path: PathBuf,
    /// Output silence after which a harness instance is killed.
    pub harness_timeout: Duration,
    /// How often the manager applies queued requests.
    pub reconcile_interval: Duration,
    /// How often each worker checks membership and runs its watchdog.
    pub poll_interval: Duration,
    /// Pause before a harness is respawned.
    pub restart_delay: Duration,
    /// How long to keep reading output after a harness exited.
    pub output_drain: Duration,
}

impl SupervisorConfig {
    pub fn new(root_path: impl Into<PathBuf>, harness_timeout: Duration) -> Self {
        Self {
            root_path: root_path.into(),
            harness_timeout,
            ..Self::default()
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            restart_delay: self.restart_delay,
            harness_timeout: self.harness_timeout,
            output_drain: self.output_drain,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            root_path: PathBuf::from("."),
            harness_timeout: worker.harness_timeout,
            reconcile_interval: Duration::from_secs(1),
            poll_interval: worker.poll_interval,
            restart_delay: worker.restart_delay,
            output_drain: worker.output_drain,
        }
    }
}

/// Errors returned by [`Supervisor::start`].
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor already started")]
    AlreadyStarted,
    #[error("project build failed: {0:#}")]
    BuildFailed(anyhow::Error),
    #[error("failed to load devices: {0:#}")]
    Directory(anyhow::Error),
}

/// Point-in-time view of one device worker.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub device: Device,
    pub state: WorkerState,
    /// Harness instances spawned by the current worker.
    pub instances: u64,
}

#[derive(Debug, Default)]
struct WorkerTable {
    live: HashMap<DeviceId, WorkerHandle>,
    /// Workers told to stop that have not finished yet.
    retiring: Vec<WorkerHandle>,
}

impl WorkerTable {
    /// Take every retiring worker for `udid` out of the table.
    fn take_retiring(&mut self, udid: &DeviceId) -> Vec<WorkerHandle> {
        let (matching, others) = mem::take(&mut self.retiring)
            .into_iter()
            .partition(|w| w.udid() == udid);
        self.retiring = others;
        matching
    }

    /// Join finished workers. Returns the ids of live workers that ended on
    /// their own.
    async fn reap(&mut self) -> Vec<DeviceId> {
        let (done, pending): (Vec<_>, Vec<_>) = mem::take(&mut self.retiring)
            .into_iter()
            .partition(WorkerHandle::is_finished);
        self.retiring = pending;
        for worker in done {
            worker.join().await;
        }

        let ended: Vec<DeviceId> = self
            .live
            .iter()
            .filter(|(_, w)| w.is_finished())
            .map(|(udid, _)| udid.clone())
            .collect();
        for udid in &ended {
            if let Some(worker) = self.live.remove(udid) {
                warn!(device_id = %udid, "device worker ended while device was active");
                worker.join().await;
            }
        }
        ended
    }
}

struct Inner {
    config: SupervisorConfig,
    registry: DeviceRegistry,
    active: ActiveDevices,
    harness: Arc<dyn Harness>,
    sink: Arc<dyn LogSink>,
    workers: tokio::sync::Mutex<WorkerTable>,
}

impl Inner {
    /// Apply every queued request. Removals run before additions so that a
    /// remove followed by an add of the same device restarts it.
    ///
    /// Never waits on a worker: a replacement for a device whose previous
    /// worker is still winding down starts once that worker has finished,
    /// without holding up the rest of the batch.
    async fn reconcile(&self) {
        let batch = self.registry.drain_pending();
        let mut table = self.workers.lock().await;

        if !batch.is_empty() {
            debug!(
                adds = batch.to_add.len(),
                removes = batch.to_remove.len(),
                "applying device requests"
            );
        }

        for device in batch.to_remove {
            self.active.remove(&device.udid);
            match table.live.remove(&device.udid) {
                Some(worker) => {
                    info!(device_id = %device.udid, device_name = %device.name, "deactivating device");
                    worker.stop();
                    table.retiring.push(worker);
                }
                None => debug!(device_id = %device.udid, "ignoring removal of inactive device"),
            }
        }

        for device in latest_adds(batch.to_add) {
            if let Some(current) = table.live.get(&device.udid) {
                if current.device().same_config(&device) {
                    debug!(device_id = %device.udid, "device already active");
                    continue;
                }
            }

            let mut predecessors = table.take_retiring(&device.udid);
            if let Some(current) = table.live.remove(&device.udid) {
                info!(device_id = %device.udid, device_name = %device.name, "device configuration changed, restarting");
                current.stop();
                predecessors.push(current);
            }

            info!(device_id = %device.udid, device_name = %device.name, "activating device");
            self.active.insert(device.clone());
            let worker = DeviceWorker::new(
                device.clone(),
                Arc::clone(&self.harness),
                Arc::clone(&self.sink),
                self.active.clone(),
                self.config.worker_config(),
            )
            .start_after(predecessors);
            table.live.insert(device.udid, worker);
        }

        for udid in table.reap().await {
            self.active.remove(&udid);
        }
    }

    /// Stop every worker and wait for all of them.
    async fn stop_all(&self) {
        let workers: Vec<WorkerHandle> = {
            let mut table = self.workers.lock().await;
            let mut workers: Vec<WorkerHandle> = table.live.drain().map(|(_, w)| w).collect();
            workers.append(&mut table.retiring);
            workers
        };
        for worker in &workers {
            self.active.remove(worker.udid());
            worker.stop();
        }
        for worker in workers {
            worker.join().await;
        }
    }
}

/// Collapse a batch of adds to one per device. The last add for a device
/// carries its configuration; the first one fixes its position.
fn latest_adds(adds: Vec<Device>) -> Vec<Device> {
    let mut position: HashMap<DeviceId, usize> = HashMap::new();
    let mut latest: Vec<Device> = Vec::with_capacity(adds.len());
    for device in adds {
        match position.get(&device.udid) {
            Some(&i) => {
                debug!(device_id = %device.udid, "duplicate add in batch, keeping the latest");
                latest[i] = device;
            }
            None => {
                position.insert(device.udid.clone(), latest.len());
                latest.push(device);
            }
        }
    }
    latest
}

async fn manager_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    info!(
        interval_ms = inner.config.reconcile_interval.as_millis() as u64,
        "device manager started"
    );
    let mut tick = tokio::time::interval(inner.config.reconcile_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        inner.reconcile().await;
    }
    info!("device manager stopped");
}

/// Keeps one harness worker running per active device.
pub struct Supervisor {
    inner: Arc<Inner>,
    started: AtomicBool,
    shutdown: CancellationToken,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, harness: Arc<dyn Harness>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: DeviceRegistry::new(),
                active: ActiveDevices::new(),
                harness,
                sink,
                workers: tokio::sync::Mutex::new(WorkerTable::default()),
            }),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            manager: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Build the project, queue every device from `directory`, and start the
    /// manager loop. Returns once the manager is running.
    ///
    /// A build or directory failure leaves the supervisor without a manager;
    /// it cannot be started again.
    pub async fn start(
        &self,
        builder: &dyn ProjectBuilder,
        directory: &dyn DeviceDirectory,
    ) -> Result<(), SupervisorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStarted);
        }

        let root = &self.inner.config.root_path;
        info!(root = %root.display(), "building project");
        builder.build(root).await.map_err(SupervisorError::BuildFailed)?;

        let devices = directory
            .list_devices()
            .await
            .map_err(SupervisorError::Directory)?;
        info!(count = devices.len(), "loaded devices");
        for device in devices {
            self.inner.registry.add(device);
        }

        let handle = tokio::spawn(manager_loop(
            Arc::clone(&self.inner),
            self.shutdown.clone(),
        ));
        *lock(&self.manager) = Some(handle);
        Ok(())
    }

    /// Queue a device for activation. Takes effect on the next reconcile.
    pub fn add_device(&self, device: Device) {
        debug!(device_id = %device.udid, "queued device add");
        self.inner.registry.add(device);
    }

    /// Queue a device for deactivation. Takes effect on the next reconcile.
    pub fn remove_device(&self, device: Device) {
        debug!(device_id = %device.udid, "queued device removal");
        self.inner.registry.remove(device);
    }

    /// Devices currently in the active set, sorted by UDID.
    pub fn active_devices(&self) -> Vec<Device> {
        self.inner.active.snapshot()
    }

    pub fn is_active(&self, udid: &DeviceId) -> bool {
        self.inner.active.contains(udid)
    }

    /// Number of live (not retiring) workers.
    pub async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.live.len()
    }

    /// Status of every live worker, sorted by UDID.
    pub async fn device_statuses(&self) -> Vec<DeviceStatus> {
        let table = self.inner.workers.lock().await;
        let mut statuses: Vec<DeviceStatus> = table
            .live
            .values()
            .map(|w| DeviceStatus {
                device: w.device().clone(),
                state: w.state(),
                instances: w.instances(),
            })
            .collect();
        statuses.sort_by(|a, b| a.device.udid.cmp(&b.device.udid));
        statuses
    }

    /// Stop the manager and every worker, killing running harnesses.
    /// Queued requests that were not applied yet are dropped.
    pub async fn shutdown(&self) {
        info!("shutting down supervisor");
        self.shutdown.cancel();
        let manager = lock(&self.manager).take();
        if let Some(manager) = manager {
            if let Err(e) = manager.await {
                warn!(error = %e, "device manager panicked");
            }
        }
        self.inner.stop_all().await;
        let dropped = self.inner.registry.drain_pending();
        if !dropped.is_empty() {
            debug!(
                adds = dropped.to_add.len(),
                removes = dropped.to_remove.len(),
                "dropped unapplied device requests"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::harness::{HarnessHandle, OutputStreamBox};
    use crate::project::NoopBuilder;
    use crate::sink::NullSink;

    use anyhow::{Result, bail};
    use async_trait::async_trait;

    /// Harness whose instances block until killed.
    #[derive(Default)]
    struct BlockingHarness {
        kills: tokio::sync::Mutex<HashMap<u32, CancellationToken>>,
        next_pid: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Harness for BlockingHarness {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn spawn(&self, device: &Device) -> Result<HarnessHandle> {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
            self.kills.lock().await.insert(pid, CancellationToken::new());
            Ok(HarnessHandle {
                pid,
                udid: device.udid.clone(),
                harness_name: "blocking".to_string(),
            })
        }

        fn output(&self, _handle: &HarnessHandle) -> OutputStreamBox {
            Box::pin(futures::stream::empty())
        }

        async fn wait(&self, handle: &HarnessHandle) -> Result<Option<i32>> {
            let token = self.kills.lock().await.get(&handle.pid).cloned();
            if let Some(token) = token {
                token.cancelled().await;
            }
            Ok(None)
        }

        async fn kill(&self, handle: &HarnessHandle) -> Result<()> {
            if let Some(token) = self.kills.lock().await.get(&handle.pid) {
                token.cancel();
            }
            Ok(())
        }

        async fn is_running(&self, handle: &HarnessHandle) -> bool {
            self.kills
                .lock()
                .await
                .get(&handle.pid)
                .is_some_and(|t| !t.is_cancelled())
        }
    }

    struct FailingBuilder;

    #[async_trait]
    impl ProjectBuilder for FailingBuilder {
        async fn build(&self, _root_path: &std::path::Path) -> Result<()> {
            bail!("xcodebuild exited with status 65")
        }
    }

    fn device(udid: &str) -> Device {
        Device::new(udid.parse().unwrap(), format!("phone-{udid}"))
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(
            SupervisorConfig::default(),
            Arc::new(BlockingHarness::default()),
            Arc::new(NullSink),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_applies_removes_before_adds() {
        let sup = supervisor();
        sup.add_device(device("a"));
        sup.inner.reconcile().await;
        assert_eq!(sup.worker_count().await, 1);

        sup.remove_device(device("a"));
        sup.add_device(device("a"));
        sup.inner.reconcile().await;
        assert!(sup.is_active(&"a".parse().unwrap()));
        let statuses = sup.device_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(sup.inner.workers.lock().await.retiring.is_empty());

        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_adds_in_one_batch_start_one_worker() {
        let sup = supervisor();
        sup.add_device(device("a"));
        sup.add_device(device("a"));
        sup.add_device(device("b"));
        sup.inner.reconcile().await;
        assert_eq!(sup.worker_count().await, 2);
        assert_eq!(sup.active_devices().len(), 2);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn latest_add_in_a_batch_wins() {
        let sup = supervisor();
        sup.add_device(device("a").with_param("port", "1"));
        sup.add_device(device("b"));
        sup.add_device(device("a").with_param("port", "2"));
        sup.inner.reconcile().await;

        let statuses = sup.device_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].device.params.get("port").map(String::as_str), Some("2"));
        assert_eq!(
            sup.active_devices()[0].params.get("port").map(String::as_str),
            Some("2")
        );
        sup.shutdown().await;
    }

    #[test]
    fn latest_adds_keeps_first_position() {
        let adds = vec![
            device("b"),
            device("a").with_param("k", "1"),
            device("b").with_param("k", "2"),
        ];
        let latest = latest_adds(adds);
        let udids: Vec<&str> = latest.iter().map(|d| d.udid.as_str()).collect();
        assert_eq!(udids, vec!["b", "a"]);
        assert_eq!(latest[0].params.get("k").map(String::as_str), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn removing_unknown_device_is_a_no_op() {
        let sup = supervisor();
        sup.remove_device(device("ghost"));
        sup.inner.reconcile().await;
        assert_eq!(sup.worker_count().await, 0);
        assert!(sup.active_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let sup = supervisor();
        sup.start(&NoopBuilder, &StaticDirectory::default())
            .await
            .unwrap();
        let err = sup
            .start(&NoopBuilder, &StaticDirectory::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyStarted));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn build_failure_is_fatal() {
        let sup = supervisor();
        let err = sup
            .start(&FailingBuilder, &StaticDirectory::new(vec![device("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::BuildFailed(_)));
        assert!(err.to_string().contains("status 65"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sup.worker_count().await, 0);
        assert!(lock(&sup.manager).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_worker() {
        let sup = supervisor();
        sup.start(
            &NoopBuilder,
            &StaticDirectory::new(vec![device("a"), device("b")]),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.worker_count().await, 2);

        sup.shutdown().await;
        assert_eq!(sup.worker_count().await, 0);
        assert!(sup.active_devices().is_empty());
    }

    #[test]
    fn status_serializes_flat() {
        let status = DeviceStatus {
            device: device("a").with_param("port", "8080"),
            state: WorkerState::Running,
            instances: 3,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["udid"], "a");
        assert_eq!(json["state"], "running");
        assert_eq!(json["instances"], 3);
        assert_eq!(json["params"]["port"], "8080");
    }
}
