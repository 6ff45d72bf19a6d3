//! Per-device worker: spawn, stream, wait, restart.
//!
//! Each worker runs two tokio tasks:
//!
//! - the **poll loop** ([`DeviceWorker::run`]) wakes every poll interval,
//!   checks that the device is still active and lets the watchdog kill a
//!   stalled instance;
//! - the **harness loop** spawns the harness, forwards its output, waits for
//!   it to exit and, after the restart delay, spawns it again while the
//!   device stays active.
//!
//! ```text
//! Starting -> Running -> Exited -> Restarting -> Running -> ...
//!                \__________\___________\__> Stopping -> Terminated
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::harness::{Harness, HarnessHandle, OutputStreamBox};
use crate::registry::ActiveDevices;
use crate::sink::{LogSink, Transcript};
use crate::watchdog::Watchdog;
use crate::{Device, DeviceId};

/// Lifecycle state of a device worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Exited,
    Restarting,
    Stopping,
    Terminated,
}

/// Timing knobs for a device worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Membership poll and watchdog check period.
    pub poll_interval: Duration,
    /// Pause between an instance exiting and the next spawn.
    pub restart_delay: Duration,
    /// Output silence after which the watchdog kills an instance.
    pub harness_timeout: Duration,
    /// How long to keep reading output after the process exited.
    pub output_drain: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            harness_timeout: Duration::from_secs(60),
            output_drain: Duration::from_secs(2),
        }
    }
}

struct WorkerContext {
    device: Device,
    harness: Arc<dyn Harness>,
    sink: Arc<dyn LogSink>,
    active: ActiveDevices,
    config: WorkerConfig,
    watchdog: Watchdog,
    stop: CancellationToken,
    state: watch::Sender<WorkerState>,
    instances: Arc<AtomicU64>,
}

impl WorkerContext {
    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(device_id = %self.device.udid, from = ?previous, to = ?state, "worker state");
        }
    }

    fn is_active(&self) -> bool {
        self.active.contains(&self.device.udid)
    }
}

/// A device worker that has not been started yet.
pub struct DeviceWorker {
    ctx: Arc<WorkerContext>,
}

impl DeviceWorker {
    pub fn new(
        device: Device,
        harness: Arc<dyn Harness>,
        sink: Arc<dyn LogSink>,
        active: ActiveDevices,
        config: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            ctx: Arc::new(WorkerContext {
                watchdog: Watchdog::new(config.harness_timeout),
                device,
                harness,
                sink,
                active,
                config,
                stop: CancellationToken::new(),
                state,
                instances: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Spawn the worker onto the runtime.
    pub fn start(self) -> WorkerHandle {
        self.start_after(Vec::new())
    }

    /// Spawn the worker once every worker in `predecessors` has finished, so
    /// two instances for one device never overlap. The returned handle
    /// reports [`WorkerState::Starting`] until then and can be stopped.
    pub fn start_after(self, predecessors: Vec<WorkerHandle>) -> WorkerHandle {
        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(async move {
            if !predecessors.is_empty() {
                debug!(device_id = %self.ctx.device.udid, "waiting for previous worker to stop");
            }
            for previous in predecessors {
                previous.join().await;
            }
            self.run().await;
        });
        WorkerHandle {
            device: ctx.device.clone(),
            stop: ctx.stop.clone(),
            state: ctx.state.subscribe(),
            instances: Arc::clone(&ctx.instances),
            task,
        }
    }

    /// Poll loop. Returns once the device is no longer active (or the worker
    /// was told to stop) and the harness loop has wound down.
    async fn run(self) {
        let ctx = self.ctx;
        info!(
            device_id = %ctx.device.udid,
            device_name = %ctx.device.name,
            "starting device worker"
        );

        let harness_loop = tokio::spawn(harness_loop(Arc::clone(&ctx)));

        let mut poll = tokio::time::interval(ctx.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = ctx.stop.cancelled() => break,
            }
            if !ctx.is_active() {
                break;
            }
            ctx.watchdog.check(ctx.harness.as_ref()).await;
        }

        ctx.set_state(WorkerState::Stopping);
        ctx.stop.cancel();
        if let Err(e) = harness_loop.await {
            error!(device_id = %ctx.device.udid, error = %e, "harness loop panicked");
            // A panic can leave an instance behind.
            if let Some(handle) = ctx.watchdog.disarm() {
                let _ = ctx.harness.kill(&handle).await;
            }
        }

        ctx.set_state(WorkerState::Terminated);
        info!(
            device_id = %ctx.device.udid,
            device_name = %ctx.device.name,
            instances = ctx.instances.load(Ordering::SeqCst),
            "stopped device worker"
        );
    }
}

async fn harness_loop(ctx: Arc<WorkerContext>) {
    loop {
        if ctx.stop.is_cancelled() {
            break;
        }

        match ctx.harness.spawn(&ctx.device).await {
            Ok(handle) => run_instance(&ctx, handle).await,
            Err(e) => warn!(
                device_id = %ctx.device.udid,
                error = %format_args!("{e:#}"),
                "failed to start harness"
            ),
        }
        ctx.set_state(WorkerState::Exited);

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.restart_delay) => {}
            _ = ctx.stop.cancelled() => break,
        }
        if !ctx.is_active() {
            break;
        }
        ctx.set_state(WorkerState::Restarting);
    }
}

/// Drive one harness instance from spawn to exit.
async fn run_instance(ctx: &Arc<WorkerContext>, handle: HarnessHandle) {
    let instance = ctx.instances.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.watchdog.arm(handle.clone());
    ctx.set_state(WorkerState::Running);
    info!(
        device_id = %ctx.device.udid,
        device_name = %ctx.device.name,
        pid = handle.pid,
        instance,
        "harness started"
    );

    let transcript = match ctx.sink.open(&ctx.device, instance).await {
        Ok(transcript) => Some(transcript),
        Err(e) => {
            warn!(device_id = %ctx.device.udid, error = %format_args!("{e:#}"), "failed to open transcript");
            None
        }
    };
    let abandon = CancellationToken::new();
    let mut forwarder = tokio::spawn(forward_output(
        Arc::clone(ctx),
        ctx.harness.output(&handle),
        transcript,
        abandon.clone(),
    ));

    let wait = ctx.harness.wait(&handle);
    tokio::pin!(wait);
    let exit = tokio::select! {
        exit = &mut wait => exit,
        _ = ctx.stop.cancelled() => {
            info!(device_id = %ctx.device.udid, pid = handle.pid, "device deactivated, stopping harness");
            if let Err(e) = ctx.harness.kill(&handle).await {
                warn!(device_id = %ctx.device.udid, pid = handle.pid, error = %e, "failed to kill harness");
            }
            wait.await
        }
    };
    ctx.watchdog.disarm();

    match exit {
        Ok(code) => info!(
            device_id = %ctx.device.udid,
            pid = handle.pid,
            instance,
            exit_code = ?code,
            "harness exited"
        ),
        Err(e) => warn!(
            device_id = %ctx.device.udid,
            pid = handle.pid,
            error = %format_args!("{e:#}"),
            "lost track of harness"
        ),
    }

    // Grandchildren may keep the pipes open after the harness itself is gone.
    // The forwarder still flushes what it already read before returning.
    let forwarded = match tokio::time::timeout(ctx.config.output_drain, &mut forwarder).await {
        Ok(joined) => joined,
        Err(_) => {
            debug!(device_id = %ctx.device.udid, pid = handle.pid, "output still open after exit, abandoning it");
            abandon.cancel();
            forwarder.await
        }
    };
    if let Err(e) = forwarded {
        if e.is_panic() {
            error!(device_id = %ctx.device.udid, pid = handle.pid, "output forwarder panicked");
        }
    }
}

/// Feed every non-blank chunk to the watchdog and the transcript until the
/// stream ends or `abandon` fires, then flush the transcript.
async fn forward_output(
    ctx: Arc<WorkerContext>,
    mut output: OutputStreamBox,
    mut transcript: Option<Box<dyn Transcript>>,
    abandon: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            chunk = output.next() => chunk,
            _ = abandon.cancelled() => break,
        };
        let Some(chunk) = chunk else { break };
        if chunk.is_blank() {
            continue;
        }
        ctx.watchdog.record_output();

        let failed = match transcript.as_mut() {
            Some(t) => t.write(&chunk).await.err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!(device_id = %ctx.device.udid, error = %format_args!("{e:#}"), "transcript write failed, dropping transcript");
            transcript = None;
        }
    }

    if let Some(mut t) = transcript {
        if let Err(e) = t.flush().await {
            warn!(device_id = %ctx.device.udid, error = %format_args!("{e:#}"), "failed to flush transcript");
        }
    }
}

/// Owner handle of a running device worker.
///
/// Dropping the handle detaches the worker; it still stops on its own once
/// the device leaves the active set.
#[derive(Debug)]
pub struct WorkerHandle {
    device: Device,
    stop: CancellationToken,
    state: watch::Receiver<WorkerState>,
    instances: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn udid(&self) -> &DeviceId {
        &self.device.udid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Number of harness instances spawned so far.
    pub fn instances(&self) -> u64 {
        self.instances.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop without waiting for its next poll.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the worker reaches `state`. Returns immediately if it
    /// already has. Returns `false` if the worker went away first.
    pub async fn wait_for_state(&mut self, state: WorkerState) -> bool {
        self.state.wait_for(|s| *s == state).await.is_ok()
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(device_id = %self.device.udid, "device worker panicked");
            }
        }
    }
}
