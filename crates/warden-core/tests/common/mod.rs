//! Scripted in-process harness shared by the supervisor and worker tests.
//!
//! Instances are tokio tasks instead of processes, so tests run under
//! paused time and see exact timings.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use warden_core::harness::{Harness, HarnessHandle, OutputChunk, OutputStreamBox};
use warden_core::{Device, DeviceId};

/// What a spawned instance does.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Print a line every `every` until killed.
    Chatty { every: Duration },
    /// Print nothing and never exit on its own.
    Silent,
    /// Print one line, then exit with status 0 after the given time.
    ExitAfter(Duration),
    /// Refuse to spawn.
    FailSpawn,
}

struct Instance {
    kill: CancellationToken,
    exited: CancellationToken,
    killed: Arc<AtomicBool>,
    output: Option<mpsc::Receiver<OutputChunk>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub spawn_attempts: u64,
    pub spawns: u64,
    pub kills: u64,
}

pub struct ScriptedHarness {
    default: Behavior,
    behaviors: Mutex<HashMap<DeviceId, Behavior>>,
    counts: Mutex<HashMap<DeviceId, Counts>>,
    instances: Mutex<HashMap<u32, Instance>>,
    next_pid: AtomicU32,
    kill_delay: Mutex<Duration>,
}

impl ScriptedHarness {
    pub fn new(default: Behavior) -> Arc<Self> {
        Arc::new(Self {
            default,
            behaviors: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
            kill_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_behavior(&self, udid: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(udid.parse().unwrap(), behavior);
    }

    /// Make `kill` take this long before the instance goes down.
    pub fn set_kill_delay(&self, delay: Duration) {
        *self.kill_delay.lock().unwrap() = delay;
    }

    pub fn counts(&self, udid: &str) -> Counts {
        let udid: DeviceId = udid.parse().unwrap();
        self.counts
            .lock()
            .unwrap()
            .get(&udid)
            .copied()
            .unwrap_or_default()
    }

    pub fn spawns(&self, udid: &str) -> u64 {
        self.counts(udid).spawns
    }

    pub fn kills(&self, udid: &str) -> u64 {
        self.counts(udid).kills
    }

    /// Instances that have not exited yet.
    pub fn running(&self) -> usize {
        self.instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| !i.exited.is_cancelled())
            .count()
    }

    fn bump(&self, udid: &DeviceId, f: impl FnOnce(&mut Counts)) {
        let mut counts = self.counts.lock().unwrap();
        f(counts.entry(udid.clone()).or_default());
    }
}

#[async_trait]
impl Harness for ScriptedHarness {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn spawn(&self, device: &Device) -> Result<HarnessHandle> {
        self.bump(&device.udid, |c| c.spawn_attempts += 1);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&device.udid)
            .copied()
            .unwrap_or(self.default);
        if let Behavior::FailSpawn = behavior {
            bail!("device {} is not connected", device.udid);
        }
        self.bump(&device.udid, |c| c.spawns += 1);

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let kill = CancellationToken::new();
        let exited = CancellationToken::new();
        let killed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(64);

        {
            let kill = kill.clone();
            let exited = exited.clone();
            let killed = Arc::clone(&killed);
            tokio::spawn(async move {
                match behavior {
                    Behavior::Chatty { every } => loop {
                        tokio::select! {
                            _ = tokio::time::sleep(every) => {
                                let _ = tx.send(OutputChunk::stdout("Test Case started")).await;
                            }
                            _ = kill.cancelled() => break,
                        }
                    },
                    Behavior::Silent => kill.cancelled().await,
                    Behavior::ExitAfter(after) => {
                        let _ = tx.send(OutputChunk::stdout("Test Suite started")).await;
                        tokio::select! {
                            _ = tokio::time::sleep(after) => {}
                            _ = kill.cancelled() => {}
                        }
                    }
                    Behavior::FailSpawn => {}
                }
                if kill.is_cancelled() {
                    killed.store(true, Ordering::SeqCst);
                }
                drop(tx);
                exited.cancel();
            });
        }

        self.instances.lock().unwrap().insert(
            pid,
            Instance {
                kill,
                exited,
                killed,
                output: Some(rx),
            },
        );
        Ok(HarnessHandle {
            pid,
            udid: device.udid.clone(),
            harness_name: "scripted".to_string(),
        })
    }

    fn output(&self, handle: &HarnessHandle) -> OutputStreamBox {
        let rx = self
            .instances
            .lock()
            .unwrap()
            .get_mut(&handle.pid)
            .and_then(|i| i.output.take());
        match rx {
            Some(rx) => Box::pin(ReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }

    async fn wait(&self, handle: &HarnessHandle) -> Result<Option<i32>> {
        let (exited, killed) = {
            let instances = self.instances.lock().unwrap();
            let Some(instance) = instances.get(&handle.pid) else {
                bail!("unknown pid {}", handle.pid);
            };
            (instance.exited.clone(), Arc::clone(&instance.killed))
        };
        exited.cancelled().await;
        if killed.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(0))
        }
    }

    async fn kill(&self, handle: &HarnessHandle) -> Result<()> {
        let kill = self
            .instances
            .lock()
            .unwrap()
            .get(&handle.pid)
            .map(|i| i.kill.clone());
        if let Some(kill) = kill {
            let delay = *self.kill_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.bump(&handle.udid, |c| c.kills += 1);
            kill.cancel();
        }
        Ok(())
    }

    async fn is_running(&self, handle: &HarnessHandle) -> bool {
        self.instances
            .lock()
            .unwrap()
            .get(&handle.pid)
            .is_some_and(|i| !i.exited.is_cancelled())
    }
}

pub fn device(udid: &str) -> Device {
    Device::new(udid.parse().unwrap(), format!("phone-{udid}"))
}

pub async fn sleep_secs(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}
