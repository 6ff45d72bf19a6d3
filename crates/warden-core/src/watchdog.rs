//! Output-inactivity watchdog for harness instances.
//!
//! One watchdog belongs to one device worker and tracks the instance that
//! worker is currently running. The worker calls [`Watchdog::check`] on its
//! poll tick; an instance that has been silent for at least the timeout is
//! killed, which ends that instance only. The worker's own restart logic
//! replaces it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::harness::{Harness, HarnessHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Liveness tracker for the current harness instance of one device.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    tracked: Mutex<Tracked>,
}

/// The silence clock and the instance it belongs to change together.
#[derive(Debug)]
struct Tracked {
    last_output: Instant,
    current: Option<HarnessHandle>,
}

impl Tracked {
    fn silence(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_output)
    }
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tracked: Mutex::new(Tracked {
                last_output: Instant::now(),
                current: None,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start tracking a freshly spawned instance; the silence clock restarts.
    pub fn arm(&self, handle: HarnessHandle) {
        let mut tracked = lock(&self.tracked);
        tracked.last_output = Instant::now();
        tracked.current = Some(handle);
    }

    /// Stop tracking the current instance, returning it if one was armed.
    pub fn disarm(&self) -> Option<HarnessHandle> {
        lock(&self.tracked).current.take()
    }

    /// The instance currently being tracked.
    pub fn current(&self) -> Option<HarnessHandle> {
        lock(&self.tracked).current.clone()
    }

    /// Record a non-empty output chunk. The timestamp never moves backwards.
    pub fn record_output(&self) {
        let now = Instant::now();
        let mut tracked = lock(&self.tracked);
        if now > tracked.last_output {
            tracked.last_output = now;
        }
    }

    /// Time since the last output (or since the instance was armed).
    pub fn silence(&self) -> Duration {
        lock(&self.tracked).silence()
    }

    pub fn is_stalled(&self) -> bool {
        self.silence() >= self.timeout
    }

    /// Kill the current instance if it has been silent for the timeout.
    ///
    /// The stalled instance is disarmed in the same critical section that
    /// measured its silence, so an instance armed concurrently is never the
    /// one killed. Returns `true` when a kill was issued.
    pub async fn check(&self, harness: &dyn Harness) -> bool {
        let (handle, silence) = {
            let mut tracked = lock(&self.tracked);
            let silence = tracked.silence();
            if silence < self.timeout {
                return false;
            }
            let Some(handle) = tracked.current.take() else {
                return false;
            };
            (handle, silence)
        };

        info!(
            device_id = %handle.udid,
            pid = handle.pid,
            silent_secs = silence.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "no harness output within timeout, stopping instance"
        );
        if let Err(e) = harness.kill(&handle).await {
            warn!(device_id = %handle.udid, pid = handle.pid, error = %e, "failed to kill stalled harness");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::Device;
    use crate::harness::OutputStreamBox;

    #[derive(Default)]
    struct CountingHarness {
        kills: AtomicUsize,
    }

    #[async_trait]
    impl Harness for CountingHarness {
        fn name(&self) -> &str {
            "counting"
        }

        async fn spawn(&self, device: &Device) -> Result<HarnessHandle> {
            Ok(handle_for(device))
        }

        fn output(&self, _handle: &HarnessHandle) -> OutputStreamBox {
            Box::pin(futures::stream::empty())
        }

        async fn wait(&self, _handle: &HarnessHandle) -> Result<Option<i32>> {
            Ok(None)
        }

        async fn kill(&self, _handle: &HarnessHandle) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self, _handle: &HarnessHandle) -> bool {
            true
        }
    }

    fn handle_for(device: &Device) -> HarnessHandle {
        HarnessHandle {
            pid: 7,
            udid: device.udid.clone(),
            harness_name: "counting".to_string(),
        }
    }

    fn handle() -> HarnessHandle {
        handle_for(&Device::new("udid-1".parse().unwrap(), "phone"))
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instance_is_killed_once_timeout_elapses() {
        let harness = CountingHarness::default();
        let watchdog = Watchdog::new(Duration::from_secs(10));
        watchdog.arm(handle());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!watchdog.check(&harness).await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(watchdog.is_stalled());
        assert!(watchdog.check(&harness).await);
        assert_eq!(harness.kills.load(Ordering::SeqCst), 1);

        // Disarmed after the kill: no second kill for the same instance.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!watchdog.check(&harness).await);
        assert_eq!(harness.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn output_resets_silence() {
        let harness = CountingHarness::default();
        let watchdog = Watchdog::new(Duration::from_secs(10));
        watchdog.arm(handle());

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            watchdog.record_output();
            assert!(!watchdog.check(&harness).await);
        }
        assert_eq!(harness.kills.load(Ordering::SeqCst), 0);
        assert_eq!(watchdog.silence(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn arm_restarts_the_clock() {
        let watchdog = Watchdog::new(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(watchdog.is_stalled());

        watchdog.arm(handle());
        assert!(!watchdog.is_stalled());
        assert_eq!(watchdog.current(), Some(handle()));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_but_unarmed_does_nothing() {
        let harness = CountingHarness::default();
        let watchdog = Watchdog::new(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!watchdog.check(&harness).await);
        assert_eq!(harness.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_returns_current_instance() {
        let watchdog = Watchdog::new(Duration::from_secs(60));
        assert!(watchdog.disarm().is_none());
        watchdog.arm(handle());
        assert_eq!(watchdog.disarm(), Some(handle()));
        assert!(watchdog.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rearmed_instance_is_not_killed_for_previous_silence() {
        let harness = CountingHarness::default();
        let watchdog = Watchdog::new(Duration::from_secs(10));
        watchdog.arm(handle());

        // The stalled instance exits and its successor is armed before the
        // next check runs.
        tokio::time::sleep(Duration::from_secs(15)).await;
        watchdog.disarm();
        let successor = HarnessHandle {
            pid: 8,
            ..handle()
        };
        watchdog.arm(successor.clone());

        assert!(!watchdog.check(&harness).await);
        assert_eq!(harness.kills.load(Ordering::SeqCst), 0);
        assert_eq!(watchdog.current(), Some(successor));
    }
}
