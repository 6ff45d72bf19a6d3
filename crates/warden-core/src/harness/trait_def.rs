//! The `Harness` trait: the adapter interface for the per-device test process.
//!
//! The trait is object-safe so the supervisor can share one
//! `Arc<dyn Harness>` between every worker.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use super::types::{HarnessHandle, OutputChunk};
use crate::Device;

/// Boxed output stream returned by [`Harness::output`].
pub type OutputStreamBox = Pin<Box<dyn Stream<Item = OutputChunk> + Send>>;

/// Adapter interface for launching and controlling harness instances.
///
/// `wait` and `kill` must be callable concurrently for the same handle: the
/// worker parks in `wait` while the watchdog or a teardown calls `kill`, which
/// must make the pending `wait` return.
#[async_trait]
pub trait Harness: Send + Sync {
    /// Human-readable name for this harness (e.g. "xcodebuild").
    fn name(&self) -> &str;

    /// Launch a new instance with the device's configuration.
    async fn spawn(&self, device: &Device) -> Result<HarnessHandle>;

    /// Output of the instance, both pipes interleaved.
    ///
    /// Order is preserved within each pipe. The stream ends once both pipes
    /// are closed. Calling it a second time for the same handle yields an
    /// empty stream.
    fn output(&self, handle: &HarnessHandle) -> OutputStreamBox;

    /// Wait for the instance to exit and return its exit code (`None` when
    /// killed by a signal). The code carries no meaning to the supervisor.
    async fn wait(&self, handle: &HarnessHandle) -> Result<Option<i32>>;

    /// Terminate the instance. Killing an instance that already exited is
    /// not an error.
    async fn kill(&self, handle: &HarnessHandle) -> Result<()>;

    /// Whether the instance is still alive.
    async fn is_running(&self, handle: &HarnessHandle) -> bool;
}

// Compile-time assertion: Harness must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Harness) {}
};
