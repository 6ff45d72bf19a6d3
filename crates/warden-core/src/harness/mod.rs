//! Harness adapter interface.
//!
//! A [`Harness`] launches the external test process for a device and exposes
//! its lifetime through a small handle-based API:
//!
//! ```text
//! DeviceWorker
//!     |
//!     |   spawn(device) ------> HarnessHandle { pid, udid, ... }
//!     |   output(handle) -----> Stream<OutputChunk>   (stdout + stderr)
//!     |   wait(handle) -------> exit code
//!     |   kill(handle)          (from the watchdog or on teardown)
//!     v
//! ```

pub mod trait_def;
pub mod types;
pub mod xcodebuild;

pub use trait_def::{Harness, OutputStreamBox};
pub use types::{HarnessHandle, OutputChunk, OutputStream};
pub use xcodebuild::XcodebuildHarness;
