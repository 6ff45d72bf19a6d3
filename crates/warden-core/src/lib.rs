//! Device supervision engine.
//!
//! A [`Supervisor`](supervisor::Supervisor) keeps one auto-restarting
//! [`DeviceWorker`](worker::DeviceWorker) per active device. Each worker runs
//! the external test harness, streams its output to a [`LogSink`](sink::LogSink),
//! and lets a [`Watchdog`](watchdog::Watchdog) kill instances that stop
//! producing output.
//!
//! ```text
//! add_device / remove_device
//!         |
//!         v
//!   DeviceRegistry --drain every tick--> manager loop
//!                                            |
//!                          start / stop      v
//!                                      DeviceWorker (one per device)
//!                                            |
//!                       spawn -> stream output -> wait -> grace -> respawn
//!                                            |
//!                                        Watchdog
//! ```

pub mod directory;
pub mod harness;
pub mod project;
pub mod registry;
pub mod sink;
pub mod supervisor;
pub mod watchdog;
pub mod worker;

pub use warden_db::models::{Device, DeviceId};
