//! Log sinks that record harness output.
//!
//! The worker opens one [`Transcript`] per harness instance and forwards
//! every non-blank chunk to it. What ends up in the filtered transcript is
//! the sink's business.

pub mod file;

use anyhow::Result;
use async_trait::async_trait;

use crate::Device;
use crate::harness::OutputChunk;

pub use file::{FileLogSink, LineFilter};

/// Factory for per-instance transcripts.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Open the transcripts for one harness instance. `instance` counts
    /// spawns for the device, starting at 1.
    async fn open(&self, device: &Device, instance: u64) -> Result<Box<dyn Transcript>>;
}

/// Output record of a single harness instance.
#[async_trait]
pub trait Transcript: Send {
    async fn write(&mut self, chunk: &OutputChunk) -> Result<()>;

    /// Flush buffered output. Called once after the instance exits.
    async fn flush(&mut self) -> Result<()>;
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

struct NullTranscript;

#[async_trait]
impl Transcript for NullTranscript {
    async fn write(&mut self, _chunk: &OutputChunk) -> Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LogSink for NullSink {
    async fn open(&self, _device: &Device, _instance: u64) -> Result<Box<dyn Transcript>> {
        Ok(Box::new(NullTranscript))
    }
}
