//! Types shared between the worker loop and harness adapters.

use std::fmt;

use serde::Serialize;

use crate::DeviceId;

/// Which pipe an output chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// A chunk of text produced by a harness instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }

    /// Whitespace-only chunks carry no liveness signal and are not logged.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Handle to one spawned harness instance.
///
/// `pid` is the key the adapter uses for its own bookkeeping; adapters that do
/// not run real processes may hand out synthetic ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessHandle {
    pub pid: u32,
    pub udid: DeviceId,
    pub harness_name: String,
}
