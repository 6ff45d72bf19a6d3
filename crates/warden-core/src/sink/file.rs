//! Transcript files on disk.
//!
//! Each instance gets two files in the log directory:
//!
//! - `<unix-ts>-<udid>-<instance>.full.log`: every line
//! - `<unix-ts>-<udid>-<instance>.filtered.log`: lines accepted by the
//!   [`LineFilter`]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{LogSink, Transcript};
use crate::Device;
use crate::harness::OutputChunk;

/// Decides which lines go to the filtered transcript.
///
/// A line passes when it contains any of the markers. With no markers every
/// line passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineFilter {
    markers: Vec<String>,
}

impl LineFilter {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    pub fn accepts(&self, line: &str) -> bool {
        self.markers.is_empty() || self.markers.iter().any(|m| line.contains(m.as_str()))
    }
}

/// Writes full and filtered transcripts into a directory.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    dir: PathBuf,
    filter: LineFilter,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>, filter: LineFilter) -> Self {
        Self {
            dir: dir.into(),
            filter,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path)
        .await
        .with_context(|| format!("failed to create transcript {}", path.display()))?;
    Ok(BufWriter::new(file))
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn open(&self, device: &Device, instance: u64) -> Result<Box<dyn Transcript>> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create log directory {}", self.dir.display()))?;

        let stem = format!("{}-{}-{instance}", Utc::now().timestamp(), device.udid);
        let full_path = self.dir.join(format!("{stem}.full.log"));
        let filtered_path = self.dir.join(format!("{stem}.filtered.log"));

        Ok(Box::new(FileTranscript {
            full: create(&full_path).await?,
            filtered: create(&filtered_path).await?,
            filter: self.filter.clone(),
            full_path,
        }))
    }
}

struct FileTranscript {
    full: BufWriter<File>,
    filtered: BufWriter<File>,
    filter: LineFilter,
    full_path: PathBuf,
}

#[async_trait]
impl Transcript for FileTranscript {
    async fn write(&mut self, chunk: &OutputChunk) -> Result<()> {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for line in chunk.text.lines().filter(|l| !l.trim().is_empty()) {
            let record = format!("{ts} [{}] {line}\n", chunk.stream);
            self.full
                .write_all(record.as_bytes())
                .await
                .with_context(|| format!("failed to write {}", self.full_path.display()))?;
            if self.filter.accepts(line) {
                self.filtered.write_all(record.as_bytes()).await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.full.flush().await?;
        self.filtered.flush().await?;
        Ok(())
    }
}
