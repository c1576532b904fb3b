use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{caption_at, ClipSink, Delivery};
use crate::clip::is_published_clip;
use crate::pipeline::StopSignal;

/// Result of one pass over the watch directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Polls a directory for published clips and hands them to a sink, oldest first.
pub struct DirectoryWatcher<S: ClipSink> {
    dir: PathBuf,
    sink: S,
}

impl<S: ClipSink> DirectoryWatcher<S> {
    /// Creates the directory if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>, sink: S) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create watch directory {}", dir.display()))?;
        Ok(Self { dir, sink })
    }

    /// Published clips currently in the directory, oldest first.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        let mut clips: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Removed between listing and stat.
                Err(_) => continue,
            };
            if !metadata.is_file() || !is_published_clip(&path) {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            clips.push((modified, path));
        }
        clips.sort();
        Ok(clips.into_iter().map(|(_, path)| path).collect())
    }

    /// Deliver everything pending once.
    pub fn poll_once(&mut self) -> Result<PollOutcome> {
        let mut outcome = PollOutcome::default();
        for path in self.pending()? {
            let caption = caption_at(Local::now());
            match self.sink.deliver(&path, &caption) {
                Ok(Delivery::Sent) => {
                    log::info!("delivered {} via {}", path.display(), self.sink.name());
                    remove_delivered(&path);
                    outcome.delivered += 1;
                }
                Ok(Delivery::Skipped) => outcome.skipped += 1,
                Err(e) => {
                    log::warn!("delivery of {} failed, will retry: {:#}", path.display(), e);
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Poll until `stop` is triggered.
    pub fn run(&mut self, stop: &StopSignal, interval: Duration) -> Result<()> {
        log::info!(
            "watching {} for clips (sink: {})",
            self.dir.display(),
            self.sink.name()
        );
        while !stop.is_triggered() {
            if let Err(e) = self.poll_once() {
                log::warn!("poll of {} failed: {:#}", self.dir.display(), e);
            }
            stop.sleep(interval);
        }
        log::info!("watcher stopped");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

fn remove_delivered(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("delivered clip {} could not be removed: {}", path.display(), e),
    }
}
