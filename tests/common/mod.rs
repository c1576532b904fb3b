//! Scripted collaborators for driving the pipeline deterministically.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clipwatch::clip::{ClipEncoder, ClipParams, EncoderFactory};
use clipwatch::detect::{Detection, DetectorBackend, Region};
use clipwatch::frame::CaptureTime;
use clipwatch::{Frame, FrameSource, StopSignal};

/// Pixel tag: nothing in view.
pub const EMPTY: u8 = 0;
/// Pixel tag: the detector reports a person.
pub const PERSON: u8 = 1;
/// Pixel tag: the detector fails.
pub const BROKEN: u8 = 2;

/// A 2x2 frame whose pixels carry `tag`, captured `millis` after a fixed epoch.
pub fn frame(seq: u64, millis: u64, tag: u8) -> Frame {
    sized_frame(seq, millis, tag, 2, 2)
}

/// Like `frame`, with explicit dimensions.
pub fn sized_frame(seq: u64, millis: u64, tag: u8, width: u32, height: u32) -> Frame {
    let captured = CaptureTime::new(at(millis), Duration::from_millis(millis));
    Frame::new(seq, captured, width, height, vec![tag; (width * height * 3) as usize])
}

pub fn at(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(1_700_000_000_000 + millis)
}

/// Frames `1..=count`, 100 ms apart starting at `start_ms`, tagged by `tag_for(seq)`.
pub fn frames(count: u64, start_ms: u64, tag_for: impl Fn(u64) -> u8) -> Vec<Step> {
    (1..=count)
        .map(|seq| Step::Frame(frame(seq, start_ms + seq * 100, tag_for(seq))))
        .collect()
}

pub enum Step {
    Frame(Frame),
    ReadError,
    EndOfStream,
}

/// Plays back one script per connection. `None` makes that connect attempt fail.
///
/// When the scripts run out the source triggers `stop`.
pub struct ScriptedSource {
    sessions: VecDeque<Option<Vec<Step>>>,
    current: VecDeque<Step>,
    stop: StopSignal,
    pub connects: usize,
}

impl ScriptedSource {
    pub fn new(sessions: Vec<Option<Vec<Step>>>, stop: StopSignal) -> Self {
        Self {
            sessions: sessions.into(),
            current: VecDeque::new(),
            stop,
            connects: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn connect(&mut self) -> Result<()> {
        match self.sessions.pop_front() {
            Some(Some(steps)) => {
                self.connects += 1;
                self.current = steps.into();
                Ok(())
            }
            Some(None) => Err(anyhow!("scripted connect failure")),
            None => {
                self.stop.trigger();
                Err(anyhow!("script exhausted"))
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let step = self.current.pop_front();
        if self.current.is_empty() && self.sessions.is_empty() {
            // Last scripted step: stop after it is processed.
            self.stop.trigger();
        }
        match step {
            Some(Step::Frame(frame)) => Ok(Some(frame)),
            Some(Step::ReadError) => Err(anyhow!("scripted read failure")),
            Some(Step::EndOfStream) | None => Ok(None),
        }
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(10.0)
    }

    fn describe(&self) -> String {
        "scripted://camera".to_string()
    }
}

/// Detects according to the frame's pixel tag and records which frames it saw.
#[derive(Clone, Default)]
pub struct TagDetector {
    pub seen: Arc<Mutex<Vec<u64>>>,
}

impl DetectorBackend for TagDetector {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.seen.lock().unwrap().push(frame.seq());
        match frame.pixels().first().copied() {
            Some(PERSON) => Ok(vec![Detection::new("person", 0.9, Region::FULL_FRAME)]),
            Some(BROKEN) => Err(anyhow!("scripted detector failure")),
            _ => Ok(Vec::new()),
        }
    }
}

/// What one encoder instance received.
#[derive(Clone, Debug, Default)]
pub struct ClipRecord {
    pub staging_path: PathBuf,
    pub seqs: Vec<u64>,
}

/// Writes placeholder files and records frame sequence numbers per clip.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    pub clips: Arc<Mutex<Vec<ClipRecord>>>,
    pub fail_on: Arc<Mutex<HashSet<u64>>>,
    pub full_on: Arc<Mutex<HashSet<u64>>>,
}

impl RecordingFactory {
    pub fn failing_on(seqs: &[u64]) -> Self {
        let factory = Self::default();
        factory.fail_on.lock().unwrap().extend(seqs.iter().copied());
        factory
    }

    /// Writing any of `seqs` fails with "no space left on device".
    pub fn storage_full_on(seqs: &[u64]) -> Self {
        let factory = Self::default();
        factory.full_on.lock().unwrap().extend(seqs.iter().copied());
        factory
    }

    pub fn records(&self) -> Vec<ClipRecord> {
        self.clips.lock().unwrap().clone()
    }
}

struct RecordingEncoder {
    clips: Arc<Mutex<Vec<ClipRecord>>>,
    fail_on: Arc<Mutex<HashSet<u64>>>,
    full_on: Arc<Mutex<HashSet<u64>>>,
    index: usize,
}

impl EncoderFactory for RecordingFactory {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(&self, path: &Path, _params: &ClipParams) -> Result<Box<dyn ClipEncoder>> {
        std::fs::write(path, b"clip")?;
        let mut clips = self.clips.lock().unwrap();
        clips.push(ClipRecord {
            staging_path: path.to_path_buf(),
            ..ClipRecord::default()
        });
        Ok(Box::new(RecordingEncoder {
            clips: self.clips.clone(),
            fail_on: self.fail_on.clone(),
            full_on: self.full_on.clone(),
            index: clips.len() - 1,
        }))
    }
}

impl ClipEncoder for RecordingEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<usize> {
        if self.fail_on.lock().unwrap().contains(&frame.seq()) {
            return Err(anyhow!("scripted write failure on frame {}", frame.seq()));
        }
        if self.full_on.lock().unwrap().contains(&frame.seq()) {
            return Err(std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left").into());
        }
        self.clips.lock().unwrap()[self.index].seqs.push(frame.seq());
        Ok(frame.byte_len())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Published clip files in `dir`, sorted by name.
pub fn published(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| clipwatch::clip::is_published_clip(path))
        .collect();
    files.sort();
    files
}
