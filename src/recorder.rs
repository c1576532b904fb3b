//! Detection-triggered recording state machine.
//!
//! ```text
//!            interesting                 elapsed >= target
//!   Idle ─────────────────▶ Recording ─────────────────────▶ Idle (clip published)
//!                              │
//!                              └── write failure ──────────▶ Idle (clip discarded)
//! ```
//!
//! - Starting a clip drains the pre-roll buffer into it, oldest first, then appends
//!   the trigger frame.
//! - While recording every frame is appended, sampled or not.
//! - Triggers while recording are ignored: no extension, no second clip.
//! - A write failure costs only the current clip. Running out of disk is the one
//!   failure that is returned to the caller.

use anyhow::{Context, Result};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::clip::{unique_clip_path, ClipParams, ClipWriter, EncoderFactory, FALLBACK_FRAME_RATE};
use crate::frame::{CaptureTime, Frame, PrerollBuffer};

pub const DEFAULT_CLIP_DURATION: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct RecorderSettings {
    /// Directory clips are published into.
    pub output_dir: PathBuf,
    /// Live recording time after the trigger frame.
    pub clip_duration: Duration,
    /// Clip frame rate when the source reports none.
    pub fallback_fps: f64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("videos"),
            clip_duration: DEFAULT_CLIP_DURATION,
            fallback_fps: FALLBACK_FRAME_RATE,
        }
    }
}

/// The clip currently being recorded.
pub struct ClipSession {
    writer: ClipWriter,
    started: CaptureTime,
    target: Duration,
    preroll_frames: usize,
    first_seq: u64,
    last_seq: u64,
}

impl ClipSession {
    pub fn path(&self) -> &std::path::Path {
        self.writer.final_path()
    }

    /// Wall-clock capture time of the trigger frame.
    pub fn started_at(&self) -> SystemTime {
        self.started.wall()
    }

    /// Monotonic capture offset at which the session closes.
    pub fn deadline(&self) -> Duration {
        self.started.monotonic() + self.target
    }

    pub fn frames(&self) -> u64 {
        self.writer.frames()
    }

    pub fn preroll_frames(&self) -> usize {
        self.preroll_frames
    }
}

pub enum RecorderState {
    Idle,
    Recording(ClipSession),
}

/// A published clip.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedClip {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    pub preroll_frames: usize,
    pub first_seq: u64,
    pub last_seq: u64,
    pub started_at: SystemTime,
    /// Capture time between the trigger frame and the closing frame.
    pub elapsed: Duration,
}

/// What a single `step` did.
#[derive(Debug, PartialEq)]
pub enum Transition {
    /// Stayed idle, or appended to the running clip.
    Unchanged,
    Started { path: PathBuf, preroll_frames: usize },
    Finished(FinishedClip),
    /// The clip was discarded after a write failure.
    Abandoned { path: Option<PathBuf> },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub clips_started: u64,
    pub clips_finished: u64,
    pub clips_abandoned: u64,
    pub ignored_triggers: u64,
}

pub struct Recorder {
    state: RecorderState,
    factory: Box<dyn EncoderFactory>,
    settings: RecorderSettings,
    stats: RecorderStats,
}

impl Recorder {
    /// Creates the output directory if needed.
    pub fn new(factory: Box<dyn EncoderFactory>, settings: RecorderSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                settings.output_dir.display()
            )
        })?;
        Ok(Self {
            state: RecorderState::Idle,
            factory,
            settings,
            stats: RecorderStats::default(),
        })
    }

    /// Feed one live frame.
    ///
    /// `preroll` is drained when a clip starts and cleared when one is published.
    /// The caller owns pushing frames into it.
    pub fn step(
        &mut self,
        frame: &Frame,
        interesting: bool,
        preroll: &mut PrerollBuffer,
        source_fps: Option<f64>,
    ) -> Result<Transition> {
        let session = match &mut self.state {
            RecorderState::Idle if interesting => return self.start(frame, preroll, source_fps),
            RecorderState::Idle => return Ok(Transition::Unchanged),
            RecorderState::Recording(session) => session,
        };

        if interesting {
            self.stats.ignored_triggers += 1;
            log::debug!(
                "detection on frame {} ignored: already recording {}",
                frame.seq(),
                session.path().display()
            );
        }

        if let Err(e) = session.writer.append(frame) {
            return self.abandon(e);
        }
        session.last_seq = frame.seq();

        if frame.elapsed_since(session.started) < session.target {
            return Ok(Transition::Unchanged);
        }
        let finished = self.finish(frame)?;
        preroll.clear();
        Ok(finished)
    }

    fn start(
        &mut self,
        frame: &Frame,
        preroll: &mut PrerollBuffer,
        source_fps: Option<f64>,
    ) -> Result<Transition> {
        let first = preroll.iter().next().unwrap_or(frame);
        let params = ClipParams::for_frame(first, source_fps, self.settings.fallback_fps);

        let opened = unique_clip_path(
            &self.settings.output_dir,
            frame.captured_at(),
            self.factory.extension(),
        )
        .and_then(|path| ClipWriter::open(self.factory.as_ref(), path, params));
        // The pre-roll stays buffered for the next trigger if the clip cannot be opened.
        let mut writer = match opened {
            Ok(writer) => writer,
            Err(e) => return self.fail(None, e),
        };
        let lead_in = preroll.drain_oldest_first();

        for buffered in lead_in.iter().chain(std::iter::once(frame)) {
            if let Err(e) = writer.append(buffered) {
                let path = writer.final_path().to_path_buf();
                writer.abandon();
                return self.fail(Some(path), e);
            }
        }

        let path = writer.final_path().to_path_buf();
        self.stats.clips_started += 1;
        log::info!(
            "recording {} ({} pre-roll frames, trigger frame {}, {:.1} fps, {}x{})",
            path.display(),
            lead_in.len(),
            frame.seq(),
            params.frame_rate,
            params.width,
            params.height
        );
        self.state = RecorderState::Recording(ClipSession {
            writer,
            started: frame.capture_time(),
            target: self.settings.clip_duration,
            preroll_frames: lead_in.len(),
            first_seq: lead_in.first().map(Frame::seq).unwrap_or(frame.seq()),
            last_seq: frame.seq(),
        });
        Ok(Transition::Started {
            path,
            preroll_frames: lead_in.len(),
        })
    }

    fn finish(&mut self, frame: &Frame) -> Result<Transition> {
        let RecorderState::Recording(session) =
            std::mem::replace(&mut self.state, RecorderState::Idle)
        else {
            return Ok(Transition::Unchanged);
        };
        let (frames, bytes) = (session.writer.frames(), session.writer.bytes());
        let path = session.writer.final_path().to_path_buf();
        match session.writer.close() {
            Ok(path) => {
                self.stats.clips_finished += 1;
                let clip = FinishedClip {
                    path,
                    frames,
                    bytes,
                    preroll_frames: session.preroll_frames,
                    first_seq: session.first_seq,
                    last_seq: session.last_seq,
                    started_at: session.started.wall(),
                    elapsed: frame.elapsed_since(session.started),
                };
                log::info!(
                    "clip complete: {} ({} frames, {} KB, {:.1}s live)",
                    clip.path.display(),
                    clip.frames,
                    clip.bytes / 1024,
                    clip.elapsed.as_secs_f64()
                );
                Ok(Transition::Finished(clip))
            }
            Err(e) => self.fail(Some(path), e),
        }
    }

    /// Discard the running clip after `error`.
    fn abandon(&mut self, error: anyhow::Error) -> Result<Transition> {
        match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Recording(session) => {
                let path = session.writer.final_path().to_path_buf();
                session.writer.abandon();
                self.fail(Some(path), error)
            }
            RecorderState::Idle => self.fail(None, error),
        }
    }

    fn fail(&mut self, path: Option<PathBuf>, error: anyhow::Error) -> Result<Transition> {
        self.stats.clips_abandoned += 1;
        if is_storage_exhausted(&error) {
            log::error!("output storage exhausted, clip discarded: {:#}", error);
            return Err(error.context("output storage exhausted"));
        }
        log::warn!(
            "clip {} abandoned: {:#}",
            path.as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unopened>".to_string()),
            error
        );
        Ok(Transition::Abandoned { path })
    }

    /// Drop any running clip without publishing it. Used when the stream breaks.
    pub fn reset(&mut self) -> Option<PathBuf> {
        match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Recording(session) => {
                let path = session.writer.final_path().to_path_buf();
                session.writer.abandon();
                self.stats.clips_abandoned += 1;
                log::warn!("clip {} abandoned: stream interrupted", path.display());
                Some(path)
            }
            RecorderState::Idle => None,
        }
    }

    /// Publish any running clip as-is. Used on shutdown.
    pub fn shutdown(&mut self) -> Result<Option<PathBuf>> {
        match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Recording(session) => {
                let path = session.writer.close()?;
                self.stats.clips_finished += 1;
                log::info!("clip closed early on shutdown: {}", path.display());
                Ok(Some(path))
            }
            RecorderState::Idle => Ok(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording(_))
    }

    pub fn session(&self) -> Option<&ClipSession> {
        match &self.state {
            RecorderState::Recording(session) => Some(session),
            RecorderState::Idle => None,
        }
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }
}

/// True when any error in the chain is an I/O "no space left" error.
pub fn is_storage_exhausted(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::StorageFull)
    })
}
