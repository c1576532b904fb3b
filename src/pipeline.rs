//! The per-stream driver loop.
//!
//! One thread, one stream. Each frame is handled in order:
//!
//! 1. stop flag check
//! 2. detector gateway, on sampled frames only
//! 3. recorder step
//! 4. pre-roll push (skipped for the frame that closed a clip)
//! 5. idle yield, only while not recording
//!
//! Connect failures, read failures and end of stream all reset the recorder and
//! the pre-roll, back off, and reconnect. The loop only returns on stop or when
//! the output storage is exhausted.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::DetectorGateway;
use crate::frame::{Frame, PrerollBuffer};
use crate::ingest::{FrameSource, ReconnectPolicy};
use crate::recorder::{Recorder, Transition};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const STOP_POLL: Duration = Duration::from_millis(100);

/// Cooperative stop flag shared with the signal handler.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on stop. Returns true if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub reconnect: ReconnectPolicy,
    /// Sleep after each frame while idle.
    pub idle_yield: Duration,
    /// Rate used to size the pre-roll buffer.
    pub nominal_fps: f64,
    pub lead_in: Duration,
    pub health_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            idle_yield: Duration::from_millis(10),
            nominal_fps: 30.0,
            lead_in: Duration::from_secs(5),
            health_interval: HEALTH_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub stream_interruptions: u64,
    pub clips_published: u64,
    pub health_reports: u64,
}

/// How a connected stream stopped delivering frames.
enum StreamEnd {
    Stopped,
    EndOfStream,
    ReadFailed(anyhow::Error),
}

pub struct Pipeline<S: FrameSource> {
    source: S,
    gateway: DetectorGateway,
    recorder: Recorder,
    preroll: PrerollBuffer,
    settings: PipelineSettings,
    stats: PipelineStats,
    last_health: Instant,
}

impl<S: FrameSource> Pipeline<S> {
    pub fn new(
        source: S,
        gateway: DetectorGateway,
        recorder: Recorder,
        settings: PipelineSettings,
    ) -> Self {
        let preroll = PrerollBuffer::for_lead_in(settings.nominal_fps, settings.lead_in);
        Self {
            source,
            gateway,
            recorder,
            preroll,
            settings,
            stats: PipelineStats::default(),
            last_health: Instant::now(),
        }
    }

    /// Run until `stop` is triggered or storage runs out.
    ///
    /// On stop, an open clip is closed and published before returning.
    pub fn run(&mut self, stop: &StopSignal) -> Result<()> {
        log::info!(
            "pipeline starting: source={} detector={} pre-roll={} frames",
            self.source.describe(),
            self.gateway.backend_name(),
            self.preroll.capacity()
        );
        let mut failures: u32 = 0;
        let result = loop {
            if stop.is_triggered() {
                break Ok(());
            }
            if let Err(e) = self.source.connect() {
                failures = failures.saturating_add(1);
                self.stats.connect_failures += 1;
                let delay = self.settings.reconnect.delay_for(failures);
                log::warn!(
                    "connect to {} failed (attempt {}), retrying in {:.1}s: {:#}",
                    self.source.describe(),
                    failures,
                    delay.as_secs_f64(),
                    e
                );
                self.maybe_log_health();
                stop.sleep(delay);
                continue;
            }
            self.stats.connects += 1;
            self.on_connected();

            let frames_before = self.stats.frames_processed;
            let end = match self.stream(stop) {
                Ok(end) => end,
                Err(e) => break Err(e),
            };
            match end {
                StreamEnd::Stopped => break Ok(()),
                StreamEnd::EndOfStream => {
                    log::warn!("stream {} ended", self.source.describe());
                }
                StreamEnd::ReadFailed(e) => {
                    log::warn!("read from {} failed: {:#}", self.source.describe(), e);
                }
            }
            self.stats.stream_interruptions += 1;
            self.source.disconnect();
            self.reset();

            failures = if self.stats.frames_processed > frames_before {
                1
            } else {
                failures.saturating_add(1)
            };
            let delay = self.settings.reconnect.delay_for(failures);
            log::info!(
                "reconnecting to {} in {:.1}s",
                self.source.describe(),
                delay.as_secs_f64()
            );
            self.maybe_log_health();
            stop.sleep(delay);
        };

        match self.recorder.shutdown() {
            Ok(Some(_)) => self.stats.clips_published += 1,
            Ok(None) => {}
            Err(e) => log::warn!("failed to close clip on shutdown: {:#}", e),
        }
        self.source.disconnect();
        self.log_health();
        log::info!("pipeline stopped");
        result
    }

    fn on_connected(&mut self) {
        log::info!(
            "connected to {} ({})",
            self.source.describe(),
            self.source
                .frame_rate()
                .map(|fps| format!("{:.1} fps", fps))
                .unwrap_or_else(|| "frame rate unknown".to_string())
        );
        self.reset();
    }

    fn stream(&mut self, stop: &StopSignal) -> Result<StreamEnd> {
        loop {
            if stop.is_triggered() {
                return Ok(StreamEnd::Stopped);
            }
            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(StreamEnd::EndOfStream),
                Err(e) => return Ok(StreamEnd::ReadFailed(e)),
            };
            self.process_frame(frame)?;
            self.maybe_log_health();
            if !self.recorder.is_recording() && !self.settings.idle_yield.is_zero() {
                std::thread::sleep(self.settings.idle_yield);
            }
        }
    }

    /// Run one frame through detection, recording and buffering.
    ///
    /// Errors only on storage exhaustion.
    pub fn process_frame(&mut self, frame: Frame) -> Result<Transition> {
        self.stats.frames_processed += 1;
        let interesting = if self.gateway.should_sample(frame.seq()) {
            let verdict = self.gateway.evaluate(&frame);
            if verdict.interesting && !self.recorder.is_recording() {
                log::info!(
                    "detection on frame {}: {}",
                    frame.seq(),
                    self.gateway.trigger_labels(&verdict).join(", ")
                );
            }
            verdict.interesting
        } else {
            false
        };

        let transition = self.recorder.step(
            &frame,
            interesting,
            &mut self.preroll,
            self.source.frame_rate(),
        )?;
        match &transition {
            Transition::Finished(_) => self.stats.clips_published += 1,
            _ => self.preroll.push(frame),
        }
        Ok(transition)
    }

    /// Back to idle with an empty pre-roll. Any running clip is discarded.
    pub fn reset(&mut self) {
        self.recorder.reset();
        self.preroll.clear();
    }

    /// Health line at most once per interval, connected or not.
    fn maybe_log_health(&mut self) {
        if self.last_health.elapsed() >= self.settings.health_interval {
            self.log_health();
        }
    }

    fn log_health(&mut self) {
        self.last_health = Instant::now();
        self.stats.health_reports += 1;
        let gateway = self.gateway.stats();
        log::info!(
            "health: frames={} sampled={} detector_failures={} clips={} reconnects={} recording={}",
            self.stats.frames_processed,
            gateway.frames_sampled,
            gateway.detector_failures,
            self.stats.clips_published,
            self.stats.stream_interruptions + self.stats.connect_failures,
            self.recorder.is_recording()
        );
        log::debug!(
            "pre-roll: {}/{} frames, {:.1}s, {} KB",
            self.preroll.len(),
            self.preroll.capacity(),
            self.preroll.span().as_secs_f64(),
            self.preroll.memory_bytes() / 1024
        );
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn gateway(&self) -> &DetectorGateway {
        &self.gateway
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn preroll(&self) -> &PrerollBuffer {
        &self.preroll
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
