//! Frame ingestion sources.
//!
//! This module provides the upstream side of the pipeline:
//! - `FrameSource`: the contract every stream adapter implements
//! - `RtspSource`: IP camera streams (synthetic `stub://`, GStreamer, or FFmpeg)
//! - `ReconnectPolicy`: how long the driver waits between connection attempts
//!
//! Sources are assumed to fail. A failed `connect`, a failed `next_frame`, and an
//! end of stream all lead to the same recovery in the driver: reset, back off,
//! reconnect. None of them is fatal.

pub mod rtsp;
#[cfg(feature = "rtsp-ffmpeg")]
pub(crate) mod rtsp_ffmpeg;

use anyhow::Result;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::frame::Frame;

pub use rtsp::{RtspConfig, RtspSource, RtspStats};

/// Default wait between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// An unreliable upstream frame stream.
pub trait FrameSource {
    /// Open (or re-open) the stream. Any previous connection is torn down first.
    fn connect(&mut self) -> Result<()>;

    /// Next decoded frame. `Ok(None)` signals end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frame rate reported by the stream, when it reports one.
    fn frame_rate(&self) -> Option<f64>;

    /// Human-readable locator for logs. Must not contain credentials.
    fn describe(&self) -> String;

    /// Release the connection. Called before a reconnect and on shutdown.
    fn disconnect(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn frame_rate(&self) -> Option<f64> {
        (**self).frame_rate()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

/// Backoff between connection attempts.
///
/// With `max_delay <= delay` this is a fixed delay. Otherwise the delay doubles per
/// consecutive failed attempt up to `max_delay`. A uniformly random `0..=jitter`
/// is added on top.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before attempt number `attempt` (1-based count of consecutive failures).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = if self.max_delay <= self.delay {
            self.delay
        } else {
            let exponent = attempt.saturating_sub(1).min(16);
            self.delay
                .saturating_mul(1u32 << exponent)
                .min(self.max_delay)
        };
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

/// Replace `user:password@` in a stream URL so it can be logged.
pub fn redact_locator(locator: &str) -> String {
    static CREDENTIALS_RE: OnceLock<Regex> = OnceLock::new();
    let re = CREDENTIALS_RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*://)[^/@]+@").expect("credentials pattern")
    });
    re.replace(locator, "${1}***@").into_owned()
}
