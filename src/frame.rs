//! Frame model and pre-roll buffering.
//!
//! - `Frame`: immutable RGB24 sample with a sequence number and capture time.
//!   Pixels are reference counted, so the pre-roll buffer, the detector and the clip
//!   writer all read the same allocation.
//! - `CaptureTime`: wall-clock time for naming, monotonic time for measuring.
//! - `PrerollBuffer`: bounded FIFO of the most recent frames, drained into a clip
//!   when recording starts.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

/// Upper bound on pre-roll capacity regardless of configuration.
/// At 30 fps this is a little over 30 seconds of lead-in.
pub const MAX_PREROLL_FRAMES: usize = 1000;

// ----------------------------------------------------------------------------
// CaptureTime
// ----------------------------------------------------------------------------

/// When a frame was captured.
///
/// `wall` may jump (NTP, manual changes) and is only used for clip names.
/// `monotonic` is an offset on a clock that never goes backwards and is what
/// durations are measured on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureTime {
    wall: SystemTime,
    monotonic: Duration,
}

impl CaptureTime {
    pub fn new(wall: SystemTime, monotonic: Duration) -> Self {
        Self { wall, monotonic }
    }

    pub fn now() -> Self {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        let origin = *ORIGIN.get_or_init(Instant::now);
        Self {
            wall: SystemTime::now(),
            monotonic: origin.elapsed(),
        }
    }

    pub fn wall(&self) -> SystemTime {
        self.wall
    }

    /// Offset from an arbitrary process-wide origin.
    pub fn monotonic(&self) -> Duration {
        self.monotonic
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded video frame (packed RGB24, row-major, no padding).
///
/// Cloning a `Frame` is cheap: it bumps the pixel reference count.
#[derive(Clone, Debug)]
pub struct Frame {
    seq: u64,
    captured: CaptureTime,
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        seq: u64,
        captured: CaptureTime,
        width: u32,
        height: u32,
        pixels: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            seq,
            captured,
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Sequence number, monotonically increasing per stream session.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock capture time.
    pub fn captured_at(&self) -> SystemTime {
        self.captured.wall
    }

    pub fn capture_time(&self) -> CaptureTime {
        self.captured
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Monotonic time from `earlier` to this frame's capture. Wall-clock steps do not affect it.
    pub fn elapsed_since(&self, earlier: CaptureTime) -> Duration {
        self.captured.monotonic.saturating_sub(earlier.monotonic)
    }
}

// ----------------------------------------------------------------------------
// PrerollBuffer
// ----------------------------------------------------------------------------

/// Bounded ring buffer of recent frames.
///
/// Capacity is derived from a nominal capture rate and a lead-in duration, so the
/// lead-in covered by a full buffer is only as accurate as the nominal rate.
/// Pushing into a full buffer evicts the oldest frame.
#[derive(Debug)]
pub struct PrerollBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl PrerollBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        if capacity > MAX_PREROLL_FRAMES {
            log::warn!(
                "pre-roll of {} frames clamped to {}",
                capacity,
                MAX_PREROLL_FRAMES
            );
        }
        let capacity = capacity.min(MAX_PREROLL_FRAMES);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Capacity for `lead_in` worth of frames at `nominal_fps`.
    pub fn for_lead_in(nominal_fps: f64, lead_in: Duration) -> Self {
        Self::with_capacity(preroll_capacity(nominal_fps, lead_in))
    }

    pub fn push(&mut self, frame: Frame) {
        if self.capacity == 0 {
            return;
        }
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Remove and return every buffered frame, oldest first.
    pub fn drain_oldest_first(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Buffered frames, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Span of capture time currently covered by the buffer.
    pub fn span(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.elapsed_since(first.capture_time()),
            _ => Duration::ZERO,
        }
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.frames.iter().map(Frame::byte_len).sum()
    }
}

/// `nominal_fps × lead_in`, rounded to the nearest frame.
pub fn preroll_frames_for(nominal_fps: f64, lead_in: Duration) -> usize {
    if !nominal_fps.is_finite() || nominal_fps <= 0.0 {
        return 0;
    }
    (nominal_fps * lead_in.as_secs_f64()).round() as usize
}

/// `preroll_frames_for`, clamped to `MAX_PREROLL_FRAMES`.
pub fn preroll_capacity(nominal_fps: f64, lead_in: Duration) -> usize {
    let frames = preroll_frames_for(nominal_fps, lead_in);
    if frames > MAX_PREROLL_FRAMES {
        log::warn!(
            "lead-in of {:.1}s at {} fps needs {} frames; keeping only the last {}",
            lead_in.as_secs_f64(),
            nominal_fps,
            frames,
            MAX_PREROLL_FRAMES
        );
    }
    frames.min(MAX_PREROLL_FRAMES)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
