//! clipwatch
//!
//! Detection-triggered clip recording for a single camera stream.
//!
//! # Architecture
//!
//! Frames flow through one thread in order:
//!
//! ```text
//! FrameSource ─▶ DetectorGateway (every Nth frame) ─▶ Recorder ─▶ ClipWriter ─▶ output dir
//!                                                        ▲
//!                                       PrerollBuffer ───┘ (drained when a clip starts)
//! ```
//!
//! Rules the pipeline keeps:
//!
//! 1. **Lead-in**: a clip starts with the buffered pre-roll, oldest first, then the
//!    trigger frame. No gaps, no duplicates.
//! 2. **One clip at a time**: detections while recording neither extend the clip
//!    nor open a second one.
//! 3. **Fixed length**: a clip closes on the first frame captured at or after
//!    `trigger + duration`, measured on the monotonic clock.
//! 4. **Fail-open detection**: a detector error counts as "nothing seen".
//! 5. **Publish by rename**: a clip only appears under its final name once the
//!    container is complete.
//! 6. **Stream loss is not fatal**: reset, back off, reconnect. Only running out
//!    of disk stops the recorder.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the pre-roll ring buffer
//! - `ingest`: frame sources and reconnect policy
//! - `detect`: detector backends and the sampling gateway
//! - `recorder`: the Idle/Recording state machine
//! - `clip`: encoders and the staging clip writer
//! - `pipeline`: the driver loop and stop signal
//! - `deliver`: the notifier side (directory watcher, Telegram sink)
//! - `config`: file and environment configuration for `clipwatchd`

pub mod clip;
pub mod config;
pub mod deliver;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod recorder;

pub use clip::{ClipEncoder, ClipParams, ClipWriter, EncoderFactory, H264Mp4Factory};
pub use config::ClipwatchConfig;
pub use deliver::{ClipSink, DirectoryWatcher, TelegramSink};
pub use detect::{Detection, DetectorBackend, DetectorGateway, GatewaySettings, StubBackend};
pub use frame::{CaptureTime, Frame, PrerollBuffer};
pub use ingest::{FrameSource, ReconnectPolicy, RtspConfig, RtspSource};
pub use pipeline::{Pipeline, PipelineSettings, StopSignal};
pub use recorder::{is_storage_exhausted, FinishedClip, Recorder, RecorderSettings, Transition};
