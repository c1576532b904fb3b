//! Clip writing.
//!
//! `ClipWriter` is the only way the recorder touches the filesystem. It owns one
//! encoder for the lifetime of one clip and enforces the publishing rule the
//! delivery side depends on: a clip is written under a hidden staging name and
//! renamed to its final name only after the encoder has finished the container.
//!
//! Encoders:
//! - `h264`: H.264 in MP4 through OpenH264, always available
//! - `ffmpeg`: MPEG-4 Part 2 in MP4 (feature: clip-ffmpeg)

mod h264;
#[cfg(feature = "clip-ffmpeg")]
mod ffmpeg;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::frame::Frame;

pub use h264::{H264Mp4Encoder, H264Mp4Factory, DEFAULT_BITRATE_KBPS};
#[cfg(feature = "clip-ffmpeg")]
pub use self::ffmpeg::FfmpegMp4Factory;

/// Used when the source does not report a frame rate.
pub const FALLBACK_FRAME_RATE: f64 = 25.0;

/// Prefix of every published clip file name.
pub const CLIP_FILE_PREFIX: &str = "detection_";

/// Extensions of the containers clipwatch can produce.
pub const CLIP_EXTENSIONS: [&str; 1] = ["mp4"];

const STAGING_SUFFIX: &str = ".part";

/// Stream parameters fixed for the lifetime of one clip.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipParams {
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

impl ClipParams {
    /// Parameters for a clip of frames shaped like `frame`, at the reported rate
    /// or `fallback_rate` when the source has none.
    pub fn for_frame(frame: &Frame, reported_rate: Option<f64>, fallback_rate: f64) -> Self {
        let frame_rate = reported_rate
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(fallback_rate);
        Self {
            frame_rate,
            width: frame.width(),
            height: frame.height(),
        }
    }
}

/// An open encoder writing one container file.
pub trait ClipEncoder {
    /// Encode and append one frame. Returns the number of bytes added to the file.
    fn write_frame(&mut self, frame: &Frame) -> Result<usize>;

    /// Flush and finalize the container. The file is playable once this returns `Ok`.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens encoders of one kind.
pub trait EncoderFactory {
    fn name(&self) -> &'static str;

    /// File extension of the produced container, without the dot.
    fn extension(&self) -> &'static str;

    fn open(&self, path: &Path, params: &ClipParams) -> Result<Box<dyn ClipEncoder>>;
}

/// Build the encoder factory named in configuration.
pub fn factory_from_name(name: &str, bitrate_kbps: u32) -> Result<Box<dyn EncoderFactory>> {
    match name {
        "h264" => Ok(Box::new(H264Mp4Factory::new(bitrate_kbps))),
        #[cfg(feature = "clip-ffmpeg")]
        "ffmpeg" => Ok(Box::new(FfmpegMp4Factory)),
        #[cfg(not(feature = "clip-ffmpeg"))]
        "ffmpeg" => anyhow::bail!("the ffmpeg encoder requires the clip-ffmpeg feature"),
        other => anyhow::bail!("unknown clip encoder '{}'", other),
    }
}

// ----------------------------------------------------------------------------
// ClipWriter
// ----------------------------------------------------------------------------

/// One clip being written.
///
/// `close` publishes the finished file; `abandon` discards it. Dropping a writer
/// that was neither closed nor abandoned finishes the encoder and discards the
/// file, so an unfinished container never appears under its final name.
pub struct ClipWriter {
    encoder: Option<Box<dyn ClipEncoder>>,
    staging_path: PathBuf,
    final_path: PathBuf,
    params: ClipParams,
    frames: u64,
    bytes: u64,
}

impl ClipWriter {
    pub fn open(
        factory: &dyn EncoderFactory,
        final_path: PathBuf,
        params: ClipParams,
    ) -> Result<Self> {
        let staging_path = staging_path_for(&final_path)?;
        let encoder = match factory.open(&staging_path, &params) {
            Ok(encoder) => encoder,
            Err(e) => {
                // The encoder may have created the file before failing.
                remove_staging(&staging_path);
                return Err(e.context(format!(
                    "open {} encoder for {}",
                    factory.name(),
                    staging_path.display()
                )));
            }
        };
        Ok(Self {
            encoder: Some(encoder),
            staging_path,
            final_path,
            params,
            frames: 0,
            bytes: 0,
        })
    }

    pub fn append(&mut self, frame: &Frame) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("clip writer already closed"))?;
        let written = encoder
            .write_frame(frame)
            .with_context(|| format!("write frame {} to clip", frame.seq()))?;
        self.frames += 1;
        self.bytes += written as u64;
        Ok(())
    }

    /// Finish the container and publish it under the final name.
    pub fn close(mut self) -> Result<PathBuf> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| anyhow::anyhow!("clip writer already closed"))?;
        if let Err(e) = encoder.finish() {
            remove_staging(&self.staging_path);
            return Err(e.context("finalize clip container"));
        }
        if let Err(e) = std::fs::rename(&self.staging_path, &self.final_path) {
            remove_staging(&self.staging_path);
            return Err(anyhow::Error::new(e).context(format!(
                "publish clip {} as {}",
                self.staging_path.display(),
                self.final_path.display()
            )));
        }
        Ok(self.final_path.clone())
    }

    /// Discard the clip: release the encoder and remove the staged file.
    pub fn abandon(mut self) {
        self.discard();
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn params(&self) -> ClipParams {
        self.params
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    fn discard(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            if let Err(e) = encoder.finish() {
                log::debug!("discarded clip encoder did not finish cleanly: {:#}", e);
            }
            remove_staging(&self.staging_path);
        }
    }
}

impl Drop for ClipWriter {
    fn drop(&mut self) {
        self.discard();
    }
}

fn remove_staging(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to remove staged clip {}: {}", path.display(), e);
        }
    }
}

// ----------------------------------------------------------------------------
// Naming
// ----------------------------------------------------------------------------

/// `detection_YYYYMMDD_HHMMSS_mmm.<ext>` from a capture time (UTC).
pub fn clip_file_name(captured_at: SystemTime, extension: &str) -> String {
    let at: DateTime<Utc> = captured_at.into();
    format!(
        "{}{}.{}",
        CLIP_FILE_PREFIX,
        at.format("%Y%m%d_%H%M%S_%3f"),
        extension
    )
}

/// Final path for a clip triggered at `captured_at`, unique within `dir`.
///
/// A numeric suffix is added when a clip (published or staged) already uses the name.
pub fn unique_clip_path(dir: &Path, captured_at: SystemTime, extension: &str) -> Result<PathBuf> {
    let name = clip_file_name(captured_at, extension);
    let stem = name.trim_end_matches(&format!(".{}", extension)).to_string();
    let mut candidate = dir.join(&name);
    let mut n = 1u32;
    while candidate.exists() || staging_path_for(&candidate)?.exists() {
        candidate = dir.join(format!("{}_{}.{}", stem, n, extension));
        n += 1;
    }
    Ok(candidate)
}

/// Hidden sibling used while the clip is being written: `dir/.name.ext.part`.
pub fn staging_path_for(final_path: &Path) -> Result<PathBuf> {
    let name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("clip path {} has no file name", final_path.display()))?;
    Ok(final_path.with_file_name(format!(".{}{}", name, STAGING_SUFFIX)))
}

/// True for staging files and anything else that is not a published clip.
pub fn is_published_clip(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with(STAGING_SUFFIX) {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CLIP_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}
