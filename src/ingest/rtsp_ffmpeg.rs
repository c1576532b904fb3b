//! RTSP frame source using FFmpeg.
//!
//! Demuxes and decodes the stream in-process, converting every decoded picture to
//! packed RGB24. The RTSP session runs over TCP to avoid UDP packet loss on busy
//! networks.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::redact_locator;
use super::rtsp::{RtspConfig, RtspStats};
use crate::frame::{CaptureTime, Frame};

pub(crate) struct FfmpegRtspSource {
    config: RtspConfig,
    session: Option<FfmpegSession>,
    frame_count: u64,
    connects: u64,
    frame_rate: Option<f64>,
}

struct FfmpegSession {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: Option<ScalerState>,
}

struct ScalerState {
    context: ffmpeg::software::scaling::Context,
    source: (ffmpeg::format::Pixel, u32, u32),
}

impl FfmpegRtspSource {
    pub(crate) fn new(config: RtspConfig) -> Self {
        Self {
            config,
            session: None,
            frame_count: 0,
            connects: 0,
            frame_rate: None,
        }
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.disconnect();
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        let input = ffmpeg::format::input_with_dictionary(&self.config.url, options)
            .with_context(|| {
                format!(
                    "failed to open RTSP input '{}' with ffmpeg",
                    redact_locator(&self.config.url)
                )
            })?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("stream has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0)
            .then(|| rate.numerator() as f64 / rate.denominator() as f64);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        self.session = Some(FfmpegSession {
            input,
            stream_index,
            decoder,
            scaler: None,
        });
        self.frame_rate = frame_rate;
        self.frame_count = 0;
        self.connects += 1;
        log::info!(
            "RtspSource: connected to {} (ffmpeg, fps={:?})",
            redact_locator(&self.config.url),
            frame_rate
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("RTSP source is not connected"))?;
        let FfmpegSession {
            input,
            stream_index,
            decoder,
            scaler,
        } = session;

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in input.packets() {
            if stream.index() != *stream_index {
                continue;
            }

            decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            if decoder.receive_frame(&mut decoded).is_ok() {
                let scaler = scaler_for(scaler, &decoded)?;
                scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;

                self.frame_count += 1;
                return Ok(Some(Frame::new(
                    self.frame_count,
                    CaptureTime::now(),
                    width,
                    height,
                    pixels,
                )));
            }
        }

        Ok(None)
    }

    pub(crate) fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    pub(crate) fn disconnect(&mut self) {
        self.session = None;
    }

    pub(crate) fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            connects: self.connects,
            url: self.config.url.clone(),
        }
    }
}

/// Scaler matching the decoded picture; rebuilt when the stream changes format or size.
fn scaler_for<'a>(
    slot: &'a mut Option<ScalerState>,
    decoded: &ffmpeg::frame::Video,
) -> Result<&'a mut ffmpeg::software::scaling::Context> {
    let source = (decoded.format(), decoded.width(), decoded.height());
    if slot.as_ref().map(|state| state.source) != Some(source) {
        let context = ffmpeg::software::scaling::Context::get(
            source.0,
            source.1,
            source.2,
            ffmpeg::format::Pixel::RGB24,
            source.1,
            source.2,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;
        *slot = Some(ScalerState { context, source });
    }
    match slot {
        Some(state) => Ok(&mut state.context),
        None => anyhow::bail!("ffmpeg scaler unavailable"),
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("ffmpeg frame is short")?.to_vec();
        return Ok((pixels, width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
