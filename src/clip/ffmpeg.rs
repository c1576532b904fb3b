//! MPEG-4 Part 2 in MP4 via FFmpeg.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;

use super::{ClipEncoder, ClipParams, EncoderFactory};
use crate::frame::Frame;

const BIT_RATE: usize = 2_000_000;

/// Opens `FfmpegMp4Encoder`s.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegMp4Factory;

impl EncoderFactory for FfmpegMp4Factory {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(&self, path: &Path, params: &ClipParams) -> Result<Box<dyn ClipEncoder>> {
        Ok(Box::new(FfmpegMp4Encoder::create(path, *params)?))
    }
}

pub struct FfmpegMp4Encoder {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    params: ClipParams,
    next_pts: i64,
}

impl FfmpegMp4Encoder {
    pub fn create(path: &Path, params: ClipParams) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        // The staging name has no usable extension, so the muxer is named explicitly.
        let mut output = ffmpeg::format::output_as(&path, "mp4")
            .with_context(|| format!("open mp4 output {}", path.display()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg was built without an MPEG-4 encoder"))?;
        let frame_rate = ffmpeg::Rational::from(params.frame_rate);
        let time_base = frame_rate.invert();

        let mut stream = output.add_stream(codec).context("add mp4 video stream")?;
        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create MPEG-4 encoder")?;
        encoder.set_width(params.width);
        encoder.set_height(params.height);
        encoder.set_format(ffmpeg::format::Pixel::YUV420P);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(frame_rate));
        encoder.set_bit_rate(BIT_RATE);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).context("open MPEG-4 encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(time_base);
        let stream_index = stream.index();

        output
            .write_header()
            .map_err(os_cause)
            .context("write mp4 header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(time_base);

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            params.width,
            params.height,
            ffmpeg::format::Pixel::YUV420P,
            params.width,
            params.height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: time_base,
            stream_time_base,
            params,
            next_pts: 0,
        })
    }

    fn drain_packets(&mut self) -> Result<usize> {
        let mut written = 0;
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            written += packet.size();
            packet
                .write_interleaved(&mut self.output)
                .map_err(os_cause)
                .context("write mp4 packet")?;
        }
        Ok(written)
    }
}

impl ClipEncoder for FfmpegMp4Encoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<usize> {
        let (width, height) = frame.dimensions();
        if (width, height) != (self.params.width, self.params.height) {
            return Err(anyhow!(
                "frame {} is {}x{}, clip is {}x{}",
                frame.seq(),
                width,
                height,
                self.params.width,
                self.params.height
            ));
        }
        let row_bytes = width as usize * 3;
        if frame.byte_len() != row_bytes * height as usize {
            return Err(anyhow!("frame {} is not packed RGB24", frame.seq()));
        }

        let mut rgb = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, width, height);
        let stride = rgb.stride(0);
        let dst = rgb.data_mut(0);
        for (row, src) in frame.pixels().chunks_exact(row_bytes).enumerate() {
            dst[row * stride..row * stride + row_bytes].copy_from_slice(src);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .context("convert frame to YUV420P")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .context("send frame to MPEG-4 encoder")?;
        self.drain_packets()
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.encoder.send_eof().context("flush MPEG-4 encoder")?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .map_err(os_cause)
            .context("write mp4 trailer")?;
        Ok(())
    }
}

/// Muxer failures carrying an errno become `io::Error`s, so running out of disk is
/// recognised the same way for every encoder.
fn os_cause(error: ffmpeg::Error) -> anyhow::Error {
    match error {
        ffmpeg::Error::Other { errno } => {
            anyhow::Error::new(std::io::Error::from_raw_os_error(errno))
        }
        other => anyhow::Error::new(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::is_storage_exhausted;

    #[cfg(target_os = "linux")]
    #[test]
    fn full_disk_from_the_muxer_is_storage_exhaustion() {
        const ENOSPC: i32 = 28;
        let err = os_cause(ffmpeg::Error::Other { errno: ENOSPC }).context("write mp4 packet");
        assert!(is_storage_exhausted(&err));
    }

    #[test]
    fn other_muxer_errors_are_not_storage_exhaustion() {
        let err = os_cause(ffmpeg::Error::InvalidData).context("write mp4 packet");
        assert!(!is_storage_exhausted(&err));
        let err = os_cause(ffmpeg::Error::Other { errno: 5 }).context("write mp4 trailer");
        assert!(!is_storage_exhausted(&err));
    }
}
