//! H.264 in MP4 through OpenH264 and the `mp4` muxer.
//!
//! The `avcC` box needs the SPS and PPS, which only exist once the first frame
//! has been encoded, so the muxer is started lazily on the first frame. Later
//! parameter sets (repeated on IDR frames) are dropped from the samples.
//!
//! Samples are stored in AVCC form (4-byte big-endian length before each NAL
//! unit) with a constant duration of one frame period.

use anyhow::{anyhow, Context, Result};
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameType};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;
use std::fs::File;
use std::path::Path;

use super::{ClipEncoder, ClipParams, EncoderFactory};
use crate::frame::Frame;

pub const DEFAULT_BITRATE_KBPS: u32 = 2_000;

const TRACK_ID: u32 = 1;
const MOVIE_TIMESCALE: u32 = 90_000;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Opens `H264Mp4Encoder`s.
#[derive(Clone, Debug)]
pub struct H264Mp4Factory {
    bitrate_kbps: u32,
}

impl H264Mp4Factory {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self {
            bitrate_kbps: bitrate_kbps.max(1),
        }
    }
}

impl Default for H264Mp4Factory {
    fn default() -> Self {
        Self::new(DEFAULT_BITRATE_KBPS)
    }
}

impl EncoderFactory for H264Mp4Factory {
    fn name(&self) -> &'static str {
        "h264"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(&self, path: &Path, params: &ClipParams) -> Result<Box<dyn ClipEncoder>> {
        Ok(Box::new(H264Mp4Encoder::create(
            path,
            *params,
            self.bitrate_kbps,
        )?))
    }
}

enum Muxer {
    /// File created, waiting for the first frame's parameter sets.
    Starting(File),
    Writing(mp4::Mp4Writer<File>),
}

pub struct H264Mp4Encoder {
    encoder: Encoder,
    muxer: Option<Muxer>,
    /// Handle kept for `sync_all` once the muxer owns the file.
    sync: File,
    params: ClipParams,
    /// Encoded size; odd dimensions are cropped by one pixel for 4:2:0.
    width: u32,
    height: u32,
    sample_duration: u32,
    samples: u64,
    cropped: Vec<u8>,
}

impl H264Mp4Encoder {
    pub fn create(path: &Path, params: ClipParams, bitrate_kbps: u32) -> Result<Self> {
        let (width, height) = (params.width & !1, params.height & !1);
        if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(anyhow!(
                "invalid clip dimensions {}x{}",
                params.width,
                params.height
            ));
        }
        if !params.frame_rate.is_finite() || params.frame_rate <= 0.0 {
            return Err(anyhow!("invalid clip frame rate {}", params.frame_rate));
        }

        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate_kbps.saturating_mul(1000)))
            .skip_frames(false);
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .context("create OpenH264 encoder")?;

        let file = File::create(path)
            .with_context(|| format!("create clip file {}", path.display()))?;
        let sync = file.try_clone().context("duplicate clip file handle")?;
        let sample_duration = (MOVIE_TIMESCALE as f64 / params.frame_rate).round().max(1.0) as u32;

        Ok(Self {
            encoder,
            muxer: Some(Muxer::Starting(file)),
            sync,
            params,
            width,
            height,
            sample_duration,
            samples: 0,
            cropped: Vec::new(),
        })
    }

    /// RGB24 rows of the encoded area.
    fn encoder_input<'a>(&'a mut self, frame: &'a Frame) -> &'a [u8] {
        if (self.width, self.height) == frame.dimensions() {
            return frame.pixels();
        }
        let src_row = frame.width() as usize * 3;
        let dst_row = self.width as usize * 3;
        self.cropped.clear();
        for row in frame
            .pixels()
            .chunks_exact(src_row)
            .take(self.height as usize)
        {
            self.cropped.extend_from_slice(&row[..dst_row]);
        }
        &self.cropped
    }
}

impl ClipEncoder for H264Mp4Encoder {
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
        if frame.byte_len() != width as usize * height as usize * 3 {
            return Err(anyhow!("frame {} is not packed RGB24", frame.seq()));
        }

        let (enc_width, enc_height) = (self.width as usize, self.height as usize);
        let yuv = YUVBuffer::from_rgb_source(RgbSliceU8::new(
            self.encoder_input(frame),
            (enc_width, enc_height),
        ));
        let encoded = self
            .encoder
            .encode(&yuv)
            .with_context(|| format!("encode frame {}", frame.seq()))?;
        let is_sync = matches!(encoded.frame_type(), FrameType::IDR | FrameType::I);
        let annex_b = encoded.to_vec();

        let units = split_nal_units(&annex_b);
        let sample = avcc_sample(&units);
        if sample.is_empty() {
            log::debug!("encoder produced no picture for frame {}", frame.seq());
            return Ok(0);
        }

        let mut writer = match self.muxer.take() {
            Some(Muxer::Writing(writer)) => writer,
            Some(Muxer::Starting(file)) => {
                let sps = find_nal(&units, NAL_TYPE_SPS)
                    .ok_or_else(|| anyhow!("first encoded frame has no SPS"))?;
                let pps = find_nal(&units, NAL_TYPE_PPS)
                    .ok_or_else(|| anyhow!("first encoded frame has no PPS"))?;
                start_mp4_writer(file, sps, pps, self.width, self.height)?
            }
            None => return Err(anyhow!("mp4 muxer is unavailable after an earlier failure")),
        };

        let written = sample.len();
        let mp4_sample = mp4::Mp4Sample {
            start_time: self.samples * self.sample_duration as u64,
            duration: self.sample_duration,
            rendering_offset: 0,
            is_sync,
            bytes: sample.into(),
        };
        writer
            .write_sample(TRACK_ID, &mp4_sample)
            .context("write mp4 sample")?;
        self.muxer = Some(Muxer::Writing(writer));
        self.samples += 1;
        Ok(written)
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        match self.muxer.take() {
            Some(Muxer::Writing(mut writer)) => {
                writer.write_end().context("write mp4 index")?;
            }
            Some(Muxer::Starting(_)) => return Err(anyhow!("clip has no frames")),
            None => return Err(anyhow!("mp4 muxer is unavailable after an earlier failure")),
        }
        self.sync.sync_all().context("sync mp4 file")?;
        Ok(())
    }
}

fn start_mp4_writer(
    file: File,
    sps: &[u8],
    pps: &[u8],
    width: u32,
    height: u32,
) -> Result<mp4::Mp4Writer<File>> {
    let brand: mp4::FourCC = str::parse("isom").context("mp4 brand")?;
    let config = mp4::Mp4Config {
        major_brand: brand,
        minor_version: 512,
        compatible_brands: vec![brand, str::parse("avc1").context("mp4 brand")?],
        timescale: MOVIE_TIMESCALE,
    };
    let mut writer = mp4::Mp4Writer::write_start(file, &config).context("write mp4 header")?;

    let track = mp4::TrackConfig {
        track_type: mp4::TrackType::Video,
        timescale: MOVIE_TIMESCALE,
        language: String::from("und"),
        media_conf: mp4::MediaConfig::AvcConfig(mp4::AvcConfig {
            width: u16::try_from(width).context("clip width")?,
            height: u16::try_from(height).context("clip height")?,
            seq_param_set: sps.to_vec(),
            pic_param_set: pps.to_vec(),
        }),
    };
    writer.add_track(&track).context("add mp4 video track")?;
    Ok(writer)
}

struct NalCollector {
    units: Vec<Vec<u8>>,
}

impl h264_reader::push::NalFragmentHandler for NalCollector {
    fn nal_fragment(&mut self, bufs: &[&[u8]], _end: bool) {
        self.units.push(bufs.concat());
    }
}

/// Split an Annex B byte stream into NAL units without start codes.
fn split_nal_units(annex_b: &[u8]) -> Vec<Vec<u8>> {
    let mut reader = h264_reader::annexb::AnnexBReader::for_fragment_handler(NalCollector {
        units: Vec::new(),
    });
    reader.push(annex_b);
    reader
        .into_fragment_handler()
        .units
        .into_iter()
        .filter(|unit| !unit.is_empty())
        .collect()
}

fn nal_type(unit: &[u8]) -> u8 {
    unit[0] & 0x1f
}

fn find_nal(units: &[Vec<u8>], kind: u8) -> Option<&[u8]> {
    units
        .iter()
        .find(|unit| nal_type(unit) == kind)
        .map(Vec::as_slice)
}

/// Length-prefixed picture NAL units; parameter sets live in `avcC`.
fn avcc_sample(units: &[Vec<u8>]) -> Vec<u8> {
    let mut sample = Vec::with_capacity(units.iter().map(|u| u.len() + 4).sum());
    for unit in units {
        if matches!(nal_type(unit), NAL_TYPE_SPS | NAL_TYPE_PPS) {
            continue;
        }
        sample.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        sample.extend_from_slice(unit);
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CaptureTime;
    use std::time::{Duration, UNIX_EPOCH};

    fn at() -> CaptureTime {
        CaptureTime::new(UNIX_EPOCH, Duration::ZERO)
    }

    fn gradient_frame(seq: u64, width: u32, height: u32) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y) as u64 * 4 + seq * 8) as u8;
                pixels.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        Frame::new(seq, at(), width, height, pixels)
    }

    fn params(width: u32, height: u32) -> ClipParams {
        ClipParams {
            frame_rate: 25.0,
            width,
            height,
        }
    }

    #[test]
    fn splits_annex_b_and_strips_parameter_sets() {
        let stream = [
            0, 0, 0, 1, 0x67, 1, 2, // SPS
            0, 0, 0, 1, 0x68, 3, // PPS
            0, 0, 1, 0x65, 9, 9, 9, // IDR slice, 3-byte start code
        ];
        let units = split_nal_units(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(find_nal(&units, NAL_TYPE_SPS), Some(&[0x67, 1, 2][..]));
        assert_eq!(find_nal(&units, NAL_TYPE_PPS), Some(&[0x68, 3][..]));
        assert_eq!(avcc_sample(&units), vec![0, 0, 0, 4, 0x65, 9, 9, 9]);
        assert!(split_nal_units(&[]).is_empty());
    }

    #[test]
    fn writes_readable_h264_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");

        let mut encoder = Box::new(H264Mp4Encoder::create(&path, params(64, 48), 500).unwrap());
        let mut written = 0;
        for seq in 1..=5 {
            written += encoder.write_frame(&gradient_frame(seq, 64, 48)).unwrap();
        }
        assert!(written > 0);
        encoder.finish().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut mp4 = mp4::read_mp4(file).unwrap();
        assert_eq!(mp4.sample_count(TRACK_ID).unwrap(), 5);
        let track = &mp4.tracks()[&TRACK_ID];
        assert_eq!((track.width(), track.height()), (64, 48));
        let first = mp4.read_sample(TRACK_ID, 1).unwrap().unwrap();
        assert!(first.is_sync);
    }

    #[test]
    fn odd_dimensions_are_cropped_to_even() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.mp4");

        let mut encoder = Box::new(H264Mp4Encoder::create(&path, params(33, 25), 500).unwrap());
        encoder.write_frame(&gradient_frame(1, 33, 25)).unwrap();
        encoder.finish().unwrap();

        let mp4 = mp4::read_mp4(std::fs::File::open(&path).unwrap()).unwrap();
        let track = &mp4.tracks()[&TRACK_ID];
        assert_eq!((track.width(), track.height()), (32, 24));
    }

    #[test]
    fn rejects_frames_of_the_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let mut encoder = H264Mp4Encoder::create(&path, params(16, 8), 500).unwrap();

        assert!(encoder.write_frame(&gradient_frame(1, 8, 8)).is_err());
        let short = Frame::new(2, at(), 16, 8, vec![0u8; 10]);
        assert!(encoder.write_frame(&short).is_err());
        assert!(encoder.write_frame(&gradient_frame(3, 16, 8)).is_ok());
    }

    #[test]
    fn rejects_invalid_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.mp4");
        assert!(H264Mp4Encoder::create(&path, params(1, 8), 500).is_err());
        let zero_rate = ClipParams {
            frame_rate: 0.0,
            ..params(4, 4)
        };
        assert!(H264Mp4Encoder::create(&path, zero_rate, 500).is_err());
    }
}
