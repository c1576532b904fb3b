use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clip::{DEFAULT_BITRATE_KBPS, FALLBACK_FRAME_RATE};
use crate::detect::{DEFAULT_CLASSES, DEFAULT_STRIDE, DEFAULT_THRESHOLD};
use crate::frame::{preroll_frames_for, MAX_PREROLL_FRAMES};
use crate::ingest::{ReconnectPolicy, RtspConfig, DEFAULT_RECONNECT_DELAY};

const DEFAULT_RTSP_URL: &str = "stub://front_camera";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_NOMINAL_FPS: f64 = 30.0;
const DEFAULT_OUTPUT_DIR: &str = "videos";
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CLIP_SECS: u64 = 10;
const DEFAULT_LEAD_IN_SECS: u64 = 5;
const DEFAULT_ENCODER: &str = "h264";
const DEFAULT_IDLE_YIELD_MS: u64 = 10;

const KNOWN_DETECTORS: [&str; 2] = ["stub", "tract"];
const KNOWN_ENCODERS: [&str; 2] = ["h264", "ffmpeg"];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClipwatchConfigFile {
    output_dir: Option<PathBuf>,
    idle_yield_ms: Option<u64>,
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
    clip: Option<ClipConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    nominal_fps: Option<f64>,
    reconnect_delay_secs: Option<u64>,
    reconnect_max_delay_secs: Option<u64>,
    reconnect_jitter_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    stride: Option<u64>,
    threshold: Option<f32>,
    classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClipConfigFile {
    duration_secs: Option<u64>,
    lead_in_secs: Option<u64>,
    encoder: Option<String>,
    fallback_fps: Option<f64>,
    bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ClipwatchConfig {
    pub output_dir: PathBuf,
    /// Sleep between frames while idle.
    pub idle_yield: Duration,
    pub stream: StreamSettings,
    pub detector: DetectorSettings,
    pub clip: ClipSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Rate used to size the pre-roll buffer.
    pub nominal_fps: f64,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub stride: u64,
    pub threshold: f32,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClipSettings {
    pub duration: Duration,
    pub lead_in: Duration,
    pub encoder: String,
    pub fallback_fps: f64,
    /// Target bitrate of the h264 encoder.
    pub bitrate_kbps: u32,
}

impl StreamSettings {
    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.url.clone(),
            target_fps: self.target_fps,
            width: self.width,
            height: self.height,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: self.reconnect_delay,
            max_delay: self.reconnect_max_delay,
            jitter: self.reconnect_jitter,
        }
    }
}

impl DetectorSettings {
    pub fn gateway_settings(&self) -> crate::detect::GatewaySettings {
        crate::detect::GatewaySettings {
            stride: self.stride,
            threshold: self.threshold,
            classes: self.classes.clone(),
        }
    }
}

impl ClipwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CLIPWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ClipwatchConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let clip = file.clip.unwrap_or_default();

        let reconnect_delay = stream
            .reconnect_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);
        let stream = StreamSettings {
            url: stream.url.unwrap_or_else(|| DEFAULT_RTSP_URL.to_string()),
            target_fps: stream.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            width: stream.width.unwrap_or(DEFAULT_WIDTH),
            height: stream.height.unwrap_or(DEFAULT_HEIGHT),
            nominal_fps: stream.nominal_fps.unwrap_or(DEFAULT_NOMINAL_FPS),
            reconnect_delay,
            reconnect_max_delay: stream
                .reconnect_max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(reconnect_delay),
            reconnect_jitter: Duration::from_millis(stream.reconnect_jitter_ms.unwrap_or(0)),
        };
        let detector = DetectorSettings {
            backend: detector
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            model_path: detector.model_path,
            input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            stride: detector.stride.unwrap_or(DEFAULT_STRIDE),
            threshold: detector.threshold.unwrap_or(DEFAULT_THRESHOLD),
            classes: detector
                .classes
                .unwrap_or_else(|| DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect()),
        };
        let clip = ClipSettings {
            duration: Duration::from_secs(clip.duration_secs.unwrap_or(DEFAULT_CLIP_SECS)),
            lead_in: Duration::from_secs(clip.lead_in_secs.unwrap_or(DEFAULT_LEAD_IN_SECS)),
            encoder: clip.encoder.unwrap_or_else(|| DEFAULT_ENCODER.to_string()),
            fallback_fps: clip.fallback_fps.unwrap_or(FALLBACK_FRAME_RATE),
            bitrate_kbps: clip.bitrate_kbps.unwrap_or(DEFAULT_BITRATE_KBPS),
        };
        Self {
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            idle_yield: Duration::from_millis(file.idle_yield_ms.unwrap_or(DEFAULT_IDLE_YIELD_MS)),
            stream,
            detector,
            clip,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("CLIPWATCH_RTSP_URL") {
            self.stream.url = url;
        }
        if let Some(fps) = env_parse::<u32>("CLIPWATCH_TARGET_FPS", "an integer frame rate")? {
            self.stream.target_fps = fps;
        }
        if let Some(fps) = env_parse::<f64>("CLIPWATCH_NOMINAL_FPS", "a frame rate")? {
            self.stream.nominal_fps = fps;
        }
        if let Some(secs) =
            env_parse::<u64>("CLIPWATCH_RECONNECT_DELAY_SECS", "an integer number of seconds")?
        {
            let delay = Duration::from_secs(secs);
            // Keep escalation relative to the new base delay.
            self.stream.reconnect_max_delay = self.stream.reconnect_max_delay.max(delay);
            self.stream.reconnect_delay = delay;
        }
        if let Some(dir) = env_string("CLIPWATCH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env_string("CLIPWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_string("CLIPWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(stride) = env_parse::<u64>("CLIPWATCH_FRAME_STRIDE", "a positive integer")? {
            self.detector.stride = stride;
        }
        if let Some(threshold) =
            env_parse::<f32>("CLIPWATCH_CONFIDENCE", "a number between 0 and 1")?
        {
            self.detector.threshold = threshold;
        }
        if let Ok(classes) = std::env::var("CLIPWATCH_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.detector.classes = parsed;
            }
        }
        if let Some(secs) = env_parse::<u64>("CLIPWATCH_CLIP_SECS", "an integer number of seconds")? {
            self.clip.duration = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_parse::<u64>("CLIPWATCH_LEAD_IN_SECS", "an integer number of seconds")?
        {
            self.clip.lead_in = Duration::from_secs(secs);
        }
        if let Some(encoder) = env_string("CLIPWATCH_ENCODER") {
            self.clip.encoder = encoder;
        }
        if let Some(kbps) =
            env_parse::<u32>("CLIPWATCH_BITRATE_KBPS", "an integer bitrate in kbit/s")?
        {
            self.clip.bitrate_kbps = kbps;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if !KNOWN_DETECTORS.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of: {})",
                self.detector.backend,
                KNOWN_DETECTORS.join(", ")
            ));
        }
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!("the tract detector requires CLIPWATCH_MODEL_PATH"));
        }
        self.clip.encoder = self.clip.encoder.trim().to_lowercase();
        if !KNOWN_ENCODERS.contains(&self.clip.encoder.as_str()) {
            return Err(anyhow!(
                "unknown clip encoder '{}' (expected one of: {})",
                self.clip.encoder,
                KNOWN_ENCODERS.join(", ")
            ));
        }

        if self.detector.stride == 0 {
            return Err(anyhow!("frame stride must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.detector.threshold) {
            return Err(anyhow!(
                "confidence threshold must be between 0 and 1, got {}",
                self.detector.threshold
            ));
        }
        self.detector.classes = self
            .detector
            .classes
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if self.detector.classes.is_empty() {
            return Err(anyhow!("at least one detection class is required"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input size must be greater than zero"));
        }

        if self.clip.duration.is_zero() {
            return Err(anyhow!("clip duration must be greater than zero"));
        }
        if !(self.stream.nominal_fps.is_finite() && self.stream.nominal_fps > 0.0) {
            return Err(anyhow!("nominal frame rate must be greater than zero"));
        }
        if !(self.clip.fallback_fps.is_finite() && self.clip.fallback_fps > 0.0) {
            return Err(anyhow!("fallback frame rate must be greater than zero"));
        }
        let preroll = preroll_frames_for(self.stream.nominal_fps, self.clip.lead_in);
        if preroll > MAX_PREROLL_FRAMES {
            return Err(anyhow!(
                "lead-in of {}s at {} fps needs {} pre-roll frames, the limit is {}",
                self.clip.lead_in.as_secs(),
                self.stream.nominal_fps,
                preroll,
                MAX_PREROLL_FRAMES
            ));
        }
        if self.clip.bitrate_kbps == 0 {
            return Err(anyhow!("clip bitrate must be greater than zero"));
        }
        if self.stream.target_fps == 0 {
            return Err(anyhow!("target frame rate must be greater than zero"));
        }
        if self.stream.url.trim().is_empty() {
            return Err(anyhow!("stream url must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ClipwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}, got '{}'", key, expected, raw)),
        None => Ok(None),
    }
}

pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
