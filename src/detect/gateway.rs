use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

pub const DEFAULT_STRIDE: u64 = 5;
pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_CLASSES: [&str; 2] = ["person", "vehicle"];

/// How often to run the detector and what counts as interesting.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewaySettings {
    /// Run the detector on every `stride`-th frame (`seq % stride == 0`).
    pub stride: u64,
    /// Minimum confidence for a detection to count.
    pub threshold: f32,
    /// Allow-listed labels or coarse classes.
    pub classes: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            stride: DEFAULT_STRIDE,
            threshold: DEFAULT_THRESHOLD,
            classes: DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Outcome of evaluating one frame.
#[derive(Clone, Debug, Default)]
pub struct Verdict {
    pub interesting: bool,
    /// Everything the backend reported, unfiltered.
    pub detections: Vec<Detection>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub frames_sampled: u64,
    pub detector_failures: u64,
    pub interesting_frames: u64,
}

/// Runs the detector on a sampled subset of frames and reduces the result to a
/// single "interesting" signal.
///
/// Detector failures are fail-open: they are logged and the frame counts as
/// uninteresting.
pub struct DetectorGateway {
    backend: Box<dyn DetectorBackend>,
    settings: GatewaySettings,
    stats: GatewayStats,
}

impl DetectorGateway {
    pub fn new(backend: Box<dyn DetectorBackend>, settings: GatewaySettings) -> Self {
        let stride = settings.stride.max(1);
        Self {
            backend,
            settings: GatewaySettings { stride, ..settings },
            stats: GatewayStats::default(),
        }
    }

    pub fn should_sample(&self, seq: u64) -> bool {
        seq % self.settings.stride == 0
    }

    pub fn evaluate(&mut self, frame: &Frame) -> Verdict {
        self.stats.frames_sampled += 1;
        let detections = match self.backend.detect(frame) {
            Ok(detections) => detections,
            Err(e) => {
                self.stats.detector_failures += 1;
                log::warn!(
                    "detector '{}' failed on frame {}: {:#}",
                    self.backend.name(),
                    frame.seq(),
                    e
                );
                return Verdict::default();
            }
        };

        let interesting = self.is_interesting(&detections);
        if interesting {
            self.stats.interesting_frames += 1;
        }
        Verdict {
            interesting,
            detections,
        }
    }

    /// Any detection on the allow-list at or above the threshold.
    pub fn is_interesting(&self, detections: &[Detection]) -> bool {
        detections.iter().any(|d| self.counts(d))
    }

    /// Labels of the detections that made a verdict interesting, for logging.
    pub fn trigger_labels(&self, verdict: &Verdict) -> Vec<String> {
        let mut labels: Vec<String> = verdict
            .detections
            .iter()
            .filter(|d| self.counts(d))
            .map(|d| format!("{}({:.2})", d.label, d.confidence))
            .collect();
        labels.dedup();
        labels
    }

    fn counts(&self, detection: &Detection) -> bool {
        detection.confidence >= self.settings.threshold
            && self
                .settings
                .classes
                .iter()
                .any(|entry| detection.matches(entry))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats
    }
}
