use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, Region};
use crate::frame::Frame;

/// Stub backend for testing and synthetic streams.
///
/// Hashes the pixels of each frame it sees and reports one full-frame detection
/// labelled `label` whenever the picture differs from the previous call.
pub struct StubBackend {
    label: String,
    last_hash: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_hash: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new("person")
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let changed = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if changed {
            Ok(vec![Detection::new(
                self.label.clone(),
                0.85,
                Region::FULL_FRAME,
            )])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CaptureTime;
    use std::time::{Duration, UNIX_EPOCH};

    fn frame(seq: u64, pixels: &[u8]) -> Frame {
        let at = CaptureTime::new(UNIX_EPOCH, Duration::ZERO);
        Frame::new(seq, at, 1, 1, pixels.to_vec())
    }

    #[test]
    fn stub_backend_reports_scene_changes() {
        let mut backend = StubBackend::default();

        // First frame: nothing to compare against.
        assert!(backend.detect(&frame(1, b"abc")).unwrap().is_empty());

        let changed = backend.detect(&frame(2, b"xyz")).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].label, "person");
        assert_eq!(changed[0].confidence, 0.85);

        assert!(backend.detect(&frame(3, b"xyz")).unwrap().is_empty());
    }
}
