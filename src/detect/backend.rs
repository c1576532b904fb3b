use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend wraps one object-detection capability: it receives a frame and returns
/// every object it found, with no filtering. Thresholds and class allow-lists are
/// applied by the `DetectorGateway`, not here.
///
/// Calls are synchronous and must not retain the frame beyond the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Called once before the first frame. Backends with expensive first runs or
    /// models that can be checked up front override this.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingBackend {
        warm_ups: usize,
        fail_warm_up: bool,
    }

    impl DetectorBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(Vec::new())
        }

        fn warm_up(&mut self) -> Result<()> {
            self.warm_ups += 1;
            if self.fail_warm_up {
                anyhow::bail!("model output does not decode");
            }
            Ok(())
        }
    }

    #[test]
    fn boxed_backends_forward_warm_up() {
        let mut boxed: Box<CountingBackend> = Box::default();
        boxed.warm_up().unwrap();
        assert_eq!(boxed.warm_ups, 1);

        let mut failing = Box::new(CountingBackend {
            fail_warm_up: true,
            ..CountingBackend::default()
        });
        assert!(DetectorBackend::warm_up(&mut failing).is_err());
        assert_eq!(failing.warm_ups, 1);
    }
}
