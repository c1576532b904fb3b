mod backend;
mod backends;
mod gateway;
mod result;

use anyhow::{Context, Result};

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use gateway::{
    DetectorGateway, GatewaySettings, GatewayStats, Verdict, DEFAULT_CLASSES, DEFAULT_STRIDE,
    DEFAULT_THRESHOLD,
};
pub use result::{Detection, ObjectClass, Region};

use crate::config::DetectorSettings;

/// Build the configured backend and warm it up.
pub fn backend_from_settings(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend = build_backend(settings)?;
    backend
        .warm_up()
        .with_context(|| format!("{} detector failed to warm up", backend.name()))?;
    Ok(backend)
}

fn build_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend.as_str() {
        "stub" => {
            let label = settings
                .classes
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_CLASSES[0].to_string());
            Ok(Box::new(StubBackend::new(label)))
        }
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("the tract detector requires a model path"))?;
            Ok(Box::new(TractBackend::new(model_path, settings.input_size)?))
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => anyhow::bail!("the tract detector requires the backend-tract feature"),
        other => anyhow::bail!("unknown detector backend '{}'", other),
    }
}
