//! clipwatchd - detection-triggered clip recorder
//!
//! This daemon:
//! 1. Reads frames from the configured stream (RTSP, or `stub://` for a synthetic scene)
//! 2. Keeps a pre-roll ring buffer of recent frames
//! 3. Runs the detector on every Nth frame
//! 4. Records a fixed-length clip, pre-roll first, when an allow-listed object is seen
//! 5. Publishes finished clips into the output directory for clip_notifier
//! 6. Reconnects with backoff whenever the stream breaks

use anyhow::{Context, Result};

use clipwatch::{
    clip::factory_from_name,
    detect::backend_from_settings,
    ingest::redact_locator,
    ClipwatchConfig, DetectorGateway, Pipeline, PipelineSettings, Recorder, RecorderSettings,
    RtspSource, StopSignal,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match ClipwatchConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("invalid configuration: {:#}", e);
            return Err(e);
        }
    };
    log::info!(
        "clipwatchd {} starting: stream={} output={}",
        env!("CARGO_PKG_VERSION"),
        redact_locator(&cfg.stream.url),
        cfg.output_dir.display()
    );
    log::info!(
        "detector={} stride={} threshold={:.2} classes={}",
        cfg.detector.backend,
        cfg.detector.stride,
        cfg.detector.threshold,
        cfg.detector.classes.join(",")
    );
    log::info!(
        "clips: {}s after trigger, {}s lead-in at {} fps nominal, encoder={}",
        cfg.clip.duration.as_secs(),
        cfg.clip.lead_in.as_secs(),
        cfg.stream.nominal_fps,
        cfg.clip.encoder
    );

    let source = RtspSource::new(cfg.stream.rtsp_config())?;
    let backend = backend_from_settings(&cfg.detector).context("create detector")?;
    let gateway = DetectorGateway::new(backend, cfg.detector.gateway_settings());
    let factory = factory_from_name(&cfg.clip.encoder, cfg.clip.bitrate_kbps)?;
    let recorder = Recorder::new(
        factory,
        RecorderSettings {
            output_dir: cfg.output_dir.clone(),
            clip_duration: cfg.clip.duration,
            fallback_fps: cfg.clip.fallback_fps,
        },
    )?;
    let mut pipeline = Pipeline::new(
        source,
        gateway,
        recorder,
        PipelineSettings {
            reconnect: cfg.stream.reconnect_policy(),
            idle_yield: cfg.idle_yield,
            nominal_fps: cfg.stream.nominal_fps,
            lead_in: cfg.clip.lead_in,
            ..PipelineSettings::default()
        },
    );

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, finishing current clip...");
        handler_stop.trigger();
    })
    .expect("error setting Ctrl-C handler");

    if let Err(e) = pipeline.run(&stop) {
        log::error!("clipwatchd stopping: {:#}", e);
        return Err(e);
    }
    let stats = pipeline.stats();
    log::info!(
        "clipwatchd exiting: {} frames, {} clips, {} stream interruptions",
        stats.frames_processed,
        stats.clips_published,
        stats.stream_interruptions
    );
    Ok(())
}
