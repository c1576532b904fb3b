mod common;

use std::time::Duration;

use clipwatch::detect::{DetectorGateway, GatewaySettings};
use clipwatch::frame::CaptureTime;
use clipwatch::{
    is_storage_exhausted, EncoderFactory, FrameSource, H264Mp4Factory, Pipeline,
    Frame, PipelineSettings, ReconnectPolicy, Recorder, RecorderSettings, StopSignal,
};

use common::*;

struct Setup {
    nominal_fps: f64,
    lead_in: Duration,
    clip: Duration,
    stride: u64,
    health_interval: Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            nominal_fps: 10.0,
            lead_in: Duration::from_secs(1),
            clip: Duration::from_secs(10),
            stride: 1,
            health_interval: Duration::from_secs(3600),
        }
    }
}

fn build(
    setup: Setup,
    sessions: Vec<Option<Vec<Step>>>,
    factory: Box<dyn EncoderFactory>,
    dir: &std::path::Path,
    detector: TagDetector,
) -> (Pipeline<ScriptedSource>, StopSignal) {
    let stop = StopSignal::new();
    let source = ScriptedSource::new(sessions, stop.clone());
    let gateway = DetectorGateway::new(
        Box::new(detector),
        GatewaySettings {
            stride: setup.stride,
            ..GatewaySettings::default()
        },
    );
    let recorder = Recorder::new(
        factory,
        RecorderSettings {
            output_dir: dir.to_path_buf(),
            clip_duration: setup.clip,
            fallback_fps: 25.0,
        },
    )
    .unwrap();
    let pipeline = Pipeline::new(
        source,
        gateway,
        recorder,
        PipelineSettings {
            reconnect: ReconnectPolicy::fixed(Duration::ZERO),
            idle_yield: Duration::ZERO,
            nominal_fps: setup.nominal_fps,
            lead_in: setup.lead_in,
            health_interval: setup.health_interval,
        },
    );
    (pipeline, stop)
}

#[test]
fn clip_starts_with_preroll_then_live_frames() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    let setup = Setup {
        nominal_fps: 2.0,
        ..Setup::default()
    };
    let script = frames(6, 0, |seq| if seq == 3 { PERSON } else { EMPTY });
    let (mut pipeline, stop) = build(
        setup,
        vec![Some(script)],
        Box::new(factory.clone()),
        dir.path(),
        TagDetector::default(),
    );
    assert_eq!(pipeline.preroll().capacity(), 2);

    pipeline.run(&stop).unwrap();

    let records = factory.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seqs, vec![1, 2, 3, 4, 5, 6]);
    // Stopping publishes the open clip.
    let clips = published(dir.path());
    assert_eq!(clips.len(), 1);
    let name = clips[0].file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("detection_") && name.ends_with(".mp4"));
}

#[test]
fn sampling_stride_limits_detector_calls() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    let detector = TagDetector::default();
    let setup = Setup {
        stride: 5,
        ..Setup::default()
    };
    // Frame 3 shows a person but is never sampled.
    let script = frames(12, 0, |seq| if seq == 3 || seq == 10 { PERSON } else { EMPTY });
    let (mut pipeline, stop) = build(
        setup,
        vec![Some(script)],
        Box::new(factory.clone()),
        dir.path(),
        detector.clone(),
    );

    pipeline.run(&stop).unwrap();

    assert_eq!(*detector.seen.lock().unwrap(), vec![5, 10]);
    let records = factory.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seqs, (1..=12).collect::<Vec<u64>>());
}

#[test]
fn detector_failure_does_not_stop_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    let detector = TagDetector::default();
    let script = frames(8, 0, |seq| match seq {
        5 => BROKEN,
        6 => PERSON,
        _ => EMPTY,
    });
    let (mut pipeline, stop) = build(
        Setup::default(),
        vec![Some(script)],
        Box::new(factory.clone()),
        dir.path(),
        detector.clone(),
    );

    pipeline.run(&stop).unwrap();

    assert_eq!(pipeline.gateway().stats().detector_failures, 1);
    assert_eq!(*detector.seen.lock().unwrap(), (1..=8).collect::<Vec<u64>>());
    assert_eq!(factory.records()[0].seqs, (1..=8).collect::<Vec<u64>>());
    assert_eq!(pipeline.stats().frames_processed, 8);
}

#[test]
fn read_failure_while_recording_resets_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    let mut first = frames(10, 0, |seq| if seq == 3 { PERSON } else { EMPTY });
    first.push(Step::ReadError);
    let second = frames(3, 5_000, |_| EMPTY);
    let (mut pipeline, stop) = build(
        Setup::default(),
        vec![Some(first), Some(second)],
        Box::new(factory.clone()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    assert_eq!(pipeline.source().connects, 2);
    assert_eq!(pipeline.stats().stream_interruptions, 1);
    assert!(!pipeline.recorder().is_recording());
    assert_eq!(pipeline.recorder().stats().clips_abandoned, 1);

    // The interrupted clip is discarded, staging file included.
    assert_eq!(factory.records()[0].seqs, (1..=10).collect::<Vec<u64>>());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    // Only frames from the new connection are buffered.
    let buffered: Vec<u64> = pipeline.preroll().iter().map(|f| f.seq()).collect();
    assert_eq!(buffered, vec![1, 2, 3]);
    assert!(pipeline
        .preroll()
        .iter()
        .all(|f| f.captured_at() >= at(5_000)));
}

#[test]
fn end_of_stream_discards_open_clip() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    let mut first = frames(4, 0, |seq| if seq == 2 { PERSON } else { EMPTY });
    first.push(Step::EndOfStream);
    let second = frames(2, 5_000, |_| EMPTY);
    let (mut pipeline, stop) = build(
        Setup::default(),
        vec![Some(first), Some(second)],
        Box::new(factory.clone()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    assert_eq!(factory.records().len(), 1);
    assert!(published(dir.path()).is_empty());
    assert_eq!(pipeline.stats().stream_interruptions, 1);
}

#[test]
fn write_failure_abandons_clip_and_detection_continues() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::failing_on(&[6]);
    let setup = Setup {
        nominal_fps: 2.0,
        ..Setup::default()
    };
    let script = frames(12, 0, |seq| if seq == 3 || seq == 9 { PERSON } else { EMPTY });
    let (mut pipeline, stop) = build(
        setup,
        vec![Some(script)],
        Box::new(factory.clone()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    let records = factory.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].seqs, vec![1, 2, 3, 4, 5]);
    // Frames kept flowing into the pre-roll after the failure.
    assert_eq!(records[1].seqs, vec![7, 8, 9, 10, 11, 12]);
    assert_eq!(published(dir.path()).len(), 1);
    assert_eq!(pipeline.recorder().stats().clips_abandoned, 1);
    assert_eq!(pipeline.stats().stream_interruptions, 0);
}

#[test]
fn detections_while_recording_never_overlap_clips() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    let setup = Setup {
        clip: Duration::from_secs(1),
        ..Setup::default()
    };
    let script = frames(15, 0, |_| PERSON);
    let (mut pipeline, stop) = build(
        setup,
        vec![Some(script)],
        Box::new(factory.clone()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    let records = factory.records();
    assert_eq!(records.len(), 2);
    // Frame 11 is captured exactly one second after the trigger and closes the clip.
    assert_eq!(records[0].seqs, (1..=11).collect::<Vec<u64>>());
    assert_eq!(records[1].seqs, (12..=15).collect::<Vec<u64>>());
    assert_eq!(published(dir.path()).len(), 2);
    assert_eq!(pipeline.recorder().stats().ignored_triggers, 10);
    assert_eq!(pipeline.stats().clips_published, 2);
}

#[test]
fn connect_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (mut pipeline, stop) = build(
        Setup::default(),
        vec![None, None, Some(frames(3, 0, |_| EMPTY))],
        Box::new(RecordingFactory::default()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    assert_eq!(pipeline.stats().connect_failures, 2);
    assert_eq!(pipeline.stats().connects, 1);
    assert_eq!(pipeline.stats().frames_processed, 3);
}

#[test]
fn health_is_reported_while_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let setup = Setup {
        health_interval: Duration::ZERO,
        ..Setup::default()
    };
    let (mut pipeline, stop) = build(
        setup,
        vec![None, None, None],
        Box::new(RecordingFactory::default()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.frames_processed, 0);
    // Three scripted failures plus the exhausted script, then the final report.
    assert_eq!(stats.connect_failures, 4);
    assert_eq!(stats.health_reports, 5);
}

#[test]
fn storage_exhaustion_stops_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::storage_full_on(&[4]);
    let script = frames(10, 0, |seq| if seq == 2 { PERSON } else { EMPTY });
    let (mut pipeline, stop) = build(
        Setup::default(),
        vec![Some(script)],
        Box::new(factory),
        dir.path(),
        TagDetector::default(),
    );

    let err = pipeline.run(&stop).unwrap_err();

    assert!(is_storage_exhausted(&err));
    assert_eq!(pipeline.stats().frames_processed, 4);
    assert!(!pipeline.recorder().is_recording());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn publishes_playable_mp4() {
    let dir = tempfile::tempdir().unwrap();
    let setup = Setup {
        clip: Duration::from_millis(500),
        ..Setup::default()
    };
    let script: Vec<Step> = (1..=10)
        .map(|seq| {
            let tag = if seq == 4 { PERSON } else { EMPTY };
            Step::Frame(sized_frame(seq, seq * 100, tag, 32, 32))
        })
        .collect();
    let (mut pipeline, stop) = build(
        setup,
        vec![Some(script)],
        Box::new(H264Mp4Factory::default()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    let clips = published(dir.path());
    assert_eq!(clips.len(), 1);
    let mp4 = mp4::read_mp4(std::fs::File::open(&clips[0]).unwrap()).unwrap();
    // Frames 1..=3 of pre-roll, trigger 4, live 5..=9 closing at +500 ms.
    assert_eq!(mp4.sample_count(1).unwrap(), 9);
    let track = &mp4.tracks()[&1];
    assert_eq!((track.width(), track.height()), (32, 32));
    assert_eq!(pipeline.source().describe(), "scripted://camera");
}

#[test]
fn wall_clock_step_back_keeps_clip_length() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::default();
    // Trigger, then a minute of frames stamped an hour earlier on the wall clock.
    let script: Vec<Step> = (1..=601)
        .map(|seq| {
            let mono = Duration::from_millis(seq * 100);
            let wall = if seq == 1 {
                at(seq * 100)
            } else {
                at(seq * 100) - Duration::from_secs(3600)
            };
            let tag = if seq == 1 { PERSON } else { EMPTY };
            Step::Frame(Frame::new(seq, CaptureTime::new(wall, mono), 2, 2, vec![tag; 12]))
        })
        .collect();
    let (mut pipeline, stop) = build(
        Setup::default(),
        vec![Some(script)],
        Box::new(factory.clone()),
        dir.path(),
        TagDetector::default(),
    );

    pipeline.run(&stop).unwrap();

    let records = factory.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seqs, (1..=101).collect::<Vec<u64>>());
    assert_eq!(published(dir.path()).len(), 1);
}
