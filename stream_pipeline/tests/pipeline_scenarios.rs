use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use stream_pipeline::{
    annotate::Annotator,
    buffer::FrameBuffer,
    frame::{Frame, PixelFormat},
    inference::InferenceStage,
    pipeline::{Pipeline, PipelineError, PipelineStatus, Stages},
    publisher::{FrameSink, PublishError},
    stats::PipelineStats,
};
use yolo_inference::{
    synthetic_accelerator, Accelerator, Detection, InferenceModel, InputGeometry, InputLayout,
    InputTensor, LabelSet, OutputLayout, Postprocessor, RawTensorOutput, ThreadedAccelerator,
    Thresholds,
};

#[derive(Clone, Default)]
struct RecordingSink {
    published: Arc<Mutex<Vec<(u64, Vec<Detection>)>>>,
}

impl RecordingSink {
    fn sequences(&self) -> Vec<u64> {
        self.published.lock().iter().map(|(s, _)| *s).collect()
    }
}

impl FrameSink for RecordingSink {
    fn publish(&mut self, frame: Frame, detections: Vec<Detection>) -> Result<(), PublishError> {
        self.published.lock().push((frame.sequence(), detections));
        Ok(())
    }
}

struct Harness {
    pipeline: Pipeline,
    buffer: Arc<FrameBuffer>,
    stats: Arc<PipelineStats>,
    sink: RecordingSink,
}

fn start(
    accelerator: Box<dyn Accelerator>,
    capacity: usize,
    timeout: Duration,
    reinit_budget: u32,
    num_classes: usize,
) -> Harness {
    let stats = Arc::new(PipelineStats::new().unwrap());
    let buffer = Arc::new(FrameBuffer::new(capacity, stats.clone()));
    let sink = RecordingSink::default();
    let inference = InferenceStage::start(
        accelerator,
        InputGeometry::new(32, 32, InputLayout::Nchw),
        timeout,
        reinit_budget,
        stats.clone(),
    )
    .unwrap();
    let stages = Stages {
        inference,
        postprocessor: Postprocessor::new(OutputLayout::Yolov8, num_classes, Thresholds::default()),
        annotator: Annotator::new(LabelSet::coco()),
        sink: sink.clone(),
        hud: false,
    };
    let pipeline = Pipeline::start(stages, buffer.clone(), stats.clone()).unwrap();

    Harness {
        pipeline,
        buffer,
        stats,
        sink,
    }
}

fn frame(width: u32, height: u32, sequence: u64) -> Frame {
    Frame::new(
        width,
        height,
        PixelFormat::Bgr8,
        Bytes::from(vec![64; (width * height * 3) as usize]),
        sequence,
    )
    .unwrap()
}

/// Join on a helper thread so a hung worker fails the test instead of blocking it.
fn join_within(pipeline: Pipeline, limit: Duration) -> Result<(), PipelineError> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let _ = tx.send(pipeline.join());
    });
    rx.recv_timeout(limit).expect("pipeline worker did not stop in time")
}

struct HangingModel;

impl InferenceModel for HangingModel {
    fn run(&mut self, _input: &InputTensor) -> Result<RawTensorOutput, String> {
        thread::sleep(Duration::from_secs(600));
        Err("unreachable".into())
    }
}

struct FailingModel;

impl InferenceModel for FailingModel {
    fn run(&mut self, _input: &InputTensor) -> Result<RawTensorOutput, String> {
        Err("device error".into())
    }
}

/// One strong class-0 box centred in the model input.
struct FixedBoxModel;

impl InferenceModel for FixedBoxModel {
    fn run(&mut self, _input: &InputTensor) -> Result<RawTensorOutput, String> {
        RawTensorOutput::from_shape_vec(&[1, 5, 1], vec![16., 16., 8., 8., 0.9])
            .map_err(|e| e.to_string())
    }
}

#[test]
fn test_overload_drops_stale_frames_and_keeps_order() {
    let harness = start(
        Box::new(synthetic_accelerator(Duration::from_millis(10), vec![1, 84, 8])),
        1,
        Duration::from_secs(1),
        2,
        80,
    );

    for sequence in 1..=100 {
        harness.buffer.push(frame(16, 16, sequence));
        thread::sleep(Duration::from_millis(5));
    }
    harness.buffer.close();
    join_within(harness.pipeline, Duration::from_secs(10)).unwrap();

    let published = harness.sink.sequences();
    assert!(published.len() < 100);
    assert!(!published.is_empty());
    assert!(published.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(published.last(), Some(&100));
    assert_eq!(
        harness.stats.frames_dropped.get(),
        100 - published.len() as u64
    );
    assert_eq!(harness.stats.frames_published.get(), published.len() as u64);
}

#[test]
fn test_hung_accelerator_times_out_once_without_blocking() {
    let harness = start(
        Box::new(ThreadedAccelerator::new("hanging", || {
            Ok(Box::new(HangingModel) as Box<dyn InferenceModel>)
        })),
        1,
        Duration::from_millis(50),
        2,
        80,
    );

    let started = Instant::now();
    harness.buffer.push(frame(16, 16, 1));
    harness.buffer.close();
    join_within(harness.pipeline, Duration::from_secs(5)).unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(harness.stats.inference_timeouts.get(), 1);
    assert_eq!(harness.stats.accelerator_faults.get(), 0);
    assert!(harness.sink.sequences().is_empty());
}

#[test]
fn test_slow_accelerator_only_times_out() {
    let harness = start(
        Box::new(synthetic_accelerator(Duration::from_millis(80), vec![1, 84, 8])),
        1,
        Duration::from_millis(50),
        2,
        80,
    );
    let status = harness.pipeline.status();

    for sequence in 1..=60 {
        harness.buffer.push(frame(16, 16, sequence));
        thread::sleep(Duration::from_millis(10));
        assert_ne!(*status.borrow(), PipelineStatus::HardwareUnavailable);
    }
    harness.buffer.close();
    join_within(harness.pipeline, Duration::from_secs(10)).unwrap();

    assert_eq!(*status.borrow(), PipelineStatus::Stopped);
    assert!(harness.stats.inference_timeouts.get() >= 3);
    assert_eq!(harness.stats.accelerator_faults.get(), 0);
    assert_eq!(harness.stats.accelerator_reinits.get(), 0);
}

#[test]
fn test_fault_budget_exhaustion_stops_pipeline() {
    let harness = start(
        Box::new(ThreadedAccelerator::new("failing", || {
            Ok(Box::new(FailingModel) as Box<dyn InferenceModel>)
        })),
        4,
        Duration::from_secs(1),
        2,
        80,
    );
    let status = harness.pipeline.status();

    for sequence in 1..=3 {
        harness.buffer.push(frame(16, 16, sequence));
    }
    let result = join_within(harness.pipeline, Duration::from_secs(5));

    assert!(matches!(result, Err(PipelineError::HardwareUnavailable(_))));
    assert_eq!(*status.borrow(), PipelineStatus::HardwareUnavailable);
    assert_eq!(harness.stats.accelerator_faults.get(), 3);
    assert_eq!(harness.stats.accelerator_reinits.get(), 2);
    assert!(harness.buffer.is_closed());
    assert!(harness.sink.sequences().is_empty());
}

#[test]
fn test_detections_are_mapped_to_source_pixels() {
    let harness = start(
        Box::new(ThreadedAccelerator::new("fixed", || {
            Ok(Box::new(FixedBoxModel) as Box<dyn InferenceModel>)
        })),
        1,
        Duration::from_secs(1),
        0,
        1,
    );

    // 64x32 source letterboxed into 32x32: scale 0.5, 8 rows of padding top and bottom.
    harness.buffer.push(frame(64, 32, 1));
    harness.buffer.close();
    join_within(harness.pipeline, Duration::from_secs(5)).unwrap();

    let published = harness.sink.published.lock();
    assert_eq!(published.len(), 1);
    let (sequence, detections) = &published[0];
    assert_eq!(*sequence, 1);
    assert_eq!(detections.len(), 1);
    let detection = &detections[0];
    assert_eq!(detection.sequence, 1);
    assert_eq!(detection.class_id, 0);
    assert!((detection.bbox.x1 - 24.).abs() < 1e-3);
    assert!((detection.bbox.y1 - 8.).abs() < 1e-3);
    assert!((detection.bbox.x2 - 40.).abs() < 1e-3);
    assert!((detection.bbox.y2 - 24.).abs() < 1e-3);
}
