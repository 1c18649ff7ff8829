use serde::Serialize;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::instrument;
use yolo_inference::{Detection, Postprocessor};

use crate::{
    annotate::{Annotator, FpsMeter, Hud},
    buffer::FrameBuffer,
    frame::Frame,
    inference::InferenceStage,
    publisher::{FrameSink, PublishError},
    source::SourceError,
    stats::PipelineStats,
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("failed to spawn pipeline worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pipeline worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Starting,
    Running,
    Stopped,
    HardwareUnavailable,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Starting => "starting",
            PipelineStatus::Running => "running",
            PipelineStatus::Stopped => "stopped",
            PipelineStatus::HardwareUnavailable => "hardware_unavailable",
        }
    }
}

/// Everything the inference worker owns once started.
pub struct Stages<S> {
    pub inference: InferenceStage,
    pub postprocessor: Postprocessor,
    pub annotator: Annotator,
    pub sink: S,
    pub hud: bool,
}

/// The inference, postprocess, annotate and publish chain, run sequentially
/// on one worker thread fed by the frame buffer.
pub struct Pipeline {
    buffer: Arc<FrameBuffer>,
    stats: Arc<PipelineStats>,
    status: watch::Receiver<PipelineStatus>,
    worker: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl Pipeline {
    pub fn start<S>(
        stages: Stages<S>,
        buffer: Arc<FrameBuffer>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError>
    where
        S: FrameSink + 'static,
    {
        let (status_tx, status) = watch::channel(PipelineStatus::Starting);
        let worker = {
            let buffer = buffer.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("inference-worker".into())
                .spawn(move || run_worker(stages, buffer, stats, status_tx))?
        };

        Ok(Self {
            buffer,
            stats,
            status,
            worker: Some(worker),
        })
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        self.buffer.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn status(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    /// Stop accepting frames. The worker drains what is queued, then exits.
    pub fn shutdown(&self) {
        self.buffer.close();
    }

    /// Block until the worker exits and return its terminal result.
    pub fn join(mut self) -> Result<(), PipelineError> {
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| PipelineError::WorkerPanicked)?,
            None => Ok(()),
        }
    }
}

#[instrument(skip_all)]
fn run_worker<S: FrameSink>(
    stages: Stages<S>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<PipelineStats>,
    status: watch::Sender<PipelineStatus>,
) -> Result<(), PipelineError> {
    let Stages {
        mut inference,
        postprocessor,
        annotator,
        mut sink,
        hud,
    } = stages;
    let mut fps = FpsMeter::default();

    status.send_replace(PipelineStatus::Running);
    tracing::info!("Pipeline worker started");

    while let Some(frame) = buffer.pop() {
        let inferred = match inference.infer(&frame) {
            Ok(Some(inferred)) => inferred,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!("Pipeline stopping: {}", e);
                buffer.close();
                inference.shutdown();
                status.send_replace(PipelineStatus::HardwareUnavailable);
                return Err(e);
            }
        };

        let detections =
            match postprocessor.decode(&inferred.output, &inferred.letterbox, frame.sequence()) {
                Ok(detections) => detections,
                Err(e) => {
                    tracing::warn!("Skipping frame {}, decode failed: {}", frame.sequence(), e);
                    continue;
                }
            };

        let current_fps = fps.tick(std::time::Instant::now());
        publish(
            &frame,
            detections,
            &annotator,
            hud.then_some(current_fps),
            &mut sink,
            &stats,
        );
    }

    inference.shutdown();
    status.send_replace(PipelineStatus::Stopped);
    tracing::info!("Pipeline worker stopped");
    Ok(())
}

fn publish<S: FrameSink>(
    frame: &Frame,
    detections: Vec<Detection>,
    annotator: &Annotator,
    hud_fps: Option<f32>,
    sink: &mut S,
    stats: &PipelineStats,
) {
    for detection in &detections {
        tracing::debug!(
            sequence = detection.sequence,
            class = %annotator.labels().name(detection.class_id),
            confidence = detection.confidence,
            "detection"
        );
    }

    let annotated = match hud_fps {
        Some(fps) => annotator.annotate_with_hud(
            frame,
            &detections,
            &Hud {
                sequence: frame.sequence(),
                fps,
                detections: detections.len(),
            },
        ),
        None => annotator.annotate(frame, &detections),
    };
    let annotated = match annotated {
        Ok(annotated) => annotated,
        Err(e) => {
            tracing::warn!("Skipping frame {}, annotation failed: {}", frame.sequence(), e);
            return;
        }
    };

    match sink.publish(annotated, detections) {
        Ok(()) => {
            stats.frames_published.inc();
            stats.record_frame_age(frame.captured_at().elapsed());
        }
        Err(e @ PublishError::EncodeFailure { .. }) => {
            stats.encode_failures.inc();
            tracing::warn!("Skipping frame: {}", e);
        }
        Err(e) => tracing::warn!("Skipping frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use bytes::Bytes;
    use std::time::Duration;
    use yolo_inference::{
        synthetic_accelerator, InputGeometry, InputLayout, LabelSet, OutputLayout, Thresholds,
    };

    struct VecSink(Arc<parking_lot::Mutex<Vec<u64>>>);

    impl FrameSink for VecSink {
        fn publish(&mut self, frame: Frame, _detections: Vec<Detection>) -> Result<(), PublishError> {
            self.0.lock().push(frame.sequence());
            Ok(())
        }
    }

    #[test]
    fn test_worker_drains_buffer_and_stops() {
        let stats = Arc::new(PipelineStats::new().unwrap());
        let buffer = Arc::new(FrameBuffer::new(4, stats.clone()));
        let published = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let inference = InferenceStage::start(
            Box::new(synthetic_accelerator(Duration::ZERO, vec![1, 84, 16])),
            InputGeometry::new(16, 16, InputLayout::Nchw),
            Duration::from_secs(1),
            2,
            stats.clone(),
        )
        .unwrap();
        let stages = Stages {
            inference,
            postprocessor: Postprocessor::new(OutputLayout::Yolov8, 80, Thresholds::default()),
            annotator: Annotator::new(LabelSet::coco()),
            sink: VecSink(published.clone()),
            hud: true,
        };

        for sequence in 1..=3 {
            let frame =
                Frame::new(8, 8, PixelFormat::Rgb8, Bytes::from(vec![0; 192]), sequence).unwrap();
            buffer.push(frame);
        }
        let pipeline = Pipeline::start(stages, buffer, stats.clone()).unwrap();
        let status = pipeline.status();
        pipeline.shutdown();
        pipeline.join().unwrap();

        assert_eq!(*published.lock(), vec![1, 2, 3]);
        assert_eq!(stats.frames_published.get(), 3);
        assert_eq!(*status.borrow(), PipelineStatus::Stopped);
    }
}
