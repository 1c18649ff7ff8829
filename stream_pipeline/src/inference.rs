//! Inference stage: owns the accelerator handle for the lifetime of the
//! pipeline and runs one letterboxed frame at a time through it.
//!
//! Timeouts skip the frame, and so does a device still busy with a job
//! abandoned after a timeout. Device faults re-open the handle; after more
//! consecutive faults than the re-initialisation budget allows, the stage
//! reports the hardware as unavailable.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::instrument;
use yolo_inference::{
    letterbox, Accelerator, AcceleratorError, InputGeometry, Letterbox, RawTensorOutput,
    ScopedHandle,
};

use crate::{frame::Frame, pipeline::PipelineError, stats::PipelineStats};

/// Raw output for one frame plus the transform needed to map it back.
#[derive(Debug)]
pub struct Inferred {
    pub output: RawTensorOutput,
    pub letterbox: Letterbox,
}

pub struct InferenceStage {
    accelerator: Box<dyn Accelerator>,
    handle: Option<ScopedHandle>,
    geometry: InputGeometry,
    timeout: Duration,
    reinit_budget: u32,
    consecutive_faults: u32,
    stats: Arc<PipelineStats>,
}

impl InferenceStage {
    /// Open the accelerator. Failing to open it at all is fatal.
    pub fn start(
        accelerator: Box<dyn Accelerator>,
        geometry: InputGeometry,
        timeout: Duration,
        reinit_budget: u32,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError> {
        let handle = ScopedHandle::open(accelerator.as_ref()).map_err(|e| {
            tracing::error!(backend = accelerator.name(), "Failed to open accelerator: {}", e);
            PipelineError::HardwareUnavailable(format!("failed to open accelerator: {e}"))
        })?;

        Ok(Self {
            accelerator,
            handle: Some(handle),
            geometry,
            timeout,
            reinit_budget,
            consecutive_faults: 0,
            stats,
        })
    }

    /// Run one frame. `Ok(None)` means the frame was skipped (timeout,
    /// recoverable fault or unusable frame) and the caller should move on to
    /// the next one.
    #[instrument(skip_all, fields(sequence = frame.sequence()))]
    pub fn infer(&mut self, frame: &Frame) -> Result<Option<Inferred>, PipelineError> {
        let (input, letterbox) = match letterbox(
            frame.data(),
            frame.width(),
            frame.height(),
            frame.format().channel_order(),
            &self.geometry,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!("Skipping frame, preprocessing failed: {}", e);
                return Ok(None);
            }
        };

        let Some(handle) = self.handle.as_mut() else {
            return Err(PipelineError::HardwareUnavailable(
                "accelerator handle is not open".into(),
            ));
        };

        let started = Instant::now();
        match handle.run(input, self.timeout) {
            Ok(output) => {
                self.consecutive_faults = 0;
                self.stats.frames_inferred.inc();
                self.stats.record_inference_duration(started.elapsed());
                Ok(Some(Inferred { output, letterbox }))
            }
            Err(AcceleratorError::Timeout(timeout)) => {
                self.stats.inference_timeouts.inc();
                tracing::warn!(
                    "Inference timed out after {:?}, discarding frame {}",
                    timeout,
                    frame.sequence()
                );
                Ok(None)
            }
            Err(AcceleratorError::Busy) => {
                self.stats.inference_timeouts.inc();
                tracing::warn!(
                    "Accelerator still busy with an abandoned job, discarding frame {}",
                    frame.sequence()
                );
                Ok(None)
            }
            Err(AcceleratorError::Fault(reason)) => {
                self.recover(reason)?;
                Ok(None)
            }
        }
    }

    fn recover(&mut self, reason: String) -> Result<(), PipelineError> {
        let mut reason = reason;
        loop {
            self.stats.accelerator_faults.inc();
            self.consecutive_faults += 1;
            tracing::warn!(
                "Accelerator fault {}/{}: {}",
                self.consecutive_faults,
                self.reinit_budget,
                reason
            );
            if self.consecutive_faults > self.reinit_budget {
                tracing::error!(
                    "Accelerator fault budget exhausted after {} consecutive faults",
                    self.consecutive_faults
                );
                return Err(PipelineError::HardwareUnavailable(format!(
                    "{} consecutive accelerator faults, last: {reason}",
                    self.consecutive_faults
                )));
            }

            if let Some(handle) = self.handle.take() {
                handle.close();
            }
            match ScopedHandle::open(self.accelerator.as_ref()) {
                Ok(handle) => {
                    self.handle = Some(handle);
                    self.stats.accelerator_reinits.inc();
                    tracing::info!("Accelerator re-initialised");
                    return Ok(());
                }
                Err(e) => reason = format!("re-initialisation failed: {e}"),
            }
        }
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults
    }

    /// Release the accelerator handle.
    pub fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use yolo_inference::{AcceleratorHandle, InputLayout, InputTensor, JobHandle};

    type Script = Arc<Mutex<VecDeque<Result<(), AcceleratorError>>>>;

    /// Replays scripted results; an exhausted script returns success.
    struct ScriptedAccelerator {
        script: Script,
        opens: Arc<Mutex<u32>>,
        fail_open: bool,
    }

    struct ScriptedHandle {
        script: Script,
    }

    impl Accelerator for ScriptedAccelerator {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open(&self) -> Result<Box<dyn AcceleratorHandle>, AcceleratorError> {
            *self.opens.lock() += 1;
            if self.fail_open {
                return Err(AcceleratorError::Fault("no device".into()));
            }
            Ok(Box::new(ScriptedHandle {
                script: self.script.clone(),
            }))
        }
    }

    impl AcceleratorHandle for ScriptedHandle {
        fn submit(&mut self, _input: InputTensor) -> Result<JobHandle, AcceleratorError> {
            Ok(JobHandle::new(1))
        }

        fn wait(
            &mut self,
            _job: JobHandle,
            _timeout: Duration,
        ) -> Result<RawTensorOutput, AcceleratorError> {
            match self.script.lock().pop_front() {
                Some(Err(e)) => Err(e),
                _ => Ok(RawTensorOutput::zeros(&[1, 6, 4])),
            }
        }

        fn close(&mut self) {}
    }

    fn stage(
        script: Vec<Result<(), AcceleratorError>>,
        budget: u32,
    ) -> (InferenceStage, Arc<PipelineStats>, Arc<Mutex<u32>>) {
        let stats = Arc::new(PipelineStats::new().unwrap());
        let opens = Arc::new(Mutex::new(0));
        let accelerator = ScriptedAccelerator {
            script: Arc::new(Mutex::new(script.into())),
            opens: opens.clone(),
            fail_open: false,
        };
        let stage = InferenceStage::start(
            Box::new(accelerator),
            InputGeometry::new(8, 8, InputLayout::Nchw),
            Duration::from_millis(10),
            budget,
            stats.clone(),
        )
        .unwrap();
        (stage, stats, opens)
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(4, 4, PixelFormat::Rgb8, Bytes::from(vec![0; 48]), sequence).unwrap()
    }

    fn fault() -> Result<(), AcceleratorError> {
        Err(AcceleratorError::Fault("device error".into()))
    }

    #[test]
    fn test_third_fault_exceeds_budget_of_two() {
        let (mut stage, stats, opens) = stage(vec![fault(), fault(), fault()], 2);

        assert!(stage.infer(&frame(1)).unwrap().is_none());
        assert!(stage.infer(&frame(2)).unwrap().is_none());
        let result = stage.infer(&frame(3));

        assert!(matches!(result, Err(PipelineError::HardwareUnavailable(_))));
        assert_eq!(stats.accelerator_faults.get(), 3);
        assert_eq!(stats.accelerator_reinits.get(), 2);
        assert_eq!(*opens.lock(), 3);
    }

    #[test]
    fn test_success_resets_fault_count() {
        let (mut stage, stats, _) = stage(vec![fault(), fault(), Ok(()), fault(), fault()], 2);

        for sequence in 1..=5 {
            assert!(stage.infer(&frame(sequence)).is_ok());
        }

        assert_eq!(stats.frames_inferred.get(), 1);
        assert_eq!(stage.consecutive_faults(), 2);
    }

    #[test]
    fn test_timeout_skips_frame_without_fault() {
        let (mut stage, stats, opens) = stage(
            vec![Err(AcceleratorError::Timeout(Duration::from_millis(10)))],
            0,
        );

        assert!(stage.infer(&frame(1)).unwrap().is_none());
        let inferred = stage.infer(&frame(2)).unwrap().unwrap();

        assert_eq!(stats.inference_timeouts.get(), 1);
        assert_eq!(stats.accelerator_faults.get(), 0);
        assert_eq!(*opens.lock(), 1);
        assert_eq!(inferred.letterbox.source_width, 4);
    }

    #[test]
    fn test_busy_device_skips_frame_without_spending_budget() {
        let busy = || -> Result<(), AcceleratorError> { Err(AcceleratorError::Busy) };
        let (mut stage, stats, opens) = stage(vec![busy(), busy(), busy(), busy()], 0);

        for sequence in 1..=4 {
            assert!(stage.infer(&frame(sequence)).unwrap().is_none());
        }
        assert!(stage.infer(&frame(5)).unwrap().is_some());

        assert_eq!(stats.inference_timeouts.get(), 4);
        assert_eq!(stats.accelerator_faults.get(), 0);
        assert_eq!(stage.consecutive_faults(), 0);
        assert_eq!(*opens.lock(), 1);
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let accelerator = ScriptedAccelerator {
            script: Arc::new(Mutex::new(VecDeque::new())),
            opens: Arc::new(Mutex::new(0)),
            fail_open: true,
        };

        let result = InferenceStage::start(
            Box::new(accelerator),
            InputGeometry::new(8, 8, InputLayout::Nchw),
            Duration::from_millis(10),
            2,
            Arc::new(PipelineStats::new().unwrap()),
        );

        assert!(matches!(result, Err(PipelineError::HardwareUnavailable(_))));
    }
}
