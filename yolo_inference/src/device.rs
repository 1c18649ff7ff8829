//! Runs a blocking model on a dedicated device thread.
//!
//! `wait` only blocks on the reply channel, so a job that never finishes
//! surfaces as a timeout instead of hanging the caller. A job abandoned after
//! a timeout keeps the device busy; submitting while it is still running is
//! reported as `Busy` so the owner can skip the frame and try again later.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::{
    accelerator::{Accelerator, AcceleratorError, AcceleratorHandle, JobHandle},
    tensor::{InputTensor, RawTensorOutput},
};

/// A model that executes synchronously on the calling thread.
pub trait InferenceModel: Send {
    fn run(&mut self, input: &InputTensor) -> Result<RawTensorOutput, String>;
}

type ModelFactory = dyn Fn() -> Result<Box<dyn InferenceModel>, AcceleratorError> + Send + Sync;

pub struct ThreadedAccelerator {
    name: String,
    factory: Arc<ModelFactory>,
}

impl ThreadedAccelerator {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn InferenceModel>, AcceleratorError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }
}

impl Accelerator for ThreadedAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn AcceleratorHandle>, AcceleratorError> {
        let model = (self.factory)()?;
        let (job_tx, job_rx) = bounded::<DeviceJob>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let device_busy = busy.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-device", self.name))
            .spawn(move || device_loop(model, job_rx, device_busy))
            .map_err(|e| AcceleratorError::Fault(format!("failed to spawn device thread: {e}")))?;

        Ok(Box::new(ThreadedHandle {
            job_tx: Some(job_tx),
            thread: Some(thread),
            busy,
            next_job: 0,
            pending: None,
        }))
    }
}

type JobReply = Result<RawTensorOutput, String>;

struct DeviceJob {
    id: u64,
    input: InputTensor,
    reply: Sender<JobReply>,
}

struct ThreadedHandle {
    job_tx: Option<Sender<DeviceJob>>,
    thread: Option<thread::JoinHandle<()>>,
    busy: Arc<AtomicBool>,
    next_job: u64,
    pending: Option<(u64, Receiver<JobReply>)>,
}

impl AcceleratorHandle for ThreadedHandle {
    fn submit(&mut self, input: InputTensor) -> Result<JobHandle, AcceleratorError> {
        if let Some((id, _)) = &self.pending {
            return Err(AcceleratorError::Fault(format!(
                "job {id} has not been collected yet"
            )));
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(AcceleratorError::Busy);
        }
        let job_tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| AcceleratorError::Fault("device handle is closed".into()))?;

        self.next_job += 1;
        let id = self.next_job;
        let (reply_tx, reply_rx) = bounded(1);
        match job_tx.try_send(DeviceJob {
            id,
            input,
            reply: reply_tx,
        }) {
            Ok(()) => {
                self.pending = Some((id, reply_rx));
                Ok(JobHandle::new(id))
            }
            // The abandoned job is queued but not picked up yet.
            Err(TrySendError::Full(_)) => Err(AcceleratorError::Busy),
            Err(TrySendError::Disconnected(_)) => {
                Err(AcceleratorError::Fault("device thread has exited".into()))
            }
        }
    }

    fn wait(
        &mut self,
        job: JobHandle,
        timeout: Duration,
    ) -> Result<RawTensorOutput, AcceleratorError> {
        let (id, reply_rx) = match self.pending.take() {
            Some((id, rx)) if id == job.id() => (id, rx),
            Some(other) => {
                let expected = other.0;
                self.pending = Some(other);
                return Err(AcceleratorError::Fault(format!(
                    "waited on job {} but job {expected} is in flight",
                    job.id()
                )));
            }
            None => {
                return Err(AcceleratorError::Fault(format!(
                    "job {} is not in flight",
                    job.id()
                )))
            }
        };

        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(AcceleratorError::Fault(message)),
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(job = id, "abandoning device job after timeout");
                Err(AcceleratorError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AcceleratorError::Fault(
                "device thread terminated while running a job".into(),
            )),
        }
    }

    fn close(&mut self) {
        self.pending = None;
        self.job_tx = None;
        if let Some(thread) = self.thread.take() {
            if self.busy.load(Ordering::SeqCst) && !thread.is_finished() {
                tracing::warn!("device thread still busy at close, detaching it");
                return;
            }
            if thread.join().is_err() {
                tracing::error!("device thread panicked");
            }
        }
    }
}

impl Drop for ThreadedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn device_loop(mut model: Box<dyn InferenceModel>, jobs: Receiver<DeviceJob>, busy: Arc<AtomicBool>) {
    for job in jobs.iter() {
        busy.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let result = model.run(&job.input);
        busy.store(false, Ordering::SeqCst);
        tracing::trace!(
            job = job.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "device job finished"
        );
        // The receiver is gone when the caller already timed out.
        let _ = job.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::ScopedHandle;
    use crate::tensor::InputLayout;
    use ndarray::Array4;

    struct EchoModel {
        delay: Duration,
    }

    impl InferenceModel for EchoModel {
        fn run(&mut self, input: &InputTensor) -> Result<RawTensorOutput, String> {
            thread::sleep(self.delay);
            Ok(RawTensorOutput::zeros(input.shape()))
        }
    }

    struct FailingModel;

    impl InferenceModel for FailingModel {
        fn run(&mut self, _input: &InputTensor) -> Result<RawTensorOutput, String> {
            Err("dma transfer failed".into())
        }
    }

    fn tiny_input() -> InputTensor {
        InputTensor::new(Array4::zeros((1, 3, 2, 2)), InputLayout::Nchw)
    }

    fn echo(delay: Duration) -> ThreadedAccelerator {
        ThreadedAccelerator::new("echo", move || {
            Ok(Box::new(EchoModel { delay }) as Box<dyn InferenceModel>)
        })
    }

    #[test]
    fn test_run_returns_model_output() {
        let accelerator = echo(Duration::ZERO);
        let mut handle = ScopedHandle::open(&accelerator).unwrap();

        let output = handle.run(tiny_input(), Duration::from_secs(1)).unwrap();

        assert_eq!(output.shape(), &[1, 3, 2, 2]);
    }

    #[test]
    fn test_slow_job_times_out_and_next_submit_reports_busy() {
        let accelerator = echo(Duration::from_millis(300));
        let mut handle = accelerator.open().unwrap();

        let job = handle.submit(tiny_input()).unwrap();
        let started = Instant::now();
        let result = handle.wait(job, Duration::from_millis(50));

        assert_eq!(result, Err(AcceleratorError::Timeout(Duration::from_millis(50))));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(matches!(
            handle.submit(tiny_input()),
            Err(AcceleratorError::Busy)
        ));

        thread::sleep(Duration::from_millis(400));
        let job = handle.submit(tiny_input()).unwrap();
        assert!(handle.wait(job, Duration::from_secs(1)).is_ok());
        handle.close();
    }

    #[test]
    fn test_model_error_is_a_fault() {
        let accelerator = ThreadedAccelerator::new("failing", || {
            Ok(Box::new(FailingModel) as Box<dyn InferenceModel>)
        });
        let mut handle = ScopedHandle::open(&accelerator).unwrap();

        let result = handle.run(tiny_input(), Duration::from_secs(1));

        assert_eq!(
            result,
            Err(AcceleratorError::Fault("dma transfer failed".into()))
        );
    }

    #[test]
    fn test_factory_error_fails_open() {
        let accelerator = ThreadedAccelerator::new("missing", || {
            Err(AcceleratorError::Fault("no device".into()))
        });

        assert!(accelerator.open().is_err());
    }
}
