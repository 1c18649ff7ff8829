//! Boundary to the inference accelerator.
//!
//! A device is opened once, executes one job at a time through a
//! submit/wait protocol, and is closed when the owner is done with it.

use std::time::Duration;

use thiserror::Error;

use crate::tensor::{InputTensor, RawTensorOutput};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcceleratorError {
    #[error("accelerator did not complete the job within {0:?}")]
    Timeout(Duration),
    /// Still executing a job abandoned after a timeout. Not a device error.
    #[error("accelerator is still busy with an abandoned job")]
    Busy,
    #[error("accelerator fault: {0}")]
    Fault(String),
}

/// Ticket returned by `submit`, redeemed with `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self) -> Result<Box<dyn AcceleratorHandle>, AcceleratorError>;
}

/// An open device. Implementations execute at most one job at a time.
pub trait AcceleratorHandle: Send {
    fn submit(&mut self, input: InputTensor) -> Result<JobHandle, AcceleratorError>;

    fn wait(
        &mut self,
        job: JobHandle,
        timeout: Duration,
    ) -> Result<RawTensorOutput, AcceleratorError>;

    fn close(&mut self);
}

/// Open device handle that is closed on every exit path.
pub struct ScopedHandle {
    inner: Option<Box<dyn AcceleratorHandle>>,
    backend: String,
}

impl ScopedHandle {
    pub fn open(accelerator: &dyn Accelerator) -> Result<Self, AcceleratorError> {
        let inner = accelerator.open()?;
        tracing::info!(backend = accelerator.name(), "accelerator opened");
        Ok(Self {
            inner: Some(inner),
            backend: accelerator.name().to_string(),
        })
    }

    /// Submit one job and wait for its result.
    pub fn run(
        &mut self,
        input: InputTensor,
        timeout: Duration,
    ) -> Result<RawTensorOutput, AcceleratorError> {
        let handle = self
            .inner
            .as_mut()
            .ok_or_else(|| AcceleratorError::Fault("accelerator handle already closed".into()))?;
        let job = handle.submit(input)?;
        handle.wait(job, timeout)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.inner.take() {
            handle.close();
            tracing::info!(backend = %self.backend, "accelerator closed");
        }
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        self.release();
    }
}
