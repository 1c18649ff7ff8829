use std::{thread, time::Duration};

use crate::{
    accelerator::AcceleratorError,
    device::{InferenceModel, ThreadedAccelerator},
    tensor::{InputTensor, RawTensorOutput},
};

/// Stand-in model for dry runs without hardware: waits `latency`, then
/// returns an all-zero tensor of the configured output shape.
pub struct SyntheticModel {
    latency: Duration,
    output_shape: Vec<usize>,
}

impl SyntheticModel {
    pub fn new(latency: Duration, output_shape: Vec<usize>) -> Self {
        Self {
            latency,
            output_shape,
        }
    }
}

impl InferenceModel for SyntheticModel {
    fn run(&mut self, _input: &InputTensor) -> Result<RawTensorOutput, String> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(RawTensorOutput::zeros(&self.output_shape))
    }
}

pub fn synthetic_accelerator(latency: Duration, output_shape: Vec<usize>) -> ThreadedAccelerator {
    ThreadedAccelerator::new("synthetic", move || {
        if output_shape.is_empty() {
            return Err(AcceleratorError::Fault(
                "synthetic output shape must not be empty".into(),
            ));
        }
        Ok(Box::new(SyntheticModel::new(latency, output_shape.clone())) as Box<dyn InferenceModel>)
    })
}
