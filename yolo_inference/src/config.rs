use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::{
    accelerator::Accelerator,
    decode::{OutputLayout, Thresholds},
    labels::LabelSet,
    synthetic::synthetic_accelerator,
    tensor::InputGeometry,
};

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub input: InputGeometry,
    #[serde(default)]
    pub output: OutputLayout,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default)]
    pub thresholds: Thresholds,
    pub labels_file: Option<PathBuf>,
}

fn default_num_classes() -> usize {
    80
}

impl ModelConfig {
    /// Labels from the configured file, or the COCO names when none is set.
    pub fn load_labels(&self) -> Result<LabelSet, String> {
        match &self.labels_file {
            Some(path) => LabelSet::load(path)
                .map_err(|e| format!("Failed to load labels from {:?}: {}", path, e)),
            None => Ok(LabelSet::coco()),
        }
    }
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        self.input.validate()?;
        self.thresholds.validate()?;
        if self.num_classes == 0 {
            return Err("num_classes must be at least 1".into());
        }
        if let Some(path) = &self.labels_file {
            if !path.exists() {
                return Err(format!("Labels file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Synthetic,
    Onnx,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcceleratorConfig {
    pub backend: Backend,
    #[serde(default)]
    pub model_dir: PathBuf,
    #[serde(default)]
    pub model_file: String,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reinit_budget")]
    pub reinit_budget: u32,
    #[serde(default)]
    pub synthetic_latency_ms: u64,
    #[serde(default = "default_synthetic_output_shape")]
    pub synthetic_output_shape: Vec<usize>,
}

fn default_output_name() -> String {
    "output0".into()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_reinit_budget() -> u32 {
    2
}

fn default_synthetic_output_shape() -> Vec<usize> {
    vec![1, 84, 8400]
}

impl AcceleratorConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn build(&self) -> Box<dyn Accelerator> {
        match self.backend {
            Backend::Synthetic => Box::new(synthetic_accelerator(
                Duration::from_millis(self.synthetic_latency_ms),
                self.synthetic_output_shape.clone(),
            )),
            #[cfg(feature = "onnx")]
            Backend::Onnx => Box::new(crate::ort_service::onnx_accelerator(
                &self.get_path(),
                &self.output_name,
            )),
            #[cfg(not(feature = "onnx"))]
            Backend::Onnx => Box::new(crate::device::ThreadedAccelerator::new("onnx", || {
                Err(crate::accelerator::AcceleratorError::Fault(
                    "built without the `onnx` feature".into(),
                ))
            })),
        }
    }
}

impl Validatable for AcceleratorConfig {
    fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("accelerator timeout_ms must be greater than zero".into());
        }
        match self.backend {
            Backend::Synthetic => {
                if self.synthetic_output_shape.is_empty() {
                    return Err("synthetic_output_shape must not be empty".into());
                }
            }
            Backend::Onnx => {
                if cfg!(not(feature = "onnx")) {
                    return Err("backend `onnx` requires building with the `onnx` feature".into());
                }
                if !self.get_path().exists() {
                    return Err(format!("Model file not found: {:?}", self.get_path()));
                }
            }
        }
        Ok(())
    }
}
