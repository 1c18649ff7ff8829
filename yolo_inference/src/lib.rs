mod device;
#[cfg(feature = "onnx")]
mod ort_service;
mod synthetic;

pub mod accelerator;
pub mod config;
pub mod decode;
pub mod labels;
pub mod letterbox;
pub mod nms;
pub mod tensor;

pub use accelerator::{Accelerator, AcceleratorError, AcceleratorHandle, JobHandle, ScopedHandle};
pub use decode::{Detection, OutputDecoder, OutputLayout, Postprocessor, Thresholds};
pub use device::{InferenceModel, ThreadedAccelerator};
pub use labels::LabelSet;
pub use letterbox::{letterbox, ChannelOrder, Letterbox, PreprocessError};
pub use nms::BoundingBox;
#[cfg(feature = "onnx")]
pub use ort_service::{onnx_accelerator, OrtModel};
pub use synthetic::{synthetic_accelerator, SyntheticModel};
pub use tensor::{InputGeometry, InputLayout, InputTensor, RawTensorOutput};
