use std::{path::Path, sync::Once};

use ort::{
    execution_providers::TensorRTExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};

use crate::{
    accelerator::AcceleratorError,
    device::{InferenceModel, ThreadedAccelerator},
    tensor::{InputTensor, RawTensorOutput},
};

static ORT_INIT: Once = Once::new();

fn init_runtime() {
    ORT_INIT.call_once(|| {
        let committed = ort::init()
            .with_execution_providers([TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build()])
            .commit();
        if let Err(e) = committed {
            tracing::warn!("ONNX Runtime environment setup failed: {}", e);
        }
    });
}

/// ONNX Runtime session driven from the device thread.
pub struct OrtModel {
    session: Session,
    output_name: String,
}

impl OrtModel {
    pub fn load(model_path: &Path, output_name: &str) -> Result<Self, ort::Error> {
        init_runtime();
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)?;
        tracing::info!("Created ONNX session from {:?}", model_path);

        Ok(Self {
            session,
            output_name: output_name.to_string(),
        })
    }
}

impl InferenceModel for OrtModel {
    fn run(&mut self, input: &InputTensor) -> Result<RawTensorOutput, String> {
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.view().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| format!("failed to build tensor: {}", e))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| format!("inference failed: {}", e))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("failed to extract tensor: {}", e))?;

        let ix = shape.to_ixdyn();
        let array = ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| format!("invalid tensor shape: {}", e))?;

        Ok(RawTensorOutput::new(array))
    }
}

pub fn onnx_accelerator(model_path: &Path, output_name: &str) -> ThreadedAccelerator {
    let model_path = model_path.to_path_buf();
    let output_name = output_name.to_string();
    ThreadedAccelerator::new("onnx", move || {
        let model = OrtModel::load(&model_path, &output_name)
            .map_err(|e| AcceleratorError::Fault(format!("failed to load model: {}", e)))?;
        Ok(Box::new(model) as Box<dyn InferenceModel>)
    })
}
