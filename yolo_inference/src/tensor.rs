use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD, IxDyn, ShapeError};
use serde::Deserialize;

/// Memory layout the model expects for its input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    #[default]
    Nchw,
    Nhwc,
}

/// Model input geometry: the letterboxed frame is resized into this box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InputGeometry {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub layout: InputLayout,
}

impl InputGeometry {
    pub fn new(width: u32, height: u32, layout: InputLayout) -> Self {
        Self {
            width,
            height,
            layout,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "model input geometry must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }
        Ok(())
    }
}

/// Preprocessed frame ready for submission, values normalised to [0, 1].
#[derive(Debug, Clone)]
pub struct InputTensor {
    data: Array4<f32>,
    layout: InputLayout,
}

impl InputTensor {
    pub fn new(data: Array4<f32>, layout: InputLayout) -> Self {
        Self { data, layout }
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Normalised value of one pixel channel, independent of layout.
    pub fn value(&self, x: usize, y: usize, channel: usize) -> f32 {
        match self.layout {
            InputLayout::Nchw => self.data[[0, channel, y, x]],
            InputLayout::Nhwc => self.data[[0, y, x, channel]],
        }
    }
}

/// Raw accelerator output, interpreted by an `OutputDecoder`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensorOutput {
    tensor: ArrayD<f32>,
}

impl RawTensorOutput {
    pub fn new(tensor: ArrayD<f32>) -> Self {
        Self { tensor }
    }

    pub fn from_shape_vec(shape: &[usize], data: Vec<f32>) -> Result<Self, ShapeError> {
        Ok(Self {
            tensor: ArrayD::from_shape_vec(IxDyn(shape), data)?,
        })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            tensor: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.tensor.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }
}
