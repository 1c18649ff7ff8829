//! Aspect-preserving resize into the model input box.
//!
//! The frame is scaled by a single factor so it fits the input geometry and is
//! centred on a grey canvas. `Letterbox` records that transform so detections
//! can be mapped back onto the original frame.

use image::{imageops::FilterType, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use thiserror::Error;

use crate::tensor::{InputGeometry, InputLayout, InputTensor};

/// Grey used for the padding bands.
pub const PAD_VALUE: u8 = 114;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("frame has zero size ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("invalid model input geometry: {0}")]
    Geometry(String),
}

/// Order of the three colour channels in a packed 8-bit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub input_width: u32,
    pub input_height: u32,
}

impl Letterbox {
    pub fn new(source: (u32, u32), input: (u32, u32)) -> Self {
        let (source_width, source_height) = source;
        let (input_width, input_height) = input;
        let scale = (input_width as f32 / source_width.max(1) as f32)
            .min(input_height as f32 / source_height.max(1) as f32);
        let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, input_width);
        let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, input_height);
        let pad_x = ((input_width - resized_width) / 2) as f32;
        let pad_y = ((input_height - resized_height) / 2) as f32;

        Self {
            scale,
            pad_x,
            pad_y,
            resized_width,
            resized_height,
            source_width,
            source_height,
            input_width,
            input_height,
        }
    }

    /// Map a point from model input space to source pixel space, clamped to the frame.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = (x - self.pad_x) / self.scale;
        let sy = (y - self.pad_y) / self.scale;
        (
            sx.clamp(0.0, self.source_width as f32),
            sy.clamp(0.0, self.source_height as f32),
        )
    }

    /// Map a point from source pixel space into model input space.
    pub fn to_input(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }
}

/// Letterbox a packed 8-bit, three-channel frame into a normalised input tensor.
pub fn letterbox(
    pixels: &[u8],
    width: u32,
    height: u32,
    order: ChannelOrder,
    geometry: &InputGeometry,
) -> Result<(InputTensor, Letterbox), PreprocessError> {
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyFrame { width, height });
    }
    geometry.validate().map_err(PreprocessError::Geometry)?;

    let expected = width as usize * height as usize * 3;
    if pixels.len() != expected {
        return Err(PreprocessError::BufferSize {
            expected,
            actual: pixels.len(),
        });
    }

    let rgb: Vec<u8> = match order {
        ChannelOrder::Rgb => pixels.to_vec(),
        ChannelOrder::Bgr => pixels
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
    };
    let source: RgbImage = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, rgb).ok_or(
        PreprocessError::BufferSize {
            expected,
            actual: pixels.len(),
        },
    )?;

    let transform = Letterbox::new((width, height), (geometry.width, geometry.height));
    let resized = if (transform.resized_width, transform.resized_height) == (width, height) {
        source
    } else {
        image::imageops::resize(
            &source,
            transform.resized_width,
            transform.resized_height,
            FilterType::Triangle,
        )
    };

    let (in_w, in_h) = (geometry.width as usize, geometry.height as usize);
    let pad = PAD_VALUE as f32 / 255.;
    let mut input = match geometry.layout {
        InputLayout::Nchw => Array4::from_elem((1, 3, in_h, in_w), pad),
        InputLayout::Nhwc => Array4::from_elem((1, in_h, in_w, 3), pad),
    };

    let (off_x, off_y) = (transform.pad_x as usize, transform.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + off_x;
        let ty = y as usize + off_y;
        for (channel, value) in pixel.0.iter().enumerate() {
            let value = *value as f32 / 255.;
            match geometry.layout {
                InputLayout::Nchw => input[[0, channel, ty, tx]] = value,
                InputLayout::Nhwc => input[[0, ty, tx, channel]] = value,
            }
        }
    }

    Ok((InputTensor::new(input, geometry.layout), transform))
}
