use bytes::Bytes;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use yolo_inference::ChannelOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Bgr8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        3
    }

    pub fn channel_order(&self) -> ChannelOrder {
        match self {
            PixelFormat::Rgb8 => ChannelOrder::Rgb,
            PixelFormat::Bgr8 => ChannelOrder::Bgr,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("frame {width}x{height} needs {expected} bytes, got {actual}")]
pub struct FrameSizeError {
    pub width: u32,
    pub height: u32,
    pub expected: usize,
    pub actual: usize,
}

/// Immutable decoded frame. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
    sequence: u64,
    timestamp_ms: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
        sequence: u64,
    ) -> Result<Self, FrameSizeError> {
        Self::with_capture_time(
            width,
            height,
            format,
            data,
            sequence,
            unix_millis(),
            Instant::now(),
        )
    }

    pub fn with_capture_time(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
        sequence: u64,
        timestamp_ms: u64,
        captured_at: Instant,
    ) -> Result<Self, FrameSizeError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected || expected == 0 {
            return Err(FrameSizeError {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            sequence,
            timestamp_ms,
            captured_at,
        })
    }

    /// New frame carrying the same lineage (sequence and capture time) as `self`.
    pub fn derive(&self, format: PixelFormat, data: Bytes) -> Result<Self, FrameSizeError> {
        Self::with_capture_time(
            self.width,
            self.height,
            format,
            data,
            self.sequence,
            self.timestamp_ms,
            self.captured_at,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time, milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Pixels in RGB order, converting if needed.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgb8 => self.data.to_vec(),
            PixelFormat::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_wrong_buffer_length() {
        let result = Frame::new(4, 4, PixelFormat::Rgb8, Bytes::from(vec![0; 47]), 1);

        assert_eq!(
            result.unwrap_err(),
            FrameSizeError {
                width: 4,
                height: 4,
                expected: 48,
                actual: 47
            }
        );
    }

    #[test]
    fn test_derive_keeps_lineage() {
        let frame = Frame::new(1, 1, PixelFormat::Bgr8, Bytes::from_static(&[1, 2, 3]), 9).unwrap();

        let derived = frame
            .derive(PixelFormat::Rgb8, Bytes::from(frame.to_rgb()))
            .unwrap();

        assert_eq!(derived.sequence(), 9);
        assert_eq!(derived.timestamp_ms(), frame.timestamp_ms());
        assert_eq!(derived.data().as_ref(), &[3, 2, 1]);
        assert_eq!(frame.data().as_ref(), &[1, 2, 3]);
    }
}
