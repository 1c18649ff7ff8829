//! Latest-frame publication.
//!
//! Each published frame replaces the previous one in a `watch` slot. Readers
//! either take the current frame immediately or wait for the next one; they
//! never queue a backlog and never block the producer or each other.

use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use yolo_inference::Detection;

use crate::frame::{unix_millis, Frame, PixelFormat};

#[derive(Error, Debug, PartialEq)]
pub enum PublishError {
    #[error("failed to encode frame {sequence}: {reason}")]
    EncodeFailure { sequence: u64, reason: String },
    #[error("frame {sequence} is not newer than published frame {last}")]
    OutOfOrder { sequence: u64, last: u64 },
}

/// A self-contained JPEG plus the lineage of the frame it was encoded from.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Bytes,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub published_ms: u64,
    pub width: u32,
    pub height: u32,
    pub detections: Arc<Vec<Detection>>,
}

/// Terminal stage of the pipeline.
pub trait FrameSink: Send {
    fn publish(&mut self, frame: Frame, detections: Vec<Detection>) -> Result<(), PublishError>;
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes, PublishError> {
    let rgb;
    let pixels: &[u8] = match frame.format() {
        PixelFormat::Rgb8 => frame.data().as_ref(),
        PixelFormat::Bgr8 => {
            rgb = frame.to_rgb();
            &rgb
        }
    };

    let mut out = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, frame.width(), frame.height(), ExtendedColorType::Rgb8)
        .map_err(|e| PublishError::EncodeFailure {
            sequence: frame.sequence(),
            reason: e.to_string(),
        })?;
    Ok(Bytes::from(out))
}

pub struct Publisher {
    slot: watch::Sender<Option<Arc<EncodedFrame>>>,
    quality: u8,
    last_sequence: Option<u64>,
}

impl Publisher {
    pub fn new(quality: u8) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot,
            quality,
            last_sequence: None,
        }
    }

    pub fn subscribe(&self) -> LatestFrame {
        LatestFrame {
            receiver: self.slot.subscribe(),
        }
    }
}

impl FrameSink for Publisher {
    fn publish(&mut self, frame: Frame, detections: Vec<Detection>) -> Result<(), PublishError> {
        if let Some(last) = self.last_sequence {
            if frame.sequence() <= last {
                return Err(PublishError::OutOfOrder {
                    sequence: frame.sequence(),
                    last,
                });
            }
        }

        let jpeg = encode_jpeg(&frame, self.quality)?;
        let encoded = EncodedFrame {
            jpeg,
            sequence: frame.sequence(),
            timestamp_ms: frame.timestamp_ms(),
            published_ms: unix_millis(),
            width: frame.width(),
            height: frame.height(),
            detections: Arc::new(detections),
        };
        self.last_sequence = Some(encoded.sequence);
        self.slot.send_replace(Some(Arc::new(encoded)));
        Ok(())
    }
}

/// Reader side of the publisher. Cheap to clone, one per consumer.
#[derive(Clone)]
pub struct LatestFrame {
    receiver: watch::Receiver<Option<Arc<EncodedFrame>>>,
}

impl LatestFrame {
    /// The most recent frame, without waiting.
    pub fn current(&self) -> Option<Arc<EncodedFrame>> {
        self.receiver.borrow().clone()
    }

    /// Wait for a frame newer than the last one this reader saw.
    /// Returns `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Arc<EncodedFrame>> {
        loop {
            self.receiver.changed().await.ok()?;
            if let Some(frame) = self.receiver.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }

    pub fn into_stream(self) -> WatchStream<Option<Arc<EncodedFrame>>> {
        WatchStream::new(self.receiver)
    }
}
