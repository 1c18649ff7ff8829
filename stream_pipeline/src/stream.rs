use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::{convert::Infallible, sync::Arc};

use crate::publisher::{EncodedFrame, LatestFrame};

pub const FRAME_BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// One multipart part carrying a JPEG.
pub fn multipart_part(frame: &EncodedFrame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
        FRAME_BOUNDARY,
        frame.jpeg.len(),
        frame.sequence
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// MJPEG stream of the latest published frames. A slow client skips frames
/// instead of queueing them; the stream ends when the publisher goes away.
pub fn mjpeg_stream(latest: LatestFrame) -> impl Stream<Item = Result<Bytes, Infallible>> {
    latest
        .into_stream()
        .filter_map(|frame: Option<Arc<EncodedFrame>>| async move { frame })
        .map(|frame| Ok(multipart_part(&frame)))
}
