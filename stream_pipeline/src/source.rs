//! Frame source: reads image payloads from the capture process and turns them
//! into sequenced frames.
//!
//! Sequence numbers belong to the pipeline, not to a connection, so they keep
//! increasing across reconnects.

use bytes::Bytes;
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpStream, UdpSocket, UnixStream},
    sync::broadcast,
    time::sleep,
};
use tracing::instrument;

use crate::{
    buffer::{FrameBuffer, PushOutcome},
    config::SourceConfig,
    frame::{Frame, PixelFormat},
    framing::{FrameDecoder, FramingError, Payload},
    stats::PipelineStats,
};

const READ_CHUNK: usize = 64 * 1024;
const MAX_DATAGRAM: usize = 65_536;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("transport fault: {0}")]
    TransportFault(String),
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
    #[error("invalid source uri `{0}`")]
    InvalidUri(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
    Udp(String),
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
        if rest.is_empty() {
            return Err(SourceError::InvalidUri(uri.to_string()));
        }
        match scheme {
            "tcp" => Ok(Endpoint::Tcp(rest.to_string())),
            "udp" => Ok(Endpoint::Udp(rest.to_string())),
            "unix" => Ok(Endpoint::Unix(PathBuf::from(rest))),
            _ => Err(SourceError::InvalidUri(uri.to_string())),
        }
    }
}

enum Connection {
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Datagram(UdpSocket),
}

impl Connection {
    async fn open(endpoint: &Endpoint) -> Result<Self, SourceError> {
        let fault = |e: std::io::Error| SourceError::TransportFault(e.to_string());
        match endpoint {
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address).await.map_err(fault)?;
                Ok(Connection::Stream(Box::new(stream)))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(fault)?;
                Ok(Connection::Stream(Box::new(stream)))
            }
            Endpoint::Udp(address) => {
                let socket = UdpSocket::bind(address).await.map_err(fault)?;
                Ok(Connection::Datagram(socket))
            }
        }
    }

    /// Read the next chunk into `buf`; zero means the peer closed.
    async fn read(&mut self, buf: &mut Vec<u8>) -> Result<usize, SourceError> {
        let fault = |e: std::io::Error| SourceError::TransportFault(e.to_string());
        match self {
            Connection::Stream(stream) => {
                buf.resize(READ_CHUNK, 0);
                stream.read(buf).await.map_err(fault)
            }
            Connection::Datagram(socket) => {
                buf.resize(MAX_DATAGRAM, 0);
                socket.recv(buf).await.map_err(fault)
            }
        }
    }
}

pub struct FrameSource {
    endpoint: Endpoint,
    config: SourceConfig,
    decoder: FrameDecoder,
    connection: Option<Connection>,
    connected_once: bool,
    next_sequence: u64,
    stats: Arc<PipelineStats>,
}

impl FrameSource {
    pub fn new(config: &SourceConfig, stats: Arc<PipelineStats>) -> Result<Self, SourceError> {
        Ok(Self {
            endpoint: Endpoint::parse(&config.uri)?,
            decoder: FrameDecoder::new(
                config.framing,
                config.max_payload_bytes,
                (config.raw_width, config.raw_height),
            ),
            config: config.clone(),
            connection: None,
            connected_once: false,
            next_sequence: 1,
            stats,
        })
    }

    /// Next frame, `Ok(None)` at end of stream.
    ///
    /// A corrupt payload is reported and skipped; the following call resumes
    /// with the next payload. A transport fault drops the connection, the
    /// next call reconnects.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut chunk = Vec::new();
        loop {
            match self.decoder.decode() {
                Ok(Some(payload)) => return self.build_frame(payload).map(Some),
                Ok(None) => {}
                Err(FramingError::Corrupt(reason)) => {
                    return Err(SourceError::CorruptFrame(reason));
                }
                Err(FramingError::LostSync(reason)) => {
                    if matches!(self.connection, Some(Connection::Stream(_))) {
                        self.connection = None;
                    }
                    return Err(SourceError::CorruptFrame(reason));
                }
            }

            if self.connection.is_none() {
                if self.connected_once && !self.config.reconnect {
                    return Ok(None);
                }
                self.connect().await?;
            }
            let Some(connection) = self.connection.as_mut() else {
                continue;
            };
            // Zero bytes ends a stream; an empty datagram is just a packet.
            let is_stream = matches!(connection, Connection::Stream(_));

            match connection.read(&mut chunk).await {
                Ok(0) if is_stream => {
                    self.connection = None;
                    self.decoder.reset();
                    if !self.config.reconnect {
                        return Ok(None);
                    }
                    return Err(SourceError::TransportFault("connection closed by peer".into()));
                }
                Ok(read) => self.decoder.extend(&chunk[..read]),
                Err(e) => {
                    self.connection = None;
                    self.decoder.reset();
                    return Err(e);
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<(), SourceError> {
        let connection = Connection::open(&self.endpoint).await?;
        if self.connected_once {
            self.stats.transport_reconnects.inc();
            tracing::info!(endpoint = ?self.endpoint, "frame source reconnected");
        } else {
            tracing::info!(endpoint = ?self.endpoint, "frame source connected");
        }
        self.connected_once = true;
        self.decoder.reset();
        self.connection = Some(connection);
        Ok(())
    }

    fn build_frame(&mut self, payload: Payload) -> Result<Frame, SourceError> {
        let frame = match payload {
            Payload::Jpeg(bytes) => {
                let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg)
                    .map_err(|e| SourceError::CorruptFrame(format!("jpeg decode failed: {e}")))?
                    .to_rgb8();
                let (width, height) = image.dimensions();
                Frame::new(
                    width,
                    height,
                    PixelFormat::Rgb8,
                    Bytes::from(image.into_raw()),
                    self.next_sequence,
                )
            }
            Payload::RawBgr {
                width,
                height,
                data,
            } => Frame::new(width, height, PixelFormat::Bgr8, data, self.next_sequence),
        }
        .map_err(|e| SourceError::CorruptFrame(e.to_string()))?;

        self.next_sequence += 1;
        Ok(frame)
    }

    /// Feed the frame buffer until shutdown or end of stream, then close it.
    #[instrument(skip_all)]
    pub async fn run(mut self, buffer: Arc<FrameBuffer>, mut shutdown_rx: broadcast::Receiver<()>) {
        let initial_backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = initial_backoff;

        loop {
            tokio::select! {
                result = self.next_frame() => match result {
                    Ok(Some(frame)) => {
                        backoff = initial_backoff;
                        self.stats.frames_received.inc();
                        if let PushOutcome::Closed = buffer.push(frame) {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("frame source reached end of stream");
                        break;
                    }
                    Err(SourceError::CorruptFrame(reason)) => {
                        self.stats.corrupt_frames.inc();
                        tracing::warn!("Discarding corrupt frame: {}", reason);
                    }
                    Err(e) => {
                        let delay = backoff.mul_f32(rand::random::<f32>() * 0.2 + 0.9);
                        tracing::warn!("Frame source error: {}, retrying in {:?}", e, delay);
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown_rx.recv() => break,
                        }
                        backoff = (backoff * 2).min(max_backoff);
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Frame source received shutdown signal");
                    break;
                }
            }
        }

        self.connection = None;
        buffer.close();
        tracing::info!("Frame source stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framing;
    use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![128u8; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode(&pixels, width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    fn length_prefixed(payload: &[u8]) -> Vec<u8> {
        let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(payload);
        wire
    }

    fn source_config(uri: String, reconnect: bool) -> SourceConfig {
        SourceConfig {
            uri,
            framing: Framing::LengthPrefixed,
            max_payload_bytes: 1 << 20,
            raw_width: 0,
            raw_height: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            reconnect,
        }
    }

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:5000").unwrap(),
            Endpoint::Tcp("127.0.0.1:5000".into())
        );
        assert_eq!(
            Endpoint::parse("unix:///tmp/camera.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/camera.sock"))
        );
        assert!(Endpoint::parse("http://camera").is_err());
        assert!(Endpoint::parse("udp://").is_err());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&length_prefixed(&jpeg(8, 8))).await.unwrap();
            socket.write_all(&length_prefixed(b"not a jpeg")).await.unwrap();
            socket.write_all(&length_prefixed(&jpeg(16, 8))).await.unwrap();
        });

        let stats = Arc::new(PipelineStats::new().unwrap());
        let mut source = FrameSource::new(&source_config(format!("tcp://{address}"), false), stats).unwrap();

        let first = source.next_frame().await.unwrap().unwrap();
        assert!(matches!(
            source.next_frame().await,
            Err(SourceError::CorruptFrame(_))
        ));
        let second = source.next_frame().await.unwrap().unwrap();
        server.await.unwrap();

        assert_eq!((first.sequence(), first.width()), (1, 8));
        assert_eq!((second.sequence(), second.width()), (2, 16));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_datagram_does_not_end_udp_stream() {
        let address = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let stats = Arc::new(PipelineStats::new().unwrap());
        let mut source =
            FrameSource::new(&source_config(format!("udp://{address}"), false), stats.clone())
                .unwrap();
        let receiver = tokio::spawn(async move {
            let first = source.next_frame().await;
            let second = source.next_frame().await;
            (first, second)
        });

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = length_prefixed(&jpeg(8, 8));
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                sender.send_to(&[], address).await.unwrap();
                sender.send_to(&datagram, address).await.unwrap();
                if receiver.is_finished() {
                    break receiver.await.unwrap();
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(first.unwrap().unwrap().sequence(), 1);
        assert_eq!(second.unwrap().unwrap().sequence(), 2);
        assert_eq!(stats.transport_reconnects.get(), 0);
    }

    #[tokio::test]
    async fn test_sequence_continues_across_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                socket.write_all(&length_prefixed(&jpeg(8, 8))).await.unwrap();
                socket.write_all(&length_prefixed(&jpeg(8, 8))).await.unwrap();
            }
        });

        let stats = Arc::new(PipelineStats::new().unwrap());
        let buffer = Arc::new(FrameBuffer::new(8, stats.clone()));
        let source = FrameSource::new(&source_config(format!("tcp://{address}"), true), stats.clone()).unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(source.run(buffer.clone(), shutdown_rx));

        server.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.frames_received.get() < 4 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let sequences: Vec<u64> = std::iter::from_fn(|| buffer.pop())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(stats.transport_reconnects.get(), 1);
        assert!(buffer.is_closed());
    }
}
