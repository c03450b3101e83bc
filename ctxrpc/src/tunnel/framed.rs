//! Tunnels over byte streams: every message is one JSON document inside a
//! length-delimited frame.

use bytes::Bytes;
use futures::{future, SinkExt, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{common::TunnelWrapper, SinkItem, StreamItem, TransportationError, Tunnel, TunnelInfo};

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// A frame that is not a valid message is dropped; the length prefix still
/// tells where the next one starts. Only io errors end the stream.
fn decode_frame(frame: Result<bytes::BytesMut, std::io::Error>) -> Option<StreamItem> {
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => return Some(Err(e.into())),
    };
    match serde_json::from_slice(&frame) {
        Ok(message) => Some(Ok(message)),
        Err(e) => {
            tracing::warn!(?e, len = frame.len(), "undecodable frame, dropped");
            None
        }
    }
}

fn encode_frame(item: SinkItem) -> Result<Bytes, TransportationError> {
    Ok(Bytes::from(serde_json::to_vec(&item)?))
}

pub struct FramedTunnel;

impl FramedTunnel {
    /// Build a tunnel from separate read and write halves. Dropping the write
    /// half is what the peer observes as end of stream, so prefer halves that
    /// shut down on drop (e.g. `TcpStream::into_split`).
    pub fn new<R, W>(reader: R, writer: W, info: Option<TunnelInfo>) -> Box<dyn Tunnel>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stream =
            FramedRead::new(reader, codec()).filter_map(|frame| future::ready(decode_frame(frame)));
        let sink = SinkExt::<Bytes>::sink_map_err(
            FramedWrite::new(writer, codec()),
            TransportationError::from,
        )
        .with(|item: SinkItem| future::ready(encode_frame(item)));
        Box::new(TunnelWrapper::new(stream, sink, info))
    }

    pub fn from_duplex<T>(io: T, info: Option<TunnelInfo>) -> Box<dyn Tunnel>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer, info)
    }
}
