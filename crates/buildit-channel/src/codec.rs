//! Length-prefixed JSON frames.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use tokio_util::codec::LengthDelimitedCodec;

use crate::ChannelError;

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// 4-byte big-endian length prefix, bounded by [`MAX_FRAME_LENGTH`].
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ChannelError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ChannelError::Protocol(format!("failed to encode message: {e}")))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(frame).map_err(|e| ChannelError::Protocol(format!("malformed message: {e}")))
}

/// Oversized or corrupt frames are protocol errors; anything else is a
/// broken transport.
pub fn frame_error(error: io::Error) -> ChannelError {
    if error.kind() == io::ErrorKind::InvalidData {
        ChannelError::Protocol(format!("bad frame: {error}"))
    } else {
        ChannelError::Io(error)
    }
}

/// Read and decode the next frame. `None` on a clean end of stream.
pub async fn next_message<T, S, B>(stream: &mut S) -> Result<Option<T>, ChannelError>
where
    T: DeserializeOwned,
    S: Stream<Item = io::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    match stream.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(frame_error(e)),
        Some(Ok(frame)) => decode(frame.as_ref()).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildit_core::{BuildId, WorkerId, WorkerMessage};
    use bytes::BytesMut;
    use futures::SinkExt;
    use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

    #[tokio::test]
    async fn test_messages_cross_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, frame_codec());
        let mut reader = FramedRead::new(server, frame_codec());

        let sent = vec![
            WorkerMessage::RegisterWorker {
                worker_id: WorkerId::new("w1"),
                capacity: 2,
            },
            WorkerMessage::DispatchAck {
                build_id: BuildId::new(),
            },
        ];
        for message in &sent {
            writer.send(encode(message).unwrap()).await.unwrap();
        }
        drop(writer);

        let mut received = Vec::new();
        while let Some(message) = next_message::<WorkerMessage, _, _>(&mut reader)
            .await
            .unwrap()
        {
            received.push(message);
        }
        assert_eq!(received, sent);
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() {
        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes());
        buf.extend_from_slice(b"{}");

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(frame_error(err), ChannelError::Protocol(_)));
    }

    #[test]
    fn test_oversized_frame_not_encoded() {
        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        let payload = Bytes::from(vec![b'x'; MAX_FRAME_LENGTH + 1]);
        assert!(codec.encode(payload, &mut buf).is_err());
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let err = decode::<WorkerMessage>(br#"{"type":"launch_missiles"}"#).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }
}
