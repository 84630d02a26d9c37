//! Framing of PVA messages on a TCP stream.

use bytes::{Buf, BytesMut};
use nom::Err as NomErr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::messages::{Frame, HEADER_SIZE, Header, MAX_PAYLOAD_SIZE, MessageError};

/// Splits a byte stream into [`Frame`]s
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn with_max_payload(max_payload: usize) -> Self {
        FrameCodec { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = match Header::parse(&src[..HEADER_SIZE]) {
            Ok((_, header)) => header,
            Err(NomErr::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(MessageError::InvalidMagic(src[0])),
        };
        header.validate()?;
        if header.is_control() {
            src.advance(HEADER_SIZE);
            return Ok(Some(Frame {
                header,
                payload: Default::default(),
            }));
        }
        let size = header.payload_size as usize;
        if size > self.max_payload {
            return Err(MessageError::FrameTooLarge(size));
        }
        if src.len() < HEADER_SIZE + size {
            src.reserve(HEADER_SIZE + size - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(size).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload {
            return Err(MessageError::FrameTooLarge(item.payload.len()));
        }
        item.write(dst);
        Ok(())
    }
}

/// Write a batch of frames in one go
pub async fn write_frames<W>(frames: Vec<Frame>, writer: &mut W) -> Result<(), MessageError>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() {
        return Ok(());
    }
    let mut codec = FrameCodec::default();
    let mut buffer = BytesMut::new();
    for frame in frames {
        trace!("Sending {:?} ({} bytes)", frame.command(), frame.payload.len());
        codec.encode(frame, &mut buffer)?;
    }
    writer.write_all(&buffer).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CONTROL_SET_BYTE_ORDER, Command};
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_partial_frames() {
        let mut codec = FrameCodec::default();
        let frame = Frame::new(Command::Echo, false, vec![1, 2, 3, 4]);
        let bytes = frame.to_bytes();
        let mut buffer = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&bytes[5..10]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&bytes[10..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(frame));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_control_frames_have_no_payload() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        codec
            .encode(Frame::control(CONTROL_SET_BYTE_ORDER, 0, true), &mut buffer)
            .unwrap();
        codec
            .encode(Frame::new(Command::Echo, true, vec![9]), &mut buffer)
            .unwrap();
        let first = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(first.header.is_control());
        assert!(first.payload.is_empty());
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.command().unwrap(), Command::Echo);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buffer = BytesMut::from(&Frame::new(Command::Echo, false, vec![0; 8]).to_bytes()[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(MessageError::FrameTooLarge(8))
        ));
    }

    #[tokio::test]
    async fn test_framed_stream() {
        let frames = vec![
            Frame::new(Command::Echo, false, vec![1]),
            Frame::new(Command::Get, false, vec![2, 3]),
        ];
        let mut written = Vec::new();
        write_frames(frames.clone(), &mut written).await.unwrap();
        let mut framed = FramedRead::new(&written[..], FrameCodec::default());
        let mut read = Vec::new();
        while let Some(frame) = framed.next().await {
            read.push(frame.unwrap());
        }
        assert_eq!(read, frames);
    }
}
