//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! Every connection starts with a `Hello` frame (protocol version and the
//! sender's fixed identity, if any) followed by one or more envelope frames.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::protocol::{Envelope, PROTOCOL_VERSION};

pub(crate) const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Connection preamble.
    Hello {
        protocol_version: u8,
        identity: Option<NodeId>,
    },
    Envelope(Envelope),
}

impl Frame {
    pub fn hello(identity: Option<NodeId>) -> Self {
        Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            identity,
        }
    }
}

/// Serialize a `Hello` or `Envelope` frame behind its length prefix, ready
/// to write to a connection.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Why a frame could not be put on the wire.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("cannot serialize frame: {0}")]
    Encode(#[from] bincode::Error),
    /// Envelope payload over the 1 MiB frame limit.
    #[error("frame exceeds the 1 MiB limit")]
    TooLarge,
}

/// Read the body length from a 4-byte prefix. Rejects oversized frames before
/// any body bytes are read.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a body whose length [`frame_len`] already checked.
pub fn decode_body(body: &[u8]) -> Result<Frame, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Split the first frame off a buffer of connection bytes: the `Hello`
/// preamble first, then envelopes. Yields the frame and its encoded length;
/// `NeedMore` while the buffer ends mid-frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    /// The peer announced a body over the frame limit; the connection is dropped unread.
    #[error("announced frame exceeds the 1 MiB limit")]
    TooLarge,
    /// Not a `Hello` or `Envelope` this protocol version understands.
    #[error("malformed frame: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{Allocation, MessageType};

    fn sample_allocation() -> Frame {
        Frame::Envelope(
            Envelope::new(
                MessageType::Allocation,
                NodeId::new("127.0.0.1:5555"),
                NodeId::new("127.0.0.1:5001"),
            )
            .with_payload(Allocation::new("a1", 10.0, Duration::from_secs(5))),
        )
    }

    #[test]
    fn allocation_payload_survives_the_wire() {
        let frame = sample_allocation();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample_allocation()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn hello_then_envelope() {
        let hello = Frame::hello(Some(NodeId::new("127.0.0.1:5001")));
        let mut buf = encode_frame(&hello).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&sample_allocation()).unwrap());
        let (f1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        assert!(matches!(
            f1,
            Frame::Hello { protocol_version: PROTOCOL_VERSION, identity: Some(_) }
        ));
        let (f2, _) = decode_frame(&buf[n1..]).unwrap();
        assert!(matches!(f2, Frame::Envelope(_)));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let prefix = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(prefix), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}
