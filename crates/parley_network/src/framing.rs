//! CRLF framing.
//!
//! A frame is one JSON-encoded [`Message`](crate::message::Message)
//! followed by `\r\n`. JSON escapes control characters inside strings, so
//! the delimiter never appears inside a well-formed payload.

use crate::error::NetworkError;
use crate::message::Message;

pub const DELIMITER: &[u8] = b"\r\n";

/// Encode a message as a complete frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, NetworkError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.extend_from_slice(DELIMITER);
    Ok(bytes)
}

/// Accumulates bytes from a stream and splits them into frames.
///
/// Partial frames stay buffered across reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes already scanned for a delimiter, so each byte is examined once.
    scanned: usize,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_len,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame (delimiter stripped), if one is buffered.
    ///
    /// Fails when more than `max_frame_len` bytes are buffered without a
    /// delimiter.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        // Back up one byte in case the previous read ended between \r and \n.
        let start = self.scanned.saturating_sub(1);
        let found = self.buf[start..]
            .windows(DELIMITER.len())
            .position(|w| w == DELIMITER)
            .map(|pos| start + pos);

        match found {
            Some(end) => {
                let mut frame: Vec<u8> = self.buf.drain(..end + DELIMITER.len()).collect();
                frame.truncate(end);
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame_len {
                    return Err(NetworkError::FrameTooLarge {
                        limit: self.max_frame_len,
                    });
                }
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn frame_for(id: &str) -> Vec<u8> {
        let msg = Message::new(
            Some("hello".into()),
            None,
            id,
            Device::named("a"),
            Device::named("b"),
        );
        encode_frame(&msg).unwrap()
    }

    #[test]
    fn test_encode_ends_with_crlf() {
        let bytes = frame_for("m1");
        assert!(bytes.ends_with(b"\r\n"));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&frame_for("m1"));
        let frame = decoder.next_frame().unwrap().unwrap();
        let msg = Message::from_slice(&frame).unwrap();
        assert_eq!(msg.message_id, "m1");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_is_kept() {
        let bytes = frame_for("m2");
        let (head, tail) = bytes.split_at(10);
        let mut decoder = FrameDecoder::new(1024);

        decoder.extend(head);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.extend(tail);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(Message::from_slice(&frame).unwrap().message_id, "m2");
    }

    #[test]
    fn test_delimiter_split_across_reads() {
        let bytes = frame_for("m3");
        let cut = bytes.len() - 1;
        let mut decoder = FrameDecoder::new(1024);

        decoder.extend(&bytes[..cut]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&bytes[cut..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut bytes = frame_for("a");
        bytes.extend(frame_for("b"));
        bytes.extend(b"{\"partial");

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&bytes);

        let first = decoder.next_frame().unwrap().unwrap();
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(Message::from_slice(&first).unwrap().message_id, "a");
        assert_eq!(Message::from_slice(&second).unwrap().message_id, "b");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), b"{\"partial".len());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new(8);
        decoder.extend(b"0123456789");
        assert!(matches!(
            decoder.next_frame(),
            Err(NetworkError::FrameTooLarge { limit: 8 })
        ));
    }

    #[test]
    fn test_empty_frame() {
        let mut decoder = FrameDecoder::new(8);
        decoder.extend(b"\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(Vec::new()));
    }
}
