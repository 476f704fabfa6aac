//! JSON wire codec
//!
//! Every message is one JSON object. On byte streams each object is
//! terminated by `\n`; on datagram transports each datagram carries exactly
//! one object and no delimiter. The same `WireMessage` conversions are used
//! in both cases.

use crate::error::{ProtocolError, Result};
use serde_json::Value;

/// Largest frame accepted from a peer, delimiter excluded
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A message shape that can be converted to and from its JSON record.
pub trait WireMessage: Sized {
    fn to_value(&self) -> Result<Value>;

    /// Classifies an already-parsed JSON record.
    ///
    /// Records that are valid JSON but fit none of the shapes must fail
    /// with `ProtocolError::InvalidMessage`.
    fn from_value(value: Value) -> Result<Self>;
}

/// Encodes a message without a delimiter (datagram form)
pub fn encode<M: WireMessage>(message: &M) -> Result<Vec<u8>> {
    let value = message.to_value()?;
    serde_json::to_vec(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encodes a message as one `\n`-terminated frame (stream form)
pub fn encode_line<M: WireMessage>(message: &M) -> Result<Vec<u8>> {
    let mut bytes = encode(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes one complete frame or datagram
pub fn decode<M: WireMessage>(bytes: &[u8]) -> Result<M> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
    M::from_value(value)
}

/// Accumulates stream bytes and hands out complete frames only.
///
/// Reads from a socket may split a frame anywhere or carry several frames
/// at once; the buffer keeps the incomplete tail until its delimiter
/// arrives. Trailing `\r` is stripped and blank lines are skipped.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Appends bytes read from the transport
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, without its delimiter.
    ///
    /// Returns `Ok(None)` while no complete frame is buffered. A frame (or
    /// undelimited tail) longer than the limit is a `MalformedMessage`.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.buffer.iter().position(|byte| *byte == b'\n') {
                Some(end) => {
                    let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }

                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    if line.len() > self.max_frame_len {
                        return Err(ProtocolError::MalformedMessage(format!(
                            "frame of {} bytes exceeds the {} byte limit",
                            line.len(),
                            self.max_frame_len
                        )));
                    }

                    return Ok(Some(line));
                }
                None if self.buffer.len() > self.max_frame_len => {
                    return Err(ProtocolError::MalformedMessage(format!(
                        "{} bytes buffered without a frame delimiter",
                        self.buffer.len()
                    )));
                }
                None => return Ok(None),
            }
        }
    }

    /// Pops and decodes the next complete frame
    pub fn next_message<M: WireMessage>(&mut self) -> Result<Option<M>> {
        match self.next_frame()? {
            Some(frame) => decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Number of bytes held back as an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InboundMessage, OutboundMessage};
    use serde_json::json;

    #[test]
    fn test_encode_line_appends_single_delimiter() {
        let message = InboundMessage::response(3, json!({"ok": true}));
        let bytes = encode_line(&message).unwrap();

        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(&bytes[..bytes.len() - 1], encode(&message).unwrap().as_slice());
    }

    #[test]
    fn test_partial_frame_is_held_back() {
        let frame = encode_line(&InboundMessage::tick(5, json!({"Agents": []}))).unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut buffer = LineBuffer::new();
        buffer.extend(head);
        assert!(buffer.next_message::<InboundMessage>().unwrap().is_none());
        assert_eq!(buffer.buffered(), head.len());

        buffer.extend(tail);
        let message = buffer.next_message::<InboundMessage>().unwrap();
        assert_eq!(message, Some(InboundMessage::tick(5, json!({"Agents": []}))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut bytes = encode_line(&InboundMessage::tick(1, json!(null))).unwrap();
        bytes.extend(encode_line(&InboundMessage::response(0, json!("pong"))).unwrap());
        bytes.extend(b"{\"Method\":\"tick\"");

        let mut buffer = LineBuffer::new();
        buffer.extend(&bytes);

        assert_eq!(
            buffer.next_message::<InboundMessage>().unwrap(),
            Some(InboundMessage::tick(1, json!(null)))
        );
        assert_eq!(
            buffer.next_message::<InboundMessage>().unwrap(),
            Some(InboundMessage::response(0, json!("pong")))
        );
        assert!(buffer.next_message::<InboundMessage>().unwrap().is_none());
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"\n  \r\n{\"RequestId\":1,\"Results\":2}\r\n");

        let message = buffer.next_message::<InboundMessage>().unwrap();
        assert_eq!(message, Some(InboundMessage::response(1, json!(2))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unparsable_frame_is_malformed() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"{not json}\n");

        match buffer.next_message::<InboundMessage>() {
            Err(ProtocolError::MalformedMessage(_)) => {}
            other => panic!("expected MalformedMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_frame_is_malformed() {
        let mut buffer = LineBuffer::with_max_frame_len(16);
        buffer.extend(&[b'a'; 17]);

        assert!(matches!(
            buffer.next_frame(),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_datagram_form() {
        let handshake = OutboundMessage::handshake("agent-1");
        let bytes = encode(&handshake).unwrap();

        assert!(!bytes.contains(&b'\n'));
        assert_eq!(decode::<OutboundMessage>(&bytes).unwrap(), handshake);
    }
}
