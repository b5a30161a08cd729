//! Decoder for the `application/vnd.amazon.eventstream` framing used by
//! Bedrock streaming responses.
//!
//! Each message is: total length (u32), headers length (u32), prelude CRC,
//! headers, payload, message CRC. All integers are big-endian. CRCs are not
//! verified.

use super::LlmError;
use std::collections::HashMap;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;

/// One decoded message. Only string-valued headers are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// `event` or `exception`.
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(":message-type").map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.get(":event-type").map(String::as_str)
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.headers.get(":exception-type").map(String::as_str)
    }
}

/// Incremental decoder: feed bytes as they arrive, pull complete frames.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, LlmError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;

        if total_len < PRELUDE_LEN + TRAILER_LEN + headers_len {
            return Err(LlmError::StreamError(format!(
                "invalid event stream prelude: total {} headers {}",
                total_len, headers_len
            )));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let message: Vec<u8> = self.buffer.drain(..total_len).collect();
        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&message[PRELUDE_LEN..headers_end])?;
        let payload = message[headers_end..total_len - TRAILER_LEN].to_vec();

        Ok(Some(Frame { headers, payload }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_headers(mut bytes: &[u8]) -> Result<HashMap<String, String>, LlmError> {
    let truncated = || LlmError::StreamError("truncated event stream header".to_string());
    let mut headers = HashMap::new();

    while !bytes.is_empty() {
        let name_len = bytes[0] as usize;
        let name = bytes.get(1..1 + name_len).ok_or_else(truncated)?;
        let name = String::from_utf8_lossy(name).into_owned();
        bytes = &bytes[1 + name_len..];

        let value_type = *bytes.first().ok_or_else(truncated)?;
        bytes = &bytes[1..];

        let fixed_len = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            6 | 7 => None,
            other => {
                return Err(LlmError::StreamError(format!(
                    "unknown event stream header type {}",
                    other
                )))
            }
        };

        match fixed_len {
            Some(len) => {
                bytes = bytes.get(len..).ok_or_else(truncated)?;
            }
            None => {
                let len_bytes = bytes.get(0..2).ok_or_else(truncated)?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                let value = bytes.get(2..2 + len).ok_or_else(truncated)?;
                if value_type == 7 {
                    headers.insert(name, String::from_utf8_lossy(value).into_owned());
                }
                bytes = &bytes[2 + len..];
            }
        }
    }

    Ok(headers)
}

/// Encode a frame with string headers. CRC fields are zeroed.
#[cfg(test)]
pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total = PRELUDE_LEN + header_bytes.len() + payload.len() + TRAILER_LEN;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[0; 4]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> Vec<u8> {
        encode_frame(
            &[
                (":message-type", "event"),
                (":event-type", "contentBlockDelta"),
                (":content-type", "application/json"),
            ],
            format!(r#"{{"contentBlockIndex":0,"delta":{{"text":"{}"}}}}"#, text).as_bytes(),
        )
    }

    #[test]
    fn decodes_a_complete_frame() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&delta("Hello"));

        let frame = decoder.next_frame().unwrap().unwrap();

        assert_eq!(frame.message_type(), Some("event"));
        assert_eq!(frame.event_type(), Some("contentBlockDelta"));
        let payload: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(payload["delta"]["text"], "Hello");
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn waits_for_frames_split_across_reads() {
        let bytes = [delta("one"), delta("two")].concat();
        let mut decoder = EventStreamDecoder::new();
        let mut texts = Vec::new();

        for piece in bytes.chunks(7) {
            decoder.push(piece);
            while let Some(frame) = decoder.next_frame().unwrap() {
                let payload: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
                texts.push(payload["delta"]["text"].as_str().unwrap().to_string());
            }
        }

        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn skips_non_string_headers() {
        let mut header_bytes = vec![4];
        header_bytes.extend_from_slice(b"flag");
        header_bytes.push(0);
        header_bytes.push(5);
        header_bytes.extend_from_slice(b"count");
        header_bytes.push(4);
        header_bytes.extend_from_slice(&7_i32.to_be_bytes());

        let headers = parse_headers(&header_bytes).unwrap();

        assert!(headers.is_empty());
    }

    #[test]
    fn rejects_impossible_prelude() {
        let mut decoder = EventStreamDecoder::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&8_u32.to_be_bytes());
        bytes.extend_from_slice(&0_u32.to_be_bytes());
        bytes.extend_from_slice(&[0; 4]);
        decoder.push(&bytes);

        assert!(matches!(decoder.next_frame(), Err(LlmError::StreamError(_))));
    }
}
