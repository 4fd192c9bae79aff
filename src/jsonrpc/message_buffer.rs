//! Accumulates raw bytes and cuts them into header blocks and fixed-length
//! bodies. No I/O happens here.
//!
//! Reading is two-phase: [`MessageBuffer::try_read_headers`] until the
//! `\r\n\r\n` separator has arrived, then [`MessageBuffer::try_read_content`]
//! until the announced number of bytes is buffered. Both return `Ok(None)`
//! when the caller has to wait for more data.
use crate::jsonrpc::error::FramingError;
use std::collections::HashMap;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const CRLF: &str = "\r\n";
const DEFAULT_SIZE: usize = 8192;

pub const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug)]
pub struct MessageBuffer {
    buffer: Vec<u8>,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        MessageBuffer {
            buffer: Vec::with_capacity(DEFAULT_SIZE),
        }
    }

    /// Appends raw bytes or text.
    pub fn append(&mut self, chunk: impl AsRef<[u8]>) {
        let chunk = chunk.as_ref();
        let required = self.buffer.len() + chunk.len();
        if required > self.buffer.capacity() {
            let mut capacity = self.buffer.capacity().max(DEFAULT_SIZE);
            while capacity < required {
                capacity *= 2;
            }
            self.buffer.reserve_exact(capacity - self.buffer.len());
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn try_read_headers(&mut self) -> Result<Option<HashMap<String, String>>, FramingError> {
        let Some(end) = self.find_separator() else {
            return Ok(None);
        };
        let block: Vec<u8> = self.buffer.drain(..end + 4).take(end).collect();
        let block = String::from_utf8_lossy(&block);

        let mut headers = HashMap::new();
        for line in block.split(CRLF) {
            let Some(index) = line.find(':') else {
                return Err(FramingError::InvalidHeader {
                    line: line.to_string(),
                });
            };
            let key = &line[..index];
            let value = line[index + 1..].trim();
            headers.insert(key.to_string(), value.to_string());
        }
        Ok(Some(headers))
    }

    pub fn try_read_content(&mut self, length: usize) -> Result<Option<String>, FramingError> {
        if self.buffer.len() < length {
            return Ok(None);
        }
        let body: Vec<u8> = self.buffer.drain(..length).collect();
        String::from_utf8(body)
            .map(Some)
            .map_err(|e| FramingError::InvalidUtf8 {
                reason: e.to_string(),
            })
    }

    fn find_separator(&self) -> Option<usize> {
        self.buffer
            .windows(4)
            .position(|w| w[0] == CR && w[1] == LF && w[2] == CR && w[3] == LF)
    }
}

/// Extract the announced body length from a parsed header map.
pub fn content_length(headers: &HashMap<String, String>) -> Result<usize, FramingError> {
    let value = headers
        .get(CONTENT_LENGTH)
        .ok_or(FramingError::MissingContentLength)?;
    value
        .parse::<usize>()
        .map_err(|_| FramingError::InvalidContentLength {
            value: value.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_wait_for_separator() {
        let mut buffer = MessageBuffer::new();
        buffer.append("Content-Length: 5\r\n");
        assert_eq!(buffer.try_read_headers().unwrap(), None);
        buffer.append("\r\nhello");
        let headers = buffer.try_read_headers().unwrap().unwrap();
        assert_eq!(headers.get("Content-Length").map(String::as_str), Some("5"));
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.try_read_content(5).unwrap().as_deref(), Some("hello"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn header_value_split_on_first_colon_and_trimmed() {
        let mut buffer = MessageBuffer::new();
        buffer.append("Content-Type:  application/x: y \r\nContent-Length:3\r\n\r\n");
        let headers = buffer.try_read_headers().unwrap().unwrap();
        assert_eq!(headers["Content-Type"], "application/x: y");
        assert_eq!(headers["Content-Length"], "3");
    }

    #[test]
    fn header_keys_are_case_sensitive() {
        let mut buffer = MessageBuffer::new();
        buffer.append("content-length: 2\r\n\r\n{}");
        let headers = buffer.try_read_headers().unwrap().unwrap();
        assert_eq!(
            content_length(&headers),
            Err(FramingError::MissingContentLength)
        );
    }

    #[test]
    fn line_without_colon_is_invalid() {
        let mut buffer = MessageBuffer::new();
        buffer.append("Content-Length 2\r\n\r\n{}");
        let err = buffer.try_read_headers().unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));
        // the broken block is consumed so the stream can make progress
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn non_numeric_content_length() {
        let mut headers = HashMap::new();
        headers.insert(CONTENT_LENGTH.to_string(), "abc".to_string());
        assert!(matches!(
            content_length(&headers),
            Err(FramingError::InvalidContentLength { .. })
        ));
        headers.insert(CONTENT_LENGTH.to_string(), "-1".to_string());
        assert!(content_length(&headers).is_err());
    }

    #[test]
    fn content_counts_bytes_not_chars() {
        let mut buffer = MessageBuffer::new();
        let text = "caf\u{e9} \u{1F600}";
        buffer.append(text.as_bytes());
        assert_eq!(buffer.try_read_content(text.len() + 1).unwrap(), None);
        assert_eq!(buffer.try_read_content(text.len()).unwrap().as_deref(), Some(text));
    }

    #[test]
    fn grows_past_initial_capacity_without_losing_bytes() {
        let mut buffer = MessageBuffer::new();
        buffer.append("Content-Length: 20000\r\n\r\n");
        let body = "x".repeat(20000);
        buffer.append(&body[..10000]);
        buffer.append(&body[10000..]);
        buffer.try_read_headers().unwrap().unwrap();
        assert_eq!(buffer.try_read_content(20000).unwrap(), Some(body));
    }
}
