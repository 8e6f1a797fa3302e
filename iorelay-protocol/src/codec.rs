//! Line-delimited JSON codec.

use crate::error::ProtocolError;
use crate::MAX_LINE_SIZE;

/// Encodes a value as a JSON line.
pub fn encode_line<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Line-delimited JSON decoder.
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    /// Creates a decoder that rejects lines longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_line,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next JSON line.
    ///
    /// Blank lines are skipped. An unterminated line longer than the limit is
    /// an error so a peer cannot grow the buffer without bound.
    pub fn decode_line<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, ProtocolError> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > self.max_line {
                    return Err(ProtocolError::LineTooLarge {
                        size: self.buffer.len(),
                        max: self.max_line,
                    });
                }
                return Ok(None);
            };

            let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
            if line.len() - 1 > self.max_line {
                return Err(ProtocolError::LineTooLarge {
                    size: line.len() - 1,
                    max: self.max_line,
                });
            }
            let json =
                std::str::from_utf8(&line[..line.len() - 1]).map_err(|_| ProtocolError::InvalidUtf8)?;
            let json = json.trim();
            if json.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(json)?));
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
