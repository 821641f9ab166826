//! Newline framing for byte streams.
//!
//! Bytes go in through [`LineFramer::feed`], complete lines come out of the
//! returned iterator. Whatever follows the last `\n` stays buffered and is
//! prepended to the next read. A fragment that grows past the configured
//! limit without a terminator is dropped up to its next `\n`.

pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Line exceeds {limit} bytes without a terminator ({len} bytes buffered)")]
    FrameTooLarge { len: usize, limit: usize },
}

#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_length: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl LineFramer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_length: max_line_length.max(1),
            discarding: false,
        }
    }

    /// Appends `bytes` and returns the lines they complete.
    ///
    /// Fails with [`FrameError::FrameTooLarge`] when the unterminated tail
    /// outgrows the limit. The oversized fragment is thrown away and the
    /// framer resynchronises on the next newline; lines completed before the
    /// overflow are still returned by the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Lines<'_>, FrameError> {
        let bytes = if self.discarding {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.discarding = false;
                    &bytes[idx + 1..]
                }
                None => {
                    return Ok(Lines {
                        framer: self,
                        consumed: 0,
                    });
                }
            }
        } else {
            bytes
        };

        self.buffer.extend_from_slice(bytes);

        let tail_start = self
            .buffer
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let tail_len = self.buffer.len() - tail_start;

        if tail_len > self.max_line_length {
            self.buffer.truncate(tail_start);
            self.discarding = true;
            return Err(FrameError::FrameTooLarge {
                len: tail_len,
                limit: self.max_line_length,
            });
        }

        Ok(Lines {
            framer: self,
            consumed: 0,
        })
    }

    /// Hands out the unterminated fragment once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        self.discarding = false;
        if self.buffer.is_empty() {
            return None;
        }

        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Lazily splits the buffered bytes. Consumed lines are dropped from the
/// framer when the iterator goes away, so stopping early keeps the rest.
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
    consumed: usize,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.framer.buffer[self.consumed..];
        let idx = rest.iter().position(|&b| b == b'\n')?;
        let line = decode_line(&rest[..idx]);
        self.consumed += idx + 1;
        Some(line)
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        self.framer.buffer.drain(..self.consumed);
    }
}
