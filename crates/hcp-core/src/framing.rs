use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame is not valid utf-8: {0}")]
    InvalidUtf8(String),
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Result of feeding one chunk of text through [`feed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fed {
    pub lines: Vec<String>,
    pub remainder: String,
}

/// Splits `remainder + chunk` into complete lines.
///
/// Lines are returned without their `\n` or `\r\n` terminator. Everything after
/// the last `\n` comes back as the new remainder, so a `\r` that arrives in one
/// chunk and its `\n` in the next still form a single terminator.
pub fn feed(remainder: &str, chunk: &str) -> Fed {
    let mut buffer = String::with_capacity(remainder.len() + chunk.len());
    buffer.push_str(remainder);
    buffer.push_str(chunk);

    let mut lines = Vec::new();
    let mut start = 0;
    while let Some(offset) = buffer[start..].find('\n') {
        let end = start + offset;
        lines.push(strip_carriage_return(&buffer[start..end]).to_string());
        start = end + 1;
    }

    Fed {
        lines,
        remainder: buffer[start..].to_string(),
    }
}

fn strip_carriage_return(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBatch {
    pub lines: Vec<String>,
    pub errors: Vec<FrameError>,
}

impl FrameBatch {
    fn push_line(&mut self, line: String) {
        self.lines.push(line);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Byte-level line framer owned by a single connection.
///
/// UTF-8 is only validated once a line is complete, so a chunk boundary may
/// fall anywhere inside a multibyte character.
#[derive(Debug)]
pub struct LineFramer {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            discarding: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> FrameBatch {
        let mut batch = FrameBatch::default();
        let mut rest = chunk;

        while let Some(newline_idx) = rest.iter().position(|byte| *byte == b'\n') {
            let (head, tail) = rest.split_at(newline_idx);
            rest = &tail[1..];

            if self.discarding {
                // Tail of a line already reported as oversized.
                self.discarding = false;
                self.pending.clear();
                continue;
            }

            self.pending.extend_from_slice(head);
            let frame = std::mem::take(&mut self.pending);
            self.complete_line(frame, &mut batch);
        }

        if !rest.is_empty() && !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > self.max_frame_bytes {
                batch.push_error(FrameError::OversizedBuffer {
                    size: self.pending.len(),
                    max: self.max_frame_bytes,
                });
                self.pending.clear();
                self.discarding = true;
            }
        }

        batch
    }

    /// Bytes received after the last complete line.
    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }

    fn complete_line(&self, mut frame: Vec<u8>, batch: &mut FrameBatch) {
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        if frame.len() > self.max_frame_bytes {
            batch.push_error(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match String::from_utf8(frame) {
            Ok(line) => batch.push_line(line),
            Err(err) => batch.push_error(FrameError::InvalidUtf8(err.utf8_error().to_string())),
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
