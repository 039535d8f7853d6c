//! Line framing for text-mode transports and log sinks.
//!
//! Raw process output arrives in arbitrary chunks. [`LineFramer`] accumulates
//! those bytes and hands back completed lines without their terminators.
//!
//! A line ends at the first `\n` or `\r` in the buffer. `\r\n` is a single
//! terminator, including when the `\r` and the `\n` arrive in different chunks,
//! so the emitted lines do not depend on how the stream was split.
//!
//! A line longer than [`MAX_LINE_BYTES`] is cut into pieces of that size so
//! output without terminators cannot grow the buffer without bound.

/// Longest line kept in the buffer before it is emitted as is.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Accumulates bytes and splits them into lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Last chunk ended on `\r`; a leading `\n` in the next chunk belongs to it.
    skip_lf: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut data = data;
        if self.skip_lf && !data.is_empty() {
            if data[0] == b'\n' {
                data = &data[1..];
            }
            self.skip_lf = false;
        }
        // Everything already buffered is an unterminated tail; only the new
        // bytes can hold a terminator.
        let mut i = self.buffer.len();
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        while i < self.buffer.len() {
            match self.buffer[i] {
                b'\n' => {
                    lines.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    lines.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
                    i += 1;
                    match self.buffer.get(i) {
                        Some(b'\n') => i += 1,
                        Some(_) => {}
                        None => self.skip_lf = true,
                    }
                    start = i;
                }
                _ => {
                    i += 1;
                    if i - start == MAX_LINE_BYTES {
                        lines.push(String::from_utf8_lossy(&self.buffer[start..i]).into_owned());
                        start = i;
                    }
                }
            }
        }
        self.buffer.drain(..start);
        lines
    }

    /// Content received after the last terminator.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Take the unterminated remainder, if any, leaving the framer empty.
    pub fn take_pending(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(rest)
    }
}
