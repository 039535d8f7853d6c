//! Line editing for master input while no process is running.

use std::sync::Mutex;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;
const CTRL_C: u8 = 0x03;

/// Result of feeding keystrokes to the bridge.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Edited {
    /// Command lines completed by this input.
    pub lines: Vec<String>,
    /// Bytes to echo back to a terminal-style client.
    pub echo: Vec<u8>,
}

#[derive(Debug, Default)]
struct LineBuffer {
    buffer: Vec<u8>,
    skip_lf: bool,
}

/// Assembles a command line from raw keystrokes.
///
/// `\r`, `\n` and `\r\n` submit the line; backspace/delete erase the last
/// character; Ctrl-C discards the line.
#[derive(Debug, Default)]
pub struct InputBridge {
    state: Mutex<LineBuffer>,
}

impl InputBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, data: &[u8]) -> Edited {
        let mut state = self.state.lock().expect("bridge mutex poisoned");
        let mut edited = Edited::default();

        for &byte in data {
            if std::mem::take(&mut state.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\r' | b'\n' => {
                    state.skip_lf = byte == b'\r';
                    let line = String::from_utf8_lossy(&state.buffer).into_owned();
                    state.buffer.clear();
                    edited.lines.push(line);
                    edited.echo.extend_from_slice(b"\r\n");
                }
                BACKSPACE | DELETE => {
                    if pop_char(&mut state.buffer) {
                        edited.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                CTRL_C => {
                    state.buffer.clear();
                    edited.echo.extend_from_slice(b"^C\r\n");
                }
                _ => {
                    state.buffer.push(byte);
                    edited.echo.push(byte);
                }
            }
        }

        edited
    }

    /// The line typed so far.
    pub fn pending(&self) -> String {
        let state = self.state.lock().expect("bridge mutex poisoned");
        String::from_utf8_lossy(&state.buffer).into_owned()
    }
}

/// Remove the last UTF-8 character. Returns whether anything was removed.
fn pop_char(buffer: &mut Vec<u8>) -> bool {
    let Some(mut idx) = buffer.len().checked_sub(1) else {
        return false;
    };
    // Step back over continuation bytes.
    while idx > 0 && buffer[idx] & 0xC0 == 0x80 {
        idx -= 1;
    }
    buffer.truncate(idx);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_line_across_keystrokes() {
        let bridge = InputBridge::new();
        assert!(bridge.push(b"l").lines.is_empty());
        assert!(bridge.push(b"s").lines.is_empty());
        let edited = bridge.push(b"\r");
        assert_eq!(edited.lines, vec!["ls"]);
        assert_eq!(edited.echo, b"\r\n");
    }

    #[test]
    fn crlf_submits_once() {
        let bridge = InputBridge::new();
        let mut lines = bridge.push(b"pwd\r").lines;
        lines.extend(bridge.push(b"\nls\n").lines);
        assert_eq!(lines, vec!["pwd", "ls"]);
    }

    #[test]
    fn backspace_erases_characters() {
        let bridge = InputBridge::new();
        let edited = bridge.push(b"lx\x7fs\n");
        assert_eq!(edited.lines, vec!["ls"]);
        assert_eq!(edited.echo, b"lx\x08 \x08s\r\n");
    }

    #[test]
    fn backspace_removes_whole_multibyte_char() {
        let bridge = InputBridge::new();
        bridge.push("echo é".as_bytes());
        bridge.push(&[DELETE]);
        assert_eq!(bridge.pending(), "echo ");
    }

    #[test]
    fn backspace_on_empty_line_echoes_nothing() {
        let bridge = InputBridge::new();
        assert!(bridge.push(&[BACKSPACE]).echo.is_empty());
    }

    #[test]
    fn ctrl_c_discards_line() {
        let bridge = InputBridge::new();
        bridge.push(b"rm -rf");
        let edited = bridge.push(&[CTRL_C]);
        assert!(edited.lines.is_empty());
        assert_eq!(bridge.pending(), "");
    }
}
