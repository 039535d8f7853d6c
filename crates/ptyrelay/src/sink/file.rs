//! Append process output to a log file, one line at a time.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::SinkError;
use crate::framer::LineFramer;

struct FileState {
    /// `None` once closed.
    writer: Option<BufWriter<File>>,
    framer: LineFramer,
}

/// Line-framed file appender.
pub struct FileSink {
    path: PathBuf,
    primary: bool,
    state: Mutex<FileState>,
}

impl FileSink {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>, primary: bool) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            primary,
            state: Mutex::new(FileState {
                writer: Some(BufWriter::new(file)),
                framer: LineFramer::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn is_primary(&self) -> bool {
        self.primary
    }

    pub(super) fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        let mut state = self.state.lock().expect("file sink mutex poisoned");
        let lines = state.framer.push(data);
        let writer = state.writer.as_mut().ok_or(SinkError::Closed)?;
        for line in lines {
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }

    pub(super) fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut state = self.state.lock().expect("file sink mutex poisoned");
        let tail = state.framer.take_pending();
        let writer = state.writer.as_mut().ok_or(SinkError::Closed)?;
        if let Some(tail) = tail {
            writeln!(writer, "{tail}")?;
        }
        writeln!(writer, "{line}")?;
        Ok(())
    }

    pub(super) fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().expect("file sink mutex poisoned");
        let tail = state.framer.take_pending();
        let writer = state.writer.as_mut().ok_or(SinkError::Closed)?;
        if let Some(tail) = tail {
            writeln!(writer, "{tail}")?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    pub(super) fn close(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().expect("file sink mutex poisoned");
        let tail = state.framer.take_pending();
        let Some(mut writer) = state.writer.take() else {
            return Ok(());
        };
        if let Some(tail) = tail {
            writeln!(writer, "{tail}")?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_framed_lines_and_tail_on_flush() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/task.log");
        let sink = FileSink::open(&path, true).unwrap();

        sink.write_line("% make").unwrap();
        sink.write(b"building\r\nlinking").unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "% make\nbuilding\nlinking\n");
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("task.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let sink = FileSink::open(&path, false).unwrap();
        sink.write(b"later\n").unwrap();
        sink.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "earlier\nlater\n");
    }

    #[test]
    fn write_after_close_fails() {
        let tmp = TempDir::new().unwrap();
        let sink = FileSink::open(tmp.path().join("task.log"), false).unwrap();
        sink.close().unwrap();

        assert!(matches!(sink.write(b"x\n"), Err(SinkError::Closed)));
        assert!(sink.close().is_ok());
    }
}
