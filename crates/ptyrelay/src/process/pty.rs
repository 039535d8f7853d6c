use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use sha2::{Digest, Sha256};
use tokio::task;
use tracing::{debug, info, warn};

use super::{ProcessError, ProcessListener, ProcessSpec};
use crate::status::{Status, StatusUpdateEvent};

const READ_CHUNK: usize = 4096;

/// Handle to a command running on its own PTY.
pub struct PtyProcess {
    task_id: u64,
    pid: Option<u32>,
    status: Mutex<Status>,
    interrupted: AtomicBool,
    interrupt_grace: Option<Duration>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Held so the reader sees EOF only once the child side closes.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyProcess {
    /// Start `spec` and begin delivering output and status to `listener`.
    ///
    /// `listener` sees NEW → RUNNING before this returns.
    pub fn spawn(
        spec: ProcessSpec,
        listener: Arc<dyn ProcessListener>,
    ) -> Result<Arc<Self>, ProcessError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_failed)?;
        let reader = pair.master.try_clone_reader().map_err(spawn_failed)?;
        let writer = pair.master.take_writer().map_err(spawn_failed)?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        cmd.arg("-c");
        cmd.arg(&spec.command_line);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        let mut child = pair.slave.spawn_command(cmd).map_err(spawn_failed)?;
        drop(pair.slave);

        let pid = child.process_id();
        info!(task_id = spec.task_id, pid = ?pid, command = %spec.command_line, "Process started");

        let process = Arc::new(Self {
            task_id: spec.task_id,
            pid,
            status: Mutex::new(Status::New),
            interrupted: AtomicBool::new(false),
            interrupt_grace: spec.interrupt_grace,
            writer: Mutex::new(writer),
            killer: Mutex::new(child.clone_killer()),
            _master: Mutex::new(pair.master),
        });
        process.transition(
            StatusUpdateEvent::new(spec.task_id, Status::Running),
            listener.as_ref(),
        );

        let reader_listener = Arc::clone(&listener);
        task::spawn_blocking(move || read_output(reader, reader_listener.as_ref()));

        let waiter = Arc::clone(&process);
        task::spawn_blocking(move || {
            let event = match child.wait() {
                Ok(exit) => waiter.exit_event(exit.success(), exit.exit_code()),
                Err(e) => {
                    warn!(task_id = waiter.task_id, error = %e, "Failed to wait on child");
                    StatusUpdateEvent::new(waiter.task_id, Status::Failed)
                        .with_message(format!("wait failed: {e}"))
                }
            };
            info!(task_id = waiter.task_id, status = %event.new_status, "Process exited");
            waiter.transition(event, listener.as_ref());
        });

        Ok(process)
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> Status {
        *self.status.lock().expect("status mutex poisoned")
    }

    /// Forward input to the process's terminal.
    pub fn write_stdin(&self, data: &[u8]) -> Result<(), ProcessError> {
        if self.status().is_final() {
            return Err(ProcessError::NotRunning);
        }
        let mut writer = self.writer.lock().expect("pty writer mutex poisoned");
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Ask the process to stop (SIGINT to its process group). If it is
    /// still running after the configured grace period it is killed.
    pub fn interrupt(self: &Arc<Self>) -> Result<(), ProcessError> {
        if self.status().is_final() {
            return Err(ProcessError::NotRunning);
        }
        self.interrupted.store(true, Ordering::SeqCst);
        self.signal_interrupt()?;
        debug!(task_id = self.task_id, "Interrupt sent");

        if let Some(grace) = self.interrupt_grace {
            let process = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if process.status().is_final() {
                    return;
                }
                warn!(task_id = process.task_id, "Process ignored interrupt, killing");
                if let Err(e) = process.kill() {
                    warn!(task_id = process.task_id, error = %e, "Failed to kill process");
                }
            });
        }
        Ok(())
    }

    /// Terminate the process immediately.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.killer
            .lock()
            .expect("killer mutex poisoned")
            .kill()?;
        Ok(())
    }

    #[cfg(unix)]
    fn signal_interrupt(&self) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return self.kill();
        };
        // SAFETY: killpg only sends a signal. The child is a session leader
        // (setsid on spawn) so its pid is also its process group id.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGINT) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal_interrupt(&self) -> Result<(), ProcessError> {
        self.kill()
    }

    fn exit_event(&self, success: bool, code: u32) -> StatusUpdateEvent {
        if success {
            StatusUpdateEvent::new(self.task_id, Status::Completed)
        } else if self.interrupted.load(Ordering::SeqCst) {
            StatusUpdateEvent::new(self.task_id, Status::Interrupted)
        } else {
            StatusUpdateEvent::new(self.task_id, Status::Failed)
                .with_message(format!("exit code {code}"))
        }
    }

    /// Apply a transition and notify. Final states are sticky.
    fn transition(&self, event: StatusUpdateEvent, listener: &dyn ProcessListener) {
        let old = {
            let mut status = self.status.lock().expect("status mutex poisoned");
            let old = *status;
            if old.is_final() {
                return;
            }
            *status = event.new_status;
            old
        };
        listener.on_status(old, event);
    }
}

fn read_output(mut reader: Box<dyn Read + Send>, listener: &dyn ProcessListener) {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buffer[..n]);
                listener.on_stdout(&buffer[..n]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO once every handle on the child side is closed.
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
    listener.on_stdout_closed(format!("{:x}", hasher.finalize()));
}

fn spawn_failed(e: impl std::fmt::Display) -> ProcessError {
    ProcessError::SpawnFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug)]
    enum Recorded {
        Stdout(Vec<u8>),
        Closed(String),
        Status(Status, StatusUpdateEvent),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Recorded>,
    }

    impl ProcessListener for Recorder {
        fn on_stdout(&self, data: &[u8]) {
            let _ = self.tx.send(Recorded::Stdout(data.to_vec()));
        }

        fn on_stdout_closed(&self, checksum: String) {
            let _ = self.tx.send(Recorded::Closed(checksum));
        }

        fn on_status(&self, old: Status, event: StatusUpdateEvent) {
            let _ = self.tx.send(Recorded::Status(old, event));
        }
    }

    struct Outcome {
        output: Vec<u8>,
        checksum: String,
        transitions: Vec<(Status, Status)>,
        final_event: StatusUpdateEvent,
    }

    fn spec(command: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new(1, command);
        spec.shell = "sh".to_string();
        spec
    }

    fn start(spec: ProcessSpec) -> (Arc<PtyProcess>, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let process = PtyProcess::spawn(spec, Arc::new(Recorder { tx })).unwrap();
        (process, rx)
    }

    async fn finish(mut rx: mpsc::UnboundedReceiver<Recorded>) -> Outcome {
        let mut output = Vec::new();
        let mut checksum = None;
        let mut transitions = Vec::new();
        let mut final_event = None;

        while checksum.is_none() || final_event.is_none() {
            let item = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("process did not finish in time")
                .expect("listener dropped");
            match item {
                Recorded::Stdout(data) => output.extend(data),
                Recorded::Closed(sum) => checksum = Some(sum),
                Recorded::Status(old, event) => {
                    transitions.push((old, event.new_status));
                    if event.new_status.is_final() {
                        final_event = Some(event);
                    }
                }
            }
        }

        Outcome {
            output,
            checksum: checksum.unwrap(),
            transitions,
            final_event: final_event.unwrap(),
        }
    }

    #[tokio::test]
    async fn echo_completes_with_output_and_checksum() {
        let (_process, rx) = start(spec("echo hello"));
        let outcome = finish(rx).await;

        assert!(String::from_utf8_lossy(&outcome.output).contains("hello"));
        assert_eq!(outcome.final_event.new_status, Status::Completed);
        assert_eq!(
            outcome.transitions,
            vec![
                (Status::New, Status::Running),
                (Status::Running, Status::Completed)
            ]
        );
        assert_eq!(outcome.checksum, format!("{:x}", Sha256::digest(&outcome.output)));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_code() {
        let (_process, rx) = start(spec("exit 3"));
        let outcome = finish(rx).await;

        assert_eq!(outcome.final_event.new_status, Status::Failed);
        assert_eq!(outcome.final_event.message.as_deref(), Some("exit code 3"));
    }

    #[tokio::test]
    async fn interrupt_stops_long_running_process() {
        let (process, rx) = start(spec("sleep 30"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.interrupt().unwrap();
        let outcome = finish(rx).await;

        assert_eq!(outcome.final_event.new_status, Status::Interrupted);
        assert!(matches!(
            process.write_stdin(b"x"),
            Err(ProcessError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn stdin_reaches_process() {
        let (process, rx) = start(spec("read line; echo got:$line"));
        process.write_stdin(b"ping\n").unwrap();
        let outcome = finish(rx).await;

        assert!(String::from_utf8_lossy(&outcome.output).contains("got:ping"));
        assert_eq!(outcome.final_event.new_status, Status::Completed);
    }

    #[tokio::test]
    async fn missing_shell_fails_to_spawn() {
        let mut spec = spec("true");
        spec.shell = "/nonexistent/shell".to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(PtyProcess::spawn(spec, Arc::new(Recorder { tx })).is_err());
    }
}
