//! Managed Process - one supervised OS process with piped stdio
//!
//! The handle exclusively owns the child:
//! - stdout/stderr are drained by one reader task per stream
//! - stdin lines go through a single writer task
//! - a waiter task owns the `Child` and reports the exit status
//!
//! Dropping the handle kills a process that is still running, so the
//! OS process and its descriptors never outlive their owner.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{mpsc, watch};

use crate::console::LogSource;
use super::process::{request_terminate, LaunchSpec, ProcessError, ProcessExit, SpawnError};

/// Upper bound for handing a line to the stdin writer.
const STDIN_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the stdin queue.
const STDIN_QUEUE: usize = 256;

/// One raw line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: LogSource,
    pub text: String,
}

/// Output of one spawn, stdout and stderr interleaved in arrival order.
///
/// Ends once both pipes are closed. A new spawn yields a new sequence.
pub struct OutputLines {
    rx: mpsc::UnboundedReceiver<OutputLine>,
}

impl OutputLines {
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

/// Cloneable view of the exit status, usable without holding the handle.
#[derive(Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<ProcessExit>>,
}

impl ExitSignal {
    /// Exit status if the process has already ended.
    pub fn get(&self) -> Option<ProcessExit> {
        *self.rx.borrow()
    }

    /// Wait until the process has ended.
    pub async fn wait(&mut self) -> ProcessExit {
        match self.rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or_else(ProcessExit::unknown),
            Err(_) => ProcessExit::unknown(),
        }
    }
}

pub struct ManagedProcess {
    alias: String,
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: mpsc::Sender<()>,
    exit: ExitSignal,
    stop_command: Option<String>,
    grace_period: Duration,
}

impl ManagedProcess {
    /// Spawn the process described by `spec`.
    ///
    /// Must be called from within a tokio runtime; the stdio tasks are
    /// spawned onto it.
    pub fn spawn(alias: &str, spec: &LaunchSpec) -> Result<(Self, OutputLines), SpawnError> {
        let program = spec.program.to_string_lossy().into_owned();

        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| SpawnError::from_io(&program, e))?;
        let pid = child.id().unwrap_or_default();

        let (line_tx, line_rx) = mpsc::unbounded_channel::<OutputLine>();
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE);
        let (kill_tx, kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel::<Option<ProcessExit>>(None);

        // ── stdout / stderr readers ──────────────────────────
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, LogSource::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, LogSource::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        // ── stdin writer ─────────────────────────────────────
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_lines(stdin, stdin_rx));
        }

        // ── process waiter ───────────────────────────────────
        {
            let alias = alias.to_string();
            tokio::spawn(async move {
                let exit = wait_or_kill(&mut child, kill_rx).await;
                tracing::info!("[{}] Process {} exited with {}", alias, pid, exit);
                let _ = exit_tx.send(Some(exit));
            });
        }

        tracing::info!("[{}] Process started with PID {}: {}", alias, pid, spec.command_line());

        let process = Self {
            alias: alias.to_string(),
            pid,
            stdin_tx,
            kill_tx,
            exit: ExitSignal { rx: exit_rx },
            stop_command: spec.stop_command.clone(),
            grace_period: spec.grace_period,
        };
        Ok((process, OutputLines { rx: line_rx }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.exit.get().is_none()
    }

    pub fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }

    pub async fn wait_for_exit(&self) -> ProcessExit {
        self.exit.clone().wait().await
    }

    /// Write one line to the process's stdin. A trailing newline is added.
    pub async fn write_line(&self, text: &str) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        let line = text.trim_end_matches(['\r', '\n']).to_string();
        self.stdin_tx
            .send_timeout(line, STDIN_SEND_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ProcessError::InputStalled,
                mpsc::error::SendTimeoutError::Closed(_) => ProcessError::NotRunning,
            })
    }

    /// Stop the process and wait for it to be reaped.
    ///
    /// Graceful: write the stop command (or send SIGTERM when none is
    /// configured), wait up to the grace period, then kill.
    /// Non-graceful: kill immediately.
    pub async fn terminate(&self, graceful: bool) -> ProcessExit {
        if let Some(exit) = self.exit.get() {
            return exit;
        }

        if graceful {
            match &self.stop_command {
                Some(command) => {
                    tracing::info!("[{}] Sending stop command '{}'", self.alias, command);
                    if let Err(e) = self.write_line(command).await {
                        tracing::warn!("[{}] Could not send stop command: {}", self.alias, e);
                    }
                }
                None => request_terminate(self.pid),
            }

            let mut exit = self.exit.clone();
            match tokio::time::timeout(self.grace_period, exit.wait()).await {
                Ok(exit) => return exit,
                Err(_) => tracing::warn!(
                    "[{}] Process {} did not stop within {:?}, killing",
                    self.alias,
                    self.pid,
                    self.grace_period
                ),
            }
        }

        let _ = self.kill_tx.try_send(());
        self.wait_for_exit().await
    }
}

async fn read_lines<R>(stream: R, source: LogSource, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                // 수신측이 없어도 파이프는 계속 비워야 프로세스가 멈추지 않음
                let _ = tx.send(OutputLine { source, text });
            }
            Err(e) => {
                tracing::debug!("{:?} reader stopped: {}", source, e);
                break;
            }
        }
    }
}

async fn write_lines(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let data = format!("{}\n", line);
        if stdin.write_all(data.as_bytes()).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Wait for the child; a kill request (or the handle being dropped) kills it first.
async fn wait_or_kill(child: &mut Child, mut kill_rx: mpsc::Receiver<()>) -> ProcessExit {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx.recv() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill process: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => ProcessExit::from_status(status),
        Err(e) => {
            tracing::warn!("Failed to wait for process: {}", e);
            ProcessExit::unknown()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str, stop_command: Option<&str>, grace_ms: u64) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
            env: vec![("GREETING".into(), "hello".into())],
            stop_command: stop_command.map(String::from),
            grace_period: Duration::from_millis(grace_ms),
        }
    }

    async fn collect(mut lines: OutputLines) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_output_streams_are_tagged() {
        let spec = sh("echo \"$GREETING\"; echo oops 1>&2", None, 1000);
        let (process, lines) = ManagedProcess::spawn("t", &spec).unwrap();
        let out = collect(lines).await;

        assert!(out.contains(&OutputLine { source: LogSource::Stdout, text: "hello".into() }));
        assert!(out.contains(&OutputLine { source: LogSource::Stderr, text: "oops".into() }));

        let exit = process.wait_for_exit().await;
        assert!(exit.success);
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_write_line_roundtrip() {
        let spec = sh("read line; echo \"got $line\"", None, 1000);
        let (process, mut lines) = ManagedProcess::spawn("t", &spec).unwrap();

        process.write_line("ping").await.unwrap();
        let line = lines.next_line().await.unwrap();
        assert_eq!(line.text, "got ping");

        process.wait_for_exit().await;
        assert_eq!(process.write_line("late").await, Err(ProcessError::NotRunning));
    }

    #[tokio::test]
    async fn test_graceful_stop_command() {
        let script = "while read line; do if [ \"$line\" = stop ]; then exit 0; fi; done";
        let (process, _lines) = ManagedProcess::spawn("t", &sh(script, Some("stop"), 5000)).unwrap();

        let exit = process.terminate(true).await;
        assert!(exit.success);
    }

    #[tokio::test]
    async fn test_graceful_times_out_then_kills() {
        // stop 명령을 무시하는 프로세스
        let script = "trap '' TERM; while true; do sleep 1; done";
        let (process, _lines) = ManagedProcess::spawn("t", &sh(script, Some("stop"), 200)).unwrap();

        let started = std::time::Instant::now();
        let exit = process.terminate(true).await;
        assert!(!exit.success);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_forced_kill() {
        let (process, _lines) = ManagedProcess::spawn("t", &sh("sleep 30", None, 10_000)).unwrap();
        assert!(process.is_running());
        assert!(process.pid() > 0);

        let exit = process.terminate(false).await;
        assert!(!exit.success);
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let (process, _lines) = ManagedProcess::spawn("t", &sh("sleep 30", None, 10_000)).unwrap();
        let mut signal = process.exit_signal();
        drop(process);

        let exit = tokio::time::timeout(Duration::from_secs(5), signal.wait()).await.unwrap();
        assert!(!exit.success);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let mut spec = sh("true", None, 1000);
        spec.program = PathBuf::from("/definitely/not/a/program");
        assert!(matches!(
            ManagedProcess::spawn("t", &spec),
            Err(SpawnError::NotFound { .. })
        ));
    }
}
