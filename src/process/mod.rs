//! Helper child-process supervision.
//!
//! The session never touches a serial port itself; it spawns the helper
//! executable and owns its piped stdio. This module provides the
//! [`HelperLauncher`] seam (dependency injection, mirrored by
//! [`mock::MockHelperLauncher`] for tests) and the production
//! Tokio-backed implementation.

pub mod mock;

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::error::SessionError;

/// How the helper is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperMode {
    /// Long-lived request/response session on one device.
    Interactive,
    /// One-shot port enumeration; the helper prints ports and exits.
    ScanPorts,
    /// Post-reset session that first streams device boot output.
    Listen,
}

/// Everything needed to start one helper process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub device: String,
    pub baud_rate: u32,
    pub mode: HelperMode,
}

impl LaunchSpec {
    pub fn interactive(config: &SessionConfig) -> Self {
        Self::for_mode(config, HelperMode::Interactive)
    }

    pub fn scan_ports(config: &SessionConfig) -> Self {
        Self::for_mode(config, HelperMode::ScanPorts)
    }

    pub fn listen(config: &SessionConfig) -> Self {
        Self::for_mode(config, HelperMode::Listen)
    }

    fn for_mode(config: &SessionConfig, mode: HelperMode) -> Self {
        Self {
            program: config.helper_path.clone(),
            working_dir: config.effective_install_dir().map(PathBuf::from),
            device: config.device.clone(),
            baud_rate: config.baud_rate,
            mode,
        }
    }

    /// Helper argv for this mode.
    pub fn argv(&self) -> Vec<String> {
        match self.mode {
            HelperMode::ScanPorts => vec!["--scan-ports".to_string()],
            HelperMode::Interactive => vec![
                "-d".to_string(),
                self.device.clone(),
                "-b".to_string(),
                self.baud_rate.to_string(),
            ],
            HelperMode::Listen => vec![
                "-d".to_string(),
                self.device.clone(),
                "-b".to_string(),
                self.baud_rate.to_string(),
                "--listen".to_string(),
            ],
        }
    }
}

/// Terminal state of a helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit state when the supervisor vanished without reporting.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

/// A running helper: stdin writer, stdout/stderr streams, exit notification,
/// and a kill switch. Stdout is delivered as raw chunks because interactive
/// operations stream character-by-character; line splitting is up to the
/// consumer.
pub struct HelperHandle {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: mpsc::Receiver<String>,
    pub stderr: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<ExitInfo>,
    kill: Option<oneshot::Sender<()>>,
}

impl HelperHandle {
    /// Write one UTF-8 line (newline appended by the caller) to helper stdin.
    pub async fn write_all(&mut self, data: &str) -> std::io::Result<()> {
        self.stdin.write_all(data.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// Ask the supervisor to kill the child. Idempotent.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Seam for spawning helpers, implemented by [`TokioHelperLauncher`] in
/// production and [`mock::MockHelperLauncher`] in tests.
#[async_trait]
pub trait HelperLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<HelperHandle, SessionError>;
}

/// Production launcher backed by `tokio::process`.
pub struct TokioHelperLauncher;

#[async_trait]
impl HelperLauncher for TokioHelperLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<HelperHandle, SessionError> {
        tracing::debug!(
            program = %spec.program.display(),
            args = ?spec.argv(),
            "spawning helper"
        );

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(spec.argv());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Keep the console hidden on platforms that would otherwise pop one
        // per helper spawn.
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SessionError::HelperNotFound(spec.program.clone())
            } else {
                SessionError::Spawn(err)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn(std::io::Error::other("helper stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn(std::io::Error::other("helper stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Spawn(std::io::Error::other("helper stderr not piped")))?;

        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        tokio::spawn(pump_chunks(stdout, stdout_tx));

        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        tokio::spawn(pump_lines(stderr, stderr_tx));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, kill_rx, exit_tx));

        Ok(HelperHandle {
            stdin: Box::new(stdin),
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            kill: Some(kill_tx),
        })
    }
}

/// Forward stdout as decoded chunks, carrying incomplete UTF-8 sequences
/// across reads so multi-byte characters are never torn.
async fn pump_chunks(stream: impl AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut carry: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    let mut stream = stream;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let text = drain_valid_utf8(&mut carry);
                if !text.is_empty() && tx.send(text).await.is_err() {
                    break;
                }
            }
        }
    }
    // Whatever is left is a truncated sequence at stream end.
    if !carry.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&carry).into_owned()).await;
    }
}

/// Decode the longest valid prefix, replacing invalid interior sequences and
/// retaining a truncated trailing sequence for the next read.
fn drain_valid_utf8(carry: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry) {
            Ok(text) => {
                out.push_str(text);
                carry.clear();
                return out;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + bad);
                    }
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

async fn pump_lines(stream: impl AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Wait for the child, honoring kill requests, and report how it ended.
async fn supervise(
    mut child: tokio::process::Child,
    mut kill: oneshot::Receiver<()>,
    exit: oneshot::Sender<ExitInfo>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut kill => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(err) = child.start_kill() {
                tracing::warn!(%err, "failed to kill helper");
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => {
            let signal = {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                }
                #[cfg(not(unix))]
                {
                    None
                }
            };
            ExitInfo {
                code: status.code(),
                signal,
            }
        }
        Err(err) => {
            tracing::warn!(%err, "failed to wait for helper");
            ExitInfo::unknown()
        }
    };

    tracing::debug!(code = ?info.code, signal = ?info.signal, "helper exited");
    let _ = exit.send(info);
}
