//! Scripted helper implementation for tests.
//!
//! `MockHelperLauncher` satisfies the same [`HelperLauncher`] seam as the
//! production launcher; each spawn hands the test a [`MockHelper`] it can
//! use to inspect requests, feed stdout/stderr, and end the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, oneshot};

use super::{ExitInfo, HelperHandle, HelperLauncher, LaunchSpec};
use crate::error::SessionError;
use async_trait::async_trait;

/// Launcher that produces scripted helpers. Every `launch` call sends the
/// paired [`MockHelper`] control handle to the receiver returned by
/// [`MockHelperLauncher::new`], so tests observe respawns (hard reset,
/// device switch) as additional received helpers.
pub struct MockHelperLauncher {
    spawned: mpsc::UnboundedSender<MockHelper>,
}

impl MockHelperLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockHelper>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { spawned: tx }, rx)
    }
}

#[async_trait]
impl HelperLauncher for MockHelperLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<HelperHandle, SessionError> {
        let (stdin_client, stdin_server) = tokio::io::duplex(64 * 1024);
        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_req_tx, exit_req_rx) = mpsc::channel::<ExitInfo>(1);

        let killed = Arc::new(AtomicBool::new(false));
        tokio::spawn(relay_exit(exit_req_rx, kill_rx, exit_tx, killed.clone()));

        let helper = MockHelper {
            spec: spec.clone(),
            requests: Some(BufReader::new(stdin_server).lines()),
            stdout_tx,
            stderr_tx,
            exit_tx: exit_req_tx,
            killed,
        };
        self.spawned
            .send(helper)
            .map_err(|_| SessionError::Spawn(std::io::Error::other("mock session dropped")))?;

        Ok(HelperHandle {
            stdin: Box::new(stdin_client),
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            kill: Some(kill_tx),
        })
    }
}

/// A kill beats any still-pending scripted exit and reports as SIGKILL.
async fn relay_exit(
    mut exit_req: mpsc::Receiver<ExitInfo>,
    kill: oneshot::Receiver<()>,
    exit: oneshot::Sender<ExitInfo>,
    killed: Arc<AtomicBool>,
) {
    let info = tokio::select! {
        Some(info) = exit_req.recv() => info,
        _ = kill => {
            killed.store(true, Ordering::SeqCst);
            ExitInfo { code: None, signal: Some(9) }
        }
    };
    let _ = exit.send(info);
}

/// Test-side control handle for one spawned mock helper.
pub struct MockHelper {
    pub spec: LaunchSpec,
    requests: Option<Lines<BufReader<tokio::io::DuplexStream>>>,
    stdout_tx: mpsc::Sender<String>,
    stderr_tx: mpsc::Sender<String>,
    exit_tx: mpsc::Sender<ExitInfo>,
    killed: Arc<AtomicBool>,
}

impl MockHelper {
    /// Next raw request line written by the orchestrator, without the
    /// trailing newline. `None` when the orchestrator closed stdin.
    pub async fn next_request_line(&mut self) -> Option<String> {
        self.requests.as_mut()?.next_line().await.ok().flatten()
    }

    /// Drop the stdin pipe so subsequent orchestrator writes fail, for
    /// exercising the write-failure path.
    pub fn close_stdin(&mut self) {
        self.requests = None;
    }

    /// Next request parsed as JSON; panics on malformed input since that is
    /// a test failure.
    pub async fn expect_request(&mut self) -> serde_json::Value {
        let line = self
            .next_request_line()
            .await
            .expect("orchestrator closed stdin while a request was expected");
        serde_json::from_str(&line).expect("request line was not valid JSON")
    }

    /// Feed a raw stdout chunk to the orchestrator.
    pub async fn emit_stdout(&self, chunk: &str) {
        let _ = self.stdout_tx.send(chunk.to_string()).await;
    }

    /// Feed one stderr line to the orchestrator.
    pub async fn emit_stderr(&self, line: &str) {
        let _ = self.stderr_tx.send(line.to_string()).await;
    }

    /// End the helper with the given exit state.
    pub async fn exit(&self, code: Option<i32>, signal: Option<i32>) {
        let _ = self.exit_tx.send(ExitInfo { code, signal }).await;
    }

    /// Whether the orchestrator force-killed this helper.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
