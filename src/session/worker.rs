//! Session event loop.
//!
//! One task per session owns the helper handle, the read buffer, and the
//! operation queue. Caller requests, helper stdout/stderr, and child exit
//! all funnel through a single `select!`, which is what guarantees the
//! single-active invariant without any locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::ops::machine::{Actions, OpMachine, Step};
use crate::ops::{CommandResult, OpKind, OpResult, Operation, ProgressFn};
use crate::process::{ExitInfo, HelperHandle, HelperLauncher, LaunchSpec};
use crate::protocol::{encode_request, is_boot_wait_notice, Request, EOO};
use crate::queue::OpQueue;

use super::SessionEvents;

/// Requests from the session facade to the worker.
pub(crate) enum Cmd {
    Enqueue(Operation),
    SwitchDevice {
        device: String,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        graceful: bool,
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Cmd(Option<Cmd>),
    Stdout(Option<String>),
    Stderr(Option<String>),
    Exit(ExitInfo),
}

pub(crate) struct Worker {
    config: SessionConfig,
    launcher: Arc<dyn HelperLauncher>,
    helper: Option<HelperHandle>,
    stdout_closed: bool,
    stderr_closed: bool,
    connected: Arc<AtomicBool>,
    queue: OpQueue,
    buffer: String,
    /// Follow callback of a hard reset spawned with `--listen`; while set,
    /// stdout is boot output for the caller, not operation output.
    listen_follow: Option<ProgressFn>,
    listen_buffer: String,
    events: SessionEvents,
    cmd_rx: mpsc::Receiver<Cmd>,
}

impl Worker {
    pub(crate) fn new(
        config: SessionConfig,
        launcher: Arc<dyn HelperLauncher>,
        helper: HelperHandle,
        connected: Arc<AtomicBool>,
        events: SessionEvents,
        cmd_rx: mpsc::Receiver<Cmd>,
    ) -> Self {
        Self {
            config,
            launcher,
            helper: Some(helper),
            stdout_closed: false,
            stderr_closed: false,
            connected,
            queue: OpQueue::new(),
            buffer: String::new(),
            listen_follow: None,
            listen_buffer: String::new(),
            events,
            cmd_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let event = {
                let (stdout, stderr, exit) = match self.helper.as_mut() {
                    Some(h) => (
                        (!self.stdout_closed).then_some(&mut h.stdout),
                        (!self.stderr_closed).then_some(&mut h.stderr),
                        Some(&mut h.exit),
                    ),
                    None => (None, None, None),
                };
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Event::Cmd(cmd),
                    chunk = recv_opt(stdout) => Event::Stdout(chunk),
                    line = recv_opt(stderr) => Event::Stderr(line),
                    info = exit_opt(exit) => Event::Exit(info),
                }
            };

            match event {
                Event::Cmd(None) => {
                    self.shutdown();
                    break;
                }
                Event::Cmd(Some(cmd)) => self.handle_cmd(cmd).await,
                Event::Stdout(Some(chunk)) => self.handle_stdout(chunk).await,
                Event::Stdout(None) => self.stdout_closed = true,
                Event::Stderr(Some(line)) => self.handle_stderr(line),
                Event::Stderr(None) => self.stderr_closed = true,
                Event::Exit(info) => self.handle_exit(info).await,
            }
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Enqueue(mut op) => {
                if !self.connected() || self.helper.is_none() {
                    op.resolve(None);
                    return;
                }
                // A status probe is a no-op while other work is queued; the
                // device being responsive is already implied.
                if op.kind == OpKind::CheckStatus && self.queue.is_busy() {
                    op.resolve(None);
                    return;
                }
                self.queue.enqueue(op);
                if !self.queue.has_active() && self.listen_follow.is_none() {
                    self.dispatch_next().await;
                }
            }
            Cmd::SwitchDevice { device, done } => {
                let result = self.switch_device(device).await;
                let _ = done.send(result);
            }
            Cmd::Disconnect { graceful, done } => {
                self.disconnect(graceful).await;
                let _ = done.send(());
            }
        }
    }

    /// Dispatch queued operations until one takes the active slot. Write
    /// failures resolve the affected caller with the sentinel and move on.
    async fn dispatch_next(&mut self) {
        loop {
            if self.queue.has_active() || self.listen_follow.is_some() {
                return;
            }
            let Some(mut op) = self.queue.take_next() else {
                return;
            };
            self.buffer.clear();
            let line = encode_request(&op.request);
            let wrote = match self.helper.as_mut() {
                Some(helper) => match helper.write_all(&line).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(op_id = op.id, %err, "request write failed");
                        false
                    }
                },
                None => false,
            };
            if !wrote {
                op.resolve(None);
                continue;
            }
            if op.kind == OpKind::Exit {
                // No reply is expected for an exit request.
                op.resolve(None);
                continue;
            }
            self.queue.set_active(op);
            return;
        }
    }

    async fn handle_stdout(&mut self, chunk: String) {
        if self.listen_follow.is_some() {
            self.handle_listen_chunk(chunk).await;
            return;
        }
        self.buffer.push_str(&chunk);
        let streams_raw = match self.queue.active_mut() {
            Some(op) => op.streams_raw,
            None => {
                tracing::trace!(buffered = self.buffer.len(), "stdout outside any operation");
                return;
            }
        };
        // Interactive kinds stream character-by-character; everything else
        // waits for a line boundary before parsing.
        if chunk.contains('\n') || streams_raw {
            self.step_active().await;
        }
    }

    async fn step_active(&mut self) {
        let mut actions = Actions::default();
        let step = match self.queue.active_mut() {
            Some(op) => op.machine.feed(&mut self.buffer, &mut actions),
            None => return,
        };

        if actions.nudge_stdin {
            if let Some(helper) = self.helper.as_mut() {
                if let Err(err) = helper.write_all("\n").await {
                    tracing::warn!(%err, "failed to nudge helper stdin");
                }
            }
        }
        if !actions.progress.is_empty() {
            if let Some(op) = self.queue.active_mut() {
                if let Some(follow) = op.follow.as_mut() {
                    for line in actions.progress {
                        follow(line);
                    }
                }
            }
        }

        match step {
            Step::Pending => {}
            Step::Done(result) => {
                self.finish_active(result);
                self.dispatch_next().await;
            }
            Step::DoneDisconnect(result) => {
                self.finish_active(result);
                self.drop_helper_connection().await;
            }
            Step::DoneFatal { result, exit_code } => {
                self.finish_active(result);
                self.force_fatal_exit(exit_code);
            }
        }
    }

    fn finish_active(&mut self, result: OpResult) {
        if let Some(mut op) = self.queue.take_active() {
            tracing::debug!(op_id = op.id, kind = ?op.kind, "operation complete");
            op.resolve(Some(result));
        }
    }

    fn handle_stderr(&mut self, line: String) {
        tracing::warn!(helper_stderr = %line);
        if let Some(sink) = self.events.on_stderr.as_mut() {
            sink(line);
        }
    }

    async fn handle_exit(&mut self, info: ExitInfo) {
        self.helper = None;
        self.stdout_closed = false;
        self.stderr_closed = false;

        if self.queue.active_kind() == Some(OpKind::HardReset) {
            if let Some(op) = self.queue.take_active() {
                self.respawn_after_reset(op).await;
            }
            return;
        }

        tracing::warn!(code = ?info.code, signal = ?info.signal, "helper exited");
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sink) = self.events.on_exit.as_mut() {
            sink(info.code, info.signal);
        }
        self.queue.release_all();
        self.listen_follow = None;
        self.buffer.clear();
    }

    /// A hard reset intentionally takes the helper down; the stashed waiter
    /// survives the exit and resolves once a fresh helper is up.
    async fn respawn_after_reset(&mut self, mut op: Operation) {
        let follow = op.follow.take();
        let spec = if follow.is_some() {
            LaunchSpec::listen(&self.config)
        } else {
            LaunchSpec::interactive(&self.config)
        };
        match self.launcher.launch(&spec).await {
            Ok(handle) => {
                self.helper = Some(handle);
                self.connected.store(true, Ordering::SeqCst);
                if let Some(sink) = self.events.on_connect.as_mut() {
                    sink();
                }
                op.resolve(Some(OpResult::Command(CommandResult { ok: true })));
                if let Some(follow) = follow {
                    self.listen_follow = Some(follow);
                    self.listen_buffer.clear();
                } else {
                    self.dispatch_next().await;
                }
            }
            Err(err) => {
                tracing::error!(%err, "failed to respawn helper after hard reset");
                op.resolve(None);
                self.connected.store(false, Ordering::SeqCst);
                self.queue.release_all();
            }
        }
    }

    /// Forward post-reset boot output to the caller until the helper closes
    /// the listen phase with its terminator.
    async fn handle_listen_chunk(&mut self, chunk: String) {
        let Some(mut follow) = self.listen_follow.take() else {
            return;
        };
        self.listen_buffer.push_str(&chunk);
        let mut done = false;
        loop {
            match self.listen_buffer.find('\n') {
                Some(pos) => {
                    let line: String = self.listen_buffer.drain(..=pos).collect();
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.contains(EOO) {
                        done = true;
                        break;
                    }
                    if line.is_empty() || is_boot_wait_notice(line) {
                        continue;
                    }
                    follow(line.to_string());
                }
                None => {
                    if self.listen_buffer.contains(EOO) {
                        done = true;
                    }
                    break;
                }
            }
        }
        if done {
            tracing::debug!("post-reset listen phase complete");
            self.listen_buffer.clear();
            self.dispatch_next().await;
        } else {
            self.listen_follow = Some(follow);
        }
    }

    async fn switch_device(&mut self, device: String) -> Result<(), SessionError> {
        tracing::debug!(from = %self.config.device, to = %device, "switching device");
        self.teardown_helper(true).await;
        self.queue.reset();
        self.buffer.clear();
        self.listen_follow = None;
        self.config.device = device;

        match self
            .launcher
            .launch(&LaunchSpec::interactive(&self.config))
            .await
        {
            Ok(handle) => {
                self.helper = Some(handle);
                self.stdout_closed = false;
                self.stderr_closed = false;
                self.connected.store(true, Ordering::SeqCst);
                if let Some(sink) = self.events.on_connect.as_mut() {
                    sink();
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn disconnect(&mut self, graceful: bool) {
        if graceful && self.helper.is_some() {
            // The polite form goes through the queue: the exit request
            // parks behind whatever is active and dispatches in FIFO order,
            // so an in-flight operation gets to finish first.
            let (waiter, _) = oneshot::channel();
            let op = Operation::new(
                OpKind::Exit,
                Request::Exit {},
                OpMachine::Exit,
                None,
                false,
                waiter,
            );
            self.queue.enqueue(op);
            if !self.queue.has_active() && self.listen_follow.is_none() {
                self.dispatch_next().await;
            }
            self.drain_until_exit().await;
        }
        self.teardown_helper(false).await;
        self.queue.release_all();
        self.listen_follow = None;
        self.buffer.clear();
    }

    /// Pump helper events for up to the grace window so queued work and the
    /// parked exit request can dispatch, until the helper exits on its own.
    async fn drain_until_exit(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        while self.helper.is_some() {
            let event = {
                let (stdout, stderr, exit) = match self.helper.as_mut() {
                    Some(h) => (
                        (!self.stdout_closed).then_some(&mut h.stdout),
                        (!self.stderr_closed).then_some(&mut h.stderr),
                        Some(&mut h.exit),
                    ),
                    None => (None, None, None),
                };
                tokio::select! {
                    chunk = recv_opt(stdout) => Some(Event::Stdout(chunk)),
                    line = recv_opt(stderr) => Some(Event::Stderr(line)),
                    info = exit_opt(exit) => Some(Event::Exit(info)),
                    _ = tokio::time::sleep_until(deadline) => None,
                }
            };
            match event {
                Some(Event::Stdout(Some(chunk))) => self.handle_stdout(chunk).await,
                Some(Event::Stdout(None)) => self.stdout_closed = true,
                Some(Event::Stderr(Some(line))) => self.handle_stderr(line),
                Some(Event::Stderr(None)) => self.stderr_closed = true,
                Some(Event::Exit(_)) => {
                    // The exit we asked for; nothing to surface.
                    self.helper = None;
                    self.stdout_closed = false;
                    self.stderr_closed = false;
                    self.connected.store(false, Ordering::SeqCst);
                }
                Some(Event::Cmd(_)) => {}
                None => {
                    tracing::debug!("helper outlived the grace window");
                    break;
                }
            }
        }
    }

    /// Drop the helper connection after a helper-reported command error.
    async fn drop_helper_connection(&mut self) {
        self.teardown_helper(false).await;
        self.queue.release_all();
        self.buffer.clear();
    }

    fn force_fatal_exit(&mut self, code: i32) {
        if let Some(mut helper) = self.helper.take() {
            helper.kill();
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sink) = self.events.on_exit.as_mut() {
            sink(Some(code), None);
        }
        self.queue.release_all();
        self.buffer.clear();
    }

    /// Drop the helper. The graceful flavor writes the exit request
    /// directly and is reserved for `switch_device`, which cancels pending
    /// callers anyway; a graceful disconnect instead queues its exit
    /// request behind the active operation (see `disconnect`). Always ends
    /// with no helper and the connected flag cleared.
    async fn teardown_helper(&mut self, graceful: bool) {
        if let Some(mut helper) = self.helper.take() {
            if graceful {
                let _ = helper.write_all(&encode_request(&Request::Exit {})).await;
                if tokio::time::timeout(self.config.grace_period, &mut helper.exit)
                    .await
                    .is_err()
                {
                    tracing::debug!("helper ignored exit request; killing");
                    helper.kill();
                }
            } else {
                helper.kill();
            }
        }
        self.stdout_closed = false;
        self.stderr_closed = false;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn shutdown(&mut self) {
        tracing::debug!("session dropped; shutting down worker");
        if let Some(mut helper) = self.helper.take() {
            helper.kill();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.queue.release_all();
    }
}

async fn recv_opt<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn exit_opt(rx: Option<&mut oneshot::Receiver<ExitInfo>>) -> ExitInfo {
    match rx {
        Some(rx) => rx.await.unwrap_or_else(|_| ExitInfo::unknown()),
        None => std::future::pending().await,
    }
}
