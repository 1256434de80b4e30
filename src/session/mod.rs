//! Public session API.
//!
//! A [`Session`] owns one helper subprocess and one operation queue. Every
//! method builds a request, parks it on the queue, and suspends until the
//! worker resolves it — callers may invoke methods concurrently; the worker
//! serializes them. When the session is disconnected, methods resolve with
//! the sentinel `None` (`sync_rtc` answers `Status { ok: false }` instead).

mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::ops::machine::{
    CommandMachine, HashesMachine, ItemStatMachine, ListingMachine, MutationMachine, OpMachine,
    RenameMachine, RtcReadMachine, SoftResetMachine, StatusCheckMachine, TabCompMachine,
};
use crate::ops::{
    parse, CommandResult, FileHashes, GetItemStat, ListContents, OpKind, OpResult, Operation,
    PortsScan, ProgressFn, RtcTime, Status, TabComp,
};
use crate::process::{HelperLauncher, LaunchSpec, TokioHelperLauncher};
use crate::protocol::{Request, EOO};

pub(crate) use worker::Cmd;
use worker::Worker;

/// Optional notification sinks for session lifecycle events. All of them
/// default to tracing-only.
#[derive(Default)]
pub struct SessionEvents {
    /// Fired on every successful helper spawn, including respawns.
    pub on_connect: Option<Box<dyn FnMut() + Send>>,
    /// Fired when the helper exits outside a hard reset, with `(code,
    /// signal)`.
    pub on_exit: Option<Box<dyn FnMut(Option<i32>, Option<i32>) + Send>>,
    /// Fired per helper stderr line.
    pub on_stderr: Option<Box<dyn FnMut(String) + Send>>,
}

impl std::fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEvents")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Handle to one device session.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<Cmd>,
    connected: Arc<AtomicBool>,
}

impl Session {
    /// Spawn the helper for the configured device and start the session
    /// worker.
    pub async fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        Self::connect_with(config, Arc::new(TokioHelperLauncher), SessionEvents::default()).await
    }

    /// Like [`connect`](Self::connect) with an injected launcher and event
    /// sinks. This is the seam tests use to script the helper.
    pub async fn connect_with(
        config: SessionConfig,
        launcher: Arc<dyn HelperLauncher>,
        mut events: SessionEvents,
    ) -> Result<Self, SessionError> {
        let handle = launcher.launch(&LaunchSpec::interactive(&config)).await?;
        if let Some(sink) = events.on_connect.as_mut() {
            sink();
        }
        let connected = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let worker = Worker::new(config, launcher, handle, connected.clone(), events, cmd_rx);
        tokio::spawn(worker.run());
        Ok(Self { cmd_tx, connected })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// One-shot port enumeration with the production launcher.
    pub async fn scan_ports(config: &SessionConfig) -> Option<PortsScan> {
        Self::scan_ports_with(&TokioHelperLauncher, config).await
    }

    /// One-shot port enumeration: spawn a helper in scan mode, read until
    /// the terminator, kill the child.
    pub async fn scan_ports_with(
        launcher: &dyn HelperLauncher,
        config: &SessionConfig,
    ) -> Option<PortsScan> {
        let mut handle = match launcher.launch(&LaunchSpec::scan_ports(config)).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(%err, "port scan spawn failed");
                return None;
            }
        };
        let mut buffer = String::new();
        loop {
            tokio::select! {
                chunk = handle.stdout.recv() => match chunk {
                    Some(chunk) => {
                        buffer.push_str(&chunk);
                        if buffer.contains(EOO) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut handle.exit => {
                    // The scan helper exits on its own; collect whatever the
                    // stdout pump still has in flight.
                    while let Ok(Some(chunk)) = tokio::time::timeout(
                        std::time::Duration::from_millis(100),
                        handle.stdout.recv(),
                    )
                    .await
                    {
                        buffer.push_str(&chunk);
                        if buffer.contains(EOO) {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        handle.kill();
        Some(PortsScan {
            ports: parse::parse_ports(&buffer),
        })
    }

    /// Execute a code snippet on the device. With a follow callback the
    /// result is `OpResult::Command`; without one, `OpResult::CommandResponse`
    /// carrying the cleaned output.
    pub async fn command(
        &self,
        command: &str,
        interactive: bool,
        follow: Option<ProgressFn>,
    ) -> Option<OpResult> {
        let request = Request::Command {
            command: command.to_string(),
            interactive: interactive.then_some(true),
        };
        self.run_command_like(OpKind::Command, request, follow, interactive)
            .await
    }

    /// Execute code with friendly-REPL semantics (expressions echoed), the
    /// interactive stdin dance included.
    pub async fn friendly_command(&self, code: &str, follow: Option<ProgressFn>) -> Option<OpResult> {
        let request = Request::FriendlyCode {
            code: code.to_string(),
        };
        self.run_command_like(OpKind::FriendlyCommand, request, follow, true)
            .await
    }

    /// Ask the device REPL for a tab completion of `code`.
    pub async fn retrieve_tab_comp(&self, code: &str) -> Option<TabComp> {
        let request = Request::RetrieveTabComp {
            code: code.to_string(),
        };
        match self
            .run_op(
                OpKind::RetrieveTabComp,
                request,
                OpMachine::TabComp(TabCompMachine),
                None,
                false,
            )
            .await?
        {
            OpResult::TabComp(comp) => Some(comp),
            _ => None,
        }
    }

    /// Run a local file on the device, streaming its output.
    pub async fn run_file(&self, file: &str, follow: Option<ProgressFn>) -> Option<OpResult> {
        let request = Request::RunFile {
            files: vec![file.to_string()],
        };
        self.run_command_like(OpKind::RunFile, request, follow, true)
            .await
    }

    /// Send Ctrl-D to the device REPL. Streams raw: the helper's stdin
    /// sentinel arrives without a trailing newline and must be answered
    /// promptly or the helper blocks.
    pub async fn ctrl_d(&self, follow: Option<ProgressFn>) -> Option<OpResult> {
        self.run_command_like(OpKind::CtrlD, Request::CtrlD {}, follow, true)
            .await
    }

    /// Interrupt whatever is running on the device (double Ctrl-C).
    pub async fn stop_running_stuff(&self) -> Option<OpResult> {
        self.run_command_like(OpKind::Command, Request::DoubleCtrlc {}, None, false)
            .await
    }

    pub async fn list_contents(&self, target: &str) -> Option<ListContents> {
        let request = Request::ListContents {
            target: target.to_string(),
        };
        self.run_listing(request).await
    }

    pub async fn list_contents_recursive(&self, target: &str) -> Option<ListContents> {
        let request = Request::ListContentsRecursive {
            target: target.to_string(),
        };
        self.run_listing(request).await
    }

    /// Upload local files to the device. `local_base_dir` makes remote
    /// placement relative to that directory; progress is streamed when a
    /// follow callback is given.
    pub async fn upload_files(
        &self,
        files: &[String],
        remote: &str,
        local_base_dir: Option<&Path>,
        follow: Option<ProgressFn>,
    ) -> Option<Status> {
        let verbose = follow.is_some();
        let request = Request::UploadFiles {
            files: files.to_vec(),
            remote: remote.to_string(),
            local_base_dir: local_base_dir.map(|dir| dir.to_string_lossy().into_owned()),
            verbose: verbose.then_some(true),
        };
        self.run_mutation(OpKind::UploadFiles, request, files.to_vec(), follow)
            .await
    }

    /// Download device files below `local`.
    pub async fn download_files(
        &self,
        files: &[String],
        local: &str,
        follow: Option<ProgressFn>,
    ) -> Option<Status> {
        let verbose = follow.is_some();
        let request = Request::DownloadFiles {
            files: files.to_vec(),
            local: local.to_string(),
            verbose: verbose.then_some(true),
        };
        self.run_mutation(OpKind::DownloadFiles, request, files.to_vec(), follow)
            .await
    }

    pub async fn delete_files(&self, files: &[String]) -> Option<Status> {
        let request = Request::DeleteFiles {
            files: files.to_vec(),
        };
        self.run_mutation(OpKind::DeleteFiles, request, Vec::new(), None)
            .await
    }

    pub async fn create_folders(&self, folders: &[String]) -> Option<Status> {
        let request = Request::Mkdirs {
            folders: folders.to_vec(),
        };
        self.run_mutation(OpKind::CreateFolders, request, Vec::new(), None)
            .await
    }

    pub async fn delete_folders(&self, folders: &[String]) -> Option<Status> {
        let request = Request::Rmdirs {
            folders: folders.to_vec(),
        };
        self.run_mutation(OpKind::DeleteFolders, request, Vec::new(), None)
            .await
    }

    pub async fn delete_folder_recursive(&self, folder: &str) -> Option<Status> {
        let request = Request::Rmtree {
            folders: vec![folder.to_string()],
        };
        self.run_mutation(OpKind::DeleteFolderRecursive, request, Vec::new(), None)
            .await
    }

    pub async fn delete_file_or_folder(&self, target: &str, recursive: bool) -> Option<Status> {
        let request = Request::RmFileOrDir {
            target: target.to_string(),
            recursive,
        };
        self.run_mutation(OpKind::DeleteFileOrFolder, request, Vec::new(), None)
            .await
    }

    /// Ask the device for content hashes of `files` (paths relative to the
    /// device root). Used by project sync to compute the upload diff.
    pub async fn calc_file_hashes(&self, files: &[String]) -> Option<FileHashes> {
        let request = Request::CalcFileHashes {
            files: files.to_vec(),
        };
        match self
            .run_op(
                OpKind::CalcHashes,
                request,
                OpMachine::Hashes(HashesMachine),
                None,
                false,
            )
            .await?
        {
            OpResult::Hashes(hashes) => Some(hashes),
            _ => None,
        }
    }

    pub async fn get_item_stat(&self, item: &str) -> Option<GetItemStat> {
        let request = Request::GetItemStat {
            item: item.to_string(),
        };
        let machine = OpMachine::ItemStat(ItemStatMachine {
            item: item.to_string(),
        });
        match self
            .run_op(OpKind::GetItemStat, request, machine, None, false)
            .await?
        {
            OpResult::ItemStat(stat) => Some(stat),
            _ => None,
        }
    }

    pub async fn rename_item(&self, item: &str, target: &str) -> Option<Status> {
        let request = Request::Rename {
            item: item.to_string(),
            target: target.to_string(),
        };
        match self
            .run_op(
                OpKind::RenameItem,
                request,
                OpMachine::Rename(RenameMachine),
                None,
                false,
            )
            .await?
        {
            OpResult::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Synchronize the device RTC with the host clock. Unlike the other
    /// methods this reports `ok: false` rather than `None` when the session
    /// is down.
    pub async fn sync_rtc(&self) -> Status {
        let result = self
            .run_mutation(OpKind::SyncRtc, Request::SyncRtc {}, Vec::new(), None)
            .await;
        result.unwrap_or(Status { ok: false })
    }

    pub async fn get_rtc_time(&self) -> Option<RtcTime> {
        match self
            .run_op(
                OpKind::GetRtcTime,
                Request::GetRtcTime {},
                OpMachine::RtcRead(RtcReadMachine),
                None,
                false,
            )
            .await?
        {
            OpResult::Rtc(time) => Some(time),
            _ => None,
        }
    }

    /// Probe helper/device responsiveness. A no-op (resolving `None`) while
    /// other operations are queued.
    pub async fn check_status(&self) -> Option<Status> {
        match self
            .run_op(
                OpKind::CheckStatus,
                Request::Status {},
                OpMachine::StatusCheck(StatusCheckMachine),
                None,
                false,
            )
            .await?
        {
            OpResult::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Soft-reset the device REPL. Verbose callers get the reset banner
    /// back as `OpResult::CommandResponse`.
    pub async fn soft_reset(&self, verbose: bool) -> Option<OpResult> {
        self.run_op(
            OpKind::SoftReset,
            Request::SoftReset {},
            OpMachine::SoftReset(SoftResetMachine { verbose }),
            None,
            false,
        )
        .await
    }

    /// Reboot the device. The helper exits as a side effect; the session
    /// respawns it and resolves once the new helper is up. With a follow
    /// callback the respawned helper streams device boot output into it.
    pub async fn hard_reset(&self, follow: Option<ProgressFn>) -> Option<CommandResult> {
        let verbose = follow.is_some();
        let request = Request::HardReset {
            verbose: verbose.then_some(true),
        };
        match self
            .run_op(OpKind::HardReset, request, OpMachine::HardReset, follow, false)
            .await?
        {
            OpResult::Command(result) => Some(result),
            _ => None,
        }
    }

    /// Tear down the session. The graceful form enqueues an exit request
    /// behind whatever operation is active, lets it dispatch in FIFO order,
    /// and kills the helper only if it is still alive after the configured
    /// grace period; the forced form bypasses the queue and kills
    /// immediately. Every caller still parked when teardown completes
    /// resolves `None`.
    pub async fn disconnect(&self, graceful: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::Disconnect {
                graceful,
                done: done_tx,
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Abandon the current device and start over on `device`: pending and
    /// active callers resolve `None`, counters and buffers reset, and a new
    /// helper is spawned.
    pub async fn switch_device(&self, device: &str) -> Result<(), SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SwitchDevice {
                device: device.to_string(),
                done: done_tx,
            })
            .await
            .map_err(|_| SessionError::WorkerGone)?;
        done_rx.await.map_err(|_| SessionError::WorkerGone)?
    }

    async fn run_command_like(
        &self,
        kind: OpKind,
        request: Request,
        follow: Option<ProgressFn>,
        streams_raw: bool,
    ) -> Option<OpResult> {
        let machine = OpMachine::Command(CommandMachine {
            follow: follow.is_some(),
        });
        self.run_op(kind, request, machine, follow, streams_raw).await
    }

    async fn run_listing(&self, request: Request) -> Option<ListContents> {
        match self
            .run_op(
                OpKind::ListContents,
                request,
                OpMachine::Listing(ListingMachine),
                None,
                false,
            )
            .await?
        {
            OpResult::Listing(listing) => Some(listing),
            _ => None,
        }
    }

    async fn run_mutation(
        &self,
        kind: OpKind,
        request: Request,
        files: Vec<String>,
        follow: Option<ProgressFn>,
    ) -> Option<Status> {
        let machine = OpMachine::Mutation(MutationMachine {
            verbose: follow.is_some(),
            follow: follow.is_some(),
            files,
        });
        match self.run_op(kind, request, machine, follow, false).await? {
            OpResult::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Enqueue one operation and suspend until the worker resolves it.
    async fn run_op(
        &self,
        kind: OpKind,
        request: Request,
        machine: OpMachine,
        follow: Option<ProgressFn>,
        streams_raw: bool,
    ) -> Option<OpResult> {
        if !self.is_connected() {
            return None;
        }
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let op = Operation::new(kind, request, machine, follow, streams_raw, waiter_tx);
        self.cmd_tx.send(Cmd::Enqueue(op)).await.ok()?;
        waiter_rx.await.ok().flatten()
    }
}
