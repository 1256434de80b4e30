//! Operation kinds, typed results, and per-kind protocol state machines.
//!
//! Every high-level request becomes an [`Operation`] queued on the session.
//! While active, the operation's [`OpMachine`] consumes buffered helper
//! stdout and eventually produces a typed [`OpResult`].

pub mod machine;
pub mod parse;

pub use machine::{Actions, OpMachine, Step};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::protocol::Request;

/// Callback invoked with streamed output or progress lines while an
/// operation is running. Borrowed by the session only for the lifetime of
/// that one operation.
pub type ProgressFn = Box<dyn FnMut(String) + Send>;

/// Enumerated operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    ScanPorts,
    Command,
    FriendlyCommand,
    RetrieveTabComp,
    RunFile,
    ListContents,
    UploadFiles,
    DownloadFiles,
    DeleteFiles,
    CreateFolders,
    DeleteFolders,
    DeleteFolderRecursive,
    DeleteFileOrFolder,
    CalcHashes,
    GetItemStat,
    RenameItem,
    SyncRtc,
    GetRtcTime,
    CheckStatus,
    SoftReset,
    HardReset,
    CtrlD,
    Exit,
}

/// Result of a command-like operation that streamed its output to a
/// follow callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub ok: bool,
}

/// Result of a command-like operation without a follow callback: the
/// cleaned response text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandWithResponse {
    pub response: String,
}

/// Tab-completion result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabComp {
    /// True when the device returned a single in-line completion.
    pub is_simple: bool,
    pub completion: String,
}

/// One entry of a directory listing or stat result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

/// Result of a listing operation, in encountered order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListContents {
    pub files: Vec<FileEntry>,
}

/// Boolean outcome of a filesystem mutation or status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub ok: bool,
}

/// Result of a one-shot port scan. Each entry is the raw helper line,
/// `"<device>,<baud>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortsScan {
    pub ports: Vec<String>,
}

/// Stat result; `stat` is `None` when the helper reported an error for the
/// requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetItemStat {
    pub stat: Option<FileEntry>,
}

/// Device RTC reading; `None` when the helper reported an error or the
/// tuple did not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcTime {
    pub time: Option<chrono::NaiveDateTime>,
}

/// Per-file content hashes reported by the device, path → hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileHashes {
    pub hashes: HashMap<String, String>,
}

/// Typed result of a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    Command(CommandResult),
    CommandResponse(CommandWithResponse),
    TabComp(TabComp),
    Listing(ListContents),
    Status(Status),
    Ports(PortsScan),
    ItemStat(GetItemStat),
    Rtc(RtcTime),
    Hashes(FileHashes),
}

/// A single request-in-flight. At most one operation is active per session;
/// ids are session-local and monotonically increasing.
pub struct Operation {
    pub id: u64,
    pub kind: OpKind,
    pub request: Request,
    pub machine: OpMachine,
    pub follow: Option<ProgressFn>,
    /// True for kinds that stream character-by-character and must be fed
    /// without waiting for a newline.
    pub streams_raw: bool,
    waiter: Option<oneshot::Sender<Option<OpResult>>>,
}

impl Operation {
    pub fn new(
        kind: OpKind,
        request: Request,
        machine: OpMachine,
        follow: Option<ProgressFn>,
        streams_raw: bool,
        waiter: oneshot::Sender<Option<OpResult>>,
    ) -> Self {
        Self {
            id: 0,
            kind,
            request,
            machine,
            follow,
            streams_raw,
            waiter: Some(waiter),
        }
    }

    /// Resolve the caller exactly once. Later calls are no-ops, which keeps
    /// disconnect/cancel paths idempotent.
    pub fn resolve(&mut self, result: Option<OpResult>) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.send(result).is_err() {
                tracing::debug!(op_id = self.id, "caller dropped before resolution");
            }
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("streams_raw", &self.streams_raw)
            .field("has_follow", &self.follow.is_some())
            .finish()
    }
}
