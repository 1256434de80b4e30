//! Request records encoded as one JSON line per operation.

use serde::Serialize;

/// A request to the helper: `{"command": <name>, "args": {…}}`.
///
/// Variant and field names mirror the helper's command vocabulary exactly;
/// optional arguments are omitted rather than sent as `null` so the helper's
/// key-presence checks behave the same as with a hand-built record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Request {
    Command {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interactive: Option<bool>,
    },
    FriendlyCode {
        code: String,
    },
    RetrieveTabComp {
        code: String,
    },
    RunFile {
        files: Vec<String>,
    },
    CtrlD {},
    DoubleCtrlc {},
    ListContents {
        target: String,
    },
    ListContentsRecursive {
        target: String,
    },
    UploadFiles {
        files: Vec<String>,
        remote: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_base_dir: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    },
    DownloadFiles {
        files: Vec<String>,
        local: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    },
    DeleteFiles {
        files: Vec<String>,
    },
    Mkdirs {
        folders: Vec<String>,
    },
    Rmdirs {
        folders: Vec<String>,
    },
    Rmtree {
        folders: Vec<String>,
    },
    RmFileOrDir {
        target: String,
        recursive: bool,
    },
    CalcFileHashes {
        files: Vec<String>,
    },
    GetItemStat {
        item: String,
    },
    Rename {
        item: String,
        target: String,
    },
    SyncRtc {},
    GetRtcTime {},
    Status {},
    SoftReset {},
    HardReset {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    },
    Exit {},
}

/// Encode a request as a single newline-terminated JSON line.
pub fn encode_request(request: &Request) -> String {
    let mut line = serde_json::to_string(request)
        .unwrap_or_else(|_| r#"{"command":"status","args":{}}"#.to_string());
    line.push('\n');
    line
}
