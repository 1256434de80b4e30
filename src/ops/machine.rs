//! Per-kind protocol state machines.
//!
//! Each active operation owns one [`OpMachine`] variant. The session feeds
//! it the shared read buffer after every qualifying stdout chunk; the
//! machine strips what it consumed and reports either [`Step::Pending`] or a
//! terminal step carrying the typed result. Side effects that the machine
//! cannot perform itself (stdin nudges, progress delivery) are collected in
//! [`Actions`] for the session to execute, which keeps progress callbacks
//! ordered strictly before the final result.

use super::parse;
use super::{
    CommandResult, CommandWithResponse, FileHashes, GetItemStat, ListContents, OpResult, RtcTime,
    Status, TabComp,
};
use crate::protocol::tokens::{strip_token, MAX_TOKEN_LEN};
use crate::protocol::{clean_payload, EOO, ERR, EXCEPTION, JSON_DECODE_ERROR, SENTINEL, SIMPLE_AUTO_COMP};
use crate::rtc;

/// What the session must do after a feed.
#[derive(Debug, Default)]
pub struct Actions {
    /// Write a newline to helper stdin to unblock its reader.
    pub nudge_stdin: bool,
    /// Lines to deliver to the operation's follow callback, in order.
    pub progress: Vec<String>,
}

/// Outcome of feeding buffered output to a machine.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// More output is needed.
    Pending,
    /// The operation completed with a typed result.
    Done(OpResult),
    /// The operation completed and the helper connection must be dropped
    /// (helper-reported error on a command-like operation).
    DoneDisconnect(OpResult),
    /// The operation completed and the session must force a synthetic
    /// helper exit with the given code.
    DoneFatal { result: OpResult, exit_code: i32 },
}

/// One variant per parsing contract.
#[derive(Debug)]
pub enum OpMachine {
    Command(CommandMachine),
    TabComp(TabCompMachine),
    Listing(ListingMachine),
    Mutation(MutationMachine),
    Hashes(HashesMachine),
    ItemStat(ItemStatMachine),
    Rename(RenameMachine),
    RtcRead(RtcReadMachine),
    StatusCheck(StatusCheckMachine),
    SoftReset(SoftResetMachine),
    /// Completion is driven by the child supervisor (helper exit +
    /// respawn), never by stdout.
    HardReset,
    /// Resolved by the session immediately after the request is written.
    Exit,
}

impl OpMachine {
    pub fn feed(&mut self, buffer: &mut String, actions: &mut Actions) -> Step {
        match self {
            OpMachine::Command(m) => m.feed(buffer, actions),
            OpMachine::TabComp(m) => m.feed(buffer, actions),
            OpMachine::Listing(m) => m.feed(buffer),
            OpMachine::Mutation(m) => m.feed(buffer, actions),
            OpMachine::Hashes(m) => m.feed(buffer),
            OpMachine::ItemStat(m) => m.feed(buffer),
            OpMachine::Rename(m) => m.feed(buffer),
            OpMachine::RtcRead(m) => m.feed(buffer),
            OpMachine::StatusCheck(m) => m.feed(buffer),
            OpMachine::SoftReset(m) => m.feed(buffer),
            OpMachine::HardReset | OpMachine::Exit => Step::Pending,
        }
    }
}

/// Take the payload preceding the response terminator, consuming the whole
/// buffer. Returns `None` while the terminator has not arrived.
fn take_response(buffer: &mut String) -> Option<String> {
    let pos = buffer.find(EOO)?;
    let payload = buffer[..pos].to_string();
    buffer.clear();
    Some(payload)
}

/// Shared token handling for command-like machines: sentinel nudges, benign
/// decode notices, and the fatal helper error token.
fn handle_command_tokens(buffer: &mut String, actions: &mut Actions) -> Option<Step> {
    if strip_token(buffer, SENTINEL) > 0 {
        actions.nudge_stdin = true;
    }
    let decode_notices = strip_token(buffer, JSON_DECODE_ERROR);
    if decode_notices > 0 {
        tracing::debug!(decode_notices, "helper reported malformed request JSON");
    }
    if buffer.contains(ERR) {
        let response = clean_payload(buffer).trim_end().to_string();
        buffer.clear();
        return Some(Step::DoneDisconnect(OpResult::CommandResponse(
            CommandWithResponse { response },
        )));
    }
    None
}

/// Streaming command execution: `command`, `friendly_code`, `run_file`,
/// `ctrl_d`, `double_ctrlc`.
#[derive(Debug)]
pub struct CommandMachine {
    pub follow: bool,
}

impl CommandMachine {
    fn feed(&mut self, buffer: &mut String, actions: &mut Actions) -> Step {
        if let Some(step) = handle_command_tokens(buffer, actions) {
            return step;
        }
        if let Some(payload) = take_response(buffer) {
            let payload = clean_payload(&payload);
            if self.follow {
                if !payload.is_empty() {
                    actions.progress.push(payload);
                }
                return Step::Done(OpResult::Command(CommandResult { ok: true }));
            }
            return Step::Done(OpResult::CommandResponse(CommandWithResponse {
                response: payload,
            }));
        }
        if self.follow {
            stream_safe_prefix(buffer, actions);
        }
        Step::Pending
    }
}

/// Emit everything that cannot still be the beginning of a delimiter token,
/// holding back a short tail so a token split across chunks is never leaked
/// to the caller.
fn stream_safe_prefix(buffer: &mut String, actions: &mut Actions) {
    let mut keep = buffer.len().saturating_sub(MAX_TOKEN_LEN - 1);
    while keep > 0 && !buffer.is_char_boundary(keep) {
        keep -= 1;
    }
    if keep == 0 {
        return;
    }
    let chunk = clean_payload(&buffer[..keep]);
    buffer.replace_range(..keep, "");
    if !chunk.is_empty() {
        actions.progress.push(chunk);
    }
}

/// Tab completion: command framing with a special terminal payload.
#[derive(Debug)]
pub struct TabCompMachine;

impl TabCompMachine {
    fn feed(&mut self, buffer: &mut String, actions: &mut Actions) -> Step {
        if let Some(step) = handle_command_tokens(buffer, actions) {
            return step;
        }
        let Some(payload) = take_response(buffer) else {
            return Step::Pending;
        };
        let payload = clean_payload(&payload);
        if let Some(rest) = payload.strip_prefix(SIMPLE_AUTO_COMP) {
            return Step::Done(OpResult::TabComp(TabComp {
                is_simple: true,
                completion: rest.trim_end_matches(['\r', '\n']).to_string(),
            }));
        }
        Step::Done(OpResult::TabComp(TabComp {
            is_simple: false,
            completion: payload,
        }))
    }
}

/// Directory listings, plain and recursive.
#[derive(Debug)]
pub struct ListingMachine;

impl ListingMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        match take_response(buffer) {
            Some(payload) => Step::Done(OpResult::Listing(ListContents {
                files: parse::parse_listing(&clean_payload(&payload)),
            })),
            None => Step::Pending,
        }
    }
}

/// Filesystem mutations: uploads, downloads, deletes, mkdir/rmdir trees,
/// RTC sync. Success is the absence of the error token, with the `EXIST`
/// carve-out treating already-existing targets as success.
#[derive(Debug)]
pub struct MutationMachine {
    pub verbose: bool,
    pub follow: bool,
    /// File list of the request, indexed by the helper's 1-based
    /// `currentFilePos` to label progress lines.
    pub files: Vec<String>,
}

impl MutationMachine {
    fn feed(&mut self, buffer: &mut String, actions: &mut Actions) -> Step {
        if buffer.contains(EOO) {
            let ok = !buffer.contains(ERR) || buffer.contains("EXIST");
            buffer.clear();
            return Step::Done(OpResult::Status(Status { ok }));
        }
        if self.verbose && self.follow {
            if buffer.contains(ERR) || buffer.contains(EXCEPTION) {
                tracing::debug!("swallowing helper notice inside progress stream");
                buffer.clear();
                return Step::Pending;
            }
            let trimmed = buffer.trim();
            if trimmed.is_empty() {
                return Step::Pending;
            }
            match parse::parse_progress_frame(trimmed) {
                Ok(frame) => {
                    actions.progress.push(parse::format_progress(&frame, &self.files));
                }
                Err(err) => {
                    tracing::warn!(%err, "malformed progress frame");
                }
            }
            buffer.clear();
        }
        Step::Pending
    }
}

/// Device-side hash calculation; the result feeds the project-sync chain.
#[derive(Debug)]
pub struct HashesMachine;

impl HashesMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        match take_response(buffer) {
            Some(payload) => Step::Done(OpResult::Hashes(FileHashes {
                hashes: parse::parse_hash_lines(&payload),
            })),
            None => Step::Pending,
        }
    }
}

/// Single-item stat.
#[derive(Debug)]
pub struct ItemStatMachine {
    pub item: String,
}

impl ItemStatMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        if !buffer.contains(EOO) {
            return Step::Pending;
        }
        if buffer.contains(ERR) {
            buffer.clear();
            return Step::Done(OpResult::ItemStat(GetItemStat { stat: None }));
        }
        let payload = take_response(buffer).unwrap_or_default();
        let text: String = payload.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let stat = match parse::parse_stat_frame(text.trim()) {
            Ok(frame) => Some(parse::file_entry_from_stat(&self.item, &frame)),
            Err(err) => {
                tracing::warn!(item = %self.item, %err, "malformed stat frame");
                None
            }
        };
        Step::Done(OpResult::ItemStat(GetItemStat { stat }))
    }
}

/// Rename result frame.
#[derive(Debug)]
pub struct RenameMachine;

impl RenameMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        let Some(payload) = take_response(buffer) else {
            return Step::Pending;
        };
        let cleaned = clean_payload(&payload);
        let ok = match parse::parse_rename_frame(cleaned.trim()) {
            Ok(frame) => {
                if !frame.success {
                    tracing::warn!(
                        error = frame.error.as_deref().unwrap_or("unknown"),
                        "rename failed on device"
                    );
                }
                frame.success
            }
            Err(err) => {
                tracing::warn!(%err, "malformed rename frame");
                false
            }
        };
        Step::Done(OpResult::Status(Status { ok }))
    }
}

/// RTC readback.
#[derive(Debug)]
pub struct RtcReadMachine;

impl RtcReadMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        if !buffer.contains(EOO) {
            return Step::Pending;
        }
        if buffer.contains(ERR) {
            buffer.clear();
            return Step::Done(OpResult::Rtc(RtcTime { time: None }));
        }
        let payload = take_response(buffer).unwrap_or_default();
        let cleaned = clean_payload(&payload);
        Step::Done(OpResult::Rtc(RtcTime {
            time: rtc::parse_rp2_datetime(cleaned.trim()),
        }))
    }
}

/// Connectivity probe. An `Exception` anywhere in the stream is treated as
/// a dead helper and forces a synthetic exit with code 3.
#[derive(Debug)]
pub struct StatusCheckMachine;

impl StatusCheckMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        if buffer.contains("Exception") {
            buffer.clear();
            return Step::DoneFatal {
                result: OpResult::Status(Status { ok: false }),
                exit_code: 3,
            };
        }
        match take_response(buffer) {
            Some(payload) => Step::Done(OpResult::Status(Status {
                ok: !payload.contains(ERR),
            })),
            None => Step::Pending,
        }
    }
}

/// Soft reset: verbose callers get the raw response text back.
#[derive(Debug)]
pub struct SoftResetMachine {
    pub verbose: bool,
}

impl SoftResetMachine {
    fn feed(&mut self, buffer: &mut String) -> Step {
        if !buffer.contains(EOO) {
            return Step::Pending;
        }
        let saw_err = buffer.contains(ERR);
        let payload = take_response(buffer).unwrap_or_default();
        if self.verbose {
            let response = clean_payload(&payload).trim_end().to_string();
            return Step::Done(OpResult::CommandResponse(CommandWithResponse { response }));
        }
        Step::Done(OpResult::Command(CommandResult { ok: !saw_err }))
    }
}
