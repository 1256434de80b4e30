//! # mpy-session
//!
//! Device session orchestrator for MicroPython boards reached over a serial
//! port through a long-lived helper subprocess. The crate spawns and
//! supervises the helper, serializes high-level operations onto its single
//! request/response channel, parses the delimited textual protocol it
//! speaks, and hands callers typed results.
//!
//! ## Modules
//!
//! - `config` - Session configuration (device, helper path, baud, grace)
//! - `error` - Typed errors for construction and helper I/O
//! - `ops` - Operation kinds, typed results, per-kind protocol state machines
//! - `process` - Helper child supervision behind an injectable launcher seam
//! - `project` - Hash-differential project upload/download
//! - `protocol` - Request codec and delimiter token handling
//! - `queue` - Single-slot FIFO scheduler
//! - `rtc` - Civil time ↔ device RTC tuple conversions
//! - `session` - Public session facade and its worker event loop

pub mod config;
pub mod error;
pub mod ops;
pub mod process;
pub mod project;
pub mod protocol;
pub mod queue;
pub mod rtc;
pub mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use ops::{
    CommandResult, CommandWithResponse, FileEntry, FileHashes, GetItemStat, ListContents, OpResult,
    PortsScan, ProgressFn, RtcTime, Status, TabComp,
};
pub use project::ProjectSyncOptions;
pub use session::{Session, SessionEvents};
