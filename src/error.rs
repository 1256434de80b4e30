//! Error types for session construction and helper I/O.

use std::path::PathBuf;

/// Errors surfaced by session construction and helper process plumbing.
///
/// Protocol-level failures never appear here: facade methods resolve with
/// the sentinel result for their operation kind instead (see the session
/// module), so every caller observes exactly one resolution.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("helper executable not found: {0}")]
    HelperNotFound(PathBuf),

    #[error("failed to spawn helper process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("session worker has shut down")]
    WorkerGone,
}
