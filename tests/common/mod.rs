//! Shared harness for session integration tests: a session wired to the
//! scripted mock launcher, plus small collectors for follow callbacks.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mpy_session::ops::ProgressFn;
use mpy_session::process::mock::{MockHelper, MockHelperLauncher};
use mpy_session::{Session, SessionConfig, SessionEvents};
use tokio::sync::mpsc::UnboundedReceiver;

// Long enough that a test can observe the wire staying quiet for a while
// without tripping the kill fallback.
pub const TEST_GRACE: Duration = Duration::from_millis(250);

pub fn test_config() -> SessionConfig {
    SessionConfig::new("COM3", "/opt/helper/wrapper").grace_period(TEST_GRACE)
}

/// Connect a session backed by the mock launcher. Returns the session, the
/// control handle for the first spawned helper, and the receiver that
/// yields control handles for respawns.
pub async fn connect() -> (Session, MockHelper, UnboundedReceiver<MockHelper>) {
    connect_with_events(SessionEvents::default()).await
}

pub async fn connect_with_events(
    events: SessionEvents,
) -> (Session, MockHelper, UnboundedReceiver<MockHelper>) {
    let (launcher, mut spawned) = MockHelperLauncher::new();
    let session = Session::connect_with(test_config(), Arc::new(launcher), events)
        .await
        .expect("mock connect cannot fail");
    let helper = spawned.recv().await.expect("first helper spawn");
    (session, helper, spawned)
}

/// Thread-safe collector for follow-callback lines.
#[derive(Clone, Default)]
pub struct Collector {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&self) -> ProgressFn {
        let lines = self.lines.clone();
        Box::new(move |line| lines.lock().unwrap().push(line))
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn joined(&self) -> String {
        self.lines.lock().unwrap().concat()
    }
}

/// Assert that no request line arrives within a short window.
pub async fn assert_no_request(helper: &mut MockHelper) {
    let wait = tokio::time::timeout(Duration::from_millis(50), helper.next_request_line()).await;
    assert!(wait.is_err(), "unexpected request: {:?}", wait.unwrap());
}
