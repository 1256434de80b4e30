//! Scheduling and lifecycle invariants: single-active serialization,
//! exactly-once resolution, waiter release on disconnect, delimiter purity,
//! and error propagation.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{assert_no_request, connect, connect_with_events, Collector};
use mpy_session::ops::{OpResult, Status};
use mpy_session::SessionEvents;

#[tokio::test]
async fn operations_serialize_in_enqueue_order() {
    let (session, mut helper, _spawned) = connect().await;

    let mut calls = Vec::new();
    for code in ["a()", "b()", "c()"] {
        let session = session.clone();
        calls.push(tokio::spawn(async move {
            session.command(code, false, None).await
        }));
        // Give each send time to land so enqueue order is deterministic.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for expected in ["a()", "b()", "c()"] {
        let request = helper.expect_request().await;
        assert_eq!(request["args"]["command"], expected);
        // Nothing else is dispatched while this operation is active.
        assert_no_request(&mut helper).await;
        helper.emit_stdout("ok\n!!EOO!!\n").await;
    }

    for call in calls {
        match call.await.unwrap() {
            Some(OpResult::CommandResponse(reply)) => assert_eq!(reply.response, "ok\n"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

#[tokio::test]
async fn forced_disconnect_releases_every_waiter() {
    let (session, mut helper, _spawned) = connect().await;

    let active = {
        let session = session.clone();
        tokio::spawn(async move { session.command("sleep(10)", false, None).await })
    };
    helper.expect_request().await;

    let queued = {
        let session = session.clone();
        tokio::spawn(async move { session.delete_files(&["old.py".to_string()]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.disconnect(false).await;

    assert_eq!(active.await.unwrap(), None);
    assert_eq!(queued.await.unwrap(), None);
    assert!(!session.is_connected());
    // The kill signal crosses a task boundary before the flag flips.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(helper.was_killed());

    // Post-disconnect calls resolve immediately with the sentinel.
    assert_eq!(session.list_contents("/").await, None);
    assert_eq!(session.sync_rtc().await, Status { ok: false });
}

#[tokio::test]
async fn graceful_disconnect_prefers_exit_request() {
    let (session, mut helper, _spawned) = connect().await;

    let disconnect = {
        let session = session.clone();
        tokio::spawn(async move { session.disconnect(true).await })
    };

    let request = helper.expect_request().await;
    assert_eq!(request["command"], "exit");
    helper.exit(Some(0), None).await;

    disconnect.await.unwrap();
    assert!(!session.is_connected());
    assert!(!helper.was_killed());
}

#[tokio::test]
async fn graceful_disconnect_waits_for_active_operation() {
    let (session, mut helper, _spawned) = connect().await;

    let active = {
        let session = session.clone();
        tokio::spawn(async move { session.command("print('bye')", false, None).await })
    };
    helper.expect_request().await;

    let disconnect = {
        let session = session.clone();
        tokio::spawn(async move { session.disconnect(true).await })
    };

    // The exit request queues behind the in-flight operation instead of
    // barging onto the wire.
    assert_no_request(&mut helper).await;

    helper.emit_stdout("bye\n!!EOO!!\n").await;

    let request = helper.expect_request().await;
    assert_eq!(request["command"], "exit");
    helper.exit(Some(0), None).await;

    disconnect.await.unwrap();
    match active.await.unwrap() {
        Some(OpResult::CommandResponse(reply)) => assert_eq!(reply.response, "bye\n"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!session.is_connected());
    assert!(!helper.was_killed());
}

#[tokio::test]
async fn graceful_disconnect_gives_up_on_stuck_operation() {
    let (session, mut helper, _spawned) = connect().await;

    let active = {
        let session = session.clone();
        tokio::spawn(async move { session.command("while True: pass", false, None).await })
    };
    helper.expect_request().await;

    // The operation never completes, so the exit request never gets its
    // turn; after the grace window the helper is killed.
    session.disconnect(true).await;

    assert_eq!(active.await.unwrap(), None);
    assert!(!session.is_connected());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(helper.was_killed());
}

#[tokio::test]
async fn graceful_disconnect_kills_after_grace_window() {
    let (session, mut helper, _spawned) = connect().await;

    let disconnect = {
        let session = session.clone();
        tokio::spawn(async move { session.disconnect(true).await })
    };

    let request = helper.expect_request().await;
    assert_eq!(request["command"], "exit");
    // Never exit; the worker must kill once the grace window lapses.
    disconnect.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(helper.was_killed());
}

#[tokio::test]
async fn write_failure_resolves_sentinel_and_drains() {
    let (session, mut helper, _spawned) = connect().await;
    helper.close_stdin();

    assert_eq!(session.command("1+1", false, None).await, None);
    // The queue kept draining; the session is still formally connected.
    assert!(session.is_connected());
}

#[tokio::test]
async fn interactive_stream_is_token_free_and_nudges_stdin() {
    let (session, mut helper, _spawned) = connect().await;
    let output = Collector::new();

    let call = {
        let session = session.clone();
        let follow = output.follow();
        tokio::spawn(async move { session.command("input()", true, Some(follow)).await })
    };

    let request = helper.expect_request().await;
    assert_eq!(request["args"]["interactive"], true);

    // Token split across chunk boundaries must neither leak nor be missed.
    helper.emit_stdout("abc").await;
    helper.emit_stdout("!!__SENT").await;
    helper.emit_stdout("INEL__!!").await;

    // The sentinel asks for a newline on stdin.
    let nudge = helper.next_request_line().await;
    assert_eq!(nudge.as_deref(), Some(""));

    helper.emit_stdout("def\n").await;
    helper.emit_stdout("!!EOO!!\n").await;

    match call.await.unwrap() {
        Some(OpResult::Command(result)) => assert!(result.ok),
        other => panic!("unexpected result: {other:?}"),
    }

    let streamed = output.joined();
    assert_eq!(streamed, "abcdef\n");
    for token in ["!!EOO!!", "!!ERR!!", "!!__SENTINEL__!!", "!!JSONDecodeError!!"] {
        assert!(!streamed.contains(token));
    }
}

#[tokio::test]
async fn unexpected_exit_reaches_exit_sink() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let events = SessionEvents {
        on_exit: Some(Box::new(move |code, signal| {
            *sink.lock().unwrap() = Some((code, signal));
        })),
        ..SessionEvents::default()
    };
    let (session, mut helper, _spawned) = connect_with_events(events).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.command("while True: pass", false, None).await })
    };
    helper.expect_request().await;

    helper.exit(Some(1), None).await;

    assert_eq!(call.await.unwrap(), None);
    assert_eq!(*seen.lock().unwrap(), Some((Some(1), None)));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn status_check_exception_forces_synthetic_exit() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let events = SessionEvents {
        on_exit: Some(Box::new(move |code, signal| {
            *sink.lock().unwrap() = Some((code, signal));
        })),
        ..SessionEvents::default()
    };
    let (session, mut helper, _spawned) = connect_with_events(events).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.check_status().await })
    };
    let request = helper.expect_request().await;
    assert_eq!(request["command"], "status");

    helper.emit_stdout("Exception: serial port vanished\n").await;

    assert_eq!(call.await.unwrap(), Some(Status { ok: false }));
    // The synthetic exit is reported right after the result resolves.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock().unwrap(), Some((Some(3), None)));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn status_check_is_noop_while_busy() {
    let (session, mut helper, _spawned) = connect().await;

    let active = {
        let session = session.clone();
        tokio::spawn(async move { session.command("1+1", false, None).await })
    };
    helper.expect_request().await;

    // The probe resolves immediately without touching the helper.
    assert_eq!(session.check_status().await, None);

    helper.emit_stdout("2\n!!EOO!!\n").await;
    assert!(active.await.unwrap().is_some());
}

#[tokio::test]
async fn stderr_lines_are_forwarded() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let events = SessionEvents {
        on_stderr: Some(Box::new(move |line| sink.lock().unwrap().push(line))),
        ..SessionEvents::default()
    };
    let (_session, helper, _spawned) = connect_with_events(events).await;

    helper.emit_stderr("pyboard: device busy").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(lines.lock().unwrap().clone(), vec!["pyboard: device busy"]);
}
