//! Tests for the log fan-out engine.
//!
//! The engine is driven directly through its channels: records are fed in
//! as a producer would, subscribers attach through the handle, and the
//! assertions cover replay, ordering, follow semantics, seal behavior,
//! slow consumers and cancellation.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use jobd::fanout::{self, FanoutHandle, LogRecord};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    records: mpsc::Sender<LogRecord>,
    handle: FanoutHandle,
    shutdown: CancellationToken,
}

fn rig() -> Rig {
    let (records, rx) = mpsc::channel(256);
    let shutdown = CancellationToken::new();
    let handle = fanout::spawn(rx, shutdown.clone());
    Rig {
        records,
        handle,
        shutdown,
    }
}

fn record(line: &str) -> LogRecord {
    LogRecord::now(Bytes::copy_from_slice(line.as_bytes()))
}

/// Drains a subscription to completion, returning the line bytes.
async fn drain(mut rx: mpsc::Receiver<LogRecord>) -> Vec<Bytes> {
    let mut lines = Vec::new();
    while let Some(rec) = timeout(WAIT, rx.recv()).await.expect("subscription stalled") {
        lines.push(rec.line);
    }
    lines
}

#[tokio::test]
async fn subscribers_with_same_cursor_see_identical_sequences() {
    let rig = rig();

    let a = rig.handle.subscribe(true, CancellationToken::new()).await;
    let b = rig.handle.subscribe(true, CancellationToken::new()).await;

    for i in 0..50 {
        rig.records.send(record(&format!("line {i}\n"))).await.unwrap();
    }
    drop(rig.records); // seal

    let a = drain(a).await;
    let b = drain(b).await;
    assert_eq!(a.len(), 50);
    assert_eq!(a, b);
}

#[tokio::test]
async fn timestamps_are_non_decreasing_per_subscriber() {
    let rig = rig();
    for i in 0..20 {
        rig.records.send(record(&format!("{i}\n"))).await.unwrap();
    }
    drop(rig.records);

    let mut rx = rig.handle.subscribe(true, CancellationToken::new()).await;
    let mut last = None;
    while let Some(rec) = timeout(WAIT, rx.recv()).await.unwrap() {
        if let Some(prev) = last {
            assert!(rec.timestamp >= prev, "timestamps went backwards");
        }
        last = Some(rec.timestamp);
    }
}

#[tokio::test]
async fn late_subscriber_replays_full_buffer() {
    let rig = rig();
    for line in ["one\n", "two\n", "three\n"] {
        rig.records.send(record(line)).await.unwrap();
    }
    drop(rig.records);

    // A follower only closes once the loop has observed the seal, so
    // draining one pins down the ordering for the replay checks below.
    let synced = drain(rig.handle.subscribe(true, CancellationToken::new()).await).await;
    assert_eq!(synced.len(), 3);

    // Attached after completion, follow off: exactly the buffered lines.
    let lines = drain(rig.handle.subscribe(false, CancellationToken::new()).await).await;
    assert_eq!(lines, vec!["one\n", "two\n", "three\n"]);

    // A follower on a sealed buffer also just drains and closes.
    let lines = drain(rig.handle.subscribe(true, CancellationToken::new()).await).await;
    assert_eq!(lines.len(), 3);
}

#[tokio::test]
async fn empty_sealed_buffer_closes_subscribers_immediately() {
    let rig = rig();
    drop(rig.records);

    let mut rx = rig.handle.subscribe(false, CancellationToken::new()).await;
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());

    let mut rx = rig.handle.subscribe(true, CancellationToken::new()).await;
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn follower_receives_live_continuation() {
    let rig = rig();
    rig.records.send(record("history\n")).await.unwrap();

    let mut rx = rig.handle.subscribe(true, CancellationToken::new()).await;
    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.line, "history\n");

    // The follower is parked at the buffer end now; new records re-arm it.
    rig.records.send(record("live\n")).await.unwrap();
    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.line, "live\n");

    drop(rig.records);
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn non_follower_closes_at_buffer_end_while_live() {
    let rig = rig();
    rig.records.send(record("only\n")).await.unwrap();

    let lines = drain(rig.handle.subscribe(false, CancellationToken::new()).await).await;
    assert_eq!(lines, vec!["only\n"]);

    // The producer is still live; non-follow termination must not have
    // depended on the seal.
    rig.records.send(record("after\n")).await.unwrap();
}

#[tokio::test]
async fn slow_subscriber_does_not_stall_others() {
    let rig = rig();

    // `slow` never reads; its delivery channel fills after 64 records.
    let slow = rig.handle.subscribe(true, CancellationToken::new()).await;
    let fast = rig.handle.subscribe(true, CancellationToken::new()).await;

    for i in 0..200 {
        timeout(WAIT, rig.records.send(record(&format!("{i}\n"))))
            .await
            .expect("producer blocked on a slow subscriber")
            .unwrap();
    }
    drop(rig.records);

    let fast_lines = drain(fast).await;
    assert_eq!(fast_lines.len(), 200);

    // The slow subscriber still gets the full sequence once it reads.
    let slow_lines = drain(slow).await;
    assert_eq!(slow_lines.len(), 200);
    assert_eq!(slow_lines, fast_lines);
}

#[tokio::test]
async fn cancellation_closes_one_subscriber_only() {
    let rig = rig();
    rig.records.send(record("a\n")).await.unwrap();

    let cancel = CancellationToken::new();
    let mut cancelled = rig.handle.subscribe(true, cancel.clone()).await;
    let mut kept = rig.handle.subscribe(true, CancellationToken::new()).await;

    assert!(timeout(WAIT, cancelled.recv()).await.unwrap().is_some());
    assert!(timeout(WAIT, kept.recv()).await.unwrap().is_some());

    cancel.cancel();
    assert!(timeout(WAIT, cancelled.recv()).await.unwrap().is_none());

    // The other subscription keeps receiving.
    rig.records.send(record("b\n")).await.unwrap();
    let rec = timeout(WAIT, kept.recv()).await.unwrap().unwrap();
    assert_eq!(rec.line, "b\n");
}

#[tokio::test]
async fn shutdown_closes_all_subscribers() {
    let rig = rig();
    rig.records.send(record("a\n")).await.unwrap();

    let mut parked = rig.handle.subscribe(true, CancellationToken::new()).await;
    assert!(timeout(WAIT, parked.recv()).await.unwrap().is_some());

    rig.shutdown.cancel();
    assert!(timeout(WAIT, parked.recv()).await.unwrap().is_none());

    // New subscriptions after shutdown are closed from the outset.
    let mut rx = rig.handle.subscribe(true, CancellationToken::new()).await;
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}
