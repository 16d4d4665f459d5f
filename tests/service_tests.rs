//! End-to-end dispatch tests over in-memory connections.
//!
//! Each call opens a fresh duplex "connection" served by `JobService`,
//! mirroring the one-RPC-per-connection transport, minus TLS: the peer
//! identity is injected directly, as the accept path would after CN
//! extraction.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use common::test_tracker;
use jobd::codec::FrameCodec;
use jobd::service::JobService;
use jobd::wire::{ErrorKind, Reply, Request, WireJobSpec, WireJobState};

const WAIT: Duration = Duration::from_secs(10);

struct Rig {
    service: Arc<JobService>,
    shutdown: CancellationToken,
}

fn rig() -> Rig {
    let shutdown = CancellationToken::new();
    Rig {
        service: Arc::new(JobService::new(test_tracker(), shutdown.clone())),
        shutdown,
    }
}

/// Performs one RPC as `identity`, returning every reply frame.
async fn call(rig: &Rig, identity: &str, request: Request) -> Vec<Reply> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let service = Arc::clone(&rig.service);
    let identity = identity.to_string();
    let conn = tokio::spawn(async move { service.serve_connection(server, identity).await });

    let mut framed = Framed::new(client, FrameCodec::new());
    framed
        .send(Bytes::from(serde_json::to_vec(&request).unwrap()))
        .await
        .unwrap();

    let mut replies = Vec::new();
    while let Some(frame) = timeout(WAIT, framed.next()).await.expect("call stalled") {
        replies.push(serde_json::from_slice(&frame.unwrap()).unwrap());
    }
    timeout(WAIT, conn).await.expect("connection stuck").unwrap();
    replies
}

fn echo_request(msg: &str) -> Request {
    Request::Run {
        spec: WireJobSpec {
            command: "/bin/echo".into(),
            arguments: vec![msg.into()],
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn run_logs_status_over_the_wire() {
    let rig = rig();

    let replies = call(&rig, "alice", echo_request("wired")).await;
    let job_id = match &replies[..] {
        [Reply::Run { job_id }] => job_id.clone(),
        other => panic!("unexpected replies: {other:?}"),
    };

    // Follow the logs to completion: one record, then the end marker.
    let replies = call(
        &rig,
        "alice",
        Request::Logs {
            job_id: job_id.clone(),
            follow: true,
        },
    )
    .await;
    match &replies[..] {
        [Reply::Log { line, .. }, Reply::LogsEnd] => assert_eq!(line, b"wired\n"),
        other => panic!("unexpected replies: {other:?}"),
    }

    // Stop waits for the reaper, so status afterwards is settled.
    let replies = call(
        &rig,
        "alice",
        Request::Stop {
            job_id: job_id.clone(),
            cleanup: false,
        },
    )
    .await;
    assert!(matches!(replies[..], [Reply::Stop]));

    let replies = call(&rig, "alice", Request::Status { job_id }).await;
    match &replies[..] {
        [Reply::Status { status }] => {
            assert_eq!(status.state, WireJobState::Completed);
            assert_eq!(status.exit_code, 0);
            assert_eq!(status.user, "alice");
            assert!(status.spec.as_ref().is_some_and(|s| s.command == "/bin/echo"));
        }
        other => panic!("unexpected replies: {other:?}"),
    }
}

#[tokio::test]
async fn errors_carry_their_kind() {
    let rig = rig();

    // Unknown id.
    let replies = call(
        &rig,
        "alice",
        Request::Status {
            job_id: b"echo-00000000".to_vec(),
        },
    )
    .await;
    assert!(matches!(
        replies[..],
        [Reply::Error {
            kind: ErrorKind::Unknown,
            ..
        }]
    ));

    // Foreign job: unauthorized.
    let replies = call(&rig, "alice", echo_request("mine")).await;
    let job_id = match &replies[..] {
        [Reply::Run { job_id }] => job_id.clone(),
        other => panic!("unexpected replies: {other:?}"),
    };
    let replies = call(&rig, "bob", Request::Status { job_id }).await;
    assert!(matches!(
        replies[..],
        [Reply::Error {
            kind: ErrorKind::Unauthorized,
            ..
        }]
    ));

    // Empty command.
    let replies = call(
        &rig,
        "alice",
        Request::Run {
            spec: WireJobSpec::default(),
        },
    )
    .await;
    assert!(matches!(
        replies[..],
        [Reply::Error {
            kind: ErrorKind::NoCommand,
            ..
        }]
    ));

    // Unlaunchable command.
    let replies = call(
        &rig,
        "alice",
        Request::Run {
            spec: WireJobSpec {
                command: "/does/not/exist".into(),
                ..Default::default()
            },
        },
    )
    .await;
    assert!(matches!(
        replies[..],
        [Reply::Error {
            kind: ErrorKind::Launch,
            ..
        }]
    ));
}

#[tokio::test]
async fn list_is_scoped_and_ordered() {
    let rig = rig();

    let first = call(&rig, "alice", echo_request("first")).await;
    let second = call(&rig, "bob", echo_request("second")).await;
    let (first_id, second_id) = match (&first[..], &second[..]) {
        ([Reply::Run { job_id: a }], [Reply::Run { job_id: b }]) => (a.clone(), b.clone()),
        other => panic!("unexpected replies: {other:?}"),
    };

    // Owners see only their own job.
    let replies = call(
        &rig,
        "alice",
        Request::List {
            all_jobs: true,
            completed: true,
        },
    )
    .await;
    match &replies[..] {
        [Reply::List { jobs }] => {
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].job_id, first_id);
        }
        other => panic!("unexpected replies: {other:?}"),
    }

    // The admin sees both, start-time order.
    let replies = call(
        &rig,
        "carol",
        Request::List {
            all_jobs: true,
            completed: true,
        },
    )
    .await;
    match &replies[..] {
        [Reply::List { jobs }] => {
            assert_eq!(jobs.len(), 2);
            assert_eq!(jobs[0].job_id, first_id);
            assert_eq!(jobs[1].job_id, second_id);
        }
        other => panic!("unexpected replies: {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_is_admin_only_and_signals_the_server() {
    let rig = rig();

    let replies = call(&rig, "alice", Request::Shutdown).await;
    assert!(matches!(
        replies[..],
        [Reply::Error {
            kind: ErrorKind::Unauthorized,
            ..
        }]
    ));
    assert!(!rig.shutdown.is_cancelled());

    let replies = call(&rig, "carol", Request::Shutdown).await;
    assert!(matches!(
        replies[..],
        [Reply::Shutdown {
            num_jobs_stopped: 0
        }]
    ));
    assert!(rig.shutdown.is_cancelled());
}

#[tokio::test]
async fn malformed_requests_get_an_error_frame() {
    let rig = rig();

    let (client, server) = tokio::io::duplex(4096);
    let service = Arc::clone(&rig.service);
    tokio::spawn(async move { service.serve_connection(server, "alice".into()).await });

    let mut framed = Framed::new(client, FrameCodec::new());
    framed
        .send(Bytes::from_static(b"not json"))
        .await
        .unwrap();

    let frame = timeout(WAIT, framed.next())
        .await
        .expect("no reply")
        .expect("stream closed")
        .unwrap();
    let reply: Reply = serde_json::from_slice(&frame).unwrap();
    assert!(matches!(
        reply,
        Reply::Error {
            kind: ErrorKind::Internal,
            ..
        }
    ));
}
