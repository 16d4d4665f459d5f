//! Request dispatch: one connection, one RPC.
//!
//! A connection carries exactly one request frame. Unary operations get a
//! single reply frame; `Logs` streams a frame per record and terminates
//! with `LogsEnd`. The read half is watched for the duration of the call:
//! the client closing its end cancels the in-flight operation, which is
//! the transport's per-call cancellation.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::error::{Error, Result};
use crate::spec::JobSpec;
use crate::tracker::{CallContext, Tracker};
use crate::wire::{job_id_from_bytes, Reply, Request, WireJobStatus};

/// Serves the job RPC surface over framed connections.
pub struct JobService {
    tracker: Arc<Tracker>,
    /// Cancelled after a `Shutdown` request has been served; the accept
    /// loop watches it.
    shutdown: CancellationToken,
}

impl JobService {
    /// Creates a service around `tracker`. Cancelling `shutdown` stops
    /// the accept loop; the service triggers it when asked to shut down.
    pub fn new(tracker: Arc<Tracker>, shutdown: CancellationToken) -> Self {
        Self { tracker, shutdown }
    }

    /// Serves one connection whose peer authenticated as `identity`.
    pub async fn serve_connection<S>(&self, stream: S, identity: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let framed = Framed::new(stream, FrameCodec::new());
        let (mut sink, mut frames) = framed.split();

        let request = match read_request(&mut frames).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(user = %identity, error = %e, "bad request");
                let _ = send(&mut sink, &Reply::from_error(&e)).await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        let ctx = CallContext::new(identity, cancel.clone());

        tokio::select! {
            // EOF or error on the read half means the client abandoned
            // the call; dropping the dispatch future cancels the work.
            _ = watch_disconnect(&mut frames) => cancel.cancel(),
            result = self.dispatch(request, &ctx, &mut sink) => {
                if let Err(e) = result {
                    debug!(error = %e, "could not write reply");
                }
            }
        }
    }

    async fn dispatch<S>(
        &self,
        request: Request,
        ctx: &CallContext,
        sink: &mut SplitSink<Framed<S, FrameCodec>, Bytes>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match request {
            Request::Run { spec } => {
                let started = match JobSpec::try_from(spec) {
                    Ok(spec) => self.tracker.start(ctx, spec).await,
                    Err(e) => Err(e),
                };
                let reply = match started {
                    Ok(id) => Reply::Run {
                        job_id: id.into_bytes(),
                    },
                    Err(e) => Reply::from_error(&e),
                };
                send(sink, &reply).await
            }

            Request::Stop { job_id, cleanup } => {
                let stopped = match job_id_from_bytes(&job_id) {
                    Ok(id) => self.tracker.stop(ctx, &id, cleanup).await,
                    Err(e) => Err(e),
                };
                let reply = match stopped {
                    Ok(()) => Reply::Stop,
                    Err(e) => Reply::from_error(&e),
                };
                send(sink, &reply).await
            }

            Request::Status { job_id } => {
                let snapshot = match job_id_from_bytes(&job_id) {
                    Ok(id) => self.tracker.get(ctx, &id),
                    Err(e) => Err(e),
                };
                let reply = match snapshot {
                    Ok(snap) => Reply::Status {
                        status: WireJobStatus::from(&snap),
                    },
                    Err(e) => Reply::from_error(&e),
                };
                send(sink, &reply).await
            }

            Request::List {
                all_jobs,
                completed,
            } => {
                let reply = match self.tracker.list(ctx, completed, all_jobs) {
                    Ok(snapshots) => Reply::List {
                        jobs: snapshots.iter().map(WireJobStatus::from).collect(),
                    },
                    Err(e) => Reply::from_error(&e),
                };
                send(sink, &reply).await
            }

            Request::Logs { job_id, follow } => {
                let subscribed = match job_id_from_bytes(&job_id) {
                    Ok(id) => self.tracker.subscribe(ctx, &id, follow).await,
                    Err(e) => Err(e),
                };
                let mut records = match subscribed {
                    Ok(records) => records,
                    Err(e) => return send(sink, &Reply::from_error(&e)).await,
                };
                while let Some(record) = records.recv().await {
                    send(
                        sink,
                        &Reply::Log {
                            timestamp: record.timestamp,
                            line: record.line.to_vec(),
                        },
                    )
                    .await?;
                }
                send(sink, &Reply::LogsEnd).await
            }

            Request::Shutdown => {
                match self.tracker.shutdown(ctx).await {
                    Ok(stopped) => {
                        send(
                            sink,
                            &Reply::Shutdown {
                                num_jobs_stopped: stopped as i32,
                            },
                        )
                        .await?;
                        self.shutdown.cancel();
                        Ok(())
                    }
                    Err(e) => send(sink, &Reply::from_error(&e)).await,
                }
            }
        }
    }
}

/// Reads and decodes the connection's single request frame.
async fn read_request<S>(frames: &mut SplitStream<Framed<S, FrameCodec>>) -> Result<Option<Request>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frames.next().await {
        Some(Ok(frame)) => serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("could not decode request: {e}"))),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

/// Resolves when the client's read half reaches EOF or errors.
async fn watch_disconnect<S>(frames: &mut SplitStream<Framed<S, FrameCodec>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match frames.next().await {
            // Frames after the request are not part of the protocol.
            Some(Ok(_)) => warn!("ignoring unexpected frame on open call"),
            Some(Err(_)) | None => return,
        }
    }
}

/// Encodes and sends one reply frame.
async fn send<S>(
    sink: &mut SplitSink<Framed<S, FrameCodec>, Bytes>,
    reply: &Reply,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes =
        serde_json::to_vec(reply).map_err(|e| Error::Internal(format!("encode failed: {e}")))?;
    sink.send(Bytes::from(bytes)).await
}
