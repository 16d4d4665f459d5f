//! Log fan-out: one producer, many independent subscribers.
//!
//! A job's combined output is read once, chunked into timestamped records
//! ([`LineChunker`]), and appended to an in-memory buffer owned by a single
//! fan-out loop. Subscribers attach at any time and replay the buffer from
//! the beginning; followers keep receiving new records as they arrive,
//! non-followers are closed once they reach the end of what is buffered.
//!
//! The loop owns the buffer outright — no subscriber ever touches shared
//! memory. Each iteration it races: attach requests, the next producer
//! record, every subscriber's delivery readiness, and every subscriber's
//! cancellation, together with the engine shutdown signal. A slow
//! subscriber therefore only ever stalls its own delivery slot; the
//! producer and all other subscribers keep making progress on whichever
//! channel becomes ready first.
//!
//! When the producer ends (process exit or read error), the buffer seals:
//! parked followers are closed immediately, and draining subscribers are
//! closed when they reach the end. The loop itself runs until the job is
//! cleaned up, so the recorded logs stay replayable long after the job has
//! completed.

use std::fs::File;
use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{ATTACH_CHANNEL_CAPACITY, MAX_LINE_BYTES, SUBSCRIBER_CHANNEL_CAPACITY};

// =============================================================================
// Log Records
// =============================================================================

/// One record of job output: a line (or line fragment) and the instant it
/// was cut from the stream.
///
/// `line` ends with `\n` except for the middle chunks of an oversized line
/// and possibly the final record of a stream that ended without a newline.
/// Never longer than [`MAX_LINE_BYTES`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Wall-clock instant the record was cut.
    pub timestamp: DateTime<Utc>,
    /// Raw line bytes, newline included when one was seen.
    pub line: Bytes,
}

impl LogRecord {
    /// Stamps `line` with the current wall-clock time.
    pub fn now(line: Bytes) -> Self {
        Self {
            timestamp: Utc::now(),
            line,
        }
    }
}

// =============================================================================
// Line Chunking
// =============================================================================

/// Splits a byte stream into records at newline boundaries, cutting early
/// whenever `max` bytes accumulate without one. Binary input passes
/// through unchanged.
#[derive(Debug)]
pub struct LineChunker {
    max: usize,
    pending: BytesMut,
}

impl LineChunker {
    /// Creates a chunker that cuts records at `max` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            pending: BytesMut::new(),
        }
    }

    /// Feeds bytes in, returning every record completed by this push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        for &byte in data {
            self.pending.put_u8(byte);
            if byte == b'\n' || self.pending.len() == self.max {
                out.push(self.pending.split().freeze());
            }
        }
        out
    }

    /// Takes the unterminated tail, if any. Called at end of stream.
    pub fn take_pending(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}

/// Reads a job's output stream to end-of-file, feeding records into the
/// fan-out loop. Runs on the blocking pool; dropping `records` at the end
/// is what seals the buffer.
///
/// Read errors other than interruption are logged and end the stream —
/// they are recorded on the job by the reaper, not propagated from here.
pub(crate) fn ingest(mut output: File, records: mpsc::Sender<LogRecord>) {
    let mut chunker = LineChunker::new(MAX_LINE_BYTES);
    let mut buf = [0u8; 4096];
    loop {
        match output.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for line in chunker.push(&buf[..n]) {
                    if records.blocking_send(LogRecord::now(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "unexpected error on job output");
                break;
            }
        }
    }
    if let Some(tail) = chunker.take_pending() {
        let _ = records.blocking_send(LogRecord::now(tail));
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// A request to attach a new subscriber to the fan-out loop.
struct Attach {
    follow: bool,
    cancel: CancellationToken,
    tx: mpsc::Sender<LogRecord>,
}

/// Fan-out loop state for one subscriber: its replay cursor, follow flag,
/// delivery sink and cancellation signal.
struct Subscriber {
    pos: usize,
    follow: bool,
    tx: mpsc::Sender<LogRecord>,
    cancel: CancellationToken,
}

/// Outcome of racing all subscriber channels; carries the subscriber's
/// index in the current set.
enum SubEvent {
    /// The record at the subscriber's cursor was delivered.
    Delivered(usize),
    /// The subscriber's cancellation signal fired.
    Cancelled(usize),
    /// The subscriber dropped its receiving end.
    Gone(usize),
}

/// Handle for attaching subscribers to a running fan-out loop.
#[derive(Debug, Clone)]
pub struct FanoutHandle {
    attach_tx: mpsc::Sender<Attach>,
}

impl FanoutHandle {
    /// Attaches a new subscriber, replaying from the start of the buffer.
    ///
    /// Returns the delivery channel. If the loop has already shut down the
    /// channel is closed from the outset, which readers observe as an
    /// empty, completed stream.
    pub async fn subscribe(
        &self,
        follow: bool,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<LogRecord> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let _ = self.attach_tx.send(Attach { follow, cancel, tx }).await;
        rx
    }
}

// =============================================================================
// Fan-out Loop
// =============================================================================

/// Spawns the fan-out loop for one job.
///
/// `records` is the producer side fed by [`ingest`]; closing it seals the
/// buffer. `shutdown` ends the loop and closes every remaining sink;
/// it is tied to job cleanup.
pub fn spawn(records: mpsc::Receiver<LogRecord>, shutdown: CancellationToken) -> FanoutHandle {
    let (attach_tx, attach_rx) = mpsc::channel(ATTACH_CHANNEL_CAPACITY);
    tokio::spawn(
        Fanout {
            records,
            attach_rx,
            shutdown,
            buffer: Vec::new(),
            subs: Vec::new(),
            sealed: false,
        }
        .run(),
    );
    FanoutHandle { attach_tx }
}

struct Fanout {
    records: mpsc::Receiver<LogRecord>,
    attach_rx: mpsc::Receiver<Attach>,
    shutdown: CancellationToken,
    buffer: Vec<LogRecord>,
    subs: Vec<Subscriber>,
    sealed: bool,
}

impl Fanout {
    async fn run(mut self) {
        loop {
            // The race below owns clones of each subscriber's sink, token
            // and pending record, so completing any other branch just
            // drops it; an interrupted delivery is retried next turn.
            let delivery = next_sub_event(&self.subs, &self.buffer);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(subscribers = self.subs.len(), "fan-out shutdown");
                    return;
                }
                Some(attach) = self.attach_rx.recv() => self.attach(attach),
                record = self.records.recv(), if !self.sealed => match record {
                    Some(record) => self.buffer.push(record),
                    None => self.seal(),
                },
                event = delivery => self.on_sub_event(event),
            }
        }
    }

    /// Admits a new subscriber, or closes it immediately when there is
    /// nothing to replay and nothing more will arrive.
    fn attach(&mut self, attach: Attach) {
        if self.buffer.is_empty() && (!attach.follow || self.sealed) {
            // Dropping the sink is the close.
            return;
        }
        self.subs.push(Subscriber {
            pos: 0,
            follow: attach.follow,
            tx: attach.tx,
            cancel: attach.cancel,
        });
    }

    /// Seals the buffer: no more records will arrive. Parked followers
    /// have nothing left to receive and are closed on the spot; everyone
    /// else drains to the end and is closed there.
    fn seal(&mut self) {
        self.sealed = true;
        let len = self.buffer.len();
        self.subs.retain(|sub| sub.pos < len);
    }

    fn on_sub_event(&mut self, event: SubEvent) {
        match event {
            SubEvent::Delivered(i) => {
                self.subs[i].pos += 1;
                let caught_up = self.subs[i].pos >= self.buffer.len();
                if caught_up && (!self.subs[i].follow || self.sealed) {
                    self.subs.remove(i);
                }
                // A caught-up follower on a live stream stays parked; the
                // next record or the seal decides its fate.
            }
            SubEvent::Cancelled(i) | SubEvent::Gone(i) => {
                self.subs.remove(i);
            }
        }
    }
}

/// Races every subscriber's next step: delivering the record at its
/// cursor, or (when parked at the buffer end) its cancellation and sink
/// closure. Pending forever when there are no subscribers.
fn next_sub_event(subs: &[Subscriber], buffer: &[LogRecord]) -> BoxFuture<'static, SubEvent> {
    if subs.is_empty() {
        return futures::future::pending().boxed();
    }
    let races: Vec<BoxFuture<'static, SubEvent>> = subs
        .iter()
        .enumerate()
        .map(|(i, sub)| {
            let tx = sub.tx.clone();
            let cancel = sub.cancel.clone();
            let record = buffer.get(sub.pos).cloned();
            async move {
                match record {
                    Some(record) => tokio::select! {
                        _ = cancel.cancelled() => SubEvent::Cancelled(i),
                        sent = tx.send(record) => match sent {
                            Ok(()) => SubEvent::Delivered(i),
                            Err(_) => SubEvent::Gone(i),
                        },
                    },
                    None => tokio::select! {
                        _ = cancel.cancelled() => SubEvent::Cancelled(i),
                        _ = tx.closed() => SubEvent::Gone(i),
                    },
                }
            }
            .boxed()
        })
        .collect();
    async move { futures::future::select_all(races).await.0 }.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(chunks: Vec<Bytes>) -> Vec<Vec<u8>> {
        chunks.into_iter().map(|b| b.to_vec()).collect()
    }

    #[test]
    fn test_chunker_splits_on_newline() {
        let mut chunker = LineChunker::new(MAX_LINE_BYTES);
        let out = chunker.push(b"one\ntwo\nthree");
        assert_eq!(lines(out), vec![b"one\n".to_vec(), b"two\n".to_vec()]);
        assert_eq!(chunker.take_pending(), Some(Bytes::from_static(b"three")));
    }

    #[test]
    fn test_chunker_cuts_oversized_lines() {
        let mut chunker = LineChunker::new(MAX_LINE_BYTES);
        let out = chunker.push(&[b'x'; 1100]);
        let out = lines(out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 512);
        assert_eq!(out[1].len(), 512);
        assert_eq!(chunker.take_pending().map(|b| b.len()), Some(76));
    }

    #[test]
    fn test_chunker_never_exceeds_max() {
        let mut chunker = LineChunker::new(MAX_LINE_BYTES);
        let mut data = vec![b'a'; 700];
        data.push(b'\n');
        data.extend_from_slice(&[b'b'; 100]);
        let mut all = chunker.push(&data);
        all.extend(chunker.take_pending());
        assert!(all.iter().all(|line| line.len() <= MAX_LINE_BYTES));
        // 512 + (188 + newline) + 100 accounts for every byte.
        let total: usize = all.iter().map(|line| line.len()).sum();
        assert_eq!(total, 801);
    }

    #[test]
    fn test_chunker_passes_binary_through() {
        let mut chunker = LineChunker::new(MAX_LINE_BYTES);
        let data = [0u8, 159, 146, 150, b'\n'];
        let out = chunker.push(&data);
        assert_eq!(lines(out), vec![data.to_vec()]);
    }

    #[tokio::test]
    async fn test_ingest_records_file_contents() {
        use std::io::{Seek, SeekFrom, Write};

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"first\nsecond\ntail").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let reader = tokio::task::spawn_blocking(move || ingest(file, tx));

        let mut got = Vec::new();
        while let Some(record) = rx.recv().await {
            got.push(record.line);
        }
        reader.await.unwrap();

        assert_eq!(got, vec!["first\n", "second\n", "tail"]);
    }

    #[test]
    fn test_chunker_split_across_pushes() {
        let mut chunker = LineChunker::new(MAX_LINE_BYTES);
        assert!(chunker.push(b"hel").is_empty());
        let out = chunker.push(b"lo\nwor");
        assert_eq!(lines(out), vec![b"hello\n".to_vec()]);
        assert_eq!(chunker.take_pending(), Some(Bytes::from_static(b"wor")));
    }
}
