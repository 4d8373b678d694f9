//! Shared machinery of the framed session engine
//!
//! Both ends of a tunnel are built from the same parts:
//!
//! - a [`WsWriter`] that serializes every outbound WebSocket frame
//!   (data, control, keepalive pings) through one task, with a byte
//!   gauge the reader side polls for backpressure;
//! - a [`WriteQueue`] that serializes writes to the upstream TCP socket
//!   so concurrent frames apply in arrival order, with a bounded write
//!   timeout and retry budget;
//! - an [`ActivityClock`] for the read-progress watchdog;
//! - a [`CloseLatch`] that makes teardown idempotent and observable
//!   from every pump.
//!
//! # Ordering
//!
//! Within each direction a single reader feeds a single writer, so
//! bytes are delivered in order. Nothing orders the two directions
//! against each other.

pub mod frame;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::error::SessionError;
use frame::ControlFrame;

/// Outbound WebSocket bytes buffered above this mark pause the reader
pub const HIGH_WATER: usize = 1024 * 1024;

/// Backpressure poll starts here and grows by half, capped below
const BACKOFF_START: Duration = Duration::from_millis(8);
const BACKOFF_CAP: Duration = Duration::from_millis(200);

/// Bounded budget for one serialized upstream write
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_RETRIES: u32 = 2;
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// One-shot close signal shared by all tasks of a session.
///
/// Closing is idempotent; a session never leaves the closed state.
#[derive(Debug, Default)]
pub struct CloseLatch {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseLatch {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Trip the latch. Returns true on the first call only.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once the latch trips (immediately if it already has)
    pub async fn wait(&self) {
        if self.is_closed() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Last-activity timestamp for the read-progress watchdog
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last: Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }
}

/// Run the watchdog until the latch trips or the session idles out.
/// Trips the latch itself on expiry and returns whether it fired.
pub async fn run_watchdog(
    clock: Arc<ActivityClock>,
    latch: Arc<CloseLatch>,
    read_timeout: Duration,
) -> bool {
    loop {
        let idle = clock.idle_for();
        if idle >= read_timeout {
            warn!(idle_ms = idle.as_millis() as u64, "read timeout, closing session");
            latch.close();
            return true;
        }
        let remaining = read_timeout - idle;
        tokio::select! {
            () = tokio::time::sleep(remaining) => {}
            () = latch.wait() => return false,
        }
    }
}

/// Serialized writer for one session's WebSocket.
///
/// All frames funnel through a channel into a single sender task, so
/// keepalive pings never interleave with data frames mid-write. The
/// byte gauge counts enqueued-but-unsent payload bytes; readers poll it
/// through [`WsWriter::wait_drained`] before pulling more upstream
/// data.
#[derive(Clone)]
pub struct WsWriter {
    tx: mpsc::Sender<Message>,
    queued: Arc<AtomicUsize>,
}

impl WsWriter {
    /// Spawn the sender task over the sink half of a WebSocket.
    pub fn spawn<S>(mut sink: S, latch: Arc<CloseLatch>) -> Self
    where
        S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let queued = Arc::new(AtomicUsize::new(0));
        let gauge = Arc::clone(&queued);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let len = payload_len(&message);
                let result = sink.send(message).await;
                gauge.fetch_sub(len, Ordering::Relaxed);
                if let Err(e) = result {
                    debug!(error = %e, "websocket send failed");
                    latch.close();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Self { tx, queued }
    }

    /// Enqueue a frame for sending
    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        let len = payload_len(&message);
        self.queued.fetch_add(len, Ordering::Relaxed);
        self.tx.send(message).await.map_err(|_| {
            self.queued.fetch_sub(len, Ordering::Relaxed);
            SessionError::Transport("websocket writer is gone".into())
        })
    }

    /// Enqueue a TEXT control frame
    pub async fn send_frame(&self, frame: ControlFrame) -> Result<(), SessionError> {
        self.send(Message::Text(frame.encode())).await
    }

    /// Payload bytes enqueued but not yet handed to the transport
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Sleep-poll until the outbound buffer drains below the high-water
    /// mark or the latch trips. The delay grows by half each round so a
    /// stalled peer costs little CPU.
    pub async fn wait_drained(&self, latch: &CloseLatch) {
        let mut delay = BACKOFF_START;
        while self.queued_bytes() > HIGH_WATER && !latch.is_closed() {
            tokio::time::sleep(delay).await;
            delay = (delay * 3 / 2).min(BACKOFF_CAP);
        }
    }
}

fn payload_len(message: &Message) -> usize {
    match message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    }
}

/// Serialized write queue for the upstream TCP socket.
///
/// A single task owns the write half; chunks apply in arrival order.
/// Each write gets [`WRITE_TIMEOUT`] and up to [`WRITE_RETRIES`]
/// retries before the session is torn down.
pub struct WriteQueue {
    tx: mpsc::Sender<Bytes>,
}

impl WriteQueue {
    pub fn spawn(
        mut upstream: OwnedWriteHalf,
        clock: Arc<ActivityClock>,
        latch: Arc<CloseLatch>,
        written: Arc<AtomicU64>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(256);

        tokio::spawn(async move {
            'queue: while let Some(chunk) = rx.recv().await {
                let mut attempt = 0;
                loop {
                    match timeout(WRITE_TIMEOUT, upstream.write_all(&chunk)).await {
                        Ok(Ok(())) => {
                            clock.touch();
                            written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                            break;
                        }
                        Ok(Err(e)) if !crate::io::is_normal_close(&e) && attempt < WRITE_RETRIES => {
                            debug!(error = %e, attempt, "upstream write failed, retrying");
                            attempt += 1;
                            tokio::time::sleep(WRITE_RETRY_PAUSE).await;
                        }
                        Ok(Err(e)) => {
                            if !crate::io::is_normal_close(&e) {
                                warn!(error = %e, "upstream write failed");
                            }
                            latch.close();
                            break 'queue;
                        }
                        Err(_) if attempt < WRITE_RETRIES => {
                            debug!(attempt, "upstream write timed out, retrying");
                            attempt += 1;
                            tokio::time::sleep(WRITE_RETRY_PAUSE).await;
                        }
                        Err(_) => {
                            warn!(
                                attempts = attempt + 1,
                                "upstream write retries exhausted"
                            );
                            latch.close();
                            break 'queue;
                        }
                    }
                }
            }
            let _ = upstream.shutdown().await;
        });

        Self { tx }
    }

    /// Append a chunk to the queue. Zero-length chunks are forwarded;
    /// they reduce to a no-op write.
    pub async fn push(&self, chunk: Bytes) -> Result<(), SessionError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| SessionError::Transport("upstream writer is gone".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn latch_is_idempotent_and_observable() {
        let latch = CloseLatch::new();
        assert!(!latch.is_closed());
        assert!(latch.close());
        assert!(!latch.close());
        assert!(latch.is_closed());
        // wait resolves immediately once closed
        latch.wait().await;
    }

    #[tokio::test]
    async fn latch_wakes_waiters() {
        let latch = CloseLatch::new();
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_after_idle() {
        let clock = ActivityClock::new();
        let latch = CloseLatch::new();
        let fired = run_watchdog(
            Arc::clone(&clock),
            Arc::clone(&latch),
            Duration::from_millis(100),
        );
        let fired = tokio::spawn(fired);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(fired.await.unwrap());
        assert!(latch.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_respects_touch() {
        let clock = ActivityClock::new();
        let latch = CloseLatch::new();
        let handle = tokio::spawn(run_watchdog(
            Arc::clone(&clock),
            Arc::clone(&latch),
            Duration::from_millis(100),
        ));
        tokio::time::advance(Duration::from_millis(60)).await;
        clock.touch();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!latch.is_closed());
        latch.close();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn ws_writer_preserves_order_and_gauge() {
        // a sink that records messages
        let (tx, rx) = futures_channel::mpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(|_| WsError::ConnectionClosed);
        let latch = CloseLatch::new();
        let writer = WsWriter::spawn(sink, Arc::clone(&latch));

        writer
            .send(Message::Binary(vec![1, 2, 3]))
            .await
            .unwrap();
        writer
            .send_frame(ControlFrame::Close)
            .await
            .unwrap();
        drop(writer);

        let got: Vec<Message> = rx.collect().await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], Message::Binary(vec![1, 2, 3]));
        assert_eq!(got[1], Message::Text("CLOSE".into()));
    }

    #[tokio::test]
    async fn write_queue_applies_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_read, write) = stream.into_split();
        let clock = ActivityClock::new();
        let latch = CloseLatch::new();
        let written = Arc::new(AtomicU64::new(0));
        let queue = WriteQueue::spawn(write, clock, latch, Arc::clone(&written));

        queue.push(Bytes::from_static(b"abc")).await.unwrap();
        queue.push(Bytes::new()).await.unwrap();
        queue.push(Bytes::from_static(b"def")).await.unwrap();
        drop(queue);

        let buf = accept.await.unwrap();
        assert_eq!(buf, b"abcdef");
        assert_eq!(written.load(Ordering::Relaxed), 6);
    }
}
