//! Hub-side handle for one live connection.
//!
//! Outbound frames go through a bounded [`Backlog`]. Whoever enqueues onto an
//! idle backlog becomes the drainer and spawns a task that sends frames one
//! at a time until the queue is empty; everyone else just enqueues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bandwidth::BandwidthLedger;

/// Transport side of a connection.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), String>>;
}

/// Bounded drop-oldest queue of pending outbound frames.
#[derive(Debug)]
pub struct Backlog {
    queue: Mutex<VecDeque<String>>,
    draining: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            draining: AtomicBool::new(false),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame. Returns `true` when the oldest pending frame had to
    /// be dropped to make room.
    pub fn enqueue(&self, frame: String) -> bool {
        let mut queue = self.lock();
        queue.push_back(frame);
        if queue.len() > self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                capacity = self.capacity,
                total_dropped = dropped,
                "outbound backlog full, dropped oldest frame"
            );
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Claim the drainer role. Only one caller wins until `release`.
    fn try_claim(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.draining.store(false, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<String> {
        self.lock().pop_front()
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Transport state as the hub sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

/// One live connection: binding, liveness and the outbound backlog.
pub struct Connection {
    id: Uuid,
    peer: String,
    /// Bound identity, 0 while unbound.
    uid: AtomicU64,
    session_id: AtomicU64,
    last_ping_ms: AtomicI64,
    state: AtomicU8,
    close_signal: CancellationToken,
    backlog: Backlog,
    sink: Arc<dyn FrameSink>,
    bandwidth: Arc<BandwidthLedger>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("uid", &self.uid())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(
        peer: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        bandwidth: Arc<BandwidthLedger>,
        backlog_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            uid: AtomicU64::new(0),
            session_id: AtomicU64::new(0),
            last_ping_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            state: AtomicU8::new(STATE_OPEN),
            close_signal: CancellationToken::new(),
            backlog: Backlog::new(backlog_size),
            sink,
            bandwidth,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn uid(&self) -> u64 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn is_bound(&self) -> bool {
        self.uid() != 0
    }

    /// Only the hub calls this, under its registry lock.
    pub(crate) fn bind(&self, uid: u64, session_id: u64) {
        self.session_id.store(session_id, Ordering::Release);
        self.uid.store(uid, Ordering::Release);
    }

    pub(crate) fn unbind(&self) -> u64 {
        self.uid.swap(0, Ordering::AcqRel)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn touch_ping_at(&self, now: DateTime<Utc>) {
        self.last_ping_ms.store(now.timestamp_millis(), Ordering::Release);
    }

    pub fn last_ping(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_ping_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn state(&self) -> TransportState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => TransportState::Open,
            STATE_CLOSING => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }

    /// Ask the transport to shut down. Safe to call more than once.
    pub fn close(&self) {
        let _ = self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire);
        self.close_signal.cancel();
    }

    /// The transport finished shutting down.
    pub fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.close_signal.cancel();
    }

    /// Resolves once `close` or `mark_closed` has been called.
    pub fn close_signal(&self) -> CancellationToken {
        self.close_signal.clone()
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Queue a frame and make sure someone is draining.
    pub fn push(self: &Arc<Self>, frame: String) {
        if self.state() == TransportState::Closed {
            debug!(conn = %self.id, "dropping frame for closed connection");
            return;
        }
        if self.backlog.enqueue(frame) {
            warn!(conn = %self.id, uid = self.uid(), "slow client, frame dropped");
        }
        if self.backlog.try_claim() {
            let conn = Arc::clone(self);
            tokio::spawn(async move { conn.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            while let Some(frame) = self.backlog.pop() {
                let bytes = frame.len();
                match self.sink.send(frame).await {
                    Ok(()) => self.bandwidth.record_out(bytes),
                    Err(e) => warn!(conn = %self.id, error = %e, "failed to send frame"),
                }
            }
            self.backlog.release();
            // A producer may have enqueued between the last pop and release
            // and then lost the claim to us.
            if self.backlog.is_empty() || !self.backlog.try_claim() {
                break;
            }
        }
    }
}
