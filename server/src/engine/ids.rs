use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id sources for messages, sessions and rooms.
///
/// Ids start at 1. On a warm start the hub calls the `observe_*` methods with
/// every id found in persisted data so new ids never collide with old ones.
#[derive(Debug)]
pub struct IdCounters {
    next_message: AtomicU64,
    next_session: AtomicU64,
    next_room: AtomicU64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            next_message: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            next_room: AtomicU64::new(1),
        }
    }
}

impl IdCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_message_id(&self) -> u64 {
        self.next_message.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_room_id(&self) -> u64 {
        self.next_room.fetch_add(1, Ordering::SeqCst)
    }

    pub fn observe_message_id(&self, id: u64) {
        self.next_message.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn observe_session_id(&self, id: u64) {
        self.next_session.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn observe_room_id(&self, id: u64) {
        self.next_room.fetch_max(id + 1, Ordering::SeqCst);
    }
}
