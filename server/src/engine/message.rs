use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::user::UserSnapshot;

/// Who a new message is attributed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Sender {
    /// A chat participant; the hub captures their profile snapshot at post time.
    User(u64),
    /// A module or the server itself, shown under the given name.
    System(String),
}

/// A message before the hub has assigned its id and sender snapshot.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: Sender,
    pub text: String,
    pub tag: String,
    pub posted_at: DateTime<Utc>,
    /// Shown in transcripts.
    pub display: bool,
    /// Counted toward the sender's spam score.
    pub spammable: bool,
}

impl NewMessage {
    /// A regular chat post: displayed and spam-scored.
    pub fn chat(uid: u64, text: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            sender: Sender::User(uid),
            text: text.into(),
            tag: tag.into(),
            posted_at: Utc::now(),
            display: true,
            spammable: true,
        }
    }

    pub fn at(mut self, posted_at: DateTime<Utc>) -> Self {
        self.posted_at = posted_at;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.display = false;
        self.spammable = false;
        self
    }
}

/// An immutable, posted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: u64,
    pub sender: UserSnapshot,
    pub text: String,
    pub tag: String,
    pub posted_at: DateTime<Utc>,
    pub display: bool,
    pub spammable: bool,
}

/// Push onto a deque, evicting from the front so it never exceeds `cap`.
pub fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

/// Per-tag transcript of displayable messages.
///
/// Each tag is trimmed on every insert to the configured depth and to the
/// maximum age, so a tag never holds more than `depth` messages or anything
/// older than `max_age`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    tags: HashMap<String, VecDeque<Message>>,
}

impl History {
    pub fn insert(&mut self, message: Message, depth: usize, max_age: Duration, now: DateTime<Utc>) {
        let queue = self.tags.entry(message.tag.clone()).or_default();
        push_bounded(queue, message, depth);
        let cutoff = now - max_age;
        while queue.front().is_some_and(|m| m.posted_at < cutoff) {
            queue.pop_front();
        }
    }

    /// Drop expired messages from every tag, removing tags left empty.
    pub fn prune(&mut self, max_age: Duration, now: DateTime<Utc>) {
        let cutoff = now - max_age;
        for queue in self.tags.values_mut() {
            queue.retain(|m| m.posted_at >= cutoff);
        }
        self.tags.retain(|_, q| !q.is_empty());
    }

    pub fn tag(&self, tag: &str) -> impl Iterator<Item = &Message> {
        self.tags.get(tag).into_iter().flatten()
    }

    /// Messages from every tag accepted by `visible`, ordered by id.
    pub fn visible<F>(&self, visible: F) -> Vec<Message>
    where
        F: Fn(&str) -> bool,
    {
        let mut out: Vec<Message> = self
            .tags
            .iter()
            .filter(|(tag, _)| visible(tag))
            .flat_map(|(_, q)| q.iter().cloned())
            .collect();
        out.sort_by_key(|m| m.id);
        out
    }

    /// Forget every message posted to `tag`.
    pub fn remove_tag(&mut self, tag: &str) {
        self.tags.remove(tag);
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn max_id(&self) -> Option<u64> {
        self.tags.values().flatten().map(|m| m.id).max()
    }

    pub fn len(&self) -> usize {
        self.tags.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u64, tag: &str, posted_at: DateTime<Utc>) -> Message {
        Message {
            id,
            sender: UserSnapshot::system("test"),
            text: format!("message {id}"),
            tag: tag.to_string(),
            posted_at,
            display: true,
            spammable: true,
        }
    }

    #[test]
    fn test_push_bounded_drops_oldest() {
        let mut q = VecDeque::new();
        for i in 0..5 {
            push_bounded(&mut q, i, 3);
        }
        assert_eq!(q, VecDeque::from(vec![2, 3, 4]));
    }

    #[test]
    fn test_history_depth_per_tag() {
        let now = Utc::now();
        let mut history = History::default();
        for id in 1..=10 {
            history.insert(msg(id, "any", now), 4, Duration::hours(24), now);
        }
        history.insert(msg(11, "offtopic", now), 4, Duration::hours(24), now);

        let ids: Vec<u64> = history.tag("any").map(|m| m.id).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
        assert_eq!(history.tag("offtopic").count(), 1);
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn test_history_drops_messages_older_than_max_age() {
        let now = Utc::now();
        let mut history = History::default();
        history.insert(msg(1, "any", now - Duration::hours(30)), 50, Duration::hours(24), now);
        history.insert(msg(2, "any", now - Duration::hours(1)), 50, Duration::hours(24), now);
        let ids: Vec<u64> = history.tag("any").map(|m| m.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_prune_removes_empty_tags() {
        let now = Utc::now();
        let mut history = History::default();
        history.insert(msg(1, "room-1", now), 50, Duration::hours(24), now);
        history.prune(Duration::hours(24), now + Duration::hours(25));
        assert!(history.is_empty());
        assert_eq!(history.max_id(), None);
    }

    #[test]
    fn test_visible_filters_and_orders() {
        let now = Utc::now();
        let mut history = History::default();
        history.insert(msg(3, "any", now), 50, Duration::hours(24), now);
        history.insert(msg(1, "room-1", now), 50, Duration::hours(24), now);
        history.insert(msg(2, "room-2", now), 50, Duration::hours(24), now);

        let visible = history.visible(|tag| tag != "room-2");
        let ids: Vec<u64> = visible.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(history.max_id(), Some(3));
    }

    #[test]
    fn test_remove_tag_keeps_other_tags() {
        let now = Utc::now();
        let mut history = History::default();
        history.insert(msg(1, "room-1", now), 50, Duration::hours(24), now);
        history.insert(msg(2, "any", now), 50, Duration::hours(24), now);
        history.remove_tag("room-1");

        assert_eq!(history.tag("room-1").count(), 0);
        let tags: Vec<&str> = history.tag_names().collect();
        assert_eq!(tags, vec!["any"]);
    }
}
