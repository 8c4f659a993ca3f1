//! The session hub: identity table, bound connections, rooms and history.
//!
//! All identity, session, room and message mutation happens under the single
//! registry lock. Saving to the store takes a separate persistence lock so a
//! slow write never holds up live traffic. Lock order is always
//! bandwidth, then registry, then persistence; timer paths take the registry
//! and persistence locks with a bounded wait and skip the cycle on timeout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bandwidth::{BandwidthLedger, BandwidthSnapshot};
use super::connection::{Connection, TransportState};
use super::events::{MessageView, RoomView, ServerFrame, UserView};
use super::ids::IdCounters;
use super::message::{History, Message, NewMessage, Sender, push_bounded};
use super::permissions::TagPolicy;
use super::room::{RoomRegistry, RoomRequest, find_next_id};
use super::user::{SpamSignal, User, UserSnapshot};
use crate::auth::token::TokenAuthority;
use crate::collab::localization::{DefaultLocalizer, Localizer, SystemKey, render_system};
use crate::collab::modules::{ModuleOutcome, ModuleRegistry, ModuleReply};
use crate::collab::profile::ProfileSource;
use crate::config::ServerConfig;
use crate::db::snapshots::{self, SnapshotEntry, SnapshotStore};
use crate::error::{ChatError, ProfileError};

/// Everything guarded by the registry lock.
#[derive(Default)]
struct Registry {
    users: HashMap<u64, User>,
    /// Identity to the one connection bound to it.
    bound: HashMap<u64, Arc<Connection>>,
    rooms: RoomRegistry,
    history: History,
    message_log: VecDeque<Message>,
    /// Recent spammable posts, compared against new posts for similarity.
    recent: VecDeque<Message>,
}

impl Registry {
    fn snapshot_of(&self, uid: u64) -> UserSnapshot {
        self.users.get(&uid).map(User::snapshot).unwrap_or_else(|| {
            let mut s = UserSnapshot::system("");
            s.uid = uid;
            s
        })
    }

    fn is_bound_conn(&self, conn: &Connection) -> bool {
        self.bound.get(&conn.uid()).is_some_and(|c| c.id() == conn.id())
    }

    /// Bound connections that may see `tag` (all of them when `tag` is None).
    fn recipients(
        &self,
        policy: &TagPolicy,
        tag: Option<&str>,
        exclude: &[Uuid],
    ) -> Vec<(Arc<Connection>, UserSnapshot)> {
        self.bound
            .iter()
            .filter(|(_, conn)| !exclude.contains(&conn.id()))
            .filter(|(uid, _)| match tag {
                Some(tag) => policy.can_see(tag, self.rooms.is_member(tag, **uid)),
                None => true,
            })
            .map(|(uid, conn)| (conn.clone(), self.snapshot_of(*uid)))
            .collect()
    }

    fn user_list_for(&self, uid: u64, now: DateTime<Utc>) -> ServerFrame {
        let mut users: Vec<UserView> = self
            .bound
            .keys()
            .filter_map(|uid| self.users.get(uid))
            .filter(|u| !u.hiding)
            .map(|u| UserView {
                user: u.snapshot(),
                active: u.is_active(now),
                banned: u.is_banned(now),
            })
            .collect();
        users.sort_by_key(|u| u.user.uid);
        let rooms = self.rooms.rooms_for(uid).map(RoomView::from).collect();
        ServerFrame::user_list(users, rooms)
    }

    /// Drop idle rooms along with their transcripts.
    fn sweep_rooms(&mut self, now: DateTime<Utc>) {
        for name in self.rooms.sweep(now) {
            self.history.remove_tag(&name);
        }
    }

    fn active_identities(&self) -> HashSet<String> {
        self.bound.keys().map(u64::to_string).collect()
    }
}

/// What happened to a post.
#[derive(Debug, Clone, PartialEq)]
pub struct PostOutcome {
    pub signal: SpamSignal,
    /// `None` when the sender is blocked and the post was discarded.
    pub message: Option<Message>,
    /// Accepted but only echoed back to the sender.
    pub shadowed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { sequence: i64 },
    /// A lock could not be taken in time; nothing was written.
    Busy,
    /// Running without a store.
    Disabled,
    Failed(String),
}

#[derive(Debug, Default)]
struct PersistState {
    sequence: i64,
}

pub struct ChatHub {
    config: ServerConfig,
    policy: TagPolicy,
    ids: IdCounters,
    tokens: Arc<TokenAuthority>,
    profiles: Arc<dyn ProfileSource>,
    localizer: Arc<dyn Localizer>,
    modules: ModuleRegistry,
    store: Option<SnapshotStore>,
    bandwidth: Arc<BandwidthLedger>,
    registry: Mutex<Registry>,
    persistence: Mutex<PersistState>,
}

impl ChatHub {
    pub fn new(config: ServerConfig, tokens: Arc<TokenAuthority>, profiles: Arc<dyn ProfileSource>) -> Self {
        let policy = TagPolicy::new(config.chat.global_tags.clone(), config.chat.staff_tags.clone());
        let registry = Registry {
            rooms: RoomRegistry::new(Duration::hours(config.rooms.idle_expiry_hours)),
            ..Default::default()
        };
        Self {
            modules: ModuleRegistry::new(config.chat.module_wait()),
            config,
            policy,
            ids: IdCounters::new(),
            tokens,
            profiles,
            localizer: Arc::new(DefaultLocalizer),
            store: None,
            bandwidth: Arc::new(BandwidthLedger::new()),
            registry: Mutex::new(registry),
            persistence: Mutex::new(PersistState::default()),
        }
    }

    pub fn with_localizer(mut self, localizer: Arc<dyn Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    pub fn with_modules(mut self, modules: ModuleRegistry) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenAuthority> {
        &self.tokens
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthLedger> {
        &self.bandwidth
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn policy(&self) -> &TagPolicy {
        &self.policy
    }

    /// A fresh connection wired to this hub's bandwidth ledger.
    pub fn open_connection(&self, peer: impl Into<String>, sink: Arc<dyn super::connection::FrameSink>) -> Arc<Connection> {
        Connection::new(peer, sink, self.bandwidth.clone(), self.config.chat.backlog_size)
    }

    fn system_frame(&self, key: SystemKey, subject: &UserSnapshot, recipient: &UserSnapshot) -> String {
        ServerFrame::System {
            message: render_system(self.localizer.as_ref(), key, subject, recipient),
            subtype: key.as_str().to_string(),
            uid: subject.uid,
        }
        .encode()
    }

    async fn lock_registry_bounded(&self) -> Option<MutexGuard<'_, Registry>> {
        tokio::time::timeout(self.config.timers.lock_wait(), self.registry.lock())
            .await
            .ok()
    }

    // ── Warm start ──────────────────────────────────────────────────

    /// Restore state from the store. Every blob that fails to load falls
    /// back to empty; id counters resume past the highest persisted id.
    pub async fn load_from_store(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let users: Vec<User> = load_or_default(store, snapshots::USERS).await;
        let message_log: VecDeque<Message> = load_or_default(store, snapshots::MESSAGE_LOG).await;
        let history: History = load_or_default(store, snapshots::HISTORY).await;
        let rooms: RoomRegistry = load_or_default(store, snapshots::ROOMS).await;
        let bandwidth: BandwidthSnapshot = load_or_default(store, snapshots::BANDWIDTH).await;
        let sequence = store.last_sequence().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not read snapshot sequence");
            0
        });

        self.bandwidth.restore(bandwidth);

        let mut reg = self.registry.lock().await;
        for id in message_log.iter().map(|m| m.id).chain(history.max_id()) {
            self.ids.observe_message_id(id);
        }
        for id in users.iter().filter_map(User::max_session_id) {
            self.ids.observe_session_id(id);
        }
        // Closed rooms still name their tag in the log, so count those too
        let next_room = find_next_id(
            rooms
                .names()
                .chain(history.tag_names())
                .chain(message_log.iter().map(|m| m.tag.as_str())),
        );
        if next_room > 1 {
            self.ids.observe_room_id(next_room - 1);
        }

        info!(
            users = users.len(),
            messages = message_log.len(),
            history = history.len(),
            rooms = rooms.len(),
            sequence,
            "restored chat state"
        );
        reg.users = users.into_iter().map(|u| (u.uid, u)).collect();
        reg.message_log = message_log;
        reg.history = history;
        reg.rooms.restore(rooms);
        drop(reg);

        self.persistence.lock().await.sequence = sequence;
    }

    // ── Binding ─────────────────────────────────────────────────────

    pub async fn authenticate(
        &self,
        conn: &Arc<Connection>,
        uid: u64,
        key: &str,
    ) -> Result<Vec<Arc<Connection>>, ChatError> {
        self.authenticate_at(conn, uid, key, Utc::now()).await
    }

    /// Validate the token, refresh the profile and bind `conn` to `uid`.
    ///
    /// Any connection previously bound to `uid` is unbound and returned so
    /// the caller can close its transport.
    pub async fn authenticate_at(
        &self,
        conn: &Arc<Connection>,
        uid: u64,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<Connection>>, ChatError> {
        if conn.is_bound() {
            return Err(ChatError::AlreadyBound);
        }
        if uid == 0 {
            return Err(ChatError::InvalidIdentity);
        }
        if !self.tokens.validate_at(&uid.to_string(), key, now) {
            return Err(ChatError::InvalidKey);
        }

        // Fetch outside the lock; the source can be slow.
        let profile_wait = std::time::Duration::from_secs(self.config.profile.timeout_secs);
        let fetched = tokio::time::timeout(profile_wait, self.profiles.fetch(uid))
            .await
            .unwrap_or(Err(ProfileError::Timeout));

        let mut reg = self.registry.lock().await;
        let is_new = !reg.users.contains_key(&uid);
        let user = reg.users.entry(uid).or_insert_with(|| User::new(uid, now));
        let had_profile = user.has_profile();
        if let Err(e) = user.apply_profile_at(fetched, now) {
            // A cached profile carries us through an unreachable source, but
            // never through a definitive "no such user".
            if e.is_definitive() || !had_profile {
                if is_new {
                    reg.users.remove(&uid);
                }
                return Err(ChatError::Profile(e));
            }
        }

        let session_id = self.ids.next_session_id();
        user.enter_chat_at(session_id, now);
        let join_points = user.join_spam_score_at(now);
        let signal = user.update_spam_at(join_points, &self.config.spam, now);
        let subject = user.snapshot();
        let hiding = user.hiding;

        conn.bind(uid, session_id);
        conn.touch_ping_at(now);
        let mut evicted = Vec::new();
        if let Some(old) = reg.bound.insert(uid, conn.clone())
            && old.id() != conn.id()
        {
            old.unbind();
            old.push(self.system_frame(SystemKey::Evicted, &subject, &subject));
            evicted.push(old);
        }

        info!(uid, session_id, conn = %conn.id(), evicted = evicted.len(), "identity bound");

        conn.push(self.system_frame(SystemKey::Welcome, &subject, &subject));
        match signal {
            SpamSignal::Blocked => conn.push(self.system_frame(SystemKey::SpamBlocked, &subject, &subject)),
            SpamSignal::Warning => conn.push(self.system_frame(SystemKey::SpamWarning, &subject, &subject)),
            SpamSignal::None => {}
        }

        if !hiding {
            for (recipient, snapshot) in reg.recipients(&self.policy, None, &[conn.id()]) {
                recipient.push(self.system_frame(SystemKey::Join, &subject, &snapshot));
            }
            self.push_user_lists(&reg, now);
        }
        drop(reg);

        let outcome = self.modules.on_user_join(&subject).await;
        self.deliver_module_outcome(conn, None, outcome, now).await;

        Ok(evicted)
    }

    pub async fn leave_chat(&self, conn: &Arc<Connection>) {
        self.leave_chat_at(conn, Utc::now()).await;
    }

    /// Unbind `conn`. A connection that was already replaced by a newer
    /// bind for the same identity leaves silently.
    pub async fn leave_chat_at(&self, conn: &Arc<Connection>, now: DateTime<Utc>) {
        let mut reg = self.registry.lock().await;
        let uid = conn.uid();
        if uid == 0 {
            return;
        }
        if !reg.is_bound_conn(conn) {
            conn.unbind();
            return;
        }

        reg.bound.remove(&uid);
        conn.unbind();
        if let Some(user) = reg.users.get_mut(&uid) {
            user.leave_chat_at(conn.session_id(), now);
        }
        let hiding = reg.users.get(&uid).is_some_and(|u| u.hiding);
        let subject = reg.snapshot_of(uid);
        let active = reg.active_identities();
        info!(uid, conn = %conn.id(), "identity left chat");

        if !hiding {
            for (recipient, snapshot) in reg.recipients(&self.policy, None, &[]) {
                recipient.push(self.system_frame(SystemKey::Leave, &subject, &snapshot));
            }
            self.push_user_lists(&reg, now);
        }
        drop(reg);

        self.tokens.reconcile_at(&active, now);
    }

    // ── Presence ────────────────────────────────────────────────────

    pub async fn ping(&self, conn: &Arc<Connection>, active: bool) {
        self.ping_at(conn, active, Utc::now()).await;
    }

    /// Refresh liveness. Pushes a fresh user list when the identity's
    /// active state flips.
    pub async fn ping_at(&self, conn: &Arc<Connection>, active: bool, now: DateTime<Utc>) {
        conn.touch_ping_at(now);
        let uid = conn.uid();
        if uid == 0 {
            return;
        }
        let mut reg = self.registry.lock().await;
        let Some(user) = reg.users.get_mut(&uid) else {
            return;
        };
        let was_active = user.is_active(now);
        user.ping_at(active, now);
        let flipped = was_active != user.is_active(now);
        if flipped && !user.hiding {
            debug!(uid, active, "presence changed");
            self.push_user_lists(&reg, now);
        }
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Moderation checks for posting to `tag`, in order: block, ban, tag
    /// permission.
    pub async fn check_post(&self, uid: u64, tag: &str, now: DateTime<Utc>) -> Result<(), ChatError> {
        let reg = self.registry.lock().await;
        let user = reg.users.get(&uid).ok_or(ChatError::NotBound)?;
        if user.is_blocked(now) {
            return Err(ChatError::Blocked(user.block_seconds_left(now)));
        }
        if user.is_banned(now) {
            return Err(ChatError::Banned);
        }
        self.policy
            .check_post(tag, user.permissions(), reg.rooms.is_member(tag, uid))
    }

    /// Score, store and log a message. Fan-out is left to the caller.
    pub async fn add_message(&self, new: NewMessage) -> PostOutcome {
        let mut reg = self.registry.lock().await;
        self.add_message_locked(&mut reg, new)
    }

    fn add_message_locked(&self, reg: &mut Registry, new: NewMessage) -> PostOutcome {
        let now = new.posted_at;
        let history = &self.config.history;

        let (sender, signal, blocked, shadowed) = match &new.sender {
            Sender::User(uid) => {
                let Some(user) = reg.users.get_mut(uid) else {
                    warn!(uid, "message from unknown identity dropped");
                    return PostOutcome {
                        signal: SpamSignal::None,
                        message: None,
                        shadowed: false,
                    };
                };
                let signal = if new.spammable {
                    let points = user.message_spam_score_at(reg.recent.iter(), &new.text, now);
                    user.update_spam_at(points, &self.config.spam, now)
                } else {
                    SpamSignal::None
                };
                (user.snapshot(), signal, user.is_blocked(now), user.is_shadow_banned(now))
            }
            Sender::System(name) => (UserSnapshot::system(name), SpamSignal::None, false, false),
        };

        if blocked {
            debug!(uid = sender.uid, ?signal, "post discarded, sender blocked");
            return PostOutcome {
                signal,
                message: None,
                shadowed,
            };
        }

        let message = Message {
            id: self.ids.next_message_id(),
            sender,
            text: new.text,
            tag: new.tag,
            posted_at: now,
            display: new.display,
            spammable: new.spammable,
        };

        if !shadowed {
            if message.display {
                let max_age = Duration::hours(history.max_age_hours);
                reg.history
                    .insert(message.clone(), history.depth_per_tag, max_age, now);
            }
            push_bounded(&mut reg.message_log, message.clone(), history.message_log_size);
        }
        if message.spammable {
            push_bounded(&mut reg.recent, message.clone(), history.spam_buffer_size);
        }
        reg.rooms.touch(&message.tag, now);
        if let Sender::User(uid) = new.sender
            && let Some(user) = reg.users.get_mut(&uid)
        {
            user.mark_posted(now);
        }

        PostOutcome {
            signal,
            message: Some(message),
            shadowed,
        }
    }

    /// Add a message from `conn`'s identity and deliver it: everyone who can
    /// see the tag gets it, except shadowed posts which only echo back.
    pub async fn post(&self, conn: &Arc<Connection>, new: NewMessage) -> PostOutcome {
        let mut reg = self.registry.lock().await;
        let outcome = self.add_message_locked(&mut reg, new);

        if let Some(message) = &outcome.message
            && message.display
        {
            let frame = ServerFrame::message_list(vec![MessageView::from(message)]).encode();
            if outcome.shadowed {
                conn.push(frame);
            } else {
                for (recipient, _) in reg.recipients(&self.policy, Some(&message.tag), &[]) {
                    recipient.push(frame.clone());
                }
            }
        }

        let subject = reg.snapshot_of(conn.uid());
        match outcome.signal {
            SpamSignal::Blocked => {
                info!(uid = subject.uid, "identity blocked for spamming");
                conn.push(self.system_frame(SystemKey::SpamBlocked, &subject, &subject));
            }
            SpamSignal::Warning => {
                conn.push(self.system_frame(SystemKey::SpamWarning, &subject, &subject));
            }
            SpamSignal::None => {}
        }
        outcome
    }

    /// Deliver module replies: public ones are posted to `tag` under the
    /// module's name, the rest go privately to `conn`.
    pub async fn deliver_module_outcome(
        &self,
        conn: &Arc<Connection>,
        tag: Option<&str>,
        outcome: ModuleOutcome,
        now: DateTime<Utc>,
    ) {
        for (module, reply) in outcome.replies {
            self.deliver_module_reply(conn, tag, &module, reply, now).await;
        }
    }

    pub async fn deliver_module_reply(
        &self,
        conn: &Arc<Connection>,
        tag: Option<&str>,
        module: &str,
        reply: ModuleReply,
        now: DateTime<Utc>,
    ) {
        match tag {
            Some(tag) if reply.broadcast => {
                let new = NewMessage {
                    sender: Sender::System(module.to_string()),
                    text: reply.text,
                    tag: tag.to_string(),
                    posted_at: now,
                    display: true,
                    spammable: false,
                };
                let mut reg = self.registry.lock().await;
                let outcome = self.add_message_locked(&mut reg, new);
                if let Some(message) = outcome.message {
                    let frame = ServerFrame::message_list(vec![MessageView::from(&message)]).encode();
                    for (recipient, _) in reg.recipients(&self.policy, Some(tag), &[]) {
                        recipient.push(frame.clone());
                    }
                }
            }
            _ => conn.push(
                ServerFrame::System {
                    message: reply.text,
                    subtype: format!("module:{module}"),
                    uid: 0,
                }
                .encode(),
            ),
        }
    }

    // ── Broadcast ───────────────────────────────────────────────────

    /// Send to every bound connection not in `exclude`. `render` runs once
    /// per recipient so each can be personalized.
    pub async fn broadcast<F>(&self, exclude: &[Uuid], render: F)
    where
        F: Fn(&UserSnapshot) -> String,
    {
        let reg = self.registry.lock().await;
        for (conn, recipient) in reg.recipients(&self.policy, None, exclude) {
            conn.push(render(&recipient));
        }
    }

    /// Like [`broadcast`](Self::broadcast), limited to identities that can
    /// see `tag`.
    pub async fn selective_broadcast<F>(&self, tag: &str, exclude: &[Uuid], render: F)
    where
        F: Fn(&UserSnapshot) -> String,
    {
        let reg = self.registry.lock().await;
        for (conn, recipient) in reg.recipients(&self.policy, Some(tag), exclude) {
            conn.push(render(&recipient));
        }
    }

    /// Push every bound connection its own user list.
    pub async fn broadcast_user_lists(&self) {
        let now = Utc::now();
        let Some(mut reg) = self.lock_registry_bounded().await else {
            warn!("registry busy, skipping user list broadcast");
            return;
        };
        reg.sweep_rooms(now);
        self.push_user_lists(&reg, now);
    }

    fn push_user_lists(&self, reg: &Registry, now: DateTime<Utc>) {
        for (uid, conn) in &reg.bound {
            conn.push(reg.user_list_for(*uid, now).encode());
        }
    }

    // ── Rooms ───────────────────────────────────────────────────────

    pub async fn create_room(&self, conn: &Arc<Connection>, members: &[u64]) -> Result<String, ChatError> {
        self.create_room_at(conn, members, Utc::now()).await
    }

    pub async fn create_room_at(
        &self,
        conn: &Arc<Connection>,
        members: &[u64],
        now: DateTime<Utc>,
    ) -> Result<String, ChatError> {
        let uid = conn.uid();
        if uid == 0 {
            return Err(ChatError::NotBound);
        }
        let mut guard = self.registry.lock().await;
        let reg = &mut *guard;
        reg.sweep_rooms(now);
        let creator = reg.users.get(&uid).ok_or(ChatError::NotBound)?;
        let request = RoomRequest {
            creator: uid,
            members,
            creator_restricted: creator.is_banned(now) || creator.is_blocked(now),
            is_known: |member: u64| reg.users.contains_key(&member),
        };
        let room = reg.rooms.create_room(request, &self.ids, now)?;

        let subject = reg.snapshot_of(uid);
        for member in &room.members {
            if let Some(member_conn) = reg.bound.get(member) {
                let recipient = reg.snapshot_of(*member);
                member_conn.push(self.system_frame(SystemKey::RoomCreated, &subject, &recipient));
                member_conn.push(reg.user_list_for(*member, now).encode());
            }
        }
        Ok(room.name)
    }

    pub async fn leave_room(&self, conn: &Arc<Connection>, room: &str) -> Result<(), ChatError> {
        let uid = conn.uid();
        if uid == 0 {
            return Err(ChatError::NotBound);
        }
        let now = Utc::now();
        let mut reg = self.registry.lock().await;
        let before = reg.rooms.leave(room, uid)?;
        if !reg.rooms.contains(room) {
            reg.history.remove_tag(room);
        }
        for member in &before.members {
            if let Some(member_conn) = reg.bound.get(member) {
                member_conn.push(reg.user_list_for(*member, now).encode());
            }
        }
        Ok(())
    }

    // ── Snapshots for requests ──────────────────────────────────────

    pub async fn user_list_for(&self, uid: u64) -> ServerFrame {
        let now = Utc::now();
        let mut reg = self.registry.lock().await;
        reg.sweep_rooms(now);
        reg.user_list_for(uid, now)
    }

    pub async fn message_list_for(&self, uid: u64) -> ServerFrame {
        let reg = self.registry.lock().await;
        let messages = reg
            .history
            .visible(|tag| self.policy.can_see(tag, reg.rooms.is_member(tag, uid)))
            .iter()
            .map(MessageView::from)
            .collect();
        ServerFrame::message_list(messages)
    }

    pub async fn snapshot_of(&self, uid: u64) -> UserSnapshot {
        self.registry.lock().await.snapshot_of(uid)
    }

    /// Copy of an identity's state.
    pub async fn user(&self, uid: u64) -> Option<User> {
        self.registry.lock().await.users.get(&uid).cloned()
    }

    pub async fn bound_connection(&self, uid: u64) -> Option<Arc<Connection>> {
        self.registry.lock().await.bound.get(&uid).cloned()
    }

    pub async fn bound_count(&self) -> usize {
        self.registry.lock().await.bound.len()
    }

    pub async fn room_exists(&self, name: &str) -> bool {
        self.registry.lock().await.rooms.contains(name)
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Write everything to the store, skipping the cycle if either lock
    /// can't be taken in time.
    pub async fn periodic_save(&self) -> SaveOutcome {
        let Some(store) = &self.store else {
            return SaveOutcome::Disabled;
        };
        let wait = self.config.timers.lock_wait();

        let bandwidth = self.bandwidth.snapshot();
        let Some(reg) = self.lock_registry_bounded().await else {
            warn!("registry busy, skipping save");
            return SaveOutcome::Busy;
        };
        let encoded = encode_snapshots(&reg, &bandwidth);
        let Ok(mut persist) = tokio::time::timeout(wait, self.persistence.lock()).await else {
            warn!("persistence busy, skipping save");
            return SaveOutcome::Busy;
        };
        drop(reg);

        let entries = match encoded {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to encode snapshots");
                return SaveOutcome::Failed(e.to_string());
            }
        };
        let sequence = persist.sequence + 1;
        match store.save_all(sequence, &entries).await {
            Ok(()) => {
                persist.sequence = sequence;
                info!(sequence, "chat state saved");
                SaveOutcome::Saved { sequence }
            }
            Err(e) => {
                error!(error = %e, "failed to save chat state");
                SaveOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn periodic_cleanup(&self) -> usize {
        self.periodic_cleanup_at(Utc::now()).await
    }

    /// Evict connections whose transport is closing or that stopped pinging,
    /// then prune history, sweep rooms and reconcile tokens. Returns the
    /// number of evicted connections.
    pub async fn periodic_cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let ping_timeout = Duration::seconds(self.config.timers.ping_timeout_secs);
        let stale: Vec<(Arc<Connection>, Vec<&'static str>)> = {
            let Some(mut reg) = self.lock_registry_bounded().await else {
                warn!("registry busy, skipping cleanup");
                return 0;
            };
            reg.history
                .prune(Duration::hours(self.config.history.max_age_hours), now);
            reg.sweep_rooms(now);
            reg.bound
                .values()
                .filter_map(|conn| {
                    let mut reasons = Vec::new();
                    if conn.state() != TransportState::Open {
                        reasons.push("transport closed");
                    }
                    if now - conn.last_ping() > ping_timeout {
                        reasons.push("ping timeout");
                    }
                    (!reasons.is_empty()).then(|| (conn.clone(), reasons))
                })
                .collect()
        };

        for (conn, reasons) in &stale {
            info!(uid = conn.uid(), conn = %conn.id(), reasons = ?reasons, "evicting stale connection");
            conn.close();
            self.leave_chat_at(conn, now).await;
        }

        let active = self
            .lock_registry_bounded()
            .await
            .map(|reg| reg.active_identities());
        if let Some(active) = active {
            self.tokens.reconcile_at(&active, now);
        }
        stale.len()
    }
}

fn encode_snapshots(reg: &Registry, bandwidth: &BandwidthSnapshot) -> Result<Vec<SnapshotEntry>, crate::error::StoreError> {
    let users: Vec<&User> = reg.users.values().collect();
    Ok(vec![
        SnapshotEntry::encode(snapshots::USERS, &users)?,
        SnapshotEntry::encode(snapshots::MESSAGE_LOG, &reg.message_log)?,
        SnapshotEntry::encode(snapshots::HISTORY, &reg.history)?,
        SnapshotEntry::encode(snapshots::ROOMS, &reg.rooms)?,
        SnapshotEntry::encode(snapshots::BANDWIDTH, bandwidth)?,
    ])
}

async fn load_or_default<T>(store: &SnapshotStore, name: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match store.load(name).await {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            warn!(snapshot = name, error = %e, "failed to load snapshot, starting empty");
            T::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collab::profile::ProfileRecord;
    use crate::error::RoomError;
    use crate::engine::connection::tests::RecordingSink;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex as StdMutex;

    /// Profiles named `user<uid>`, with per-uid overrides.
    #[derive(Default)]
    pub(crate) struct FakeProfiles {
        overrides: StdMutex<HashMap<u64, Result<ProfileRecord, ProfileError>>>,
    }

    impl FakeProfiles {
        pub(crate) fn set(&self, uid: u64, result: Result<ProfileRecord, ProfileError>) {
            self.overrides.lock().unwrap().insert(uid, result);
        }
    }

    impl ProfileSource for FakeProfiles {
        fn fetch(&self, uid: u64) -> BoxFuture<'_, Result<ProfileRecord, ProfileError>> {
            let result = self.overrides.lock().unwrap().get(&uid).cloned().unwrap_or_else(|| {
                Ok(ProfileRecord {
                    username: Some(format!("user{uid}")),
                    ..Default::default()
                })
            });
            Box::pin(async move { result })
        }
    }

    pub(crate) struct Harness {
        pub hub: Arc<ChatHub>,
        pub profiles: Arc<FakeProfiles>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self::with_config(ServerConfig::default())
        }

        pub(crate) fn with_config(config: ServerConfig) -> Self {
            let tokens = Arc::new(TokenAuthority::new(config.auth.token_lifetime()));
            let profiles = Arc::new(FakeProfiles::default());
            let hub = Arc::new(ChatHub::new(config, tokens, profiles.clone()));
            Self { hub, profiles }
        }

        pub(crate) fn connect(&self) -> (Arc<Connection>, Arc<RecordingSink>) {
            let sink = Arc::new(RecordingSink::default());
            (self.hub.open_connection("test", sink.clone()), sink)
        }

        pub(crate) async fn bind_at(&self, uid: u64, now: DateTime<Utc>) -> (Arc<Connection>, Arc<RecordingSink>) {
            let (conn, sink) = self.connect();
            let key = self.hub.tokens().issue_or_get_at(&uid.to_string(), now);
            self.hub.authenticate_at(&conn, uid, &key, now).await.unwrap();
            (conn, sink)
        }

        pub(crate) async fn bind(&self, uid: u64) -> (Arc<Connection>, Arc<RecordingSink>) {
            self.bind_at(uid, Utc::now()).await
        }
    }

    /// Wait for the backlog to flush, then parse every frame sent so far.
    pub(crate) async fn frames(conn: &Connection, sink: &RecordingSink) -> Vec<serde_json::Value> {
        for _ in 0..200 {
            if !conn.backlog().is_draining() && conn.backlog().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        sink.texts()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    pub(crate) fn system_subtypes(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .filter(|f| f["type"] == "system")
            .map(|f| f["subtype"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_bind_sends_welcome_and_opens_session() {
        let h = Harness::new();
        let (conn, sink) = h.bind(7).await;
        assert_eq!(conn.uid(), 7);

        let frames = frames(&conn, &sink).await;
        assert!(system_subtypes(&frames).contains(&"welcome".to_string()));

        let user = h.hub.user(7).await.unwrap();
        assert_eq!(user.profile.username, "user7");
        assert_eq!(user.open_session_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_key_and_rebind() {
        let h = Harness::new();
        let (conn, _) = h.connect();
        assert_eq!(
            h.hub.authenticate(&conn, 7, "forged").await.err(),
            Some(ChatError::InvalidKey)
        );
        assert_eq!(
            h.hub.authenticate(&conn, 0, "x").await.err(),
            Some(ChatError::InvalidIdentity)
        );
        assert!(!conn.is_bound());

        let key = h.hub.tokens().issue_or_get("7");
        h.hub.authenticate(&conn, 7, &key).await.unwrap();
        assert_eq!(
            h.hub.authenticate(&conn, 7, &key).await.err(),
            Some(ChatError::AlreadyBound)
        );
    }

    #[tokio::test]
    async fn test_second_bind_evicts_first() {
        let h = Harness::new();
        let (first, first_sink) = h.bind(9).await;
        let (second, _) = h.connect();
        let key = h.hub.tokens().issue_or_get("9");
        let evicted = h.hub.authenticate(&second, 9, &key).await.unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), first.id());
        assert!(!first.is_bound());
        assert_eq!(h.hub.bound_connection(9).await.unwrap().id(), second.id());
        assert_eq!(h.hub.bound_count().await, 1);
        assert_eq!(h.hub.user(9).await.unwrap().open_session_count(), 1);

        let frames = frames(&first, &first_sink).await;
        assert!(system_subtypes(&frames).contains(&"evicted".to_string()));

        // The evicted connection leaving must not unbind the new one
        h.hub.leave_chat(&first).await;
        assert_eq!(h.hub.bound_connection(9).await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_profile_failure_policy() {
        let h = Harness::new();
        h.profiles.set(5, Err(ProfileError::Timeout));
        let (conn, _) = h.connect();
        let key = h.hub.tokens().issue_or_get("5");
        assert_eq!(
            h.hub.authenticate(&conn, 5, &key).await.err(),
            Some(ChatError::Profile(ProfileError::Timeout))
        );
        assert!(h.hub.user(5).await.is_none());

        // Cached profile carries a transient failure
        let (conn, _) = h.bind(6).await;
        h.hub.leave_chat(&conn).await;
        h.profiles.set(6, Err(ProfileError::Timeout));
        let (again, _) = h.connect();
        let key = h.hub.tokens().issue_or_get("6");
        assert!(h.hub.authenticate(&again, 6, &key).await.is_ok());
        assert_eq!(h.hub.user(6).await.unwrap().profile.username, "user6");

        // But not a definitive one
        h.hub.leave_chat(&again).await;
        h.profiles.set(6, Err(ProfileError::NotFound(6)));
        let (third, _) = h.connect();
        assert!(matches!(
            h.hub.authenticate(&third, 6, &key).await,
            Err(ChatError::Profile(ProfileError::NotFound(6)))
        ));
    }

    #[tokio::test]
    async fn test_leave_notifies_others_unless_hiding() {
        let h = Harness::new();
        let (watcher, watcher_sink) = h.bind(1).await;
        let (leaver, _) = h.bind(2).await;
        h.hub.leave_chat(&leaver).await;
        assert!(!leaver.is_bound());
        assert_eq!(h.hub.user(2).await.unwrap().open_session_count(), 0);

        let subtypes = system_subtypes(&frames(&watcher, &watcher_sink).await);
        assert!(subtypes.contains(&"join".to_string()));
        assert!(subtypes.contains(&"leave".to_string()));

        h.profiles.set(
            3,
            Ok(ProfileRecord {
                username: Some("ghost".into()),
                hiding: Some(true),
                ..Default::default()
            }),
        );
        let before = frames(&watcher, &watcher_sink).await.len();
        let (ghost, _) = h.bind(3).await;
        h.hub.leave_chat(&ghost).await;
        let after = frames(&watcher, &watcher_sink).await;
        assert!(after[before..].iter().all(|f| f["type"] != "system"));
    }

    #[tokio::test]
    async fn test_message_ids_increase_and_fan_out_by_tag() {
        let h = Harness::new();
        let now = Utc::now();
        let (alice, alice_sink) = h.bind_at(1, now).await;
        let (bob, bob_sink) = h.bind_at(2, now).await;
        let (_carol, _) = h.bind_at(3, now).await;

        let room = h.hub.create_room_at(&alice, &[3], now).await.unwrap();
        let first = h
            .hub
            .post(&alice, NewMessage::chat(1, "hello", "any").at(now + Duration::seconds(10)))
            .await;
        let second = h
            .hub
            .post(&alice, NewMessage::chat(1, "secret", room.as_str()).at(now + Duration::seconds(20)))
            .await;
        let a = first.message.unwrap().id;
        let b = second.message.unwrap().id;
        assert!(b > a);

        let texts = |frames: Vec<serde_json::Value>| -> Vec<String> {
            frames
                .iter()
                .filter(|f| f["type"] == "messageList")
                .flat_map(|f| f["messages"].as_array().cloned().unwrap_or_default())
                .map(|m| m["text"].as_str().unwrap_or_default().to_string())
                .collect()
        };
        assert_eq!(texts(frames(&alice, &alice_sink).await), vec!["hello", "secret"]);
        assert_eq!(texts(frames(&bob, &bob_sink).await), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_broadcast_renders_per_recipient() {
        let h = Harness::new();
        let now = Utc::now();
        let (alice, alice_sink) = h.bind_at(1, now).await;
        let (bob, bob_sink) = h.bind_at(2, now).await;
        let (carol, carol_sink) = h.bind_at(3, now).await;
        let room = h.hub.create_room_at(&alice, &[2], now).await.unwrap();

        h.hub
            .broadcast(&[alice.id()], |r| serde_json::json!({"type": "hello", "to": r.username}).to_string())
            .await;
        h.hub
            .selective_broadcast(&room, &[], |r| serde_json::json!({"type": "roomNote", "to": r.uid}).to_string())
            .await;

        let custom = |frames: Vec<serde_json::Value>| -> Vec<String> {
            frames
                .into_iter()
                .filter(|f| f["type"] == "hello" || f["type"] == "roomNote")
                .map(|f| format!("{}:{}", f["type"].as_str().unwrap(), f["to"]))
                .collect()
        };
        assert_eq!(custom(frames(&alice, &alice_sink).await), vec!["roomNote:1"]);
        assert_eq!(
            custom(frames(&bob, &bob_sink).await),
            vec!["hello:\"user2\"", "roomNote:2"]
        );
        assert_eq!(custom(frames(&carol, &carol_sink).await), vec!["hello:\"user3\""]);
    }

    #[tokio::test]
    async fn test_shadow_banned_post_only_echoes() {
        let h = Harness::new();
        let now = Utc::now();
        h.profiles.set(
            4,
            Ok(ProfileRecord {
                username: Some("troll".into()),
                shadow_banned: Some(true),
                banned_until: Some(now + Duration::days(1)),
                ..Default::default()
            }),
        );
        let (troll, troll_sink) = h.bind_at(4, now).await;
        let (other, other_sink) = h.bind_at(5, now).await;

        assert!(h.hub.check_post(4, "any", now).await.is_ok());
        let outcome = h
            .hub
            .post(&troll, NewMessage::chat(4, "hi all", "any").at(now + Duration::seconds(5)))
            .await;
        assert!(outcome.shadowed);

        let has_message = |frames: &[serde_json::Value]| frames.iter().any(|f| f["type"] == "messageList");
        assert!(has_message(&frames(&troll, &troll_sink).await));
        assert!(!has_message(&frames(&other, &other_sink).await));
        match h.hub.message_list_for(5).await {
            ServerFrame::MessageList { messages, .. } => assert!(messages.is_empty()),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_post_order() {
        let h = Harness::new();
        let now = Utc::now();
        h.profiles.set(
            8,
            Ok(ProfileRecord {
                username: Some("banned".into()),
                banned_until: Some(now + Duration::hours(1)),
                ..Default::default()
            }),
        );
        h.bind_at(8, now).await;
        assert_eq!(h.hub.check_post(8, "any", now).await, Err(ChatError::Banned));

        h.bind_at(1, now).await;
        assert_eq!(
            h.hub.check_post(1, "admin", now).await,
            Err(ChatError::TagDenied("admin".into()))
        );
        assert_eq!(
            h.hub.check_post(1, "room-99", now).await,
            Err(ChatError::TagDenied("room-99".into()))
        );
        assert!(h.hub.check_post(1, "any", now).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_respects_depth() {
        let mut config = ServerConfig::default();
        config.history.depth_per_tag = 3;
        let h = Harness::with_config(config);
        let now = Utc::now();
        h.bind_at(1, now).await;
        for i in 0..6 {
            h.hub
                .add_message(NewMessage::chat(1, format!("msg {i}"), "any").at(now + Duration::minutes(i)))
                .await;
        }
        match h.hub.message_list_for(1).await {
            ServerFrame::MessageList { messages, .. } => {
                let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["msg 3", "msg 4", "msg 5"]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_and_leave_room() {
        let h = Harness::new();
        let now = Utc::now();
        let (alice, _) = h.bind_at(1, now).await;
        let (bob, _) = h.bind_at(2, now).await;

        let room = h.hub.create_room_at(&alice, &[2], now).await.unwrap();
        assert_eq!(
            h.hub.create_room_at(&bob, &[1], now).await,
            Err(ChatError::Room(RoomError::DuplicateRoom(room.clone())))
        );
        assert_eq!(
            h.hub.create_room_at(&alice, &[], now).await,
            Err(ChatError::Room(RoomError::TooFewMembers))
        );
        assert_eq!(
            h.hub.create_room_at(&alice, &[77], now).await,
            Err(ChatError::Room(RoomError::UnknownMember(77)))
        );

        h.hub
            .post(&alice, NewMessage::chat(1, "just us", room.as_str()).at(now))
            .await;
        assert_eq!(h.hub.registry.lock().await.history.tag(&room).count(), 1);

        h.hub.leave_room(&bob, &room).await.unwrap();
        assert!(!h.hub.room_exists(&room).await);
        assert_eq!(h.hub.registry.lock().await.history.tag(&room).count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_silent_and_closed_connections() {
        let h = Harness::new();
        let now = Utc::now();
        let (silent, _) = h.bind_at(1, now).await;
        let (closed, _) = h.bind_at(2, now + Duration::seconds(80)).await;
        let (fine, _) = h.bind_at(3, now + Duration::seconds(80)).await;
        closed.mark_closed();

        let evicted = h.hub.periodic_cleanup_at(now + Duration::seconds(95)).await;
        assert_eq!(evicted, 2);
        assert!(!silent.is_bound());
        assert_eq!(silent.state(), TransportState::Closing);
        assert!(!closed.is_bound());
        assert!(fine.is_bound());
        assert_eq!(h.hub.bound_count().await, 1);
    }

    #[tokio::test]
    async fn test_save_skipped_when_registry_busy() {
        let mut config = ServerConfig::default();
        config.timers.lock_wait_ms = 20;
        let pool = crate::db::pool::create_pool("sqlite::memory:").await.unwrap();
        crate::db::pool::run_migrations(&pool).await.unwrap();
        let tokens = Arc::new(TokenAuthority::new(config.auth.token_lifetime()));
        let hub = ChatHub::new(config, tokens, Arc::new(FakeProfiles::default()))
            .with_store(SnapshotStore::new(pool));

        let guard = hub.registry.lock().await;
        assert_eq!(hub.periodic_save().await, SaveOutcome::Busy);
        drop(guard);
        assert_eq!(hub.periodic_save().await, SaveOutcome::Saved { sequence: 1 });
        assert_eq!(hub.periodic_save().await, SaveOutcome::Saved { sequence: 2 });

        assert_eq!(Harness::new().hub.periodic_save().await, SaveOutcome::Disabled);
    }
}
