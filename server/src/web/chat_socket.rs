//! Per-connection WebSocket actor.
//!
//! Reads frames off the socket, hands each to [`ChatSocket::handle_text`] and
//! queues the single reply on the connection's backlog, so replies and
//! broadcasts reach the client in the order they were produced.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::app_state::AppState;
use crate::collab::modules::CommandParse;
use crate::engine::chat_hub::ChatHub;
use crate::engine::connection::{Connection, FrameSink};
use crate::engine::events::{ClientFrame, RequestKind, Response, ServerFrame, decode_frame};
use crate::engine::message::NewMessage;
use crate::engine::user::User;
use crate::engine::validation::{validate_message, validate_tag};
use crate::error::ChatError;

/// How long a closing connection gets to flush its backlog.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// The one frame sent back for each inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response(Response),
    /// `request` frames are answered with the snapshot itself.
    Snapshot(ServerFrame),
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Response(r) => r.encode(),
            Reply::Snapshot(f) => f.encode(),
        }
    }

    pub fn is_ok(&self) -> bool {
        match self {
            Reply::Response(r) => r.result,
            Reply::Snapshot(_) => true,
        }
    }
}

/// Dispatches decoded frames for one connection.
pub struct ChatSocket {
    hub: Arc<ChatHub>,
    conn: Arc<Connection>,
}

impl ChatSocket {
    pub fn new(hub: Arc<ChatHub>, conn: Arc<Connection>) -> Self {
        Self { hub, conn }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub async fn handle_text(&self, text: &str) -> Reply {
        self.handle_text_at(text, Utc::now()).await
    }

    pub async fn handle_text_at(&self, text: &str, now: DateTime<Utc>) -> Reply {
        self.hub.bandwidth().record_in_at(text.len(), now);

        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn = %self.conn.id(), error = %e, "undecodable frame");
                return Reply::Response(Response::failed(e.response_kind(), vec![e.to_string()]));
            }
        };
        let kind = frame.kind();

        match frame {
            ClientFrame::Bind { uid, key } => {
                Reply::Response(Response::from_result(kind, self.bind(uid, &key, now).await))
            }
            ClientFrame::Ping { active } => {
                self.hub.ping_at(&self.conn, active, now).await;
                Reply::Response(Response::ok(kind))
            }
            ClientFrame::Message { key, text, tag } => Reply::Response(Response::from_result(
                kind,
                self.message(&key, text, tag, now).await,
            )),
            ClientFrame::CreateRoom { users } => {
                match self.hub.create_room_at(&self.conn, &users, now).await {
                    Ok(room) => Reply::Response(Response::ok(kind).with_room(room)),
                    Err(e) => Reply::Response(Response::failed(kind, vec![e.to_string()])),
                }
            }
            ClientFrame::LeaveRoom { room } => Reply::Response(Response::from_result(
                kind,
                self.hub.leave_room(&self.conn, &room).await,
            )),
            ClientFrame::Request { request } => {
                if !self.conn.is_bound() {
                    return Reply::Response(Response::failed(kind, vec![ChatError::NotBound.to_string()]));
                }
                let uid = self.conn.uid();
                Reply::Snapshot(match request {
                    RequestKind::UserList => self.hub.user_list_for(uid).await,
                    RequestKind::MessageList => self.hub.message_list_for(uid).await,
                })
            }
        }
    }

    async fn bind(&self, uid: u64, key: &str, now: DateTime<Utc>) -> Result<(), ChatError> {
        let evicted = self.hub.authenticate_at(&self.conn, uid, key, now).await?;
        for old in evicted {
            info!(uid, old = %old.id(), new = %self.conn.id(), "closing replaced connection");
            old.close();
        }
        Ok(())
    }

    /// Checks run in order and stop at the first failure: content, token,
    /// moderation, tag permission, then command parsing.
    async fn message(&self, key: &str, text: String, tag: String, now: DateTime<Utc>) -> Result<(), ChatError> {
        if !self.conn.is_bound() {
            return Err(ChatError::NotBound);
        }
        let uid = self.conn.uid();
        validate_message(&text, self.hub.config().chat.max_message_length)?;
        if !self.hub.tokens().validate_at(&uid.to_string(), key, now) {
            return Err(ChatError::InvalidKey);
        }
        self.hub.check_post(uid, &tag, now).await?;
        validate_tag(&tag)?;

        let parsed = self.hub.modules().parse(&text);
        if let CommandParse::Malformed { command, usage } = &parsed {
            self.hub
                .post(&self.conn, NewMessage::chat(uid, text.clone(), tag.clone()).at(now).hidden())
                .await;
            return Err(ChatError::Command(format!("Malformed /{command}, usage: {usage}")));
        }

        let outcome = self
            .hub
            .post(&self.conn, NewMessage::chat(uid, text, tag.clone()).at(now))
            .await;
        let Some(message) = outcome.message else {
            return Err(rejected_post(self.hub.user(uid).await.as_ref(), now));
        };
        if outcome.shadowed {
            return Ok(());
        }

        match parsed {
            CommandParse::Parsed(command) => {
                match self.hub.modules().run_command(&command, &message.sender).await {
                    Ok(replies) => {
                        for reply in replies {
                            self.hub
                                .deliver_module_reply(&self.conn, Some(&tag), &command.module, reply, now)
                                .await;
                        }
                    }
                    Err(module) => warn!(uid, %module, "module busy, command dropped"),
                }
            }
            _ => {
                let replies = self.hub.modules().process_message(&message).await;
                self.hub
                    .deliver_module_outcome(&self.conn, Some(&tag), replies, now)
                    .await;
            }
        }
        Ok(())
    }
}

/// Why a post that passed the checks was still not stored.
fn rejected_post(sender: Option<&User>, now: DateTime<Utc>) -> ChatError {
    match sender {
        Some(user) => ChatError::Blocked(user.block_seconds_left(now)),
        None => ChatError::NotBound,
    }
}

/// Outbound half of the socket, shared with the connection's drain task.
struct WsSink {
    sender: Mutex<SplitSink<WebSocket, WsMessage>>,
}

impl FrameSink for WsSink {
    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.sender
                .lock()
                .await
                .send(WsMessage::Text(frame.into()))
                .await
                .map_err(|e| e.to_string())
        })
    }
}

impl WsSink {
    async fn close(&self) {
        let _ = self.sender.lock().await.close().await;
    }
}

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve(hub, socket, peer))
}

/// Drive one WebSocket until the client goes away or the hub closes it.
pub async fn serve(hub: Arc<ChatHub>, socket: WebSocket, peer: SocketAddr) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink {
        sender: Mutex::new(sender),
    });
    let conn = hub.open_connection(peer.to_string(), sink.clone());
    let close_signal = conn.close_signal();
    let actor = ChatSocket::new(hub.clone(), conn.clone());
    info!(conn = %conn.id(), %peer, "chat connection opened");

    loop {
        tokio::select! {
            _ = close_signal.cancelled() => {
                debug!(conn = %conn.id(), "connection closed by hub");
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = actor.handle_text(text.as_str()).await;
                    conn.push(reply.encode());
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn.id(), error = %e, "websocket read failed");
                    break;
                }
            }
        }
    }

    flush(&conn, FLUSH_GRACE).await;
    conn.mark_closed();
    hub.leave_chat(&conn).await;
    sink.close().await;
    info!(conn = %conn.id(), %peer, dropped = conn.backlog().dropped(), "chat connection closed");
}

/// Give the drain task a bounded window to empty the backlog.
async fn flush(conn: &Connection, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while (conn.backlog().is_draining() || !conn.backlog().is_empty())
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
