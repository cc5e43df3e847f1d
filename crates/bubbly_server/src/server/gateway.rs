#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bubbly_domain::{Message, Room, RoomId, UserId};
use bubbly_protocol::{InboundFrame, decode_inbound};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::authenticate;
use super::dispatch::RoomDispatcher;
use super::error::{ChatError, ChatResult};
use super::permissions::{AccessLevel, PermissionEvaluator};
use super::room_hub::RoomHubItem;
use super::state::AppState;

/// Lifecycle of one real-time connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Connecting,
	Open,
	Closed,
}

/// Why an inbound frame was not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	Malformed,
	/// Lifecycle message types are produced by room operations only.
	SystemType,
	Rejected,
	/// The user lost access to the room after the connection was admitted.
	Revoked,
	NotOpen,
}

impl DropReason {
	fn as_str(self) -> &'static str {
		match self {
			DropReason::Malformed => "malformed",
			DropReason::SystemType => "system_type",
			DropReason::Rejected => "rejected",
			DropReason::Revoked => "revoked",
			DropReason::NotOpen => "not_open",
		}
	}
}

/// Result of handling one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
	Typing,
	Posted(Message),
	Dropped(DropReason),
}

/// Admits connections and bridges their frames into the room pipeline.
#[derive(Clone)]
pub struct Gateway {
	permissions: PermissionEvaluator,
	dispatcher: RoomDispatcher,
	max_frame_bytes: usize,
	next_conn_id: Arc<AtomicU64>,
}

impl Gateway {
	pub fn new(permissions: PermissionEvaluator, dispatcher: RoomDispatcher, max_frame_bytes: usize) -> Self {
		Self {
			permissions,
			dispatcher,
			max_frame_bytes,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	/// Resolve the room and check basic access, then subscribe.
	///
	/// A connection is only returned (and only subscribed) once the check has passed.
	pub async fn admit(&self, room_id: RoomId, user: Option<UserId>) -> ChatResult<GatewayConnection> {
		let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let mut state = ConnectionState::Connecting;
		metrics::counter!("bubbly_server_connections_total").increment(1);
		debug!(conn_id, room = %room_id, state = ?state, "admission check");

		let admitted = self.check_admission(room_id, user).await;
		let (room, user) = match admitted {
			Ok(ok) => ok,
			Err(e) => {
				metrics::counter!("bubbly_server_admissions_denied_total", "code" => e.code()).increment(1);
				info!(conn_id, room = %room_id, user = ?user, code = e.code(), "connection denied");
				return Err(e);
			}
		};

		let rx = self.dispatcher.bus().subscribe(&room.topic(), user).await;
		state = ConnectionState::Open;
		metrics::gauge!("bubbly_server_active_connections").increment(1.0);
		info!(conn_id, room = %room.id, user = %user, "connection open");

		Ok(GatewayConnection {
			conn_id,
			room,
			user,
			state,
			rx,
			gateway: self.clone(),
		})
	}

	async fn check_admission(&self, room_id: RoomId, user: Option<UserId>) -> ChatResult<(Room, UserId)> {
		let room = self.permissions.authorize(room_id, user, AccessLevel::Basic).await?;
		let user = user.ok_or(ChatError::Unauthenticated)?;
		Ok((room, user))
	}
}

/// An admitted connection: subscribed to its room topic until closed.
pub struct GatewayConnection {
	conn_id: u64,
	room: Room,
	user: UserId,
	state: ConnectionState,
	rx: mpsc::Receiver<RoomHubItem>,
	gateway: Gateway,
}

impl GatewayConnection {
	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	pub fn room(&self) -> &Room {
		&self.room
	}

	pub fn user(&self) -> UserId {
		self.user
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	/// Next item from the room topic; `None` once the topic is closed.
	pub async fn next_item(&mut self) -> Option<RoomHubItem> {
		self.rx.recv().await
	}

	/// Handle one inbound text frame. Bad frames are dropped and the connection stays open.
	pub async fn handle_text(&mut self, text: &str) -> FrameOutcome {
		if self.state != ConnectionState::Open {
			return self.dropped(DropReason::NotOpen);
		}

		if !self.still_admitted().await {
			info!(conn_id = self.conn_id, room = %self.room.id, user = %self.user, "access revoked; closing connection");
			self.mark_closed();
			return self.dropped(DropReason::Revoked);
		}

		let frame = match decode_inbound(text, self.gateway.max_frame_bytes) {
			Ok(frame) => frame,
			Err(e) => {
				debug!(conn_id = self.conn_id, room = %self.room.id, error = %e, "dropping malformed frame");
				return self.dropped(DropReason::Malformed);
			}
		};

		match frame {
			InboundFrame::Typing => match self.gateway.dispatcher.typing(&self.room, self.user).await {
				Ok(_) => FrameOutcome::Typing,
				Err(e) => {
					debug!(conn_id = self.conn_id, room = %self.room.id, error = %e, "typing frame not published");
					self.dropped(DropReason::Rejected)
				}
			},
			InboundFrame::Chat(chat) => {
				if chat.msg_type.is_system() {
					debug!(
						conn_id = self.conn_id,
						room = %self.room.id,
						msg_type = chat.msg_type.code(),
						"dropping client-sent lifecycle message"
					);
					return self.dropped(DropReason::SystemType);
				}

				let posted = self
					.gateway
					.dispatcher
					.post(&self.room, self.user, chat.msg_type, chat.content, Some(chat.nonce))
					.await;
				match posted {
					Ok(message) => FrameOutcome::Posted(message),
					Err(ChatError::Store(e)) => {
						warn!(conn_id = self.conn_id, room = %self.room.id, error = %e, "message append failed");
						self.dropped(DropReason::Rejected)
					}
					Err(e) => {
						debug!(conn_id = self.conn_id, room = %self.room.id, code = e.code(), "message rejected");
						self.dropped(DropReason::Rejected)
					}
				}
			}
		}
	}

	/// Unsubscribe and mark the connection closed.
	pub async fn close(mut self) {
		self.mark_closed();
		let topic = self.room.topic();
		let bus = self.gateway.dispatcher.bus().clone();
		drop(self);
		bus.prune(&topic).await;
	}

	async fn still_admitted(&self) -> bool {
		match self
			.gateway
			.permissions
			.has_basic_access(&self.room, Some(self.user))
			.await
		{
			Ok(allowed) => allowed,
			Err(e) => {
				warn!(conn_id = self.conn_id, room = %self.room.id, error = %e, "access re-check failed");
				false
			}
		}
	}

	fn mark_closed(&mut self) {
		if self.state == ConnectionState::Open {
			self.state = ConnectionState::Closed;
			self.rx.close();
			metrics::gauge!("bubbly_server_active_connections").decrement(1.0);
			info!(conn_id = self.conn_id, room = %self.room.id, user = %self.user, "connection closed");
		}
	}

	fn dropped(&self, reason: DropReason) -> FrameOutcome {
		metrics::counter!("bubbly_server_frames_dropped_total", "reason" => reason.as_str()).increment(1);
		FrameOutcome::Dropped(reason)
	}
}

impl Drop for GatewayConnection {
	fn drop(&mut self) {
		self.mark_closed();
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
	pub token: Option<String>,
}

/// `GET /ws/chat/{room}?token=...`
///
/// Admission happens before the upgrade; a denied attempt never becomes a socket.
pub async fn chat_ws(
	State(state): State<AppState>,
	Path(room_id): Path<i64>,
	Query(query): Query<TokenQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let user = authenticate(query.token.as_deref(), state.auth_secret.as_ref());

	match state.gateway.admit(RoomId(room_id), user).await {
		Ok(conn) => ws.on_upgrade(move |socket| run_connection(conn, socket)),
		Err(e) => admission_status(&e).into_response(),
	}
}

fn admission_status(err: &ChatError) -> StatusCode {
	match err {
		ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
		ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
		ChatError::PermissionDenied(_) | ChatError::NotMember(_) => StatusCode::FORBIDDEN,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

async fn run_connection(mut conn: GatewayConnection, socket: WebSocket) {
	let (mut sender, mut receiver) = socket.split();

	loop {
		tokio::select! {
			item = conn.next_item() => match item {
				Some(RoomHubItem::Frame(envelope)) => {
					if sender.send(WsMessage::Text(envelope.text.into())).await.is_err() {
						break;
					}
				}
				Some(RoomHubItem::Lagged { dropped }) => {
					debug!(conn_id = conn.conn_id(), room = %conn.room().id, dropped, "connection lagging");
				}
				None => {
					debug!(conn_id = conn.conn_id(), room = %conn.room().id, "room topic closed");
					let _ = sender.send(WsMessage::Close(None)).await;
					break;
				}
			},
			incoming = receiver.next() => match incoming {
				Some(Ok(WsMessage::Text(text))) => {
					conn.handle_text(text.as_str()).await;
				}
				Some(Ok(WsMessage::Close(_))) | None => break,
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(conn_id = conn.conn_id(), error = %e, "websocket receive error");
					break;
				}
			},
		}
	}

	conn.close().await;
}
