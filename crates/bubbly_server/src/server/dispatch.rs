#![forbid(unsafe_code)]

use std::sync::Arc;

use bubbly_domain::{Message, MessageId, MessageType, Room, UserId};
use bubbly_protocol::{BroadcastEnvelope, MessageEvent, MessageView, ProfileView, TypingEvent, encode_event};
use tracing::{debug, warn};

use super::error::{ChatError, ChatResult};
use super::locks::RoomLocks;
use super::message_log::MessageLog;
use super::notify::{NotificationBridge, PushEvent};
use super::room_hub::MessageBus;
use super::store::ChatStore;

/// Persist-then-publish pipeline shared by the gateway and the room manager.
///
/// Within one room, appends and their publishes run under the room's ordering lock so
/// subscribers observe messages in commit order.
#[derive(Clone)]
pub struct RoomDispatcher {
	store: Arc<dyn ChatStore>,
	log: MessageLog,
	bus: Arc<dyn MessageBus>,
	bridge: Arc<dyn NotificationBridge>,
	ordering: RoomLocks,
	max_frame_bytes: usize,
}

impl RoomDispatcher {
	pub fn new(
		store: Arc<dyn ChatStore>,
		log: MessageLog,
		bus: Arc<dyn MessageBus>,
		bridge: Arc<dyn NotificationBridge>,
		max_frame_bytes: usize,
	) -> Self {
		Self {
			store,
			log,
			bus,
			bridge,
			ordering: RoomLocks::new(),
			max_frame_bytes,
		}
	}

	pub fn log(&self) -> &MessageLog {
		&self.log
	}

	pub fn bus(&self) -> &Arc<dyn MessageBus> {
		&self.bus
	}

	/// Append a message, publish it to the room topic, then hand it to the notification bridge.
	///
	/// The outbound event is size-checked before the append, so a persisted message is
	/// always published. Nothing is published when the append fails.
	pub async fn post(
		&self,
		room: &Room,
		author: UserId,
		msg_type: MessageType,
		content: String,
		nonce: Option<String>,
	) -> ChatResult<Message> {
		let message = {
			let _order = self.ordering.lock(room.id).await;

			let new = self.log.prepare(room, author, msg_type, content).await?;
			let author_view = self.profile_view(author).await?;

			// The widest id the store can hand out bounds the final frame size.
			let provisional = Message {
				id: MessageId(i64::MAX),
				room: new.room,
				author: new.author,
				timestamp: new.timestamp,
				msg_type: new.msg_type,
				content: new.content.clone(),
			};
			self.encode_message(room, &provisional, author_view.clone(), nonce.clone())?;

			let message = self.log.commit(new).await?;
			let envelope = self.encode_message(room, &message, author_view, nonce)?;
			let delivered = self.bus.publish(&room.topic(), envelope).await;
			debug!(room = %room.id, message = %message.id, delivered, "message published");
			message
		};

		self.notify(room, &message).await?;
		Ok(message)
	}

	fn encode_message(
		&self,
		room: &Room,
		message: &Message,
		author: ProfileView,
		nonce: Option<String>,
	) -> ChatResult<BroadcastEnvelope> {
		let event = MessageEvent {
			nonce,
			msg_data: MessageView::new(message, author),
		};
		encode_event(&event, self.max_frame_bytes).map_err(|e| {
			warn!(room = %room.id, msg_type = message.msg_type.code(), error = %e, "message event could not be encoded");
			ChatError::InvalidInput(e.to_string())
		})
	}

	/// Ephemeral typing indicator; never persisted.
	pub async fn typing(&self, room: &Room, user: UserId) -> ChatResult<usize> {
		let event = TypingEvent {
			user: self.profile_view(user).await?,
		};
		let envelope = encode_event(&event, self.max_frame_bytes).map_err(|e| ChatError::InvalidInput(e.to_string()))?;
		Ok(self.bus.publish(&room.topic(), envelope).await)
	}

	/// Hand a persisted message to the notification bridge.
	pub async fn notify(&self, room: &Room, message: &Message) -> ChatResult<()> {
		let members = self.store.memberships(room.id).await?;
		let author = self.store.profile(message.author).await?;
		self.bridge
			.deliver(PushEvent::for_message(room, message, author.as_ref(), &members));
		Ok(())
	}

	/// End `user`'s open connections to the room.
	pub async fn disconnect(&self, room: &Room, user: UserId) -> usize {
		let removed = self.bus.disconnect(&room.topic(), user).await;
		debug!(room = %room.id, user = %user, removed, "member connections ended");
		removed
	}

	/// End every open connection of a deleted room.
	pub async fn close_room(&self, room: &Room) {
		self.bus.close_topic(&room.topic()).await;
		self.ordering.forget(room.id).await;
	}

	pub async fn profile_view(&self, user: UserId) -> ChatResult<ProfileView> {
		Ok(match self.store.profile(user).await? {
			Some(profile) => ProfileView::from_profile(&profile),
			None => ProfileView {
				username: user.to_string(),
				alias: user.to_string(),
				profile_pic: String::new(),
				fave_color: String::new(),
			},
		})
	}
}
