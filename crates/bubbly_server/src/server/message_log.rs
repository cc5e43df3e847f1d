#![forbid(unsafe_code)]

use std::sync::Arc;

use bubbly_domain::{IconId, Message, MessageId, MessageType, Role, Room, UserId};
use tracing::debug;

use super::error::{ChatError, ChatResult};
use super::pagination::{PageLimits, PageRequest};
use super::store::{ChatStore, NewMessage};
use crate::util::time::unix_ms_now;

/// Append-only, room-scoped message log.
///
/// `append` only persists. Fanout and notification are the caller's job.
#[derive(Clone)]
pub struct MessageLog {
	store: Arc<dyn ChatStore>,
	history_limits: PageLimits,
}

impl MessageLog {
	pub fn new(store: Arc<dyn ChatStore>, history_limits: PageLimits) -> Self {
		Self { store, history_limits }
	}

	/// Validate, normalize and persist one message.
	///
	/// Emote content (an icon id) is replaced by the icon's image reference. Deleted
	/// tombstones always carry empty content.
	pub async fn append(&self, room: &Room, author: UserId, msg_type: MessageType, content: String) -> ChatResult<Message> {
		let new = self.prepare(room, author, msg_type, content).await?;
		self.commit(new).await
	}

	/// The validation half of `append`: the row that would be written, stamped now.
	pub async fn prepare(
		&self,
		room: &Room,
		author: UserId,
		msg_type: MessageType,
		content: String,
	) -> ChatResult<NewMessage> {
		let content = match msg_type {
			MessageType::Emote => self.resolve_emote(room, author, &content).await?,
			MessageType::Deleted => String::new(),
			_ => content,
		};

		Ok(NewMessage {
			room: room.id,
			author,
			timestamp: unix_ms_now(),
			msg_type,
			content,
		})
	}

	/// Persist a prepared message.
	pub async fn commit(&self, new: NewMessage) -> ChatResult<Message> {
		let message = self.store.insert_message(new).await?;

		metrics::counter!("bubbly_server_messages_persisted_total").increment(1);
		debug!(room = %message.room, message = %message.id, msg_type = message.msg_type.code(), "message appended");
		Ok(message)
	}

	/// Newest-first page of a room's history.
	pub async fn history(&self, room: &Room, page: PageRequest<MessageId>) -> ChatResult<Vec<Message>> {
		let limit = self.history_limits.effective(page.limit);
		Ok(self.store.messages_page(room.id, page.offset, limit).await?)
	}

	async fn resolve_emote(&self, room: &Room, author: UserId, content: &str) -> ChatResult<String> {
		let icon_id: IconId = content.parse().map_err(|_| ChatError::IconNotAccessible)?;
		let icon = self
			.store
			.icon(icon_id)
			.await?
			.filter(|icon| icon.active)
			.ok_or(ChatError::IconNotAccessible)?;

		let Some(icon_community) = &icon.community else {
			return Ok(icon.img_src);
		};

		if let Some(room_community) = room.variant.community()
			&& room_community != icon_community
		{
			return Err(ChatError::IconNotAccessible);
		}

		let role = self.store.community_role(icon_community, author).await?;
		if !role.is_some_and(|r| r.at_least(Role::Member)) {
			return Err(ChatError::IconNotAccessible);
		}

		Ok(icon.img_src)
	}
}
