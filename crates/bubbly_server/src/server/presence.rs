#![forbid(unsafe_code)]

use std::sync::Arc;

use bubbly_domain::{Membership, RoomId, UserId};

use super::error::{ChatError, ChatResult};
use super::locks::RoomLocks;
use super::store::ChatStore;
use crate::util::time::unix_ms_now;

/// Last-seen bookkeeping and lazy unread computation.
#[derive(Clone)]
pub struct PresenceTracker {
	store: Arc<dyn ChatStore>,
	membership_locks: RoomLocks,
}

impl PresenceTracker {
	pub fn new(store: Arc<dyn ChatStore>, membership_locks: RoomLocks) -> Self {
		Self {
			store,
			membership_locks,
		}
	}

	/// Explicit "I have read this room" from the client.
	pub async fn mark_seen(&self, room: RoomId, user: UserId) -> ChatResult<Membership> {
		let _guard = self.membership_locks.lock(room).await;
		let mut membership = self
			.store
			.membership(room, user)
			.await?
			.ok_or(ChatError::NotMember(room))?;

		membership.last_seen = unix_ms_now().max(membership.last_seen);
		self.store.update_membership(&membership).await?;
		Ok(membership)
	}

	/// Whether any of the user's rooms has a message newer than its last-seen mark.
	pub async fn has_unread(&self, user: UserId) -> ChatResult<bool> {
		for membership in self.store.memberships_for_user(user).await? {
			if let Some(latest) = self.store.latest_message(membership.room).await?
				&& latest.timestamp > membership.last_seen
			{
				return Ok(true);
			}
		}
		Ok(false)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use bubbly_domain::MessageType;

	use super::*;
	use crate::server::store::{InMemoryChatStore, NewMember, NewMessage, NewRoom, NewRoomVariant};

	async fn room_with(store: &InMemoryChatStore, members: &[UserId], created_at: i64) -> RoomId {
		store
			.create_room(NewRoom {
				name: None,
				bg_img: None,
				variant: NewRoomVariant::Group,
				members: members
					.iter()
					.map(|id| NewMember {
						identity: *id,
						is_admin: true,
					})
					.collect(),
				created_at,
				opening: None,
			})
			.await
			.unwrap()
			.room
			.id
	}

	#[tokio::test]
	async fn unread_follows_latest_message_and_last_seen() {
		let store = Arc::new(InMemoryChatStore::new());
		let presence = PresenceTracker::new(store.clone(), RoomLocks::new());
		let room = room_with(&store, &[UserId(1), UserId(2)], unix_ms_now()).await;

		assert!(!presence.has_unread(UserId(2)).await.unwrap(), "empty room");

		tokio::time::sleep(Duration::from_millis(5)).await;
		store
			.insert_message(NewMessage {
				room,
				author: UserId(1),
				timestamp: unix_ms_now(),
				msg_type: MessageType::Text,
				content: "hi".into(),
			})
			.await
			.unwrap();

		assert!(presence.has_unread(UserId(2)).await.unwrap());

		tokio::time::sleep(Duration::from_millis(5)).await;
		let seen = presence.mark_seen(room, UserId(2)).await.unwrap();
		assert!(seen.last_seen > seen.joined_at);
		assert!(!presence.has_unread(UserId(2)).await.unwrap());
	}

	#[tokio::test]
	async fn mark_seen_requires_membership() {
		let store = Arc::new(InMemoryChatStore::new());
		let presence = PresenceTracker::new(store.clone(), RoomLocks::new());
		let room = room_with(&store, &[UserId(1)], 0).await;

		assert!(matches!(
			presence.mark_seen(room, UserId(7)).await,
			Err(ChatError::NotMember(_))
		));
	}
}
