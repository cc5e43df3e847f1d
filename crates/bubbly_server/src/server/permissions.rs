#![forbid(unsafe_code)]

use std::sync::Arc;

use bubbly_domain::{CommunityId, Membership, Role, Room, RoomId, RoomVariant, UserId};
use tracing::debug;

use super::error::{ChatError, ChatResult};
use super::store::ChatStore;

/// Access tier required by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
	/// Reads: membership, or community membership for public rooms.
	Basic,
	/// Room mutations: an admin membership.
	Admin,
}

/// Resolves basic/admin access per room variant.
#[derive(Clone)]
pub struct PermissionEvaluator {
	store: Arc<dyn ChatStore>,
	provision_visitants: bool,
}

impl PermissionEvaluator {
	pub fn new(store: Arc<dyn ChatStore>, provision_visitants: bool) -> Self {
		Self {
			store,
			provision_visitants,
		}
	}

	/// Member of the room, or (public rooms only) at least a member of the owning community.
	pub async fn has_basic_access(&self, room: &Room, user: Option<UserId>) -> ChatResult<bool> {
		let Some(user) = user else {
			return Ok(false);
		};

		if self.store.membership(room.id, user).await?.is_some() {
			return Ok(true);
		}

		match &room.variant {
			RoomVariant::Public { community, .. } => self.community_role_at_least(community, user, Role::Member).await,
			RoomVariant::Group | RoomVariant::Direct { .. } => Ok(false),
		}
	}

	pub async fn has_admin_access(&self, room: &Room, user: Option<UserId>) -> ChatResult<bool> {
		let Some(user) = user else {
			return Ok(false);
		};
		Ok(self
			.store
			.membership(room.id, user)
			.await?
			.is_some_and(|m| m.is_admin))
	}

	pub async fn has_access(&self, room: &Room, user: Option<UserId>, level: AccessLevel) -> ChatResult<bool> {
		match level {
			AccessLevel::Basic => self.has_basic_access(room, user).await,
			AccessLevel::Admin => self.has_admin_access(room, user).await,
		}
	}

	/// Load the room and check `level`, failing with `RoomNotFound` / `PermissionDenied`.
	pub async fn authorize(&self, room_id: RoomId, user: Option<UserId>, level: AccessLevel) -> ChatResult<Room> {
		let room = self.store.room(room_id).await?.ok_or(ChatError::RoomNotFound(room_id))?;

		if self.has_access(&room, user, level).await? {
			return Ok(room);
		}

		if user.is_none() {
			return Err(ChatError::Unauthenticated);
		}
		Err(match level {
			AccessLevel::Basic => ChatError::PermissionDenied("no access to this room"),
			AccessLevel::Admin => ChatError::PermissionDenied("room admin required"),
		})
	}

	/// The caller's own membership in `room`.
	pub async fn require_member(&self, room: RoomId, user: UserId) -> ChatResult<Membership> {
		self.store
			.membership(room, user)
			.await?
			.ok_or(ChatError::NotMember(room))
	}

	/// Community role check on the ladder.
	///
	/// With visitant provisioning enabled, a user without any row in the community gets a
	/// `visitant` row recorded. That row is below `member` and never grants access.
	pub async fn community_role_at_least(
		&self,
		community: &CommunityId,
		user: UserId,
		required: Role,
	) -> ChatResult<bool> {
		match self.store.community_role(community, user).await? {
			Some(role) => Ok(role.at_least(required)),
			None if self.provision_visitants => {
				if self
					.store
					.insert_community_role_if_absent(community, user, Role::Visitant)
					.await?
				{
					debug!(community = %community, user = %user, "provisioned visitant community membership");
					return Ok(Role::Visitant.at_least(required));
				}
				// A row appeared since the read; judge by that one.
				let role = self.store.community_role(community, user).await?;
				Ok(role.is_some_and(|r| r.at_least(required)))
			}
			None => Ok(false),
		}
	}
}
