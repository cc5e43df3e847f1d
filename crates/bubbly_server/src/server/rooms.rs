#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use bubbly_domain::{CommunityId, Membership, Message, MessageType, Role, Room, RoomId, RoomVariant, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::dispatch::RoomDispatcher;
use super::error::{ChatError, ChatResult};
use super::locks::RoomLocks;
use super::permissions::{AccessLevel, PermissionEvaluator};
use super::store::{ChatStore, CreatedRoom, NewMember, NewRoom, NewRoomVariant, blocked_either_way};
use crate::util::time::unix_ms_now;

/// Content of the system message every new room opens with.
pub const ROOM_CREATED_CONTENT: &str = "Say hi";

pub const DEFAULT_PUBLIC_DESCRIPTION: &str = "This is a community chat room";

/// Result of a membership removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
	/// The room was deleted along with every membership.
	RoomDeleted,
	/// The membership was removed; `promoted` became admin if nobody else was.
	Removed { promoted: Option<UserId> },
}

/// Mutates rooms and memberships under the room invariants.
///
/// Membership changes on one room are serialized through `membership_locks`.
#[derive(Clone)]
pub struct RoomManager {
	store: Arc<dyn ChatStore>,
	permissions: PermissionEvaluator,
	dispatcher: RoomDispatcher,
	membership_locks: RoomLocks,
	direct_creation: Arc<Mutex<()>>,
}

impl RoomManager {
	pub fn new(
		store: Arc<dyn ChatStore>,
		permissions: PermissionEvaluator,
		dispatcher: RoomDispatcher,
		membership_locks: RoomLocks,
	) -> Self {
		Self {
			store,
			permissions,
			dispatcher,
			membership_locks,
			direct_creation: Arc::new(Mutex::new(())),
		}
	}

	#[cfg(test)]
	pub(crate) fn membership_locks(&self) -> &RoomLocks {
		&self.membership_locks
	}

	/// New Group room with `creator` as its only (admin) member.
	pub async fn create_room(&self, creator: UserId) -> ChatResult<Room> {
		let created = self
			.store
			.create_room(NewRoom {
				name: None,
				bg_img: None,
				variant: NewRoomVariant::Group,
				members: vec![NewMember {
					identity: creator,
					is_admin: true,
				}],
				created_at: unix_ms_now(),
				opening: Some((creator, MessageType::RoomCreated, ROOM_CREATED_CONTENT.to_string())),
			})
			.await?;

		info!(room = %created.room.id, user = %creator, "group room created");
		self.opened(created).await
	}

	/// New Direct room between `a` and `b`, both admin.
	pub async fn create_direct(&self, a: UserId, b: UserId) -> ChatResult<Room> {
		let _guard = self.direct_creation.lock().await;
		self.check_direct_pair(a, b).await?;

		if self.store.find_direct(a, b).await?.is_some() {
			return Err(ChatError::InvariantViolation("direct room already exists for this pair"));
		}
		self.insert_direct(a, b).await
	}

	/// The existing Direct room for the pair, or a new one.
	pub async fn get_or_create_direct(&self, a: UserId, b: UserId) -> ChatResult<Room> {
		let _guard = self.direct_creation.lock().await;
		self.check_direct_pair(a, b).await?;

		if let Some(room) = self.store.find_direct(a, b).await? {
			return Ok(room);
		}
		self.insert_direct(a, b).await
	}

	/// One other participant gives a Direct room; anything else gives a Group room.
	pub async fn create_room_or_direct(&self, actor: UserId, participants: &[UserId]) -> ChatResult<Room> {
		let others = participants
			.iter()
			.copied()
			.filter(|id| *id != actor)
			.collect::<BTreeSet<_>>();

		if others.len() == 1
			&& let Some(other) = others.first()
		{
			return self.get_or_create_direct(actor, *other).await;
		}

		let room = self.create_room(actor).await?;
		if !others.is_empty() {
			let others = others.into_iter().collect::<Vec<_>>();
			self.add_members(actor, room.id, &others).await?;
		}
		Ok(room)
	}

	/// Add members to a room the actor administers; returns how many were added.
	///
	/// Existing members, unknown users, the actor and anyone in a block relation with the
	/// actor are skipped.
	pub async fn add_members(&self, actor: UserId, room_id: RoomId, identities: &[UserId]) -> ChatResult<usize> {
		let room = self.permissions.authorize(room_id, Some(actor), AccessLevel::Admin).await?;
		if room.is_direct() {
			return Err(ChatError::InvariantViolation("direct rooms always have exactly two members"));
		}

		let _guard = self.membership_locks.lock(room.id).await;
		self.require_admin(&room, actor).await?;

		let now = unix_ms_now();
		let mut added = 0usize;
		for identity in identities.iter().copied().collect::<BTreeSet<_>>() {
			if identity == actor || self.store.profile(identity).await?.is_none() {
				continue;
			}
			if blocked_either_way(self.store.as_ref(), actor, identity).await? {
				debug!(room = %room.id, user = %identity, "skipping blocked invitee");
				continue;
			}
			if self
				.store
				.insert_membership(&Membership::new(room.id, identity, false, now))
				.await?
			{
				added += 1;
			}
		}

		if added > 0 {
			self.dispatcher
				.post(&room, actor, MessageType::Invited, added.to_string(), None)
				.await?;
		}

		info!(room = %room.id, user = %actor, added, "members added");
		Ok(added)
	}

	/// Remove `identity` from the room; the member themself or a room admin may do this.
	pub async fn remove_member(&self, actor: UserId, room_id: RoomId, identity: UserId) -> ChatResult<RemoveOutcome> {
		let room = if actor == identity {
			let room = self.load_room(room_id).await?;
			self.permissions.require_member(room.id, actor).await?;
			room
		} else {
			self.permissions.authorize(room_id, Some(actor), AccessLevel::Admin).await?
		};

		let outcome = {
			let _guard = self.membership_locks.lock(room.id).await;

			if actor != identity {
				self.require_admin(&room, actor).await?;
			}
			if self.store.membership(room.id, identity).await?.is_none() {
				return Err(ChatError::NotMember(room.id));
			}

			let memberships = self.store.memberships(room.id).await?;
			if room.is_direct() || memberships.len() <= 1 {
				self.delete_room(&room).await?;
				RemoveOutcome::RoomDeleted
			} else {
				self.store.delete_membership(room.id, identity).await?;
				self.dispatcher.disconnect(&room, identity).await;

				// Survivors come back ordered by (joined_at, identity).
				let survivors = memberships.into_iter().filter(|m| m.identity != identity).collect::<Vec<_>>();
				let mut promoted = None;
				if !survivors.iter().any(|m| m.is_admin)
					&& let Some(first) = survivors.into_iter().next()
				{
					let heir = Membership { is_admin: true, ..first };
					self.store.update_membership(&heir).await?;
					promoted = Some(heir.identity);
				}

				let alias = self.dispatcher.profile_view(identity).await?.alias;
				self.dispatcher
					.post(&room, identity, MessageType::Left, alias, None)
					.await?;

				RemoveOutcome::Removed { promoted }
			}
		};

		if outcome == RemoveOutcome::RoomDeleted {
			self.membership_locks.forget(room.id).await;
		}

		info!(room = %room.id, user = %identity, actor = %actor, outcome = ?outcome, "member removed");
		Ok(outcome)
	}

	/// Grant or revoke admin; never leaves the room without an admin.
	pub async fn set_admin(&self, actor: UserId, room_id: RoomId, identity: UserId, value: bool) -> ChatResult<Membership> {
		let room = self.permissions.authorize(room_id, Some(actor), AccessLevel::Admin).await?;
		if room.is_direct() {
			return Err(ChatError::InvariantViolation("direct room members are always admin"));
		}

		let _guard = self.membership_locks.lock(room.id).await;
		self.require_admin(&room, actor).await?;

		let mut target = self
			.store
			.membership(room.id, identity)
			.await?
			.ok_or(ChatError::NotMember(room.id))?;

		if target.is_admin && !value {
			let admins = self
				.store
				.memberships(room.id)
				.await?
				.iter()
				.filter(|m| m.is_admin)
				.count();
			if admins <= 1 {
				return Err(ChatError::PermissionDenied("room must keep at least one admin"));
			}
		}

		target.is_admin = value;
		self.store.update_membership(&target).await?;
		info!(room = %room.id, user = %identity, is_admin = value, "admin flag changed");
		Ok(target)
	}

	/// Self-service preferences. Only `notifications_enabled` is writable here.
	pub async fn update_my_membership(
		&self,
		user: UserId,
		room_id: RoomId,
		notifications_enabled: Option<bool>,
	) -> ChatResult<Membership> {
		let _guard = self.membership_locks.lock(room_id).await;
		let mut membership = self.permissions.require_member(room_id, user).await?;

		if let Some(enabled) = notifications_enabled {
			membership.notifications_enabled = enabled;
			self.store.update_membership(&membership).await?;
		}
		Ok(membership)
	}

	/// New Public room in `community`; requires community moderator.
	pub async fn create_public_room(
		&self,
		actor: UserId,
		community: CommunityId,
		description: Option<String>,
	) -> ChatResult<Room> {
		if !self
			.permissions
			.community_role_at_least(&community, actor, Role::Moderator)
			.await?
		{
			return Err(ChatError::PermissionDenied("community moderator required"));
		}

		let description = description
			.map(|d| d.trim().to_string())
			.filter(|d| !d.is_empty())
			.unwrap_or_else(|| DEFAULT_PUBLIC_DESCRIPTION.to_string());

		let created = self
			.store
			.create_room(NewRoom {
				name: None,
				bg_img: None,
				variant: NewRoomVariant::Public {
					community: community.clone(),
					description,
				},
				members: vec![NewMember {
					identity: actor,
					is_admin: true,
				}],
				created_at: unix_ms_now(),
				opening: Some((actor, MessageType::RoomCreated, ROOM_CREATED_CONTENT.to_string())),
			})
			.await?;

		info!(room = %created.room.id, community = %community, user = %actor, "public room created");
		self.opened(created).await
	}

	/// Self-join a Public room; moderators joining `as_moderator` become admin.
	pub async fn join_public_room(&self, actor: UserId, room_id: RoomId, as_moderator: bool) -> ChatResult<Membership> {
		let room = self.load_room(room_id).await?;
		let RoomVariant::Public { community, .. } = &room.variant else {
			return Err(ChatError::InvariantViolation("only public rooms can be joined"));
		};

		let role = self.store.community_role(community, actor).await?;
		if !role.is_some_and(|r| r.at_least(Role::Member)) {
			return Err(ChatError::PermissionDenied("community membership required"));
		}
		let make_admin = as_moderator && role.is_some_and(|r| r.at_least(Role::Moderator));

		let _guard = self.membership_locks.lock(room.id).await;

		if let Some(mut existing) = self.store.membership(room.id, actor).await? {
			if make_admin && !existing.is_admin {
				existing.is_admin = true;
				self.store.update_membership(&existing).await?;
			}
			return Ok(existing);
		}

		let membership = Membership::new(room.id, actor, make_admin, unix_ms_now());
		self.store.insert_membership(&membership).await?;
		info!(room = %room.id, user = %actor, is_admin = make_admin, "joined public room");
		Ok(membership)
	}

	/// Public rooms of every community where `user` is at least a member, most recent
	/// activity first, each with its latest message.
	pub async fn explore_public_rooms(&self, user: UserId) -> ChatResult<Vec<(Room, Option<Message>)>> {
		let mut entries = Vec::new();
		for (community, role) in self.store.communities_for_user(user).await? {
			if !role.at_least(Role::Member) {
				continue;
			}
			for room in self.store.public_rooms(&community).await? {
				let latest = self.store.latest_message(room.id).await?;
				entries.push((room, latest));
			}
		}

		entries.sort_by(|(a, a_latest), (b, b_latest)| {
			let activity = |latest: &Option<Message>| latest.as_ref().map(|m| m.timestamp).unwrap_or(i64::MIN);
			(activity(b_latest), b.id).cmp(&(activity(a_latest), a.id))
		});
		Ok(entries)
	}

	/// Rename the room and announce it with a type 6 message.
	pub async fn rename_room(&self, actor: UserId, room_id: RoomId, name: &str) -> ChatResult<Room> {
		let name = name.trim();
		if name.is_empty() {
			return Err(ChatError::InvalidInput("room name must not be empty".into()));
		}

		let mut room = self.permissions.authorize(room_id, Some(actor), AccessLevel::Admin).await?;
		room.name = Some(name.to_string());
		self.store_room_details(&room).await?;
		self.dispatcher
			.post(&room, actor, MessageType::Renamed, name.to_string(), None)
			.await?;
		Ok(room)
	}

	/// Change the background image and announce it with a type 7 message.
	pub async fn change_background(&self, actor: UserId, room_id: RoomId, bg_img: &str) -> ChatResult<Room> {
		let bg_img = bg_img.trim();
		if bg_img.is_empty() {
			return Err(ChatError::InvalidInput("background image must not be empty".into()));
		}

		let mut room = self.permissions.authorize(room_id, Some(actor), AccessLevel::Admin).await?;
		room.bg_img = Some(bg_img.to_string());
		self.store_room_details(&room).await?;
		self.dispatcher
			.post(&room, actor, MessageType::BackgroundChanged, bg_img.to_string(), None)
			.await?;
		Ok(room)
	}

	async fn load_room(&self, room_id: RoomId) -> ChatResult<Room> {
		self.store.room(room_id).await?.ok_or(ChatError::RoomNotFound(room_id))
	}

	async fn store_room_details(&self, room: &Room) -> ChatResult<()> {
		if !self.store.update_room(room).await? {
			return Err(ChatError::RoomNotFound(room.id));
		}
		Ok(())
	}

	async fn check_direct_pair(&self, a: UserId, b: UserId) -> ChatResult<()> {
		if a == b {
			return Err(ChatError::InvariantViolation("direct room needs two distinct users"));
		}
		if blocked_either_way(self.store.as_ref(), a, b).await? {
			return Err(ChatError::AlreadyBlocked);
		}
		Ok(())
	}

	async fn insert_direct(&self, a: UserId, b: UserId) -> ChatResult<Room> {
		let created = self
			.store
			.create_room(NewRoom {
				name: None,
				bg_img: None,
				variant: NewRoomVariant::Direct { u1: a, u2: b },
				members: vec![
					NewMember {
						identity: a,
						is_admin: true,
					},
					NewMember {
						identity: b,
						is_admin: true,
					},
				],
				created_at: unix_ms_now(),
				opening: Some((a, MessageType::RoomCreated, ROOM_CREATED_CONTENT.to_string())),
			})
			.await?;

		info!(room = %created.room.id, u1 = %a, u2 = %b, "direct room created");
		self.opened(created).await
	}

	/// Hand a new room's opening message to the notification bridge.
	async fn opened(&self, created: CreatedRoom) -> ChatResult<Room> {
		if let Some(opening) = &created.opening {
			self.dispatcher.notify(&created.room, opening).await?;
		}
		Ok(created.room)
	}

	async fn require_admin(&self, room: &Room, actor: UserId) -> ChatResult<()> {
		if !self.permissions.has_admin_access(room, Some(actor)).await? {
			return Err(ChatError::PermissionDenied("room admin required"));
		}
		Ok(())
	}

	async fn delete_room(&self, room: &Room) -> ChatResult<()> {
		self.store.delete_room(room.id).await?;
		self.dispatcher.close_room(room).await;
		info!(room = %room.id, kind = %room.kind(), "room deleted");
		Ok(())
	}
}
