#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;
use bubbly_domain::{
	CommunityId, Icon, IconId, Membership, Message, MessageId, MessageType, Role, Room, RoomId, RoomVariant, UserId,
	UserProfile,
};
use tokio::sync::Mutex;

/// Variant data for a room that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewRoomVariant {
	Group,
	Direct { u1: UserId, u2: UserId },
	/// `order` is assigned by the store as one past the community's highest.
	Public { community: CommunityId, description: String },
}

#[derive(Debug, Clone)]
pub struct NewMember {
	pub identity: UserId,
	pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
	pub room: RoomId,
	pub author: UserId,
	pub timestamp: i64,
	pub msg_type: MessageType,
	pub content: String,
}

/// Everything written by a single room creation.
#[derive(Debug, Clone)]
pub struct NewRoom {
	pub name: Option<String>,
	pub bg_img: Option<String>,
	pub variant: NewRoomVariant,
	pub members: Vec<NewMember>,
	pub created_at: i64,
	/// Author, type and content of the opening system message.
	pub opening: Option<(UserId, MessageType, String)>,
}

#[derive(Debug, Clone)]
pub struct CreatedRoom {
	pub room: Room,
	pub memberships: Vec<Membership>,
	pub opening: Option<Message>,
}

/// Durable rooms, memberships and messages, plus read access to the
/// collaborator tables (profiles, blocks, community roles, icons).
///
/// Membership listings are ordered by `(joined_at, identity)` ascending.
/// Message pages are ordered newest first by `(timestamp, id)`.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
	/// Insert the room, its memberships and its opening message atomically.
	async fn create_room(&self, new: NewRoom) -> anyhow::Result<CreatedRoom>;

	async fn room(&self, id: RoomId) -> anyhow::Result<Option<Room>>;

	/// The Direct room for the unordered pair, if any.
	async fn find_direct(&self, a: UserId, b: UserId) -> anyhow::Result<Option<Room>>;

	/// Persist `name` and `bg_img`; returns false when the room is gone.
	async fn update_room(&self, room: &Room) -> anyhow::Result<bool>;

	/// Delete a room with its memberships and messages.
	async fn delete_room(&self, id: RoomId) -> anyhow::Result<bool>;

	/// Returns false when the membership already exists.
	async fn insert_membership(&self, membership: &Membership) -> anyhow::Result<bool>;

	async fn membership(&self, room: RoomId, user: UserId) -> anyhow::Result<Option<Membership>>;

	async fn memberships(&self, room: RoomId) -> anyhow::Result<Vec<Membership>>;

	async fn memberships_for_user(&self, user: UserId) -> anyhow::Result<Vec<Membership>>;

	async fn update_membership(&self, membership: &Membership) -> anyhow::Result<bool>;

	async fn delete_membership(&self, room: RoomId, user: UserId) -> anyhow::Result<bool>;

	async fn insert_message(&self, new: NewMessage) -> anyhow::Result<Message>;

	/// Up to `limit` messages strictly older than `offset` (or from the newest when
	/// `offset` is `None` or not a message of this room).
	async fn messages_page(&self, room: RoomId, offset: Option<MessageId>, limit: usize)
	-> anyhow::Result<Vec<Message>>;

	async fn latest_message(&self, room: RoomId) -> anyhow::Result<Option<Message>>;

	async fn profile(&self, user: UserId) -> anyhow::Result<Option<UserProfile>>;

	/// Whether `blocker` blocks `target` (one direction only).
	async fn is_blocked(&self, blocker: UserId, target: UserId) -> anyhow::Result<bool>;

	async fn community_role(&self, community: &CommunityId, user: UserId) -> anyhow::Result<Option<Role>>;

	async fn set_community_role(&self, community: &CommunityId, user: UserId, role: Role) -> anyhow::Result<()>;

	/// Record `role` only when the user has no row in the community; returns whether it was written.
	async fn insert_community_role_if_absent(
		&self,
		community: &CommunityId,
		user: UserId,
		role: Role,
	) -> anyhow::Result<bool>;

	/// Every community the user has a row in, with their role.
	async fn communities_for_user(&self, user: UserId) -> anyhow::Result<Vec<(CommunityId, Role)>>;

	/// Public rooms of one community, by `order`.
	async fn public_rooms(&self, community: &CommunityId) -> anyhow::Result<Vec<Room>>;

	async fn icon(&self, id: IconId) -> anyhow::Result<Option<Icon>>;
}

/// Whether a block exists in either direction between `a` and `b`.
pub async fn blocked_either_way(store: &dyn ChatStore, a: UserId, b: UserId) -> anyhow::Result<bool> {
	Ok(store.is_blocked(a, b).await? || store.is_blocked(b, a).await?)
}

#[derive(Debug, Default)]
struct MemoryTables {
	next_room: i64,
	next_message: i64,
	rooms: BTreeMap<RoomId, Room>,
	/// Keyed by `(room, identity)`.
	memberships: BTreeMap<(RoomId, UserId), Membership>,
	messages: HashMap<RoomId, Vec<Message>>,
	users: HashMap<UserId, UserProfile>,
	blocks: HashSet<(UserId, UserId)>,
	roles: HashMap<(CommunityId, UserId), Role>,
	icons: HashMap<IconId, Icon>,
}

impl MemoryTables {
	fn find_direct(&self, a: UserId, b: UserId) -> Option<&Room> {
		self.rooms.values().find(|room| match room.variant {
			RoomVariant::Direct { u1, u2 } => (u1 == a && u2 == b) || (u1 == b && u2 == a),
			_ => false,
		})
	}

	fn next_public_order(&self, community: &CommunityId) -> u32 {
		self.rooms
			.values()
			.filter_map(|room| match &room.variant {
				RoomVariant::Public { community: c, order, .. } if c == community => Some(*order),
				_ => None,
			})
			.max()
			.unwrap_or(0)
			+ 1
	}

	fn push_message(&mut self, new: NewMessage) -> Message {
		self.next_message += 1;
		let message = Message {
			id: MessageId(self.next_message),
			room: new.room,
			author: new.author,
			timestamp: new.timestamp,
			msg_type: new.msg_type,
			content: new.content,
		};
		self.messages.entry(new.room).or_default().push(message.clone());
		message
	}

	fn sorted_messages(&self, room: RoomId) -> Vec<Message> {
		let mut messages = self.messages.get(&room).cloned().unwrap_or_default();
		messages.sort_by_key(|m| std::cmp::Reverse(m.order_key()));
		messages
	}
}

/// Map-backed store used by tests and when no database is configured.
pub struct InMemoryChatStore {
	inner: Mutex<MemoryTables>,
}

impl Default for InMemoryChatStore {
	fn default() -> Self {
		Self {
			inner: Mutex::new(MemoryTables::default()),
		}
	}
}

impl InMemoryChatStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn put_user(&self, profile: UserProfile) {
		self.inner.lock().await.users.insert(profile.id, profile);
	}

	pub async fn block(&self, blocker: UserId, target: UserId) {
		self.inner.lock().await.blocks.insert((blocker, target));
	}

	pub async fn put_icon(&self, icon: Icon) {
		self.inner.lock().await.icons.insert(icon.id, icon);
	}
}

#[async_trait::async_trait]
impl ChatStore for InMemoryChatStore {
	async fn create_room(&self, new: NewRoom) -> anyhow::Result<CreatedRoom> {
		let mut guard = self.inner.lock().await;

		let variant = match new.variant {
			NewRoomVariant::Group => RoomVariant::Group,
			NewRoomVariant::Direct { u1, u2 } => {
				if guard.find_direct(u1, u2).is_some() {
					return Err(anyhow!("direct room already exists for {u1} and {u2}"));
				}
				RoomVariant::Direct { u1, u2 }
			}
			NewRoomVariant::Public { community, description } => {
				let order = guard.next_public_order(&community);
				RoomVariant::Public {
					community,
					order,
					description,
				}
			}
		};

		guard.next_room += 1;
		let room = Room {
			id: RoomId(guard.next_room),
			name: new.name,
			bg_img: new.bg_img,
			variant,
		};
		guard.rooms.insert(room.id, room.clone());

		let mut memberships = Vec::with_capacity(new.members.len());
		for member in new.members {
			let membership = Membership::new(room.id, member.identity, member.is_admin, new.created_at);
			guard.memberships.insert((room.id, member.identity), membership.clone());
			memberships.push(membership);
		}

		let opening = new.opening.map(|(author, msg_type, content)| {
			guard.push_message(NewMessage {
				room: room.id,
				author,
				timestamp: new.created_at,
				msg_type,
				content,
			})
		});

		Ok(CreatedRoom {
			room,
			memberships,
			opening,
		})
	}

	async fn room(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		Ok(self.inner.lock().await.rooms.get(&id).cloned())
	}

	async fn find_direct(&self, a: UserId, b: UserId) -> anyhow::Result<Option<Room>> {
		Ok(self.inner.lock().await.find_direct(a, b).cloned())
	}

	async fn update_room(&self, room: &Room) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		match guard.rooms.get_mut(&room.id) {
			Some(existing) => {
				existing.name = room.name.clone();
				existing.bg_img = room.bg_img.clone();
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn delete_room(&self, id: RoomId) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		if guard.rooms.remove(&id).is_none() {
			return Ok(false);
		}
		guard.memberships.retain(|(room, _), _| *room != id);
		guard.messages.remove(&id);
		Ok(true)
	}

	async fn insert_membership(&self, membership: &Membership) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		if !guard.rooms.contains_key(&membership.room) {
			return Err(anyhow!("room {} does not exist", membership.room));
		}

		let key = (membership.room, membership.identity);
		if guard.memberships.contains_key(&key) {
			return Ok(false);
		}
		guard.memberships.insert(key, membership.clone());
		Ok(true)
	}

	async fn membership(&self, room: RoomId, user: UserId) -> anyhow::Result<Option<Membership>> {
		Ok(self.inner.lock().await.memberships.get(&(room, user)).cloned())
	}

	async fn memberships(&self, room: RoomId) -> anyhow::Result<Vec<Membership>> {
		let guard = self.inner.lock().await;
		let mut rows = guard
			.memberships
			.range((room, UserId(i64::MIN))..=(room, UserId(i64::MAX)))
			.map(|(_, m)| m.clone())
			.collect::<Vec<_>>();
		rows.sort_by_key(|m| (m.joined_at, m.identity));
		Ok(rows)
	}

	async fn memberships_for_user(&self, user: UserId) -> anyhow::Result<Vec<Membership>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.memberships
			.values()
			.filter(|m| m.identity == user)
			.cloned()
			.collect())
	}

	async fn update_membership(&self, membership: &Membership) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		match guard.memberships.get_mut(&(membership.room, membership.identity)) {
			Some(existing) => {
				*existing = membership.clone();
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn delete_membership(&self, room: RoomId, user: UserId) -> anyhow::Result<bool> {
		Ok(self.inner.lock().await.memberships.remove(&(room, user)).is_some())
	}

	async fn insert_message(&self, new: NewMessage) -> anyhow::Result<Message> {
		let mut guard = self.inner.lock().await;
		if !guard.rooms.contains_key(&new.room) {
			return Err(anyhow!("room {} does not exist", new.room));
		}
		Ok(guard.push_message(new))
	}

	async fn messages_page(
		&self,
		room: RoomId,
		offset: Option<MessageId>,
		limit: usize,
	) -> anyhow::Result<Vec<Message>> {
		let guard = self.inner.lock().await;
		let messages = guard.sorted_messages(room);
		Ok(super::pagination::page_after(messages, |m| m.id, offset.as_ref(), limit))
	}

	async fn latest_message(&self, room: RoomId) -> anyhow::Result<Option<Message>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.messages
			.get(&room)
			.and_then(|msgs| msgs.iter().max_by_key(|m| m.order_key()))
			.cloned())
	}

	async fn profile(&self, user: UserId) -> anyhow::Result<Option<UserProfile>> {
		Ok(self.inner.lock().await.users.get(&user).cloned())
	}

	async fn is_blocked(&self, blocker: UserId, target: UserId) -> anyhow::Result<bool> {
		Ok(self.inner.lock().await.blocks.contains(&(blocker, target)))
	}

	async fn community_role(&self, community: &CommunityId, user: UserId) -> anyhow::Result<Option<Role>> {
		Ok(self.inner.lock().await.roles.get(&(community.clone(), user)).copied())
	}

	async fn set_community_role(&self, community: &CommunityId, user: UserId, role: Role) -> anyhow::Result<()> {
		self.inner.lock().await.roles.insert((community.clone(), user), role);
		Ok(())
	}

	async fn insert_community_role_if_absent(
		&self,
		community: &CommunityId,
		user: UserId,
		role: Role,
	) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		match guard.roles.entry((community.clone(), user)) {
			Entry::Occupied(_) => Ok(false),
			Entry::Vacant(slot) => {
				slot.insert(role);
				Ok(true)
			}
		}
	}

	async fn communities_for_user(&self, user: UserId) -> anyhow::Result<Vec<(CommunityId, Role)>> {
		let guard = self.inner.lock().await;
		let mut rows = guard
			.roles
			.iter()
			.filter(|((_, member), _)| *member == user)
			.map(|((community, _), role)| (community.clone(), *role))
			.collect::<Vec<_>>();
		rows.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
		Ok(rows)
	}

	async fn public_rooms(&self, community: &CommunityId) -> anyhow::Result<Vec<Room>> {
		let guard = self.inner.lock().await;
		let mut rooms = guard
			.rooms
			.values()
			.filter_map(|room| match &room.variant {
				RoomVariant::Public { community: c, order, .. } if c == community => Some((*order, room.clone())),
				_ => None,
			})
			.collect::<Vec<_>>();
		rooms.sort_by_key(|(order, _)| *order);
		Ok(rooms.into_iter().map(|(_, room)| room).collect())
	}

	async fn icon(&self, id: IconId) -> anyhow::Result<Option<Icon>> {
		Ok(self.inner.lock().await.icons.get(&id).cloned())
	}
}
