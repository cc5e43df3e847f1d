#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use bubbly_domain::{
	CommunityId, Icon, IconId, Membership, Message, MessageId, MessageType, Role, Room, RoomId, RoomKind, RoomVariant,
	UserId, UserProfile,
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::store::{ChatStore, CreatedRoom, NewMessage, NewRoom, NewRoomVariant};

const ROOM_COLUMNS: &str = "id, name, bg_img, kind, direct_u1, direct_u2, community, public_order, description";
const MEMBERSHIP_COLUMNS: &str = "room_id, user_id, is_admin, notifications_enabled, last_seen, joined_at";
const MESSAGE_COLUMNS: &str = "id, room_id, author, created_at, msg_type, content";

type RoomRow = (
	i64,
	Option<String>,
	Option<String>,
	String,
	Option<i64>,
	Option<i64>,
	Option<String>,
	Option<i64>,
	Option<String>,
);
type MembershipRow = (i64, i64, bool, bool, i64, i64);
type MessageRow = (i64, i64, i64, i64, i64, String);

/// sqlx-backed store (sqlite).
#[derive(Clone)]
pub struct SqliteChatStore {
	pool: SqlitePool,
}

impl SqliteChatStore {
	/// Open the database, creating it if missing, and run migrations.
	///
	/// In-memory databases are pinned to a single connection so every query sees the same data.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (use sqlite:)"));
		}

		let options = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite url")?
			.create_if_missing(true)
			.foreign_keys(true);

		let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect_with(options)
			.await
			.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}

	pub async fn put_user(&self, profile: &UserProfile) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO users (id, username, alias, profile_pic, fave_color) VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT(id) DO UPDATE SET username = excluded.username, alias = excluded.alias, \
			profile_pic = excluded.profile_pic, fave_color = excluded.fave_color",
		)
		.bind(profile.id.get())
		.bind(&profile.username)
		.bind(&profile.alias)
		.bind(&profile.profile_pic)
		.bind(&profile.fave_color)
		.execute(&self.pool)
		.await
		.context("upsert user")?;
		Ok(())
	}

	pub async fn block(&self, blocker: UserId, target: UserId) -> anyhow::Result<()> {
		sqlx::query("INSERT OR IGNORE INTO blocks (blocker, target) VALUES (?, ?)")
			.bind(blocker.get())
			.bind(target.get())
			.execute(&self.pool)
			.await
			.context("insert block")?;
		Ok(())
	}

	pub async fn put_icon(&self, icon: &Icon) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO icons (id, community, img_src, active) VALUES (?, ?, ?, ?) \
			ON CONFLICT(id) DO UPDATE SET community = excluded.community, img_src = excluded.img_src, \
			active = excluded.active",
		)
		.bind(icon.id.get())
		.bind(icon.community.as_ref().map(|c| c.as_str().to_string()))
		.bind(&icon.img_src)
		.bind(icon.active)
		.execute(&self.pool)
		.await
		.context("upsert icon")?;
		Ok(())
	}
}

fn room_from_row(row: RoomRow) -> anyhow::Result<Room> {
	let (id, name, bg_img, kind, u1, u2, community, order, description) = row;
	let variant = match RoomKind::from_str(&kind)? {
		RoomKind::Group => RoomVariant::Group,
		RoomKind::Direct => {
			let (Some(u1), Some(u2)) = (u1, u2) else {
				return Err(anyhow!("direct room {id} is missing its pair"));
			};
			RoomVariant::Direct {
				u1: UserId(u1),
				u2: UserId(u2),
			}
		}
		RoomKind::Public => {
			let (Some(community), Some(order)) = (community, order) else {
				return Err(anyhow!("public room {id} is missing its community"));
			};
			RoomVariant::Public {
				community: CommunityId::new(community)?,
				order: u32::try_from(order).context("public room order out of range")?,
				description: description.unwrap_or_default(),
			}
		}
	};

	Ok(Room {
		id: RoomId(id),
		name,
		bg_img,
		variant,
	})
}

fn membership_from_row(row: MembershipRow) -> Membership {
	let (room, user, is_admin, notifications_enabled, last_seen, joined_at) = row;
	Membership {
		room: RoomId(room),
		identity: UserId(user),
		is_admin,
		notifications_enabled,
		last_seen,
		joined_at,
	}
}

fn message_from_row(row: MessageRow) -> anyhow::Result<Message> {
	let (id, room, author, created_at, msg_type, content) = row;
	Ok(Message {
		id: MessageId(id),
		room: RoomId(room),
		author: UserId(author),
		timestamp: created_at,
		msg_type: MessageType::from_code(msg_type)?,
		content,
	})
}

async fn insert_message_on<'e, E>(executor: E, new: &NewMessage) -> anyhow::Result<Message>
where
	E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
	let (id,): (i64,) = sqlx::query_as(
		"INSERT INTO messages (room_id, author, created_at, msg_type, content) VALUES (?, ?, ?, ?, ?) RETURNING id",
	)
	.bind(new.room.get())
	.bind(new.author.get())
	.bind(new.timestamp)
	.bind(i64::from(new.msg_type.code()))
	.bind(new.content.clone())
	.fetch_one(executor)
	.await
	.context("insert message")?;

	Ok(Message {
		id: MessageId(id),
		room: new.room,
		author: new.author,
		timestamp: new.timestamp,
		msg_type: new.msg_type,
		content: new.content.clone(),
	})
}

#[async_trait::async_trait]
impl ChatStore for SqliteChatStore {
	async fn create_room(&self, new: NewRoom) -> anyhow::Result<CreatedRoom> {
		let mut tx = self.pool.begin().await.context("begin sqlite tx")?;

		let variant = match new.variant {
			NewRoomVariant::Group => RoomVariant::Group,
			NewRoomVariant::Direct { u1, u2 } => RoomVariant::Direct { u1, u2 },
			NewRoomVariant::Public { community, description } => {
				let (max_order,): (Option<i64>,) =
					sqlx::query_as("SELECT MAX(public_order) FROM rooms WHERE kind = 'public' AND community = ?")
						.bind(community.as_str())
						.fetch_one(&mut *tx)
						.await
						.context("select max public order")?;
				let order = u32::try_from(max_order.unwrap_or(0) + 1).context("public room order out of range")?;
				RoomVariant::Public {
					community,
					order,
					description,
				}
			}
		};

		let (u1, u2) = match &variant {
			RoomVariant::Direct { u1, u2 } => (Some(u1.get()), Some(u2.get())),
			_ => (None, None),
		};
		let (community, order, description) = match &variant {
			RoomVariant::Public {
				community,
				order,
				description,
			} => (
				Some(community.as_str().to_string()),
				Some(i64::from(*order)),
				Some(description.clone()),
			),
			_ => (None, None, None),
		};

		let (room_id,): (i64,) = sqlx::query_as(
			"INSERT INTO rooms (name, bg_img, kind, direct_u1, direct_u2, community, public_order, description) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
		)
		.bind(&new.name)
		.bind(&new.bg_img)
		.bind(variant.kind().as_str())
		.bind(u1)
		.bind(u2)
		.bind(community)
		.bind(order)
		.bind(description)
		.fetch_one(&mut *tx)
		.await
		.context("insert room")?;

		let room = Room {
			id: RoomId(room_id),
			name: new.name,
			bg_img: new.bg_img,
			variant,
		};

		let mut memberships = Vec::with_capacity(new.members.len());
		for member in new.members {
			let membership = Membership::new(room.id, member.identity, member.is_admin, new.created_at);
			sqlx::query(&format!("INSERT INTO memberships ({MEMBERSHIP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"))
				.bind(membership.room.get())
				.bind(membership.identity.get())
				.bind(membership.is_admin)
				.bind(membership.notifications_enabled)
				.bind(membership.last_seen)
				.bind(membership.joined_at)
				.execute(&mut *tx)
				.await
				.context("insert initial membership")?;
			memberships.push(membership);
		}

		let opening = match new.opening {
			Some((author, msg_type, content)) => {
				let draft = NewMessage {
					room: room.id,
					author,
					timestamp: new.created_at,
					msg_type,
					content,
				};
				Some(insert_message_on(&mut *tx, &draft).await?)
			}
			None => None,
		};

		tx.commit().await.context("commit sqlite tx")?;

		Ok(CreatedRoom {
			room,
			memberships,
			opening,
		})
	}

	async fn room(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		let row: Option<RoomRow> = sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
			.bind(id.get())
			.fetch_optional(&self.pool)
			.await
			.context("select room")?;
		row.map(room_from_row).transpose()
	}

	async fn find_direct(&self, a: UserId, b: UserId) -> anyhow::Result<Option<Room>> {
		let row: Option<RoomRow> = sqlx::query_as(&format!(
			"SELECT {ROOM_COLUMNS} FROM rooms WHERE kind = 'direct' \
			AND ((direct_u1 = ? AND direct_u2 = ?) OR (direct_u1 = ? AND direct_u2 = ?))"
		))
		.bind(a.get())
		.bind(b.get())
		.bind(b.get())
		.bind(a.get())
		.fetch_optional(&self.pool)
		.await
		.context("select direct room")?;
		row.map(room_from_row).transpose()
	}

	async fn update_room(&self, room: &Room) -> anyhow::Result<bool> {
		let res = sqlx::query("UPDATE rooms SET name = ?, bg_img = ? WHERE id = ?")
			.bind(&room.name)
			.bind(&room.bg_img)
			.bind(room.id.get())
			.execute(&self.pool)
			.await
			.context("update room")?;
		Ok(res.rows_affected() > 0)
	}

	async fn delete_room(&self, id: RoomId) -> anyhow::Result<bool> {
		let mut tx = self.pool.begin().await.context("begin sqlite tx")?;
		sqlx::query("DELETE FROM messages WHERE room_id = ?")
			.bind(id.get())
			.execute(&mut *tx)
			.await
			.context("delete room messages")?;
		sqlx::query("DELETE FROM memberships WHERE room_id = ?")
			.bind(id.get())
			.execute(&mut *tx)
			.await
			.context("delete room memberships")?;
		let res = sqlx::query("DELETE FROM rooms WHERE id = ?")
			.bind(id.get())
			.execute(&mut *tx)
			.await
			.context("delete room")?;
		tx.commit().await.context("commit sqlite tx")?;
		Ok(res.rows_affected() > 0)
	}

	async fn insert_membership(&self, membership: &Membership) -> anyhow::Result<bool> {
		let res = sqlx::query(&format!(
			"INSERT INTO memberships ({MEMBERSHIP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?) \
			ON CONFLICT(room_id, user_id) DO NOTHING"
		))
		.bind(membership.room.get())
		.bind(membership.identity.get())
		.bind(membership.is_admin)
		.bind(membership.notifications_enabled)
		.bind(membership.last_seen)
		.bind(membership.joined_at)
		.execute(&self.pool)
		.await
		.context("insert membership")?;
		Ok(res.rows_affected() > 0)
	}

	async fn membership(&self, room: RoomId, user: UserId) -> anyhow::Result<Option<Membership>> {
		let row: Option<MembershipRow> = sqlx::query_as(&format!(
			"SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE room_id = ? AND user_id = ?"
		))
		.bind(room.get())
		.bind(user.get())
		.fetch_optional(&self.pool)
		.await
		.context("select membership")?;
		Ok(row.map(membership_from_row))
	}

	async fn memberships(&self, room: RoomId) -> anyhow::Result<Vec<Membership>> {
		let rows: Vec<MembershipRow> = sqlx::query_as(&format!(
			"SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE room_id = ? ORDER BY joined_at ASC, user_id ASC"
		))
		.bind(room.get())
		.fetch_all(&self.pool)
		.await
		.context("select memberships")?;
		Ok(rows.into_iter().map(membership_from_row).collect())
	}

	async fn memberships_for_user(&self, user: UserId) -> anyhow::Result<Vec<Membership>> {
		let rows: Vec<MembershipRow> =
			sqlx::query_as(&format!("SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE user_id = ?"))
				.bind(user.get())
				.fetch_all(&self.pool)
				.await
				.context("select user memberships")?;
		Ok(rows.into_iter().map(membership_from_row).collect())
	}

	async fn update_membership(&self, membership: &Membership) -> anyhow::Result<bool> {
		let res = sqlx::query(
			"UPDATE memberships SET is_admin = ?, notifications_enabled = ?, last_seen = ?, joined_at = ? \
			WHERE room_id = ? AND user_id = ?",
		)
		.bind(membership.is_admin)
		.bind(membership.notifications_enabled)
		.bind(membership.last_seen)
		.bind(membership.joined_at)
		.bind(membership.room.get())
		.bind(membership.identity.get())
		.execute(&self.pool)
		.await
		.context("update membership")?;
		Ok(res.rows_affected() > 0)
	}

	async fn delete_membership(&self, room: RoomId, user: UserId) -> anyhow::Result<bool> {
		let res = sqlx::query("DELETE FROM memberships WHERE room_id = ? AND user_id = ?")
			.bind(room.get())
			.bind(user.get())
			.execute(&self.pool)
			.await
			.context("delete membership")?;
		Ok(res.rows_affected() > 0)
	}

	async fn insert_message(&self, new: NewMessage) -> anyhow::Result<Message> {
		insert_message_on(&self.pool, &new).await
	}

	async fn messages_page(
		&self,
		room: RoomId,
		offset: Option<MessageId>,
		limit: usize,
	) -> anyhow::Result<Vec<Message>> {
		let anchor: Option<(i64, i64)> = match offset {
			Some(offset) => sqlx::query_as("SELECT created_at, id FROM messages WHERE id = ? AND room_id = ?")
				.bind(offset.get())
				.bind(room.get())
				.fetch_optional(&self.pool)
				.await
				.context("select page anchor")?,
			None => None,
		};

		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let rows: Vec<MessageRow> = match anchor {
			Some((ts, id)) => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? \
				AND (created_at < ? OR (created_at = ? AND id < ?)) \
				ORDER BY created_at DESC, id DESC LIMIT ?"
			))
			.bind(room.get())
			.bind(ts)
			.bind(ts)
			.bind(id)
			.bind(limit)
			.fetch_all(&self.pool)
			.await
			.context("select message page")?,
			None => sqlx::query_as(&format!(
				"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
			))
			.bind(room.get())
			.bind(limit)
			.fetch_all(&self.pool)
			.await
			.context("select first message page")?,
		};

		rows.into_iter().map(message_from_row).collect()
	}

	async fn latest_message(&self, room: RoomId) -> anyhow::Result<Option<Message>> {
		let row: Option<MessageRow> = sqlx::query_as(&format!(
			"SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? ORDER BY created_at DESC, id DESC LIMIT 1"
		))
		.bind(room.get())
		.fetch_optional(&self.pool)
		.await
		.context("select latest message")?;
		row.map(message_from_row).transpose()
	}

	async fn profile(&self, user: UserId) -> anyhow::Result<Option<UserProfile>> {
		let row: Option<(i64, String, String, String, String)> =
			sqlx::query_as("SELECT id, username, alias, profile_pic, fave_color FROM users WHERE id = ?")
				.bind(user.get())
				.fetch_optional(&self.pool)
				.await
				.context("select user")?;
		Ok(row.map(|(id, username, alias, profile_pic, fave_color)| UserProfile {
			id: UserId(id),
			username,
			alias,
			profile_pic,
			fave_color,
		}))
	}

	async fn is_blocked(&self, blocker: UserId, target: UserId) -> anyhow::Result<bool> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM blocks WHERE blocker = ? AND target = ?")
			.bind(blocker.get())
			.bind(target.get())
			.fetch_optional(&self.pool)
			.await
			.context("select block")?;
		Ok(row.is_some())
	}

	async fn community_role(&self, community: &CommunityId, user: UserId) -> anyhow::Result<Option<Role>> {
		let row: Option<(i64,)> =
			sqlx::query_as("SELECT role FROM community_memberships WHERE community = ? AND user_id = ?")
				.bind(community.as_str())
				.bind(user.get())
				.fetch_optional(&self.pool)
				.await
				.context("select community role")?;
		Ok(row.map(|(rank,)| Role::from_rank(rank)).transpose()?)
	}

	async fn set_community_role(&self, community: &CommunityId, user: UserId, role: Role) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO community_memberships (community, user_id, role) VALUES (?, ?, ?) \
			ON CONFLICT(community, user_id) DO UPDATE SET role = excluded.role",
		)
		.bind(community.as_str())
		.bind(user.get())
		.bind(role.rank())
		.execute(&self.pool)
		.await
		.context("upsert community role")?;
		Ok(())
	}

	async fn insert_community_role_if_absent(
		&self,
		community: &CommunityId,
		user: UserId,
		role: Role,
	) -> anyhow::Result<bool> {
		let res = sqlx::query(
			"INSERT INTO community_memberships (community, user_id, role) VALUES (?, ?, ?) \
			ON CONFLICT(community, user_id) DO NOTHING",
		)
		.bind(community.as_str())
		.bind(user.get())
		.bind(role.rank())
		.execute(&self.pool)
		.await
		.context("insert community role")?;
		Ok(res.rows_affected() > 0)
	}

	async fn communities_for_user(&self, user: UserId) -> anyhow::Result<Vec<(CommunityId, Role)>> {
		let rows: Vec<(String, i64)> = sqlx::query_as(
			"SELECT community, role FROM community_memberships WHERE user_id = ? ORDER BY community",
		)
		.bind(user.get())
		.fetch_all(&self.pool)
		.await
		.context("select communities for user")?;

		rows.into_iter()
			.map(|(community, rank)| -> anyhow::Result<(CommunityId, Role)> {
				Ok((CommunityId::new(community)?, Role::from_rank(rank)?))
			})
			.collect()
	}

	async fn public_rooms(&self, community: &CommunityId) -> anyhow::Result<Vec<Room>> {
		let rows: Vec<RoomRow> = sqlx::query_as(&format!(
			"SELECT {ROOM_COLUMNS} FROM rooms WHERE kind = 'public' AND community = ? ORDER BY public_order"
		))
		.bind(community.as_str())
		.fetch_all(&self.pool)
		.await
		.context("select public rooms")?;
		rows.into_iter().map(room_from_row).collect()
	}

	async fn icon(&self, id: IconId) -> anyhow::Result<Option<Icon>> {
		let row: Option<(i64, Option<String>, String, bool)> =
			sqlx::query_as("SELECT id, community, img_src, active FROM icons WHERE id = ?")
				.bind(id.get())
				.fetch_optional(&self.pool)
				.await
				.context("select icon")?;

		let Some((id, community, img_src, active)) = row else {
			return Ok(None);
		};
		Ok(Some(Icon {
			id: IconId(id),
			community: community.map(CommunityId::new).transpose()?,
			img_src,
			active,
		}))
	}
}
