#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown room kind: {0}")]
	UnknownRoomKind(String),
	#[error("unknown message type: {0}")]
	UnknownMessageType(i64),
	#[error("unknown role rank: {0}")]
	UnknownRole(i64),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub i64);

		impl $name {
			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<i64>()
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(format!("expected integer id, got {s}")))
			}
		}
	};
}

numeric_id!(
	/// Account identifier owned by the accounts service.
	UserId
);
numeric_id!(
	/// Chat room identifier.
	RoomId
);
numeric_id!(
	/// Monotonically assigned message identifier (insertion order).
	MessageId
);
numeric_id!(IconId);

/// Community identifier (short slug owned by the communities service).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(String);

impl CommunityId {
	/// Create a non-empty `CommunityId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CommunityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for CommunityId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		CommunityId::new(s.trim().to_string())
	}
}

/// Community membership levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Banned,
	Visitant,
	Member,
	Moderator,
	Administrator,
}

impl Role {
	/// Stored rank of the role.
	pub const fn rank(self) -> i64 {
		match self {
			Role::Banned => -100,
			Role::Visitant => -10,
			Role::Member => 10,
			Role::Moderator => 100,
			Role::Administrator => 200,
		}
	}

	pub fn from_rank(rank: i64) -> Result<Self, ParseIdError> {
		match rank {
			-100 => Ok(Role::Banned),
			-10 => Ok(Role::Visitant),
			10 => Ok(Role::Member),
			100 => Ok(Role::Moderator),
			200 => Ok(Role::Administrator),
			other => Err(ParseIdError::UnknownRole(other)),
		}
	}

	/// Whether this role satisfies `required` on the ladder.
	pub fn at_least(self, required: Role) -> bool {
		self >= required
	}
}

/// Discriminant of a [`RoomVariant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
	Group,
	Direct,
	Public,
}

impl RoomKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomKind::Group => "group",
			RoomKind::Direct => "direct",
			RoomKind::Public => "public",
		}
	}
}

impl fmt::Display for RoomKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"group" => Ok(RoomKind::Group),
			"direct" => Ok(RoomKind::Direct),
			"public" => Ok(RoomKind::Public),
			other => Err(ParseIdError::UnknownRoomKind(other.to_string())),
		}
	}
}

/// Exactly one of the three room shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomVariant {
	/// Ad-hoc group, no extra data.
	Group,
	/// One-to-one room between two distinct users.
	Direct { u1: UserId, u2: UserId },
	/// Community room with a display order inside its community.
	Public {
		community: CommunityId,
		order: u32,
		description: String,
	},
}

impl RoomVariant {
	pub fn kind(&self) -> RoomKind {
		match self {
			RoomVariant::Group => RoomKind::Group,
			RoomVariant::Direct { .. } => RoomKind::Direct,
			RoomVariant::Public { .. } => RoomKind::Public,
		}
	}

	/// Owning community of a public room.
	pub fn community(&self) -> Option<&CommunityId> {
		match self {
			RoomVariant::Public { community, .. } => Some(community),
			RoomVariant::Group | RoomVariant::Direct { .. } => None,
		}
	}
}

/// A chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: Option<String>,
	pub bg_img: Option<String>,
	pub variant: RoomVariant,
}

impl Room {
	pub fn kind(&self) -> RoomKind {
		self.variant.kind()
	}

	pub fn is_direct(&self) -> bool {
		matches!(self.variant, RoomVariant::Direct { .. })
	}

	/// The other participant of a direct room, seen from `me`.
	pub fn direct_counterpart(&self, me: UserId) -> Option<UserId> {
		match self.variant {
			RoomVariant::Direct { u1, u2 } if u1 == me => Some(u2),
			RoomVariant::Direct { u1, u2 } if u2 == me => Some(u1),
			_ => None,
		}
	}

	/// Fanout topic for this room.
	pub fn topic(&self) -> String {
		RoomTopic::format(self)
	}
}

/// Topic helpers for room fanout.
pub struct RoomTopic;

impl RoomTopic {
	/// Prefix for room topics.
	pub const PREFIX: &'static str = "room:";

	/// Format a room topic (e.g. `room:group/12`, `room:public/cats/7`).
	pub fn format(room: &Room) -> String {
		match &room.variant {
			RoomVariant::Group => format!("{}group/{}", Self::PREFIX, room.id),
			RoomVariant::Direct { .. } => format!("{}direct/{}", Self::PREFIX, room.id),
			RoomVariant::Public { community, .. } => format!("{}public/{}/{}", Self::PREFIX, community, room.id),
		}
	}

	/// Parse a room topic back into its kind and room id.
	pub fn parse(s: &str) -> Result<(RoomKind, RoomId), ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected room:<kind>/<id>".into()))?;

		let (kind_s, tail) = rest
			.split_once('/')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected room:<kind>/<id>".into()))?;

		let kind = RoomKind::from_str(kind_s)?;
		let id_s = match kind {
			RoomKind::Public => {
				tail.rsplit_once('/')
					.ok_or_else(|| ParseIdError::InvalidFormat("expected room:public/<community>/<id>".into()))?
					.1
			}
			RoomKind::Group | RoomKind::Direct => tail,
		};

		Ok((kind, RoomId::from_str(id_s)?))
	}
}

/// A user's participation record in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
	pub room: RoomId,
	pub identity: UserId,
	pub is_admin: bool,
	pub notifications_enabled: bool,
	/// Unix ms.
	pub last_seen: i64,
	/// Unix ms.
	pub joined_at: i64,
}

impl Membership {
	/// Fresh membership with notifications on, seen at join time.
	pub fn new(room: RoomId, identity: UserId, is_admin: bool, now_ms: i64) -> Self {
		Self {
			room,
			identity,
			is_admin,
			notifications_enabled: true,
			last_seen: now_ms,
			joined_at: now_ms,
		}
	}
}

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageType {
	Text = 1,
	Photo = 2,
	VideoEmbed = 3,
	Recording = 4,
	Invited = 5,
	Renamed = 6,
	BackgroundChanged = 7,
	RoomCreated = 8,
	Left = 9,
	Deleted = 10,
	Emote = 11,
	Hyperlink = 12,
}

impl MessageType {
	pub const fn code(self) -> u8 {
		self as u8
	}

	pub fn from_code(code: i64) -> Result<Self, ParseIdError> {
		Ok(match code {
			1 => MessageType::Text,
			2 => MessageType::Photo,
			3 => MessageType::VideoEmbed,
			4 => MessageType::Recording,
			5 => MessageType::Invited,
			6 => MessageType::Renamed,
			7 => MessageType::BackgroundChanged,
			8 => MessageType::RoomCreated,
			9 => MessageType::Left,
			10 => MessageType::Deleted,
			11 => MessageType::Emote,
			12 => MessageType::Hyperlink,
			other => return Err(ParseIdError::UnknownMessageType(other)),
		})
	}

	/// Lifecycle events produced by room/membership operations only.
	pub const fn is_system(self) -> bool {
		matches!(
			self,
			MessageType::Invited
				| MessageType::Renamed
				| MessageType::BackgroundChanged
				| MessageType::RoomCreated
				| MessageType::Left
		)
	}
}

impl From<MessageType> for u8 {
	fn from(t: MessageType) -> Self {
		t.code()
	}
}

impl TryFrom<u8> for MessageType {
	type Error = ParseIdError;

	fn try_from(code: u8) -> Result<Self, Self::Error> {
		MessageType::from_code(code as i64)
	}
}

/// An immutable room message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub room: RoomId,
	pub author: UserId,
	/// Unix ms.
	pub timestamp: i64,
	pub msg_type: MessageType,
	pub content: String,
}

impl Message {
	/// Descending sort key: newest first, ties by insertion order.
	pub fn order_key(&self) -> (i64, MessageId) {
		(self.timestamp, self.id)
	}
}

/// Minimal public profile as exposed to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub username: String,
	pub alias: String,
	pub profile_pic: String,
	pub fave_color: String,
}

/// Community emote icon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Icon {
	pub id: IconId,
	/// `None` for global icons.
	pub community: Option<CommunityId>,
	pub img_src: String,
	pub active: bool,
}
