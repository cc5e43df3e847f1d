#![forbid(unsafe_code)]

use bubbly_domain::{Message, MessageId, MessageType, UserProfile};
use serde::{Deserialize, Serialize};

/// Frames a client may send on an open room connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
	/// `{"type":"typing"}`
	Typing,
	/// `{"nonce": "...", "type": <int>, "content": "..." | <int>}`
	Chat(ChatFrame),
}

/// A chat message as submitted by a client, before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFrame {
	/// Client-generated correlation id for the optimistic local echo.
	pub nonce: String,
	pub msg_type: MessageType,
	/// Integer payloads are carried in their decimal form.
	pub content: String,
}

/// Public profile fields embedded in outbound events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileView {
	pub username: String,
	pub alias: String,
	pub profile_pic: String,
	pub fave_color: String,
}

impl ProfileView {
	pub fn from_profile(profile: &UserProfile) -> Self {
		Self {
			username: profile.username.clone(),
			alias: profile.alias.clone(),
			profile_pic: profile.profile_pic.clone(),
			fave_color: profile.fave_color.clone(),
		}
	}
}

/// Persisted message as rendered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
	pub id: MessageId,
	pub author: ProfileView,
	pub timestamp: i64,
	pub msg_type: MessageType,
	pub content: String,
}

impl MessageView {
	pub fn new(message: &Message, author: ProfileView) -> Self {
		Self {
			id: message.id,
			author,
			timestamp: message.timestamp,
			msg_type: message.msg_type,
			content: message.content.clone(),
		}
	}
}

/// Ephemeral "someone is typing" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
	pub user: ProfileView,
}

/// Persisted message event; `nonce` is set when the message came from a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nonce: Option<String>,
	pub msg_data: MessageView,
}

/// Any event a client can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundEvent {
	Message(MessageEvent),
	Typing(TypingEvent),
}

/// Unit of fanout: the serialized event body sent verbatim to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
	pub text: String,
}

impl BroadcastEnvelope {
	pub fn len(&self) -> usize {
		self.text.len()
	}

	pub fn is_empty(&self) -> bool {
		self.text.is_empty()
	}
}
