#![forbid(unsafe_code)]

use bubbly_domain::{Membership, Message, MessageId, MessageType, Room, RoomId, UserId, UserProfile};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a push notification points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationTarget {
	Message { room: RoomId, message: MessageId },
}

/// Event handed to push delivery for every announced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
	pub target: NotificationTarget,
	pub exclude_author: UserId,
	/// Members with notifications enabled, author excluded.
	pub recipients: Vec<UserId>,
	pub title: String,
	pub summary: String,
	pub icon: Option<String>,
}

impl PushEvent {
	/// Build the push event for `message`.
	pub fn for_message(room: &Room, message: &Message, author: Option<&UserProfile>, members: &[Membership]) -> Self {
		let alias = author.map(|p| p.alias.as_str()).unwrap_or("Someone");
		let summary = match message.msg_type {
			MessageType::Text => format!("{alias}: {}", message.content),
			_ => format!("{alias} sent a message"),
		};

		let recipients = members
			.iter()
			.filter(|m| m.notifications_enabled && m.identity != message.author)
			.map(|m| m.identity)
			.collect();

		Self {
			target: NotificationTarget::Message {
				room: room.id,
				message: message.id,
			},
			exclude_author: message.author,
			recipients,
			title: room.name.clone().unwrap_or_else(|| "Chat message".to_string()),
			summary,
			icon: author.map(|p| p.profile_pic.clone()).filter(|pic| !pic.is_empty()),
		}
	}
}

/// Sink for push events; delivery itself is out of process.
pub trait NotificationBridge: Send + Sync {
	fn deliver(&self, event: PushEvent);
}

/// Hands events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationBridge {
	tx: mpsc::UnboundedSender<PushEvent>,
}

impl ChannelNotificationBridge {
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	/// Bridge whose events are drained by a background logging task.
	pub fn spawn_logging() -> Self {
		let (bridge, mut rx) = Self::channel();
		tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				let NotificationTarget::Message { room, message } = event.target;
				info!(
					room = %room,
					message = %message,
					recipients = event.recipients.len(),
					title = %event.title,
					"push notification queued"
				);
			}
		});
		bridge
	}
}

impl NotificationBridge for ChannelNotificationBridge {
	fn deliver(&self, event: PushEvent) {
		if event.recipients.is_empty() {
			return;
		}
		if self.tx.send(event).is_err() {
			debug!("notification bridge closed; dropping push event");
		}
	}
}
