#![forbid(unsafe_code)]

use bubbly_domain::RoomId;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failures surfaced by room, membership and message operations.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("room {0} not found")]
	RoomNotFound(RoomId),

	#[error("permission denied: {0}")]
	PermissionDenied(&'static str),

	#[error("authentication required")]
	Unauthenticated,

	#[error("not a member of room {0}")]
	NotMember(RoomId),

	#[error("blocked relationship between participants")]
	AlreadyBlocked,

	#[error("icon not accessible")]
	IconNotAccessible,

	#[error("invariant violation: {0}")]
	InvariantViolation(&'static str),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error(transparent)]
	Store(#[from] anyhow::Error),
}

impl ChatError {
	/// Stable machine-readable code.
	pub fn code(&self) -> &'static str {
		match self {
			ChatError::RoomNotFound(_) => "ROOM_NOT_FOUND",
			ChatError::PermissionDenied(_) => "PERMISSION_DENIED",
			ChatError::Unauthenticated => "UNAUTHENTICATED",
			ChatError::NotMember(_) => "NOT_MEMBER",
			ChatError::AlreadyBlocked => "ALREADY_BLOCKED",
			ChatError::IconNotAccessible => "ICON_NOT_ACCESSIBLE",
			ChatError::InvariantViolation(_) => "INVARIANT_VIOLATION",
			ChatError::InvalidInput(_) => "INVALID_INPUT",
			ChatError::Store(_) => "INTERNAL",
		}
	}
}
