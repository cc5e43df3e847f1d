#![forbid(unsafe_code)]

use bubbly_domain::MessageType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frames::{BroadcastEnvelope, ChatFrame, InboundFrame, OutboundEvent};

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

const TYPING_TAG: &str = "typing";

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("malformed frame: {0}")]
	Malformed(&'static str),

	#[error("unknown message type: {0}")]
	UnknownMessageType(i64),
}

#[derive(Deserialize)]
struct RawInbound {
	#[serde(rename = "type")]
	kind: serde_json::Value,
	#[serde(default)]
	nonce: Option<String>,
	#[serde(default)]
	content: Option<RawContent>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
	Text(String),
	Int(i64),
}

/// Parse one inbound text frame.
pub fn decode_inbound(text: &str, max_frame_size: usize) -> Result<InboundFrame, FramingError> {
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	let raw: RawInbound = serde_json::from_str(text)?;

	if raw.kind.as_str() == Some(TYPING_TAG) {
		return Ok(InboundFrame::Typing);
	}

	let code = raw.kind.as_i64().ok_or(FramingError::Malformed("type must be \"typing\" or an integer"))?;
	let msg_type = MessageType::from_code(code).map_err(|_| FramingError::UnknownMessageType(code))?;
	let nonce = raw.nonce.ok_or(FramingError::Malformed("missing nonce"))?;
	let content = match raw.content.ok_or(FramingError::Malformed("missing content"))? {
		RawContent::Text(s) => s,
		RawContent::Int(n) => n.to_string(),
	};

	Ok(InboundFrame::Chat(ChatFrame {
		nonce,
		msg_type,
		content,
	}))
}

/// Serialize an outbound event into a broadcast envelope.
pub fn encode_event<T: Serialize>(event: &T, max_frame_size: usize) -> Result<BroadcastEnvelope, FramingError> {
	let text = serde_json::to_string(event)?;
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	Ok(BroadcastEnvelope { text })
}

/// Parse a received broadcast body (client side).
pub fn decode_outbound(text: &str) -> Result<OutboundEvent, FramingError> {
	Ok(serde_json::from_str(text)?)
}
