#![forbid(unsafe_code)]

pub mod frames;
pub mod framing;

pub use frames::{
	BroadcastEnvelope, ChatFrame, InboundFrame, MessageEvent, MessageView, OutboundEvent, ProfileView, TypingEvent,
};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_inbound, decode_outbound, encode_event};
