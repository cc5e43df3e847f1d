use bubbly_domain::{Message, MessageId, MessageType, RoomId, UserId, UserProfile};
use bubbly_protocol::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, InboundFrame, MessageEvent, MessageView, OutboundEvent, ProfileView,
	TypingEvent, decode_inbound, decode_outbound, encode_event,
};
use proptest::prelude::*;

fn profile() -> ProfileView {
	ProfileView::from_profile(&UserProfile {
		id: UserId(1),
		username: "ann".to_string(),
		alias: "Ann".to_string(),
		profile_pic: "https://cdn.example/ann.png".to_string(),
		fave_color: "#ff00ff".to_string(),
	})
}

#[test]
fn message_event_keeps_nonce_and_wire_field_names() {
	let message = Message {
		id: MessageId(12),
		room: RoomId(3),
		author: UserId(1),
		timestamp: 1_700_000_000_000,
		msg_type: MessageType::Text,
		content: "hi".to_string(),
	};
	let event = MessageEvent {
		nonce: Some("n1".to_string()),
		msg_data: MessageView::new(&message, profile()),
	};

	let envelope = encode_event(&event, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	let json: serde_json::Value = serde_json::from_str(&envelope.text).expect("json");
	assert_eq!(json["nonce"], "n1");
	assert_eq!(json["msg_data"]["id"], 12);
	assert_eq!(json["msg_data"]["msg_type"], 1);
	assert_eq!(json["msg_data"]["author"]["alias"], "Ann");

	match decode_outbound(&envelope.text).expect("decode") {
		OutboundEvent::Message(decoded) => assert_eq!(decoded, event),
		other => panic!("expected message event, got {other:?}"),
	}
}

#[test]
fn system_message_event_omits_nonce() {
	let message = Message {
		id: MessageId(1),
		room: RoomId(3),
		author: UserId(1),
		timestamp: 5,
		msg_type: MessageType::RoomCreated,
		content: "Say hi".to_string(),
	};
	let event = MessageEvent {
		nonce: None,
		msg_data: MessageView::new(&message, profile()),
	};

	let envelope = encode_event(&event, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	assert!(!envelope.text.contains("nonce"));
}

#[test]
fn typing_event_decodes_as_typing() {
	let envelope = encode_event(&TypingEvent { user: profile() }, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	match decode_outbound(&envelope.text).expect("decode") {
		OutboundEvent::Typing(t) => assert_eq!(t.user.username, "ann"),
		other => panic!("expected typing event, got {other:?}"),
	}
}

#[test]
fn encode_rejects_too_large() {
	let err = encode_event(&TypingEvent { user: profile() }, 8).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => assert!(len > max),
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn decode_inbound_never_panics(s in ".{0,256}") {
		let _ = decode_inbound(&s, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn chat_frames_parse_back(nonce in "[a-zA-Z0-9-]{1,24}", code in 1i64..=12, content in "[^\"\\\\]{0,64}") {
		let text = serde_json::json!({ "nonce": nonce, "type": code, "content": content }).to_string();
		match decode_inbound(&text, DEFAULT_MAX_FRAME_SIZE) {
			Ok(InboundFrame::Chat(chat)) => {
				prop_assert_eq!(chat.nonce, nonce);
				prop_assert_eq!(chat.msg_type.code() as i64, code);
				prop_assert_eq!(chat.content, content);
			}
			other => prop_assert!(false, "unexpected decode result: {:?}", other),
		}
	}
}
