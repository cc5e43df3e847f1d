#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bubbly_domain::{UserId, UserProfile};
use bubbly_protocol::{OutboundEvent, decode_outbound};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::{SecretString, ServerConfig};
use crate::server::notify::{ChannelNotificationBridge, PushEvent};
use crate::server::room_hub::{RoomHub, RoomHubConfig, RoomHubItem};
use crate::server::state::AppState;
use crate::server::store::InMemoryChatStore;

pub const TEST_SECRET: &str = "test-secret";

pub const ALICE: UserId = UserId(1);
pub const BOB: UserId = UserId(2);
pub const CAROL: UserId = UserId(3);
pub const DAVE: UserId = UserId(4);

pub struct Harness {
	pub state: AppState,
	pub store: Arc<InMemoryChatStore>,
	pub pushes: mpsc::UnboundedReceiver<PushEvent>,
}

pub fn profile(id: UserId, alias: &str) -> UserProfile {
	UserProfile {
		id,
		username: alias.to_lowercase(),
		alias: alias.to_string(),
		profile_pic: String::new(),
		fave_color: "#3366ff".to_string(),
	}
}

/// In-memory app state with Alice, Bob, Carol and Dave registered.
pub async fn harness() -> Harness {
	harness_with(ServerConfig::default()).await
}

pub async fn harness_with(mut cfg: ServerConfig) -> Harness {
	let store = Arc::new(InMemoryChatStore::new());
	for (id, alias) in [(ALICE, "Alice"), (BOB, "Bob"), (CAROL, "Carol"), (DAVE, "Dave")] {
		store.put_user(profile(id, alias)).await;
	}

	cfg.server.auth_hmac_secret = Some(SecretString::new(TEST_SECRET));

	let bus = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 64,
		debug_logs: false,
	});
	let (bridge, pushes) = ChannelNotificationBridge::channel();
	let state = AppState::new(&cfg, store.clone(), Arc::new(bus), Arc::new(bridge));

	Harness { state, store, pushes }
}

/// Next decoded event from a room subscription.
pub async fn next_event(rx: &mut mpsc::Receiver<RoomHubItem>) -> OutboundEvent {
	let item = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("topic open");
	match item {
		RoomHubItem::Frame(env) => decode_outbound(&env.text).expect("decodable event"),
		other => panic!("expected Frame item, got: {other:?}"),
	}
}
