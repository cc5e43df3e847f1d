#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::config::{ChatSettings, SecretString, ServerConfig};
use crate::server::dispatch::RoomDispatcher;
use crate::server::gateway::Gateway;
use crate::server::health::HealthState;
use crate::server::locks::RoomLocks;
use crate::server::message_log::MessageLog;
use crate::server::notify::NotificationBridge;
use crate::server::permissions::PermissionEvaluator;
use crate::server::presence::PresenceTracker;
use crate::server::room_hub::MessageBus;
use crate::server::rooms::RoomManager;
use crate::server::store::ChatStore;

/// Shared server state handed to every handler.
#[derive(Clone)]
pub struct AppState {
	pub store: Arc<dyn ChatStore>,
	pub permissions: PermissionEvaluator,
	pub dispatcher: RoomDispatcher,
	pub rooms: RoomManager,
	pub presence: PresenceTracker,
	pub gateway: Gateway,
	pub health: HealthState,
	pub auth_secret: Option<SecretString>,
	pub chat: ChatSettings,
}

impl AppState {
	/// Wire the core components over one store, bus and notification bridge.
	pub fn new(
		cfg: &ServerConfig,
		store: Arc<dyn ChatStore>,
		bus: Arc<dyn MessageBus>,
		bridge: Arc<dyn NotificationBridge>,
	) -> Self {
		let max_frame_bytes = cfg.server.max_frame_bytes;
		let permissions = PermissionEvaluator::new(store.clone(), cfg.chat.auto_provision_visitants);
		let log = MessageLog::new(store.clone(), cfg.chat.history_limits());
		let dispatcher = RoomDispatcher::new(store.clone(), log, bus, bridge, max_frame_bytes);
		let membership_locks = RoomLocks::new();

		Self {
			rooms: RoomManager::new(
				store.clone(),
				permissions.clone(),
				dispatcher.clone(),
				membership_locks.clone(),
			),
			presence: PresenceTracker::new(store.clone(), membership_locks),
			gateway: Gateway::new(permissions.clone(), dispatcher.clone(), max_frame_bytes),
			store,
			permissions,
			dispatcher,
			health: HealthState::new(),
			auth_secret: cfg.server.auth_hmac_secret.clone(),
			chat: cfg.chat.clone(),
		}
	}
}
