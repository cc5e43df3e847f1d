#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bubbly_domain::UserId;
use bubbly_protocol::BroadcastEnvelope;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Pub/sub bus with one topic per room.
///
/// Delivery is at-most-once per subscriber per publish, with no backlog for late subscribers.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
	/// Register a new subscriber on `topic` on behalf of `user`.
	async fn subscribe(&self, topic: &str, user: UserId) -> mpsc::Receiver<RoomHubItem>;

	/// Drop bookkeeping for subscribers whose receiver is gone.
	async fn prune(&self, topic: &str);

	/// Deliver `envelope` to every current subscriber; returns how many accepted it.
	async fn publish(&self, topic: &str, envelope: BroadcastEnvelope) -> usize;

	/// Disconnect every subscriber of `topic`; their receivers end.
	async fn close_topic(&self, topic: &str);

	/// Disconnect `user`'s subscribers on `topic`; returns how many were removed.
	async fn disconnect(&self, topic: &str, user: UserId) -> usize;

	async fn subscriber_count(&self, topic: &str) -> usize;
}

/// In-process hub that fans out broadcast envelopes per room topic.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomHubItem {
	Frame(BroadcastEnvelope),

	/// The subscriber's queue was full and this many frames were dropped.
	Lagged { dropped: u64 },
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}
}

#[async_trait::async_trait]
impl MessageBus for RoomHub {
	async fn subscribe(&self, topic: &str, user: UserId) -> mpsc::Receiver<RoomHubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));

		let mut inner = self.inner.lock().await;
		let entry = inner.topics.entry(topic.to_string()).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(Subscriber {
			user,
			tx,
			pending_lag: 0,
		});

		if self.cfg.debug_logs {
			debug!(topic = %topic, user = %user, subs = entry.subscribers.len(), "room hub: subscribed");
		}

		rx
	}

	async fn prune(&self, topic: &str) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.topics.get_mut(topic) {
			prune_closed_subscribers(entry);

			if entry.subscribers.is_empty() {
				inner.topics.remove(topic);
			}
		}
	}

	async fn publish(&self, topic: &str, envelope: BroadcastEnvelope) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.topics.get_mut(topic) else {
			return 0;
		};

		prune_closed_subscribers(entry);

		let mut delivered = 0usize;
		let mut dropped_total: u64 = 0;
		let item = RoomHubItem::Frame(envelope);

		for sub in entry.subscribers.iter_mut() {
			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					delivered += 1;
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(RoomHubItem::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.topics.remove(topic);
		}

		metrics::counter!("bubbly_server_broadcasts_total").increment(1);
		if dropped_total > 0 {
			metrics::counter!("bubbly_server_frames_dropped_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(
					topic = %topic,
					dropped = dropped_total,
					"room hub: dropped due to full subscriber queues"
				);
			}
		}

		delivered
	}

	async fn close_topic(&self, topic: &str) {
		let removed = self.inner.lock().await.topics.remove(topic);
		if let Some(entry) = removed
			&& self.cfg.debug_logs
		{
			debug!(topic = %topic, subs = entry.subscribers.len(), "room hub: topic closed");
		}
	}

	async fn disconnect(&self, topic: &str, user: UserId) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.topics.get_mut(topic) else {
			return 0;
		};

		let before = entry.subscribers.len();
		entry.subscribers.retain(|s| s.user != user && !s.tx.is_closed());
		let removed = before - entry.subscribers.len();

		if entry.subscribers.is_empty() {
			inner.topics.remove(topic);
		}
		if removed > 0 {
			debug!(topic = %topic, user = %user, removed, "room hub: subscriber disconnected");
		}
		removed
	}

	async fn subscriber_count(&self, topic: &str) -> usize {
		let inner = self.inner.lock().await;
		inner
			.topics
			.get(topic)
			.map(|entry| entry.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

#[derive(Debug, Default)]
struct Inner {
	topics: HashMap<String, TopicEntry>,
}

#[derive(Debug, Default)]
struct TopicEntry {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	user: UserId,
	tx: mpsc::Sender<RoomHubItem>,
	/// Frames dropped since the last delivered lag marker.
	pending_lag: u64,
}

fn prune_closed_subscribers(entry: &mut TopicEntry) {
	entry.subscribers.retain(|s| !s.tx.is_closed());
}
