#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bubbly_domain::RoomId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-room async locks.
#[derive(Debug, Clone, Default)]
pub struct RoomLocks {
	inner: Arc<Mutex<HashMap<RoomId, Arc<Mutex<()>>>>>,
}

impl RoomLocks {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acquire the lock for `room`, waiting for any holder to release it.
	pub async fn lock(&self, room: RoomId) -> OwnedMutexGuard<()> {
		let slot = {
			let mut map = self.inner.lock().await;
			map.entry(room).or_default().clone()
		};
		slot.lock_owned().await
	}

	/// Drop the slot for a deleted room if nobody is holding or waiting on it.
	pub async fn forget(&self, room: RoomId) {
		let mut map = self.inner.lock().await;
		if let Some(slot) = map.get(&room)
			&& Arc::strong_count(slot) == 1
		{
			map.remove(&room);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn same_room_is_serialized() {
		let locks = RoomLocks::new();
		let guard = locks.lock(RoomId(1)).await;

		let other = locks.clone();
		let waiter = tokio::spawn(async move {
			let _g = other.lock(RoomId(1)).await;
		});

		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!waiter.is_finished());

		let _unrelated = tokio::time::timeout(Duration::from_secs(1), locks.lock(RoomId(2)))
			.await
			.expect("other rooms are independent");

		drop(guard);
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("waiter finishes")
			.expect("join");
	}
}
