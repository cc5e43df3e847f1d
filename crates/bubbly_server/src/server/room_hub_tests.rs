#![forbid(unsafe_code)]

use std::time::Duration;

use bubbly_domain::UserId;
use bubbly_protocol::BroadcastEnvelope;
use tokio::time::timeout;

use crate::server::room_hub::{MessageBus, RoomHub, RoomHubConfig, RoomHubItem};

fn envelope(text: &str) -> BroadcastEnvelope {
	BroadcastEnvelope { text: text.to_string() }
}

fn hub(capacity: usize) -> RoomHub {
	RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: capacity,
		debug_logs: false,
	})
}

async fn expect_frame(rx: &mut tokio::sync::mpsc::Receiver<RoomHubItem>) -> String {
	let item = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	match item {
		RoomHubItem::Frame(env) => env.text,
		other => panic!("expected Frame item, got: {other:?}"),
	}
}

#[tokio::test]
async fn subscribers_receive_frames_for_their_topic_only() {
	let hub = hub(16);

	let mut rx_a = hub.subscribe("room:group/1", UserId(1)).await;

	assert_eq!(hub.publish("room:group/2", envelope("b-1")).await, 0);

	let got_unexpected = timeout(Duration::from_millis(50), rx_a.recv()).await;
	assert!(
		got_unexpected.is_err(),
		"subscriber for room 1 unexpectedly received an item for room 2"
	);

	assert_eq!(hub.publish("room:group/1", envelope("a-1")).await, 1);
	assert_eq!(expect_frame(&mut rx_a).await, "a-1");
}

#[tokio::test]
async fn every_subscriber_gets_each_frame_in_publish_order() {
	let hub = hub(16);
	let mut rx_1 = hub.subscribe("room:direct/3", UserId(1)).await;
	let mut rx_2 = hub.subscribe("room:direct/3", UserId(2)).await;

	for text in ["m1", "m2", "m3"] {
		assert_eq!(hub.publish("room:direct/3", envelope(text)).await, 2);
	}

	for rx in [&mut rx_1, &mut rx_2] {
		assert_eq!(expect_frame(rx).await, "m1");
		assert_eq!(expect_frame(rx).await, "m2");
		assert_eq!(expect_frame(rx).await, "m3");
	}
}

#[tokio::test]
async fn dropped_receivers_are_pruned() {
	let hub = hub(16);

	{
		let _rx = hub.subscribe("room:group/1", UserId(1)).await;
		assert_eq!(hub.subscriber_count("room:group/1").await, 1);
	}

	hub.prune("room:group/1").await;

	assert_eq!(hub.publish("room:group/1", envelope("a-1")).await, 0);
	assert_eq!(hub.subscriber_count("room:group/1").await, 0);
}

#[tokio::test]
async fn full_queue_drops_and_later_emits_lagged_marker() {
	let hub = hub(2);
	let mut rx = hub.subscribe("room:group/1", UserId(1)).await;

	hub.publish("room:group/1", envelope("a-1")).await;
	hub.publish("room:group/1", envelope("a-2")).await;
	assert_eq!(hub.publish("room:group/1", envelope("a-3")).await, 0, "queue is full");

	assert_eq!(expect_frame(&mut rx).await, "a-1");
	assert_eq!(expect_frame(&mut rx).await, "a-2");

	hub.publish("room:group/1", envelope("a-4")).await;
	assert_eq!(expect_frame(&mut rx).await, "a-4");

	let marker = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected lag marker")
		.expect("channel open");
	assert_eq!(marker, RoomHubItem::Lagged { dropped: 1 });
}

#[tokio::test]
async fn closing_a_topic_ends_subscriber_streams() {
	let hub = hub(16);
	let mut rx = hub.subscribe("room:group/9", UserId(1)).await;

	hub.close_topic("room:group/9").await;

	let end = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("stream should end promptly");
	assert!(end.is_none());
	assert_eq!(hub.subscriber_count("room:group/9").await, 0);
}

#[tokio::test]
async fn disconnect_removes_only_that_users_subscribers() {
	let hub = hub(16);
	let mut first = hub.subscribe("room:group/4", UserId(1)).await;
	let mut second = hub.subscribe("room:group/4", UserId(1)).await;
	let mut other = hub.subscribe("room:group/4", UserId(2)).await;

	assert_eq!(hub.disconnect("room:group/4", UserId(1)).await, 2);
	assert_eq!(hub.disconnect("room:group/4", UserId(1)).await, 0);

	for rx in [&mut first, &mut second] {
		let end = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("stream should end promptly");
		assert!(end.is_none());
	}

	assert_eq!(hub.publish("room:group/4", envelope("after")).await, 1);
	assert_eq!(expect_frame(&mut other).await, "after");
}
