#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use bubbly_domain::{CommunityId, Icon, IconId, MessageId, MessageType, Role};
use bubbly_protocol::OutboundEvent;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::server::error::ChatError;
use crate::server::pagination::PageRequest;
use crate::server::store::ChatStore;
use crate::server::test_support::{ALICE, BOB, harness, harness_with, next_event};

fn icon(id: i64, community: Option<&str>, active: bool) -> Icon {
	Icon {
		id: IconId(id),
		community: community.map(|c| CommunityId::new(c).unwrap()),
		img_src: format!("icons/{id}.png"),
		active,
	}
}

#[tokio::test]
async fn emote_content_resolves_to_image() {
	let h = harness().await;
	h.store.put_icon(icon(1, None, true)).await;
	h.store.put_icon(icon(2, Some("cats"), true)).await;
	h.store
		.set_community_role(&CommunityId::new("cats").unwrap(), ALICE, Role::Member)
		.await
		.unwrap();
	let room = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	let log = h.state.dispatcher.log();

	let global = log.append(&room, BOB, MessageType::Emote, "1".into()).await.unwrap();
	assert_eq!(global.content, "icons/1.png");

	let community = log.append(&room, ALICE, MessageType::Emote, "2".into()).await.unwrap();
	assert_eq!(community.content, "icons/2.png");
	assert_eq!(community.msg_type, MessageType::Emote);
}

#[tokio::test]
async fn emote_rejected_when_icon_is_out_of_reach() {
	let h = harness().await;
	h.store.put_icon(icon(3, None, false)).await;
	h.store.put_icon(icon(4, Some("cats"), true)).await;
	h.store.put_icon(icon(5, Some("dogs"), true)).await;
	let cats = CommunityId::new("cats").unwrap();
	let dogs = CommunityId::new("dogs").unwrap();
	h.store.set_community_role(&cats, ALICE, Role::Moderator).await.unwrap();
	h.store.set_community_role(&dogs, ALICE, Role::Member).await.unwrap();
	h.store.set_community_role(&cats, BOB, Role::Visitant).await.unwrap();

	let direct = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	let public = h.state.rooms.create_public_room(ALICE, cats, None).await.unwrap();
	let log = h.state.dispatcher.log();

	for (room, author, content) in [
		(&direct, ALICE, "not-a-number"),
		(&direct, ALICE, "3"),
		(&direct, ALICE, "404"),
		(&direct, BOB, "4"),
		(&public, ALICE, "5"),
	] {
		let res = log.append(room, author, MessageType::Emote, content.into()).await;
		assert!(
			matches!(res, Err(ChatError::IconNotAccessible)),
			"content {content:?} by {author} should be rejected"
		);
	}

	let ok = log.append(&public, ALICE, MessageType::Emote, "4".into()).await.unwrap();
	assert_eq!(ok.content, "icons/4.png");
}

#[tokio::test]
async fn deleted_messages_carry_no_content() {
	let h = harness().await;
	let room = h.state.rooms.create_room(ALICE).await.unwrap();

	let tombstone = h
		.state
		.dispatcher
		.log()
		.append(&room, ALICE, MessageType::Deleted, "the original text".into())
		.await
		.unwrap();
	assert_eq!(tombstone.content, "");

	let stored = h.store.latest_message(room.id).await.unwrap().unwrap();
	assert_eq!(stored.id, tombstone.id);
	assert_eq!(stored.content, "");
}

#[tokio::test]
async fn history_pages_walk_back_without_repeats() {
	let h = harness().await;
	let room = h.state.rooms.create_room(ALICE).await.unwrap();
	let log = h.state.dispatcher.log();
	for i in 0..7 {
		log.append(&room, ALICE, MessageType::Text, format!("m{i}")).await.unwrap();
	}

	let mut seen = Vec::new();
	let mut offset: Option<MessageId> = None;
	loop {
		let page = log
			.history(
				&room,
				PageRequest {
					offset,
					limit: Some(3),
				},
			)
			.await
			.unwrap();
		if page.is_empty() {
			break;
		}
		assert!(page.len() <= 3);
		offset = page.last().map(|m| m.id);
		seen.extend(page);
	}

	// seven texts plus the opening message
	assert_eq!(seen.len(), 8);
	let ids = seen.iter().map(|m| m.id).collect::<HashSet<_>>();
	assert_eq!(ids.len(), 8);
	assert!(seen.windows(2).all(|w| w[0].order_key() > w[1].order_key()));
	assert_eq!(seen[0].content, "m6");
	assert_eq!(seen[7].msg_type, MessageType::RoomCreated);
}

#[tokio::test]
async fn history_limit_is_capped() {
	let h = harness().await;
	let room = h.state.rooms.create_room(ALICE).await.unwrap();
	let log = h.state.dispatcher.log();
	for i in 0..120 {
		log.append(&room, ALICE, MessageType::Text, format!("m{i}")).await.unwrap();
	}

	let page = log.history(&room, PageRequest::first(Some(10_000))).await.unwrap();
	assert_eq!(page.len(), 100);

	let default_page = log.history(&room, PageRequest::first(None)).await.unwrap();
	assert_eq!(default_page.len(), 20);
}

#[tokio::test]
async fn oversized_event_is_refused_before_it_is_stored() {
	let mut cfg = ServerConfig::default();
	cfg.server.max_frame_bytes = 512;
	let mut h = harness_with(cfg).await;
	let room = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	while h.pushes.try_recv().is_ok() {}
	let mut rx = h.state.dispatcher.bus().subscribe(&room.topic(), BOB).await;

	let res = h
		.state
		.dispatcher
		.post(&room, ALICE, MessageType::Text, "x".repeat(600), None)
		.await;
	assert!(matches!(res, Err(ChatError::InvalidInput(_))));

	let history = h.state.dispatcher.log().history(&room, PageRequest::first(None)).await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].msg_type, MessageType::RoomCreated);
	assert!(h.pushes.try_recv().is_err());
	assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

	let posted = h
		.state
		.dispatcher
		.post(&room, ALICE, MessageType::Text, "short one".into(), None)
		.await
		.unwrap();
	match next_event(&mut rx).await {
		OutboundEvent::Message(event) => assert_eq!(event.msg_data.id, posted.id),
		other => panic!("expected message event, got {other:?}"),
	}
	assert!(h.pushes.try_recv().is_ok());
}
