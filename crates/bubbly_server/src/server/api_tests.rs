#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use bubbly_domain::{CommunityId, MessageType, Role, UserId};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::server::api::router;
use crate::server::auth::issue_hmac_token;
use crate::server::store::ChatStore;
use crate::server::test_support::{ALICE, BOB, CAROL, DAVE, Harness, TEST_SECRET, harness};

fn token(user: UserId) -> String {
	let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
	issue_hmac_token(user, exp, TEST_SECRET).unwrap()
}

fn app(h: &Harness) -> Router {
	router(h.state.clone())
}

async fn call(app: &Router, method: Method, uri: &str, user: Option<UserId>, body: Option<Value>) -> (StatusCode, Value) {
	let mut req = Request::builder().method(method).uri(uri);
	if let Some(user) = user {
		req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
	}
	let req = match body {
		Some(body) => req
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.unwrap(),
		None => req.body(Body::empty()).unwrap(),
	};

	let resp = app.clone().oneshot(req).await.unwrap();
	let status = resp.status();
	let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
	let value = if bytes.is_empty() {
		Value::Null
	} else {
		serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
	};
	(status, value)
}

#[tokio::test]
async fn health_probes_follow_readiness() {
	let h = harness().await;
	let app = app(&h);

	let (status, _) = call(&app, Method::GET, "/healthz", None, None).await;
	assert_eq!(status, StatusCode::OK);

	let (status, _) = call(&app, Method::GET, "/readyz", None, None).await;
	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

	h.state.health.mark_ready();
	let (status, _) = call(&app, Method::GET, "/readyz", None, None).await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn room_errors_map_to_status_and_code() {
	let h = harness().await;
	let app = app(&h);
	let room = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	let uri = format!("/rooms/{}", room.id);

	let (status, body) = call(&app, Method::GET, &uri, None, None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["code"], "UNAUTHENTICATED");

	let (status, body) = call(&app, Method::GET, &uri, Some(CAROL), None).await;
	assert_eq!(status, StatusCode::FORBIDDEN);
	assert_eq!(body["code"], "PERMISSION_DENIED");

	let (status, body) = call(&app, Method::GET, "/rooms/9999", Some(ALICE), None).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	assert_eq!(body["code"], "ROOM_NOT_FOUND");

	let (status, body) = call(&app, Method::GET, &format!("{uri}/me"), Some(CAROL), None).await;
	assert_eq!(status, StatusCode::FORBIDDEN);
	assert_eq!(body["code"], "NOT_MEMBER");
}

#[tokio::test]
async fn query_token_is_accepted() {
	let h = harness().await;
	let app = app(&h);
	let room = h.state.rooms.create_room(ALICE).await.unwrap();

	let uri = format!("/rooms/{}?token={}", room.id, token(ALICE));
	let (status, body) = call(&app, Method::GET, &uri, None, None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["meta_data"]["room_type"], "group");
	assert_eq!(body["meta_data"]["room_type_data"]["roommate_count"], 1);
}

#[tokio::test]
async fn creating_a_direct_room_shows_the_counterpart() {
	let h = harness().await;
	let app = app(&h);

	let (status, body) = call(&app, Method::POST, "/rooms", Some(ALICE), Some(json!({"participants": [2]}))).await;
	assert_eq!(status, StatusCode::CREATED);
	assert_eq!(body["meta_data"]["room_type"], "direct");
	assert_eq!(body["meta_data"]["room_type_data"]["alias"], "Bob");

	let (status, again) = call(&app, Method::POST, "/rooms", Some(BOB), Some(json!({"participants": [1]}))).await;
	assert_eq!(status, StatusCode::CREATED);
	assert_eq!(again["id"], body["id"]);
	assert_eq!(again["meta_data"]["room_type_data"]["alias"], "Alice");

	h.store.block(CAROL, DAVE).await;
	let (status, body) = call(&app, Method::POST, "/rooms", Some(DAVE), Some(json!({"participants": [3]}))).await;
	assert_eq!(status, StatusCode::CONFLICT);
	assert_eq!(body["code"], "ALREADY_BLOCKED");
}

#[tokio::test]
async fn room_list_carries_latest_message_and_unread_flag() {
	let h = harness().await;
	let app = app(&h);
	let quiet = h.state.rooms.create_room(ALICE).await.unwrap();
	let busy = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	tokio::time::sleep(std::time::Duration::from_millis(3)).await;
	h.state
		.dispatcher
		.post(&busy, BOB, MessageType::Text, "are you there?".into(), None)
		.await
		.unwrap();

	let (status, body) = call(&app, Method::GET, "/rooms", Some(ALICE), None).await;
	assert_eq!(status, StatusCode::OK);
	let rooms = body.as_array().unwrap();
	assert_eq!(rooms.len(), 2);
	assert_eq!(rooms[0]["id"], busy.id.get());
	assert_eq!(rooms[0]["latest"]["content"], "are you there?");
	assert_eq!(rooms[0]["unread"], true);
	assert_eq!(rooms[1]["id"], quiet.id.get());
	assert_eq!(rooms[1]["unread"], false);

	let (status, body) = call(&app, Method::GET, "/unread", Some(ALICE), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["has_unread"], true);

	tokio::time::sleep(std::time::Duration::from_millis(3)).await;
	let (status, _) = call(&app, Method::PUT, &format!("/rooms/{}/me", busy.id), Some(ALICE), None).await;
	assert_eq!(status, StatusCode::OK);

	let (_, body) = call(&app, Method::GET, "/unread", Some(ALICE), None).await;
	assert_eq!(body["has_unread"], false);

	let (_, body) = call(&app, Method::GET, "/rooms?limit=1", Some(ALICE), None).await;
	assert_eq!(body.as_array().unwrap().len(), 1);
	let (_, body) = call(&app, Method::GET, &format!("/rooms?offset={}", busy.id), Some(ALICE), None).await;
	assert_eq!(body[0]["id"], quiet.id.get());
}

#[tokio::test]
async fn members_listing_is_newest_first_and_paged() {
	let h = harness().await;
	let app = app(&h);
	let room = h.state.rooms.create_room(ALICE).await.unwrap();
	tokio::time::sleep(std::time::Duration::from_millis(3)).await;

	let (status, body) = call(
		&app,
		Method::POST,
		&format!("/rooms/{}/members", room.id),
		Some(ALICE),
		Some(json!({"participants": [2, 3]})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["added"], 2);

	let uri = format!("/rooms/{}/members?limit=2", room.id);
	let (status, body) = call(&app, Method::GET, &uri, Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	let users = body
		.as_array()
		.unwrap()
		.iter()
		.map(|m| m["user"].as_i64().unwrap())
		.collect::<Vec<_>>();
	assert_eq!(users, vec![3, 2]);

	let uri = format!("/rooms/{}/members?limit=2&offset=2", room.id);
	let (_, body) = call(&app, Method::GET, &uri, Some(BOB), None).await;
	assert_eq!(body[0]["user"], 1);
	assert_eq!(body[0]["is_admin"], true);
	assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admins_rename_and_manage_members() {
	let h = harness().await;
	let app = app(&h);
	let room = h.state.rooms.create_room_or_direct(ALICE, &[BOB, CAROL]).await.unwrap();
	let base = format!("/rooms/{}", room.id);

	let (status, _) = call(&app, Method::PATCH, &base, Some(BOB), Some(json!({"name": "mine"}))).await;
	assert_eq!(status, StatusCode::FORBIDDEN);

	let (status, _) = call(&app, Method::PATCH, &base, Some(ALICE), Some(json!({}))).await;
	assert_eq!(status, StatusCode::BAD_REQUEST);

	let (status, body) = call(&app, Method::PATCH, &base, Some(ALICE), Some(json!({"name": "Trip"}))).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["name"], "Trip");

	let (status, body) = call(
		&app,
		Method::PATCH,
		&format!("{base}/members/2"),
		Some(ALICE),
		Some(json!({"is_admin": true})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["is_admin"], true);

	let (status, body) = call(&app, Method::DELETE, &format!("{base}/members/3"), Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["room_deleted"], false);

	let (status, body) = call(&app, Method::DELETE, &format!("{base}/me"), Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["promoted"], Value::Null);

	let (status, body) = call(&app, Method::DELETE, &format!("{base}/me"), Some(ALICE), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["room_deleted"], true);

	let (status, _) = call(&app, Method::GET, &base, Some(ALICE), None).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn message_history_is_newest_first() {
	let h = harness().await;
	let app = app(&h);
	let room = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	for text in ["one", "two", "three"] {
		h.state
			.dispatcher
			.post(&room, ALICE, MessageType::Text, text.into(), None)
			.await
			.unwrap();
	}

	let uri = format!("/rooms/{}/messages?limit=2", room.id);
	let (status, body) = call(&app, Method::GET, &uri, Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body[0]["content"], "three");
	assert_eq!(body[1]["content"], "two");
	assert_eq!(body[0]["author"]["alias"], "Alice");

	let next = format!("/rooms/{}/messages?limit=2&offset={}", room.id, body[1]["id"]);
	let (_, body) = call(&app, Method::GET, &next, Some(BOB), None).await;
	assert_eq!(body[0]["content"], "one");
	assert_eq!(body[1]["msg_type"], 8);
}

#[tokio::test]
async fn my_membership_preferences() {
	let h = harness().await;
	let app = app(&h);
	let room = h.state.rooms.create_direct(ALICE, BOB).await.unwrap();
	let uri = format!("/rooms/{}/me", room.id);

	let (status, body) = call(&app, Method::GET, &uri, Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["notifications_enabled"], true);

	let (status, body) = call(&app, Method::PATCH, &uri, Some(BOB), Some(json!({"notifications_enabled": false}))).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["notifications_enabled"], false);
	let stored = h.store.membership(room.id, BOB).await.unwrap().unwrap();
	assert!(!stored.notifications_enabled);
}

#[tokio::test]
async fn community_rooms_are_created_and_joined() {
	let h = harness().await;
	let app = app(&h);
	let cats = CommunityId::new("cats").unwrap();
	h.store.set_community_role(&cats, ALICE, Role::Moderator).await.unwrap();
	h.store.set_community_role(&cats, BOB, Role::Member).await.unwrap();

	let (status, _) = call(&app, Method::POST, "/communities/cats/rooms", Some(BOB), Some(json!({}))).await;
	assert_eq!(status, StatusCode::FORBIDDEN);

	let (status, body) = call(
		&app,
		Method::POST,
		"/communities/cats/rooms",
		Some(ALICE),
		Some(json!({"description": "all about cats"})),
	)
	.await;
	assert_eq!(status, StatusCode::CREATED);
	assert_eq!(body["meta_data"]["room_type"], "public");
	assert_eq!(body["meta_data"]["room_type_data"]["order"], 1);
	let id = body["id"].as_i64().unwrap();

	let (status, _) = call(&app, Method::GET, &format!("/rooms/{id}/messages"), Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);

	let (status, body) = call(&app, Method::POST, &format!("/rooms/{id}/join?as_mod=1"), Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["is_admin"], false);

	let (status, _) = call(&app, Method::POST, &format!("/rooms/{id}/join"), Some(CAROL), None).await;
	assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn explore_pages_public_rooms_of_joined_communities() {
	let h = harness().await;
	let app = app(&h);
	let cats = CommunityId::new("cats").unwrap();
	h.store.set_community_role(&cats, ALICE, Role::Moderator).await.unwrap();
	h.store.set_community_role(&cats, BOB, Role::Member).await.unwrap();

	let first = h.state.rooms.create_public_room(ALICE, cats.clone(), None).await.unwrap();
	let second = h.state.rooms.create_public_room(ALICE, cats.clone(), None).await.unwrap();
	tokio::time::sleep(std::time::Duration::from_millis(3)).await;
	h.state
		.dispatcher
		.post(&first, ALICE, MessageType::Text, "welcome".into(), None)
		.await
		.unwrap();
	h.state.rooms.join_public_room(BOB, second.id, false).await.unwrap();

	let (status, _) = call(&app, Method::GET, "/rooms/explore", None, None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);

	let (status, body) = call(&app, Method::GET, "/rooms/explore?limit=1", Some(BOB), None).await;
	assert_eq!(status, StatusCode::OK);
	let rooms = body.as_array().unwrap();
	assert_eq!(rooms.len(), 1);
	assert_eq!(rooms[0]["id"], first.id.get());
	assert_eq!(rooms[0]["latest"]["content"], "welcome");
	assert_eq!(rooms[0]["joined"], false);
	assert_eq!(rooms[0]["meta_data"]["room_type"], "public");

	let uri = format!("/rooms/explore?limit=1&offset={}", first.id);
	let (_, body) = call(&app, Method::GET, &uri, Some(BOB), None).await;
	assert_eq!(body[0]["id"], second.id.get());
	assert_eq!(body[0]["joined"], true);

	let (status, body) = call(&app, Method::GET, "/rooms/explore", Some(CAROL), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, json!([]));
}
