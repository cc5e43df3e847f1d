#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use bubbly_domain::{CommunityId, Membership, Message, MessageId, Room, RoomId, RoomVariant, UserId};
use bubbly_protocol::{MessageView, ProfileView};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::auth::authenticate;
use super::error::{ChatError, ChatResult};
use super::gateway::{TokenQuery, chat_ws};
use super::health::{healthz, readyz};
use super::pagination::{PageRequest, page_after};
use super::permissions::AccessLevel;
use super::rooms::RemoveOutcome;
use super::state::AppState;

/// Build the HTTP surface: REST routes, the chat upgrade endpoint and health probes.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/rooms", get(list_my_rooms).post(create_room_or_direct))
		.route("/rooms/explore", get(explore_public_rooms))
		.route("/rooms/{room}", get(get_room).patch(patch_room))
		.route("/rooms/{room}/members", get(list_members).post(add_members))
		.route(
			"/rooms/{room}/members/{user}",
			patch(patch_membership).delete(delete_membership),
		)
		.route("/rooms/{room}/messages", get(list_messages))
		.route(
			"/rooms/{room}/me",
			get(get_my_membership)
				.patch(patch_my_membership)
				.put(mark_seen)
				.delete(leave_room),
		)
		.route("/rooms/{room}/join", post(join_public_room))
		.route("/communities/{community}/rooms", post(create_public_room))
		.route("/unread", get(unread))
		.route("/ws/chat/{room}", get(chat_ws))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(state)
}

impl IntoResponse for ChatError {
	fn into_response(self) -> Response {
		let status = match &self {
			ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
			ChatError::PermissionDenied(_) | ChatError::NotMember(_) | ChatError::IconNotAccessible => {
				StatusCode::FORBIDDEN
			}
			ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
			ChatError::AlreadyBlocked | ChatError::InvariantViolation(_) => StatusCode::CONFLICT,
			ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
			ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};

		let message = match &self {
			ChatError::Store(e) => {
				error!(error = ?e, "request failed");
				"internal error".to_string()
			}
			other => other.to_string(),
		};

		(
			status,
			Json(ErrorBody {
				code: self.code(),
				message,
			}),
		)
			.into_response()
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
	pub code: &'static str,
	pub message: String,
}

/// Caller identity from `Authorization: Bearer` or `?token=`; `None` when anonymous.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Option<UserId>);

impl Caller {
	fn require(self) -> ChatResult<UserId> {
		self.0.ok_or(ChatError::Unauthenticated)
	}
}

impl FromRequestParts<AppState> for Caller {
	type Rejection = Infallible;

	async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
		let bearer = parts
			.headers
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "))
			.map(str::to_string);

		let token = match bearer {
			Some(token) => Some(token),
			None => Query::<TokenQuery>::try_from_uri(&parts.uri)
				.ok()
				.and_then(|Query(q)| q.token),
		};

		Ok(Caller(authenticate(token.as_deref(), state.auth_secret.as_ref())))
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
	pub offset: Option<i64>,
	pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantsBody {
	pub participants: Vec<UserId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomPatchBody {
	pub name: Option<String>,
	pub bg_img: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MembershipPatchBody {
	pub is_admin: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct MyMembershipPatchBody {
	pub notifications_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublicRoomBody {
	pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
	pub as_mod: Option<String>,
}

/// Variant-specific room data as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "room_type", content = "room_type_data", rename_all = "snake_case")]
pub enum RoomMeta {
	/// The other participant, seen from the viewer.
	Direct(Option<ProfileView>),
	Public { community: CommunityId, order: u32, description: String },
	Group { roommate_count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDetail {
	pub id: RoomId,
	pub name: Option<String>,
	pub bg_img: Option<String>,
	pub meta_data: RoomMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListItem {
	#[serde(flatten)]
	pub room: RoomDetail,
	pub latest: Option<MessageView>,
	pub unread: bool,
}

/// A public room from one of the caller's communities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploreItem {
	#[serde(flatten)]
	pub room: RoomDetail,
	pub latest: Option<MessageView>,
	pub joined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
	pub user: UserId,
	pub profile: ProfileView,
	pub is_admin: bool,
	pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyMembershipRecord {
	pub room: RoomId,
	pub is_admin: bool,
	pub notifications_enabled: bool,
	pub last_seen: i64,
	pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRecord {
	pub room_deleted: bool,
	pub promoted: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedRecord {
	pub added: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadRecord {
	pub has_unread: bool,
}

pub fn room_detail(room: &Room, counterpart: Option<ProfileView>, member_count: usize) -> RoomDetail {
	let meta_data = match &room.variant {
		RoomVariant::Direct { .. } => RoomMeta::Direct(counterpart),
		RoomVariant::Public {
			community,
			order,
			description,
		} => RoomMeta::Public {
			community: community.clone(),
			order: *order,
			description: description.clone(),
		},
		RoomVariant::Group => RoomMeta::Group {
			roommate_count: member_count,
		},
	};

	RoomDetail {
		id: room.id,
		name: room.name.clone(),
		bg_img: room.bg_img.clone(),
		meta_data,
	}
}

pub fn member_record(membership: &Membership, profile: ProfileView) -> MemberRecord {
	MemberRecord {
		user: membership.identity,
		profile,
		is_admin: membership.is_admin,
		joined_at: membership.joined_at,
	}
}

pub fn my_membership_record(membership: &Membership) -> MyMembershipRecord {
	MyMembershipRecord {
		room: membership.room,
		is_admin: membership.is_admin,
		notifications_enabled: membership.notifications_enabled,
		last_seen: membership.last_seen,
		joined_at: membership.joined_at,
	}
}

pub fn removal_record(outcome: &RemoveOutcome) -> RemovalRecord {
	match outcome {
		RemoveOutcome::RoomDeleted => RemovalRecord {
			room_deleted: true,
			promoted: None,
		},
		RemoveOutcome::Removed { promoted } => RemovalRecord {
			room_deleted: false,
			promoted: *promoted,
		},
	}
}

async fn load_room_detail(state: &AppState, room: &Room, viewer: Option<UserId>) -> ChatResult<RoomDetail> {
	let counterpart = match viewer.and_then(|me| room.direct_counterpart(me)) {
		Some(other) => Some(state.dispatcher.profile_view(other).await?),
		None => None,
	};
	let member_count = match room.variant {
		RoomVariant::Group => state.store.memberships(room.id).await?.len(),
		_ => 0,
	};
	Ok(room_detail(room, counterpart, member_count))
}

async fn message_views(state: &AppState, messages: &[Message]) -> ChatResult<Vec<MessageView>> {
	let mut profiles: HashMap<UserId, ProfileView> = HashMap::new();
	let mut views = Vec::with_capacity(messages.len());
	for message in messages {
		let author = match profiles.get(&message.author) {
			Some(profile) => profile.clone(),
			None => {
				let profile = state.dispatcher.profile_view(message.author).await?;
				profiles.insert(message.author, profile.clone());
				profile
			}
		};
		views.push(MessageView::new(message, author));
	}
	Ok(views)
}

async fn list_my_rooms(
	State(state): State<AppState>,
	caller: Caller,
	Query(page): Query<PageQuery>,
) -> ChatResult<Json<Vec<RoomListItem>>> {
	let me = caller.require()?;

	let mut entries = Vec::new();
	for membership in state.store.memberships_for_user(me).await? {
		let Some(room) = state.store.room(membership.room).await? else {
			continue;
		};
		let latest = state.store.latest_message(room.id).await?;
		let activity = latest.as_ref().map(|m| m.timestamp).unwrap_or(membership.joined_at);
		entries.push((activity, room, latest, membership));
	}
	entries.sort_by(|a, b| (b.0, b.1.id).cmp(&(a.0, a.1.id)));

	let limit = state.chat.rooms_limits().effective(page.limit);
	let offset = page.offset.map(RoomId);
	let entries = page_after(entries, |e| e.1.id, offset.as_ref(), limit);

	let mut items = Vec::with_capacity(entries.len());
	for (_, room, latest, membership) in entries {
		let detail = load_room_detail(&state, &room, Some(me)).await?;
		let unread = latest.as_ref().is_some_and(|m| m.timestamp > membership.last_seen);
		let latest = match latest {
			Some(message) => message_views(&state, std::slice::from_ref(&message)).await?.pop(),
			None => None,
		};
		items.push(RoomListItem {
			room: detail,
			latest,
			unread,
		});
	}

	Ok(Json(items))
}

async fn explore_public_rooms(
	State(state): State<AppState>,
	caller: Caller,
	Query(page): Query<PageQuery>,
) -> ChatResult<Json<Vec<ExploreItem>>> {
	let me = caller.require()?;
	let entries = state.rooms.explore_public_rooms(me).await?;

	let limit = state.chat.explore_limits().effective(page.limit);
	let offset = page.offset.map(RoomId);
	let entries = page_after(entries, |e| e.0.id, offset.as_ref(), limit);

	let mut items = Vec::with_capacity(entries.len());
	for (room, latest) in entries {
		let joined = state.store.membership(room.id, me).await?.is_some();
		let detail = load_room_detail(&state, &room, Some(me)).await?;
		let latest = match latest {
			Some(message) => message_views(&state, std::slice::from_ref(&message)).await?.pop(),
			None => None,
		};
		items.push(ExploreItem {
			room: detail,
			latest,
			joined,
		});
	}

	Ok(Json(items))
}

async fn create_room_or_direct(
	State(state): State<AppState>,
	caller: Caller,
	Json(body): Json<ParticipantsBody>,
) -> ChatResult<(StatusCode, Json<RoomDetail>)> {
	let me = caller.require()?;
	let room = state.rooms.create_room_or_direct(me, &body.participants).await?;
	let detail = load_room_detail(&state, &room, Some(me)).await?;
	Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_room(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
) -> ChatResult<Json<RoomDetail>> {
	let room = state
		.permissions
		.authorize(RoomId(room_id), caller.0, AccessLevel::Basic)
		.await?;
	Ok(Json(load_room_detail(&state, &room, caller.0).await?))
}

async fn patch_room(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
	Json(body): Json<RoomPatchBody>,
) -> ChatResult<Json<RoomDetail>> {
	let me = caller.require()?;
	if body.name.is_none() && body.bg_img.is_none() {
		return Err(ChatError::InvalidInput("expected name or bg_img".into()));
	}

	let mut room = state
		.permissions
		.authorize(RoomId(room_id), Some(me), AccessLevel::Admin)
		.await?;
	if let Some(name) = body.name.as_deref() {
		room = state.rooms.rename_room(me, room.id, name).await?;
	}
	if let Some(bg_img) = body.bg_img.as_deref() {
		room = state.rooms.change_background(me, room.id, bg_img).await?;
	}

	Ok(Json(load_room_detail(&state, &room, Some(me)).await?))
}

async fn add_members(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
	Json(body): Json<ParticipantsBody>,
) -> ChatResult<Json<AddedRecord>> {
	let me = caller.require()?;
	let added = state.rooms.add_members(me, RoomId(room_id), &body.participants).await?;
	Ok(Json(AddedRecord { added }))
}

async fn list_members(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
	Query(page): Query<PageQuery>,
) -> ChatResult<Json<Vec<MemberRecord>>> {
	let room = state
		.permissions
		.authorize(RoomId(room_id), caller.0, AccessLevel::Basic)
		.await?;

	let mut members = state.store.memberships(room.id).await?;
	members.reverse();

	let limit = state.chat.members_limits().effective(page.limit);
	let offset = page.offset.map(UserId);
	let members = page_after(members, |m| m.identity, offset.as_ref(), limit);

	let mut records = Vec::with_capacity(members.len());
	for membership in &members {
		let profile = state.dispatcher.profile_view(membership.identity).await?;
		records.push(member_record(membership, profile));
	}
	Ok(Json(records))
}

async fn patch_membership(
	State(state): State<AppState>,
	caller: Caller,
	Path((room_id, user)): Path<(i64, i64)>,
	Json(body): Json<MembershipPatchBody>,
) -> ChatResult<Json<MemberRecord>> {
	let me = caller.require()?;
	let membership = state
		.rooms
		.set_admin(me, RoomId(room_id), UserId(user), body.is_admin)
		.await?;
	let profile = state.dispatcher.profile_view(membership.identity).await?;
	Ok(Json(member_record(&membership, profile)))
}

async fn delete_membership(
	State(state): State<AppState>,
	caller: Caller,
	Path((room_id, user)): Path<(i64, i64)>,
) -> ChatResult<Json<RemovalRecord>> {
	let me = caller.require()?;
	let outcome = state.rooms.remove_member(me, RoomId(room_id), UserId(user)).await?;
	Ok(Json(removal_record(&outcome)))
}

async fn list_messages(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
	Query(page): Query<PageQuery>,
) -> ChatResult<Json<Vec<MessageView>>> {
	let room = state
		.permissions
		.authorize(RoomId(room_id), caller.0, AccessLevel::Basic)
		.await?;

	let request = PageRequest {
		offset: page.offset.map(MessageId),
		limit: page.limit,
	};
	let messages = state.dispatcher.log().history(&room, request).await?;
	Ok(Json(message_views(&state, &messages).await?))
}

async fn get_my_membership(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
) -> ChatResult<Json<MyMembershipRecord>> {
	let me = caller.require()?;
	let membership = state.permissions.require_member(RoomId(room_id), me).await?;
	Ok(Json(my_membership_record(&membership)))
}

async fn patch_my_membership(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
	Json(body): Json<MyMembershipPatchBody>,
) -> ChatResult<Json<MyMembershipRecord>> {
	let me = caller.require()?;
	let membership = state
		.rooms
		.update_my_membership(me, RoomId(room_id), body.notifications_enabled)
		.await?;
	Ok(Json(my_membership_record(&membership)))
}

async fn mark_seen(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
) -> ChatResult<Json<MyMembershipRecord>> {
	let me = caller.require()?;
	let membership = state.presence.mark_seen(RoomId(room_id), me).await?;
	Ok(Json(my_membership_record(&membership)))
}

async fn leave_room(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
) -> ChatResult<Json<RemovalRecord>> {
	let me = caller.require()?;
	let outcome = state.rooms.remove_member(me, RoomId(room_id), me).await?;
	Ok(Json(removal_record(&outcome)))
}

async fn join_public_room(
	State(state): State<AppState>,
	caller: Caller,
	Path(room_id): Path<i64>,
	Query(query): Query<JoinQuery>,
) -> ChatResult<Json<MyMembershipRecord>> {
	let me = caller.require()?;
	let as_moderator = matches!(query.as_mod.as_deref().map(str::trim), Some("1" | "true"));
	let membership = state.rooms.join_public_room(me, RoomId(room_id), as_moderator).await?;
	Ok(Json(my_membership_record(&membership)))
}

async fn create_public_room(
	State(state): State<AppState>,
	caller: Caller,
	Path(community): Path<String>,
	Json(body): Json<PublicRoomBody>,
) -> ChatResult<(StatusCode, Json<RoomDetail>)> {
	let me = caller.require()?;
	let community = CommunityId::new(community).map_err(|e| ChatError::InvalidInput(e.to_string()))?;
	let room = state.rooms.create_public_room(me, community, body.description).await?;
	Ok((StatusCode::CREATED, Json(load_room_detail(&state, &room, Some(me)).await?)))
}

async fn unread(State(state): State<AppState>, caller: Caller) -> ChatResult<Json<UnreadRecord>> {
	let me = caller.require()?;
	Ok(Json(UnreadRecord {
		has_unread: state.presence.has_unread(me).await?,
	}))
}
