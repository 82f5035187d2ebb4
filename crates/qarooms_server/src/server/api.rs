#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use bytes::Bytes;
use qarooms_domain::{Message, MessageId, ReactionKind, RoomEvent, RoomId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::server::room_hub::RoomHub;
use crate::server::store::RoomStore;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
	pub hub: RoomHub,
	pub store: Arc<dyn RoomStore>,
	/// Cancelled on server shutdown; every subscriber observes it.
	pub shutdown: CancellationToken,
}

/// Errors reported to HTTP callers as plain-text bodies.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error("invalid room id")]
	InvalidRoomId,
	#[error("invalid message id")]
	InvalidMessageId,
	#[error("invalid json")]
	InvalidJson,
	#[error("room not found")]
	RoomNotFound,
	#[error("message not found")]
	MessageNotFound,
	#[error("Failed to upgrade connection.")]
	UpgradeFailed,
	#[error("something went wrong. try again later")]
	Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
	fn from(e: anyhow::Error) -> Self {
		ApiError::Internal(e)
	}
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::InvalidRoomId | ApiError::InvalidMessageId | ApiError::InvalidJson | ApiError::UpgradeFailed => {
				StatusCode::BAD_REQUEST
			}
			ApiError::RoomNotFound | ApiError::MessageNotFound => StatusCode::NOT_FOUND,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if let ApiError::Internal(e) = &self {
			error!(error = ?e, "request failed");
		}
		(self.status(), format!("{self}\n")).into_response()
	}
}

/// Build the public router: the subscribe endpoint plus the REST API.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/subscribe/{room_id}", get(handle_subscribe))
		.route("/api/rooms", post(handle_create_room).get(handle_get_rooms))
		.route(
			"/api/rooms/{room_id}/messages",
			get(handle_get_room_messages).post(handle_create_message),
		)
		.route("/api/rooms/{room_id}/messages/{message_id}", get(handle_get_room_message))
		.route(
			"/api/rooms/{room_id}/messages/{message_id}/react",
			patch(handle_react_to_message).delete(handle_remove_reaction),
		)
		.route("/api/rooms/{room_id}/messages/{message_id}/answer", patch(handle_mark_message_answered))
		.layer(TraceLayer::new_for_http())
		.layer(cors_layer())
		.with_state(state)
}

fn cors_layer() -> CorsLayer {
	CorsLayer::new()
		.allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
			let origin = origin.as_bytes();
			origin.starts_with(b"https://") || origin.starts_with(b"http://")
		}))
		.allow_methods([
			Method::GET,
			Method::POST,
			Method::PUT,
			Method::DELETE,
			Method::OPTIONS,
			Method::PATCH,
		])
		.allow_headers([
			header::ACCEPT,
			header::AUTHORIZATION,
			header::CONTENT_TYPE,
			HeaderName::from_static("x-csrf-token"),
		])
		.expose_headers([header::LINK])
		.allow_credentials(false)
		.max_age(Duration::from_secs(300))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateRoomBody {
	theme: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateMessageBody {
	message: String,
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
	room_id: RoomId,
}

#[derive(Debug, Serialize)]
struct RoomResponse {
	id: RoomId,
	theme: String,
}

#[derive(Debug, Serialize)]
struct RoomsResponse {
	rooms: Vec<RoomResponse>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
	id: MessageId,
	message: String,
	answered: bool,
	reaction_count: i64,
}

impl From<Message> for MessageResponse {
	fn from(m: Message) -> Self {
		Self {
			id: m.id,
			message: m.message,
			answered: m.answered,
			reaction_count: m.reaction_count,
		}
	}
}

#[derive(Debug, Serialize)]
struct RoomMessagesResponse {
	/// Echoed as given in the path.
	room_id: String,
	messages: Vec<MessageResponse>,
}

#[derive(Debug, Serialize)]
struct CreateMessageResponse {
	id: MessageId,
}

#[derive(Debug, Serialize)]
struct ReactionResponse {
	id: MessageId,
	reaction_count: i64,
}

/// Decode a request body leniently: only the first JSON value is read,
/// `null` and missing fields fall back to defaults, and keys match
/// case-insensitively (an exact lowercase key wins).
fn parse_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
	let value = serde_json::Deserializer::from_slice(body)
		.into_iter::<Value>()
		.next()
		.ok_or(ApiError::InvalidJson)?
		.map_err(|_| ApiError::InvalidJson)?;

	let fields = match value {
		Value::Null => return Ok(T::default()),
		Value::Object(fields) => fields,
		_ => return Err(ApiError::InvalidJson),
	};

	let mut normalized = serde_json::Map::with_capacity(fields.len());
	for (key, value) in fields {
		if value.is_null() {
			continue;
		}
		let lower = key.to_ascii_lowercase();
		if key == lower || !normalized.contains_key(&lower) {
			normalized.insert(lower, value);
		}
	}

	serde_json::from_value(Value::Object(normalized)).map_err(|_| ApiError::InvalidJson)
}

/// Parse `raw` and check the room exists.
async fn existing_room(state: &AppState, raw: &str) -> Result<RoomId, ApiError> {
	let room_id: RoomId = raw.parse().map_err(|_| ApiError::InvalidRoomId)?;
	if !state.store.room_exists(room_id).await? {
		return Err(ApiError::RoomNotFound);
	}
	Ok(room_id)
}

/// Parse both ids and load the message, which must belong to the room.
async fn existing_message(state: &AppState, raw_room: &str, raw_message: &str) -> Result<(RoomId, Message), ApiError> {
	let room_id: RoomId = raw_room.parse().map_err(|_| ApiError::InvalidRoomId)?;
	let message_id: MessageId = raw_message.parse().map_err(|_| ApiError::InvalidMessageId)?;

	if !state.store.room_exists(room_id).await? {
		return Err(ApiError::RoomNotFound);
	}

	match state.store.get_message(message_id).await? {
		Some(m) if m.room_id == room_id => Ok((room_id, m)),
		_ => Err(ApiError::MessageNotFound),
	}
}

async fn handle_subscribe(
	State(state): State<AppState>,
	Path(raw_room_id): Path<String>,
	ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
	let room_id = existing_room(&state, &raw_room_id).await?;

	let ws = ws.map_err(|rejection| {
		warn!(room = %room_id, error = %rejection, "failed to upgrade connection");
		metrics::counter!("qarooms_server_upgrade_failures_total").increment(1);
		ApiError::UpgradeFailed
	})?;

	let hub = state.hub.clone();
	let shutdown = state.shutdown.clone();

	Ok(ws
		.on_failed_upgrade(move |e| warn!(room = %room_id, error = %e, "websocket upgrade failed"))
		.on_upgrade(move |socket| async move {
			let _ = crate::server::ws::serve_socket(socket, hub, room_id, shutdown).await;
		}))
}

async fn handle_create_room(State(state): State<AppState>, body: Bytes) -> Result<Json<CreateRoomResponse>, ApiError> {
	let body: CreateRoomBody = parse_json(&body)?;

	let room_id = state.store.insert_room(&body.theme).await?;
	info!(room = %room_id, "room created");
	metrics::counter!("qarooms_server_mutations_total", "kind" => "create_room").increment(1);

	Ok(Json(CreateRoomResponse { room_id }))
}

async fn handle_get_rooms(State(state): State<AppState>) -> Result<Json<RoomsResponse>, ApiError> {
	let rooms = state
		.store
		.list_rooms()
		.await?
		.into_iter()
		.map(|r| RoomResponse { id: r.id, theme: r.theme })
		.collect();

	Ok(Json(RoomsResponse { rooms }))
}

async fn handle_get_room_messages(
	State(state): State<AppState>,
	Path(raw_room_id): Path<String>,
) -> Result<Json<RoomMessagesResponse>, ApiError> {
	let room_id = existing_room(&state, &raw_room_id).await?;

	let messages = state
		.store
		.list_room_messages(room_id)
		.await?
		.into_iter()
		.map(MessageResponse::from)
		.collect();

	Ok(Json(RoomMessagesResponse {
		room_id: raw_room_id,
		messages,
	}))
}

async fn handle_create_message(
	State(state): State<AppState>,
	Path(raw_room_id): Path<String>,
	body: Bytes,
) -> Result<Json<CreateMessageResponse>, ApiError> {
	let room_id = existing_room(&state, &raw_room_id).await?;
	let body: CreateMessageBody = parse_json(&body)?;

	let message_id = state.store.insert_message(room_id, &body.message).await?;
	metrics::counter!("qarooms_server_mutations_total", "kind" => "create_message").increment(1);

	state
		.hub
		.publish_detached(RoomEvent::message_created(room_id, message_id, body.message));

	Ok(Json(CreateMessageResponse { id: message_id }))
}

async fn handle_get_room_message(
	State(state): State<AppState>,
	Path((raw_room_id, raw_message_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
	let (_, message) = existing_message(&state, &raw_room_id, &raw_message_id).await?;
	Ok(Json(message.into()))
}

async fn handle_react_to_message(
	State(state): State<AppState>,
	Path((raw_room_id, raw_message_id)): Path<(String, String)>,
) -> Result<Json<ReactionResponse>, ApiError> {
	change_reaction(&state, &raw_room_id, &raw_message_id, ReactionKind::Add).await
}

async fn handle_remove_reaction(
	State(state): State<AppState>,
	Path((raw_room_id, raw_message_id)): Path<(String, String)>,
) -> Result<Json<ReactionResponse>, ApiError> {
	change_reaction(&state, &raw_room_id, &raw_message_id, ReactionKind::Remove).await
}

async fn change_reaction(
	state: &AppState,
	raw_room_id: &str,
	raw_message_id: &str,
	kind: ReactionKind,
) -> Result<Json<ReactionResponse>, ApiError> {
	let (room_id, message) = existing_message(state, raw_room_id, raw_message_id).await?;

	let count = match kind {
		ReactionKind::Add => state.store.react_to_message(message.id).await?,
		ReactionKind::Remove => state.store.remove_reaction(message.id).await?,
	};
	metrics::counter!("qarooms_server_mutations_total", "kind" => "reaction").increment(1);

	state
		.hub
		.publish_detached(RoomEvent::reacted_to_message(room_id, message.id, count, kind));

	Ok(Json(ReactionResponse {
		id: message.id,
		reaction_count: count,
	}))
}

async fn handle_mark_message_answered(
	State(state): State<AppState>,
	Path((raw_room_id, raw_message_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
	let (room_id, message) = existing_message(&state, &raw_room_id, &raw_message_id).await?;

	state.store.mark_message_answered(message.id).await?;
	metrics::counter!("qarooms_server_mutations_total", "kind" => "answer").increment(1);

	state.hub.publish_detached(RoomEvent::message_answered(room_id, message.id));

	Ok(StatusCode::NO_CONTENT)
}
