#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use futures::StreamExt;
use qarooms_domain::{MessageId, RoomId};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::server::api::{AppState, router};
use crate::server::room_hub::{RoomHub, RoomHubConfig, Subscription};
use crate::server::store::InMemoryRoomStore;

fn state() -> AppState {
	AppState {
		hub: RoomHub::new(RoomHubConfig::default()),
		store: Arc::new(InMemoryRoomStore::new()),
		shutdown: CancellationToken::new(),
	}
}

async fn call(state: &AppState, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, String) {
	let req = Request::builder()
		.method(method)
		.uri(uri)
		.header("content-type", "application/json")
		.body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
		.unwrap();

	let resp = router(state.clone()).oneshot(req).await.unwrap();
	let status = resp.status();
	let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
	(status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn call_json(state: &AppState, method: Method, uri: &str, body: Option<&str>) -> Value {
	let (status, text) = call(state, method, uri, body).await;
	assert_eq!(status, StatusCode::OK, "{text}");
	serde_json::from_str(&text).unwrap()
}

async fn create_room(state: &AppState, theme: &str) -> String {
	let body = json!({ "theme": theme }).to_string();
	let v = call_json(state, Method::POST, "/api/rooms", Some(&body)).await;
	v["room_id"].as_str().unwrap().to_string()
}

async fn create_message(state: &AppState, room: &str, text: &str) -> String {
	let body = json!({ "message": text }).to_string();
	let v = call_json(state, Method::POST, &format!("/api/rooms/{room}/messages"), Some(&body)).await;
	v["id"].as_str().unwrap().to_string()
}

fn subscribe(state: &AppState, room: &str) -> Subscription {
	state.hub.register(room.parse::<RoomId>().unwrap())
}

async fn next_frame(sub: &mut Subscription) -> Value {
	let frame = timeout(Duration::from_secs(2), sub.frames.recv())
		.await
		.expect("frame within timeout")
		.expect("queue open");
	serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn rooms_can_be_created_and_listed() {
	let state = state();
	let a = create_room(&state, "rust").await;
	let b = create_room(&state, "sql").await;

	let v = call_json(&state, Method::GET, "/api/rooms", None).await;
	assert_eq!(v, json!({ "rooms": [{ "id": a, "theme": "rust" }, { "id": b, "theme": "sql" }] }));
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
	let state = state();
	for bad in ["{not json", "", "[]", r#"{"theme": 5}"#] {
		let (status, body) = call(&state, Method::POST, "/api/rooms", Some(bad)).await;
		assert_eq!((status, body.as_str()), (StatusCode::BAD_REQUEST, "invalid json\n"), "{bad:?}");
	}

	let resp = router(state.clone())
		.oneshot(Request::builder().uri("/api/rooms/not-a-uuid/messages").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(resp.headers()["content-type"], "text/plain; charset=utf-8");
}

#[tokio::test]
async fn bodies_are_decoded_leniently() {
	let state = state();

	let v = call_json(&state, Method::POST, "/api/rooms", Some("{}")).await;
	let empty_theme = v["room_id"].as_str().unwrap().to_string();

	let v = call_json(&state, Method::POST, "/api/rooms", Some(r#"{"Theme":"upper"} trailing"#)).await;
	let upper = v["room_id"].as_str().unwrap().to_string();

	let v = call_json(&state, Method::POST, "/api/rooms", Some(r#"{"THEME":"loud","theme":"exact"}"#)).await;
	let exact = v["room_id"].as_str().unwrap().to_string();

	let rooms = call_json(&state, Method::GET, "/api/rooms", None).await;
	assert_eq!(
		rooms,
		json!({ "rooms": [
			{ "id": empty_theme, "theme": "" },
			{ "id": upper, "theme": "upper" },
			{ "id": exact, "theme": "exact" }
		] })
	);

	let mut sub = subscribe(&state, &upper);
	let id = create_message(&state, &upper, "placeholder").await;
	assert_eq!(next_frame(&mut sub).await["value"]["id"], id.as_str());

	let v = call_json(&state, Method::POST, &format!("/api/rooms/{upper}/messages"), Some(r#"{"message":null}"#)).await;
	assert_eq!(
		next_frame(&mut sub).await,
		json!({ "kind": "message_created", "value": { "id": v["id"], "message": "" } })
	);
}

#[tokio::test]
async fn message_listing_echoes_the_room_id_as_given() {
	let state = state();
	let room = create_room(&state, "q&a").await;
	let shouted = room.to_uppercase();

	let v = call_json(&state, Method::GET, &format!("/api/rooms/{shouted}/messages"), None).await;
	assert_eq!(v, json!({ "room_id": shouted, "messages": [] }));
}

#[tokio::test]
async fn room_ids_are_validated_before_lookup() {
	let state = state();

	let (status, body) = call(&state, Method::GET, "/api/rooms/not-a-uuid/messages", None).await;
	assert_eq!((status, body.as_str()), (StatusCode::BAD_REQUEST, "invalid room id\n"));

	let unknown = RoomId::new_v4();
	let (status, body) = call(&state, Method::GET, &format!("/api/rooms/{unknown}/messages"), None).await;
	assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "room not found\n"));

	let room = create_room(&state, "q&a").await;
	let (status, body) = call(&state, Method::PATCH, &format!("/api/rooms/{room}/messages/nope/react"), None).await;
	assert_eq!((status, body.as_str()), (StatusCode::BAD_REQUEST, "invalid message id\n"));

	let missing = MessageId::new_v4();
	let (status, body) = call(&state, Method::GET, &format!("/api/rooms/{room}/messages/{missing}"), None).await;
	assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "message not found\n"));
}

#[tokio::test]
async fn creating_a_message_notifies_room_subscribers() {
	let state = state();
	let room = create_room(&state, "q&a").await;
	let other = create_room(&state, "elsewhere").await;
	let mut sub = subscribe(&state, &room);
	let mut bystander = subscribe(&state, &other);

	let id = create_message(&state, &room, "what is ownership?").await;

	assert_eq!(
		next_frame(&mut sub).await,
		json!({ "kind": "message_created", "value": { "id": id, "message": "what is ownership?" } })
	);

	let v = call_json(&state, Method::GET, &format!("/api/rooms/{room}/messages"), None).await;
	assert_eq!(
		v,
		json!({
			"room_id": room,
			"messages": [{ "id": id, "message": "what is ownership?", "answered": false, "reaction_count": 0 }]
		})
	);

	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(bystander.frames.try_recv().is_err());
}

#[tokio::test]
async fn reactions_are_counted_and_broadcast() {
	let state = state();
	let room = create_room(&state, "q&a").await;
	let mut sub = subscribe(&state, &room);
	let id = create_message(&state, &room, "borrowck?").await;
	assert_eq!(next_frame(&mut sub).await["kind"], "message_created");
	let uri = format!("/api/rooms/{room}/messages/{id}/react");

	let v = call_json(&state, Method::PATCH, &uri, None).await;
	assert_eq!(v, json!({ "id": id, "reaction_count": 1 }));
	assert_eq!(
		next_frame(&mut sub).await,
		json!({
			"kind": "reacted_to_message",
			"value": { "message_id": id, "reaction_count": 1, "reaction_kind": "add" }
		})
	);

	let v = call_json(&state, Method::DELETE, &uri, None).await;
	assert_eq!(v, json!({ "id": id, "reaction_count": 0 }));
	assert_eq!(
		next_frame(&mut sub).await,
		json!({
			"kind": "reacted_to_message",
			"value": { "message_id": id, "reaction_count": 0, "reaction_kind": "remove" }
		})
	);

	let v = call_json(&state, Method::DELETE, &uri, None).await;
	assert_eq!(v["reaction_count"], 0);
}

#[tokio::test]
async fn answering_returns_no_content_and_broadcasts() {
	let state = state();
	let room = create_room(&state, "q&a").await;
	let mut sub = subscribe(&state, &room);
	let id = create_message(&state, &room, "lifetimes?").await;
	assert_eq!(next_frame(&mut sub).await["kind"], "message_created");

	let (status, body) = call(&state, Method::PATCH, &format!("/api/rooms/{room}/messages/{id}/answer"), None).await;
	assert_eq!(status, StatusCode::NO_CONTENT);
	assert!(body.is_empty());

	assert_eq!(next_frame(&mut sub).await, json!({ "kind": "message_answered", "value": { "id": id } }));

	let v = call_json(&state, Method::GET, &format!("/api/rooms/{room}/messages/{id}"), None).await;
	assert_eq!(v["answered"], true);
}

#[tokio::test]
async fn messages_from_another_room_are_not_found() {
	let state = state();
	let room = create_room(&state, "a").await;
	let other = create_room(&state, "b").await;
	let id = create_message(&state, &other, "wrong room").await;

	for (method, suffix) in [(Method::GET, ""), (Method::PATCH, "/react"), (Method::PATCH, "/answer")] {
		let (status, body) = call(&state, method, &format!("/api/rooms/{room}/messages/{id}{suffix}"), None).await;
		assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "message not found\n"));
	}
}

#[tokio::test]
async fn subscribe_validates_room_then_upgrade() {
	let state = state();

	let (status, body) = call(&state, Method::GET, "/subscribe/garbage", None).await;
	assert_eq!((status, body.as_str()), (StatusCode::BAD_REQUEST, "invalid room id\n"));

	let unknown = RoomId::new_v4();
	let (status, body) = call(&state, Method::GET, &format!("/subscribe/{unknown}"), None).await;
	assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "room not found\n"));

	let room = create_room(&state, "q&a").await;
	let (status, body) = call(&state, Method::GET, &format!("/subscribe/{room}"), None).await;
	assert_eq!((status, body.as_str()), (StatusCode::BAD_REQUEST, "Failed to upgrade connection.\n"));
	assert_eq!(state.hub.subscriber_count(room.parse().unwrap()), 0);
}

async fn wait_for_subscribers(hub: &RoomHub, room: RoomId, n: usize) {
	timeout(Duration::from_secs(2), async {
		while hub.subscriber_count(room) != n {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("room never reached {n} subscribers"));
}

#[tokio::test]
async fn websocket_subscriber_receives_room_events() {
	let state = state();
	let room = create_room(&state, "live").await;
	let room_id: RoomId = room.parse().unwrap();

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let app = router(state.clone());
	let server = tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/subscribe/{room}"))
		.await
		.expect("websocket handshake");
	wait_for_subscribers(&state.hub, room_id, 1).await;

	let id = create_message(&state, &room, "over & the wire").await;

	let msg = timeout(Duration::from_secs(2), ws.next())
		.await
		.expect("frame within timeout")
		.expect("stream open")
		.expect("valid frame");
	assert_eq!(
		msg.to_text().unwrap(),
		format!(r#"{{"kind":"message_created","value":{{"id":"{id}","message":"over \u0026 the wire"}}}}"#) + "\n"
	);

	ws.close(None).await.unwrap();
	wait_for_subscribers(&state.hub, room_id, 0).await;

	server.abort();
}

#[tokio::test]
async fn shutdown_closes_websocket_subscribers() {
	let state = state();
	let room = create_room(&state, "live").await;
	let room_id: RoomId = room.parse().unwrap();

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let app = router(state.clone());
	let server = tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/subscribe/{room}"))
		.await
		.expect("websocket handshake");
	wait_for_subscribers(&state.hub, room_id, 1).await;

	state.shutdown.cancel();
	wait_for_subscribers(&state.hub, room_id, 0).await;

	// The server side closes its half; the client sees a close frame or end of stream.
	let next = timeout(Duration::from_secs(2), ws.next()).await.expect("close within timeout");
	match next {
		None | Some(Err(_)) => {}
		Some(Ok(msg)) => assert!(msg.is_close(), "unexpected frame {msg:?}"),
	}

	server.abort();
}
