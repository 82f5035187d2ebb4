#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::room_hub::RoomHub;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	hub: RoomHub,
}

impl HealthState {
	pub fn new(hub: RoomHub) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			hub,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// `{"rooms": {"<room id>": <subscribers>}, "subscribers": <total>}`.
	fn stats_json(&self) -> String {
		let counts = self.hub.room_subscriber_counts();
		let total: usize = counts.values().sum();
		let rooms = counts
			.into_iter()
			.map(|(room, n)| (room.to_string(), serde_json::Value::from(n)))
			.collect::<serde_json::Map<String, serde_json::Value>>();

		serde_json::json!({ "rooms": rooms, "subscribers": total }).to_string()
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route_health(req.method(), req.uri().path(), &state))
}

fn route_health(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if *method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/statz" => {
			let mut resp = respond(StatusCode::OK, Bytes::from(state.stats_json()));
			resp.headers_mut().insert(
				hyper::header::CONTENT_TYPE,
				hyper::header::HeaderValue::from_static("application/json"),
			);
			resp
		}
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;
	use qarooms_domain::RoomId;

	use super::*;

	async fn body_string(resp: Response<Full<Bytes>>) -> String {
		let bytes = resp.into_body().collect().await.expect("full body").to_bytes();
		String::from_utf8(bytes.to_vec()).expect("utf8 body")
	}

	#[tokio::test]
	async fn readiness_flips_after_mark_ready() {
		let state = HealthState::new(RoomHub::default());

		let resp = route_health(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let resp = route_health(&Method::GET, "/readyz", &state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(body_string(resp).await, "ready");
	}

	#[tokio::test]
	async fn statz_reports_subscribers_per_room() {
		let hub = RoomHub::default();
		let room = RoomId::new_v4();
		let _a = hub.register(room);
		let _b = hub.register(room);

		let state = HealthState::new(hub);
		let resp = route_health(&Method::GET, "/statz", &state);
		assert_eq!(resp.status(), StatusCode::OK);

		let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
		assert_eq!(body["subscribers"], 2);
		assert_eq!(body["rooms"][room.to_string()], 2);
	}

	#[test]
	fn rejects_non_get_and_unknown_paths() {
		let state = HealthState::new(RoomHub::default());
		assert_eq!(
			route_health(&Method::POST, "/healthz", &state).status(),
			StatusCode::METHOD_NOT_ALLOWED
		);
		assert_eq!(route_health(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}
}
