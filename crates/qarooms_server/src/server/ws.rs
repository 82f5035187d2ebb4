#![forbid(unsafe_code)]

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use qarooms_domain::RoomId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::server::room_hub::{Frame, RoomHub};
use crate::server::subscription::{FrameSink, PeerEvents, SubscriptionOutcome, run_subscription};

/// Write half of an upgraded WebSocket.
pub struct WsFrameSink {
	sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
	async fn send_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
		self.sink.send(Message::Text(frame.to_string().into())).await?;
		Ok(())
	}

	async fn close(&mut self) {
		let _ = SinkExt::close(&mut self.sink).await;
	}
}

/// Read half of an upgraded WebSocket. Subscribers are receive-only, so
/// inbound data frames are discarded.
pub struct WsPeer {
	stream: SplitStream<WebSocket>,
}

#[async_trait]
impl PeerEvents for WsPeer {
	async fn closed(&mut self) {
		while let Some(msg) = self.stream.next().await {
			match msg {
				Ok(Message::Close(frame)) => {
					debug!(?frame, "peer sent close frame");
					return;
				}
				Ok(_) => continue,
				Err(e) => {
					debug!(error = %e, "peer read failed");
					return;
				}
			}
		}
	}
}

/// Drive one subscriber socket for `room` until it terminates.
pub async fn serve_socket(socket: WebSocket, hub: RoomHub, room: RoomId, shutdown: CancellationToken) -> SubscriptionOutcome {
	let (sink, stream) = socket.split();
	info!(room = %room, "subscriber connected");

	run_subscription(&hub, room, WsFrameSink { sink }, WsPeer { stream }, shutdown).await
}
