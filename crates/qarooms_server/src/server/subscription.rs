#![forbid(unsafe_code)]

//! Lifetime of one subscriber connection, from upgrade to close.

use core::fmt;
use std::time::Instant;

use async_trait::async_trait;
use qarooms_domain::RoomId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::room_hub::{Frame, RoomHub, SubscriberId};

/// Outbound half of a subscriber transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
	async fn send_frame(&mut self, frame: Frame) -> anyhow::Result<()>;

	/// Close the underlying transport. Errors are ignored.
	async fn close(&mut self);
}

/// Inbound half of a subscriber transport.
#[async_trait]
pub trait PeerEvents: Send {
	/// Resolves once the peer closed the connection or reading failed.
	async fn closed(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	Upgrading,
	Registered,
	Terminating,
	Closed,
}

/// First wakeup cause observed while registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
	/// The subscriber's cancellation token fired (failed delivery or write).
	DeliveryFailed,
	PeerClosed,
	Shutdown,
}

impl TerminationCause {
	pub const fn as_str(self) -> &'static str {
		match self {
			TerminationCause::DeliveryFailed => "delivery_failed",
			TerminationCause::PeerClosed => "peer_closed",
			TerminationCause::Shutdown => "shutdown",
		}
	}
}

impl fmt::Display for TerminationCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOutcome {
	pub id: SubscriberId,
	pub cause: TerminationCause,
	pub frames_written: u64,
}

/// Register a subscriber for `room`, park until the first cancellation
/// cause fires, then unregister and close the transport.
///
/// The hub entry is removed on every exit path, including when this future
/// is dropped before completion.
pub async fn run_subscription<W, R>(
	hub: &RoomHub,
	room: RoomId,
	writer: W,
	mut peer: R,
	shutdown: CancellationToken,
) -> SubscriptionOutcome
where
	W: FrameSink,
	R: PeerEvents,
{
	struct ActiveSubscriberGuard;
	impl Drop for ActiveSubscriberGuard {
		fn drop(&mut self) {
			metrics::gauge!("qarooms_server_active_subscribers").decrement(1.0);
		}
	}

	metrics::gauge!("qarooms_server_active_subscribers").increment(1.0);
	let _gauge_guard = ActiveSubscriberGuard;

	let started = Instant::now();
	let mut state = SubscriptionState::Upgrading;

	let sub = hub.register(room);
	let id = sub.id;
	let cancel = sub.cancel.clone();
	let registration = RegistrationGuard {
		hub: hub.clone(),
		room,
		id,
		cancel: cancel.clone(),
	};
	transition(&mut state, SubscriptionState::Registered, room, id);

	let pump = tokio::spawn(pump_frames(writer, sub.frames, cancel.clone()));

	let cause = tokio::select! {
		biased;
		_ = cancel.cancelled() => TerminationCause::DeliveryFailed,
		_ = peer.closed() => TerminationCause::PeerClosed,
		_ = shutdown.cancelled() => TerminationCause::Shutdown,
	};

	transition(&mut state, SubscriptionState::Terminating, room, id);
	drop(registration);

	let frames_written = match pump.await {
		Ok(n) => n,
		Err(e) => {
			warn!(room = %room, subscriber = %id, error = %e, "subscriber writer task failed");
			0
		}
	};
	transition(&mut state, SubscriptionState::Closed, room, id);

	info!(
		room = %room,
		subscriber = %id,
		cause = %cause,
		frames_written,
		elapsed_ms = started.elapsed().as_millis() as u64,
		"subscriber disconnected"
	);
	metrics::counter!("qarooms_server_subscriptions_closed_total", "cause" => cause.as_str()).increment(1);

	SubscriptionOutcome {
		id,
		cause,
		frames_written,
	}
}

/// Forward queued frames to the transport until cancelled, then close it.
async fn pump_frames<W: FrameSink>(mut writer: W, mut frames: mpsc::Receiver<Frame>, cancel: CancellationToken) -> u64 {
	let mut written: u64 = 0;

	loop {
		let next = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			next = frames.recv() => next,
		};

		// The hub dropped our sender: we are no longer registered.
		let Some(frame) = next else {
			cancel.cancel();
			break;
		};

		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			res = writer.send_frame(frame) => match res {
				Ok(()) => written += 1,
				Err(e) => {
					debug!(error = %e, "subscriber write failed");
					cancel.cancel();
					break;
				}
			},
		}
	}

	writer.close().await;
	written
}

fn transition(state: &mut SubscriptionState, next: SubscriptionState, room: RoomId, id: SubscriberId) {
	debug!(room = %room, subscriber = %id, from = ?*state, to = ?next, "subscription state");
	*state = next;
}

/// Cancels and unregisters a subscriber when dropped.
struct RegistrationGuard {
	hub: RoomHub,
	room: RoomId,
	id: SubscriberId,
	cancel: CancellationToken,
}

impl Drop for RegistrationGuard {
	fn drop(&mut self) {
		self.cancel.cancel();
		self.hub.unregister(self.room, self.id);
	}
}
