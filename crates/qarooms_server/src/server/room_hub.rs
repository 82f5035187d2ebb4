#![forbid(unsafe_code)]

//! Room-scoped subscriber registry and event fan-out.
//!
//! Every registered subscriber owns a bounded outbound queue; the hub keeps
//! the sending half plus a cancellation token per subscriber. Publishing
//! enqueues with `try_send` while holding the registry lock, so a slow
//! socket never stalls the lock: it fills its queue and is dropped.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use qarooms_domain::{RoomEvent, RoomId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Serialized event frame shared by all recipients of one publish.
pub type Frame = Arc<str>;

/// Registry and broadcaster for room subscribers.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	next_id: Arc<AtomicU64>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued frames per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Identifies one registration in the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "sub-{}", self.0)
	}
}

/// Subscriber-side half of a registration.
#[derive(Debug)]
pub struct Subscription {
	pub id: SubscriberId,
	#[allow(dead_code)]
	pub room: RoomId,
	/// Fired by the hub when a delivery to this subscriber fails.
	pub cancel: CancellationToken,
	pub frames: mpsc::Receiver<Frame>,
}

/// Point-in-time view of one registry entry.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct SubscriberSnapshot {
	pub id: SubscriberId,
	pub cancel: CancellationToken,
	sender: mpsc::Sender<Frame>,
}

#[allow(dead_code)]
impl SubscriberSnapshot {
	/// Whether the subscriber side has dropped its queue.
	pub fn is_closed(&self) -> bool {
		self.sender.is_closed()
	}

	/// Frames waiting in the subscriber queue.
	pub fn queued(&self) -> usize {
		self.sender.max_capacity() - self.sender.capacity()
	}
}

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
	QueueFull,
	Closed,
}

impl DeliveryFailure {
	pub const fn as_str(self) -> &'static str {
		match self {
			DeliveryFailure::QueueFull => "queue_full",
			DeliveryFailure::Closed => "closed",
		}
	}
}

/// Result of one publish, for logging and tests. Never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
	pub delivered: usize,
	pub dropped: Vec<(SubscriberId, DeliveryFailure)>,
}

impl PublishReport {
	pub fn attempted(&self) -> usize {
		self.delivered + self.dropped.len()
	}
}

impl Default for RoomHub {
	fn default() -> Self {
		Self::new(RoomHubConfig::default())
	}
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			next_id: Arc::new(AtomicU64::new(1)),
			cfg,
		}
	}

	/// Register a new subscriber for `room`.
	pub fn register(&self, room: RoomId) -> Subscription {
		let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));
		let cancel = CancellationToken::new();

		let mut inner = self.inner.lock();
		let entry = inner.rooms.entry(room).or_default();
		entry.subscribers.insert(
			id,
			Subscriber {
				sender: tx,
				cancel: cancel.clone(),
			},
		);

		if self.cfg.debug_logs {
			debug!(room = %room, subscriber = %id, subs = entry.subscribers.len(), "room hub: registered");
		}
		metrics::counter!("qarooms_server_subscribers_registered_total").increment(1);

		Subscription {
			id,
			room,
			cancel,
			frames: rx,
		}
	}

	/// Remove a subscriber. Returns whether it was still registered.
	///
	/// Absent entries are not an error: a failed delivery and a peer
	/// disconnect may both try to clean up the same subscriber.
	pub fn unregister(&self, room: RoomId, id: SubscriberId) -> bool {
		let mut inner = self.inner.lock();
		let removed = inner
			.rooms
			.get_mut(&room)
			.and_then(|entry| entry.subscribers.remove(&id))
			.is_some();

		if removed && self.cfg.debug_logs {
			debug!(room = %room, subscriber = %id, "room hub: unregistered");
		}

		removed
	}

	/// Current members of `room`, ordered by registration.
	#[allow(dead_code)]
	pub fn snapshot(&self, room: RoomId) -> Vec<SubscriberSnapshot> {
		let inner = self.inner.lock();
		let Some(entry) = inner.rooms.get(&room) else {
			return Vec::new();
		};

		let mut subs = entry
			.subscribers
			.iter()
			.map(|(id, s)| SubscriberSnapshot {
				id: *id,
				cancel: s.cancel.clone(),
				sender: s.sender.clone(),
			})
			.collect::<Vec<_>>();
		subs.sort_by_key(|s| s.id);
		subs
	}

	/// Deliver `event` to every subscriber of `event.room`.
	///
	/// Each subscriber gets exactly one attempt. Subscribers whose attempt
	/// fails are cancelled and removed before this returns; the remaining
	/// deliveries still happen.
	pub fn publish(&self, event: &RoomEvent) -> PublishReport {
		metrics::counter!("qarooms_server_publish_total", "kind" => event.kind()).increment(1);

		let frame: Frame = match event.to_frame() {
			Ok(f) => Arc::from(f),
			Err(e) => {
				warn!(room = %event.room, kind = event.kind(), error = %e, "failed to serialize event");
				return PublishReport::default();
			}
		};

		self.publish_frame(event.room, frame)
	}

	/// Run `publish` on an independent task. Callers are not expected to
	/// await the handle.
	pub fn publish_detached(&self, event: RoomEvent) -> JoinHandle<PublishReport> {
		let hub = self.clone();
		tokio::spawn(async move { hub.publish(&event) })
	}

	pub(crate) fn publish_frame(&self, room: RoomId, frame: Frame) -> PublishReport {
		let mut report = PublishReport::default();

		let mut inner = self.inner.lock();
		let Some(entry) = inner.rooms.get_mut(&room) else {
			return report;
		};

		for (id, sub) in entry.subscribers.iter() {
			match sub.sender.try_send(Arc::clone(&frame)) {
				Ok(()) => report.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => report.dropped.push((*id, DeliveryFailure::QueueFull)),
				Err(mpsc::error::TrySendError::Closed(_)) => report.dropped.push((*id, DeliveryFailure::Closed)),
			}
		}

		for (id, reason) in &report.dropped {
			if let Some(sub) = entry.subscribers.remove(id) {
				sub.cancel.cancel();
			}
			warn!(room = %room, subscriber = %id, reason = reason.as_str(), "failed to deliver event; dropping subscriber");
			metrics::counter!("qarooms_server_delivery_failures_total", "reason" => reason.as_str()).increment(1);
		}
		drop(inner);

		metrics::counter!("qarooms_server_deliveries_total").increment(report.delivered as u64);

		if self.cfg.debug_logs && report.attempted() > 0 {
			debug!(
				room = %room,
				delivered = report.delivered,
				dropped = report.dropped.len(),
				"room hub: published"
			);
		}

		report
	}

	/// Number of registered subscribers in `room`.
	#[allow(dead_code)]
	pub fn subscriber_count(&self, room: RoomId) -> usize {
		let inner = self.inner.lock();
		inner.rooms.get(&room).map(|e| e.subscribers.len()).unwrap_or(0)
	}

	/// Get a snapshot of subscriber counts per room.
	pub fn room_subscriber_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock();
		inner.rooms.iter().map(|(k, v)| (*k, v.subscribers.len())).collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	/// Emptied rooms are kept; ids are reused across reconnects.
	rooms: HashMap<RoomId, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: HashMap<SubscriberId, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	sender: mpsc::Sender<Frame>,
	cancel: CancellationToken,
}
