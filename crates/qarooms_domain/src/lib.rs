#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod event;

pub use event::{EventPayload, MessageAnswered, MessageCreated, ReactedToMessage, ReactionKind, RoomEvent};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}

	uuid::Uuid::parse_str(s).map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
}

/// Room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(uuid::Uuid);

impl RoomId {
	/// Create a new random room id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	pub const fn from_uuid(id: uuid::Uuid) -> Self {
		Self(id)
	}

	pub const fn as_uuid(&self) -> &uuid::Uuid {
		&self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_uuid(s).map(Self)
	}
}

/// Message identifier, unique across rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	pub const fn from_uuid(id: uuid::Uuid) -> Self {
		Self(id)
	}

	pub const fn as_uuid(&self) -> &uuid::Uuid {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		parse_uuid(s).map(Self)
	}
}

/// A Q&A room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub theme: String,
}

/// A question posted into a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub room_id: RoomId,
	pub message: String,
	pub reaction_count: i64,
	pub answered: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn room_id_parse_and_display() {
		let raw = "4f9c2b3e-8a61-4d2b-9e37-0c5a1f6d7e80";
		let id: RoomId = raw.parse().unwrap();
		assert_eq!(id.to_string(), raw);
	}

	#[test]
	fn message_id_trims_input() {
		let id: MessageId = "  4f9c2b3e-8a61-4d2b-9e37-0c5a1f6d7e80 ".parse().unwrap();
		assert_eq!(id.to_string(), "4f9c2b3e-8a61-4d2b-9e37-0c5a1f6d7e80");
	}

	#[test]
	fn rejects_empty_and_malformed_ids() {
		assert_eq!("".parse::<RoomId>(), Err(ParseIdError::Empty));
		assert_eq!("   ".parse::<MessageId>(), Err(ParseIdError::Empty));
		assert!(matches!("room-A".parse::<RoomId>(), Err(ParseIdError::InvalidFormat(_))));
	}

	#[test]
	fn ids_serialize_as_plain_strings() {
		let id = RoomId::new_v4();
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{id}\""));
	}
}
