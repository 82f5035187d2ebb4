#![forbid(unsafe_code)]

//! Room-scoped events and their wire frames.
//!
//! A delivered frame is `{"kind": <string>, "value": <object>}` followed by
//! a newline. The target room only routes the event and never appears in the
//! frame.

use core::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::{MessageId, RoomId};

/// Direction of a reaction change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
	Add,
	Remove,
}

impl ReactionKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ReactionKind::Add => "add",
			ReactionKind::Remove => "remove",
		}
	}
}

impl fmt::Display for ReactionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreated {
	pub id: MessageId,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactedToMessage {
	pub message_id: MessageId,
	pub reaction_count: i64,
	pub reaction_kind: ReactionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAnswered {
	pub id: MessageId,
}

/// Kind-tagged event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventPayload {
	MessageCreated(MessageCreated),
	ReactedToMessage(ReactedToMessage),
	MessageAnswered(MessageAnswered),
}

impl EventPayload {
	/// Stable wire tag.
	pub const fn kind(&self) -> &'static str {
		match self {
			EventPayload::MessageCreated(_) => "message_created",
			EventPayload::ReactedToMessage(_) => "reacted_to_message",
			EventPayload::MessageAnswered(_) => "message_answered",
		}
	}
}

/// An event addressed to every subscriber of `room`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEvent {
	pub room: RoomId,
	pub payload: EventPayload,
}

impl RoomEvent {
	pub fn new(room: RoomId, payload: EventPayload) -> Self {
		Self { room, payload }
	}

	pub fn message_created(room: RoomId, id: MessageId, message: impl Into<String>) -> Self {
		Self::new(
			room,
			EventPayload::MessageCreated(MessageCreated {
				id,
				message: message.into(),
			}),
		)
	}

	pub fn reacted_to_message(room: RoomId, message_id: MessageId, reaction_count: i64, reaction_kind: ReactionKind) -> Self {
		Self::new(
			room,
			EventPayload::ReactedToMessage(ReactedToMessage {
				message_id,
				reaction_count,
				reaction_kind,
			}),
		)
	}

	pub fn message_answered(room: RoomId, id: MessageId) -> Self {
		Self::new(room, EventPayload::MessageAnswered(MessageAnswered { id }))
	}

	pub const fn kind(&self) -> &'static str {
		self.payload.kind()
	}

	/// Serialize the delivered frame (room excluded).
	///
	/// Existing clients expect HTML-safe strings (`<`, `>`, `&`, U+2028 and
	/// U+2029 as `\uXXXX` escapes) and a trailing newline.
	pub fn to_frame(&self) -> serde_json::Result<String> {
		let mut buf = Vec::with_capacity(128);
		let mut ser = serde_json::Serializer::with_formatter(&mut buf, HtmlSafeFormatter);
		self.payload.serialize(&mut ser)?;
		buf.push(b'\n');
		String::from_utf8(buf).map_err(<serde_json::Error as serde::ser::Error>::custom)
	}
}

/// Compact formatter that also escapes HTML-significant characters.
struct HtmlSafeFormatter;

impl serde_json::ser::Formatter for HtmlSafeFormatter {
	fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
	where
		W: ?Sized + io::Write,
	{
		let mut start = 0;
		for (i, c) in fragment.char_indices() {
			let escaped = match c {
				'<' => "\\u003c",
				'>' => "\\u003e",
				'&' => "\\u0026",
				'\u{2028}' => "\\u2028",
				'\u{2029}' => "\\u2029",
				_ => continue,
			};
			writer.write_all(&fragment.as_bytes()[start..i])?;
			writer.write_all(escaped.as_bytes())?;
			start = i + c.len_utf8();
		}
		writer.write_all(&fragment.as_bytes()[start..])
	}
}
