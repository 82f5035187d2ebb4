#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use qarooms_domain::{Message, MessageId, Room, RoomId};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;

/// Persistence for rooms and their messages.
#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
	async fn insert_room(&self, theme: &str) -> anyhow::Result<RoomId>;

	async fn get_room(&self, id: RoomId) -> anyhow::Result<Option<Room>>;

	async fn list_rooms(&self) -> anyhow::Result<Vec<Room>>;

	async fn insert_message(&self, room: RoomId, message: &str) -> anyhow::Result<MessageId>;

	async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>>;

	/// Messages of `room` in creation order.
	async fn list_room_messages(&self, room: RoomId) -> anyhow::Result<Vec<Message>>;

	/// Increment the reaction count and return the new value.
	async fn react_to_message(&self, id: MessageId) -> anyhow::Result<i64>;

	/// Decrement the reaction count (never below zero) and return the new value.
	async fn remove_reaction(&self, id: MessageId) -> anyhow::Result<i64>;

	async fn mark_message_answered(&self, id: MessageId) -> anyhow::Result<()>;

	async fn room_exists(&self, id: RoomId) -> anyhow::Result<bool> {
		Ok(self.get_room(id).await?.is_some())
	}
}

#[derive(Debug, Default)]
struct MemoryState {
	rooms: Vec<Room>,
	messages: HashMap<MessageId, Message>,
	message_order: Vec<MessageId>,
}

impl MemoryState {
	fn message_mut(&mut self, id: MessageId) -> anyhow::Result<&mut Message> {
		self.messages.get_mut(&id).ok_or_else(|| anyhow!("message {id} not found"))
	}
}

/// Process-local store, used when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryRoomStore {
	inner: Mutex<MemoryState>,
}

impl InMemoryRoomStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl RoomStore for InMemoryRoomStore {
	async fn insert_room(&self, theme: &str) -> anyhow::Result<RoomId> {
		let id = RoomId::new_v4();
		let mut guard = self.inner.lock().await;
		guard.rooms.push(Room {
			id,
			theme: theme.to_string(),
		});
		Ok(id)
	}

	async fn get_room(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		let guard = self.inner.lock().await;
		Ok(guard.rooms.iter().find(|r| r.id == id).cloned())
	}

	async fn list_rooms(&self) -> anyhow::Result<Vec<Room>> {
		let guard = self.inner.lock().await;
		Ok(guard.rooms.clone())
	}

	async fn insert_message(&self, room: RoomId, message: &str) -> anyhow::Result<MessageId> {
		let mut guard = self.inner.lock().await;
		if !guard.rooms.iter().any(|r| r.id == room) {
			return Err(anyhow!("room {room} not found"));
		}

		let id = MessageId::new_v4();
		guard.messages.insert(
			id,
			Message {
				id,
				room_id: room,
				message: message.to_string(),
				reaction_count: 0,
				answered: false,
			},
		);
		guard.message_order.push(id);
		Ok(id)
	}

	async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
		let guard = self.inner.lock().await;
		Ok(guard.messages.get(&id).cloned())
	}

	async fn list_room_messages(&self, room: RoomId) -> anyhow::Result<Vec<Message>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.message_order
			.iter()
			.filter_map(|id| guard.messages.get(id))
			.filter(|m| m.room_id == room)
			.cloned()
			.collect())
	}

	async fn react_to_message(&self, id: MessageId) -> anyhow::Result<i64> {
		let mut guard = self.inner.lock().await;
		let msg = guard.message_mut(id)?;
		msg.reaction_count = msg.reaction_count.saturating_add(1);
		Ok(msg.reaction_count)
	}

	async fn remove_reaction(&self, id: MessageId) -> anyhow::Result<i64> {
		let mut guard = self.inner.lock().await;
		let msg = guard.message_mut(id)?;
		msg.reaction_count = (msg.reaction_count - 1).max(0);
		Ok(msg.reaction_count)
	}

	async fn mark_message_answered(&self, id: MessageId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.message_mut(id)?.answered = true;
		Ok(())
	}
}

/// SQL-backed store (`sqlite:` or `postgres:` URLs).
#[derive(Clone)]
pub struct SqlRoomStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (String, String, String, i64, bool);

impl SqlRoomStore {
	/// Connect and apply embedded migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every pooled connection to an in-memory database would see its own empty database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

fn room_from_row((id, theme): (String, String)) -> anyhow::Result<Room> {
	let id = id.parse::<RoomId>().with_context(|| format!("decode room id {id:?}"))?;
	Ok(Room { id, theme })
}

fn message_from_row((id, room_id, message, reaction_count, answered): MessageRow) -> anyhow::Result<Message> {
	Ok(Message {
		id: id.parse().with_context(|| format!("decode message id {id:?}"))?,
		room_id: room_id.parse().with_context(|| format!("decode room id {room_id:?}"))?,
		message,
		reaction_count,
		answered,
	})
}

#[async_trait::async_trait]
impl RoomStore for SqlRoomStore {
	async fn insert_room(&self, theme: &str) -> anyhow::Result<RoomId> {
		let id = RoomId::new_v4();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO rooms (id, theme, created_at) VALUES (?, ?, strftime('%s','now'))")
					.bind(id.to_string())
					.bind(theme)
					.execute(pool)
					.await
					.context("insert room (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO rooms (id, theme, created_at) VALUES ($1, $2, NOW())")
					.bind(id.to_string())
					.bind(theme)
					.execute(pool)
					.await
					.context("insert room (postgres)")?;
			}
		}
		Ok(id)
	}

	async fn get_room(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		let row: Option<(String, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, theme FROM rooms WHERE id = ?")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id, theme FROM rooms WHERE id = $1")
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select room (postgres)")?,
		};
		row.map(room_from_row).transpose()
	}

	async fn list_rooms(&self) -> anyhow::Result<Vec<Room>> {
		let rows: Vec<(String, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, theme FROM rooms ORDER BY seq")
				.fetch_all(pool)
				.await
				.context("select rooms (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id, theme FROM rooms ORDER BY seq")
				.fetch_all(pool)
				.await
				.context("select rooms (postgres)")?,
		};
		rows.into_iter().map(room_from_row).collect()
	}

	async fn insert_message(&self, room: RoomId, message: &str) -> anyhow::Result<MessageId> {
		let id = MessageId::new_v4();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, message, reaction_count, answered, created_at) \
					VALUES (?, ?, ?, 0, 0, strftime('%s','now'))",
				)
				.bind(id.to_string())
				.bind(room.to_string())
				.bind(message)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, message, reaction_count, answered, created_at) \
					VALUES ($1, $2, $3, 0, FALSE, NOW())",
				)
				.bind(id.to_string())
				.bind(room.to_string())
				.bind(message)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}
		Ok(id)
	}

	async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
		let row: Option<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, room_id, message, reaction_count, answered FROM messages WHERE id = ?")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("select message (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, room_id, message, reaction_count, answered FROM messages WHERE id = $1")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("select message (postgres)")?
			}
		};
		row.map(message_from_row).transpose()
	}

	async fn list_room_messages(&self, room: RoomId) -> anyhow::Result<Vec<Message>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_id, message, reaction_count, answered FROM messages WHERE room_id = ? ORDER BY seq",
			)
			.bind(room.to_string())
			.fetch_all(pool)
			.await
			.context("select room messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_id, message, reaction_count, answered FROM messages WHERE room_id = $1 ORDER BY seq",
			)
			.bind(room.to_string())
			.fetch_all(pool)
			.await
			.context("select room messages (postgres)")?,
		};
		rows.into_iter().map(message_from_row).collect()
	}

	async fn react_to_message(&self, id: MessageId) -> anyhow::Result<i64> {
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("UPDATE messages SET reaction_count = reaction_count + 1 WHERE id = ? RETURNING reaction_count")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("react to message (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("UPDATE messages SET reaction_count = reaction_count + 1 WHERE id = $1 RETURNING reaction_count")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("react to message (postgres)")?
			}
		};
		row.map(|(c,)| c).ok_or_else(|| anyhow!("message {id} not found"))
	}

	async fn remove_reaction(&self, id: MessageId) -> anyhow::Result<i64> {
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"UPDATE messages SET reaction_count = MAX(reaction_count - 1, 0) WHERE id = ? RETURNING reaction_count",
			)
			.bind(id.to_string())
			.fetch_optional(pool)
			.await
			.context("remove reaction (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"UPDATE messages SET reaction_count = GREATEST(reaction_count - 1, 0) WHERE id = $1 RETURNING reaction_count",
			)
			.bind(id.to_string())
			.fetch_optional(pool)
			.await
			.context("remove reaction (postgres)")?,
		};
		row.map(|(c,)| c).ok_or_else(|| anyhow!("message {id} not found"))
	}

	async fn mark_message_answered(&self, id: MessageId) -> anyhow::Result<()> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE messages SET answered = 1 WHERE id = ?")
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("mark message answered (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE messages SET answered = TRUE WHERE id = $1")
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("mark message answered (postgres)")?
				.rows_affected(),
		};

		if affected == 0 {
			return Err(anyhow!("message {id} not found"));
		}
		Ok(())
	}
}
