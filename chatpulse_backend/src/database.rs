use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::llm_client::ModelEndpoint;
use crate::memory::{decode_embedding, encode_embedding, MemoryEntry};
use crate::scheduler::MAX_WAKE_MINUTES;

/// Sender id used for everything the human user writes or pays.
pub const USER_ID: &str = "user";

pub const DEFAULT_AFFINITY: i64 = 50;
pub const DEFAULT_CHARACTER_WALLET: f64 = 200.0;
pub const DEFAULT_USER_WALLET: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Direct,
    Group,
}

impl RoomKind {
    fn as_db_str(self) -> &'static str {
        match self {
            RoomKind::Direct => "direct",
            RoomKind::Group => "group",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "group" => RoomKind::Group,
            _ => RoomKind::Direct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Character,
    System,
}

impl MessageRole {
    fn as_db_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Character => "character",
            MessageRole::System => "system",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "user" => MessageRole::User,
            "system" => MessageRole::System,
            _ => MessageRole::Character,
        }
    }
}

/// A persona with its relationship state and per-character model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub affinity: i64,
    pub wallet: f64,
    pub pressure_level: i64,
    pub is_blocked: bool,
    /// Minutes.
    pub interval_min: f64,
    pub interval_max: f64,
    pub sys_proactive: bool,
    pub sys_timer: bool,
    pub sys_pressure: bool,
    pub sys_jealousy: bool,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model_name: Option<String>,
    pub max_tokens: u32,
    pub memory_api_url: Option<String>,
    pub memory_api_key: Option<String>,
    pub memory_model_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for Character {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            persona: String::new(),
            affinity: DEFAULT_AFFINITY,
            wallet: DEFAULT_CHARACTER_WALLET,
            pressure_level: 0,
            is_blocked: false,
            interval_min: 10.0,
            interval_max: 120.0,
            sys_proactive: true,
            sys_timer: true,
            sys_pressure: true,
            sys_jealousy: true,
            api_url: None,
            api_key: None,
            model_name: None,
            max_tokens: 800,
            memory_api_url: None,
            memory_api_key: None,
            memory_model_name: None,
            created_at: Utc::now(),
        }
    }
}

impl Character {
    /// Clamps stored ranges so later reads never see an inverted interval
    /// or out-of-range affinity.
    pub fn normalize(&mut self) {
        self.affinity = self.affinity.clamp(0, 100);
        self.wallet = self.wallet.max(0.0);
        self.pressure_level = self.pressure_level.max(0);
        if !self.interval_min.is_finite() || self.interval_min < 0.1 {
            self.interval_min = 0.1;
        }
        if !self.interval_max.is_finite() {
            self.interval_max = self.interval_min;
        }
        if self.interval_max < self.interval_min {
            std::mem::swap(&mut self.interval_min, &mut self.interval_max);
            self.interval_min = self.interval_min.max(0.1);
        }
        if self.max_tokens == 0 {
            self.max_tokens = 800;
        }
    }

    pub fn chat_endpoint(&self, fallback: &ModelEndpoint) -> ModelEndpoint {
        ModelEndpoint {
            api_url: non_empty(&self.api_url).unwrap_or_else(|| fallback.api_url.clone()),
            api_key: non_empty(&self.api_key).or_else(|| fallback.api_key.clone()),
            model: non_empty(&self.model_name).unwrap_or_else(|| fallback.model.clone()),
            max_tokens: self.max_tokens,
        }
    }

    /// The extraction endpoint, falling back to the chat endpoint when unset.
    pub fn memory_endpoint(&self, fallback: &ModelEndpoint) -> ModelEndpoint {
        let chat = self.chat_endpoint(fallback);
        match non_empty(&self.memory_api_url) {
            Some(api_url) => ModelEndpoint {
                api_url,
                api_key: non_empty(&self.memory_api_key),
                model: non_empty(&self.memory_model_name).unwrap_or(chat.model),
                max_tokens: chat.max_tokens,
            },
            None => ModelEndpoint {
                model: non_empty(&self.memory_model_name).unwrap_or(chat.model),
                ..chat
            },
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub room_kind: RoomKind,
    pub room_id: String,
    pub sender_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRoom {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub no_chain: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: String,
    pub wallet: f64,
    pub group_msg_limit: u32,
    pub group_skip_rate: f64,
    pub jealousy_chance: f64,
    pub group_proactive_enabled: bool,
    /// Minutes.
    pub group_interval_min: f64,
    pub group_interval_max: f64,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: "User".to_string(),
            wallet: DEFAULT_USER_WALLET,
            group_msg_limit: 20,
            group_skip_rate: 0.0,
            jealousy_chance: 0.3,
            group_proactive_enabled: false,
            group_interval_min: 3.0,
            group_interval_max: 10.0,
        }
    }
}

impl UserProfile {
    pub fn normalize(&mut self) {
        self.wallet = self.wallet.max(0.0);
        self.group_msg_limit = self.group_msg_limit.clamp(5, 50);
        self.group_skip_rate = clamp_unit(self.group_skip_rate).min(0.5);
        self.jealousy_chance = clamp_unit(self.jealousy_chance);
        if !self.group_interval_min.is_finite() || self.group_interval_min < 0.1 {
            self.group_interval_min = 0.1;
        }
        self.group_interval_min = self.group_interval_min.min(MAX_WAKE_MINUTES);
        if !self.group_interval_max.is_finite() || self.group_interval_max < self.group_interval_min
        {
            self.group_interval_max = self.group_interval_min;
        }
        self.group_interval_max = self.group_interval_max.min(MAX_WAKE_MINUTES);
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentComment {
    pub id: i64,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    pub id: i64,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub likes: Vec<String>,
    pub comments: Vec<MomentComment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub id: i64,
    pub character_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One tenant's SQLite store.
pub struct TenantDatabase {
    conn: Mutex<Connection>,
}

const CHARACTER_COLUMNS: &str = "id, name, persona, affinity, wallet, pressure_level, is_blocked,
     interval_min, interval_max, sys_proactive, sys_timer, sys_pressure, sys_jealousy,
     api_url, api_key, model_name, max_tokens,
     memory_api_url, memory_api_key, memory_model_name, created_at";

const MESSAGE_COLUMNS: &str =
    "id, room_kind, room_id, sender_id, role, content, timestamp, hidden";

impl TenantDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Runs `apply` inside one transaction. Any error rolls everything back.
    pub fn with_transaction<T>(&self, apply: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let value = apply(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock_conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                persona TEXT NOT NULL DEFAULT '',
                affinity INTEGER NOT NULL DEFAULT 50,
                wallet REAL NOT NULL DEFAULT 200,
                pressure_level INTEGER NOT NULL DEFAULT 0,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                interval_min REAL NOT NULL DEFAULT 10,
                interval_max REAL NOT NULL DEFAULT 120,
                sys_proactive INTEGER NOT NULL DEFAULT 1,
                sys_timer INTEGER NOT NULL DEFAULT 1,
                sys_pressure INTEGER NOT NULL DEFAULT 1,
                sys_jealousy INTEGER NOT NULL DEFAULT 1,
                api_url TEXT,
                api_key TEXT,
                model_name TEXT,
                max_tokens INTEGER NOT NULL DEFAULT 800,
                memory_api_url TEXT,
                memory_api_key TEXT,
                memory_model_name TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_kind TEXT NOT NULL,
                room_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_room
                ON messages(room_kind, room_id, timestamp, id);

            CREATE TABLE IF NOT EXISTS group_chats (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                no_chain INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (group_id, member_id)
            );

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                character_id TEXT NOT NULL,
                event TEXT NOT NULL,
                time TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                people TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                embedding BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_character ON memories(character_id);

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                amount REAL NOT NULL,
                note TEXT NOT NULL DEFAULT '',
                claimed INTEGER NOT NULL DEFAULT 0,
                refunded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS red_packets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                count INTEGER NOT NULL,
                total_amount REAL NOT NULL,
                note TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS red_packet_claims (
                packet_id INTEGER NOT NULL REFERENCES red_packets(id) ON DELETE CASCADE,
                claimer_id TEXT NOT NULL,
                amount REAL NOT NULL,
                claimed_at TEXT NOT NULL,
                PRIMARY KEY (packet_id, claimer_id)
            );

            CREATE TABLE IF NOT EXISTS moments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS moment_likes (
                moment_id INTEGER NOT NULL REFERENCES moments(id) ON DELETE CASCADE,
                author_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (moment_id, author_id)
            );

            CREATE TABLE IF NOT EXISTS moment_comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                moment_id INTEGER NOT NULL REFERENCES moments(id) ON DELETE CASCADE,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS diaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_profile (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                name TEXT NOT NULL,
                wallet REAL NOT NULL,
                group_msg_limit INTEGER NOT NULL,
                group_skip_rate REAL NOT NULL,
                jealousy_chance REAL NOT NULL,
                group_proactive_enabled INTEGER NOT NULL,
                group_interval_min REAL NOT NULL,
                group_interval_max REAL NOT NULL
            );"#,
        )?;

        let defaults = UserProfile::default();
        conn.execute(
            "INSERT OR IGNORE INTO user_profile
             (id, name, wallet, group_msg_limit, group_skip_rate, jealousy_chance,
              group_proactive_enabled, group_interval_min, group_interval_max)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                defaults.name,
                defaults.wallet,
                defaults.group_msg_limit,
                defaults.group_skip_rate,
                defaults.jealousy_chance,
                defaults.group_proactive_enabled,
                defaults.group_interval_min,
                defaults.group_interval_max,
            ],
        )?;

        Ok(())
    }

    // ---- characters ----

    pub fn upsert_character(&self, character: &Character) -> Result<Character> {
        let mut character = character.clone();
        character.normalize();
        if character.id.trim().is_empty() {
            character.id = uuid::Uuid::new_v4().to_string();
        }

        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO characters ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                CHARACTER_COLUMNS
            ),
            params![
                character.id,
                character.name,
                character.persona,
                character.affinity,
                character.wallet,
                character.pressure_level,
                character.is_blocked,
                character.interval_min,
                character.interval_max,
                character.sys_proactive,
                character.sys_timer,
                character.sys_pressure,
                character.sys_jealousy,
                character.api_url,
                character.api_key,
                character.model_name,
                character.max_tokens,
                character.memory_api_url,
                character.memory_api_key,
                character.memory_model_name,
                character.created_at.to_rfc3339(),
            ],
        )?;
        Ok(character)
    }

    pub fn get_character(&self, id: &str) -> Result<Option<Character>> {
        let conn = self.lock_conn()?;
        load_character(&conn, id)
    }

    pub fn list_characters(&self) -> Result<Vec<Character>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM characters ORDER BY created_at ASC, id ASC",
            CHARACTER_COLUMNS
        ))?;
        let characters = stmt
            .query_map([], row_to_character)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(characters)
    }

    /// Returns false when the character does not exist.
    pub fn set_character_blocked(&self, id: &str, blocked: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE characters SET is_blocked = ?2 WHERE id = ?1",
            params![id, blocked],
        )?;
        Ok(changed > 0)
    }

    /// Clears the block and restarts the relationship at `affinity`.
    pub fn unblock_character(&self, id: &str, affinity: i64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE characters SET is_blocked = 0, affinity = ?2 WHERE id = ?1",
            params![id, affinity.clamp(0, 100)],
        )?;
        Ok(changed > 0)
    }

    pub fn increment_pressure(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE characters SET pressure_level = pressure_level + 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Deletes a character together with its direct chat, memories, diaries,
    /// moments and group memberships.
    pub fn delete_character(&self, id: &str) -> Result<bool> {
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM messages WHERE (room_kind = 'direct' AND room_id = ?1) OR sender_id = ?1",
                [id],
            )?;
            tx.execute("DELETE FROM memories WHERE character_id = ?1", [id])?;
            tx.execute("DELETE FROM diaries WHERE character_id = ?1", [id])?;
            tx.execute("DELETE FROM moments WHERE author_id = ?1", [id])?;
            tx.execute("DELETE FROM moment_likes WHERE author_id = ?1", [id])?;
            tx.execute("DELETE FROM moment_comments WHERE author_id = ?1", [id])?;
            tx.execute("DELETE FROM group_members WHERE member_id = ?1", [id])?;
            let removed = tx.execute("DELETE FROM characters WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }

    // ---- messages ----

    pub fn add_message(
        &self,
        room_kind: RoomKind,
        room_id: &str,
        sender_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage> {
        let conn = self.lock_conn()?;
        insert_message(&conn, room_kind, room_id, sender_id, role, content)
    }

    /// Most recent `limit` messages of a room in chronological order.
    pub fn recent_messages(
        &self,
        room_kind: RoomKind,
        room_id: &str,
        limit: usize,
        include_hidden: bool,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE room_kind = ?1 AND room_id = ?2 AND (?3 OR hidden = 0)
             ORDER BY timestamp DESC, id DESC
             LIMIT ?4",
            MESSAGE_COLUMNS
        ))?;
        let mut messages = stmt
            .query_map(
                params![room_kind.as_db_str(), room_id, include_hidden, limit as i64],
                row_to_message,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn set_message_hidden(&self, id: i64, hidden: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE messages SET hidden = ?2 WHERE id = ?1",
            params![id, hidden],
        )?;
        Ok(changed > 0)
    }

    /// Timestamp of the last message the user sent in a room.
    pub fn last_user_message_at(&self, room_kind: RoomKind, room_id: &str) -> Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT MAX(timestamp) FROM messages
                 WHERE room_kind = ?1 AND room_id = ?2 AND sender_id = ?3",
                params![room_kind.as_db_str(), room_id, USER_ID],
                |row| row.get::<_, Option<i64>>(0),
            )?;
        Ok(value)
    }

    /// Whether the last visible message in a direct room came from the character.
    pub fn awaiting_user_reply(&self, character_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let sender = conn
            .query_row(
                "SELECT sender_id FROM messages
                 WHERE room_kind = 'direct' AND room_id = ?1 AND hidden = 0
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                [character_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(sender.map(|s| s == character_id).unwrap_or(false))
    }

    // ---- groups ----

    pub fn create_group(&self, name: &str, members: &[String]) -> Result<GroupRoom> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO group_chats (id, name, no_chain, created_at) VALUES (?1, ?2, 0, ?3)",
                params![id, name, now.to_rfc3339()],
            )?;
            for (position, member) in members.iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_id, member_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![id, member, position as i64],
                )?;
            }
            Ok(())
        })?;
        self.get_group(&id)?
            .ok_or_else(|| anyhow::anyhow!("group {} vanished after insert", id))
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupRoom>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, no_chain, created_at FROM group_chats WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, no_chain, created_at)) = row else {
            return Ok(None);
        };
        let members = load_group_members(&conn, &id)?;
        Ok(Some(GroupRoom {
            id,
            name,
            members,
            no_chain,
            created_at,
        }))
    }

    pub fn list_groups(&self) -> Result<Vec<GroupRoom>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, no_chain, created_at FROM group_chats ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, no_chain, created_at)| {
                let members = load_group_members(&conn, &id)?;
                Ok(GroupRoom {
                    id,
                    name,
                    members,
                    no_chain,
                    created_at,
                })
            })
            .collect()
    }

    pub fn set_group_no_chain(&self, id: &str, no_chain: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE group_chats SET no_chain = ?2 WHERE id = ?1",
            params![id, no_chain],
        )?;
        Ok(changed > 0)
    }

    /// Latest direct-message timestamp per character, used by the jealousy window.
    pub fn last_direct_activity(&self) -> Result<HashMap<String, i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT room_id, MAX(timestamp) FROM messages
             WHERE room_kind = 'direct' AND sender_id = ?1
             GROUP BY room_id",
        )?;
        let rows = stmt
            .query_map([USER_ID], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    // ---- user profile ----

    pub fn get_profile(&self) -> Result<UserProfile> {
        let conn = self.lock_conn()?;
        load_profile(&conn)
    }

    pub fn update_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        let mut profile = profile.clone();
        profile.normalize();
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE user_profile SET name = ?1, wallet = ?2, group_msg_limit = ?3,
                 group_skip_rate = ?4, jealousy_chance = ?5, group_proactive_enabled = ?6,
                 group_interval_min = ?7, group_interval_max = ?8
             WHERE id = 1",
            params![
                profile.name,
                profile.wallet,
                profile.group_msg_limit,
                profile.group_skip_rate,
                profile.jealousy_chance,
                profile.group_proactive_enabled,
                profile.group_interval_min,
                profile.group_interval_max,
            ],
        )?;
        Ok(profile)
    }

    // ---- memories ----

    pub fn insert_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO memories (id, character_id, event, time, location, people, created_at, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.character_id,
                entry.event,
                entry.time,
                entry.location,
                entry.people,
                entry.created_at.to_rfc3339(),
                encode_embedding(&entry.embedding),
            ],
        )?;
        Ok(())
    }

    pub fn list_memories(&self, character_id: &str) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, character_id, event, time, location, people, created_at, embedding
             FROM memories WHERE character_id = ?1 ORDER BY created_at DESC",
        )?;
        let entries = stmt
            .query_map([character_id], |row| {
                Ok(MemoryEntry {
                    id: row.get(0)?,
                    character_id: row.get(1)?,
                    event: row.get(2)?,
                    time: row.get(3)?,
                    location: row.get(4)?,
                    people: row.get(5)?,
                    created_at: parse_rfc3339(row.get::<_, String>(6)?, 6)?,
                    embedding: decode_embedding(&row.get::<_, Vec<u8>>(7)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        Ok(conn.execute("DELETE FROM memories WHERE id = ?1", [id])? > 0)
    }

    // ---- moments & diaries ----

    pub fn list_moments(&self, limit: usize) -> Result<Vec<Moment>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, author_id, content, created_at FROM moments
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let moments = stmt
            .query_map([limit as i64], |row| {
                Ok(Moment {
                    id: row.get(0)?,
                    author_id: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                    likes: Vec::new(),
                    comments: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut likes_stmt = conn.prepare(
            "SELECT author_id FROM moment_likes WHERE moment_id = ?1 ORDER BY created_at ASC",
        )?;
        let mut comments_stmt = conn.prepare(
            "SELECT id, author_id, content, created_at FROM moment_comments
             WHERE moment_id = ?1 ORDER BY id ASC",
        )?;

        moments
            .into_iter()
            .map(|mut moment| {
                moment.likes = likes_stmt
                    .query_map([moment.id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                moment.comments = comments_stmt
                    .query_map([moment.id], |row| {
                        Ok(MomentComment {
                            id: row.get(0)?,
                            author_id: row.get(1)?,
                            content: row.get(2)?,
                            created_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(moment)
            })
            .collect()
    }

    pub fn list_diaries(&self, character_id: &str) -> Result<Vec<DiaryEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, character_id, content, created_at FROM diaries
             WHERE character_id = ?1 ORDER BY id DESC",
        )?;
        let entries = stmt
            .query_map([character_id], |row| {
                Ok(DiaryEntry {
                    id: row.get(0)?,
                    character_id: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ---- connection-level helpers shared with transactional callers ----

pub(crate) fn load_character(conn: &Connection, id: &str) -> Result<Option<Character>> {
    let character = conn
        .query_row(
            &format!("SELECT {} FROM characters WHERE id = ?1", CHARACTER_COLUMNS),
            [id],
            row_to_character,
        )
        .optional()?;
    Ok(character)
}

pub(crate) fn load_profile(conn: &Connection) -> Result<UserProfile> {
    let profile = conn.query_row(
        "SELECT name, wallet, group_msg_limit, group_skip_rate, jealousy_chance,
                group_proactive_enabled, group_interval_min, group_interval_max
         FROM user_profile WHERE id = 1",
        [],
        |row| {
            Ok(UserProfile {
                name: row.get(0)?,
                wallet: row.get(1)?,
                group_msg_limit: row.get(2)?,
                group_skip_rate: row.get(3)?,
                jealousy_chance: row.get(4)?,
                group_proactive_enabled: row.get(5)?,
                group_interval_min: row.get(6)?,
                group_interval_max: row.get(7)?,
            })
        },
    )?;
    Ok(profile)
}

pub(crate) fn insert_message(
    conn: &Connection,
    room_kind: RoomKind,
    room_id: &str,
    sender_id: &str,
    role: MessageRole,
    content: &str,
) -> Result<StoredMessage> {
    let timestamp = now_millis();
    conn.execute(
        "INSERT INTO messages (room_kind, room_id, sender_id, role, content, timestamp, hidden)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            room_kind.as_db_str(),
            room_id,
            sender_id,
            role.as_db_str(),
            content,
            timestamp
        ],
    )?;
    Ok(StoredMessage {
        id: conn.last_insert_rowid(),
        room_kind,
        room_id: room_id.to_string(),
        sender_id: sender_id.to_string(),
        role,
        content: content.to_string(),
        timestamp,
        hidden: false,
    })
}

/// Applies a delta and returns the clamped affinity, or None for unknown ids.
pub(crate) fn adjust_affinity(conn: &Connection, character_id: &str, delta: i64) -> Result<Option<i64>> {
    conn.execute(
        "UPDATE characters SET affinity = MIN(100, MAX(0, affinity + ?2)) WHERE id = ?1",
        params![character_id, delta],
    )?;
    let value = conn
        .query_row(
            "SELECT affinity FROM characters WHERE id = ?1",
            [character_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn set_pressure(conn: &Connection, character_id: &str, level: i64) -> Result<()> {
    conn.execute(
        "UPDATE characters SET pressure_level = ?2 WHERE id = ?1",
        params![character_id, level.max(0)],
    )?;
    Ok(())
}

pub(crate) fn insert_moment(conn: &Connection, author_id: &str, content: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO moments (author_id, content, created_at) VALUES (?1, ?2, ?3)",
        params![author_id, content, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn moment_exists(conn: &Connection, moment_id: i64) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM moments WHERE id = ?1", [moment_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Returns false when the author already liked the moment.
pub(crate) fn insert_moment_like(conn: &Connection, moment_id: i64, author_id: &str) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO moment_likes (moment_id, author_id, created_at) VALUES (?1, ?2, ?3)",
        params![moment_id, author_id, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted > 0)
}

pub(crate) fn insert_moment_comment(
    conn: &Connection,
    moment_id: i64,
    author_id: &str,
    content: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO moment_comments (moment_id, author_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![moment_id, author_id, content, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_diary(conn: &Connection, character_id: &str, content: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO diaries (character_id, content, created_at) VALUES (?1, ?2, ?3)",
        params![character_id, content, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load_group_members(conn: &Connection, group_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT member_id FROM group_members WHERE group_id = ?1 ORDER BY position ASC",
    )?;
    let members = stmt
        .query_map([group_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

fn row_to_character(row: &Row<'_>) -> rusqlite::Result<Character> {
    Ok(Character {
        id: row.get(0)?,
        name: row.get(1)?,
        persona: row.get(2)?,
        affinity: row.get(3)?,
        wallet: row.get(4)?,
        pressure_level: row.get(5)?,
        is_blocked: row.get(6)?,
        interval_min: row.get(7)?,
        interval_max: row.get(8)?,
        sys_proactive: row.get(9)?,
        sys_timer: row.get(10)?,
        sys_pressure: row.get(11)?,
        sys_jealousy: row.get(12)?,
        api_url: row.get(13)?,
        api_key: row.get(14)?,
        model_name: row.get(15)?,
        max_tokens: row.get(16)?,
        memory_api_url: row.get(17)?,
        memory_api_key: row.get(18)?,
        memory_model_name: row.get(19)?,
        created_at: parse_rfc3339(row.get::<_, String>(20)?, 20)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        room_kind: RoomKind::from_db(&row.get::<_, String>(1)?),
        room_id: row.get(2)?,
        sender_id: row.get(3)?,
        role: MessageRole::from_db(&row.get::<_, String>(4)?),
        content: row.get(5)?,
        timestamp: row.get(6)?,
        hidden: row.get(7)?,
    })
}

pub(crate) fn parse_rfc3339(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("chatpulse_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[test]
    fn character_normalization_fixes_ranges() {
        let db = TenantDatabase::in_memory().expect("db init");
        let stored = db
            .upsert_character(&Character {
                id: "mika".to_string(),
                name: "Mika".to_string(),
                affinity: 140,
                interval_min: 30.0,
                interval_max: 5.0,
                ..Character::default()
            })
            .expect("upsert");

        assert_eq!(stored.affinity, 100);
        assert_eq!(stored.interval_min, 5.0);
        assert_eq!(stored.interval_max, 30.0);

        let loaded = db.get_character("mika").expect("load").expect("exists");
        assert_eq!(loaded.interval_min, 5.0);
        assert_eq!(loaded.name, "Mika");
    }

    #[test]
    fn hidden_messages_are_filtered_from_context() {
        let path = temp_db_path("hidden_messages");
        let db = TenantDatabase::new(&path).expect("db init");

        let first = db
            .add_message(RoomKind::Direct, "mika", USER_ID, MessageRole::User, "hello")
            .expect("insert");
        db.add_message(RoomKind::Direct, "mika", "mika", MessageRole::Character, "hi!")
            .expect("insert");
        db.set_message_hidden(first.id, true).expect("hide");

        let visible = db
            .recent_messages(RoomKind::Direct, "mika", 10, false)
            .expect("visible");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "hi!");

        let all = db
            .recent_messages(RoomKind::Direct, "mika", 10, true)
            .expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "hello");
        assert!(db.awaiting_user_reply("mika").expect("awaiting"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn deleting_a_character_cascades() {
        let db = TenantDatabase::in_memory().expect("db init");
        db.upsert_character(&Character {
            id: "ren".to_string(),
            name: "Ren".to_string(),
            ..Character::default()
        })
        .expect("upsert");
        let group = db
            .create_group("Friends", &["ren".to_string()])
            .expect("group");
        db.add_message(RoomKind::Direct, "ren", USER_ID, MessageRole::User, "yo")
            .expect("insert");
        db.add_message(RoomKind::Group, &group.id, "ren", MessageRole::Character, "hey all")
            .expect("insert");
        db.with_transaction(|tx| {
            insert_diary(tx, "ren", "dear diary")?;
            insert_moment(tx, "ren", "sunset")?;
            Ok(())
        })
        .expect("seed");

        assert!(db.delete_character("ren").expect("delete"));
        assert!(db.get_character("ren").expect("load").is_none());
        assert!(db
            .recent_messages(RoomKind::Direct, "ren", 10, true)
            .expect("direct")
            .is_empty());
        assert!(db
            .recent_messages(RoomKind::Group, &group.id, 10, true)
            .expect("group")
            .is_empty());
        assert!(db.list_diaries("ren").expect("diaries").is_empty());
        assert!(db.list_moments(10).expect("moments").is_empty());
        assert!(db
            .get_group(&group.id)
            .expect("group")
            .expect("exists")
            .members
            .is_empty());
    }

    #[test]
    fn profile_updates_are_clamped() {
        let db = TenantDatabase::in_memory().expect("db init");
        let defaults = db.get_profile().expect("profile");
        assert_eq!(defaults.group_msg_limit, 20);
        assert_eq!(defaults.jealousy_chance, 0.3);

        let updated = db
            .update_profile(&UserProfile {
                group_msg_limit: 400,
                group_skip_rate: 0.9,
                group_interval_min: 12.0,
                group_interval_max: 4.0,
                ..defaults
            })
            .expect("update");
        assert_eq!(updated.group_msg_limit, 50);
        assert_eq!(updated.group_skip_rate, 0.5);
        assert_eq!(updated.group_interval_max, 12.0);
        assert_eq!(db.get_profile().expect("reload"), updated);
    }

    #[test]
    fn huge_group_intervals_are_capped() {
        let db = TenantDatabase::in_memory().expect("db init");
        let defaults = db.get_profile().expect("profile");
        let updated = db
            .update_profile(&UserProfile {
                group_interval_min: 1e18,
                group_interval_max: f64::INFINITY,
                ..defaults
            })
            .expect("update");
        assert_eq!(updated.group_interval_min, MAX_WAKE_MINUTES);
        assert_eq!(updated.group_interval_max, MAX_WAKE_MINUTES);
    }

    #[test]
    fn endpoints_fall_back_to_defaults() {
        let fallback = ModelEndpoint {
            api_url: "http://llm".to_string(),
            api_key: Some("k".to_string()),
            model: "base".to_string(),
            max_tokens: 800,
        };
        let character = Character {
            model_name: Some("  ".to_string()),
            memory_model_name: Some("tiny".to_string()),
            max_tokens: 300,
            ..Character::default()
        };

        let chat = character.chat_endpoint(&fallback);
        assert_eq!(chat.model, "base");
        assert_eq!(chat.max_tokens, 300);

        let memory = character.memory_endpoint(&fallback);
        assert_eq!(memory.api_url, "http://llm");
        assert_eq!(memory.model, "tiny");
    }
}
