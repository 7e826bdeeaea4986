use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{MemoryMessage, MessageMetadata, NewMessage};
use crate::{MemoryError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY,
    thread_id  TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at REAL NOT NULL,
    metadata   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_thread_time ON messages(thread_id, created_at);

CREATE TABLE IF NOT EXISTS threads (
    id         TEXT PRIMARY KEY,
    suffix     TEXT NOT NULL,
    parent_id  TEXT,
    kind       TEXT NOT NULL,
    status     TEXT NOT NULL,
    label      TEXT,
    depth      INTEGER NOT NULL DEFAULT 0,
    created_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS chronicle (
    id            TEXT PRIMARY KEY,
    start_time    REAL NOT NULL,
    end_time      REAL NOT NULL,
    level         INTEGER NOT NULL,
    message_count INTEGER NOT NULL,
    content       TEXT NOT NULL,
    created_at    REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chronicle_time ON chronicle(start_time);

CREATE TABLE IF NOT EXISTS memopedia (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL UNIQUE,
    category    TEXT NOT NULL,
    summary     TEXT NOT NULL DEFAULT '',
    content     TEXT NOT NULL DEFAULT '',
    keywords    TEXT NOT NULL DEFAULT '[]',
    vividness   TEXT NOT NULL,
    parent_id   TEXT,
    edit_source TEXT,
    updated_at  REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub const DEFAULT_THREAD_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadKind {
    Default,
    Subagent,
    Stelis,
}

impl ThreadKind {
    fn as_str(self) -> &'static str {
        match self {
            ThreadKind::Default => "default",
            ThreadKind::Subagent => "subagent",
            ThreadKind::Stelis => "stelis",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "subagent" => ThreadKind::Subagent,
            "stelis" => ThreadKind::Stelis,
            _ => ThreadKind::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRecord {
    pub id: String,
    pub suffix: String,
    pub parent_id: Option<String>,
    pub kind: ThreadKind,
    pub status: String,
    pub label: Option<String>,
    pub depth: u32,
    pub created_at: f64,
}

/// How much history to pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecentLimit {
    /// Total content characters across returned messages.
    Chars(usize),
    /// Number of messages.
    Count(usize),
}

/// One persona's embedded memory database.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    /// Per-thread volatile open-page set (memopedia). Not persisted.
    open_pages: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path).map_err(MemoryError::Db)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(MemoryError::Db)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO threads (id, suffix, parent_id, kind, status, label, depth, created_at)
             VALUES (?1, ?1, NULL, 'default', 'active', NULL, 0, ?2)",
            params![DEFAULT_THREAD_ID, now_secs()],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('active_thread', ?1)",
            params![DEFAULT_THREAD_ID],
        )?;
        Ok(Self { conn: Mutex::new(conn), open_pages: Mutex::new(HashMap::new()) })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("memory store lock poisoned");
        f(&conn)
    }

    // ── messages ────────────────────────────────────────────────────────────

    /// Append one message to its thread. `created_at` is clamped so the
    /// per-thread sequence never goes backwards.
    pub fn append(&self, new: NewMessage) -> Result<MemoryMessage> {
        self.with_conn(|conn| {
            let thread_id = match &new.thread_suffix {
                Some(suffix) => self
                    .thread_by_suffix_inner(conn, suffix)?
                    .map(|t| t.id)
                    .unwrap_or_else(|| suffix.clone()),
                None => active_thread_inner(conn)?,
            };

            let last: Option<f64> = conn
                .query_row(
                    "SELECT MAX(created_at) FROM messages WHERE thread_id = ?1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let created_at = last.map_or_else(now_secs, |l| now_secs().max(l));

            let message = MemoryMessage {
                id: Uuid::new_v4().simple().to_string(),
                thread_id: thread_id.clone(),
                persona_id: new.persona_id,
                role: new.role,
                content: new.content,
                created_at,
                metadata: new.metadata,
            };
            conn.execute(
                "INSERT INTO messages (id, thread_id, persona_id, role, content, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id,
                    message.thread_id,
                    message.persona_id,
                    message.role,
                    message.content,
                    message.created_at,
                    serde_json::to_string(&message.metadata)?,
                ],
            )?;
            debug!(id = %message.id, thread = %thread_id, role = %message.role, "memory append");
            Ok(message)
        })
    }

    pub fn message(&self, id: &str) -> Result<Option<MemoryMessage>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                 FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(MemoryError::Db)
        })
    }

    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    /// Mark a message as ingested by a persona. Additive; returns false when
    /// the persona was already present.
    pub fn add_ingested_by(&self, message_id: &str, persona_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let Some(mut message) = conn
                .query_row(
                    "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                     FROM messages WHERE id = ?1",
                    params![message_id],
                    row_to_message,
                )
                .optional()?
            else {
                return Err(MemoryError::Invalid(format!("message not found: {message_id}")));
            };
            if !message.metadata.ingested_by.insert(persona_id.to_string()) {
                return Ok(false);
            }
            conn.execute(
                "UPDATE messages SET metadata = ?1 WHERE id = ?2",
                params![serde_json::to_string(&message.metadata)?, message_id],
            )?;
            Ok(true)
        })
    }

    /// Most recent messages in the active thread, oldest first.
    ///
    /// A message passes the filter when its tags intersect `required_tags`
    /// (an empty slice passes everything) or when it belongs to the current
    /// pulse.
    pub fn recent(
        &self,
        limit: RecentLimit,
        required_tags: &[&str],
        pulse_id: Option<&str>,
    ) -> Result<Vec<MemoryMessage>> {
        self.with_conn(|conn| {
            let thread_id = active_thread_inner(conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                 FROM messages WHERE thread_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![thread_id], row_to_message)?;

            let mut picked = Vec::new();
            let mut chars = 0usize;
            for row in rows {
                let message = row?;
                if !passes_filter(&message, required_tags, pulse_id) {
                    continue;
                }
                match limit {
                    RecentLimit::Count(n) => {
                        if picked.len() >= n {
                            break;
                        }
                    }
                    RecentLimit::Chars(budget) => {
                        let len = message.content.chars().count();
                        if chars + len > budget && !picked.is_empty() {
                            break;
                        }
                        chars += len;
                    }
                }
                picked.push(message);
            }
            picked.reverse();
            Ok(picked)
        })
    }

    /// Character-budgeted retrieval distributed across conversation partners:
    /// each participant gets an equal share of the budget so one chatty
    /// neighbor cannot crowd out the rest. Merged oldest-first.
    pub fn recent_balanced(
        &self,
        max_chars: usize,
        participants: &[&str],
        required_tags: &[&str],
        pulse_id: Option<&str>,
    ) -> Result<Vec<MemoryMessage>> {
        if participants.is_empty() {
            return self.recent(RecentLimit::Chars(max_chars), required_tags, pulse_id);
        }
        self.with_conn(|conn| {
            let thread_id = active_thread_inner(conn)?;
            let share = (max_chars / participants.len()).max(1);
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                 FROM messages WHERE thread_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![thread_id], row_to_message)?;

            let mut used: HashMap<&str, usize> = HashMap::new();
            let mut picked = Vec::new();
            for row in rows {
                let message = row?;
                if !passes_filter(&message, required_tags, pulse_id) {
                    continue;
                }
                let Some(participant) = participants
                    .iter()
                    .find(|p| **p == message.persona_id || (**p == "user" && message.role == "user"))
                else {
                    continue;
                };
                let spent = used.entry(*participant).or_insert(0);
                let len = message.content.chars().count();
                if *spent + len > share && *spent > 0 {
                    continue;
                }
                *spent += len;
                picked.push(message);
            }
            picked.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
            Ok(picked)
        })
    }

    /// Everything in the anchor's thread from the anchor message (inclusive)
    /// forward. Empty when the anchor no longer exists.
    pub fn from_anchor(
        &self,
        anchor_id: &str,
        required_tags: &[&str],
        pulse_id: Option<&str>,
    ) -> Result<Vec<MemoryMessage>> {
        self.with_conn(|conn| {
            let anchor: Option<(String, f64)> = conn
                .query_row(
                    "SELECT thread_id, created_at FROM messages WHERE id = ?1",
                    params![anchor_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((thread_id, anchor_time)) = anchor else {
                warn!(anchor_id, "metabolism anchor missing");
                return Ok(Vec::new());
            };

            let mut stmt = conn.prepare(
                "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                 FROM messages WHERE thread_id = ?1 AND created_at >= ?2
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![thread_id, anchor_time], row_to_message)?;
            let mut picked = Vec::new();
            for row in rows {
                let message = row?;
                if passes_filter(&message, required_tags, pulse_id) {
                    picked.push(message);
                }
            }
            Ok(picked)
        })
    }

    /// Messages surrounding `id` in its thread: up to `before` older and
    /// `after` newer, plus the message itself, oldest first.
    pub fn read_around(&self, id: &str, before: usize, after: usize) -> Result<Vec<MemoryMessage>> {
        self.with_conn(|conn| {
            let center: Option<(String, f64)> = conn
                .query_row(
                    "SELECT thread_id, created_at FROM messages WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((thread_id, center_time)) = center else {
                return Ok(Vec::new());
            };

            let mut older: Vec<MemoryMessage> = {
                let mut stmt = conn.prepare(
                    "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                     FROM messages WHERE thread_id = ?1 AND created_at < ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![thread_id, center_time, before as i64], row_to_message)?;
                rows.collect::<std::result::Result<_, _>>()?
            };
            older.reverse();

            let center_and_after: Vec<MemoryMessage> = {
                let mut stmt = conn.prepare(
                    "SELECT id, thread_id, persona_id, role, content, created_at, metadata
                     FROM messages WHERE thread_id = ?1 AND created_at >= ?2
                     ORDER BY created_at ASC, rowid ASC LIMIT ?3",
                )?;
                let rows =
                    stmt.query_map(params![thread_id, center_time, (after + 1) as i64], row_to_message)?;
                rows.collect::<std::result::Result<_, _>>()?
            };

            older.extend(center_and_after);
            Ok(older)
        })
    }

    /// Latest message in the active thread carrying any of the given tags.
    pub fn last_tagged(&self, required_tags: &[&str]) -> Result<Option<MemoryMessage>> {
        let recent = self.recent(RecentLimit::Count(1), required_tags, None)?;
        Ok(recent.into_iter().next())
    }

    // ── wait consolidation ──────────────────────────────────────────────────

    /// Record a wait action. Consecutive waits collapse into one message
    /// tracking the first and latest wait time and the count.
    pub fn record_wait(&self, reason: Option<&str>, now: DateTime<Utc>) -> Result<String> {
        let now_iso = now.to_rfc3339();
        let last = self.last_tagged(&["conversation", "internal"])?;
        let last_wait = last.filter(|m| m.metadata.has_tag("wait"));

        if let Some(prev) = last_wait {
            let wait_started = prev
                .metadata
                .wait_started
                .clone()
                .unwrap_or_else(|| epoch_to_rfc3339(prev.created_at));
            let wait_count = prev.metadata.wait_count.unwrap_or(1) + 1;

            let started_str = format_wait_time(&wait_started);
            let latest_str = format_wait_time(&now_iso);
            let content = match reason {
                Some(reason) => format!(
                    "(待機中: 開始 {started_str}, 最新 {latest_str}, {wait_count}回目 - {reason})"
                ),
                None => {
                    format!("(待機中: 開始 {started_str}, 最新 {latest_str}, {wait_count}回目)")
                }
            };

            if !self.delete_message(&prev.id)? {
                debug!(id = %prev.id, "previous wait message already gone");
            }
            let mut metadata = MessageMetadata::with_tags(["internal", "wait"]);
            metadata.wait_started = Some(wait_started);
            metadata.wait_latest = Some(now_iso);
            metadata.wait_count = Some(wait_count);
            self.append(NewMessage::new("assistant", content).with_metadata(metadata))?;
            Ok(format!("待機継続 ({wait_count}回目)"))
        } else {
            let started_str = format_wait_time(&now_iso);
            let content = match reason {
                Some(reason) => format!("(待機開始: {started_str} - {reason})"),
                None => format!("(待機開始: {started_str})"),
            };
            let mut metadata = MessageMetadata::with_tags(["internal", "wait"]);
            metadata.wait_started = Some(now_iso.clone());
            metadata.wait_latest = Some(now_iso);
            metadata.wait_count = Some(1);
            self.append(NewMessage::new("assistant", content).with_metadata(metadata))?;
            Ok("待機を選択".to_string())
        }
    }

    // ── threads ─────────────────────────────────────────────────────────────

    pub fn active_thread_id(&self) -> Result<String> {
        self.with_conn(|conn| active_thread_inner(conn))
    }

    pub fn set_active_thread(&self, thread_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('active_thread', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![thread_id],
            )?;
            Ok(())
        })
    }

    pub fn thread(&self, id: &str) -> Result<Option<ThreadRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, suffix, parent_id, kind, status, label, depth, created_at
                 FROM threads WHERE id = ?1",
                params![id],
                row_to_thread,
            )
            .optional()
            .map_err(MemoryError::Db)
        })
    }

    pub fn create_thread(
        &self,
        kind: ThreadKind,
        label: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<ThreadRecord> {
        self.with_conn(|conn| {
            let depth = match parent_id {
                Some(pid) => {
                    let parent = conn
                        .query_row(
                            "SELECT depth FROM threads WHERE id = ?1",
                            params![pid],
                            |row| row.get::<_, u32>(0),
                        )
                        .optional()?;
                    parent.map(|d| d + 1).unwrap_or(1)
                }
                None => 0,
            };
            let suffix = format!("{}-{}", kind.as_str(), Uuid::new_v4().simple());
            let record = ThreadRecord {
                id: suffix.clone(),
                suffix,
                parent_id: parent_id.map(str::to_string),
                kind,
                status: "active".to_string(),
                label: label.map(str::to_string),
                depth,
                created_at: now_secs(),
            };
            conn.execute(
                "INSERT INTO threads (id, suffix, parent_id, kind, status, label, depth, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.suffix,
                    record.parent_id,
                    record.kind.as_str(),
                    record.status,
                    record.label,
                    record.depth,
                    record.created_at,
                ],
            )?;
            Ok(record)
        })
    }

    pub fn end_thread(&self, thread_id: &str, status: &str) -> Result<()> {
        self.open_pages.lock().expect("open pages lock poisoned").remove(thread_id);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET status = ?1 WHERE id = ?2",
                params![status, thread_id],
            )?;
            Ok(())
        })
    }

    /// Whether a new stelis thread may start under the currently active
    /// thread without exceeding the depth limit.
    pub fn can_start_stelis(&self, max_depth: u32) -> Result<bool> {
        let active = self.active_thread_id()?;
        let depth = self.thread(&active)?.map(|t| t.depth).unwrap_or(0);
        Ok(depth < max_depth)
    }

    fn thread_by_suffix_inner(&self, conn: &Connection, suffix: &str) -> Result<Option<ThreadRecord>> {
        conn.query_row(
            "SELECT id, suffix, parent_id, kind, status, label, depth, created_at
             FROM threads WHERE suffix = ?1 OR id = ?1",
            params![suffix],
            row_to_thread,
        )
        .optional()
        .map_err(MemoryError::Db)
    }

    // ── working memory ──────────────────────────────────────────────────────

    /// Snapshot of the working-memory blob; an empty object when unset.
    pub fn working_memory(&self) -> Result<serde_json::Value> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'working_memory'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => Ok(serde_json::from_str(&raw)?),
                None => Ok(serde_json::Value::Object(serde_json::Map::new())),
            }
        })
    }

    pub fn set_working_memory(&self, value: &serde_json::Value) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('working_memory', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![serde_json::to_string(value)?],
            )?;
            Ok(())
        })
    }

    // ── open-page bookkeeping (volatile) ────────────────────────────────────

    pub fn open_page(&self, thread_id: &str, page_id: &str) {
        self.open_pages
            .lock()
            .expect("open pages lock poisoned")
            .entry(thread_id.to_string())
            .or_default()
            .insert(page_id.to_string());
    }

    pub fn close_page(&self, thread_id: &str, page_id: &str) {
        if let Some(set) = self
            .open_pages
            .lock()
            .expect("open pages lock poisoned")
            .get_mut(thread_id)
        {
            set.remove(page_id);
        }
    }

    pub fn open_pages(&self, thread_id: &str) -> Vec<String> {
        self.open_pages
            .lock()
            .expect("open pages lock poisoned")
            .get(thread_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn passes_filter(message: &MemoryMessage, required_tags: &[&str], pulse_id: Option<&str>) -> bool {
    if required_tags.is_empty() {
        return true;
    }
    if required_tags.iter().any(|tag| message.metadata.has_tag(tag)) {
        return true;
    }
    if let Some(pulse_id) = pulse_id {
        if message.metadata.pulse_id.as_deref() == Some(pulse_id) {
            return true;
        }
        let pulse_tag = format!("pulse:{pulse_id}");
        if message.metadata.has_tag(&pulse_tag) {
            return true;
        }
    }
    false
}

fn active_thread_inner(conn: &Connection) -> Result<String> {
    let id: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'active_thread'",
        [],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryMessage> {
    let metadata_raw: String = row.get(6)?;
    Ok(MemoryMessage {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        persona_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
    })
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let kind_raw: String = row.get(3)?;
    Ok(ThreadRecord {
        id: row.get(0)?,
        suffix: row.get(1)?,
        parent_id: row.get(2)?,
        kind: ThreadKind::parse(&kind_raw),
        status: row.get(4)?,
        label: row.get(5)?,
        depth: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn epoch_to_rfc3339(secs: f64) -> String {
    DateTime::<Utc>::from_timestamp_micros((secs * 1_000_000.0) as i64)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

fn format_wait_time(iso: &str) -> String {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|_| iso.to_string())
}
