//! Shared world database: usage log, reply log, playbook permissions.
//!
//! One SQLite file per deployment. The UNIQUE constraint on
//! `x_reply_log.tweet_id` is the hard guarantee against double replies;
//! races resolve by constraint violation, not by application logic.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::usage::UsageRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS llm_usage_log (
    ts            REAL NOT NULL,
    persona_id    TEXT,
    building_id   TEXT,
    model_id      TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cached_tokens INTEGER NOT NULL DEFAULT 0,
    cache_write_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd      REAL,
    node_type     TEXT,
    playbook_name TEXT,
    category      TEXT
);
CREATE INDEX IF NOT EXISTS idx_usage_ts ON llm_usage_log(ts);

CREATE TABLE IF NOT EXISTS x_reply_log (
    tweet_id       TEXT NOT NULL UNIQUE,
    persona_id     TEXT NOT NULL,
    reply_tweet_id TEXT,
    created_at     REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS playbook_permissions (
    city_id          TEXT NOT NULL,
    playbook_name    TEXT NOT NULL,
    permission_level TEXT NOT NULL,
    PRIMARY KEY (city_id, playbook_name)
);
";

pub struct WorldDb {
    conn: Mutex<Connection>,
}

impl WorldDb {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn write_usage_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("world db lock poisoned");
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO llm_usage_log
                 (ts, persona_id, building_id, model_id, input_tokens, output_tokens,
                  cached_tokens, cache_write_tokens, cost_usd, node_type, playbook_name, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.ts,
                    record.persona_id,
                    record.building_id,
                    record.model_id,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.cached_tokens as i64,
                    record.cache_write_tokens as i64,
                    if record.cost_usd > 0.0 { Some(record.cost_usd) } else { None },
                    record.node_type,
                    record.playbook_name,
                    record.category,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn usage_row_count(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().expect("world db lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM llm_usage_log", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Insert-first dedup: true when this call claimed the tweet, false when
    /// a reply was already logged.
    pub fn try_record_reply(&self, tweet_id: &str, persona_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().expect("world db lock poisoned");
        let result = conn.execute(
            "INSERT INTO x_reply_log (tweet_id, persona_id, reply_tweet_id, created_at)
             VALUES (?1, ?2, NULL, ?3)",
            params![tweet_id, persona_id, chrono::Utc::now().timestamp() as f64],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_reply_id(&self, tweet_id: &str, reply_tweet_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("world db lock poisoned");
        conn.execute(
            "UPDATE x_reply_log SET reply_tweet_id = ?1 WHERE tweet_id = ?2",
            params![reply_tweet_id, tweet_id],
        )?;
        Ok(())
    }

    pub fn permission_level(&self, city_id: &str, playbook_name: &str) -> Option<String> {
        let conn = self.conn.lock().expect("world db lock poisoned");
        conn.query_row(
            "SELECT permission_level FROM playbook_permissions WHERE city_id = ?1 AND playbook_name = ?2",
            params![city_id, playbook_name],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    pub fn set_permission_level(
        &self,
        city_id: &str,
        playbook_name: &str,
        level: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("world db lock poisoned");
        conn.execute(
            "INSERT INTO playbook_permissions (city_id, playbook_name, permission_level)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(city_id, playbook_name) DO UPDATE SET permission_level = excluded.permission_level",
            params![city_id, playbook_name, level],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_log_enforces_at_most_one_reply() {
        let db = WorldDb::open_in_memory().unwrap();
        assert!(db.try_record_reply("t1", "p1").unwrap());
        assert!(!db.try_record_reply("t1", "p1").unwrap());
        assert!(!db.try_record_reply("t1", "p2").unwrap());
        assert!(db.try_record_reply("t2", "p1").unwrap());
        db.set_reply_id("t1", "r1").unwrap();
    }

    #[test]
    fn permissions_upsert_and_read_back() {
        let db = WorldDb::open_in_memory().unwrap();
        assert!(db.permission_level("city", "weather").is_none());
        db.set_permission_level("city", "weather", "ask_every_time").unwrap();
        assert_eq!(db.permission_level("city", "weather").as_deref(), Some("ask_every_time"));
        db.set_permission_level("city", "weather", "auto_allow").unwrap();
        assert_eq!(db.permission_level("city", "weather").as_deref(), Some("auto_allow"));
    }

    #[test]
    fn usage_batches_commit_atomically() {
        let db = WorldDb::open_in_memory().unwrap();
        let records = vec![UsageRecord::default(), UsageRecord::default()];
        db.write_usage_batch(&records).unwrap();
        assert_eq!(db.usage_row_count().unwrap(), 2);
    }
}
