//! Chronicle: time-ranged summaries of compressed conversation.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::MemoryStore;
use crate::{MemoryError, Result};

/// A dated summary of one consecutive message range. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChronicleEntry {
    pub id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub level: u32,
    pub message_count: u32,
    pub content: String,
}

impl MemoryStore {
    pub fn add_chronicle(
        &self,
        start_time: f64,
        end_time: f64,
        level: u32,
        message_count: u32,
        content: impl Into<String>,
    ) -> Result<ChronicleEntry> {
        if end_time < start_time {
            return Err(MemoryError::Invalid("chronicle range ends before it starts".into()));
        }
        let entry = ChronicleEntry {
            id: Uuid::new_v4().simple().to_string(),
            start_time,
            end_time,
            level,
            message_count,
            content: content.into(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chronicle (id, start_time, end_time, level, message_count, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id,
                    entry.start_time,
                    entry.end_time,
                    entry.level,
                    entry.message_count,
                    entry.content,
                    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
                ],
            )?;
            Ok(())
        })?;
        Ok(entry)
    }

    /// Entries ordered newest range first, optionally capped.
    pub fn chronicles(&self, limit: Option<usize>) -> Result<Vec<ChronicleEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, start_time, end_time, level, message_count, content
                 FROM chronicle ORDER BY start_time DESC LIMIT ?1",
            )?;
            let cap = limit.map(|n| n as i64).unwrap_or(-1);
            let rows = stmt.query_map(params![cap], row_to_entry)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(MemoryError::Db)
        })
    }

    pub fn chronicle_by_id(&self, id: &str) -> Result<Option<ChronicleEntry>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, start_time, end_time, level, message_count, content
                 FROM chronicle WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()
            .map_err(MemoryError::Db)
        })
    }

    /// Keyword search across entry contents, newest first.
    pub fn search_chronicles(&self, query: &str, limit: usize) -> Result<Vec<ChronicleEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, start_time, end_time, level, message_count, content
                 FROM chronicle WHERE content LIKE ?1 ORDER BY start_time DESC LIMIT ?2",
            )?;
            let pattern = format!("%{}%", query.replace('%', "\\%"));
            let rows = stmt.query_map(params![pattern, limit as i64], row_to_entry)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(MemoryError::Db)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChronicleEntry> {
    Ok(ChronicleEntry {
        id: row.get(0)?,
        start_time: row.get(1)?,
        end_time: row.get(2)?,
        level: row.get(3)?,
        message_count: row.get(4)?,
        content: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::MemoryStore;

    #[test]
    fn entries_list_newest_range_first() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.add_chronicle(100.0, 200.0, 1, 10, "morning walk").unwrap();
        store.add_chronicle(300.0, 400.0, 1, 20, "afternoon visit").unwrap();

        let all = store.chronicles(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "afternoon visit");

        let capped = store.chronicles(Some(1)).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn invalid_range_is_rejected() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.add_chronicle(200.0, 100.0, 1, 5, "backwards").is_err());
    }

    #[test]
    fn search_matches_content() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.add_chronicle(1.0, 2.0, 1, 3, "met the librarian about old maps").unwrap();
        store.add_chronicle(3.0, 4.0, 1, 3, "quiet day").unwrap();

        let hits = store.search_chronicles("librarian", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("maps"));
        assert!(store.search_chronicles("nothing", 10).unwrap().is_empty());
    }
}
