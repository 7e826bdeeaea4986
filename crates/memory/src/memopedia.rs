//! Memopedia: the persona's knowledge-page store.
//!
//! Pages are keyed by title within a persona. Updating an existing page
//! promotes its vividness one step; pages fade separately (vividness down)
//! through maintenance paths outside this crate.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::MemoryStore;
use crate::{MemoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageCategory {
    People,
    Terms,
    Plans,
}

impl PageCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PageCategory::People => "people",
            PageCategory::Terms => "terms",
            PageCategory::Plans => "plans",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "people" => Some(PageCategory::People),
            "terms" => Some(PageCategory::Terms),
            "plans" => Some(PageCategory::Plans),
            _ => None,
        }
    }
}

/// How sharply the persona remembers a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vividness {
    Buried,
    Faint,
    Rough,
    Vivid,
}

impl Vividness {
    pub fn as_str(self) -> &'static str {
        match self {
            Vividness::Buried => "buried",
            Vividness::Faint => "faint",
            Vividness::Rough => "rough",
            Vividness::Vivid => "vivid",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "buried" => Vividness::Buried,
            "faint" => Vividness::Faint,
            "rough" => Vividness::Rough,
            _ => Vividness::Vivid,
        }
    }

    /// One step sharper; saturates at `Vivid`.
    pub fn promoted(self) -> Self {
        match self {
            Vividness::Buried => Vividness::Faint,
            Vividness::Faint => Vividness::Rough,
            Vividness::Rough | Vividness::Vivid => Vividness::Vivid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemopediaPage {
    pub id: String,
    pub title: String,
    pub category: PageCategory,
    pub summary: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub vividness: Vividness,
    pub parent_id: Option<String>,
    pub edit_source: Option<String>,
    pub updated_at: f64,
}

/// Fields for creating or updating a page.
#[derive(Debug, Clone)]
pub struct PageUpsert {
    pub title: String,
    pub category: PageCategory,
    pub summary: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub parent_id: Option<String>,
    pub edit_source: Option<String>,
}

impl MemoryStore {
    /// Create a page, or update it by title. An update promotes vividness.
    pub fn upsert_page(&self, upsert: PageUpsert) -> Result<MemopediaPage> {
        if upsert.title.trim().is_empty() {
            return Err(MemoryError::Invalid("memopedia page needs a title".into()));
        }
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        self.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, vividness FROM memopedia WHERE title = ?1",
                    params![upsert.title],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            let (id, vividness) = match existing {
                Some((id, vividness_raw)) => (id, Vividness::parse(&vividness_raw).promoted()),
                None => (Uuid::new_v4().simple().to_string(), Vividness::Vivid),
            };

            let page = MemopediaPage {
                id: id.clone(),
                title: upsert.title,
                category: upsert.category,
                summary: upsert.summary,
                content: upsert.content,
                keywords: upsert.keywords,
                vividness,
                parent_id: upsert.parent_id,
                edit_source: upsert.edit_source,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO memopedia (id, title, category, summary, content, keywords, vividness, parent_id, edit_source, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(title) DO UPDATE SET
                     category = excluded.category,
                     summary = excluded.summary,
                     content = excluded.content,
                     keywords = excluded.keywords,
                     vividness = excluded.vividness,
                     parent_id = excluded.parent_id,
                     edit_source = excluded.edit_source,
                     updated_at = excluded.updated_at",
                params![
                    page.id,
                    page.title,
                    page.category.as_str(),
                    page.summary,
                    page.content,
                    serde_json::to_string(&page.keywords)?,
                    page.vividness.as_str(),
                    page.parent_id,
                    page.edit_source,
                    page.updated_at,
                ],
            )?;
            Ok(page)
        })
    }

    pub fn page_by_title(&self, title: &str) -> Result<Option<MemopediaPage>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, title, category, summary, content, keywords, vividness, parent_id, edit_source, updated_at
                 FROM memopedia WHERE title = ?1",
                params![title],
                row_to_page,
            )
            .optional()
            .map_err(MemoryError::Db)
        })
    }

    pub fn pages_in_category(&self, category: PageCategory) -> Result<Vec<MemopediaPage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, category, summary, content, keywords, vividness, parent_id, edit_source, updated_at
                 FROM memopedia WHERE category = ?1 ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map(params![category.as_str()], row_to_page)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(MemoryError::Db)
        })
    }

    /// Keyword/title search, most recently updated first.
    pub fn search_pages(&self, query: &str, limit: usize) -> Result<Vec<MemopediaPage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, category, summary, content, keywords, vividness, parent_id, edit_source, updated_at
                 FROM memopedia
                 WHERE title LIKE ?1 OR summary LIKE ?1 OR keywords LIKE ?1
                 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let pattern = format!("%{query}%");
            let rows = stmt.query_map(params![pattern, limit as i64], row_to_page)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(MemoryError::Db)
        })
    }
}

fn row_to_page(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemopediaPage> {
    let category_raw: String = row.get(2)?;
    let keywords_raw: String = row.get(5)?;
    let vividness_raw: String = row.get(6)?;
    Ok(MemopediaPage {
        id: row.get(0)?,
        title: row.get(1)?,
        category: PageCategory::parse(&category_raw).unwrap_or(PageCategory::Terms),
        summary: row.get(3)?,
        content: row.get(4)?,
        keywords: serde_json::from_str(&keywords_raw).unwrap_or_default(),
        vividness: Vividness::parse(&vividness_raw),
        parent_id: row.get(7)?,
        edit_source: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
