//! Builtin tools wired against the world: wait recording, building-history
//! ingestion, working memory, memopedia and chronicle access, the playbook
//! listing used by routers, context providers for the builder, and the
//! reply tool with its UNIQUE-log double-reply guard.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use saiverse_memory::{MessageMetadata, NewMessage, PageCategory, PageUpsert};
use saiverse_tools::{Tool, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolSpec, params_schema};

use crate::context::{FLAG_MEMORY_WEAVE, FLAG_VISUAL};
use crate::world::{Persona, World};

/// Register every builtin tool into the world's registry.
pub fn register_builtin_tools(world: &Arc<World>, registry: &ToolRegistry) {
    let weak = Arc::downgrade(world);
    registry.register(Arc::new(RecordWaitTool { world: weak.clone() }));
    registry.register(Arc::new(BuildingMessagesTool { world: weak.clone() }));
    registry.register(Arc::new(UpdateWorkingMemoryTool { world: weak.clone() }));
    registry.register(Arc::new(ListPlaybooksTool { world: weak.clone() }));
    registry.register(Arc::new(MemoryWeaveContextTool { world: weak.clone() }));
    registry.register(Arc::new(VisualContextTool { world: weak.clone() }));
    registry.register(Arc::new(ReplyTweetTool { world: weak.clone() }));
    registry.register(Arc::new(MemopediaNoteTool { world: weak.clone() }));
    registry.register(Arc::new(ChronicleSearchTool { world: weak }));
}

fn world_of(weak: &Weak<World>) -> Result<Arc<World>, ToolError> {
    weak.upgrade().ok_or_else(|| ToolError::Failed("world has shut down".into()))
}

fn persona_of(world: &Arc<World>, ctx: &ToolContext) -> Result<Arc<Persona>, ToolError> {
    let persona_id = ctx
        .active_persona_id()
        .ok_or_else(|| ToolError::Failed("active persona is not set".into()))?;
    world
        .persona(persona_id)
        .ok_or_else(|| ToolError::Failed(format!("persona {persona_id} not found")))
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))
}

// ── record_wait ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct RecordWaitArgs {
    /// Why the persona is waiting.
    #[serde(default)]
    reason: Option<String>,
}

struct RecordWaitTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for RecordWaitTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "record_wait".to_string(),
            description: "何もせず待機する。連続した待機は1件に統合される。".to_string(),
            parameters: params_schema::<RecordWaitArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: RecordWaitArgs = parse_args(args)?;
        let message = persona
            .memory
            .record_wait(args.reason.as_deref(), chrono::Utc::now())
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput::text(message))
    }
}

// ── get_building_messages ────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct BuildingMessagesArgs {
    /// Building to pull from; defaults to the persona's current building.
    #[serde(default)]
    building_id: Option<String>,
}

struct BuildingMessagesTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for BuildingMessagesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_building_messages".to_string(),
            description: "建物内の未取り込み発言を自分の記憶に取り込む。".to_string(),
            parameters: params_schema::<BuildingMessagesArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: BuildingMessagesArgs = parse_args(args)?;
        let building_id = args.building_id.unwrap_or_else(|| persona.current_building());

        let fresh = world.histories.ingest_for(&building_id, &persona.persona_id);
        for utterance in &fresh {
            let mut metadata = MessageMetadata::with_tags(["conversation"]);
            metadata.pulse_id = utterance.pulse_id.clone();
            metadata.heard_by = utterance.heard_by.clone();
            if let Err(err) = persona.memory.append(
                NewMessage::new(utterance.role.clone(), utterance.content.clone())
                    .with_persona(&utterance.persona_id)
                    .with_metadata(metadata),
            ) {
                return Err(ToolError::Failed(format!("memory append failed: {err}")));
            }
        }

        debug!(count = fresh.len(), building_id = %building_id, "ingested building messages");
        let summary = if fresh.is_empty() {
            "(新しい発言はありません)".to_string()
        } else {
            fresh
                .iter()
                .map(|u| format!("{}: {}", u.persona_id, u.content))
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(ToolOutput::pair(json!(summary), json!(fresh.len())))
    }
}

// ── update_working_memory ────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct UpdateWorkingMemoryArgs {
    /// Keys merged into the working-memory snapshot. Null values delete.
    updates: serde_json::Map<String, Value>,
}

struct UpdateWorkingMemoryTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for UpdateWorkingMemoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "update_working_memory".to_string(),
            description: "現在の状況（ワーキングメモリ）を更新する。".to_string(),
            parameters: params_schema::<UpdateWorkingMemoryArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: UpdateWorkingMemoryArgs = parse_args(args)?;

        let mut snapshot = persona
            .memory
            .working_memory()
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        let object = snapshot.as_object_mut().expect("working memory is an object");
        for (key, value) in args.updates {
            if value.is_null() {
                object.remove(&key);
            } else {
                object.insert(key, value);
            }
        }
        persona
            .memory
            .set_working_memory(&snapshot)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput::text("ワーキングメモリを更新しました"))
    }
}

// ── list_available_playbooks ─────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ListPlaybooksArgs {
    #[serde(default)]
    building_id: Option<String>,
}

struct ListPlaybooksTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for ListPlaybooksTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_available_playbooks".to_string(),
            description: "この場所で実行できるPlaybookの一覧をJSONで返す。".to_string(),
            parameters: params_schema::<ListPlaybooksArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: ListPlaybooksArgs = parse_args(args)?;
        let building_id = args.building_id.unwrap_or_else(|| persona.current_building());

        let listed: Vec<Value> = world
            .playbooks
            .router_callable_for(&persona.persona_id, &building_id)
            .into_iter()
            .map(|(name, description)| json!({"name": name, "description": description}))
            .collect();
        Ok(ToolOutput::text(serde_json::to_string(&listed).unwrap_or_else(|_| "[]".to_string())))
    }
}

// ── get_memory_weave_context ─────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct MemoryWeaveArgs {
    #[serde(default)]
    #[allow(dead_code)]
    building_id: Option<String>,
}

struct MemoryWeaveContextTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for MemoryWeaveContextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_memory_weave_context".to_string(),
            description: "ChronicleとMemopediaからコンテキストメッセージを組み立てる。".to_string(),
            parameters: params_schema::<MemoryWeaveArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let _: MemoryWeaveArgs = parse_args(args)?;
        let mut messages: Vec<Value> = Vec::new();

        let chronicles = persona
            .memory
            .chronicles(Some(10))
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        if !chronicles.is_empty() {
            let rendered: String = chronicles
                .iter()
                .rev()
                .map(|entry| {
                    let date = chrono::DateTime::from_timestamp_micros((entry.start_time * 1e6) as i64)
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_default();
                    format!("- [{date}] {}", entry.content)
                })
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(json!({
                "role": "user",
                "content": format!("<system>\n## これまでの記録 (Chronicle)\n{rendered}\n</system>"),
                "metadata": {FLAG_MEMORY_WEAVE: true, "__memory_weave_type__": "chronicle"},
            }));
        }

        let mut pages = Vec::new();
        for category in [PageCategory::People, PageCategory::Terms, PageCategory::Plans] {
            pages.extend(
                persona
                    .memory
                    .pages_in_category(category)
                    .map_err(|e| ToolError::Failed(e.to_string()))?,
            );
        }
        let vivid: Vec<String> = pages
            .iter()
            .filter(|p| p.vividness >= saiverse_memory::Vividness::Rough)
            .map(|p| format!("- {} ({}): {}", p.title, p.category.as_str(), p.summary))
            .collect();
        if !vivid.is_empty() {
            messages.push(json!({
                "role": "user",
                "content": format!("<system>\n## 知識ページ (Memopedia)\n{}\n</system>", vivid.join("\n")),
                "metadata": {FLAG_MEMORY_WEAVE: true, "__memory_weave_type__": "memopedia"},
            }));
        }

        Ok(ToolOutput::value(Value::Array(messages)))
    }
}

// ── get_visual_context ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct VisualContextArgs {
    #[serde(default)]
    building_id: Option<String>,
}

struct VisualContextTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for VisualContextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_visual_context".to_string(),
            description: "現在の建物の内観画像をコンテキストとして返す。".to_string(),
            parameters: params_schema::<VisualContextArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: VisualContextArgs = parse_args(args)?;
        let building_id = args.building_id.unwrap_or_else(|| persona.current_building());

        let Some(building) = world.building(&building_id) else {
            return Ok(ToolOutput::value(json!([])));
        };
        let Some(image_path) = building.image_path else {
            return Ok(ToolOutput::value(json!([])));
        };
        let messages = json!([{
            "role": "user",
            "content": format!("<system>現在の場所「{}」の内観です。</system>", building.name),
            "metadata": {
                FLAG_VISUAL: true,
                "media": [{"type": "image", "path": image_path}],
            },
        }]);
        Ok(ToolOutput::value(messages))
    }
}

// ── x_reply_tweet ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ReplyTweetArgs {
    /// Reply body, at most 280 characters.
    text: String,
    in_reply_to_tweet_id: String,
}

struct ReplyTweetTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for ReplyTweetTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "x_reply_tweet".to_string(),
            description: "X (Twitter) のツイートにリプライする。同じツイートへの二重リプライは防止される。"
                .to_string(),
            parameters: params_schema::<ReplyTweetArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let args: ReplyTweetArgs = parse_args(args)?;
        let persona_id = ctx.active_persona_id().unwrap_or("unknown").to_string();

        if args.text.chars().count() > 280 {
            return Ok(ToolOutput::text(format!(
                "[Xリプライエラー] リプライが280文字を超えています（{}文字）。短くしてください。",
                args.text.chars().count()
            )));
        }

        // Insert-first: the UNIQUE constraint is the race arbiter.
        let claimed = world
            .db
            .try_record_reply(&args.in_reply_to_tweet_id, &persona_id)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        if !claimed {
            return Ok(ToolOutput::text(format!(
                "このツイート(ID: {})には既にリプライ済みです。",
                args.in_reply_to_tweet_id
            )));
        }

        ctx.emit(json!({
            "type": "tweet_confirmation",
            "request_id": uuid::Uuid::new_v4().simple().to_string(),
            "content": args.text,
        }));
        Ok(ToolOutput::text(format!(
            "リプライを送信しました (対象ID: {})",
            args.in_reply_to_tweet_id
        )))
    }
}

// ── memopedia_note ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct MemopediaNoteArgs {
    title: String,
    /// One of: people, terms, plans.
    category: String,
    summary: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

struct MemopediaNoteTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for MemopediaNoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "memopedia_note".to_string(),
            description: "知識ページを作成・更新する。更新されたページは記憶が鮮明になる。".to_string(),
            parameters: params_schema::<MemopediaNoteArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: MemopediaNoteArgs = parse_args(args)?;
        let category = PageCategory::parse(&args.category)
            .ok_or_else(|| ToolError::InvalidArgs(format!("unknown category '{}'", args.category)))?;

        let page = persona
            .memory
            .upsert_page(PageUpsert {
                title: args.title,
                category,
                summary: args.summary,
                content: args.content.unwrap_or_default(),
                keywords: args.keywords,
                parent_id: None,
                edit_source: Some("memopedia_note".to_string()),
            })
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput::text(format!(
            "ページ「{}」を保存しました (鮮明度: {})",
            page.title,
            page.vividness.as_str()
        )))
    }
}

// ── chronicle_search ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct ChronicleSearchArgs {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    5
}

struct ChronicleSearchTool {
    world: Weak<World>,
}

#[async_trait]
impl Tool for ChronicleSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "chronicle_search".to_string(),
            description: "過去の要約 (Chronicle) をキーワードで検索する。".to_string(),
            parameters: params_schema::<ChronicleSearchArgs>(),
        }
    }

    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let world = world_of(&self.world)?;
        let persona = persona_of(&world, ctx)?;
        let args: ChronicleSearchArgs = parse_args(args)?;

        let hits = persona
            .memory
            .search_chronicles(&args.query, args.limit)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        if hits.is_empty() {
            return Ok(ToolOutput::text("該当する記録は見つかりませんでした。"));
        }
        let rendered: Vec<String> = hits
            .iter()
            .map(|entry| {
                let date = chrono::DateTime::from_timestamp_micros((entry.start_time * 1e6) as i64)
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                format!("[{date}] {}", entry.content)
            })
            .collect();
        Ok(ToolOutput::text(rendered.join("\n")))
    }
}
