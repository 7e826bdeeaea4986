//! Context assembly: build the model-ready message array for one call.
//!
//! Ordering: system prompt, memory weave, visual context, conversation
//! history, realtime context (inserted just before the last user message so
//! the model still answers the user), then a token-budget pass that trims
//! history from the oldest end while protecting the anchored sections.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use saiverse_llm::{ChatMessage, ChatRole, estimate_messages_tokens};
use saiverse_memory::{MemoryMessage, RecentLimit};
use saiverse_playbook::{ContextRequirements, ResolvedDepth};
use saiverse_tools::ToolContext;

use crate::events::RuntimeEvent;
use crate::runtime::Runtime;
use crate::world::Persona;

pub const FLAG_MEMORY_WEAVE: &str = "__memory_weave_context__";
pub const FLAG_VISUAL: &str = "__visual_context__";
pub const FLAG_REALTIME: &str = "__realtime_context__";

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

impl Runtime {
    /// Build the base message array for a persona in a building.
    ///
    /// `preview_only` performs the identical build but never persists a
    /// metabolism anchor and never triggers chronicle generation.
    pub async fn build_context(
        &self,
        persona: &Arc<Persona>,
        building_id: &str,
        _user_input: Option<&str>,
        reqs: &ContextRequirements,
        pulse_id: Option<&str>,
        preview_only: bool,
        warnings: &mut Vec<RuntimeEvent>,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        if reqs.system_prompt {
            if let Some(system) = self.system_prompt_for(persona, building_id, reqs) {
                messages.push(ChatMessage::system(system));
            }
        }

        if reqs.memory_weave && persona.chronicle_enabled {
            self.append_tool_context(
                persona,
                building_id,
                "get_memory_weave_context",
                &mut messages,
            )
            .await;
        }

        if reqs.visual_context {
            self.append_tool_context(persona, building_id, "get_visual_context", &mut messages)
                .await;
        }

        let history = self
            .load_history(persona, building_id, reqs, pulse_id, preview_only)
            .await;
        messages.extend(history.iter().map(history_to_chat));

        if reqs.realtime_context {
            if let Some(realtime) = self.realtime_message(persona, &history) {
                insert_before_last_user(&mut messages, realtime);
            }
        }

        self.enforce_token_budget(persona, &mut messages, warnings);
        messages
    }

    fn system_prompt_for(
        &self,
        persona: &Arc<Persona>,
        building_id: &str,
        reqs: &ContextRequirements,
    ) -> Option<String> {
        let mut sections: Vec<String> = Vec::new();
        let building = self.world.building(building_id);

        // 1. Common world-setting prompt, expanded by literal replacement so
        // JSON braces in the template survive.
        if let Some(template) = &persona.common_prompt {
            let building_name = building
                .as_ref()
                .map(|b| b.name.clone())
                .unwrap_or_else(|| building_id.to_string());
            let replacements = [
                ("{current_persona_name}", persona.persona_name.clone()),
                ("{current_persona_id}", persona.persona_id.clone()),
                ("{current_building_name}", building_name),
                ("{current_city_name}", self.world.config.city.city_name.clone()),
                (
                    "{current_persona_system_instruction}",
                    persona.persona_system_instruction.clone(),
                ),
                (
                    "{current_building_system_instruction}",
                    building.as_ref().map(|b| b.system_instruction.clone()).unwrap_or_default(),
                ),
                (
                    "{linked_user_name}",
                    persona
                        .linked_user_name
                        .clone()
                        .unwrap_or_else(|| self.world.config.city.linked_user_name.clone()),
                ),
            ];
            let mut text = template.clone();
            for (placeholder, value) in replacements {
                text = text.replace(placeholder, &value);
            }
            sections.push(text.trim().to_string());
        }

        // 2. About the persona.
        let mut persona_parts: Vec<String> = Vec::new();
        if !persona.persona_system_instruction.is_empty() {
            persona_parts.push(persona.persona_system_instruction.trim().to_string());
        }
        if reqs.inventory {
            let lines: Vec<String> = persona
                .inventory_snapshot()
                .iter()
                .map(|item_id| {
                    let info = self.world.item(item_id).unwrap_or_default();
                    let name = if info.name.is_empty() { "(名前なし)" } else { &info.name };
                    format!("- [{item_id}] {name}")
                })
                .collect();
            if !lines.is_empty() {
                persona_parts.push(format!("### インベントリ\n{}", lines.join("\n")));
            }
        }
        if !persona_parts.is_empty() {
            sections.push(format!("## あなたについて\n{}", persona_parts.join("\n\n")));
        }

        // 3. Current location.
        if let Some(building) = &building {
            let mut building_parts: Vec<String> = Vec::new();
            if !building.system_instruction.is_empty() {
                building_parts.push(building.system_instruction.trim().to_string());
            }
            if reqs.building_items {
                let lines: Vec<String> = building
                    .items
                    .iter()
                    .map(|item_id| {
                        let info = self.world.item(item_id).unwrap_or_default();
                        let name = if info.name.is_empty() { "(名前なし)" } else { &info.name };
                        let desc =
                            if info.description.is_empty() { "(説明なし)" } else { &info.description };
                        format!("- [{item_id}] {name}: {desc}")
                    })
                    .collect();
                if !lines.is_empty() {
                    building_parts.push(format!("### 建物内のアイテム\n{}", lines.join("\n")));
                }
            }
            if !building_parts.is_empty() {
                sections.push(format!(
                    "## {} (ID: {})\n{}",
                    building.name,
                    building.building_id,
                    building_parts.join("\n\n")
                ));
            }
        }

        // 4. Playbooks the router may select.
        if reqs.available_playbooks {
            let listed = self
                .world
                .playbooks
                .router_callable_for(&persona.persona_id, building_id);
            if !listed.is_empty() {
                let entries: Vec<Value> = listed
                    .into_iter()
                    .map(|(name, description)| json!({"name": name, "description": description}))
                    .collect();
                let rendered = serde_json::to_string_pretty(&entries).unwrap_or_default();
                sections.push(format!(
                    "## 利用可能な能力\n以下のPlaybookを実行できます：\n```json\n{rendered}\n```"
                ));
            }
        }

        // 5. Working memory snapshot (copied under the store lock).
        if reqs.working_memory {
            match persona.memory.working_memory() {
                Ok(snapshot) if snapshot.as_object().is_some_and(|o| !o.is_empty()) => {
                    let rendered = serde_json::to_string_pretty(&snapshot).unwrap_or_default();
                    sections.push(format!("## 現在の状況\n```json\n{rendered}\n```"));
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "failed to load working memory"),
            }
        }

        let text = sections
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(SECTION_SEPARATOR);
        (!text.is_empty()).then_some(text)
    }

    /// Invoke a context-provider tool and append the messages it returns.
    async fn append_tool_context(
        &self,
        persona: &Arc<Persona>,
        building_id: &str,
        tool_name: &str,
        messages: &mut Vec<ChatMessage>,
    ) {
        if !self.world.tools.contains(tool_name) {
            return;
        }
        let ctx = ToolContext::for_persona(&persona.persona_id);
        let args = json!({"building_id": building_id});
        match self.world.tools.call(tool_name, args, &ctx, None).await {
            Ok(output) => {
                let added = messages_from_value(output.primary());
                debug!(tool_name, count = added.len(), "context tool contributed messages");
                messages.extend(added);
            }
            Err(err) => {
                debug!(tool_name, error = %err, "context tool failed");
            }
        }
    }

    async fn load_history(
        &self,
        persona: &Arc<Persona>,
        building_id: &str,
        reqs: &ContextRequirements,
        pulse_id: Option<&str>,
        preview_only: bool,
    ) -> Vec<MemoryMessage> {
        let depth = reqs.history_depth.resolve();
        if depth == ResolvedDepth::None {
            return Vec::new();
        }

        let mut required_tags: Vec<&str> = vec!["conversation"];
        if reqs.include_internal {
            required_tags.push("internal");
        }

        let metabolism_enabled = self.world.config.memory.metabolism_enabled;
        let model = persona.model.clone();

        // Anchor-based load under metabolism.
        if depth == ResolvedDepth::Full && metabolism_enabled {
            if let Some(anchor) = persona.anchor_for(&model) {
                match persona.memory.from_anchor(&anchor, &required_tags, pulse_id) {
                    Ok(from_anchor) if !from_anchor.is_empty() => {
                        debug!(anchor = %anchor, count = from_anchor.len(), "anchor-based history load");
                        return from_anchor;
                    }
                    Ok(_) => warn!(anchor = %anchor, "metabolism anchor yielded no messages"),
                    Err(err) => warn!(error = %err, "anchor-based load failed"),
                }
            }
            // No valid anchor: compress what we can, then load the low
            // watermark window and re-anchor on it.
            if !preview_only
                && self.world.config.memory.memory_weave_enabled
                && persona.chronicle_enabled
            {
                if let Err(err) = self.generate_chronicle(persona, None).await {
                    warn!(error = %err, "chronicle generation on anchor expiry failed");
                }
            }
            let low = self.low_watermark(persona);
            let recent = persona
                .memory
                .recent(RecentLimit::Count(low), &required_tags, pulse_id)
                .unwrap_or_default();
            self.maybe_persist_anchor(persona, &model, &recent, preview_only);
            return recent;
        }

        let recent = match depth {
            ResolvedDepth::Full => {
                // Metabolism disabled: count-based when configured, else the
                // persona's character budget.
                let count = self
                    .world
                    .config
                    .memory
                    .max_history_messages_override
                    .or_else(|| {
                        self.world
                            .models
                            .get(&model)
                            .and_then(|c| c.default_max_history_messages)
                    });
                match count {
                    Some(count) => persona
                        .memory
                        .recent(RecentLimit::Count(count), &required_tags, pulse_id)
                        .unwrap_or_default(),
                    None => {
                        let chars = self.world.config.memory.default_history_chars;
                        if reqs.history_balanced {
                            self.balanced_history(persona, building_id, chars, &required_tags, pulse_id)
                        } else {
                            persona
                                .memory
                                .recent(RecentLimit::Chars(chars), &required_tags, pulse_id)
                                .unwrap_or_default()
                        }
                    }
                }
            }
            ResolvedDepth::Messages(count) => persona
                .memory
                .recent(RecentLimit::Count(count), &required_tags, pulse_id)
                .unwrap_or_default(),
            ResolvedDepth::Chars(chars) => {
                if reqs.history_balanced {
                    self.balanced_history(persona, building_id, chars, &required_tags, pulse_id)
                } else {
                    persona
                        .memory
                        .recent(RecentLimit::Chars(chars), &required_tags, pulse_id)
                        .unwrap_or_default()
                }
            }
            ResolvedDepth::None => unreachable!(),
        };

        if metabolism_enabled {
            self.maybe_persist_anchor(persona, &model, &recent, preview_only);
        }
        recent
    }

    fn balanced_history(
        &self,
        persona: &Arc<Persona>,
        building_id: &str,
        chars: usize,
        required_tags: &[&str],
        pulse_id: Option<&str>,
    ) -> Vec<MemoryMessage> {
        // Distribute across the user and every co-present persona but self.
        let mut participants: Vec<String> = vec!["user".to_string()];
        for occupant in self.world.occupants_of(building_id) {
            if occupant != persona.persona_id {
                participants.push(occupant);
            }
        }
        let refs: Vec<&str> = participants.iter().map(String::as_str).collect();
        persona
            .memory
            .recent_balanced(chars, &refs, required_tags, pulse_id)
            .unwrap_or_default()
    }

    /// First count-based load under metabolism pins the anchor to the oldest
    /// retained message (skipped in preview).
    fn maybe_persist_anchor(
        &self,
        persona: &Arc<Persona>,
        model: &str,
        recent: &[MemoryMessage],
        preview_only: bool,
    ) {
        if preview_only || recent.is_empty() {
            return;
        }
        let oldest = &recent[0].id;
        persona.set_anchor(model, oldest);
        debug!(model = %model, anchor = %oldest, "metabolism anchor persisted");
    }

    fn realtime_message(
        &self,
        persona: &Arc<Persona>,
        history: &[MemoryMessage],
    ) -> Option<ChatMessage> {
        const WEEKDAYS: [&str; 7] = ["月", "火", "水", "木", "金", "土", "日"];
        let mut lines: Vec<String> = Vec::new();

        let now = chrono::Utc::now().with_timezone(&persona.timezone);
        let weekday = WEEKDAYS[now.format("%u").to_string().parse::<usize>().unwrap_or(1) - 1];
        lines.push(format!("現在時刻: {}", now.format(&format!("%Y年%m月%d日({weekday}) %H:%M"))));
        lines.push(format!("タイムゾーン: {} (UTC{})", persona.timezone, now.format("%:z")));

        let prev_ai = history
            .iter()
            .rev()
            .find(|m| m.role == "assistant" && m.persona_id == persona.persona_id)
            .or_else(|| history.iter().rev().find(|m| m.role == "assistant"));
        if let Some(prev) = prev_ai {
            if let Some(ts) = chrono::DateTime::from_timestamp_micros((prev.created_at * 1e6) as i64)
            {
                let local = ts.with_timezone(&persona.timezone);
                let weekday =
                    WEEKDAYS[local.format("%u").to_string().parse::<usize>().unwrap_or(1) - 1];
                lines.push(format!(
                    "あなたの前回発言: {}",
                    local.format(&format!("%Y年%m月%d日({weekday}) %H:%M"))
                ));
            }
        }

        let spatial = self.world.spatial_notes(&persona.persona_id);
        if !spatial.is_empty() {
            lines.push(format!("空間情報: {}", spatial.join(" / ")));
        }

        if lines.is_empty() {
            return None;
        }
        let content = format!(
            "<system>\n## リアルタイム情報\n{}\n</system>",
            lines.iter().map(|l| format!("- {l}")).collect::<Vec<_>>().join("\n")
        );
        Some(ChatMessage::user(content).with_flag(FLAG_REALTIME))
    }

    /// CJK-aware token budget pass. Over budget: trim history oldest-first,
    /// keeping the system message, flagged context blocks, and the last user
    /// message; emit `context_auto_trimmed`. Past 85%: warn and continue.
    fn enforce_token_budget(
        &self,
        persona: &Arc<Persona>,
        messages: &mut Vec<ChatMessage>,
        warnings: &mut Vec<RuntimeEvent>,
    ) {
        let Some(config) = self.world.models.get(&persona.model) else { return };
        let provider = config.provider.clone();
        let context_length = config.context_length as u64;

        let mut estimated = estimate_messages_tokens(messages, &provider);
        if estimated <= context_length {
            if estimated as f64 > context_length as f64 * 0.85 {
                warnings.push(RuntimeEvent::warning(
                    "context_approaching_limit",
                    format!(
                        "コンテキスト使用量がモデルの上限に近づいています（推定: {estimated} / {context_length}トークン）。"
                    ),
                ));
            }
            return;
        }

        let last_user_idx = messages
            .iter()
            .rposition(|m| m.role == ChatRole::User && !m.has_flag(FLAG_REALTIME));
        let mut trimmable: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(i, m)| {
                m.role != ChatRole::System
                    && !m.has_flag(FLAG_VISUAL)
                    && !m.has_flag(FLAG_REALTIME)
                    && !m.has_flag(FLAG_MEMORY_WEAVE)
                    && Some(*i) != last_user_idx
            })
            .map(|(i, _)| i)
            .collect();
        let original_count = trimmable.len();

        let mut removed: Vec<usize> = Vec::new();
        while estimated > context_length && !trimmable.is_empty() {
            let idx = trimmable.remove(0);
            estimated -= estimate_messages_tokens(&messages[idx..=idx], &provider);
            removed.push(idx);
        }

        if !removed.is_empty() {
            let mut keep = vec![true; messages.len()];
            for idx in &removed {
                keep[*idx] = false;
            }
            let mut it = keep.iter();
            messages.retain(|_| *it.next().expect("keep mask matches messages"));

            let remaining = original_count - removed.len();
            warn!(
                removed = removed.len(),
                remaining, estimated, context_length, "context auto-trimmed"
            );
            warnings.push(RuntimeEvent::warning(
                "context_auto_trimmed",
                format!(
                    "コンテキスト超過のため、履歴を直近{original_count}件→{remaining}件に自動削減しました（推定: {estimated} / {context_length}トークン）。"
                ),
            ));
        }
    }
}

/// Convert a context-tool result (a JSON array of {role, content, metadata})
/// into chat messages.
fn messages_from_value(value: &Value) -> Vec<ChatMessage> {
    let parsed: Value = match value {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    };
    let Some(items) = parsed.as_array() else { return Vec::new() };
    items
        .iter()
        .filter_map(|item| {
            let content = item.get("content")?.as_str()?.to_string();
            let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
            let mut message = match role {
                "system" => ChatMessage::system(content),
                "assistant" => ChatMessage::assistant(content),
                _ => ChatMessage::user(content),
            };
            if let Some(metadata) = item.get("metadata").and_then(Value::as_object) {
                message.metadata = metadata.clone();
            }
            Some(message)
        })
        .collect()
}

fn history_to_chat(message: &MemoryMessage) -> ChatMessage {
    let mut chat = match message.role.as_str() {
        "assistant" => ChatMessage::assistant(&message.content),
        "system" => ChatMessage::system(&message.content),
        _ => ChatMessage::user(&message.content),
    };
    if let Some(media) = &message.metadata.media {
        chat.metadata.insert("media".to_string(), media.clone());
    }
    chat.metadata
        .insert("created_at".to_string(), json!(message.created_at));
    chat
}

/// Insert the realtime block immediately before the last real user message,
/// so the last thing the model reads is the user's words.
fn insert_before_last_user(messages: &mut Vec<ChatMessage>, realtime: ChatMessage) {
    let last_user = messages
        .iter()
        .rposition(|m| m.role == ChatRole::User && !m.has_flag(FLAG_REALTIME));
    match last_user {
        Some(idx) => messages.insert(idx, realtime),
        None => messages.push(realtime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_block_lands_before_the_last_user_message() {
        let mut messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("latest"),
        ];
        let realtime = ChatMessage::user("now").with_flag(FLAG_REALTIME);
        insert_before_last_user(&mut messages, realtime);

        assert_eq!(messages.len(), 5);
        assert!(messages[3].has_flag(FLAG_REALTIME));
        assert_eq!(messages[4].content_str(), "latest");
    }

    #[test]
    fn realtime_block_appends_when_no_user_message_exists() {
        let mut messages = vec![ChatMessage::system("sys")];
        insert_before_last_user(&mut messages, ChatMessage::user("now").with_flag(FLAG_REALTIME));
        assert!(messages.last().unwrap().has_flag(FLAG_REALTIME));
    }

    #[test]
    fn tool_context_values_parse_in_both_shapes() {
        let as_array = json!([
            {"role": "user", "content": "chronicle", "metadata": {FLAG_MEMORY_WEAVE: true}},
        ]);
        let parsed = messages_from_value(&as_array);
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].has_flag(FLAG_MEMORY_WEAVE));

        let as_string = Value::String(as_array.to_string());
        assert_eq!(messages_from_value(&as_string).len(), 1);

        assert!(messages_from_value(&json!("not json")).is_empty());
    }
}
