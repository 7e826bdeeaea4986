//! The runtime core: playbook entry semantics, memory/history emitters,
//! chronicle generation, subagent threads, and metabolism.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use saiverse_llm::{GenerateOptions, LlmUsage};
use saiverse_memory::{MemoryMessage, MessageMetadata, NewMessage, RecentLimit, ThreadKind};
use saiverse_playbook::PlaybookSchema;

use crate::RuntimeError;
use crate::cancellation::CancellationToken;
use crate::events::{EventCallback, RuntimeEvent, emit};
use crate::graph;
use crate::state::ExecState;
use crate::usage::UsageRecord;
use crate::world::{ExecutionState, Persona, World};

pub struct Runtime {
    pub world: Arc<World>,
}

/// Environment one graph execution runs in.
pub struct NodeEnv {
    pub persona: Arc<Persona>,
    pub building_id: String,
    pub playbook: Arc<PlaybookSchema>,
    pub auto_mode: bool,
    pub event_callback: Option<EventCallback>,
}

impl Runtime {
    pub fn new(world: Arc<World>) -> Arc<Self> {
        Arc::new(Self { world })
    }

    pub fn streaming_enabled(&self) -> bool {
        self.world.config.runtime.streaming_enabled()
    }

    // ── meta entrypoints ────────────────────────────────────────────────────

    /// Handle a user (or schedule) stimulus: record the input, run the meta
    /// playbook, then let metabolism catch up. Returns the spoken strings.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_meta_user(
        self: &Arc<Self>,
        persona: Arc<Persona>,
        user_input: Option<&str>,
        building_id: &str,
        meta_playbook: Option<&str>,
        playbook_params: Option<Map<String, Value>>,
        event_callback: Option<EventCallback>,
        token: CancellationToken,
        pulse_type: Option<&str>,
        pulse_id: &str,
    ) -> Result<Vec<String>, RuntimeError> {
        if let Some(input) = user_input.filter(|s| !s.is_empty()) {
            self.record_user_input(&persona, building_id, input, pulse_id);
        }

        let playbook = self.choose_playbook(meta_playbook, "meta_user", &persona, building_id);
        let mut root = ExecState::default();
        root.set("pulse_id", json!(pulse_id));
        if let Some(params) = playbook_params {
            for (key, value) in params {
                root.vars.insert(key, value);
            }
        }

        let outputs = self
            .run_playbook(
                playbook,
                Arc::clone(&persona),
                building_id,
                user_input,
                false,
                Some(&mut root),
                event_callback.clone(),
                token,
                pulse_type,
                None,
            )
            .await?;

        self.maybe_run_metabolism(&persona, event_callback).await;
        Ok(outputs)
    }

    /// Handle an autonomous tick. No direct user output.
    pub async fn run_meta_auto(
        self: &Arc<Self>,
        persona: Arc<Persona>,
        building_id: &str,
        event_callback: Option<EventCallback>,
        token: CancellationToken,
        pulse_id: &str,
    ) -> Result<(), RuntimeError> {
        let playbook = self.choose_playbook(None, "meta_auto", &persona, building_id);
        let mut root = ExecState::default();
        root.set("pulse_id", json!(pulse_id));
        self.run_playbook(
            playbook,
            Arc::clone(&persona),
            building_id,
            None,
            true,
            Some(&mut root),
            event_callback.clone(),
            token,
            Some("auto"),
            None,
        )
        .await?;
        self.maybe_run_metabolism(&persona, event_callback).await;
        Ok(())
    }

    fn choose_playbook(
        &self,
        requested: Option<&str>,
        default_name: &str,
        persona: &Arc<Persona>,
        building_id: &str,
    ) -> Arc<PlaybookSchema> {
        for name in [requested, Some(default_name), Some("basic_chat")].into_iter().flatten() {
            if let Some(playbook) = self.world.playbooks.load_for(name, &persona.persona_id, building_id) {
                return playbook;
            }
        }
        Arc::new(saiverse_playbook::basic_chat())
    }

    fn record_user_input(&self, persona: &Arc<Persona>, building_id: &str, input: &str, pulse_id: &str) {
        let occupants: BTreeSet<String> =
            self.world.occupants_of(building_id).into_iter().collect();
        self.world
            .histories
            .append(building_id, "user", "user", input, Some(pulse_id), occupants.clone());

        let mut metadata = MessageMetadata::with_tags(["conversation"]);
        metadata.pulse_id = Some(pulse_id.to_string());
        metadata.with_ids = occupants;
        if let Err(err) = persona.memory.append(
            NewMessage::new("user", input)
                .with_persona("user")
                .with_metadata(metadata),
        ) {
            warn!(error = %err, "failed to record user input");
        }
    }

    // ── core runner ─────────────────────────────────────────────────────────

    /// Run one playbook against a fresh state derived from its caller.
    ///
    /// The parent contributes the pulse id, the playbook chain, the shared
    /// usage accumulator and activity trace, and the values that resolve the
    /// playbook's input parameters. On success, every `output_schema` key is
    /// copied back into the parent (dicts also land as flattened dot keys).
    #[allow(clippy::too_many_arguments)]
    pub async fn run_playbook(
        self: &Arc<Self>,
        playbook: Arc<PlaybookSchema>,
        persona: Arc<Persona>,
        building_id: &str,
        user_input: Option<&str>,
        auto_mode: bool,
        mut parent: Option<&mut ExecState>,
        event_callback: Option<EventCallback>,
        token: CancellationToken,
        pulse_type: Option<&str>,
        initial_params: Option<Map<String, Value>>,
    ) -> Result<Vec<String>, RuntimeError> {
        token.check()?;

        if let (Some(parent_state), Some(params)) = (parent.as_deref_mut(), initial_params) {
            for (key, value) in params {
                parent_state.vars.insert(key, value);
            }
        }

        let pulse_id = parent
            .as_deref()
            .map(|p| p.pulse_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| {
                parent
                    .as_deref()
                    .and_then(|p| p.get("pulse_id").map(crate::state::value_to_display))
                    .filter(|id| !id.is_empty())
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let parent_chain = parent.as_deref().map(|p| p.playbook_chain.clone()).unwrap_or_default();
        let chain = if parent_chain.is_empty() {
            playbook.name.clone()
        } else {
            format!("{parent_chain} > {}", playbook.name)
        };

        let wrapped_callback: Option<EventCallback> = event_callback.clone().map(|inner| {
            let chain = chain.clone();
            Arc::new(move |mut event: RuntimeEvent| {
                if let RuntimeEvent::Status { node, content, playbook_chain, .. } = &mut event {
                    *content = format!("{chain} / {node}");
                    *playbook_chain = Some(chain.clone());
                }
                inner(event);
            }) as EventCallback
        });

        let mut state = ExecState {
            pulse_id: pulse_id.clone(),
            pulse_type: pulse_type.map(str::to_string),
            playbook_chain: chain.clone(),
            token: token.clone(),
            ..ExecState::default()
        };
        if let Some(parent_state) = parent.as_deref() {
            state.usage = Arc::clone(&parent_state.usage);
            state.activity = Arc::clone(&parent_state.activity);
        }

        // Input parameter resolution: source key first, parent value by
        // parameter name as the fallback.
        for param in &playbook.input_schema {
            let source = param.source.as_deref().unwrap_or("input");
            let mut value: Value = if source == "input" {
                json!(user_input.unwrap_or(""))
            } else if let Some(path) = source.strip_prefix("parent.") {
                parent
                    .as_deref()
                    .and_then(|p| p.get(path).cloned())
                    .unwrap_or_else(|| json!(""))
            } else {
                parent
                    .as_deref()
                    .and_then(|p| p.vars.get(source).cloned())
                    .unwrap_or_else(|| json!(""))
            };
            if value_is_empty(&value) {
                if let Some(fallback) = parent.as_deref().and_then(|p| p.vars.get(&param.name)) {
                    if !value_is_empty(fallback) {
                        value = fallback.clone();
                    }
                }
            }
            state.set(param.name.clone(), value);
        }

        state.set("input", json!(user_input.unwrap_or("")));
        state.set_last(user_input.unwrap_or(""));
        state.set("persona_id", json!(persona.persona_id));
        state.set("persona_name", json!(persona.persona_name));
        state.set("pulse_id", json!(pulse_id));
        if let Some(pulse_type) = pulse_type {
            state.set("pulse_type", json!(pulse_type));
        }

        let mut context_warnings = Vec::new();
        let requirements = playbook.effective_requirements();
        state.messages = self
            .build_context(
                &persona,
                building_id,
                user_input,
                &requirements,
                Some(&pulse_id),
                false,
                &mut context_warnings,
            )
            .await;
        for warning in context_warnings {
            emit(&wrapped_callback, warning);
        }

        persona.set_execution_state(ExecutionState::running(&playbook.name, &playbook.start_node));
        info!(playbook = %playbook.name, pulse_id = %pulse_id, chain = %chain, "playbook started");

        let env = NodeEnv {
            persona: Arc::clone(&persona),
            building_id: building_id.to_string(),
            playbook: Arc::clone(&playbook),
            auto_mode,
            event_callback: wrapped_callback,
        };
        let result = graph::run(self, &env, &mut state).await;
        persona.set_execution_state(ExecutionState::idle());

        match result {
            Ok(()) => {
                if let Some(parent_state) = parent.as_deref_mut() {
                    for key in &playbook.output_schema {
                        if let Some(value) = state.vars.get(key).cloned() {
                            parent_state.set_structured(key, value);
                            debug!(key = %key, "propagated output to parent state");
                        }
                    }
                    if let Some(chronicle) = &state.subagent_chronicle {
                        parent_state.subagent_chronicle = Some(chronicle.clone());
                    }
                }
                Ok(state.outputs)
            }
            Err(err) => {
                if !matches!(err, RuntimeError::Cancelled(_)) {
                    error!(playbook = %playbook.name, error = %err, "playbook execution failed");
                }
                Err(err)
            }
        }
    }

    // ── emitters ────────────────────────────────────────────────────────────

    /// Speak into a building: append to the building history and the
    /// persona's own memory with the given metadata.
    pub fn emit_say(
        &self,
        persona: &Arc<Persona>,
        building_id: &str,
        text: &str,
        pulse_id: &str,
        metadata: Option<Value>,
    ) {
        let occupants: BTreeSet<String> = self
            .world
            .occupants_of(building_id)
            .into_iter()
            .filter(|id| id != &persona.persona_id)
            .chain(std::iter::once("user".to_string()))
            .collect();
        self.world.histories.append(
            building_id,
            &persona.persona_id,
            "assistant",
            text,
            Some(pulse_id),
            occupants,
        );

        if !self.store_memory(persona, text, "assistant", &["conversation"], Some(pulse_id), metadata)
        {
            warn!(persona_id = %persona.persona_id, "failed to store spoken message");
        }
    }

    /// Append one message to persona memory. Returns false on failure (the
    /// caller emits a `memorize_failed` warning; execution continues).
    pub fn store_memory(
        &self,
        persona: &Arc<Persona>,
        content: &str,
        role: &str,
        tags: &[&str],
        pulse_id: Option<&str>,
        extra_metadata: Option<Value>,
    ) -> bool {
        let mut metadata_value = extra_metadata.unwrap_or_else(|| json!({}));
        if !metadata_value.is_object() {
            metadata_value = json!({});
        }
        let object = metadata_value.as_object_mut().expect("checked object");
        object.insert("tags".to_string(), json!(tags));
        if let Some(pulse_id) = pulse_id {
            object.insert("pulse_id".to_string(), json!(pulse_id));
        }
        let metadata: MessageMetadata = match serde_json::from_value(metadata_value) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %err, "unserializable message metadata, storing bare tags");
                MessageMetadata::with_tags(tags.iter().copied())
            }
        };

        match persona.memory.append(
            NewMessage::new(role, content)
                .with_persona(&persona.persona_id)
                .with_metadata(metadata),
        ) {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, persona_id = %persona.persona_id, "memory write failed");
                false
            }
        }
    }

    /// Record one LLM call: usage log row, pulse accumulator, and the
    /// `llm_usage` metadata block for outgoing messages.
    pub fn record_llm_usage(
        &self,
        usage: &LlmUsage,
        persona: &Arc<Persona>,
        building_id: &str,
        node_type: &str,
        playbook_name: &str,
        category: &str,
        state: Option<&ExecState>,
    ) -> Value {
        let cost = self.world.models.cost_for(
            &usage.model,
            usage.input_tokens,
            usage.output_tokens,
            usage.cached_tokens,
            usage.cache_write_tokens,
            &usage.cache_ttl,
        );
        self.world.usage.record(UsageRecord {
            ts: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            persona_id: Some(persona.persona_id.clone()),
            building_id: Some(building_id.to_string()),
            model_id: usage.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_tokens: usage.cached_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            cost_usd: cost,
            node_type: Some(node_type.to_string()),
            playbook_name: Some(playbook_name.to_string()),
            category: Some(category.to_string()),
        });
        if let Some(state) = state {
            state.usage.lock().expect("usage lock poisoned").accumulate(
                &usage.model,
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_tokens,
                usage.cache_write_tokens,
                cost,
            );
        }

        let display_name = self
            .world
            .models
            .get(&usage.model)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| usage.model.clone());
        json!({
            "model": usage.model,
            "model_display_name": display_name,
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cached_tokens": usage.cached_tokens,
            "cache_write_tokens": usage.cache_write_tokens,
            "cost_usd": cost,
        })
    }

    // ── chronicle & metabolism ──────────────────────────────────────────────

    /// Summarize the persona's recent conversation window into a level-1
    /// chronicle entry using the lightweight model tier.
    pub async fn generate_chronicle(
        &self,
        persona: &Arc<Persona>,
        event_callback: Option<&EventCallback>,
    ) -> anyhow::Result<Option<String>> {
        let window = persona
            .memory
            .recent(RecentLimit::Count(50), &["conversation"], None)?;
        if window.is_empty() {
            return Ok(None);
        }

        let content = self.summarize_window(persona, &window, None).await?;
        let entry = persona.memory.add_chronicle(
            window.first().map(|m| m.created_at).unwrap_or(0.0),
            window.last().map(|m| m.created_at).unwrap_or(0.0),
            1,
            window.len() as u32,
            &content,
        )?;
        info!(persona_id = %persona.persona_id, chronicle_id = %entry.id, "chronicle generated");
        if let Some(callback) = event_callback {
            callback(RuntimeEvent::Metabolism {
                status: "chronicle".to_string(),
                content: "会話の要約をChronicleに記録しました".to_string(),
                evicted: None,
                kept: None,
            });
        }
        Ok(Some(content))
    }

    async fn summarize_window(
        &self,
        persona: &Arc<Persona>,
        window: &[MemoryMessage],
        prompt_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let transcript: String = window
            .iter()
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();
        let prompt = prompt_override.unwrap_or(
            "以下の会話ログを、出来事と決定事項を中心に日本語で簡潔に要約してください。",
        );
        let client = persona.client_for(Some("lightweight"));
        let messages = vec![saiverse_llm::ChatMessage::user(format!("{prompt}\n\n{transcript}"))];
        let options = GenerateOptions {
            temperature: self.world.config.runtime.temperature,
            ..GenerateOptions::default()
        };
        let outcome = client
            .generate(&messages, &[], &options)
            .await
            .map_err(|e| anyhow::anyhow!("chronicle summarization failed: {e}"))?;
        if let Some(usage) = client.consume_usage() {
            self.record_llm_usage(
                &usage,
                persona,
                &persona.current_building(),
                "chronicle",
                "",
                "memory_weave_generate",
                None,
            );
        }
        Ok(outcome.text().to_string())
    }

    /// After a pulse: when the anchored window has outgrown the high
    /// watermark, compress into a chronicle and advance the anchor to keep
    /// the low watermark.
    pub async fn maybe_run_metabolism(
        &self,
        persona: &Arc<Persona>,
        event_callback: Option<EventCallback>,
    ) {
        if !self.world.config.memory.metabolism_enabled {
            return;
        }
        let Some(anchor) = persona.anchor_for(&persona.model) else { return };
        let Some(high) = self.high_watermark(persona) else { return };

        let current = persona
            .memory
            .from_anchor(&anchor, &["conversation"], None)
            .unwrap_or_default();
        if current.len() <= high {
            return;
        }
        let low = self.low_watermark(persona);
        if high.saturating_sub(low) < 20 {
            return;
        }

        let evict = current.len() - low;
        info!(
            persona_id = %persona.persona_id,
            window = current.len(),
            high,
            low,
            "metabolism triggered"
        );
        emit(
            &event_callback,
            RuntimeEvent::Metabolism {
                status: "started".to_string(),
                content: format!("記憶を整理しています（{}件 → {low}件）...", current.len()),
                evicted: None,
                kept: None,
            },
        );

        if self.world.config.memory.memory_weave_enabled && persona.chronicle_enabled {
            if let Err(err) = self.generate_chronicle(persona, event_callback.as_ref()).await {
                warn!(error = %err, "chronicle generation during metabolism failed");
            }
        }

        if let Some(new_anchor) = current.get(evict).map(|m| m.id.clone()) {
            persona.set_anchor(&persona.model, &new_anchor);
            debug!(anchor = %new_anchor, evicted = evict, kept = low, "metabolism anchor advanced");
        }
        emit(
            &event_callback,
            RuntimeEvent::Metabolism {
                status: "completed".to_string(),
                content: format!("記憶の整理が完了しました（{evict}件の会話をChronicleに圧縮）"),
                evicted: Some(evict),
                kept: Some(low),
            },
        );
    }

    pub(crate) fn low_watermark(&self, persona: &Arc<Persona>) -> usize {
        self.world
            .models
            .get(&persona.model)
            .and_then(|c| c.metabolism_keep_messages)
            .unwrap_or(20)
    }

    fn high_watermark(&self, persona: &Arc<Persona>) -> Option<usize> {
        self.world
            .models
            .get(&persona.model)
            .and_then(|c| c.metabolism_trigger_messages)
    }

    // ── subagent threads ────────────────────────────────────────────────────

    /// Open a subagent sub-thread and make it active. Returns
    /// (thread_id, parent_thread_id), or None when the store refuses.
    pub fn start_subagent_thread(
        &self,
        persona: &Arc<Persona>,
        label: &str,
    ) -> Option<(String, String)> {
        let parent = persona.memory.active_thread_id().ok()?;
        let thread = persona
            .memory
            .create_thread(ThreadKind::Subagent, Some(label), Some(&parent))
            .ok()?;
        persona.memory.set_active_thread(&thread.id).ok()?;
        debug!(thread_id = %thread.id, parent = %parent, "subagent thread opened");
        Some((thread.id, parent))
    }

    /// Close a subagent thread, optionally summarizing it into a chronicle
    /// string, and reactivate the parent thread.
    pub async fn end_subagent_thread(
        &self,
        persona: &Arc<Persona>,
        thread_id: &str,
        parent_thread_id: &str,
        generate_chronicle: bool,
    ) -> Option<String> {
        let chronicle = if generate_chronicle {
            let window = persona
                .memory
                .recent(RecentLimit::Count(100), &[], None)
                .unwrap_or_default();
            if window.is_empty() {
                None
            } else {
                match self.summarize_window(persona, &window, None).await {
                    Ok(summary) => Some(summary),
                    Err(err) => {
                        warn!(error = %err, "subagent chronicle generation failed");
                        None
                    }
                }
            }
        } else {
            None
        };

        if let Err(err) = persona.memory.end_thread(thread_id, "completed") {
            warn!(error = %err, thread_id, "failed to end subagent thread");
        }
        if let Err(err) = persona.memory.set_active_thread(parent_thread_id) {
            warn!(error = %err, "failed to reactivate parent thread");
        }
        chronicle
    }
}

fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
