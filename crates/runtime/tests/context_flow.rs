//! Context builder scenarios: budget trimming, anchors, preview mode.

use saiverse_config::AppConfig;
use saiverse_llm::{ChatRole, estimate_messages_tokens};
use saiverse_memory::{MessageMetadata, NewMessage};
use saiverse_playbook::ContextRequirements;
use saiverse_runtime::test_support;
use saiverse_runtime::{Runtime, RuntimeEvent};

fn conversation(content: String) -> NewMessage {
    NewMessage::new("user", content)
        .with_persona("user")
        .with_metadata(MessageMetadata::with_tags(["conversation"]))
}

#[tokio::test]
async fn over_budget_context_is_trimmed_preserving_anchored_sections() {
    let mut config = AppConfig::default();
    // Count-based load so all 200 long messages are candidates.
    config.memory.max_history_messages_override = Some(250);
    let world = test_support::world_with_config(config);
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    // 200 messages of ~400 CJK chars each (≈600 tokens apiece), then a
    // short user message. Model context length is 32k tokens.
    for i in 0..200 {
        persona
            .memory
            .append(conversation(format!("{i}番目の長い話。{}", "語".repeat(392))))
            .unwrap();
    }
    persona.memory.append(conversation("最新の質問です。".to_string())).unwrap();

    let mut warnings = Vec::new();
    let reqs = ContextRequirements::default();
    let messages = runtime
        .build_context(&persona, "cafe", None, &reqs, Some("pulse-ctx"), false, &mut warnings)
        .await;

    // The trim warning fired.
    assert!(
        warnings.iter().any(|w| matches!(
            w,
            RuntimeEvent::Warning { warning_code, .. } if warning_code == "context_auto_trimmed"
        )),
        "expected context_auto_trimmed warning, got {warnings:?}"
    );

    // Within budget after trimming.
    let estimate = estimate_messages_tokens(&messages, "ollama");
    assert!(estimate <= 32_000, "estimate {estimate} still over budget");

    // System prompt, realtime block, and the last user message all survive.
    assert_eq!(messages.first().unwrap().role, ChatRole::System);
    assert!(messages.iter().any(|m| m.has_flag("__realtime_context__")));
    let last_user = messages
        .iter()
        .filter(|m| m.role == ChatRole::User && !m.has_flag("__realtime_context__"))
        .next_back()
        .unwrap();
    assert_eq!(last_user.content_str(), "最新の質問です。");

    // And the oldest history went first.
    assert!(!messages.iter().any(|m| m.content_str().starts_with("0番目")));
}

#[tokio::test]
async fn realtime_block_sits_before_the_last_user_message() {
    let world = test_support::world();
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    persona.memory.append(conversation("前の話".to_string())).unwrap();
    persona
        .memory
        .append(
            NewMessage::new("assistant", "そうですね")
                .with_persona("p1")
                .with_metadata(MessageMetadata::with_tags(["conversation"])),
        )
        .unwrap();
    persona.memory.append(conversation("今の話".to_string())).unwrap();

    let mut warnings = Vec::new();
    let reqs = ContextRequirements::default();
    let messages = runtime
        .build_context(&persona, "cafe", None, &reqs, None, false, &mut warnings)
        .await;

    let realtime_idx = messages
        .iter()
        .position(|m| m.has_flag("__realtime_context__"))
        .expect("realtime block present");
    assert_eq!(messages[realtime_idx + 1].content_str(), "今の話");
    assert!(messages[realtime_idx].content_str().contains("現在時刻"));
    assert!(
        messages[realtime_idx].content_str().contains("あなたの前回発言"),
        "previous AI utterance line present"
    );
}

#[tokio::test]
async fn metabolism_persists_an_anchor_and_reuses_it() {
    let mut config = AppConfig::default();
    config.memory.metabolism_enabled = true;
    let world = test_support::world_with_config(config);
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    let mut ids = Vec::new();
    for i in 0..30 {
        ids.push(persona.memory.append(conversation(format!("話 {i}"))).unwrap().id);
    }

    // First full-depth load in metabolism mode: low-watermark window (20)
    // and the anchor pinned to its oldest message.
    let mut warnings = Vec::new();
    let reqs = ContextRequirements::default();
    let messages = runtime
        .build_context(&persona, "cafe", None, &reqs, None, false, &mut warnings)
        .await;
    let anchor = persona.anchor_for(test_support::TEST_MODEL).expect("anchor persisted");
    assert_eq!(anchor, ids[10], "anchor is the oldest retained message");
    let history_count = messages
        .iter()
        .filter(|m| m.content_str().starts_with("話 "))
        .count();
    assert_eq!(history_count, 20);

    // Later messages extend the anchored window; the anchor stays put.
    for i in 30..35 {
        persona.memory.append(conversation(format!("話 {i}"))).unwrap();
    }
    let mut warnings = Vec::new();
    let messages = runtime
        .build_context(&persona, "cafe", None, &reqs, None, false, &mut warnings)
        .await;
    let history_count = messages
        .iter()
        .filter(|m| m.content_str().starts_with("話 "))
        .count();
    assert_eq!(history_count, 25, "anchor-based load grows with new messages");
    assert_eq!(persona.anchor_for(test_support::TEST_MODEL).unwrap(), ids[10]);
}

#[tokio::test]
async fn preview_mode_never_persists_the_anchor() {
    let mut config = AppConfig::default();
    config.memory.metabolism_enabled = true;
    let world = test_support::world_with_config(config);
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    for i in 0..5 {
        persona.memory.append(conversation(format!("話 {i}"))).unwrap();
    }

    let mut warnings = Vec::new();
    let reqs = ContextRequirements::default();
    let _ = runtime
        .build_context(&persona, "cafe", None, &reqs, None, true, &mut warnings)
        .await;
    assert!(persona.anchor_for(test_support::TEST_MODEL).is_none());
}

#[tokio::test]
async fn history_depth_none_skips_history() {
    let world = test_support::world();
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    persona.memory.append(conversation("覚えている話".to_string())).unwrap();

    let mut warnings = Vec::new();
    let mut reqs = ContextRequirements::none();
    reqs.system_prompt = true;
    let messages = runtime
        .build_context(&persona, "cafe", None, &reqs, None, false, &mut warnings)
        .await;

    assert!(messages.iter().all(|m| !m.content_str().contains("覚えている話")));
    assert_eq!(messages.first().unwrap().role, ChatRole::System);
}
