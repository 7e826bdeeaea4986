//! End-to-end playbook execution against scripted LLM clients.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use saiverse_llm::StreamChunk;
use saiverse_llm::testing::ScriptedResponse;
use saiverse_memory::RecentLimit;
use saiverse_playbook::{ConditionalNext, NodeDef, NodeType, PlaybookSchema, basic_chat};
use saiverse_runtime::cancellation::CancellationToken;
use saiverse_runtime::permissions::PermissionDecision;
use saiverse_runtime::test_support;
use saiverse_runtime::{EventCallback, Runtime, RuntimeError, RuntimeEvent};
use saiverse_tools::{Tool, ToolContext, ToolError, ToolOutput, ToolSpec};

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "echo_tool".to_string(),
            description: "Echo the query".to_string(),
            parameters: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        }
    }

    async fn run(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        Ok(ToolOutput::text(format!("echo: {query}")))
    }
}

fn named(base: PlaybookSchema, name: &str) -> PlaybookSchema {
    let mut playbook = base;
    playbook.name = name.to_string();
    playbook
}

#[tokio::test]
async fn basic_chat_speaks_and_remembers() {
    let world = test_support::world();
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    client.push(ScriptedResponse::text("いらっしゃいませ。").with_usage(120, 8));

    let outputs = runtime
        .run_meta_user(
            persona.clone(),
            Some("こんにちは"),
            "cafe",
            None,
            None,
            None,
            CancellationToken::new(),
            Some("user"),
            "pulse-1",
        )
        .await
        .unwrap();

    assert_eq!(outputs, vec!["いらっしゃいませ。".to_string()]);

    // The user input and the reply both landed in memory with the pulse id.
    let recent = persona
        .memory
        .recent(RecentLimit::Count(10), &["conversation"], None)
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].role, "user");
    assert_eq!(recent[1].role, "assistant");
    assert_eq!(recent[1].metadata.pulse_id.as_deref(), Some("pulse-1"));

    // The building heard both utterances.
    assert_eq!(world.histories.len("cafe"), 2);

    // Exactly one usage row for one LLM call.
    assert_eq!(world.db.usage_row_count().unwrap(), 1);

    // Execution state returned to idle.
    assert_eq!(persona.execution_state().status, "idle");
}

#[tokio::test]
async fn tool_call_round_trip_pairs_the_tool_message() {
    let world = test_support::world();
    world.tools.register(Arc::new(EchoTool));
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    // draft (may call tools) -> run_tool -> draft2 -> speak
    let mut playbook = PlaybookSchema::default();
    playbook.name = "tool_chat".to_string();
    playbook.description = "Chat with tool access".to_string();
    playbook.start_node = "draft".to_string();
    playbook.nodes = vec![
        {
            let mut node = NodeDef::new("draft", NodeType::Llm);
            node.available_tools = Some(vec!["echo_tool".to_string()]);
            node.conditional_next = Some(ConditionalNext {
                field: "tool_called".to_string(),
                cases: [
                    ("true".to_string(), Some("run_tool".to_string())),
                    ("default".to_string(), Some("speak".to_string())),
                ]
                .into_iter()
                .collect(),
            });
            node
        },
        NodeDef::new("run_tool", NodeType::ToolCall).with_next("draft2"),
        NodeDef::new("draft2", NodeType::Llm).with_next("speak"),
        NodeDef::new("speak", NodeType::Speak),
    ];
    world.playbooks.save(&playbook).unwrap();

    client.push(ScriptedResponse::tool_call("echo_tool", json!({"query": "rain"})));
    client.push(ScriptedResponse::text("雨のようです。"));

    let outputs = runtime
        .run_meta_user(
            persona.clone(),
            Some("天気は？"),
            "cafe",
            Some("tool_chat"),
            None,
            None,
            CancellationToken::new(),
            Some("user"),
            "pulse-2",
        )
        .await
        .unwrap();
    assert_eq!(outputs, vec!["雨のようです。".to_string()]);

    // The second LLM call saw the assistant tool-call message and a paired
    // tool result with the same id, in order, before any further assistant
    // message.
    let calls = client.recorded_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].tool_names, vec!["echo_tool".to_string()]);

    let second = &calls[1].messages;
    let assistant_idx = second
        .iter()
        .position(|m| !m.tool_calls.is_empty())
        .expect("assistant tool-call message present");
    let tool_idx = second
        .iter()
        .position(|m| m.tool_call_id.is_some())
        .expect("tool result message present");
    assert!(assistant_idx < tool_idx, "tool result follows the assistant call");
    assert_eq!(
        second[assistant_idx].tool_calls[0].id,
        second[tool_idx].tool_call_id.clone().unwrap(),
        "tool_call_id pairs with the assistant's call"
    );
    let tool_msg = &second[tool_idx];
    assert_eq!(tool_msg.content_str(), "echo: rain");
}

fn sub_with_output(name: &str) -> PlaybookSchema {
    let mut playbook = PlaybookSchema::default();
    playbook.name = name.to_string();
    playbook.description = "Sets a greeting".to_string();
    playbook.output_schema = vec!["greeting".to_string()];
    playbook.start_node = "make".to_string();
    playbook.nodes = vec![
        {
            let mut node = NodeDef::new("make", NodeType::Set);
            node.assignments = Some(
                json!({"greeting": "hello from sub"})
                    .as_object()
                    .unwrap()
                    .clone(),
            );
            node.next = Some("speak".to_string());
            node
        },
        {
            let mut node = NodeDef::new("speak", NodeType::Say);
            node.action = Some("{greeting}".to_string());
            node
        },
    ];
    playbook
}

fn exec_meta(selected: &str) -> PlaybookSchema {
    let mut playbook = PlaybookSchema::default();
    playbook.name = "exec_meta".to_string();
    playbook.description = "Routes to a sub-playbook".to_string();
    playbook.start_node = "pick".to_string();
    playbook.nodes = vec![
        {
            let mut node = NodeDef::new("pick", NodeType::Set);
            node.assignments =
                Some(json!({"selected_playbook": selected}).as_object().unwrap().clone());
            node.next = Some("exec".to_string());
            node
        },
        {
            let mut node = NodeDef::new("exec", NodeType::Exec);
            node.next = Some("report".to_string());
            node.error_next = Some("apologize".to_string());
            node
        },
        {
            let mut node = NodeDef::new("report", NodeType::Say);
            node.action = Some("result: {greeting}".to_string());
            node
        },
        {
            let mut node = NodeDef::new("apologize", NodeType::Say);
            node.action = Some("error path".to_string());
            node
        },
    ];
    playbook
}

#[tokio::test]
async fn exec_runs_sub_playbook_and_propagates_outputs() {
    let world = test_support::world();
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    world.playbooks.save(&sub_with_output("greeter")).unwrap();
    world.playbooks.save(&exec_meta("greeter")).unwrap();

    let outputs = runtime
        .run_meta_user(
            persona.clone(),
            Some("挨拶して"),
            "cafe",
            Some("exec_meta"),
            None,
            None,
            CancellationToken::new(),
            Some("user"),
            "pulse-3",
        )
        .await
        .unwrap();

    // The sub-playbook's own outputs stay with the sub-run; the parent saw
    // the propagated output key and spoke it.
    assert_eq!(outputs, vec!["result: hello from sub".to_string()]);
}

#[tokio::test]
async fn exec_denial_takes_the_success_edge_and_records_memory() {
    let world = test_support::world();
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    world.playbooks.save(&sub_with_output("guarded")).unwrap();
    world.playbooks.save(&exec_meta("guarded")).unwrap();
    world
        .db
        .set_permission_level(&world.config.city.city_id, "guarded", "ask_every_time")
        .unwrap();

    // The user answers "deny" when prompted.
    let broker_world = world.clone();
    let callback: EventCallback = Arc::new(move |event| {
        if let RuntimeEvent::PermissionRequest { request_id, .. } = event {
            broker_world
                .permission_broker
                .resolve(&request_id, PermissionDecision::Deny);
        }
    });

    let outputs = runtime
        .run_meta_user(
            persona.clone(),
            Some("実行して"),
            "cafe",
            Some("exec_meta"),
            None,
            Some(callback),
            CancellationToken::new(),
            Some("user"),
            "pulse-4",
        )
        .await
        .unwrap();

    // Denial flows through the SUCCESS edge (the say node formats `last`
    // via the missing greeting, so the denial string itself was pushed by
    // the exec node), never the error edge.
    assert!(outputs.iter().any(|o| o.contains("User denied execution of playbook 'guarded'")));
    assert!(!outputs.iter().any(|o| o == "error path"));

    // The denial is visible in memory as a system message with the exec
    // error tags.
    let tagged = persona.memory.recent(RecentLimit::Count(20), &["error"], None).unwrap();
    let denial = tagged
        .iter()
        .find(|m| m.metadata.has_tag("exec") && m.metadata.has_tag("guarded"))
        .expect("denial recorded");
    assert_eq!(denial.role, "system");
    assert!(denial.content.contains("User denied execution"));
}

#[tokio::test]
async fn exec_auto_allows_schedule_pulses() {
    let world = test_support::world();
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    world.playbooks.save(&sub_with_output("guarded")).unwrap();
    world.playbooks.save(&exec_meta("guarded")).unwrap();
    world
        .db
        .set_permission_level(&world.config.city.city_id, "guarded", "ask_every_time")
        .unwrap();

    // No callback to answer a prompt; schedule pulses are pre-approved so
    // none is issued.
    let outputs = runtime
        .run_meta_user(
            persona.clone(),
            Some("定期実行"),
            "cafe",
            Some("exec_meta"),
            None,
            None,
            CancellationToken::new(),
            Some("schedule"),
            "pulse-5",
        )
        .await
        .unwrap();
    assert!(outputs.contains(&"result: hello from sub".to_string()));
}

#[tokio::test]
async fn streaming_cancel_closes_the_stream_and_keeps_one_usage_record() {
    let world = test_support::world();
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    // speak=true LLM node followed by another node, so the cancellation
    // surfaces at the next node boundary.
    let mut playbook = named(basic_chat(), "stream_chat");
    playbook.nodes[0].speak = Some(true);
    world.playbooks.save(&playbook).unwrap();

    client.push(
        ScriptedResponse::text("長い長い返事です")
            .with_usage(200, 3)
            .with_chunks(vec![
                StreamChunk::Text("長い".into()),
                StreamChunk::Text("長い".into()),
                StreamChunk::Text("返事".into()),
                StreamChunk::Text("です".into()),
            ]),
    );

    let token = CancellationToken::new();
    let chunks_seen = Arc::new(Mutex::new(0usize));
    let token_for_cb = token.clone();
    let chunks_for_cb = Arc::clone(&chunks_seen);
    let callback: EventCallback = Arc::new(move |event| {
        if matches!(event, RuntimeEvent::StreamingChunk { .. }) {
            let mut count = chunks_for_cb.lock().unwrap();
            *count += 1;
            if *count == 2 {
                token_for_cb.cancel(Some("user"));
            }
        }
    });

    let result = runtime
        .run_meta_user(
            persona.clone(),
            Some("話して"),
            "cafe",
            Some("stream_chat"),
            None,
            Some(callback),
            token,
            Some("schedule"),
            "pulse-6",
        )
        .await;

    assert!(matches!(result, Err(RuntimeError::Cancelled(_))));
    assert_eq!(*chunks_seen.lock().unwrap(), 2, "stream stopped within one chunk boundary");
    // The partial call still produced exactly one usage record.
    assert_eq!(world.db.usage_row_count().unwrap(), 1);
}

#[tokio::test]
async fn profile_cached_nodes_share_one_base_and_see_intermediates() {
    let world = test_support::world();
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    let runtime = Runtime::new(world.clone());

    // Two LLM nodes naming the same profile; the second must see the first
    // node's output through the intermediate overlay.
    let mut playbook = PlaybookSchema::default();
    playbook.name = "two_steps".to_string();
    playbook.description = "Profile reuse".to_string();
    playbook.start_node = "first".to_string();
    playbook.nodes = vec![
        {
            let mut node = NodeDef::new("first", NodeType::Llm);
            node.context_profile = Some("minimal".to_string());
            node.action = Some("step one".to_string());
            node.next = Some("second".to_string());
            node
        },
        {
            let mut node = NodeDef::new("second", NodeType::Llm);
            node.context_profile = Some("minimal".to_string());
            node.action = Some("step two".to_string());
            node.next = Some("speak".to_string());
            node
        },
        NodeDef::new("speak", NodeType::Speak),
    ];
    world.playbooks.save(&playbook).unwrap();

    client.push(ScriptedResponse::text("first answer"));
    client.push(ScriptedResponse::text("second answer"));

    runtime
        .run_meta_user(
            persona.clone(),
            Some("やって"),
            "cafe",
            Some("two_steps"),
            None,
            None,
            CancellationToken::new(),
            Some("user"),
            "pulse-7",
        )
        .await
        .unwrap();

    let calls = client.recorded_calls();
    assert_eq!(calls.len(), 2);
    let second = &calls[1].messages;
    assert!(
        second.iter().any(|m| m.content_str() == "first answer"),
        "second call sees the first node's reply via the intermediate overlay"
    );

    // Both calls share the identical base prefix (the profile was built once).
    let base_len = calls[0].messages.len() - 1; // minus the action prompt
    let first_base: Vec<_> = calls[0].messages[..base_len]
        .iter()
        .map(|m| m.content_str().to_string())
        .collect();
    let second_base: Vec<_> = calls[1].messages[..base_len]
        .iter()
        .map(|m| m.content_str().to_string())
        .collect();
    assert_eq!(first_base, second_base);
}

#[tokio::test]
async fn double_reply_is_prevented_under_concurrency() {
    let world = test_support::world();
    let (persona, _client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());

    let ctx = ToolContext::for_persona("p1");
    let args = json!({"text": "面白いですね！", "in_reply_to_tweet_id": "T1000"});

    let (a, b) = tokio::join!(
        world.tools.call("x_reply_tweet", args.clone(), &ctx, None),
        world.tools.call("x_reply_tweet", args.clone(), &ctx, None),
    );
    let a = a.unwrap().primary_text();
    let b = b.unwrap().primary_text();

    let successes = [&a, &b]
        .iter()
        .filter(|t| t.contains("リプライを送信しました"))
        .count();
    let refusals = [&a, &b]
        .iter()
        .filter(|t| t.contains("このツイート(ID: T1000)には既にリプライ済みです。"))
        .count();
    assert_eq!((successes, refusals), (1, 1), "exactly one reply and one refusal");
}
