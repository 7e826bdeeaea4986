//! Pulse controller scenarios: preemption, resumption, queue bounds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use saiverse_llm::testing::ScriptedResponse;
use saiverse_memory::RecentLimit;
use saiverse_playbook::{NodeDef, NodeType, PlaybookSchema};
use saiverse_runtime::test_support;
use saiverse_runtime::{PulseController, Runtime, SubmitOutcome};
use saiverse_tools::{Tool, ToolContext, ToolError, ToolOutput, ToolSpec};

/// A tool that just takes a while, giving other stimuli time to arrive.
struct TakeTimeTool {
    millis: u64,
}

#[async_trait]
impl Tool for TakeTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "take_time".to_string(),
            description: "Spends some time".to_string(),
            parameters: json!({"type": "object"}),
        }
    }

    async fn run(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(ToolOutput::text("took a while"))
    }
}

/// meta_user = slow tool, then an LLM reply, then speak.
fn slow_meta_user() -> PlaybookSchema {
    let mut playbook = PlaybookSchema::default();
    playbook.name = "meta_user".to_string();
    playbook.description = "Slow handling of a stimulus".to_string();
    playbook.start_node = "work".to_string();
    playbook.nodes = vec![
        NodeDef::new("work", NodeType::Tool)
            .with_action("take_time")
            .with_next("draft"),
        NodeDef::new("draft", NodeType::Llm)
            .with_action("Reply to: {input}")
            .with_next("speak"),
        NodeDef::new("speak", NodeType::Speak),
    ];
    playbook
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_preempts_schedule_and_schedule_resumes() {
    let world = test_support::world();
    world.tools.register(Arc::new(TakeTimeTool { millis: 300 }));
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    world.playbooks.save(&slow_meta_user()).unwrap();

    let runtime = Runtime::new(world.clone());
    let controller = PulseController::new(runtime);

    for _ in 0..3 {
        client.push(ScriptedResponse::text("了解しました。"));
    }

    // Schedule starts working; the user speaks while it runs.
    let schedule_controller = Arc::clone(&controller);
    let schedule_task = tokio::spawn(async move {
        schedule_controller
            .submit_schedule("p1", "cafe", "部屋の掃除をして")
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let user_outcome = controller.submit_user("p1", "cafe", "こんにちは", None).await;
    match &user_outcome {
        SubmitOutcome::Executed(outputs) => assert!(!outputs.is_empty(), "user pulse ran to completion"),
        other => panic!("user request should execute immediately, got {other:?}"),
    }

    // Preempted schedule finishes as empty, then its resumption drains.
    let schedule_outcome = schedule_task.await.unwrap();
    assert_eq!(schedule_outcome, SubmitOutcome::Executed(vec![]));
    tokio::time::sleep(Duration::from_millis(900)).await;

    // Interruption note: tagged, labeled, and marked resumable.
    let internal = persona
        .memory
        .recent(RecentLimit::Count(50), &["internal"], None)
        .unwrap();
    let interruption = internal
        .iter()
        .find(|m| m.metadata.has_tag("interrupted"))
        .expect("interruption message persisted");
    assert_eq!(interruption.content, "(中断: userからのリクエストを優先しました)");
    assert_eq!(interruption.metadata.interrupted_by.as_deref(), Some("user"));
    assert_eq!(interruption.metadata.will_resume, Some(true));

    // The resumption ran with the original prompt wrapped in a system note.
    let conversation = persona
        .memory
        .recent(RecentLimit::Count(50), &["conversation"], None)
        .unwrap();
    let resumed = conversation
        .iter()
        .find(|m| m.role == "user" && m.content.starts_with("<system>"))
        .expect("resumption prompt recorded");
    assert!(resumed.content.contains("前回の処理が中断されました"));
    assert!(resumed.content.contains("部屋の掃除をして"));

    assert!(!controller.is_busy("p1"));
    assert_eq!(controller.queue_len("p1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_is_skipped_while_busy() {
    let world = test_support::world();
    world.tools.register(Arc::new(TakeTimeTool { millis: 200 }));
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    world.playbooks.save(&slow_meta_user()).unwrap();

    let runtime = Runtime::new(world.clone());
    let controller = PulseController::new(runtime);
    client.push(ScriptedResponse::text("ok"));

    let user_controller = Arc::clone(&controller);
    let user_task =
        tokio::spawn(async move { user_controller.submit_user("p1", "cafe", "やあ", None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Auto never interrupts and never queues.
    let auto_outcome = controller.submit_auto("p1", "cafe").await;
    assert_eq!(auto_outcome, SubmitOutcome::Skipped);
    assert_eq!(controller.queue_len("p1"), 0);

    let user_outcome = user_task.await.unwrap();
    assert!(matches!(user_outcome, SubmitOutcome::Executed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn schedule_queue_is_bounded_at_ten() {
    let world = test_support::world();
    world.tools.register(Arc::new(TakeTimeTool { millis: 400 }));
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    world.playbooks.save(&slow_meta_user()).unwrap();

    let runtime = Runtime::new(world.clone());
    let controller = PulseController::new(runtime);
    for _ in 0..20 {
        client.push(ScriptedResponse::text("ok"));
    }

    // One schedule occupies the lane.
    let first_controller = Arc::clone(&controller);
    let first =
        tokio::spawn(async move { first_controller.submit_schedule("p1", "cafe", "job 0").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Twelve more pile up behind it; the queue caps at ten.
    for i in 1..=12 {
        let outcome = controller
            .submit_schedule("p1", "cafe", &format!("job {i}"))
            .await;
        assert_eq!(outcome, SubmitOutcome::Queued, "job {i} should queue");
    }
    assert_eq!(controller.queue_len("p1"), 10);

    let _ = first.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn later_user_message_wins_over_the_running_one() {
    let world = test_support::world();
    world.tools.register(Arc::new(TakeTimeTool { millis: 300 }));
    let (persona, client) = test_support::persona_with_client(&world, "p1", "cafe");
    world.add_persona(persona.clone());
    world.playbooks.save(&slow_meta_user()).unwrap();

    let runtime = Runtime::new(world.clone());
    let controller = PulseController::new(runtime);
    client.push(ScriptedResponse::text("最初の返事"));
    client.push(ScriptedResponse::text("二番目の返事"));

    let first_controller = Arc::clone(&controller);
    let first = tokio::spawn(async move {
        first_controller.submit_user("p1", "cafe", "最初の話", None).await
    });
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Last user message wins; the first is cancelled and not retried.
    let second = controller.submit_user("p1", "cafe", "やっぱりこっち", None).await;
    assert!(matches!(second, SubmitOutcome::Executed(_)));

    let first_outcome = first.await.unwrap();
    assert_eq!(first_outcome, SubmitOutcome::Executed(vec![]), "preempted user run yields nothing");

    tokio::time::sleep(Duration::from_millis(500)).await;
    // User policy is skip: nothing queued for resumption.
    assert_eq!(controller.queue_len("p1"), 0);

    let internal = persona
        .memory
        .recent(RecentLimit::Count(50), &["internal"], None)
        .unwrap();
    let interruption = internal
        .iter()
        .find(|m| m.metadata.has_tag("interrupted"))
        .expect("interruption message persisted");
    assert_eq!(interruption.metadata.will_resume, Some(false));
}
