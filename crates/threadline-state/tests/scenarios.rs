//! End-to-end run scenarios over stores opened from configuration.
//!
//! Each test drives Start, node steps and End through `open_store`, the way a
//! host embedding the engine would.

use std::collections::HashMap;
use std::sync::Once;

use async_trait::async_trait;
use serde_json::json;
use threadline_checkpoint::prelude::*;
use threadline_core::config::StoreConfig;
use threadline_core::error::Result;
use threadline_core::message::Message;
use threadline_core::value::ChannelValue;
use threadline_state::prelude::*;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn human(text: &str) -> HashMap<String, ChannelValue> {
    HashMap::from([(MESSAGES.to_string(), ChannelValue::messages([Message::human(text)]))])
}

fn reply(text: &str) -> HashMap<String, ChannelValue> {
    HashMap::from([(MESSAGES.to_string(), ChannelValue::Message(Message::ai(text)))])
}

struct Shout;

#[async_trait]
impl PostProcessor for Shout {
    async fn process(&self, message: &Message, _history: &[ChannelValue]) -> Result<Message> {
        Ok(Message::ai(format!("{}!", message.content.to_uppercase())))
    }
}

#[tokio::test]
async fn conversation_survives_reopening_the_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.db");

    {
        let handle = open_store(&StoreConfig::embedded_file(&path, "conv-1")).unwrap();
        let mut run = StateRun::new(handle, StateSchema::new());
        run.start(human("hi")).await.unwrap();
        run.step("agent", reply("hello")).await.unwrap();
        run.end(None).await.unwrap();
    }

    let handle = open_store(&StoreConfig::embedded_file(&path, "conv-1")).unwrap();
    let mut run = StateRun::new(handle, StateSchema::new());
    assert_eq!(run.resume().await.unwrap(), RunPhase::Terminated);

    // A new turn starts from the terminated run's history.
    let started = run.start(HashMap::new()).await.unwrap();
    assert_eq!(started.checkpoint.messages().len(), 2);
    assert_eq!(run.phase(), RunPhase::Running { step: 2 });
}

#[tokio::test]
async fn declared_channels_flow_through_a_run() {
    init_tracing();
    let decl = StateDeclaration::from_value(json!([
        {"key": "visited", "operation": "append", "default_value": []},
        {"key": "city", "operation": "replace", "default_value": "unknown"}
    ]))
    .unwrap();
    let schema = StateSchema::from_declaration(&decl, &ScriptContext::new()).unwrap();

    let handle = open_store(&StoreConfig::transient("trip-7")).unwrap();
    let mut run = StateRun::new(handle, schema);

    let mut inbound = human("plan a trip");
    inbound.insert("city".into(), "Kyoto".into());
    let started = run.start(inbound).await.unwrap();
    assert_eq!(started.checkpoint.channel_values["city"], ChannelValue::from("Kyoto"));
    assert_eq!(started.checkpoint.channel_values["visited"], ChannelValue::Sequence(vec![]));

    run.step("planner", HashMap::from([("visited".into(), ChannelValue::from("Kyoto"))]))
        .await
        .unwrap();
    let stepped = run
        .step(
            "planner",
            HashMap::from([
                ("visited".into(), ChannelValue::from("Osaka")),
                ("city".into(), ChannelValue::from("Osaka")),
            ]),
        )
        .await
        .unwrap();

    assert_eq!(
        stepped.checkpoint.channel_values["visited"],
        ChannelValue::from(json!(["Kyoto", "Osaka"]))
    );
    assert_eq!(stepped.checkpoint.channel_values["city"], ChannelValue::from("Osaka"));
    assert_eq!(stepped.metadata.writes.as_ref().unwrap()["planner"]["city"], json!("Osaka"));
}

#[tokio::test]
async fn post_processed_answer_is_persisted() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let handle = open_store(&StoreConfig::embedded_file(dir.path().join("t.db"), "conv-2")).unwrap();
    let mut run = StateRun::new(handle.clone(), StateSchema::new());

    run.start(human("what is 2+2?")).await.unwrap();
    run.step("agent", reply("four")).await.unwrap();
    let out = run.end(Some(&Shout)).await.unwrap();

    assert_eq!(out.delivery, Delivery::Streamed);
    assert_eq!(out.message.as_ref().unwrap().content, "FOUR!");

    let stored = handle.get_tuple().await.unwrap().unwrap();
    assert!(is_terminal(&stored.metadata));
    assert_eq!(stored.checkpoint.last_message().unwrap().content, "FOUR!");
    assert_eq!(
        stored.metadata.writes.unwrap()["__end__"]["delivery"],
        json!("streamed")
    );
}

#[tokio::test]
async fn tool_results_recorded_by_a_task_reach_the_next_step() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let handle = open_store(&StoreConfig::embedded_file(dir.path().join("t.db"), "conv-3")).unwrap();
    let mut run = StateRun::new(handle.clone(), StateSchema::new());

    run.start(human("weather in Paris?")).await.unwrap();
    run.submit_task_writes(
        "task-weather",
        vec![(MESSAGES.into(), ChannelValue::Message(Message::tool("sunny", "call_1")))],
    )
    .await
    .unwrap();

    let stepped = run.step("agent", reply("It is sunny.")).await.unwrap();
    let contents: Vec<_> = stepped
        .checkpoint
        .messages()
        .iter()
        .filter_map(ChannelValue::as_message)
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, ["weather in Paris?", "sunny", "It is sunny."]);

    // The history lists the carrier alongside the real checkpoints.
    let history = collect_tuples(handle.list(ListOptions::new())).await.unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|t| t.metadata.source == CheckpointSource::PendingWrites)
            .count(),
        1
    );
}

#[tokio::test]
async fn clearing_a_thread_resets_the_next_start() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let handle = open_store(&StoreConfig::embedded_file(dir.path().join("t.db"), "conv-4")).unwrap();

    let mut run = StateRun::new(handle.clone(), StateSchema::new());
    run.start(human("remember me")).await.unwrap();
    run.end(None).await.unwrap();

    handle.delete_tuple().await.unwrap();

    let mut fresh = StateRun::new(handle, StateSchema::new());
    let started = fresh.start(human("hello again")).await.unwrap();
    assert_eq!(started.checkpoint.messages().len(), 1);
    assert_eq!(started.checkpoint.last_message().unwrap().content, "hello again");
}

#[tokio::test]
async fn threads_are_isolated_within_one_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let mut a = StateRun::new(
        open_store(&StoreConfig::embedded_file(&path, "thread-a")).unwrap(),
        StateSchema::new(),
    );
    let mut b = StateRun::new(
        open_store(&StoreConfig::embedded_file(&path, "thread-b")).unwrap(),
        StateSchema::new(),
    );

    a.start(human("from a")).await.unwrap();
    b.start(human("from b")).await.unwrap();
    a.step("agent", reply("answer a")).await.unwrap();

    assert_eq!(a.head().unwrap().checkpoint.messages().len(), 2);
    assert_eq!(b.head().unwrap().checkpoint.messages().len(), 1);
    assert_eq!(b.head().unwrap().checkpoint.last_message().unwrap().content, "from b");
}

#[tokio::test]
async fn task_ids_sorting_below_the_head_still_reach_the_next_turn() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let handle = open_store(&StoreConfig::embedded_file(&path, "conv-5")).unwrap();
    let mut run = StateRun::new(handle, StateSchema::new());

    run.start(human("look it up")).await.unwrap();
    run.submit_task_writes(
        "0-task",
        vec![(MESSAGES.into(), ChannelValue::Message(Message::tool("found", "call_9")))],
    )
    .await
    .unwrap();

    // A later process starts a new turn on the same thread.
    let handle = open_store(&StoreConfig::embedded_file(&path, "conv-5")).unwrap();
    let mut next = StateRun::new(handle, StateSchema::new());
    let started = next.start(HashMap::new()).await.unwrap();
    let contents: Vec<_> = started
        .checkpoint
        .messages()
        .iter()
        .filter_map(ChannelValue::as_message)
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, ["look it up", "found"]);
}
