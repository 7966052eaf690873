// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Scenario tests for the engine turn loop.
///
/// Uses `ScriptedProvider` so every scenario is deterministic and requires
/// no network access.
#[cfg(test)]
mod engine_tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, oneshot};

    use quill_config::{CompactionConfig, EngineConfig};
    use quill_model::{Message, Part, ProviderEvent, Role, ScriptStep, ScriptedProvider};
    use quill_tools::{
        encode_diff_marker, DiffPayload, Tool, ToolCall, ToolOutput, ToolRegistry, ASK_USER_TOOL,
        EDIT_FILE_TOOL,
    };

    use crate::{Engine, StreamEvent, TurnMetrics};

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "shell"
        }
        fn description(&self) -> &str {
            "runs a command"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "a.txt\nb.txt")
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "shell"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::err(&call.id, "command not found")
        }
    }

    struct SleepTool {
        name: &'static str,
        millis: u64,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "sleeps then answers"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            ToolOutput::ok(&call.id, format!("done:{}", self.name))
        }
    }

    fn engine_with(provider: ScriptedProvider, tools: ToolRegistry) -> Engine {
        Engine::new(
            Arc::new(provider),
            Arc::new(tools),
            &EngineConfig::default(),
            "session-1",
        )
    }

    fn shell_registry() -> ToolRegistry {
        let reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg
    }

    /// Run a submission to completion and return all emitted events.
    async fn run(engine: &mut Engine, text: &str) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(256);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        engine
            .submit(Message::user(text), tx, cancel_rx)
            .await
            .unwrap();
        drop(cancel_tx);
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    // ── Scenario: fresh chat, tool-free turn ──────────────────────────────────

    #[tokio::test]
    async fn tool_free_turn_streams_text_and_completes() {
        let mut engine = engine_with(ScriptedProvider::always_text("hello"), ToolRegistry::new());
        let turns: Arc<Mutex<Vec<(u32, Vec<Message>, TurnMetrics)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let turns = turns.clone();
            engine.set_turn_completed_callback(Arc::new(move |turn, msgs, metrics| {
                turns.lock().unwrap().push((turn, msgs.to_vec(), *metrics));
                Ok(())
            }));
            let responses = responses.clone();
            engine.set_response_completed_callback(Arc::new(move |turn, _, _| {
                responses.lock().unwrap().push(turn);
                Ok(())
            }));
        }

        let events = run(&mut engine, "hi").await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Text(t) if t == "hello")));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Done { .. }))
                .count(),
            1,
            "Done fires exactly once"
        );

        // One turn callback, carrying the assistant message; no response
        // callback on a tool-free turn.
        let turns = turns.lock().unwrap();
        assert_eq!(turns.len(), 1);
        let (turn, msgs, metrics) = &turns[0];
        assert_eq!(*turn, 1);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(msgs[0].extracted_text, "hello");
        assert_eq!(metrics.llm_turns, 1);
        assert_eq!(metrics.tool_calls, 0);
        assert!(responses.lock().unwrap().is_empty());

        // History: user then assistant.
        assert_eq!(engine.history().len(), 2);
        assert_eq!(engine.history()[0].role, Role::User);
        assert_eq!(engine.history()[1].role, Role::Assistant);
    }

    // ── Scenario: tool use with success ───────────────────────────────────────

    #[tokio::test]
    async fn tool_turn_persists_assistant_before_tools_and_orders_results() {
        let provider =
            ScriptedProvider::tool_then_text("c1", "shell", r#"{"cmd":"ls"}"#, "two files");
        let mut engine = engine_with(provider, shell_registry());

        let responses: Arc<Mutex<Vec<(u32, Message)>>> = Arc::new(Mutex::new(Vec::new()));
        let turns: Arc<Mutex<Vec<(u32, Vec<Message>)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let responses = responses.clone();
            engine.set_response_completed_callback(Arc::new(move |turn, msg, _| {
                responses.lock().unwrap().push((turn, msg.clone()));
                Ok(())
            }));
            let turns = turns.clone();
            engine.set_turn_completed_callback(Arc::new(move |turn, msgs, _| {
                turns.lock().unwrap().push((turn, msgs.to_vec()));
                Ok(())
            }));
        }

        let events = run(&mut engine, "list files").await;

        // Exec events bracket the tool run.
        assert!(events.iter().any(
            |e| matches!(e, StreamEvent::ToolExecStart { call_id, name, .. } if call_id == "c1" && name == "shell")
        ));
        assert!(events.iter().any(
            |e| matches!(e, StreamEvent::ToolExecEnd { call_id, success: true, .. } if call_id == "c1")
        ));

        // Turn 1 fired the response callback with the tool-call message.
        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, 1);
        assert!(responses[0].1.has_tool_calls());

        // Turn 1's completion carried only the tool-role message; turn 2
        // carried the final assistant text.
        let turns = turns.lock().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].1.len(), 1);
        assert_eq!(turns[0].1[0].role, Role::Tool);
        match &turns[0].1[0].parts[0] {
            Part::ToolResult {
                id,
                name,
                content,
                is_error,
            } => {
                assert_eq!(id, "c1");
                assert_eq!(name, "shell");
                assert_eq!(content, "a.txt\nb.txt");
                assert!(!is_error);
            }
            other => panic!("expected tool result part, got {other:?}"),
        }
        assert_eq!(turns[1].1[0].extracted_text, "two files");

        // History: user, assistant(call), tool, assistant(text).
        let roles: Vec<Role> = engine.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    }

    #[tokio::test]
    async fn tool_metrics_count_calls() {
        let provider = ScriptedProvider::tool_then_text("c1", "shell", "{}", "ok");
        let mut engine = engine_with(provider, shell_registry());
        let tool_calls: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let tool_calls = tool_calls.clone();
            engine.set_turn_completed_callback(Arc::new(move |_, _, metrics| {
                tool_calls.lock().unwrap().push(metrics.tool_calls);
                Ok(())
            }));
        }
        let _ = run(&mut engine, "go").await;
        assert_eq!(*tool_calls.lock().unwrap(), vec![1, 0]);
    }

    // ── Scenario: tool failure, loop continues ────────────────────────────────

    #[tokio::test]
    async fn failed_tool_keeps_loop_running() {
        let provider = ScriptedProvider::tool_then_text("c1", "shell", "{}", "failed");
        let reg = ToolRegistry::new();
        reg.register(FailingTool);
        let mut engine = engine_with(provider, reg);

        let events = run(&mut engine, "try it").await;

        assert!(events.iter().any(
            |e| matches!(e, StreamEvent::ToolExecEnd { success: false, .. })
        ));
        // The model still got the error result and answered.
        let last = engine.history().last().unwrap();
        assert_eq!(last.extracted_text, "failed");
        // The error is captured in the tool-result part, not as a stream error.
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
        match &engine.history()[2].parts[0] {
            Part::ToolResult { is_error, .. } => assert!(*is_error),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    // ── Scenario: interjection ────────────────────────────────────────────────

    #[tokio::test]
    async fn interjection_lands_after_tool_results_before_next_turn() {
        let provider = ScriptedProvider::tool_then_text("c1", "shell", "{}", "stopping");
        let mut engine = engine_with(provider, shell_registry());
        engine.interject("actually stop after 3 results");

        let turns: Arc<Mutex<Vec<Vec<Message>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let turns = turns.clone();
            engine.set_turn_completed_callback(Arc::new(move |_, msgs, _| {
                turns.lock().unwrap().push(msgs.to_vec());
                Ok(())
            }));
        }

        let _ = run(&mut engine, "long task").await;

        let roles: Vec<Role> = engine.history().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::User, Role::Assistant]
        );
        assert_eq!(
            engine.history()[3].extracted_text,
            "actually stop after 3 results"
        );

        // The interjection travelled with turn 1's new messages.
        let turns = turns.lock().unwrap();
        assert_eq!(turns[0].len(), 2);
        assert_eq!(turns[0][1].role, Role::User);
        assert!(engine.drain_interjection().is_none(), "slot drained");
    }

    #[tokio::test]
    async fn interjection_survives_cancellation() {
        let mut engine = engine_with(ScriptedProvider::always_text("x"), ToolRegistry::new());
        engine.interject("recover me");

        let (tx, _rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        drop(cancel_tx); // already cancelled on entry
        engine
            .submit(Message::user("hi"), tx, cancel_rx)
            .await
            .unwrap();

        assert_eq!(engine.drain_interjection().as_deref(), Some("recover me"));
    }

    // ── Scenario: retries ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn transient_failure_emits_retry_then_succeeds() {
        // Zero backoff so the test does not sleep: the scripted error carries
        // no retry_after, so pre-cancel the wait with a tiny max attempt.
        let provider = ScriptedProvider::new(vec![
            vec![ScriptStep::Fail(quill_model::ProviderError::Transient {
                message: "connection reset".into(),
                retry_after: Some(Duration::from_millis(1)),
            })],
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta("recovered".into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
        ]);
        let mut engine = engine_with(provider, ToolRegistry::new());

        let events = run(&mut engine, "hi").await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Retry { attempt: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Text(t) if t == "recovered")));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
    }

    #[tokio::test]
    async fn non_retriable_failure_emits_error_and_done() {
        let provider = ScriptedProvider::new(vec![vec![ScriptStep::Fail(
            quill_model::ProviderError::Auth("bad key".into()),
        )]]);
        let mut engine = engine_with(provider, ToolRegistry::new());

        let events = run(&mut engine, "hi").await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error(e) if e.contains("bad key"))));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Done { .. }))
                .count(),
            1
        );
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Retry { .. })));
    }

    // ── Scenario: compaction ──────────────────────────────────────────────────

    fn compacting_engine(scripts: Vec<Vec<ScriptStep>>) -> Engine {
        let provider = ScriptedProvider::new(scripts).with_input_limit(200);
        let config = EngineConfig {
            compaction: CompactionConfig {
                enabled: true,
                threshold: 0.8,
                keep_recent: 1,
            },
            ..Default::default()
        };
        Engine::new(
            Arc::new(provider),
            Arc::new(ToolRegistry::new()),
            &config,
            "session-1",
        )
    }

    fn long_history() -> Vec<Message> {
        // Five exchanges at ~45 tokens each, comfortably over 0.8 × 200.
        let mut msgs = Vec::new();
        for i in 0..5 {
            msgs.push(Message::user(format!("question {i}: {}", "x".repeat(80))));
            msgs.push(Message::assistant(format!("answer {i}: {}", "y".repeat(80))));
        }
        msgs
    }

    #[tokio::test]
    async fn compaction_replaces_old_history_with_summary() {
        let mut engine = compacting_engine(vec![
            // Call 1: the compaction summary turn.
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta("SUMMARY".into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
            // Call 2: the real turn.
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta("reply".into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
        ]);
        engine.seed_history(long_history());

        let compacted: Arc<Mutex<Vec<Vec<Message>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let compacted = compacted.clone();
            engine.set_compaction_callback(Arc::new(move |msgs| {
                compacted.lock().unwrap().push(msgs.to_vec());
                Ok(())
            }));
        }

        let _ = run(&mut engine, "next question").await;

        // The callback received the replacement list headed by the summary.
        let compacted = compacted.lock().unwrap();
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0][0].role, Role::Assistant);
        assert_eq!(compacted[0][0].extracted_text, "SUMMARY");

        // The engine history begins with the summary and preserved the most
        // recent exchange verbatim before the new turn.
        let history = engine.history();
        assert_eq!(history[0].extracted_text, "SUMMARY");
        assert!(history[1].extracted_text.starts_with("question 4"));
        assert!(history[2].extracted_text.starts_with("answer 4"));
        assert_eq!(history[history.len() - 2].extracted_text, "next question");
        assert_eq!(history[history.len() - 1].extracted_text, "reply");
    }

    #[tokio::test]
    async fn failed_compaction_leaves_history_intact() {
        let mut engine = compacting_engine(vec![
            vec![ScriptStep::Fail(quill_model::ProviderError::Auth(
                "no credit".into(),
            ))],
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta("reply anyway".into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
        ]);
        let original = long_history();
        engine.seed_history(original.clone());
        engine.set_compaction_callback(Arc::new(|_| panic!("must not fire on failure")));

        let events = run(&mut engine, "next").await;

        assert!(events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
        // Original history plus the new user/assistant pair, nothing dropped.
        assert_eq!(engine.history().len(), original.len() + 2);
        assert_eq!(engine.history()[0].extracted_text, original[0].extracted_text);
    }

    // ── Parallel tool ordering ────────────────────────────────────────────────

    #[tokio::test]
    async fn parallel_tool_results_follow_call_order_not_completion_order() {
        let provider = ScriptedProvider::new(vec![
            vec![
                ScriptStep::Event(ProviderEvent::ToolCall {
                    index: 0,
                    id: "slow-call".into(),
                    name: "slow".into(),
                    arguments: "{}".into(),
                }),
                ScriptStep::Event(ProviderEvent::ToolCall {
                    index: 1,
                    id: "fast-call".into(),
                    name: "fast".into(),
                    arguments: "{}".into(),
                }),
                ScriptStep::Event(ProviderEvent::Done),
            ],
            vec![
                ScriptStep::Event(ProviderEvent::TextDelta("both done".into())),
                ScriptStep::Event(ProviderEvent::Done),
            ],
        ]);
        let reg = ToolRegistry::new();
        reg.register(SleepTool {
            name: "slow",
            millis: 40,
        });
        reg.register(SleepTool {
            name: "fast",
            millis: 1,
        });
        let mut engine = engine_with(provider, reg);

        let _ = run(&mut engine, "race").await;

        let tool_msg = engine
            .history()
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool message present");
        let ids: Vec<&str> = tool_msg
            .parts
            .iter()
            .map(|p| match p {
                Part::ToolResult { id, .. } => id.as_str(),
                other => panic!("unexpected part {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["slow-call", "fast-call"]);
    }

    // ── Reserved tools: ask_user and edit_file diff marker ────────────────────

    struct AskTool;

    #[async_trait]
    impl Tool for AskTool {
        fn name(&self) -> &str {
            ASK_USER_TOOL
        }
        fn description(&self) -> &str {
            "asks the user"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "user chose option B")
        }
    }

    #[tokio::test]
    async fn ask_user_tool_emits_external_ui_result() {
        let provider = ScriptedProvider::tool_then_text("q1", ASK_USER_TOOL, "{}", "ok");
        let reg = ToolRegistry::new();
        reg.register(AskTool);
        let mut engine = engine_with(provider, reg);

        let events = run(&mut engine, "ask them").await;
        assert!(events.iter().any(
            |e| matches!(e, StreamEvent::AskUserResult { summary } if summary == "user chose option B")
        ));
    }

    struct EditTool;

    #[async_trait]
    impl Tool for EditTool {
        fn name(&self) -> &str {
            EDIT_FILE_TOOL
        }
        fn description(&self) -> &str {
            "edits a file"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            let marker = encode_diff_marker(&DiffPayload {
                file: "src/lib.rs".into(),
                old: "a".into(),
                new: "b".into(),
                line: 7,
            });
            ToolOutput::ok(&call.id, format!("edited src/lib.rs\n{marker}"))
        }
    }

    #[tokio::test]
    async fn edit_file_diff_marker_becomes_diff_event() {
        let provider = ScriptedProvider::tool_then_text("e1", EDIT_FILE_TOOL, "{}", "ok");
        let reg = ToolRegistry::new();
        reg.register(EditTool);
        let mut engine = engine_with(provider, reg);

        let events = run(&mut engine, "edit it").await;
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Diff { path, line: 7, .. } if path == "src/lib.rs"
        )));
    }

    // ── Callback ordering invariants ──────────────────────────────────────────

    #[tokio::test]
    async fn response_completed_precedes_turn_completed_per_turn() {
        let provider = ScriptedProvider::tool_then_text("c1", "shell", "{}", "end");
        let mut engine = engine_with(provider, shell_registry());

        let order: Arc<Mutex<Vec<(&'static str, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            engine.set_response_completed_callback(Arc::new(move |turn, _, _| {
                order.lock().unwrap().push(("response", turn));
                Ok(())
            }));
        }
        {
            let order = order.clone();
            engine.set_turn_completed_callback(Arc::new(move |turn, _, _| {
                order.lock().unwrap().push(("turn", turn));
                Ok(())
            }));
        }

        let _ = run(&mut engine, "go").await;

        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec![("response", 1), ("turn", 1), ("turn", 2)],
            "response precedes turn for the same index; turn N precedes N+1"
        );
    }
}
