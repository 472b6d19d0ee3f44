mod common;

use common::*;
use meao::approval::ApprovalScope;
use meao::channel::ChannelMessage;
use meao::errors::MeaoError;
use serde_json::json;

#[tokio::test]
async fn golden_path_write_read_confirm() {
    let h = harness(HarnessOptions {
        passes: vec![
            tool_pass(
                "tc_1",
                "write_file",
                json!({"path": "README.md", "content": "# Hello"}),
            ),
            tool_pass("tc_2", "read_file", json!({"path": "README.md"})),
            text_pass("Done — README.md contains `# Hello`."),
        ],
        prompt: Some(approving_prompt(ApprovalScope::Once)),
        ..HarnessOptions::default()
    })
    .await;

    let reply = h
        .orchestrator
        .process_message("Create README.md with '# Hello' and confirm.")
        .await
        .unwrap();
    assert!(reply.contains("Done"));

    // The file really landed in the workspace
    let content = std::fs::read_to_string(h.work_dir.join("README.md")).unwrap();
    assert_eq!(content, "# Hello");

    // Turn accounting: one turn, two tool calls, usage accumulated
    let session = h.orchestrator.session_snapshot().await;
    assert_eq!(session.turns.len(), 1);
    let turn = &session.turns[0];
    assert_eq!(turn.tool_calls.len(), 2);
    assert!(turn.tool_calls.iter().all(|tc| tc
        .result
        .as_ref()
        .is_some_and(|r| r.success)));
    assert_eq!(turn.usage.input_tokens, 40 + 40 + 30);
    assert!(session.estimated_cost > 0.0);

    // The model saw the tool results fed back in order
    let requests = h.provider.recorded_requests();
    assert_eq!(requests.len(), 3);
    let second = &requests[1];
    let result_msg = second.iter().rev().find(|m| m.role == "tool").unwrap();
    assert!(result_msg.content.contains("Wrote 7 bytes"));

    // Audit trail covers the whole arc
    let actions = audit_actions(&h.audit);
    assert!(actions.iter().any(|a| a == "start"));
    assert!(actions.iter().any(|a| a == "approval_granted"));
    assert!(actions.iter().any(|a| a == "complete"));
    let turn_complete = actions.iter().filter(|a| *a == "complete").count();
    assert!(turn_complete >= 2); // two tool completes + turn complete share names across categories
}

#[tokio::test]
async fn streamed_fragments_assemble_exactly_once() {
    // Six-way fragment split: one call, parsed input equals the intent
    let h = harness(HarnessOptions {
        passes: vec![
            tool_pass_split(
                "tc_1",
                "read_file",
                &["{\"pa", "th\":", " \"a.", "txt\"", "", "}"],
            ),
            text_pass("read it"),
        ],
        ..HarnessOptions::default()
    })
    .await;
    std::fs::write(h.work_dir.join("a.txt"), "content").unwrap();

    h.orchestrator.process_message("read a.txt").await.unwrap();

    let session = h.orchestrator.session_snapshot().await;
    assert_eq!(session.turns[0].tool_calls.len(), 1);
    let call = &session.turns[0].tool_calls[0];
    assert_eq!(call.args, json!({"path": "a.txt"}));
    assert!(call.result.as_ref().unwrap().success);
}

#[tokio::test]
async fn invalid_tool_json_is_reported_not_executed() {
    let h = harness(HarnessOptions {
        passes: vec![
            tool_pass_split("tc_1", "write_file", &["{\"path\": \"x.txt\", \"content"]),
            text_pass("I'll try again later."),
        ],
        prompt: Some(approving_prompt(ApprovalScope::Once)),
        ..HarnessOptions::default()
    })
    .await;

    let reply = h.orchestrator.process_message("write x").await.unwrap();
    assert!(reply.contains("try again"));

    // Nothing executed, nothing written
    assert!(!h.work_dir.join("x.txt").exists());
    let session = h.orchestrator.session_snapshot().await;
    assert!(session.turns[0].tool_calls.is_empty());

    // The model was told why
    let requests = h.provider.recorded_requests();
    let second = &requests[1];
    let failure = second.iter().rev().find(|m| m.role == "tool").unwrap();
    assert!(failure.is_error);
    assert!(failure.content.contains("could not be assembled"));
}

#[tokio::test]
async fn disconnect_discards_in_flight_call() {
    let h = harness(HarnessOptions {
        passes: vec![
            disconnect_pass("tc_1", "bash", "{\"command\": \"echo hi\""),
            text_pass("The stream broke; nothing ran."),
        ],
        prompt: Some(approving_prompt(ApprovalScope::Session)),
        ..HarnessOptions::default()
    })
    .await;

    let reply = h.orchestrator.process_message("run echo").await.unwrap();
    assert!(reply.contains("nothing ran"));

    let session = h.orchestrator.session_snapshot().await;
    assert!(session.turns[0].tool_calls.is_empty());

    let requests = h.provider.recorded_requests();
    let failure = requests[1].iter().rev().find(|m| m.role == "tool").unwrap();
    assert!(failure.is_error);
    assert!(failure.content.contains("disconnected"));
}

#[tokio::test]
async fn tool_call_bound_injects_synthetic_error() {
    let mut passes = Vec::new();
    for i in 0..4 {
        passes.push(tool_pass(
            &format!("tc_{i}"),
            "read_file",
            json!({"path": "a.txt"}),
        ));
    }
    passes.push(text_pass("stopping"));
    let h = harness(HarnessOptions {
        passes,
        max_tool_calls: 2,
        ..HarnessOptions::default()
    })
    .await;
    std::fs::write(h.work_dir.join("a.txt"), "content").unwrap();

    h.orchestrator.process_message("read repeatedly").await.unwrap();

    let session = h.orchestrator.session_snapshot().await;
    let turn = &session.turns[0];
    // Only the first two executed; the bound recorded as a turn error
    assert_eq!(turn.tool_calls.len(), 2);
    assert_eq!(turn.error.as_deref(), Some("tool call limit exceeded"));

    // The synthetic limit notice landed in the conversation record
    assert!(session
        .messages
        .iter()
        .any(|m| m.content.contains("limit reached")));
}

#[tokio::test]
async fn unknown_tool_fails_gracefully() {
    let h = harness(HarnessOptions {
        passes: vec![
            tool_pass("tc_1", "teleport", json!({"target": "moon"})),
            text_pass("no such tool, sorry"),
        ],
        ..HarnessOptions::default()
    })
    .await;

    let reply = h.orchestrator.process_message("teleport me").await.unwrap();
    assert!(reply.contains("no such tool"));

    let session = h.orchestrator.session_snapshot().await;
    let call = &session.turns[0].tool_calls[0];
    let result = call.result.as_ref().unwrap();
    assert!(!result.success);
    assert!(result.output.contains("unknown tool"));
}

#[tokio::test]
async fn fatal_auth_error_ends_turn_with_error() {
    let h = harness(HarnessOptions {
        provider_error: Some(|| MeaoError::Auth("invalid x-api-key".to_string())),
        ..HarnessOptions::default()
    })
    .await;

    let err = h.orchestrator.process_message("hello").await.unwrap_err();
    assert!(matches!(err, MeaoError::Auth(_)));

    settle().await;
    let messages = h.channel.messages();
    let error_msg = messages.iter().find_map(|m| match m {
        ChannelMessage::Error { code, .. } => Some(code.clone()),
        _ => None,
    });
    assert_eq!(error_msg.as_deref(), Some("provider_auth"));

    // Session stays usable: turn recorded with error, orchestrator accepts
    // further messages
    let session = h.orchestrator.session_snapshot().await;
    assert_eq!(session.turns.len(), 1);
    assert!(session.turns[0].error.is_some());
}

#[tokio::test]
async fn channel_sees_ordered_message_flow() {
    let h = harness(HarnessOptions {
        passes: vec![
            tool_pass("tc_1", "read_file", json!({"path": "a.txt"})),
            text_pass("done"),
        ],
        ..HarnessOptions::default()
    })
    .await;
    std::fs::write(h.work_dir.join("a.txt"), "content").unwrap();

    h.orchestrator.process_message("read a.txt").await.unwrap();
    settle().await;

    let messages = h.channel.messages();
    let kinds: Vec<&'static str> = messages
        .iter()
        .map(|m| match m {
            ChannelMessage::UserMessage { .. } => "user",
            ChannelMessage::StreamStart => "stream_start",
            ChannelMessage::StreamDelta { .. } => "delta",
            ChannelMessage::StreamEnd => "stream_end",
            ChannelMessage::ToolUse { .. } => "tool_use",
            ChannelMessage::ToolResult { .. } => "tool_result",
            ChannelMessage::AssistantMessage { .. } => "assistant",
            _ => "other",
        })
        .collect();

    let user = kinds.iter().position(|k| *k == "user").unwrap();
    let tool_use = kinds.iter().position(|k| *k == "tool_use").unwrap();
    let tool_result = kinds.iter().position(|k| *k == "tool_result").unwrap();
    let assistant = kinds.iter().position(|k| *k == "assistant").unwrap();
    assert!(user < tool_use);
    assert!(tool_use < tool_result);
    assert!(tool_result < assistant);
}

#[tokio::test]
async fn second_turn_sees_first_turn_history() {
    let h = harness(HarnessOptions {
        passes: vec![text_pass("my name is meao"), text_pass("you asked my name")],
        ..HarnessOptions::default()
    })
    .await;

    h.orchestrator.process_message("what's your name?").await.unwrap();
    h.orchestrator.process_message("what did I ask?").await.unwrap();

    let requests = h.provider.recorded_requests();
    let second_turn = &requests[1];
    // system + first user + first assistant + second user
    assert!(second_turn.iter().any(|m| m.content.contains("what's your name?")));
    assert!(second_turn.iter().any(|m| m.content.contains("my name is meao")));
    assert_eq!(second_turn.last().unwrap().content, "what did I ask?");
}
