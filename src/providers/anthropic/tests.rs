use super::*;
use crate::providers::base::ToolCallRef;
use std::sync::Mutex as StdMutex;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::with_base_url("test_key".to_string(), None, server.uri())
}

fn simple_request(content: &str) -> ChatRequest<'_> {
    ChatRequest {
        messages: vec![Message::user(content)],
        tools: vec![],
        model: None,
        max_tokens: 1024,
        temperature: 0.7,
    }
}

fn sse_event(event_type: &str, data: Value) -> String {
    format!("event: {}\ndata: {}\n\n", event_type, data)
}

fn text_stream_body() -> String {
    let mut body = String::new();
    body.push_str(&sse_event(
        "message_start",
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 12}}}),
    ));
    body.push_str(&sse_event(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
    ));
    body.push_str(&sse_event(
        "content_block_delta",
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
    ));
    body.push_str(&sse_event(
        "content_block_delta",
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
    ));
    body.push_str(&sse_event(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": 0}),
    ));
    body.push_str(&sse_event(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}}),
    ));
    body.push_str(&sse_event("message_stop", json!({"type": "message_stop"})));
    body
}

/// `{"path": "/tmp/work/a.txt"}` split across six input_json deltas.
fn tool_stream_body() -> String {
    let deltas = ["{\"pa", "th\":", " \"/tm", "p/work", "/a.txt\"", "}"];
    let mut body = String::new();
    body.push_str(&sse_event(
        "message_start",
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 30}}}),
    ));
    body.push_str(&sse_event(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "tool_use", "id": "tc_1", "name": "read_file"}}),
    ));
    for delta in deltas {
        body.push_str(&sse_event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": delta}}),
        ));
    }
    body.push_str(&sse_event(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": 0}),
    ));
    body.push_str(&sse_event(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 18}}),
    ));
    body.push_str(&sse_event("message_stop", json!({"type": "message_stop"})));
    body
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("anthropic-version", API_VERSION))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn streams_text_response() {
    let server = MockServer::start().await;
    mount_stream(&server, text_stream_body()).await;

    let deltas = Arc::new(StdMutex::new(Vec::new()));
    let deltas_cb = deltas.clone();
    let response = provider(&server)
        .create_message_stream(simple_request("Hi"), &move |event| {
            if let StreamEvent::TextDelta { text } = event {
                deltas_cb.lock().unwrap().push(text);
            }
        })
        .await
        .unwrap();

    assert_eq!(response.content.as_deref(), Some("Hello"));
    assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(response.input_tokens, 12);
    assert_eq!(response.output_tokens, 5);
    assert!(response.completed);
    assert_eq!(deltas.lock().unwrap().join(""), "Hello");
}

#[tokio::test]
async fn streams_tool_use_events_in_order() {
    let server = MockServer::start().await;
    mount_stream(&server, tool_stream_body()).await;

    let events = Arc::new(StdMutex::new(Vec::new()));
    let events_cb = events.clone();
    let response = provider(&server)
        .create_message_stream(simple_request("read a file"), &move |event| {
            events_cb.lock().unwrap().push(event);
        })
        .await
        .unwrap();

    assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    assert!(response.completed);

    let events = events.lock().unwrap();
    assert!(matches!(events[0], StreamEvent::MessageStart { input_tokens: 30 }));
    let StreamEvent::ToolUseStart { ref id, ref name } = events[1] else {
        panic!("expected ToolUseStart, got {:?}", events[1]);
    };
    assert_eq!(id, "tc_1");
    assert_eq!(name, "read_file");

    let mut json_buf = String::new();
    let mut stop_id = None;
    for event in events.iter() {
        match event {
            StreamEvent::InputJsonDelta { id, partial_json } => {
                assert_eq!(id, "tc_1");
                json_buf.push_str(partial_json);
            }
            StreamEvent::ContentBlockStop { tool_call_id } => {
                stop_id = tool_call_id.clone();
            }
            _ => {}
        }
    }
    assert_eq!(json_buf, "{\"path\": \"/tmp/work/a.txt\"}");
    assert_eq!(stop_id.as_deref(), Some("tc_1"));
    let parsed: Value = serde_json::from_str(&json_buf).unwrap();
    assert_eq!(parsed["path"], "/tmp/work/a.txt");
}

#[tokio::test]
async fn incomplete_stream_reports_not_completed() {
    let server = MockServer::start().await;
    // Stream ends abruptly before message_stop
    let mut body = String::new();
    body.push_str(&sse_event(
        "message_start",
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 3}}}),
    ));
    body.push_str(&sse_event(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "tool_use", "id": "tc_9", "name": "bash"}}),
    ));
    mount_stream(&server, body).await;

    let response = provider(&server)
        .create_message_stream(simple_request("Hi"), &|_| {})
        .await
        .unwrap();
    assert!(!response.completed);
    assert!(response.stop_reason.is_none());
}

#[tokio::test]
async fn auth_error_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"type": "authentication_error", "message": "Invalid API key"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_message_stream(simple_request("Hi"), &|_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, MeaoError::Auth(_)));
    assert!(err.is_turn_fatal());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_json(json!({
                    "error": {"type": "rate_limit_error", "message": "Rate limit exceeded"}
                })),
        )
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_message_stream(simple_request("Hi"), &|_| {})
        .await
        .unwrap_err();
    match err {
        MeaoError::RateLimit { retry_after } => assert_eq!(retry_after, Some(30)),
        other => panic!("expected RateLimit, got {:?}", other),
    }
}

#[tokio::test]
async fn overloaded_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_message_stream(simple_request("Hi"), &|_| {})
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn context_length_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"type": "invalid_request_error", "message": "prompt is too long: 250000 tokens"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_message_stream(simple_request("Hi"), &|_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, MeaoError::ContextLength(_)));
}

#[tokio::test]
async fn non_streaming_message_parses_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-api-key", "test_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "Hello! How can I help?"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 8}
        })))
        .mount(&server)
        .await;

    let response = provider(&server)
        .create_message(simple_request("Hi"))
        .await
        .unwrap();
    assert_eq!(response.content.as_deref(), Some("Hello! How can I help?"));
    assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(response.input_tokens, 10);
}

#[test]
fn convert_messages_splits_system_and_merges_tool_results() {
    let messages = vec![
        Message::system("You are helpful."),
        Message::user("run two tools"),
        Message::assistant(
            "",
            vec![
                ToolCallRef {
                    id: "a".to_string(),
                    name: "read_file".to_string(),
                    arguments: json!({"path": "x"}),
                },
                ToolCallRef {
                    id: "b".to_string(),
                    name: "bash".to_string(),
                    arguments: json!({"command": "ls"}),
                },
            ],
        ),
        Message::tool_result("a", "contents", false),
        Message::tool_result("b", "listing", false),
    ];
    let (system, converted) = convert_messages(&messages);
    assert_eq!(system.as_deref(), Some("You are helpful."));
    // user, assistant, single merged tool_result message
    assert_eq!(converted.len(), 3);
    let results = converted[2]["content"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["tool_use_id"], "a");
    assert_eq!(results[1]["tool_use_id"], "b");
}

#[test]
fn convert_tools_uses_input_schema() {
    let tools = vec![ToolDefinition {
        name: "read_file".to_string(),
        description: "Read a file".to_string(),
        parameters: json!({"type": "object"}),
    }];
    let converted = convert_tools(&tools);
    assert_eq!(converted[0]["name"], "read_file");
    assert!(converted[0].get("input_schema").is_some());
}
