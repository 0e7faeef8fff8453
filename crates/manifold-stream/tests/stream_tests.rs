use manifold_core::ReasoningFormat;
use manifold_stream::{ChunkAction, StreamContext};
use serde_json::json;

fn chat_chunk(content: &str) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}}]
    })
    .to_string()
}

fn tool_chunk(index: u32, fragment: &str) -> String {
    json!({
        "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": index, "function": {"arguments": fragment}}
        ]}}]
    })
    .to_string()
}

#[test]
fn content_accumulates_in_order() {
    let mut ctx = StreamContext::new(10);
    for part in ["Hel", "lo, ", "world"] {
        let action = ctx.process_data(&chat_chunk(part)).unwrap();
        assert!(matches!(action, ChunkAction::Emit(_)));
    }
    assert_eq!(ctx.response_text(), "Hello, world");
}

#[test]
fn tool_arguments_accumulate_per_index() {
    let mut ctx = StreamContext::new(10);
    for fragment in [r#"{"location":"#, r#" "Paris""#, r#"}"#] {
        ctx.process_data(&tool_chunk(0, fragment)).unwrap();
    }
    ctx.process_data(&tool_chunk(1, r#"{"unit":"c"}"#)).unwrap();

    assert_eq!(ctx.tool_arguments(0), Some(r#"{"location": "Paris"}"#));
    assert_eq!(ctx.tool_arguments(1), Some(r#"{"unit":"c"}"#));
}

#[test]
fn missing_tool_index_defaults_to_zero() {
    let mut ctx = StreamContext::new(1);
    let chunk = json!({
        "choices": [{"delta": {"tool_calls": [{"function": {"arguments": "{\"a\":1}"}}]}}]
    })
    .to_string();
    ctx.process_data(&chunk).unwrap();
    assert_eq!(ctx.tool_arguments(0), Some("{\"a\":1}"));
}

#[test]
fn done_marker_terminates() {
    let mut ctx = StreamContext::new(1);
    ctx.process_data(&chat_chunk("x")).unwrap();
    assert_eq!(ctx.process_data("[DONE]").unwrap(), ChunkAction::Done);
    assert!(ctx.done);
}

#[test]
fn response_api_completion_is_terminal() {
    let mut ctx = StreamContext::new(1);
    let action = ctx
        .process_data(&json!({"type": "response.completed", "response": {"status": "completed"}}).to_string())
        .unwrap();
    assert!(matches!(action, ChunkAction::EmitFinal(_)));
    assert!(ctx.done);
}

#[test]
fn usage_fallback_is_ceil_len_over_four() {
    let mut ctx = StreamContext::new(7);
    // 13 chars of content + 8 of tool args = 21 → ceil(21/4) = 6
    ctx.process_data(&chat_chunk("thirteen chs!")).unwrap();
    ctx.process_data(&tool_chunk(0, r#"{"a":1}8"#)).unwrap();
    let usage = ctx.finalize().unwrap();
    assert_eq!(usage.completion_tokens, 6);
    assert_eq!(usage.prompt_tokens, 7);
    assert_eq!(usage.total_tokens, 13);
}

#[test]
fn upstream_usage_wins_over_fallback() {
    let mut ctx = StreamContext::new(7);
    ctx.process_data(&chat_chunk("some text")).unwrap();
    ctx.process_data(
        &json!({"choices": [], "usage": {"prompt_tokens": 42, "completion_tokens": 17}}).to_string(),
    )
    .unwrap();
    let usage = ctx.finalize().unwrap();
    assert_eq!(usage.prompt_tokens, 42);
    assert_eq!(usage.completion_tokens, 17);
    assert_eq!(usage.total_tokens, 59);
}

#[test]
fn empty_stream_is_fatal() {
    let mut ctx = StreamContext::new(5);
    let err = ctx.finalize().unwrap_err();
    assert_eq!(err.status, 502);
}

#[test]
fn error_event_surfaces_immediately() {
    let mut ctx = StreamContext::new(5);
    let err = ctx
        .process_data(&json!({"type": "error", "error": {"message": "overloaded", "status": 529}}).to_string())
        .unwrap_err();
    assert_eq!(err.status, 529);
    assert!(err.message.contains("overloaded"));
}

#[test]
fn empty_error_object_is_ignored() {
    let mut ctx = StreamContext::new(5);
    let chunk = json!({
        "choices": [{"delta": {"content": "fine"}}],
        "error": {"message": ""}
    })
    .to_string();
    assert!(ctx.process_data(&chunk).is_ok());
    assert_eq!(ctx.response_text(), "fine");
}

#[test]
fn finish_reason_length_marks_truncated_not_error() {
    let mut ctx = StreamContext::new(5);
    ctx.process_data(&chat_chunk("partial")).unwrap();
    ctx.process_data(
        &json!({"choices": [{"delta": {}, "finish_reason": "length"}]}).to_string(),
    )
    .unwrap();
    assert!(ctx.truncated());
    assert!(ctx.finalize().is_ok());
}

// ── Thinking extraction through the processor ──────────────────

#[test]
fn think_block_moves_to_reasoning_content() {
    let mut ctx = StreamContext::new(5).with_thinking(ReasoningFormat::ReasoningContent);
    let action = ctx
        .process_data(&chat_chunk("<think>plan</think>answer"))
        .unwrap();
    let ChunkAction::Emit(payload) = action else {
        panic!("expected emit");
    };
    let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(v["choices"][0]["delta"]["content"], "answer");
    assert_eq!(v["choices"][0]["delta"]["reasoning_content"], "plan");
    assert!(v["choices"][0]["delta"].get("thinking").is_none());
    assert_eq!(ctx.response_text(), "answer");
}

#[test]
fn reasoning_format_selects_output_field() {
    let mut ctx = StreamContext::new(5).with_thinking(ReasoningFormat::Thinking);
    let action = ctx
        .process_data(&chat_chunk("<think>t</think>c"))
        .unwrap();
    let ChunkAction::Emit(payload) = action else {
        panic!("expected emit");
    };
    let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(v["choices"][0]["delta"]["thinking"], "t");
    assert!(v["choices"][0]["delta"].get("reasoning_content").is_none());
}

#[test]
fn explicit_reasoning_field_is_normalized() {
    let mut ctx = StreamContext::new(5).with_thinking(ReasoningFormat::Reasoning);
    let chunk = json!({
        "choices": [{"delta": {"content": "body", "reasoning_content": "chain"}}]
    })
    .to_string();
    let ChunkAction::Emit(payload) = ctx.process_data(&chunk).unwrap() else {
        panic!("expected emit");
    };
    let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(v["choices"][0]["delta"]["reasoning"], "chain");
    assert!(v["choices"][0]["delta"].get("reasoning_content").is_none());
    assert_eq!(v["choices"][0]["delta"]["content"], "body");
}

#[test]
fn held_tag_prefix_is_flushed_at_stream_end() {
    let mut ctx = StreamContext::new(5).with_thinking(ReasoningFormat::ReasoningContent);
    // The trailing "<" could open a think tag, so it is held back…
    ctx.process_data(&chat_chunk("answer <")).unwrap();
    assert_eq!(ctx.response_text(), "answer ");

    // …until the stream ends, when it flushes as one last delta.
    let payload = ctx.flush_thinking().unwrap();
    let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(v["choices"][0]["delta"]["content"], "<");
    assert_eq!(ctx.response_text(), "answer <");
    assert!(ctx.flush_thinking().is_none());

    // The flushed byte counts toward the estimate: ceil(8/4) = 2.
    let usage = ctx.finalize().unwrap();
    assert_eq!(usage.completion_tokens, 2);
}

#[test]
fn unflushed_tail_still_counts_in_finalize() {
    let mut ctx = StreamContext::new(5).with_thinking(ReasoningFormat::ReasoningContent);
    ctx.process_data(&chat_chunk("four <t")).unwrap();
    // finalize() drains the carry itself when no flush was emitted.
    let usage = ctx.finalize().unwrap();
    assert_eq!(usage.completion_tokens, 2);
}

#[test]
fn claude_input_json_delta_accumulates() {
    let mut ctx = StreamContext::new(5);
    for fragment in [r#"{"city""#, r#":"SF"}"#] {
        let chunk = json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": fragment}
        })
        .to_string();
        ctx.process_data(&chunk).unwrap();
    }
    assert_eq!(ctx.tool_arguments(1), Some(r#"{"city":"SF"}"#));
}
