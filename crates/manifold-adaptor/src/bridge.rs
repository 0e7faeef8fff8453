//! Claude-Messages ↔ Chat-Completions bridging.
//!
//! Callers speaking one dialect routinely land on channels speaking the
//! other. Requests map message blocks, tool blocks, and tool results across
//! dialects with tool-call ids preserved; responses map back, with thinking
//! content extracted from `thinking` / `reasoning_content` / `reasoning` in
//! that precedence.

use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use crate::dialect::claude::{
    ClaudeBlock, ClaudeContent, ClaudeMessage, ClaudeRequest, ClaudeResponse, ClaudeUsage,
};
use crate::dialect::openai::{ChatMessage, ChatRequest, ChatResponse, MessageContent};
use manifold_core::{
    FunctionCall, RelayError, RequestMeta, Result, ToolArguments, ToolCall, ToolCallKind, Usage,
};
use manifold_stream::sse::{SseLineReader, data_of};

// ── Request: Claude → Chat ─────────────────────────────────────

pub fn claude_to_chat(req: &ClaudeRequest) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = req.system_text()
        && !system.is_empty()
    {
        messages.push(ChatMessage {
            role: "system".into(),
            content: Some(MessageContent::Text(system)),
            ..ChatMessage::default()
        });
    }

    for msg in &req.messages {
        match msg.role.as_str() {
            "assistant" => messages.extend(assistant_to_chat(msg)),
            _ => messages.extend(user_to_chat(msg)),
        }
    }

    ChatRequest {
        model: req.model.clone(),
        messages,
        max_tokens: Some(req.max_tokens),
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop: req
            .stop_sequences
            .as_ref()
            .map(|s| Value::Array(s.iter().map(|x| Value::String(x.clone())).collect())),
        stream: req.stream,
        stream_options: None,
        tools: req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t["name"],
                            "description": t["description"],
                            "parameters": t["input_schema"],
                        }
                    })
                })
                .collect()
        }),
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        response_format: None,
        reasoning: None,
        reasoning_effort: None,
        thinking: None,
        extra: Map::new(),
    }
}

fn map_tool_choice(choice: &Value) -> Value {
    match choice["type"].as_str() {
        Some("tool") => json!({"type": "function", "function": {"name": choice["name"]}}),
        Some("any") => Value::String("required".into()),
        Some("none") => Value::String("none".into()),
        _ => Value::String("auto".into()),
    }
}

fn assistant_to_chat(msg: &ClaudeMessage) -> Vec<ChatMessage> {
    let blocks = match &msg.content {
        ClaudeContent::Text(text) => {
            return vec![ChatMessage {
                role: "assistant".into(),
                content: Some(MessageContent::Text(text.clone())),
                ..ChatMessage::default()
            }];
        }
        ClaudeContent::Blocks(blocks) => blocks,
    };

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ClaudeBlock::Text { text: t } => text.push_str(t),
            // Replayed thinking carries no information a chat provider can
            // verify; keep it inline so the model sees its prior chain.
            ClaudeBlock::Thinking { thinking, .. } => {
                text.push_str(&format!("<think>{thinking}</think>"));
            }
            ClaudeBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: ToolCallKind::Function,
                function: Some(FunctionCall {
                    name: name.clone(),
                    arguments: ToolArguments::Text(input.to_string()),
                }),
                mcp: None,
                index: None,
            }),
            _ => {}
        }
    }

    vec![ChatMessage {
        role: "assistant".into(),
        content: if text.is_empty() {
            None
        } else {
            Some(MessageContent::Text(text))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        ..ChatMessage::default()
    }]
}

/// User messages may interleave text with tool results; tool results become
/// separate `tool`-role messages with their ids preserved.
fn user_to_chat(msg: &ClaudeMessage) -> Vec<ChatMessage> {
    let blocks = match &msg.content {
        ClaudeContent::Text(text) => {
            return vec![ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::Text(text.clone())),
                ..ChatMessage::default()
            }];
        }
        ClaudeContent::Blocks(blocks) => blocks,
    };

    let mut out = Vec::new();
    let mut text = String::new();
    for block in blocks {
        match block {
            ClaudeBlock::Text { text: t } => text.push_str(t),
            ClaudeBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(ChatMessage {
                role: "tool".into(),
                tool_call_id: Some(tool_use_id.clone()),
                content: Some(MessageContent::Text(tool_result_text(content))),
                ..ChatMessage::default()
            }),
            ClaudeBlock::Image { source } => {
                // Carried through as an image part on the user message.
                out.push(ChatMessage {
                    role: "user".into(),
                    content: Some(MessageContent::Parts(vec![json!({
                        "type": "image_url",
                        "image_url": {"url": image_url_of(source)},
                    })])),
                    ..ChatMessage::default()
                });
            }
            _ => {}
        }
    }
    if !text.is_empty() {
        out.push(ChatMessage {
            role: "user".into(),
            content: Some(MessageContent::Text(text)),
            ..ChatMessage::default()
        });
    }
    out
}

/// Tool results arrive as strings, arrays of blocks, or bare objects; chat
/// providers want one string. An empty projection JSON-encodes the original.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let projected: String = blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("");
            if projected.is_empty() {
                content.to_string()
            } else {
                projected
            }
        }
        other => other.to_string(),
    }
}

fn image_url_of(source: &Value) -> String {
    if source["type"] == "url" {
        return source["url"].as_str().unwrap_or_default().to_string();
    }
    format!(
        "data:{};base64,{}",
        source["media_type"].as_str().unwrap_or("image/png"),
        source["data"].as_str().unwrap_or_default()
    )
}

// ── Response: Chat → Claude ────────────────────────────────────

pub fn chat_response_to_claude(resp: &ChatResponse, meta: &RequestMeta) -> ClaudeResponse {
    let mut content = Vec::new();
    let mut stop_reason = "end_turn".to_string();

    if let Some(choice) = resp.choices.first() {
        if let Some(thinking) = extract_thinking(&choice.message) {
            content.push(ClaudeBlock::Thinking {
                thinking,
                signature: None,
            });
        }
        let text = choice.message.string_content();
        if !text.is_empty() {
            content.push(ClaudeBlock::Text { text });
        }
        for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
            let Some(function) = &call.function else {
                continue;
            };
            content.push(ClaudeBlock::ToolUse {
                id: call.id.clone(),
                name: function.name.clone(),
                input: serde_json::from_str(&function.arguments.as_text())
                    .unwrap_or(Value::Object(Map::new())),
            });
        }
        stop_reason = map_finish_reason(choice.finish_reason.as_deref());
    }

    let usage = resp.usage.clone().unwrap_or_default();
    ClaudeResponse {
        id: format!("msg_{}", meta.request_id),
        kind: "message".into(),
        role: "assistant".into(),
        model: meta.origin_model.clone(),
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: ClaudeUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: usage.cached_tokens,
            cache_creation_input_tokens: None,
        },
        extra: Map::new(),
    }
}

/// Thinking content precedence: `thinking`, then `reasoning_content`, then
/// `reasoning`.
fn extract_thinking(msg: &ChatMessage) -> Option<String> {
    if let Some(t) = msg.extra.get("thinking").and_then(Value::as_str)
        && !t.is_empty()
    {
        return Some(t.to_string());
    }
    if let Some(t) = msg.reasoning_content.as_deref()
        && !t.is_empty()
    {
        return Some(t.to_string());
    }
    msg.extra
        .get("reasoning")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn map_finish_reason(finish: Option<&str>) -> String {
    match finish {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("stop_sequence") => "stop_sequence",
        _ => "end_turn",
    }
    .to_string()
}

// ── Streaming: Chat SSE → Claude SSE ───────────────────────────

// ── Request: Chat → Claude ─────────────────────────────────────

/// The reverse bridge: a Chat-Completions caller landing on a channel that
/// speaks Claude Messages natively.
pub fn chat_to_claude(req: &ChatRequest) -> ClaudeRequest {
    let mut system = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => system.push(msg.string_content()),
            "tool" => {
                let block = ClaudeBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: Value::String(msg.string_content()),
                    is_error: None,
                };
                // Claude wants tool results on a user turn; append to the
                // previous one when it is already a user block list.
                match messages.last_mut() {
                    Some(ClaudeMessage {
                        role,
                        content: ClaudeContent::Blocks(blocks),
                    }) if role == "user" => blocks.push(block),
                    _ => messages.push(ClaudeMessage {
                        role: "user".into(),
                        content: ClaudeContent::Blocks(vec![block]),
                    }),
                }
            }
            "assistant" => {
                let mut blocks = Vec::new();
                let text = msg.string_content();
                if !text.is_empty() {
                    blocks.push(ClaudeBlock::Text { text });
                }
                for call in msg.tool_calls.as_deref().unwrap_or_default() {
                    let Some(function) = &call.function else { continue };
                    blocks.push(ClaudeBlock::ToolUse {
                        id: call.id.clone(),
                        name: function.name.clone(),
                        input: serde_json::from_str(&function.arguments.as_text())
                            .unwrap_or(Value::Object(Map::new())),
                    });
                }
                if !blocks.is_empty() {
                    messages.push(ClaudeMessage {
                        role: "assistant".into(),
                        content: ClaudeContent::Blocks(blocks),
                    });
                }
            }
            _ => messages.push(ClaudeMessage {
                role: "user".into(),
                content: ClaudeContent::Text(msg.string_content()),
            }),
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t["function"]["name"],
                    "description": t["function"]["description"],
                    "input_schema": t["function"]["parameters"],
                })
            })
            .collect()
    });

    ClaudeRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.or(req.max_completion_tokens).unwrap_or(4096),
        messages,
        system: if system.is_empty() {
            None
        } else {
            Some(Value::String(system.join("\n")))
        },
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop.as_ref().map(|stop| match stop {
            Value::String(s) => vec![s.clone()],
            Value::Array(a) => a
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => vec![],
        }),
        thinking: None,
        tools,
        tool_choice: req.tool_choice.as_ref().map(|choice| match choice {
            Value::String(s) if s == "required" => json!({"type": "any"}),
            Value::String(s) if s == "none" => json!({"type": "none"}),
            Value::String(_) => json!({"type": "auto"}),
            obj => json!({"type": "tool", "name": obj["function"]["name"]}),
        }),
        metadata: None,
        extra: Map::new(),
    }
}

// ── Response: Claude → Chat ────────────────────────────────────

pub fn claude_response_to_chat(resp: &ClaudeResponse, meta: &RequestMeta) -> ChatResponse {
    let mut text = String::new();
    let mut reasoning: Option<String> = None;
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ClaudeBlock::Text { text: t } => text.push_str(t),
            ClaudeBlock::Thinking { thinking, .. } => {
                reasoning.get_or_insert_with(String::new).push_str(thinking);
            }
            ClaudeBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: ToolCallKind::Function,
                function: Some(FunctionCall {
                    name: name.clone(),
                    arguments: ToolArguments::Text(input.to_string()),
                }),
                mcp: None,
                index: None,
            }),
            _ => {}
        }
    }

    let finish_reason = match resp.stop_reason.as_deref() {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("stop_sequence") => "stop",
        _ => "stop",
    };

    let mut usage = Usage {
        prompt_tokens: resp.usage.input_tokens,
        completion_tokens: resp.usage.output_tokens,
        cached_tokens: resp.usage.cache_read_input_tokens,
        ..Default::default()
    };
    usage.ensure_total();

    ChatResponse {
        id: format!("chatcmpl-{}", meta.request_id),
        object: "chat.completion".into(),
        created: chrono::Utc::now().timestamp(),
        model: meta.origin_model.clone(),
        choices: vec![crate::dialect::openai::ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".into(),
                content: Some(MessageContent::Text(text)),
                reasoning_content: reasoning,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                ..ChatMessage::default()
            },
            finish_reason: Some(finish_reason.to_string()),
            extra: Map::new(),
        }],
        usage: Some(usage),
        extra: Map::new(),
    }
}

/// Pump an upstream Claude SSE stream to a Chat-Completions caller,
/// synthesizing chat chunks.
pub async fn pump_claude_to_chat(
    response: reqwest::Response,
    meta: &RequestMeta,
    tx: &mpsc::Sender<String>,
) -> Result<Usage> {
    let mut reader = SseLineReader::new();
    let mut stream = response.bytes_stream();

    let mut usage = Usage {
        prompt_tokens: meta.prompt_tokens,
        ..Default::default()
    };
    let mut text_len = 0usize;
    let mut chunks = 0u64;
    let mut finish_reason = "stop".to_string();
    let mut tool_index: i64 = -1;

    'outer: while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| RelayError::transport(format!("upstream read: {e}")))?;
        for line in reader.feed(&bytes) {
            let Some(data) = data_of(&line) else { continue };
            let Ok(event) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            chunks += 1;
            match event["type"].as_str() {
                Some("message_start") => {
                    if let Some(input) = event["message"]["usage"]["input_tokens"].as_u64() {
                        usage.prompt_tokens = input;
                    }
                }
                Some("content_block_start") => {
                    if event["content_block"]["type"] == "tool_use" {
                        tool_index += 1;
                        finish_reason = "tool_calls".into();
                        send_chat_chunk(
                            tx,
                            meta,
                            json!({"tool_calls": [{
                                "index": tool_index,
                                "id": event["content_block"]["id"],
                                "type": "function",
                                "function": {"name": event["content_block"]["name"], "arguments": ""},
                            }]}),
                            None,
                        )
                        .await;
                    }
                }
                Some("content_block_delta") => match event["delta"]["type"].as_str() {
                    Some("text_delta") => {
                        let text = event["delta"]["text"].as_str().unwrap_or_default();
                        text_len += text.len();
                        send_chat_chunk(tx, meta, json!({"content": text}), None).await;
                    }
                    Some("thinking_delta") => {
                        let text = event["delta"]["thinking"].as_str().unwrap_or_default();
                        send_chat_chunk(
                            tx,
                            meta,
                            json!({(meta.reasoning_format.field()): text}),
                            None,
                        )
                        .await;
                    }
                    Some("input_json_delta") => {
                        send_chat_chunk(
                            tx,
                            meta,
                            json!({"tool_calls": [{
                                "index": tool_index.max(0),
                                "function": {"arguments": event["delta"]["partial_json"]},
                            }]}),
                            None,
                        )
                        .await;
                    }
                    _ => {}
                },
                Some("message_delta") => {
                    if let Some(stop) = event["delta"]["stop_reason"].as_str() {
                        finish_reason = match stop {
                            "max_tokens" => "length",
                            "tool_use" => "tool_calls",
                            _ => "stop",
                        }
                        .into();
                    }
                    if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                        usage.completion_tokens = output;
                    }
                }
                Some("message_stop") => break 'outer,
                Some("error") => {
                    let message = event["error"]["message"].as_str().unwrap_or("stream error");
                    return Err(RelayError::server(500, message.to_string()).with_raw(data));
                }
                _ => {}
            }
        }
    }

    if chunks == 0 {
        return Err(RelayError::server(502, "empty stream from upstream"));
    }

    if usage.completion_tokens == 0 {
        usage.completion_tokens = (text_len as u64).div_ceil(4);
    }
    usage.ensure_total();

    send_chat_chunk(tx, meta, json!({}), Some(&finish_reason)).await;
    let _ = tx.send("data: [DONE]\n\n".to_string()).await;
    Ok(usage)
}

async fn send_chat_chunk(
    tx: &mpsc::Sender<String>,
    meta: &RequestMeta,
    delta: Value,
    finish_reason: Option<&str>,
) {
    let chunk = json!({
        "id": format!("chatcmpl-{}", meta.request_id),
        "object": "chat.completion.chunk",
        "model": meta.origin_model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    let _ = tx.send(format!("data: {chunk}\n\n")).await;
}

#[derive(PartialEq)]
enum OpenBlock {
    None,
    Thinking,
    Text,
    Tool(u32),
}

/// Pump an upstream chat-completions SSE stream to a Claude-dialect caller,
/// synthesizing the Claude event sequence. Single reader, single writer.
pub async fn pump_chat_to_claude(
    response: reqwest::Response,
    meta: &RequestMeta,
    tx: &mpsc::Sender<String>,
) -> Result<Usage> {
    let mut reader = SseLineReader::new();
    let mut stream = response.bytes_stream();

    let mut block_index: u32 = 0;
    let mut open = OpenBlock::None;
    let mut text_len = 0usize;
    let mut args_len = 0usize;
    let mut usage: Option<Usage> = None;
    let mut finish_reason: Option<String> = None;
    let mut chunks = 0u64;

    send_event(
        tx,
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", meta.request_id),
                "type": "message",
                "role": "assistant",
                "model": meta.origin_model,
                "content": [],
                "usage": {"input_tokens": meta.prompt_tokens, "output_tokens": 0},
            }
        }),
    )
    .await;

    'outer: while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| RelayError::transport(format!("upstream read: {e}")))?;
        for line in reader.feed(&bytes) {
            let Some(data) = data_of(&line) else { continue };
            if data.trim() == "[DONE]" {
                break 'outer;
            }
            let Ok(event) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(err) = crate::adaptor::detect_error_envelope(500, &event) {
                return Err(err);
            }
            chunks += 1;

            if let Some(u) = crate::adaptor::extract_usage(&event) {
                usage = Some(u);
            }

            let Some(choice) = event["choices"].as_array().and_then(|c| c.first()) else {
                continue;
            };
            if let Some(fr) = choice["finish_reason"].as_str() {
                finish_reason = Some(fr.to_string());
            }
            let delta = &choice["delta"];

            // Reasoning-capable chat providers stream the chain in one of
            // these fields; it becomes a thinking block for the caller,
            // mirroring the thinking_delta mapping in the other direction.
            let reasoning = ["reasoning_content", "thinking", "reasoning"]
                .iter()
                .find_map(|f| delta[*f].as_str().filter(|t| !t.is_empty()));
            if let Some(text) = reasoning {
                if open != OpenBlock::Thinking {
                    close_block(tx, &mut open, &mut block_index).await;
                    send_event(
                        tx,
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {"type": "thinking", "thinking": ""},
                        }),
                    )
                    .await;
                    open = OpenBlock::Thinking;
                }
                send_event(
                    tx,
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }),
                )
                .await;
            }

            if let Some(text) = delta["content"].as_str()
                && !text.is_empty()
            {
                if open != OpenBlock::Text {
                    close_block(tx, &mut open, &mut block_index).await;
                    send_event(
                        tx,
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {"type": "text", "text": ""},
                        }),
                    )
                    .await;
                    open = OpenBlock::Text;
                }
                text_len += text.len();
                send_event(
                    tx,
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                )
                .await;
            }

            for call in delta["tool_calls"].as_array().unwrap_or(&Vec::new()) {
                let call_index = call["index"].as_u64().unwrap_or(0) as u32;
                if open != OpenBlock::Tool(call_index) {
                    close_block(tx, &mut open, &mut block_index).await;
                    send_event(
                        tx,
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": call["id"].as_str().unwrap_or_default(),
                                "name": call["function"]["name"].as_str().unwrap_or_default(),
                                "input": {},
                            },
                        }),
                    )
                    .await;
                    open = OpenBlock::Tool(call_index);
                }
                if let Some(fragment) = call["function"]["arguments"].as_str()
                    && !fragment.is_empty()
                {
                    args_len += fragment.len();
                    send_event(
                        tx,
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": {"type": "input_json_delta", "partial_json": fragment},
                        }),
                    )
                    .await;
                }
            }
        }
    }

    if chunks == 0 && text_len == 0 && args_len == 0 {
        return Err(RelayError::server(502, "empty stream from upstream"));
    }

    close_block(tx, &mut open, &mut block_index).await;

    let mut usage = usage.unwrap_or_else(|| {
        let mut u = Usage {
            prompt_tokens: meta.prompt_tokens,
            completion_tokens: ((text_len + args_len) as u64).div_ceil(4),
            ..Default::default()
        };
        u.ensure_total();
        u
    });
    usage.ensure_total();

    send_event(
        tx,
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": map_finish_reason(finish_reason.as_deref())},
            "usage": {"output_tokens": usage.completion_tokens},
        }),
    )
    .await;
    send_event(tx, "message_stop", json!({"type": "message_stop"})).await;

    Ok(usage)
}

async fn close_block(tx: &mpsc::Sender<String>, open: &mut OpenBlock, block_index: &mut u32) {
    if *open == OpenBlock::None {
        return;
    }
    send_event(
        tx,
        "content_block_stop",
        json!({"type": "content_block_stop", "index": *block_index}),
    )
    .await;
    *block_index += 1;
    *open = OpenBlock::None;
}

async fn send_event(tx: &mpsc::Sender<String>, event: &str, payload: Value) {
    let _ = tx.send(format!("event: {event}\ndata: {payload}\n\n")).await;
}
