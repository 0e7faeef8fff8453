use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::builder::BoundedBuilder;
use crate::sse::{SseLineReader, data_of};
use crate::thinking::ThinkingProcessor;
use manifold_core::{ReasoningFormat, RelayError, Result, Usage};

/// What to do with one processed SSE record.
#[derive(Debug, PartialEq)]
pub enum ChunkAction {
    /// Re-emit this payload downstream.
    Emit(String),
    /// Swallow (keep-alives, event lines).
    Skip,
    /// Emit this payload, then the stream is over.
    EmitFinal(String),
    /// Terminal marker with nothing left to emit.
    Done,
}

/// Per-stream state threaded through the pump loop by reference — a plain
/// value, not a callback graph, so cancellation and backpressure stay
/// simple.
pub struct StreamContext {
    text: BoundedBuilder,
    /// Tool-call argument fragments accumulated per streaming `index`.
    tool_args: BTreeMap<u32, BoundedBuilder>,
    usage: Option<Usage>,
    pub chunks_processed: u64,
    pub done: bool,
    thinking: Option<ThinkingProcessor>,
    reasoning_format: ReasoningFormat,
    prompt_tokens: u64,
    truncated: bool,
    emit_done_marker: bool,
    /// `type` of the last processed event, for dialects whose SSE records
    /// carry an `event:` line (Claude Messages).
    last_event_type: Option<String>,
}

impl StreamContext {
    pub fn new(prompt_tokens: u64) -> Self {
        Self {
            text: BoundedBuilder::new(),
            tool_args: BTreeMap::new(),
            usage: None,
            chunks_processed: 0,
            done: false,
            thinking: None,
            reasoning_format: ReasoningFormat::default(),
            prompt_tokens,
            truncated: false,
            emit_done_marker: true,
            last_event_type: None,
        }
    }

    /// Suppress the trailing `data: [DONE]` for dialects that end on their
    /// own terminal event (Claude Messages).
    pub fn without_done_marker(mut self) -> Self {
        self.emit_done_marker = false;
        self
    }

    pub fn emits_done_marker(&self) -> bool {
        self.emit_done_marker
    }

    /// Render one outgoing SSE record. Dialects without a DONE marker get
    /// their `event:` line reconstructed from the payload type.
    fn render_record(&self, payload: &str) -> String {
        match (&self.last_event_type, self.emit_done_marker) {
            (Some(event), false) => format!("event: {event}\ndata: {payload}\n\n"),
            _ => format!("data: {payload}\n\n"),
        }
    }

    /// Enable `<think>` extraction, carrying reasoning in `format`'s field.
    pub fn with_thinking(mut self, format: ReasoningFormat) -> Self {
        self.thinking = Some(ThinkingProcessor::new());
        self.reasoning_format = format;
        self
    }

    pub fn response_text(&self) -> &str {
        self.text.as_str()
    }

    /// Finalized argument string for one tool index.
    pub fn tool_arguments(&self, index: u32) -> Option<&str> {
        self.tool_args.get(&index).map(BoundedBuilder::as_str)
    }

    /// Process one SSE data payload.
    pub fn process_data(&mut self, data: &str) -> Result<ChunkAction> {
        if data.trim() == "[DONE]" {
            self.done = true;
            return Ok(ChunkAction::Done);
        }

        let Ok(mut event) = serde_json::from_str::<Value>(data) else {
            // Not JSON; relay verbatim rather than guess.
            self.chunks_processed += 1;
            return Ok(ChunkAction::Emit(data.to_string()));
        };

        // Error events surface immediately, status carried from the event.
        if event["type"] == "error" || (event.get("error").is_some_and(|e| !error_is_empty(e))) {
            let obj = &event["error"];
            let status = obj["status"]
                .as_u64()
                .or_else(|| event["status"].as_u64())
                .unwrap_or(500) as u16;
            let message = obj["message"].as_str().unwrap_or("upstream stream error");
            return Err(RelayError::server(status, message.to_string()).with_raw(data));
        }

        self.chunks_processed += 1;
        self.last_event_type = event["type"].as_str().map(str::to_string);
        self.absorb_usage(&event);
        self.absorb_text_deltas(&mut event);
        self.absorb_tool_deltas(&event);
        self.absorb_finish_reason(&event);

        let rendered = event.to_string();
        if is_terminal_event(&event) {
            self.done = true;
            return Ok(ChunkAction::EmitFinal(rendered));
        }
        Ok(ChunkAction::Emit(rendered))
    }

    /// Drain the thinking processor's held-back tail once no more bytes are
    /// coming. Returns a final delta payload to emit when the tail was
    /// non-empty; the flushed content also counts toward the completion
    /// estimate. Idempotent: a second call finds nothing to flush.
    pub fn flush_thinking(&mut self) -> Option<String> {
        let tp = self.thinking.as_mut()?;
        let (content, reasoning) = tp.finish();
        if content.is_empty() && reasoning.is_empty() {
            return None;
        }
        self.text.push_str(&content);

        let mut delta = Map::new();
        if !content.is_empty() {
            delta.insert("content".into(), Value::String(content));
        }
        if !reasoning.is_empty() {
            delta.insert(
                self.reasoning_format.field().into(),
                Value::String(reasoning),
            );
        }
        Some(json!({"choices": [{"index": 0, "delta": delta}]}).to_string())
    }

    /// Close out the stream: prefer upstream-reported usage, otherwise
    /// synthesize from the accumulated builders and the prompt estimate.
    pub fn finalize(&mut self) -> Result<Usage> {
        // A tail the pump did not flush still belongs to the content count.
        if let Some(tp) = &mut self.thinking {
            let (content, _) = tp.finish();
            self.text.push_str(&content);
        }

        if self.chunks_processed == 0 && self.text.is_empty() && self.tool_args.is_empty() {
            return Err(RelayError::server(502, "empty stream from upstream"));
        }

        if let Some(mut usage) = self.usage.take() {
            if usage.completion_tokens == 0 && !self.text.is_empty() {
                usage.completion_tokens = self.estimate_completion();
            }
            if usage.prompt_tokens == 0 {
                usage.prompt_tokens = self.prompt_tokens;
            }
            usage.ensure_total();
            return Ok(usage);
        }

        let mut usage = Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.estimate_completion(),
            ..Default::default()
        };
        usage.ensure_total();
        debug!(
            completion_tokens = usage.completion_tokens,
            "upstream omitted usage, synthesized from accumulated content"
        );
        Ok(usage)
    }

    /// Whether the upstream stopped for length. Still a success for billing.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn estimate_completion(&self) -> u64 {
        let args_len: usize = self.tool_args.values().map(BoundedBuilder::len).sum();
        ((self.text.len() + args_len) as u64).div_ceil(4)
    }

    fn absorb_usage(&mut self, event: &Value) {
        for candidate in [
            &event["usage"],
            &event["response"]["usage"],
            &event["message"]["usage"],
        ] {
            if !candidate.is_object() {
                continue;
            }
            let prompt = candidate["prompt_tokens"]
                .as_u64()
                .or_else(|| candidate["input_tokens"].as_u64());
            let completion = candidate["completion_tokens"]
                .as_u64()
                .or_else(|| candidate["output_tokens"].as_u64());
            if prompt.is_none() && completion.is_none() {
                continue;
            }
            let entry = self.usage.get_or_insert_with(Usage::default);
            if let Some(p) = prompt {
                entry.prompt_tokens = p;
            }
            if let Some(c) = completion {
                entry.completion_tokens = c;
            }
            if let Some(t) = candidate["total_tokens"].as_u64() {
                entry.total_tokens = t;
            }
            if let Some(cached) = candidate["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .or_else(|| candidate["cache_read_input_tokens"].as_u64())
            {
                entry.cached_tokens = Some(cached);
            }
        }
    }

    /// Accumulate content deltas and run thinking extraction in place.
    fn absorb_text_deltas(&mut self, event: &mut Value) {
        // OpenAI chat chunk: choices[].delta.content
        if let Some(choices) = event["choices"].as_array_mut() {
            for choice in choices {
                let delta = &mut choice["delta"];
                if !delta.is_object() {
                    continue;
                }
                let explicit_reasoning = take_reasoning_fields(delta);
                let raw = delta["content"].as_str().map(str::to_string);
                let (content, mut reasoning) = match (&mut self.thinking, raw) {
                    (Some(tp), Some(text)) => tp.process_delta(&text),
                    (None, Some(text)) => (text, String::new()),
                    (_, None) => (String::new(), String::new()),
                };
                if let Some(explicit) = explicit_reasoning {
                    reasoning.push_str(&explicit);
                }
                self.text.push_str(&content);
                if delta.get("content").is_some() {
                    delta["content"] = Value::String(content);
                }
                if !reasoning.is_empty() {
                    delta[self.reasoning_format.field()] = Value::String(reasoning);
                }
            }
            return;
        }

        // Claude content_block_delta text_delta
        if event["type"] == "content_block_delta" {
            if let Some(text) = event["delta"]["text"].as_str() {
                self.text.push_str(text);
            }
            if let Some(partial) = event["delta"]["partial_json"].as_str() {
                let index = event["index"].as_u64().unwrap_or(0) as u32;
                self.tool_args.entry(index).or_default().push_str(partial);
            }
            return;
        }

        // Response API output text delta
        if event["type"] == "response.output_text.delta"
            && let Some(text) = event["delta"].as_str()
        {
            self.text.push_str(text);
        }
    }

    fn absorb_tool_deltas(&mut self, event: &Value) {
        let Some(choices) = event["choices"].as_array() else {
            return;
        };
        for choice in choices {
            let Some(calls) = choice["delta"]["tool_calls"].as_array() else {
                continue;
            };
            for call in calls {
                // Missing index means a provider that only ever streams one
                // call; treat it as index 0.
                let index = call["index"].as_u64().unwrap_or(0) as u32;
                let builder = self.tool_args.entry(index).or_default();
                match &call["function"]["arguments"] {
                    Value::String(fragment) => builder.push_str(fragment),
                    Value::Object(_) => builder.push_str(&call["function"]["arguments"].to_string()),
                    _ => {}
                }
            }
        }
    }

    fn absorb_finish_reason(&mut self, event: &Value) {
        let finish = event["choices"]
            .as_array()
            .and_then(|cs| cs.first())
            .and_then(|c| c["finish_reason"].as_str());
        let stop = event["delta"]["stop_reason"]
            .as_str()
            .or_else(|| event["stop_reason"].as_str());
        if finish == Some("length") || stop == Some("max_tokens") {
            self.truncated = true;
        }
    }
}

/// Terminal shapes beyond `[DONE]`: Response-API lifecycle events and plain
/// `done` markers.
fn is_terminal_event(event: &Value) -> bool {
    if let Some(kind) = event["type"].as_str()
        && matches!(
            kind,
            "response.completed" | "response.cancelled" | "response.error" | "done" | "message_stop"
        )
    {
        return true;
    }
    event["response"]["status"] == "completed"
}

/// Providers that report an empty error object alongside real content
/// (`{"error":{"message":"",…}}`) are not reporting an error.
fn error_is_empty(error: &Value) -> bool {
    match error {
        Value::Null => true,
        Value::Object(map) => map
            .get("message")
            .map(|m| m.as_str().unwrap_or_default().is_empty())
            .unwrap_or(true),
        _ => false,
    }
}

/// Pull explicit reasoning fields off a delta, clearing all of them so the
/// chosen output field is the only carrier.
fn take_reasoning_fields(delta: &mut Value) -> Option<String> {
    let mut found = None;
    for field in ["reasoning_content", "thinking", "reasoning"] {
        if let Some(text) = delta[field].as_str()
            && found.is_none()
            && !text.is_empty()
        {
            found = Some(text.to_string());
        }
        if let Some(map) = delta.as_object_mut() {
            map.remove(field);
        }
    }
    found
}

/// Render the final error chunk for a stream that failed mid-flight.
/// Always a complete JSON object, never a torn token.
pub fn error_chunk(err: &RelayError, request_id: &str) -> String {
    format!("data: {}\n\n", err.envelope(request_id))
}

/// Pump one upstream SSE response to a downstream sender, transforming each
/// record through `ctx`. Returns the finalized usage. One reader, one
/// writer; per-chunk order is preserved and each write is flushed by the
/// egress layer.
pub async fn pump_sse(
    response: reqwest::Response,
    ctx: &mut StreamContext,
    tx: &mpsc::Sender<String>,
) -> Result<Usage> {
    let mut reader = SseLineReader::new();
    let mut stream = response.bytes_stream();

    'outer: while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| RelayError::transport(format!("upstream read: {e}")))?;
        for line in reader.feed(&bytes) {
            let Some(data) = data_of(&line) else {
                continue;
            };
            match ctx.process_data(data)? {
                ChunkAction::Emit(payload) => {
                    if tx.send(ctx.render_record(&payload)).await.is_err() {
                        // Caller went away; stop reading upstream.
                        break 'outer;
                    }
                }
                ChunkAction::EmitFinal(payload) => {
                    let _ = tx.send(ctx.render_record(&payload)).await;
                    break 'outer;
                }
                ChunkAction::Skip => {}
                ChunkAction::Done => break 'outer,
            }
        }
    }

    if let Some(payload) = ctx.flush_thinking() {
        let _ = tx.send(ctx.render_record(&payload)).await;
    }

    let usage = ctx.finalize()?;
    if ctx.emits_done_marker() {
        let _ = tx.send("data: [DONE]\n\n".to_string()).await;
    }
    Ok(usage)
}
