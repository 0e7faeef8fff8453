use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::billing::{Biller, Reservation};
use crate::classify::{Disposition, classify};
use manifold_adaptor::adaptor::{Adaptor, ResponseSink, adaptor_for};
use manifold_adaptor::dialect::claude::ClaudeRequest;
use manifold_adaptor::dialect::openai::ChatRequest;
use manifold_core::{
    Channel, ErrorKind, ReasoningFormat, RelayError, RelayLogEntry, RelayLogStore, RelayMode,
    RequestMeta, Result, Token, Usage,
};
use manifold_router::{SelectQuery, Selector};

/// Transient retries on one channel: 250 ms, ×2, capped at 2 s.
const BACKOFF_START: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(2);
const TRANSIENT_ATTEMPTS: u32 = 3;

/// The parsed caller payload in whichever dialect arrived.
#[derive(Debug, Clone)]
pub enum RelayPayload {
    Chat(ChatRequest),
    Claude(ClaudeRequest),
    /// Embeddings, images, audio, rerank, video, Response API: relayed
    /// with only the model rewritten.
    Raw(Value),
}

impl RelayPayload {
    pub fn estimate_prompt_tokens(&self) -> u64 {
        match self {
            Self::Chat(c) => c.estimate_prompt_tokens(),
            Self::Claude(c) => c.estimate_prompt_tokens(),
            Self::Raw(v) => manifold_core::estimate_tokens(&v.to_string()),
        }
    }

    /// Channel-level system prompt, applied only when the caller sent none.
    fn apply_system_prompt(&mut self, prompt: &str) {
        match self {
            Self::Chat(c) => c.ensure_system_prompt(prompt),
            Self::Claude(c) => {
                if c.system.is_none() {
                    c.system = Some(Value::String(prompt.to_string()));
                }
            }
            Self::Raw(_) => {}
        }
    }
}

pub struct RelayRequest {
    pub request_id: String,
    pub token: Token,
    pub model: String,
    pub mode: RelayMode,
    pub payload: RelayPayload,
    pub is_stream: bool,
    /// Channel pinned via the `-{id}` key suffix; disables cross-channel
    /// retries entirely.
    pub pinned_channel: Option<i64>,
    pub reasoning_format: ReasoningFormat,
    pub thinking_enabled: bool,
}

#[derive(Debug)]
pub struct RelayResult {
    pub usage: Usage,
    pub channel_id: i64,
    /// Buffered response body; `None` when the answer was streamed.
    pub body: Option<Value>,
    pub quota_cost: i64,
}

/// Wraps selection, adaptation and streaming with the retry/suspension/
/// billing policy.
pub struct RelayEngine {
    selector: Arc<Selector>,
    biller: Biller,
    logs: Arc<dyn RelayLogStore>,
    suspend_for: Duration,
    max_attempts: u32,
}

impl RelayEngine {
    pub fn new(
        selector: Arc<Selector>,
        biller: Biller,
        logs: Arc<dyn RelayLogStore>,
        suspend_for: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            selector,
            biller,
            logs,
            suspend_for,
            max_attempts,
        }
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub async fn relay(&self, mut req: RelayRequest, sink: &mut ResponseSink) -> Result<RelayResult> {
        let prompt_tokens = req.payload.estimate_prompt_tokens();
        let mut exclude: HashSet<i64> = HashSet::new();
        let mut reservation: Option<Reservation> = None;
        let mut last_err: Option<RelayError> = None;

        for _ in 0..self.max_attempts {
            let channel = match self.select(&req, &mut exclude) {
                Ok(c) => c,
                Err(e) => {
                    last_err = Some(last_err.unwrap_or(e));
                    break;
                }
            };
            let adaptor = adaptor_for(channel.kind);
            let meta = build_meta(&req, &channel, prompt_tokens);
            let price = adaptor.price_for(&meta);

            if let Some(prompt) = &channel.system_prompt {
                req.payload.apply_system_prompt(prompt);
            }

            if reservation.is_none() {
                reservation = Some(
                    self.biller
                        .pre_consume(&req.token, prompt_tokens, &price, &req.token.group)
                        .await?,
                );
            }

            let started = Instant::now();
            match self.attempt(adaptor, &meta, &req.payload, sink).await {
                Ok(usage) => {
                    let Some(reservation) = reservation.take() else {
                        return Err(RelayError::internal("settled without a reservation"));
                    };
                    let cost = self
                        .biller
                        .settle(&reservation, &usage, &price, &req.token.group)
                        .await?;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(
                        channel_id = meta.channel_id,
                        request_id = %meta.request_id,
                        relay_mode = meta.mode.endpoint_name(),
                        model = %meta.origin_model,
                        status = 200u16,
                        duration_ms,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        cost,
                        "relay settled"
                    );
                    let _ = self
                        .logs
                        .record(RelayLogEntry {
                            request_id: meta.request_id.clone(),
                            token_id: req.token.id,
                            channel_id: meta.channel_id,
                            mode: meta.mode.endpoint_name().to_string(),
                            model: meta.origin_model.clone(),
                            status: 200,
                            error_kind: None,
                            duration_ms,
                            usage: usage.clone(),
                            quota_cost: cost,
                            created_at: chrono::Utc::now(),
                        })
                        .await;
                    let body = sink.take_body();
                    if let (RelayPayload::Claude(claude_req), Some(body)) = (&req.payload, &body) {
                        adaptor.observe_claude_response(&meta, claude_req, body);
                    }
                    return Ok(RelayResult {
                        usage,
                        channel_id: meta.channel_id,
                        body,
                        quota_cost: cost,
                    });
                }
                Err(err) => {
                    log_attempt(&meta, &err, started.elapsed());
                    let disposition = classify(&err);

                    // Once stream bytes may have reached the caller, no
                    // channel can replay them.
                    let stream_interrupted =
                        err.provider_code.as_deref() == Some("stream_interrupted");
                    // Pinned channels never fail over, whatever the class.
                    let retryable = !stream_interrupted
                        && !matches!(
                            disposition,
                            Disposition::UserOriginated | Disposition::Fatal | Disposition::SoftSkip
                        );
                    if req.pinned_channel.is_some() || !retryable {
                        if let Some(res) = reservation.take() {
                            self.biller.release(&res).await;
                        }
                        return Err(err);
                    }

                    match disposition {
                        Disposition::SuspendAndRetry | Disposition::RateLimited => {
                            self.selector
                                .suspensions()
                                .suspend(channel.id, self.suspend_for);
                            exclude.insert(channel.id);
                        }
                        Disposition::RetryDifferentChannel => {
                            exclude.insert(channel.id);
                        }
                        Disposition::Transient => {
                            // Same-channel retries already happened inside
                            // attempt(); persistent gateway-shaped failures
                            // are skipped, everything else moves on.
                            if matches!(err.status, 502 | 503 | 504) {
                                if let Some(res) = reservation.take() {
                                    self.biller.release(&res).await;
                                }
                                return Err(err);
                            }
                            exclude.insert(channel.id);
                        }
                        Disposition::UserOriginated | Disposition::Fatal | Disposition::SoftSkip => {
                        }
                    }
                    last_err = Some(err);
                }
            }
        }

        if let Some(res) = reservation.take() {
            self.biller.release(&res).await;
        }
        Err(last_err.unwrap_or_else(|| RelayError::no_channel(&req.token.group, &req.model)))
    }

    fn select(&self, req: &RelayRequest, exclude: &mut HashSet<i64>) -> Result<Arc<Channel>> {
        let websocket = req.mode.is_websocket();
        if let Some(id) = req.pinned_channel {
            return self.selector.pick_pinned(id, &req.model, req.mode, websocket);
        }
        self.selector.pick(&mut SelectQuery {
            group: &req.token.group,
            model: &req.model,
            mode: req.mode,
            websocket,
            exclude,
            ignore_first_priority: false,
        })
    }

    /// One channel attempt, including same-channel transient retries with
    /// exponential backoff.
    async fn attempt(
        &self,
        adaptor: &dyn Adaptor,
        meta: &RequestMeta,
        payload: &RelayPayload,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        let payload_value = match payload {
            RelayPayload::Chat(c) => adaptor.convert_request(meta, c.clone())?,
            RelayPayload::Claude(c) => adaptor.convert_claude_request(meta, c.clone())?,
            RelayPayload::Raw(v)
                if matches!(
                    meta.mode,
                    RelayMode::ImagesGenerations | RelayMode::ImagesEdits | RelayMode::ImagesVariations
                ) =>
            {
                adaptor.convert_image_request(meta, v.clone())?
            }
            RelayPayload::Raw(v) => {
                let mut v = v.clone();
                if v.is_object() {
                    v["model"] = Value::String(meta.actual_model.clone());
                }
                v
            }
        };

        let mut delay = BACKOFF_START;
        let mut last_err = None;
        for attempt in 0..TRANSIENT_ATTEMPTS {
            let (result, from_dial) = match adaptor.do_request(meta, &payload_value).await {
                Ok(response) => (adaptor.do_response(meta, response, sink).await, false),
                Err(e) => (Err(e), true),
            };
            match result {
                Ok(usage) => return Ok(usage),
                Err(e) => {
                    // A transport error out of do_response means the stream
                    // already started; bytes may have reached the caller,
                    // so no replay on this or any channel.
                    let mid_stream = meta.is_stream
                        && e.kind == ErrorKind::Transport
                        && e.status == 0
                        && !from_dial;
                    if mid_stream {
                        return Err(e.with_code("stream_interrupted"));
                    }
                    if classify(&e) == Disposition::Transient && attempt + 1 < TRANSIENT_ATTEMPTS {
                        warn!(
                            channel_id = meta.channel_id,
                            request_id = %meta.request_id,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying after transient error"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(BACKOFF_CAP);
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RelayError::internal("retry loop exhausted")))
    }
}

fn build_meta(req: &RelayRequest, channel: &Channel, prompt_tokens: u64) -> RequestMeta {
    RequestMeta {
        request_id: req.request_id.clone(),
        origin_model: req.model.clone(),
        actual_model: channel.mapped_model(&req.model),
        mode: req.mode,
        channel_id: channel.id,
        channel_kind: channel.kind,
        base_url: channel.base_url.clone(),
        api_key: channel.key.clone(),
        is_stream: req.is_stream,
        prompt_tokens,
        group: req.token.group.clone(),
        system_prompt: channel.system_prompt.clone(),
        reasoning_format: req.reasoning_format,
        thinking_enabled: req.thinking_enabled,
        token_id: req.token.id,
        config: channel.config.clone(),
    }
}

/// Structured per-attempt log line. Failures below 500 are WARN, 5xx are
/// ERROR.
fn log_attempt(meta: &RequestMeta, err: &RelayError, duration: Duration) {
    let duration_ms = duration.as_millis() as u64;
    if err.caller_status() >= 500 {
        error!(
            channel_id = meta.channel_id,
            request_id = %meta.request_id,
            relay_mode = meta.mode.endpoint_name(),
            model = %meta.origin_model,
            status = err.status,
            error_kind = err.kind.tag(),
            duration_ms,
            error = %err,
            "relay attempt failed"
        );
    } else {
        warn!(
            channel_id = meta.channel_id,
            request_id = %meta.request_id,
            relay_mode = meta.mode.endpoint_name(),
            model = %meta.origin_model,
            status = err.status,
            error_kind = err.kind.tag(),
            duration_ms,
            error = %err,
            "relay attempt failed"
        );
    }
}
