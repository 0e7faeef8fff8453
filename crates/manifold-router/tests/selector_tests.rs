use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use manifold_core::{Channel, ChannelKind, ChannelStatus, RelayMode};
use manifold_router::{AbilityCache, ChannelRateLimiter, SelectQuery, Selector, SuspensionMap};

fn channel(id: i64, kind: ChannelKind, priority: i32, models: &[&str]) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        kind,
        base_url: "https://upstream.example".into(),
        key: "k".into(),
        models: models.iter().map(|m| m.to_string()).collect(),
        endpoints: HashSet::new(),
        priority,
        status: ChannelStatus::Enabled,
        groups: ["default".to_string()].into_iter().collect(),
        model_mapping: HashMap::new(),
        system_prompt: None,
        rate_limit: None,
        config: serde_json::Value::Null,
    }
}

fn selector(channels: Vec<Channel>) -> Selector {
    let cache = Arc::new(AbilityCache::new(Duration::from_secs(60)));
    cache.install(channels);
    Selector::new(
        cache,
        Arc::new(SuspensionMap::new()),
        Arc::new(ChannelRateLimiter::new()),
    )
}

fn query<'a>(model: &'a str, mode: RelayMode, exclude: &'a mut HashSet<i64>) -> SelectQuery<'a> {
    SelectQuery {
        group: "default",
        model,
        mode,
        websocket: false,
        exclude,
        ignore_first_priority: false,
    }
}

#[test]
fn highest_priority_tier_wins() {
    let sel = selector(vec![
        channel(1, ChannelKind::OpenAi, 5, &["gpt-4o"]),
        channel(2, ChannelKind::OpenAi, 10, &["gpt-4o"]),
        channel(3, ChannelKind::OpenAi, 10, &["gpt-4o"]),
    ]);
    let mut exclude = HashSet::new();
    let picked = sel
        .pick(&mut query("gpt-4o", RelayMode::ChatCompletions, &mut exclude))
        .unwrap();
    // Tie inside the top tier breaks on lowest channel id.
    assert_eq!(picked.id, 2);
}

#[test]
fn priorities_are_non_increasing_and_ids_never_repeat() {
    let sel = selector(vec![
        channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"]),
        channel(2, ChannelKind::OpenAi, 10, &["gpt-4o"]),
        channel(3, ChannelKind::OpenAi, 5, &["gpt-4o"]),
        channel(4, ChannelKind::OpenAi, 1, &["gpt-4o"]),
    ]);
    let mut exclude = HashSet::new();
    let mut attempted: Vec<(i32, i64)> = Vec::new();
    loop {
        let mut q = query("gpt-4o", RelayMode::ChatCompletions, &mut exclude);
        match sel.pick(&mut q) {
            Ok(ch) => {
                attempted.push((ch.priority, ch.id));
                exclude.insert(ch.id);
            }
            Err(_) => break,
        }
    }
    assert_eq!(attempted.len(), 4);
    for pair in attempted.windows(2) {
        assert!(pair[0].0 >= pair[1].0, "priority increased: {attempted:?}");
    }
    let ids: HashSet<i64> = attempted.iter().map(|(_, id)| *id).collect();
    assert_eq!(ids.len(), attempted.len());
}

#[test]
fn endpoint_incompatible_channel_is_skipped_and_excluded() {
    let mut chat_only = channel(1, ChannelKind::OpenAi, 10, &["text-embedding-3-small"]);
    chat_only.endpoints = ["chat_completions".to_string()].into_iter().collect();
    let fallback = channel(2, ChannelKind::OpenAi, 5, &["text-embedding-3-small"]);

    let sel = selector(vec![chat_only, fallback]);
    let mut exclude = HashSet::new();
    let picked = sel
        .pick(&mut query(
            "text-embedding-3-small",
            RelayMode::Embeddings,
            &mut exclude,
        ))
        .unwrap();
    assert_eq!(picked.id, 2);
    assert!(exclude.contains(&1));
}

#[test]
fn ignore_first_priority_descends_a_tier() {
    let sel = selector(vec![
        channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"]),
        channel(2, ChannelKind::OpenAi, 5, &["gpt-4o"]),
    ]);
    let mut exclude = HashSet::new();
    let mut q = query("gpt-4o", RelayMode::ChatCompletions, &mut exclude);
    q.ignore_first_priority = true;
    assert_eq!(sel.pick(&mut q).unwrap().id, 2);
}

#[test]
fn unknown_model_is_no_channel() {
    let sel = selector(vec![channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"])]);
    let mut exclude = HashSet::new();
    let err = sel
        .pick(&mut query("unlisted", RelayMode::ChatCompletions, &mut exclude))
        .unwrap_err();
    assert_eq!(err.status, 503);
}

#[test]
fn suspended_channel_is_invisible_until_deadline() {
    let cache = Arc::new(AbilityCache::new(Duration::from_secs(60)));
    cache.install(vec![
        channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"]),
        channel(2, ChannelKind::OpenAi, 5, &["gpt-4o"]),
    ]);
    let suspensions = Arc::new(SuspensionMap::new());
    let sel = Selector::new(
        Arc::clone(&cache),
        Arc::clone(&suspensions),
        Arc::new(ChannelRateLimiter::new()),
    );

    suspensions.suspend(1, Duration::from_secs(60));
    let mut exclude = HashSet::new();
    let picked = sel
        .pick(&mut query("gpt-4o", RelayMode::ChatCompletions, &mut exclude))
        .unwrap();
    assert_eq!(picked.id, 2);
}

#[test]
fn disabled_channel_materializes_no_ability() {
    let mut ch = channel(1, ChannelKind::OpenAi, 10, &["gpt-4o"]);
    ch.status = ChannelStatus::Disabled;
    let sel = selector(vec![ch, channel(2, ChannelKind::OpenAi, 1, &["gpt-4o"])]);
    let mut exclude = HashSet::new();
    let picked = sel
        .pick(&mut query("gpt-4o", RelayMode::ChatCompletions, &mut exclude))
        .unwrap();
    assert_eq!(picked.id, 2);
}

// ── Pinned ─────────────────────────────────────────────────────

#[test]
fn pinned_asserts_model_and_endpoint() {
    let sel = selector(vec![channel(7, ChannelKind::OpenAi, 0, &["gpt-4o"])]);

    assert_eq!(
        sel.pick_pinned(7, "gpt-4o", RelayMode::ChatCompletions, false)
            .unwrap()
            .id,
        7
    );
    let err = sel
        .pick_pinned(7, "other-model", RelayMode::ChatCompletions, false)
        .unwrap_err();
    assert_eq!(err.status, 400);
    let err = sel.pick_pinned(99, "gpt-4o", RelayMode::ChatCompletions, false).unwrap_err();
    assert_eq!(err.status, 400);
}

#[test]
fn pinned_disabled_channel_is_forbidden() {
    let mut ch = channel(7, ChannelKind::OpenAi, 0, &["gpt-4o"]);
    ch.status = ChannelStatus::Disabled;
    let sel = selector(vec![ch]);
    let err = sel
        .pick_pinned(7, "gpt-4o", RelayMode::ChatCompletions, false)
        .unwrap_err();
    assert_eq!(err.status, 403);
}

// ── Websocket-before-model ─────────────────────────────────────

#[test]
fn ws_path_only_accepts_openai_shaped_kinds() {
    let sel = selector(vec![
        channel(1, ChannelKind::Anthropic, 20, &["claude-sonnet-4"]),
        channel(2, ChannelKind::OpenAi, 10, &["gpt-4o"]),
    ]);
    let picked = sel.pick_for_ws("default", &HashSet::new()).unwrap();
    assert_eq!(picked.id, 2);
}

#[test]
fn ws_path_respects_exclusions() {
    let sel = selector(vec![
        channel(1, ChannelKind::OpenAi, 20, &["gpt-4o"]),
        channel(2, ChannelKind::OpenAi, 10, &["gpt-4o"]),
    ]);
    let exclude: HashSet<i64> = [1].into_iter().collect();
    assert_eq!(sel.pick_for_ws("default", &exclude).unwrap().id, 2);
}
