use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use manifold_config::ConfigLoader;
use manifold_core::MemoryStore;
use manifold_net::ClientConfig;
use manifold_relay::{Biller, RelayEngine};
use manifold_router::{AbilityCache, ChannelRateLimiter, Selector, SuspensionMap};
use manifold_server::AppState;

#[derive(Parser)]
#[command(name = "manifold", version, about = "Multi-provider LLM API gateway")]
struct Args {
    /// Path to manifold.toml.
    #[arg(short, long, env = "MANIFOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::load(args.config.as_deref()).context("loading configuration")?;
    let config = loader.get();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    manifold_net::init(ClientConfig {
        relay_timeout: Duration::from_secs(config.net.relay_timeout_secs),
        impatient_timeout: Duration::from_secs(config.net.impatient_timeout_secs),
        block_internal: config.net.block_internal,
        proxy: config.net.proxy.clone(),
    });

    // Standalone runs keep everything in memory, seeded from the config
    // file; a deployment wires real stores behind the same traits.
    let store = Arc::new(MemoryStore::new());
    for token in config.seed.tokens.clone() {
        store.seed_token(token.into_token());
    }
    let channels: Vec<_> = config
        .seed
        .channels
        .clone()
        .into_iter()
        .map(|c| c.into_channel())
        .collect();
    info!(
        channels = channels.len(),
        tokens = config.seed.tokens.len(),
        "seeded in-memory store"
    );
    for channel in channels {
        store.seed_channel(channel);
    }

    let cache = Arc::new(AbilityCache::new(Duration::from_secs(
        config.relay.cache_ttl_secs,
    )));
    cache.install(
        manifold_core::ChannelStore::channels(store.as_ref())
            .await
            .context("loading channels")?,
    );

    let selector = Arc::new(Selector::new(
        Arc::clone(&cache),
        Arc::new(SuspensionMap::new()),
        Arc::new(ChannelRateLimiter::new()),
    ));
    let biller = Biller::new(
        Arc::clone(&store) as Arc<dyn manifold_core::TokenStore>,
        config.billing.quota_per_token,
        config.billing.group_ratios.clone(),
    );
    let engine = Arc::new(RelayEngine::new(
        selector,
        biller,
        Arc::clone(&store) as Arc<dyn manifold_core::RelayLogStore>,
        Duration::from_secs(config.relay.suspend_secs),
        config.relay.max_attempts,
    ));

    let state = Arc::new(AppState {
        engine,
        tokens: Arc::clone(&store) as Arc<dyn manifold_core::TokenStore>,
        channels: Arc::clone(&store) as Arc<dyn manifold_core::ChannelStore>,
        logs: store as Arc<dyn manifold_core::RelayLogStore>,
        cache,
        key_prefix: config.auth.key_prefix.clone(),
        started_at: Instant::now(),
    });

    let listen = args.listen.unwrap_or(config.server.listen);
    manifold_server::start_server(state, &listen, config.server.cors)
        .await
        .context("server exited")?;
    Ok(())
}
