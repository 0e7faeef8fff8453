use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

/// Settings for the shared pools, taken from gateway config at startup.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for relayed provider calls. Streams can run long.
    pub relay_timeout: Duration,
    /// Timeout for probes and token exchanges.
    pub impatient_timeout: Duration,
    /// Refuse user-content fetches that resolve to internal addresses.
    pub block_internal: bool,
    /// Outbound proxy for the relay pool.
    pub proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_timeout: Duration::from_secs(600),
            impatient_timeout: Duration::from_secs(5),
            block_internal: true,
            proxy: None,
        }
    }
}

/// The process-wide client pools.
pub struct HttpClients {
    /// Long-timeout, proxy-aware. HTTP/2 is disabled: several providers
    /// reset h2 streams mid-SSE.
    pub relay: reqwest::Client,
    /// 5-second probe client (token exchanges, health checks).
    pub impatient: reqwest::Client,
    /// Fetches caller-supplied URLs, subject to the SSRF guard.
    pub user_content: reqwest::Client,
    pub block_internal: bool,
}

static CLIENTS: OnceCell<HttpClients> = OnceCell::new();

/// Build the pools. Called once at startup; later calls are ignored.
pub fn init(cfg: ClientConfig) {
    let _ = CLIENTS.get_or_try_init(|| -> Result<HttpClients, reqwest::Error> {
        let mut relay = reqwest::Client::builder()
            .timeout(cfg.relay_timeout)
            .connect_timeout(Duration::from_secs(15))
            .http1_only()
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(ref proxy) = cfg.proxy {
            relay = relay.proxy(reqwest::Proxy::all(proxy)?);
        }
        let relay = relay.build()?;

        let impatient = reqwest::Client::builder()
            .timeout(cfg.impatient_timeout)
            .build()?;

        let user_content = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        info!(
            relay_timeout_secs = cfg.relay_timeout.as_secs(),
            block_internal = cfg.block_internal,
            "http client pools initialized"
        );
        Ok(HttpClients {
            relay,
            impatient,
            user_content,
            block_internal: cfg.block_internal,
        })
    });
}

/// The shared pools. Initializes with defaults when `init` was never called
/// (tests, ad-hoc tools).
pub fn clients() -> &'static HttpClients {
    if CLIENTS.get().is_none() {
        init(ClientConfig::default());
    }
    CLIENTS.get().expect("http clients initialized")
}
