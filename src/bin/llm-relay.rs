use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use llm_relay::gateway::pipeline::{Gateway, GatewayParts};
use llm_relay::gateway::store::MemoryStore;
use llm_relay::gateway::telemetry::{TelemetrySettings, init_tracing};
use llm_relay::gateway::{GatewayConfig, GatewayHttpState, HttpTransport, http_router};

#[derive(Debug, Parser)]
#[command(name = "llm-relay", about = "LLM request gateway")]
struct Cli {
    /// Gateway config file (.toml or .json).
    #[arg(long, env = "LLM_RELAY_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "LLM_RELAY_LISTEN")]
    listen: Option<String>,
    /// JSON seed for the in-memory store: organizations, keys, credentials.
    #[arg(long, env = "LLM_RELAY_STORE_SEED")]
    store_seed: Option<PathBuf>,
    #[arg(long, env = "LLM_RELAY_REDIS_URL", hide_env_values = true)]
    redis_url: Option<String>,
    #[arg(long, env = "LLM_RELAY_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
    #[arg(long, env = "LLM_RELAY_JSON_LOGS")]
    json_logs: bool,
    #[arg(long, env = "LLM_RELAY_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _telemetry = init_tracing(&TelemetrySettings {
        json_logs: cli.json_logs,
        otlp_endpoint: cli.otlp_endpoint.clone(),
        ..TelemetrySettings::default()
    })?;

    let mut config = match cli.config.as_deref() {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(seed) = cli.store_seed {
        config.store_seed = Some(seed);
    }
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = Some(redis_url);
    }
    tracing::debug!(?config, "configuration loaded");

    let store = match config.store_seed.as_deref() {
        Some(path) => MemoryStore::load(path)?,
        None => MemoryStore::new(),
    };
    let transport = Arc::new(HttpTransport::new(
        config.timeouts.connect(),
        config.timeouts.stream_idle(),
    )?);
    let mut parts = GatewayParts::in_memory(Arc::new(store), transport);
    attach_redis(&config, &mut parts).await?;

    let gateway = Arc::new(Gateway::new(&config, parts)?);
    let mut state = GatewayHttpState::new(gateway.clone());
    if let Some(token) = cli.admin_token {
        state = state.with_admin_token(token);
    }

    let app = http_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, queue_mode = ?config.queue_mode, "llm-relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let drained = gateway.tasks().drain(config.timeouts.shutdown()).await;
    tracing::info!(drained, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(feature = "store-redis")]
async fn attach_redis(
    config: &GatewayConfig,
    parts: &mut GatewayParts,
) -> Result<(), Box<dyn std::error::Error>> {
    use llm_relay::gateway::dispatch::BrokerClient;
    use llm_relay::gateway::redis_store::{RedisStore, RedisStreamBroker};

    let Some(url) = config.redis_url.as_deref() else {
        return Ok(());
    };
    let store = RedisStore::new(url)?.with_prefix(config.redis_prefix.clone());
    store.ping().await?;
    parts.kv = Arc::new(store.clone());
    parts.rate_counter = Arc::new(store.clone());
    parts.wallets = Arc::new(store.clone());
    let broker: Arc<dyn BrokerClient> = Arc::new(RedisStreamBroker::new(
        store,
        config.logging.broker_stream.clone(),
    ));
    parts.log_clients.broker = Some(broker);
    tracing::info!(prefix = %config.redis_prefix, "redis store attached");
    Ok(())
}

#[cfg(not(feature = "store-redis"))]
async fn attach_redis(
    config: &GatewayConfig,
    _parts: &mut GatewayParts,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.redis_url.is_some() {
        return Err("redis_url requires `--features store-redis`".into());
    }
    Ok(())
}
