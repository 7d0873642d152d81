mod backlog;
mod config;
mod counter;
mod directory;
mod document;
mod envelope;
mod error;
mod listener;
mod pipeline;
mod relay;
mod resolver;
mod search;

use crate::backlog::RetryPolicy;
use crate::config::Config;
use crate::counter::StatsCounter;
use crate::directory::ElasticDirectory;
use crate::pipeline::Pipeline;
use crate::relay::RedisRelay;
use crate::search::{ElasticsearchClient, SearchEngine};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Accepts tagged log lines, stores them per tenant in Elasticsearch and
/// relays them to live-tail subscribers.
#[derive(Parser, Debug)]
#[command(name = "tailgate", version)]
struct Cli {
    /// YAML config file (defaults are used if it does not exist)
    #[arg(short, long, default_value = "backend.yaml")]
    config: PathBuf,

    /// Override the TCP listen address (e.g. 0.0.0.0:27077)
    #[arg(long)]
    tcp_addr: Option<String>,

    /// Override the HTTP listen address (e.g. 0.0.0.0:27078)
    #[arg(long)]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = if cli.config.exists() {
        Config::load(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config.display()))?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(addr) = cli.tcp_addr {
        cfg.listen.tcp = addr;
    }
    if let Some(addr) = cli.http_addr {
        cfg.listen.http = addr;
    }

    tracing::info!("Initializing server");

    // 1. Collaborators
    let timeout = cfg.elasticsearch.request_timeout();
    let engine: Arc<dyn SearchEngine> =
        Arc::new(ElasticsearchClient::new(&cfg.elasticsearch.url, timeout)?);
    let directory = Arc::new(ElasticDirectory::new(
        &cfg.elasticsearch.url,
        cfg.elasticsearch.users_index.clone(),
        timeout,
    )?);
    let relay = Arc::new(RedisRelay::spawn(
        cfg.redis.address(),
        cfg.redis.channel_capacity,
        timeout,
    ));
    let counter = Arc::new(StatsCounter::new());

    // 2. The shared pipeline context
    let pipeline = Arc::new(Pipeline::new(
        directory,
        engine.clone(),
        relay,
        counter.clone(),
        RetryPolicy::from_config(&cfg.backlog),
        timeout,
    ));

    // 3. Background tasks
    tokio::spawn(pipeline::run_retry_loop(pipeline.clone()));
    tokio::spawn(counter::run_flush_loop(
        counter,
        engine,
        cfg.elasticsearch.stats_index.clone(),
        Duration::from_millis(cfg.stats.flush_interval_ms),
    ));

    // 4. Listeners. Bind both before serving so a bad address fails fast
    let tcp = TcpListener::bind(&cfg.listen.tcp)
        .await
        .with_context(|| format!("failed to bind tcp {}", cfg.listen.tcp))?;
    let http = TcpListener::bind(&cfg.listen.http)
        .await
        .with_context(|| format!("failed to bind http {}", cfg.listen.http))?;

    tokio::select! {
        result = listener::serve_tcp(tcp, pipeline.clone(), cfg.listen.max_line_bytes) => result,
        result = listener::serve_http(http, pipeline.clone(), cfg.listen.max_body_bytes) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(backlog = pipeline.backlog().len(), "shutting down");
            Ok(())
        }
    }
}
