//! `imiscd`: IMISC performer daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use remop_core::imisc;
use remop_runtime::logging::{init_tracing, LogFormat};
use remop_runtime::service::{ServiceContext, ServiceRegistry};
use remop_runtime::{
    ImiscConfig, ImiscService, NetworkConfig, RosServer, ServerConfig, SessionConfig,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "imiscd", version, about = "IMISC remote operations performer")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "IMISCD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 picks a free port).
    #[arg(short, long, env = "IMISCD_PORT", default_value_t = 7390)]
    port: u16,

    /// Per-invocation timeout in milliseconds.
    #[arg(long, env = "IMISCD_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    operation_timeout_ms: u64,

    /// Invocations performed at once before new ones are refused.
    #[arg(long, env = "IMISCD_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent: u32,

    /// Of those, slots only invocations above normal priority may use.
    #[arg(long, env = "IMISCD_PRIORITY_RESERVE", default_value_t = 0)]
    priority_reserve: u32,

    /// Seconds to wait for in-flight invocations on shutdown.
    #[arg(long, env = "IMISCD_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Largest frame accepted, in bytes.
    #[arg(long, env = "IMISCD_MAX_FRAME", default_value_t = 8 * 1024 * 1024)]
    max_frame_length: usize,

    /// Logged-in users, comma separated.
    #[arg(long = "users", env = "IMISCD_USERS", value_delimiter = ',')]
    users: Vec<String>,

    /// A quote for qotd; may be repeated.
    #[arg(long = "quote")]
    quotes: Vec<String>,

    /// File of quotes separated by lines holding a single `%`.
    #[arg(long, env = "IMISCD_QUOTES_FILE")]
    quotes_file: Option<PathBuf>,

    /// Messages held per user for tellUser.
    #[arg(long, env = "IMISCD_MAILBOX_CAPACITY", default_value_t = 16)]
    mailbox_capacity: usize,

    #[arg(long, value_enum, env = "IMISCD_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "IMISCD_METRICS_PORT")]
    metrics_port: Option<u16>,
}

fn load_quotes(args: &Args) -> anyhow::Result<Vec<String>> {
    let mut quotes = args.quotes.clone();
    if let Some(path) = &args.quotes_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read quotes from {}", path.display()))?;
        quotes.extend(parse_quotes(&text));
    }
    Ok(quotes)
}

/// Splits fortune-style text into quotes.
fn parse_quotes(text: &str) -> Vec<String> {
    let mut quotes = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines().chain(std::iter::once("%")) {
        if line.trim() == "%" {
            if !current.is_empty() {
                quotes.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    quotes
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    if let Some(port) = args.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(port, "metrics listener started");
    }

    let table = Arc::new(imisc::table().clone());
    let server_config = ServerConfig {
        application: "imiscd".to_string(),
        default_operation_timeout_ms: args.operation_timeout_ms,
        max_concurrent_operations: args.max_concurrent,
        priority_reserve: args.priority_reserve,
    };
    let network = NetworkConfig {
        host: args.host.clone(),
        port: args.port,
        session: SessionConfig {
            max_frame_length: args.max_frame_length,
            ..SessionConfig::default()
        },
        drain_timeout: Duration::from_secs(args.drain_timeout_secs),
    };

    let registry = ServiceRegistry::new();
    let service = registry.register(ImiscService::new(ImiscConfig {
        users: args.users.clone(),
        quotes: load_quotes(&args)?,
        mailbox_capacity: args.mailbox_capacity,
        ..ImiscConfig::default()
    }))?;
    registry
        .init_all(&ServiceContext {
            config: Arc::new(server_config.clone()),
            table: Arc::clone(&table),
        })
        .await?;

    let router = service.router(table)?;
    let mut server = RosServer::new(network, server_config, router);
    let port = server.start().await?;
    info!(port, users = args.users.len(), "imiscd ready");

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("ctrl-c received");
        })
        .await?;

    registry.shutdown_all(false).await?;
    Ok(())
}
