use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use webmirror::{build_router, AppState, Config};

#[derive(Parser, Debug)]
#[command(name = "webmirror")]
#[command(about = "Private allowlisted web-mirroring reverse proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server (default).
    Serve,
    /// Validate configuration and print a redacted summary (json; no secrets).
    CheckConfig,
    /// Print version info.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::CheckConfig => check_config(),
        Commands::Version => {
            let v = serde_json::json!({
                "schema_version": 1,
                "name": "webmirror",
                "version": env!("CARGO_PKG_VERSION"),
            });
            println!("{}", serde_json::to_string_pretty(&v)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn check_config() -> Result<()> {
    let config = Config::from_env().context("configuration invalid")?;
    let v = serde_json::json!({
        "ok": true,
        "host": config.host,
        "port": config.port,
        "publicBaseUrl": config.public_base_url,
        "allowlistPath": config.allowlist_path,
        "dbPath": config.db_path,
        "cacheDir": config.cache_dir,
        "cacheTtlSeconds": config.cache_ttl_seconds,
        "cacheMaxBytes": config.cache_max_bytes,
        "upstreamTimeoutMs": config.upstream_timeout_ms,
        "maxHtmlBytes": config.max_html_bytes,
        "maxBinaryBytes": config.max_binary_bytes,
        "enableHttp": config.enable_http,
        "disableService": config.disable_service,
        "unsafeAllowPrivate": config.unsafe_allow_private,
        "logFile": config.log_file,
    });
    println!("{}", serde_json::to_string_pretty(&v)?);
    Ok(())
}

async fn serve() -> Result<()> {
    init_tracing();
    let config = Config::from_env().context("configuration invalid")?;
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::build(config).context("service startup failed")?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "webmirror listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
