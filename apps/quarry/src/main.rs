use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use quarry::auth::cookies::CookieRuntime;
use quarry::auth::oauth::{OauthConfig, OauthManager};
use quarry::auth::{CredentialResolver, ResolverConfig};
use quarry::config::Config;
use quarry::mcp::registry::ToolRegistry;
use quarry::mcp::tools;
use quarry::server::{build_router, AppState};
use quarry::session::{ManagerConfig, SessionManager};
use forge_api::ForgeClient;

#[derive(Debug, Parser)]
#[command(name = "quarry", about = "MCP gateway for a source-control forge")]
struct Cli {
    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let forge_base = Url::parse(&config.forge_url)
        .with_context(|| format!("invalid FORGE_URL '{}'", config.forge_url))?;
    info!(forge = %forge_base, "starting quarry MCP gateway");

    let oauth = match &config.oauth_client_id {
        Some(client_id) => {
            let redirect_uri = Url::parse(&config.oauth_redirect_uri)
                .with_context(|| "invalid QUARRY_OAUTH_REDIRECT_URI")?;
            let oauth_config = OauthConfig {
                client_id: client_id.clone(),
                client_secret: config.oauth_client_secret.clone(),
                scopes: config.oauth_scopes.clone(),
                redirect_uri,
                token_path: config
                    .oauth_token_path
                    .clone()
                    .unwrap_or_else(OauthConfig::default_token_path),
                auto_open: config.oauth_auto_open,
            };
            Some(Arc::new(
                OauthManager::new(oauth_config, forge_base.clone())
                    .context("invalid oauth configuration")?,
            ))
        }
        None => None,
    };

    let cookies = config.cookie_file.clone().map(|path| {
        Arc::new(CookieRuntime::new(path, config.cookie_warmup_path.clone()))
    });
    if let Some(cookies) = &cookies {
        if let Err(err) = cookies.ensure_fresh().await {
            warn!(error = %err, "cookie jar not loadable at startup; will retry per request");
        }
    }

    let resolver = Arc::new(
        CredentialResolver::new(
            ResolverConfig {
                default_token: config.default_token.clone(),
                token_script: config.token_script.clone(),
                script_timeout: std::time::Duration::from_secs(config.token_script_timeout_secs),
                cache_ttl: std::time::Duration::from_secs(config.token_cache_ttl_secs),
                token_file: config.token_file.clone(),
                token_file_allow_loose: config.token_file_allow_loose,
                browser_bypass: config.browser_bypass,
                browser_user_agent: config.browser_user_agent.clone(),
            },
            forge_base.clone(),
            oauth,
            cookies,
        )
        .context("invalid credential configuration")?,
    );

    let forge = Arc::new(
        ForgeClient::new(forge_base, config.forge_timeout()).context("invalid forge client")?,
    );
    let mut registry = ToolRegistry::new();
    tools::register_tools(&mut registry);

    let manager = SessionManager::new(
        ManagerConfig {
            max_sessions: config.max_sessions,
            idle_timeout: config.idle_timeout(),
            rate_window: std::time::Duration::from_secs(60),
            rate_ceiling: config.session_requests_per_minute,
        },
        Arc::new(registry),
        forge,
        resolver,
    );

    let sweeper = {
        let manager = manager.clone();
        let interval = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_idle().await;
            }
        })
    };

    let app = build_router(AppState {
        manager: manager.clone(),
    });
    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, max_sessions = config.max_sessions, "quarry listening");

    let shutdown = {
        let manager = manager.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; closing sessions");
            manager.shutdown().await;
            sweeper.abort();
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    Ok(())
}
