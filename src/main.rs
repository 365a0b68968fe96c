//! cmdgate - command dispatch gateway
//!
//! **Server mode** (default, or `cmdgate server`): runs the HTTP API, the
//! agent WebSocket endpoint and the stale connection reaper.
//!
//! **Producer mode** (`cmdgate submit | status | agents`): talks to a running
//! server over HTTP and prints JSON.

use clap::{Args, Parser as ClapParser, Subcommand};
use cmdgate::{
    api,
    client::{self, Client, SubmitCommand},
    command::CommandType,
    config::{self, ConfigError, GatewayConfig},
    reaper,
    store::{self, StoreError},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// cmdgate - command dispatch gateway
///
/// Delivers commands to connected agents over WebSocket, queues them for
/// polling agents, and correlates the results they post back.
#[derive(ClapParser, Debug)]
#[command(name = "cmdgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server: ServerArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct ServerArgs {
    /// Address to bind the HTTP/WebSocket API server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database path (in-memory store when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Bearer token required by every route except /health
    #[arg(long, env = "CMDGATE_TOKEN")]
    token: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct ClientArgs {
    /// Base URL of a running cmdgate server
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// API token
    #[arg(long, env = "CMDGATE_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway server
    Server(ServerArgs),

    /// Submit a command for an agent
    Submit {
        /// Target agent id
        #[arg(long)]
        agent: String,

        /// Command type: fetch, tunnel-fetch, screenshot, snapshot, popup
        #[arg(long = "type")]
        command_type: String,

        /// Tab or domain qualifier on the agent
        #[arg(long)]
        sub_resource: Option<String>,

        /// Incident the command's results should refresh
        #[arg(long)]
        incident: Option<String>,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show a command and, optionally, its results
    Status {
        /// Command id
        id: String,

        /// Also print the stored results
        #[arg(long)]
        results: bool,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// List connected agents
    Agents {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Error, Debug)]
pub enum CmdgateError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Client(#[from] client::ClientError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CmdgateError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Server(args)) => run_server(args).await,
        Some(Commands::Submit {
            agent,
            command_type,
            sub_resource,
            incident,
            payload,
            client,
        }) => run_submit(client, agent, command_type, sub_resource, incident, payload).await,
        Some(Commands::Status { id, results, client }) => run_status(client, id, results).await,
        Some(Commands::Agents { client }) => run_agents(client).await,
        None => run_server(cli.server).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cmdgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

/// File config first, then CLI flags on top.
fn resolve_config(args: &ServerArgs) -> Result<GatewayConfig, CmdgateError> {
    let path = args.config.clone().or_else(config::default_path);
    let mut config = match &path {
        Some(p) => match GatewayConfig::load(p)? {
            Some(c) => {
                tracing::info!(path = %p.display(), "loaded config");
                c
            }
            None => {
                if args.config.is_some() {
                    tracing::warn!(path = %p.display(), "config file not found, using defaults");
                }
                GatewayConfig::default()
            }
        },
        None => GatewayConfig::default(),
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db) = &args.db {
        config.server.db = Some(db.clone());
    }
    if let Some(token) = &args.token {
        config.server.token = Some(token.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run_server(args: ServerArgs) -> Result<(), CmdgateError> {
    tracing::info!("cmdgate server starting");

    let config = resolve_config(&args)?;
    if config.server.token.is_some() {
        tracing::info!("auth token configured");
    } else if !config.server.bind.ip().is_loopback() {
        tracing::warn!(addr = %config.server.bind, "listening on a non-loopback address without a token");
    }

    let (commands, incidents) = store::open(config.server.db.as_deref())?;
    match &config.server.db {
        Some(path) => tracing::info!(path = %path.display(), "using sqlite store"),
        None => tracing::info!("using in-memory store"),
    }

    let state = api::AppState::new(&config, commands, incidents);
    let shutdown = state.shutdown.clone();
    let registry = state.registry.clone();

    let reaper_handle = reaper::spawn(
        registry.clone(),
        config.registry.reaper_interval(),
        config.registry.heartbeat_timeout(),
        shutdown.clone(),
    );

    let app = api::router(state, api::RouterConfig::from(&config));
    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "HTTP/WS server listening");

    let server_shutdown = shutdown.clone();
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("received Ctrl+C");
        }
        result = &mut http_handle => {
            shutdown.cancel();
            result??;
            return Ok(());
        }
    }

    // Agent sockets send their close frames, the reaper stops, and the HTTP
    // server drains.
    shutdown.cancel();

    if let Err(e) = reaper_handle.await {
        tracing::warn!(?e, "reaper task panicked");
    }
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server stopped with error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }
    registry.close_all();

    tracing::info!("cmdgate server exiting");
    Ok(())
}

// ── Producer mode ──────────────────────────────────────────────────

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

async fn run_submit(
    args: ClientArgs,
    agent: String,
    command_type: String,
    sub_resource: Option<String>,
    incident: Option<String>,
    payload: String,
) -> Result<(), CmdgateError> {
    command_type
        .parse::<CommandType>()
        .map_err(CmdgateError::InvalidArgument)?;
    let payload: serde_json::Value = serde_json::from_str(&payload)
        .map_err(|e| CmdgateError::InvalidArgument(format!("--payload is not valid JSON: {}", e)))?;

    let client = Client::new(args.server, args.token);
    let response = client
        .submit(&SubmitCommand {
            command_type,
            target_agent_id: agent,
            target_sub_resource: sub_resource,
            incident_id: incident,
            payload,
        })
        .await?;
    print_json(&response);
    Ok(())
}

async fn run_status(args: ClientArgs, id: String, results: bool) -> Result<(), CmdgateError> {
    let client = Client::new(args.server, args.token);
    let command = client.command(&id).await?;
    if results {
        let results = client.results(&id).await?;
        print_json(&serde_json::json!({
            "command": command,
            "results": results["results"],
        }));
    } else {
        print_json(&command);
    }
    Ok(())
}

async fn run_agents(args: ClientArgs) -> Result<(), CmdgateError> {
    let client = Client::new(args.server, args.token);
    print_json(&client.agents().await?);
    Ok(())
}
