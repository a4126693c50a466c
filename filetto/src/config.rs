use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::lookup_host;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub game: GameConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: SocketAddr,
    pub listener_backlog: i32,
    pub socket_recv_buffer_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub disable: bool,
}

#[derive(Debug, Clone)]
pub struct GameConfig {
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_creates: u32,
    pub results_buffer_size: usize,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Filetto realtime matchmaking and game-session coordinator", long_about = None)]
pub struct Cli {
    /// WebSocket listener address (IP or FQDN)
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub ws_address: String,

    /// TCP listen backlog for the WebSocket listener socket
    #[arg(long, default_value_t = 1024)]
    pub ws_listener_backlog: i32,

    /// Requested SO_RCVBUF size in bytes for accepted sockets
    #[arg(long)]
    pub ws_socket_recv_buffer_bytes: Option<usize>,

    /// Redis connection URL for the shared lobby/session store
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// Disable the shared store and keep state in-process
    /// (single-node development only; state does not survive restarts)
    #[arg(long)]
    pub store_disable: bool,

    /// Reconnect grace period in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub grace_period_ms: u64,

    /// Interval (in seconds) between cleanup sweeps
    #[arg(long, default_value_t = 300)]
    pub sweep_interval: u64,

    /// Lobby-creation rate limit window in seconds
    #[arg(long, default_value_t = 60)]
    pub rate_limit_window: u64,

    /// Lobby creations allowed per user per window
    #[arg(long, default_value_t = 1)]
    pub rate_limit_max_creates: u32,

    /// Buffer capacity for the game-result handoff channel
    #[arg(long, default_value_t = 1024)]
    pub results_buffer_size: usize,

    /// Metrics listener address (IP or FQDN) for Prometheus endpoint
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_address: String,

    /// Set the verbosity level
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

fn set_logging(cli: &Cli) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_max_level(cli.verbose.tracing_level_filter())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn set_metrics(metrics_address: SocketAddr) {
    let prom_builder = PrometheusBuilder::new();
    prom_builder
        .with_http_listener(metrics_address)
        .install()
        .expect("Failed to install Prometheus metrics exporter");

    // Connection metrics
    metrics::describe_gauge!("filetto_connections", "Currently connected players");
    metrics::describe_counter!(
        "filetto_client_events_total",
        "Total number of client events dispatched, by type"
    );
    metrics::describe_counter!(
        "filetto_auth_failures_total",
        "Total number of failed connection authentications"
    );
    metrics::describe_counter!(
        "filetto_reconnects_total",
        "Total number of reconnects within the grace window"
    );
    metrics::describe_counter!(
        "filetto_grace_expired_total",
        "Total number of grace periods that expired without a reconnect"
    );

    // Lobby metrics
    metrics::describe_counter!("filetto_lobbies_created_total", "Total number of lobbies created");
    metrics::describe_counter!("filetto_lobbies_deleted_total", "Total number of lobbies deleted");
    metrics::describe_counter!(
        "filetto_rate_limited_total",
        "Total number of lobby creations rejected by the rate limiter"
    );

    // Session metrics
    metrics::describe_counter!(
        "filetto_sessions_started_total",
        "Total number of game sessions started"
    );
    metrics::describe_counter!(
        "filetto_sessions_ended_total",
        "Total number of game sessions ended, by reason"
    );
    metrics::describe_counter!("filetto_moves_total", "Total number of moves applied");
    metrics::describe_counter!(
        "filetto_move_timeouts_total",
        "Total number of sessions resolved by move timeout"
    );
    metrics::describe_counter!(
        "filetto_results_recorded_total",
        "Total number of final game results handed to the result sink"
    );

    // Maintenance metrics
    metrics::describe_counter!("filetto_sweeps_total", "Total number of cleanup sweeps completed");
    metrics::describe_counter!(
        "filetto_cache_reconciled_total",
        "Total number of cached lobbies reconciled against the store"
    );
}

pub async fn resolve_address(address: String) -> Result<SocketAddr> {
    match lookup_host(&address).await?.next() {
        Some(addr) => Ok(addr),
        None => anyhow::bail!("Failed to resolve address: {}", address),
    }
}

pub async fn configure() -> Result<AppConfig> {
    let cli = Cli::parse();

    // Set up tracing
    set_logging(&cli).map_err(|e| anyhow::anyhow!("Failed to set up logging: {}", e))?;

    // Resolve addresses
    let (ws_addr, metrics_addr) = tokio::try_join!(
        resolve_address(cli.ws_address),
        resolve_address(cli.metrics_address)
    )
    .map_err(|e| anyhow::anyhow!("Failed during initial address resolution: {}", e))?;

    // Set up metrics
    set_metrics(metrics_addr);

    Ok(AppConfig {
        server: ServerConfig {
            host: ws_addr,
            listener_backlog: cli.ws_listener_backlog,
            socket_recv_buffer_bytes: cli.ws_socket_recv_buffer_bytes,
        },
        store: StoreConfig {
            url: cli.store_url,
            disable: cli.store_disable,
        },
        game: GameConfig {
            grace_period: Duration::from_millis(cli.grace_period_ms),
            sweep_interval: Duration::from_secs(cli.sweep_interval),
            rate_limit_window: Duration::from_secs(cli.rate_limit_window),
            rate_limit_max_creates: cli.rate_limit_max_creates,
            results_buffer_size: cli.results_buffer_size,
        },
    })
}
