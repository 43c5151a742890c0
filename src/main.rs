use std::process::ExitCode;
use std::time::Duration;

use announcement_monitor::dispatch::ntfy::Priority;
use announcement_monitor::dispatch::{LogSink, NotificationSink, NtfySink};
use announcement_monitor::ws::config::{Config, DEFAULT_TOPIC};
use announcement_monitor::{DEFAULT_ENDPOINT, Monitor};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Watch an exchange announcement stream and forward new announcements.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// WebSocket endpoint of the announcement stream
    #[arg(long, env = "MONITOR_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Topic to subscribe to once connected
    #[arg(long, env = "MONITOR_TOPIC", default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Do not send a subscribe command after connecting
    #[arg(long)]
    no_subscribe: bool,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Delay before the first reconnection attempt, in milliseconds
    #[arg(long, env = "RECONNECT_BASE_MS")]
    reconnect_base_ms: Option<u64>,

    /// Upper bound on the reconnection delay, in milliseconds
    #[arg(long, env = "RECONNECT_MAX_MS")]
    reconnect_max_ms: Option<u64>,

    /// Seconds between keepalive PINGs
    #[arg(long, env = "PING_INTERVAL_SECS")]
    ping_interval_secs: Option<u64>,

    /// Seconds to wait for a PONG before reconnecting
    #[arg(long, env = "LIVENESS_TIMEOUT_SECS")]
    liveness_timeout_secs: Option<u64>,

    /// Uptime after which a session counts as stable and the backoff resets
    #[arg(long, env = "STABILITY_WINDOW_SECS")]
    stability_window_secs: Option<u64>,

    /// ntfy server; announcements are only logged when unset
    #[arg(long, env = "NTFY_URL", requires = "ntfy_topic")]
    ntfy_url: Option<String>,

    /// ntfy topic to publish to
    #[arg(long, env = "NTFY_TOPIC")]
    ntfy_topic: Option<String>,

    /// ntfy priority: min, low, default, high, urgent or 1-5
    #[arg(long, env = "NTFY_PRIORITY", default_value = "default")]
    ntfy_priority: Priority,

    /// Comma separated ntfy tags
    #[arg(long, env = "NTFY_TAGS", value_delimiter = ',')]
    ntfy_tags: Vec<String>,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::default();
        config.subscribe_topic = (!self.no_subscribe).then(|| self.topic.clone());

        if let Some(ms) = self.reconnect_base_ms {
            config.reconnect.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_max_ms {
            config.reconnect.max_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = self.ping_interval_secs {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.liveness_timeout_secs {
            config.liveness_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.stability_window_secs {
            config.reconnect.stability_window = Duration::from_secs(secs);
        }
        config
    }

    fn sink(&self) -> Box<dyn NotificationSink> {
        match (&self.ntfy_url, &self.ntfy_topic) {
            (Some(server), Some(topic)) => {
                info!(%server, %topic, "Forwarding announcements to ntfy");
                Box::new(
                    NtfySink::builder()
                        .server(server.as_str())
                        .topic(topic.as_str())
                        .priority(self.ntfy_priority)
                        .tags(self.ntfy_tags.clone())
                        .build(),
                )
            }
            _ => Box::new(LogSink),
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel `token` on Ctrl-C or, on Unix, SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
        () = token.cancelled() => return,
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> ExitCode {
    _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let monitor = match Monitor::new(&cli.endpoint, cli.config(), cli.sink()) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let stats = monitor.run(shutdown).await;
    info!(
        dispatched = stats.dispatched,
        duplicates = stats.duplicates,
        sink_failures = stats.sink_failures,
        "Shut down cleanly"
    );
    ExitCode::SUCCESS
}
