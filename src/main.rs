//! gsmctl entry point: CLI, router assembly, background loops, shutdown.
//!
//! ## Subcommands
//!
//! - `gsmctl serve` (default) — run the HTTP server
//! - `gsmctl detect` — probe every serial port and print one row per device
//! - `gsmctl ussd <code>` — one-shot USSD exchange without the server

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use gsmctl::state::InboxLog;
use gsmctl::{alert, auth, routes, AppState, Config, Modem, ModemError};

/// SMS/USSD gateway server for GSM modems.
#[derive(Parser)]
#[command(name = "gsmctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Probe every serial port and print one row per device.
    Detect {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run one USSD exchange directly against a port, without the server.
    /// Do not run this while a server instance holds the same device.
    Ussd {
        /// Dialable code, e.g. "*125#".
        code: String,
        /// Serial device path. Discovered when omitted.
        #[arg(long)]
        port: Option<String>,
        /// Overall deadline in seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    match Cli::parse().command {
        None => run_server(None).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        Some(Commands::Detect { config }) => run_detect(config.as_deref()).await,
        Some(Commands::Ussd {
            code,
            port,
            timeout_secs,
            config,
        }) => run_ussd(config.as_deref(), port, &code, timeout_secs).await,
    }
}

/// `gsmctl detect` — exhaustive probe sweep, one row per enumerated port.
async fn run_detect(config_path: Option<&str>) {
    init_cli_tracing();
    let config = Config::load(config_path);
    let report =
        tokio::task::spawn_blocking(move || gsmctl::discover::discover(&config.modem, true))
            .await
            .expect("discovery task panicked");

    if report.probes.is_empty() {
        println!("no serial ports enumerated");
        std::process::exit(1);
    }
    println!(
        "{:<18} {:<16} {:<30} DETAIL",
        "PORT", "STATUS", "DESCRIPTION"
    );
    for probe in &report.probes {
        let detail = probe.error.clone().unwrap_or_else(|| {
            probe.at_reply.replace(['\r', '\n'], " ").trim().to_string()
        });
        println!(
            "{:<18} {:<16} {:<30} {detail}",
            probe.endpoint.path,
            format!("{:?}", probe.status),
            probe.description,
        );
    }
    match &report.winner {
        Some(endpoint) => println!("\nmodem: {}", endpoint.path),
        None => {
            println!("\nno functional modem found");
            std::process::exit(1);
        }
    }
}

/// `gsmctl ussd` — one-shot exchange on a freshly opened port.
async fn run_ussd(config_path: Option<&str>, port: Option<String>, code: &str, timeout_secs: u64) {
    init_cli_tracing();
    if !gsmctl::patterns::USSD_CODE.is_match(code) {
        eprintln!("not a USSD code: {code:?}");
        std::process::exit(2);
    }
    let config = Config::load(config_path);
    let code = code.to_string();

    let result = tokio::task::spawn_blocking(move || {
        let cfg = config.modem;
        let path = port
            .or_else(|| cfg.fixed_port().map(ToString::to_string))
            .or_else(|| gsmctl::discover::discover(&cfg, false).winner.map(|e| e.path));
        let Some(path) = path else {
            return Err(ModemError::DeviceNotFound);
        };
        gsmctl::ussd::execute_oneshot(&cfg, &path, &code, Duration::from_secs(timeout_secs))
    })
    .await
    .expect("ussd task panicked");

    match result {
        Ok(exchange) => {
            println!("{}", exchange.text);
            if exchange.session_active() {
                eprintln!("(session expects a follow-up; status {})", exchange.status);
            }
        }
        Err(e) => {
            eprintln!("ussd failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Quiet tracing for the one-shot subcommands — output belongs to stdout.
fn init_cli_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("gsmctl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    match config.modem.fixed_port() {
        Some(port) => info!("Modem port fixed to {port}"),
        None => info!("Modem port auto-detection enabled"),
    }

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set GSMCTL_API_KEY or update config");
    }

    let alerter = alert::spawn(&config.alert);
    let modem = Modem::spawn(config.modem.clone(), alerter);

    let (inbox_events, _) = broadcast::channel(256);
    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        modem,
        inbox: Arc::new(InboxLog::new()),
        inbox_events,
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/modem", get(routes::modem::status))
        .route("/api/modem/reconnect", post(routes::modem::reconnect))
        .route("/api/sms", post(routes::sms::send))
        .route("/api/sms/inbox", get(routes::sms::inbox))
        .route("/api/sms/recent", get(routes::sms::recent))
        .route(
            "/api/ussd",
            post(routes::ussd::execute).delete(routes::ussd::cancel),
        )
        .route("/api/ussd/reply", post(routes::ussd::reply))
        .route("/api/ussd/support", get(routes::ussd::support))
        .route("/api/ports", get(routes::ports::list))
        .route("/api/ports/diagnostics", get(routes::ports::diagnostics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Health-check loop: handshake every interval, reconnect on failure.
    // Requests queue on the modem I/O thread, so a reconnect can never race
    // an in-flight operation.
    let health_state = state.clone();
    let health_task = tokio::spawn(async move {
        let secs = health_state.config.modem.health_check_interval_secs;
        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        loop {
            interval.tick().await;
            if health_state.modem.health_check().await {
                continue;
            }
            warn!("modem health check failed, attempting reconnect");
            match health_state.modem.reconnect().await {
                Ok(status) => info!(
                    "modem reconnected on {}",
                    status.port.as_deref().unwrap_or("?")
                ),
                // Discovery exhaustion already fired the alert side-channel.
                Err(e) => warn!("reconnect failed: {e}"),
            }
        }
    });

    // Inbox poller: drain SIM storage, publish each message, keep a ring of
    // recent ones for /api/sms/recent.
    let poll_state = state.clone();
    let inbox_task = tokio::spawn(async move {
        let secs = poll_state.config.modem.inbox_poll_interval_secs;
        let delete = poll_state.config.modem.delete_after_read;
        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        loop {
            interval.tick().await;
            match poll_state.modem.read_inbox(delete).await {
                Ok(messages) => {
                    for message in messages {
                        poll_state
                            .inbox
                            .received_total
                            .fetch_add(1, Ordering::Relaxed);
                        let _ = poll_state.inbox_events.send(json!({
                            "type": "sms.received",
                            "sender": message.sender,
                            "timestamp": message.timestamp,
                            "body": message.body,
                        }));
                        poll_state.inbox.push(message).await;
                    }
                }
                Err(ModemError::NotConnected) => {}
                Err(e) => debug!("inbox poll failed: {e}"),
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    health_task.abort();
    inbox_task.abort();
    info!("Goodbye");
}
