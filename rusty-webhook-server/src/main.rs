use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};
use log::LevelFilter;
use tokio::signal;

mod config;
mod process;
mod routes;
mod supervisor;
mod watcher;

use supervisor::{Settings, Supervisor, SupervisorError};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SupervisorError> {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .filter(Some("tower_http"), LevelFilter::Debug)
        .filter(Some("rusty_webhook_server"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let CliArgs {
        config,
        host,
        port,
        reload_backoff,
        shutdown_grace,
    } = CliArgs::parse();

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        api_version = rusty_webhook_api::api::VERSION,
        config:debug;
        "Initializing server"
    );

    let supervisor = Supervisor::new(Settings {
        config,
        host,
        port: port.get(),
        reload_backoff: Duration::from_secs(reload_backoff),
        shutdown_grace: Duration::from_secs(shutdown_grace),
    })
    .inspect_err(|e| log::error!("{e}"))?;

    tokio::select! {
        () = supervisor.run() => {}
        () = shutdown_signal() => {}
    }
    Ok(())
}

#[derive(Parser)]
struct CliArgs {
    /// The json file mapping endpoints to commands, reloaded on every change.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_hint = ValueHint::FilePath,
        default_value = "./config.json",
        env = "RUSTY_WEBHOOK_CONFIG",
    )]
    config: PathBuf,
    /// The host address for the rusty-webhook server.
    #[arg(
        long,
        value_name = "URI",
        value_hint = ValueHint::Hostname,
        default_value = "0.0.0.0",
        env = "RUSTY_WEBHOOK_HOST",
    )]
    host: String,
    /// The host port for the rusty-webhook server.
    #[arg(
        short,
        long,
        value_name = "PORT",
        value_hint = ValueHint::Other,
        default_value = "8080",
        env = "RUSTY_WEBHOOK_PORT",
    )]
    port: std::num::NonZeroU16,
    /// Seconds to wait before loading again after an invalid config or a bind failure.
    #[arg(
        long,
        value_name = "SECONDS",
        default_value = "10",
        env = "RUSTY_WEBHOOK_RELOAD_BACKOFF"
    )]
    reload_backoff: u64,
    /// Seconds a replaced generation may spend finishing in-flight requests.
    #[arg(
        long,
        value_name = "SECONDS",
        default_value = "5",
        env = "RUSTY_WEBHOOK_SHUTDOWN_GRACE"
    )]
    shutdown_grace: u64,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT (ctrl+c) handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("received SIGINT (ctrl+c), shutting down"),
        () = terminate => log::info!("received SIGTERM, shutting down"),
    }
}
