//! ICB bridge -- relays an ICB group into a Matrix room.
//!
//! Connects to the ICB server, joins the configured group, and serves the
//! application-service transaction endpoint the home server pushes room
//! events to.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config file (~/.config/icb-bridge/config.toml)
//! cargo run --bin icb-bridge
//!
//! # Explicit config file and bind address
//! cargo run --bin icb-bridge -- --config ./bridge.toml --bind 127.0.0.1:9000
//!
//! # Print the registration file for the home server
//! cargo run --bin icb-bridge -- --config ./bridge.toml --genyaml > icb.yaml
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use icb_bridge::config::{BridgeCliArgs, BridgeConfig, BridgeSettings};
use icb_bridge::transactions::{self, BridgeState};
use icb_bridge::{link, login, read_loop, registration, supervisor};
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = BridgeCliArgs::parse();

    let file = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    if cli.genyaml {
        match registration::render(&file) {
            Ok(yaml) => {
                print!("{yaml}");
                return;
            }
            Err(e) => {
                eprintln!("Error generating registration: {e}");
                std::process::exit(1);
            }
        }
    }

    let settings = match BridgeSettings::resolve(&cli, &file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let log_guard = init_logging(&settings.log_level, cli.log_file.as_deref());

    tracing::info!(server = %settings.server_addr, "starting icb bridge");

    let group = match link::connect(&settings.server_addr).await {
        Ok(group) => group,
        Err(e) => {
            tracing::error!(server = %settings.server_addr, error = %e, "failed to connect to group server");
            std::process::exit(1);
        }
    };

    let read_task = read_loop::spawn(group.reader, group.writer.clone());

    if let Err(e) = login::login(&group.writer, &settings.nick, &settings.group).await {
        tracing::error!(error = %e, "failed to send login");
        std::process::exit(1);
    }

    let state = Arc::new(
        BridgeState::new(group.writer, settings.user_prefix.clone())
            .with_hs_token(settings.hs_token.clone())
            .with_echo_policy(settings.echo_policy),
    );

    let server_task = match transactions::start_server(&settings.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "transaction receiver listening");
            handle
        }
        Err(e) => {
            tracing::error!(addr = %settings.bind_addr, error = %e, "failed to start transaction receiver");
            std::process::exit(1);
        }
    };

    let shutdown = supervisor::supervise(read_task, group.writer_task, server_task).await;
    drop(log_guard);
    std::process::exit(shutdown.exit_code());
}

/// Initialize logging.
///
/// Logs go to standard output unless a log file is given. With a file, the
/// returned [`WorkerGuard`] must be held until shutdown so buffered entries
/// are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_target = file_path.and_then(|path| Some((path.parent()?, path.file_name()?)));
    let Some((log_dir, file_name)) = file_target else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
