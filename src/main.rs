//! RRDP sync worker - main entry point.
//!
//! This binary connects to the parent's control socket and runs the
//! scheduler until the parent closes the channel or breaks protocol.

#![cfg(unix)]

use std::path::PathBuf;

use rrdp_sync::control::transport;
use rrdp_sync::scheduler::Scheduler;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the worker.
///
/// The parent is expected to set these when spawning the worker; the
/// defaults only serve local experimentation.
struct Config {
    /// Path of the parent's Unix control socket.
    control_socket: PathBuf,
}

impl Config {
    /// Loads configuration from environment variables with defaults.
    fn from_env() -> Self {
        let control_socket = std::env::var("RRDP_CONTROL_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./rrdp-sync.sock"));

        Config { control_socket }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rrdp_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    tracing::info!(
        socket = %config.control_socket.display(),
        "starting RRDP sync worker"
    );

    let socket = std::os::unix::net::UnixStream::connect(&config.control_socket)
        .expect("failed to connect to the control socket");
    let link = transport::spawn(socket).expect("failed to start the control transport");

    match Scheduler::new(link).run().await {
        Ok(()) => tracing::info!("worker exiting"),
        Err(e) => {
            tracing::error!(error = %e, "worker aborting");
            std::process::exit(1);
        }
    }
}
