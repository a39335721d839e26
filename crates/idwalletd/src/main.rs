use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod providers;
mod rate_limiter;
mod store;

use config::Config;
use dbus_interface::{AppState, VerifierService};
use providers::{CommandLine, CommandProviders};
use rate_limiter::RateLimiter;
use store::VerifiedIdentityStore;

const BUS_NAME: &str = "org.idwallet.Verifier1";
const OBJECT_PATH: &str = "/org/idwallet/Verifier1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "idwalletd starting");

    let config = Config::from_env();

    let ocr = CommandLine::parse(&config.ocr_command).context("IDWALLET_OCR_COMMAND is empty")?;
    let faces =
        CommandLine::parse(&config.face_command).context("IDWALLET_FACE_COMMAND is empty")?;
    tracing::info!(ocr = %ocr.program, faces = %faces.program, "providers configured");

    let store = VerifiedIdentityStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "verification store opened");

    let session_bus = config.session_bus;
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(AppState {
        rate_limiter: RateLimiter::new(config.rate_limits()),
        config,
        providers: Arc::new(CommandProviders { ocr, faces }),
        sessions: HashMap::new(),
        store,
        completions: completions_tx,
    }));

    tokio::spawn(dbus_interface::record_completions(
        state.clone(),
        completions_rx,
    ));

    let service = VerifierService {
        state: state.clone(),
    };
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if session_bus { "session" } else { "system" },
        name = BUS_NAME,
        "idwalletd ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("idwalletd shutting down");

    let sessions: Vec<_> = state.lock().await.sessions.drain().map(|(_, h)| h).collect();
    for handle in sessions {
        tracing::debug!(session = handle.id(), "cancelling session");
        let _ = handle.cancel().await;
    }

    Ok(())
}
