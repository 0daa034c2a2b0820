//! Standalone aggregation worker.
//!
//! Shares the Postgres-backed queue, store and cache with the API server,
//! so any number of these can run next to it. Stops on Ctrl+C after the
//! job in progress is settled.

use anyhow::{bail, Result};
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;

use fieldpulse::{
    backends::Backends,
    cancel_on_ctrl_c,
    config::{self, StoreBackend},
    telemetry,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    telemetry::init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    if cfg.store_backend == StoreBackend::Memory {
        bail!("fieldpulse-worker requires STORE_BACKEND=postgres; the memory backend is process-local");
    }

    let backends = Backends::connect(&cfg).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    backends.worker(cfg.worker_options()).run(shutdown).await;
    Ok(())
}
