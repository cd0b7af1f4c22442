use std::path::PathBuf;

use anyhow::Context;

/// Runtime settings, all environment-derived.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    /// Where the trained classifier artifact is persisted and reloaded.
    pub model_path: PathBuf,
    /// Idle sleep between queue polls in the worker loop.
    pub worker_poll_ms: u64,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let model_path = std::env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("models/supervised.json"));

        let worker_poll_ms = std::env::var("WORKER_POLL_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1_000);

        Ok(Self {
            database_url,
            model_path,
            worker_poll_ms,
        })
    }
}
