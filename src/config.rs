// config.rs
use anyhow::Result;
use config::Environment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "CHECKPOINT";

/// What to do with a push whose signature doesn't match the repository secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnInvalidSignature {
    /// Answer 401 and drop the event.
    #[default]
    Reject,
    /// Log a warning and deliver the event anyway.
    AcceptAndLog,
}

/// Process settings. Defaults, overridden by `CHECKPOINT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub host: String,
    /// Overrides the `port` stored in the data file.
    pub port: Option<u16>,
    pub data_file: PathBuf,
    pub webhook_path: String,
    pub delivery_timeout_secs: u64,
    pub on_invalid_signature: OnInvalidSignature,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_env(Environment::with_prefix(ENV_PREFIX))
    }

    pub fn from_env(env: Environment) -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("data_file", "./data.json")?
            .set_default("webhook_path", "/github-checkpoint")?
            .set_default("delivery_timeout_secs", 10_i64)?
            .set_default("on_invalid_signature", "reject")?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}
