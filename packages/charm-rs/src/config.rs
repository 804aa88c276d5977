use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

use crate::dispatch::{run_with_timeout, Charm, DEFAULT_LOCK_TIMEOUT};
use crate::snapshot::Snapshot;
use crate::telemetry::init_tracing;

/// Default location of the state file, relative to the charm directory.
pub const DEFAULT_STATE_PATH: &str = ".unit-state.db";

/// Invocation settings loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub event_kind: String,
    pub event_data: Snapshot,
    pub state_path: PathBuf,
    pub lock_timeout: Duration,
}

impl RunConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let event_kind = match lookup("CHARM_DISPATCH_EVENT") {
            Some(kind) => kind,
            None => {
                let path = lookup("JUJU_DISPATCH_PATH")
                    .context("CHARM_DISPATCH_EVENT or JUJU_DISPATCH_PATH must be set")?;
                event_from_dispatch_path(&path)?
            }
        };

        let event_data = match lookup("CHARM_EVENT_DATA") {
            Some(raw) => {
                let value = serde_json::from_str(&raw).context("CHARM_EVENT_DATA must be valid JSON")?;
                Snapshot::from_value(value).context("CHARM_EVENT_DATA must be a JSON object")?
            }
            None => Snapshot::new(),
        };

        let state_path = lookup("CHARM_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH));

        let lock_timeout = match lookup("CHARM_LOCK_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .context("CHARM_LOCK_TIMEOUT_SECS must be a whole number of seconds")?,
            ),
            None => DEFAULT_LOCK_TIMEOUT,
        };

        Ok(Self {
            event_kind,
            event_data,
            state_path,
            lock_timeout,
        })
    }
}

/// Event kind for an orchestrator dispatch path.
///
/// `hooks/config-changed` becomes `config_changed`, `actions/do-backup` becomes
/// `do_backup_action`.
pub fn event_from_dispatch_path(path: &str) -> Result<String> {
    let (prefix, name) = match path.split_once('/') {
        Some(parts) => parts,
        None => bail!("dispatch path {path:?} has no hooks/ or actions/ prefix"),
    };
    if name.is_empty() || name.contains('/') {
        bail!("dispatch path {path:?} does not name a single event");
    }

    let kind = name.replace('-', "_");
    match prefix {
        "hooks" => Ok(kind),
        "actions" => Ok(format!("{kind}_action")),
        other => bail!("unknown dispatch path prefix {other:?} in {path:?}"),
    }
}

/// Process entry point: set up logging, read the environment, run charm `C`.
///
/// Returns the exit code to hand to `std::process::exit`.
pub fn run_from_env<C: Charm>() -> i32 {
    init_tracing();
    match RunConfig::from_env() {
        Ok(config) => run_with_timeout::<C>(
            &config.event_kind,
            config.event_data,
            &config.state_path,
            config.lock_timeout,
        ),
        Err(e) => {
            tracing::error!(error = ?e, "invalid invocation environment");
            crate::error::EXIT_ABORTED
        }
    }
}
