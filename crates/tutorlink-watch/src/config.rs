//! Runner configuration loaded from environment variables.
//!
//! Everything has a default, so the runner starts with no configuration at
//! all; it then simply waits for a sign-in that never comes.

use std::path::PathBuf;
use std::time::Duration;

use tutorlink_core::Identifier;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// SQLite database file.
    /// Env: `TUTORLINK_DB_PATH`
    /// Default: `tutorlink.db` in the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Identity to sign in as.
    /// Env: `TUTORLINK_USER`
    /// Default: none (stay signed out).
    pub user: Option<Identifier>,

    /// Counterparties whose unread messages are counted.
    /// Env: `TUTORLINK_COUNTERPARTIES` (comma separated)
    pub counterparties: Vec<Identifier>,

    /// Counterparty whose conversation feed is followed.
    /// Env: `TUTORLINK_CONVERSATION_WITH`
    pub conversation_with: Option<Identifier>,

    /// Player command run for every notification, e.g. `paplay ding.oga`.
    /// Env: `TUTORLINK_CUE_COMMAND`
    /// Default: log the notification only.
    pub cue_command: Option<String>,

    /// How often live queries are re-evaluated against the database file.
    /// Env: `TUTORLINK_POLL_SECS`
    /// Default: 2 seconds.
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            user: None,
            counterparties: Vec::new(),
            conversation_with: None,
            cue_command: None,
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl WatchConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get("TUTORLINK_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        config.user = get("TUTORLINK_USER").and_then(|v| identifier("TUTORLINK_USER", &v));

        if let Some(list) = get("TUTORLINK_COUNTERPARTIES") {
            config.counterparties = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| identifier("TUTORLINK_COUNTERPARTIES", s))
                .collect();
        }

        config.conversation_with = get("TUTORLINK_CONVERSATION_WITH")
            .and_then(|v| identifier("TUTORLINK_CONVERSATION_WITH", &v));

        config.cue_command = get("TUTORLINK_CUE_COMMAND");

        if let Some(val) = get("TUTORLINK_POLL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.poll_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid TUTORLINK_POLL_SECS, using default"),
            }
        }

        config
    }
}

fn identifier(var: &str, value: &str) -> Option<Identifier> {
    match Identifier::parse(value) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(var, value, error = %e, "Ignoring invalid identifier");
            None
        }
    }
}
