use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::Context;

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Outbound frames queued per socket before a send counts as failed.
    pub outbound_buffer: usize,
    pub write_timeout: Duration,
    /// Change-feed capacity per collection; a watcher further behind than this stops.
    pub watch_buffer: usize,
    /// How long a new room waits for its owner's socket. Zero disables the check.
    pub owner_grace: Duration,
    pub session_expiry_minutes: i64,
    /// Header set by a trusted gateway carrying the caller's email.
    pub trusted_email_header: Option<String>,
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:lobbycast.db?mode=rwc".to_owned(),
            bind_address: "0.0.0.0:9990".to_owned(),
            outbound_buffer: 64,
            write_timeout: Duration::from_millis(5000),
            watch_buffer: 1024,
            owner_grace: Duration::from_secs(30),
            session_expiry_minutes: 60,
            trusted_email_header: None,
            json_logs: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            database_url: dotenv::var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_address: dotenv::var("LOBBY_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            outbound_buffer: var_or("LOBBY_OUTBOUND_BUFFER", defaults.outbound_buffer)?,
            write_timeout: Duration::from_millis(var_or(
                "LOBBY_WRITE_TIMEOUT_MS",
                defaults.write_timeout.as_millis() as u64,
            )?),
            watch_buffer: var_or("LOBBY_WATCH_BUFFER", defaults.watch_buffer)?,
            owner_grace: Duration::from_secs(var_or(
                "LOBBY_OWNER_GRACE_SECS",
                defaults.owner_grace.as_secs(),
            )?),
            session_expiry_minutes: var_or(
                "LOBBY_SESSION_EXPIRY_MINUTES",
                defaults.session_expiry_minutes,
            )?,
            trusted_email_header: dotenv::var("LOBBY_TRUSTED_EMAIL_HEADER")
                .ok()
                .filter(|h| !h.is_empty()),
            json_logs: var_or("LOBBY_JSON_LOGS", defaults.json_logs)?,
        })
    }
}

fn var_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match dotenv::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        Err(_) => Ok(default),
    }
}
