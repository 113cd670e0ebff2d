use std::str::FromStr;
use std::time::Duration;

use metascan_events::{ChannelName, ReplayPosition};

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Session configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local job service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the job-processing service.
    pub job_service_url: String,
    /// WebSocket endpoint of the event channel relay.
    pub events_ws_url: String,
    /// Channel carrying job completion events.
    pub event_channel: ChannelName,
    /// Where a new subscription starts reading.
    pub replay_from: ReplayPosition,
    /// Apply each event instance at most once.
    pub dedupe_events: bool,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long deactivation waits for the delivery task (default: `5`).
    pub shutdown_timeout_secs: u64,
    /// Panic on a second concurrent activation instead of returning an
    /// error (default: on in debug builds).
    pub strict_usage: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            job_service_url: "http://localhost:8080".into(),
            events_ws_url: "ws://localhost:8080/events".into(),
            event_channel: ChannelName::default(),
            replay_from: ReplayPosition::Latest,
            dedupe_events: false,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            strict_usage: cfg!(debug_assertions),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                       |
    /// |-------------------------|-------------------------------|
    /// | `JOB_SERVICE_URL`       | `http://localhost:8080`       |
    /// | `EVENTS_WS_URL`         | `ws://localhost:8080/events`  |
    /// | `EVENT_CHANNEL`         | `/event/BatchJobComplete__e`  |
    /// | `EVENT_REPLAY_FROM`     | `-1` (also `latest`, `all`)   |
    /// | `DEDUPE_EVENTS`         | `false`                       |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                          |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `5`                           |
    /// | `STRICT_USAGE`          | `true` in debug builds        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads values through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let job_service_url = lookup("JOB_SERVICE_URL").unwrap_or(defaults.job_service_url);
        let events_ws_url = lookup("EVENTS_WS_URL").unwrap_or(defaults.events_ws_url);
        let event_channel = lookup("EVENT_CHANNEL")
            .filter(|s| !s.trim().is_empty())
            .map(ChannelName::new)
            .unwrap_or(defaults.event_channel);

        let replay_from = parse_var(
            &lookup,
            "EVENT_REPLAY_FROM",
            "-1, -2, a replay id, `latest` or `all`",
            defaults.replay_from,
        )?;
        let dedupe_events = parse_var(&lookup, "DEDUPE_EVENTS", "true or false", defaults.dedupe_events)?;
        let request_timeout_secs = parse_var(
            &lookup,
            "REQUEST_TIMEOUT_SECS",
            "a valid u64",
            defaults.request_timeout_secs,
        )?;
        let shutdown_timeout_secs = parse_var(
            &lookup,
            "SHUTDOWN_TIMEOUT_SECS",
            "a valid u64",
            defaults.shutdown_timeout_secs,
        )?;

        let strict_usage = parse_var(&lookup, "STRICT_USAGE", "true or false", defaults.strict_usage)?;

        Ok(Self {
            job_service_url,
            events_ws_url,
            event_channel,
            replay_from,
            dedupe_events,
            request_timeout_secs,
            shutdown_timeout_secs,
            strict_usage,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value,
        }),
    }
}
