//! Client and gateway settings.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ClientError;

pub const DEFAULT_API_URL: &str = "https://api.hiven.io/v1";
pub const DEFAULT_GATEWAY_URL: &str = "wss://swarm-dev.hiven.io/socket?encoding=json&compression=text_json";

/// How decoded events reach the registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One worker runs events one after another, in arrival order.
    #[default]
    Queued,
    /// Every event gets its own task. Handlers of a single event still run
    /// in registration order.
    Concurrent,
}

/// Reconnect delay bounds. The delay doubles per failed attempt, starting
/// at `initial` and never exceeding `max` (jitter included).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the computed delay, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub gateway_url: String,
    /// Overrides the interval announced by the Hello frame.
    pub heartbeat_interval: Option<Duration>,
    /// How long an ack may take after a heartbeat was sent. `None` means
    /// "before the next heartbeat is due".
    pub heartbeat_ack_timeout: Option<Duration>,
    /// Consecutive unacknowledged heartbeats before the link counts as dead.
    pub missed_heartbeat_limit: u32,
    pub connect_timeout: Duration,
    /// Bound on Hello after connecting and on Ready after identifying.
    pub ready_timeout: Duration,
    pub write_timeout: Duration,
    pub close_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
    /// 0 = unlimited.
    pub max_reconnect_attempts: u32,
    pub dispatch_mode: DispatchMode,
    /// Events waiting for the worker in `Queued` mode before new ones are
    /// dropped.
    pub event_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            heartbeat_interval: None,
            heartbeat_ack_timeout: None,
            missed_heartbeat_limit: 1,
            connect_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(40),
            request_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: 0,
            dispatch_mode: DispatchMode::default(),
            event_queue_capacity: 1024,
        }
    }
}

impl GatewayConfig {
    /// Defaults overlaid with whatever the environment sets:
    ///
    /// - `HIVEN_HOST` / `HIVEN_API_VERSION` build the REST base url
    /// - `WS_ENDPOINT` is the gateway url
    /// - `WS_HEARTBEAT` (ms) overrides the heartbeat interval
    /// - `WS_CLOSE_TIMEOUT` (s) bounds `close()`
    /// - `HIVEN_MAX_RECONNECTS` caps reconnect attempts
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = Self::default();

        let host = env::var("HIVEN_HOST").ok();
        let version = env::var("HIVEN_API_VERSION").ok();
        if host.is_some() || version.is_some() {
            let host = host.unwrap_or_else(|| "api.hiven.io".to_string());
            let version = version.unwrap_or_else(|| "v1".to_string());
            config.api_url = if host.contains("://") {
                format!("{}/{}", host.trim_end_matches('/'), version)
            } else {
                format!("https://{}/{}", host, version)
            };
        }
        if let Ok(endpoint) = env::var("WS_ENDPOINT") {
            config.gateway_url = endpoint;
        }
        if let Some(ms) = parse_env::<u64>("WS_HEARTBEAT")? {
            config.heartbeat_interval = Some(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_env::<u64>("WS_CLOSE_TIMEOUT")? {
            config.close_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_env::<u32>("HIVEN_MAX_RECONNECTS")? {
            config.max_reconnect_attempts = max;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let api = Url::parse(&self.api_url)
            .map_err(|e| ClientError::Config(format!("api_url '{}': {}", self.api_url, e)))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "api_url must be http(s), got '{}'",
                api.scheme()
            )));
        }

        let gateway = Url::parse(&self.gateway_url).map_err(|e| {
            ClientError::Config(format!("gateway_url '{}': {}", self.gateway_url, e))
        })?;
        if !matches!(gateway.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(format!(
                "gateway_url must be ws(s), got '{}'",
                gateway.scheme()
            )));
        }

        if self.missed_heartbeat_limit == 0 {
            return Err(ClientError::Config(
                "missed_heartbeat_limit must be at least 1".into(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ClientError::Config("event_queue_capacity must be at least 1".into()));
        }
        if self.heartbeat_interval.is_some_and(|d| d.is_zero()) {
            return Err(ClientError::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ClientError::Config(format!(
                "backoff initial {:?} exceeds max {:?}",
                self.backoff.initial, self.backoff.max
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ClientError::Config("backoff jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ClientError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("{}='{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_http_gateway_url() {
        let config = GatewayConfig {
            gateway_url: "https://swarm.hiven.io/socket".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_inverted_backoff_and_zero_limit() {
        let mut config = GatewayConfig::default();
        config.backoff.initial = Duration::from_secs(120);
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            missed_heartbeat_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            event_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unset_env_var_parses_to_none() {
        let parsed: Option<u64> = parse_env("HIVEN_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert!(parsed.is_none());
    }
}
