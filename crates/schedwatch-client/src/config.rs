use crate::error::ConnectError;
use schedwatch_core::rpc::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_INBOUND_BYTES};
use schedwatch_core::Experiment;
use std::time::Duration;
use url::Url;

pub const DEFAULT_PATH: &str = "/web-socket";
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(120_000);
/// Shorter keep-alive intervals are raised to this.
pub const MIN_KEEPALIVE: Duration = Duration::from_millis(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Reconnect only when asked to.
    #[default]
    Manual,
    /// Reopen after an unexpected close, doubling the delay up to `max`.
    Backoff { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    pub fn backoff() -> Self {
        ReconnectPolicy::Backoff {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
        }
    }

    /// Delay before the next automatic attempt, given the previous one.
    pub fn next_delay(&self, previous: Option<Duration>) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Manual => None,
            ReconnectPolicy::Backoff { initial, max } => Some(match previous {
                None => initial.min(max),
                Some(current) => next_backoff(current, max),
            }),
        }
    }
}

impl std::str::FromStr for ReconnectPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "manual" | "off" | "none" => Ok(ReconnectPolicy::Manual),
            "backoff" | "auto" => Ok(ReconnectPolicy::backoff()),
            other => Err(format!("unknown reconnect policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub url: Url,
    pub keepalive_interval: Duration,
    /// Default deadline for calls; `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    /// Cap on outbound frames.
    pub max_frame_bytes: usize,
    /// Cap on inbound messages; snapshots of large experiments need room.
    pub max_inbound_bytes: usize,
    pub queue_capacity: usize,
    /// Experiment to load instead of the most recent one.
    pub experiment: Option<Experiment>,
}

impl ClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            keepalive_interval: DEFAULT_KEEPALIVE,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            reconnect: ReconnectPolicy::Manual,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_inbound_bytes: DEFAULT_MAX_INBOUND_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            experiment: None,
        }
    }

    pub fn parse(url: &str) -> Result<Self, ConnectError> {
        Ok(Self::new(parse_ws_url(url)?))
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(MIN_KEEPALIVE);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_max_inbound_bytes(mut self, max: usize) -> Self {
        self.max_inbound_bytes = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_experiment(mut self, experiment: Experiment) -> Self {
        self.experiment = Some(experiment);
        self
    }
}

/// Builds `ws(s)://host/path` for a scheduler address.
pub fn endpoint_url(host: &str, secure: bool, path: &str) -> Result<Url, ConnectError> {
    let host = host.trim().trim_end_matches('/');
    let scheme = if secure { "wss" } else { "ws" };
    let path = path.trim();
    let path = if path.is_empty() {
        DEFAULT_PATH.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    parse_ws_url(&format!("{scheme}://{host}{path}"))
}

pub fn parse_ws_url(raw: &str) -> Result<Url, ConnectError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConnectError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none() {
        return Err(ConnectError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Milliseconds to an optional duration; `0` disables.
pub fn optional_millis(value: u64) -> Option<Duration> {
    if value == 0 {
        None
    } else {
        Some(Duration::from_millis(value))
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}
