use clap::Parser;
use schedwatch_client::config::{
    self, ClientConfig, ReconnectPolicy, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX,
};
use schedwatch_client::logging::{init_logging, LogSettings};
use schedwatch_client::{ClientError, NoticeLevel, Session, SessionHandle};
use schedwatch_core::Experiment;
use std::{env, error::Error, path::PathBuf, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use url::Url;

const SUMMARY_INTERVAL_MS: u64 = 1000;

#[derive(Parser, Debug, Default)]
#[command(name = "schedwatch", about = "Mirror a job scheduler's live resource state")]
struct Args {
    /// Full endpoint, e.g. ws://host:8080/web-socket
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    host: String,
    #[arg(long)]
    secure: bool,
    #[arg(long, default_value = "")]
    path: String,
    #[arg(long)]
    keepalive_ms: Option<u64>,
    /// 0 disables call deadlines.
    #[arg(long)]
    call_timeout_ms: Option<u64>,
    /// manual or backoff
    #[arg(long, default_value = "")]
    reconnect: String,
    #[arg(long)]
    backoff_initial_ms: Option<u64>,
    #[arg(long)]
    backoff_max_ms: Option<u64>,
    #[arg(long)]
    max_frame_bytes: Option<u64>,
    #[arg(long)]
    max_inbound_bytes: Option<u64>,
    #[arg(long)]
    queue_capacity: Option<u64>,
    /// Experiment to show instead of the most recent one.
    #[arg(long, default_value = "")]
    experiment: String,
    #[arg(long, default_value_t = 0)]
    experiment_timestamp: i64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let log_dir = resolve_log_dir(&args.log_dir);
    let stdout = resolve_log_stdout(log_dir.is_none());
    let _log_guard = init_logging(&LogSettings { log_dir, stdout });

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("config_error: {err}");
            return Err(err.into());
        }
    };

    let (handle, session_task) = Session::spawn(config);
    run_headless(&handle).await;
    let _ = handle.shutdown().await;
    if let Err(err) = session_task.await {
        warn!("session_join_error: {err}");
    }
    Ok(())
}

/// Stand-in for a UI: logs notices and a throttled store summary.
async fn run_headless(handle: &SessionHandle) {
    let mut revisions = handle.revisions();
    let mut notices = handle.notices();
    let mut ticker = tokio::time::interval(Duration::from_millis(SUMMARY_INTERVAL_MS));
    let mut dirty = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                dirty = true;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => match notice.level {
                    NoticeLevel::Info => info!("notice: {}", notice.message),
                    NoticeLevel::Error => warn!("notice: {}", notice.message),
                },
                Err(RecvError::Lagged(skipped)) => warn!("notices_lagged: {skipped}"),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if dirty {
                    dirty = false;
                    log_summary(handle).await;
                }
            }
            _ = &mut shutdown => {
                info!("shutdown_requested");
                break;
            }
        }
    }
}

async fn log_summary(handle: &SessionHandle) {
    let store = handle.store().await;
    let experiment = store
        .current_experiment()
        .map(|experiment| match experiment.started_at() {
            Some(started) => format!("{}@{}", experiment.name, started.to_rfc3339()),
            None => experiment.name.clone(),
        })
        .unwrap_or_else(|| "-".to_string());
    info!(
        event = "store_summary",
        connected = store.is_connected(),
        experiment = %experiment,
        resources = store.len(),
        counters = %store.counters(),
        revision = store.revision()
    );
}

fn load_config(args: &Args) -> Result<ClientConfig, ClientError> {
    let url = resolve_url(args)?;
    let mut config = ClientConfig::new(url).with_reconnect(resolve_reconnect(args)?);
    if let Some(ms) = resolve_u64(args.keepalive_ms, "SCHEDWATCH_KEEPALIVE_MS")? {
        if ms == 0 {
            return Err(ClientError::Config("keep-alive interval must be positive".to_string()));
        }
        config = config.with_keepalive_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = resolve_u64(args.call_timeout_ms, "SCHEDWATCH_CALL_TIMEOUT_MS")? {
        config = config.with_call_timeout(config::optional_millis(ms));
    }
    if let Some(max) = resolve_u64(args.max_frame_bytes, "SCHEDWATCH_MAX_FRAME_BYTES")? {
        config = config.with_max_frame_bytes(max as usize);
    }
    if let Some(max) = resolve_u64(args.max_inbound_bytes, "SCHEDWATCH_MAX_INBOUND_BYTES")? {
        config = config.with_max_inbound_bytes(max as usize);
    }
    if let Some(capacity) = resolve_u64(args.queue_capacity, "SCHEDWATCH_QUEUE_CAPACITY")? {
        config = config.with_queue_capacity(capacity as usize);
    }
    if let Some(experiment) = resolve_experiment(args) {
        config = config.with_experiment(experiment);
    }
    Ok(config)
}

fn resolve_url(args: &Args) -> Result<Url, ClientError> {
    if let Some(url) = non_empty(&args.url).or_else(|| env_value("SCHEDWATCH_URL")) {
        return Ok(config::parse_ws_url(&url)?);
    }
    let host = non_empty(&args.host)
        .or_else(|| env_value("SCHEDWATCH_HOST"))
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let secure = args.secure || resolve_flag("SCHEDWATCH_SECURE");
    let path = non_empty(&args.path)
        .or_else(|| env_value("SCHEDWATCH_PATH"))
        .unwrap_or_else(|| config::DEFAULT_PATH.to_string());
    Ok(config::endpoint_url(&host, secure, &path)?)
}

fn resolve_reconnect(args: &Args) -> Result<ReconnectPolicy, ClientError> {
    let policy = match non_empty(&args.reconnect).or_else(|| env_value("SCHEDWATCH_RECONNECT")) {
        Some(name) => name.parse::<ReconnectPolicy>().map_err(ClientError::Config)?,
        None => ReconnectPolicy::Manual,
    };
    match policy {
        ReconnectPolicy::Manual => Ok(policy),
        ReconnectPolicy::Backoff { .. } => {
            let initial = resolve_u64(args.backoff_initial_ms, "SCHEDWATCH_BACKOFF_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_INITIAL);
            let max = resolve_u64(args.backoff_max_ms, "SCHEDWATCH_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_MAX);
            if initial.is_zero() || max < initial {
                return Err(ClientError::Config(format!(
                    "invalid backoff: initial {initial:?}, max {max:?}"
                )));
            }
            Ok(ReconnectPolicy::Backoff { initial, max })
        }
    }
}

fn resolve_experiment(args: &Args) -> Option<Experiment> {
    let name = non_empty(&args.experiment).or_else(|| env_value("SCHEDWATCH_EXPERIMENT"))?;
    Some(Experiment::new(name, args.experiment_timestamp))
}

fn resolve_u64(flag: Option<u64>, key: &str) -> Result<Option<u64>, ClientError> {
    if flag.is_some() {
        return Ok(flag);
    }
    match env_value(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|err| ClientError::Config(format!("{key}={value}: {err}"))),
        None => Ok(None),
    }
}

fn resolve_log_dir(flag: &str) -> Option<PathBuf> {
    non_empty(flag)
        .or_else(|| env_value("SCHEDWATCH_LOG_DIR"))
        .map(PathBuf::from)
}

/// Stdout logging defaults to on only when there is no log file.
fn resolve_log_stdout(default: bool) -> bool {
    env::var("SCHEDWATCH_LOG_STDOUT")
        .ok()
        .and_then(|value| config::parse_bool_flag(&value))
        .unwrap_or(default)
}

fn resolve_flag(key: &str) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| config::parse_bool_flag(&value))
        .unwrap_or(false)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_endpoint_flags() {
        let args = Args::parse_from([
            "schedwatch",
            "--host",
            "sched.local:9000",
            "--secure",
            "--call-timeout-ms",
            "0",
            "--experiment",
            "mnist",
        ]);
        let config = load_config(&args).expect("config");
        assert_eq!(config.url.as_str(), "wss://sched.local:9000/web-socket");
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.experiment, Some(Experiment::new("mnist", 0)));

        let args = Args::parse_from([
            "schedwatch",
            "--url",
            "ws://127.0.0.1:1/web-socket",
            "--max-inbound-bytes",
            "1048576",
        ]);
        assert_eq!(load_config(&args).expect("config").max_inbound_bytes, 1_048_576);
    }

    #[test]
    fn explicit_url_wins_over_host() {
        let args = Args {
            url: "ws://10.0.0.2:1234/ws".to_string(),
            host: "ignored:1".to_string(),
            ..Args::default()
        };
        let config = load_config(&args).expect("config");
        assert_eq!(config.url.as_str(), "ws://10.0.0.2:1234/ws");
    }

    #[test]
    fn backoff_flags_are_validated() {
        let args = Args {
            url: "ws://127.0.0.1:1/web-socket".to_string(),
            reconnect: "backoff".to_string(),
            backoff_initial_ms: Some(5000),
            backoff_max_ms: Some(1000),
            ..Args::default()
        };
        assert!(matches!(load_config(&args), Err(ClientError::Config(_))));

        let args = Args {
            backoff_max_ms: Some(20_000),
            ..args
        };
        assert_eq!(
            load_config(&args).expect("config").reconnect,
            ReconnectPolicy::Backoff {
                initial: Duration::from_millis(5000),
                max: Duration::from_millis(20_000),
            }
        );
    }

    #[test]
    fn zero_keepalive_is_rejected() {
        let args = Args {
            url: "ws://127.0.0.1:1/web-socket".to_string(),
            keepalive_ms: Some(0),
            ..Args::default()
        };
        assert!(load_config(&args).is_err());
    }
}
