//! Environment-keyed configuration.
//!
//! Every key is optional and falls back to a default suited to running
//! behind a fleet load balancer. Durations accept the humantime grammar
//! ("5s", "250ms") or a bare number of seconds.

use crate::errors::IngestError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_DATAPOINT_ENDPOINT: &str = "https://ingest.signalfx.com/v2/datapoint";
const DEFAULT_EVENT_ENDPOINT: &str = "https://ingest.signalfx.com/v2/event";

#[derive(Debug, Clone)]
pub struct Config {
    /// Data listener port (`POPS_PORT`). Port 0 asks the OS for one.
    pub ingest_port: u16,
    /// Admin/introspection listener port (`POPS_ADMIN_PORT`).
    pub admin_port: u16,
    /// Header the token is read from (`POPS_TOKEN_HEADER`).
    pub token_header: String,
    pub graceful: GracefulConfig,
    pub sink: SinkConfig,
    /// Instance identifier dimension (`SF_SOURCE_NAME`).
    pub source_name: String,
    /// Token for the self-reporting collaborator (`SF_METRICS_AUTH_TOKEN`).
    pub metrics_auth_token: String,
    pub statsd: Option<StatsdConfig>,
    /// When set, JSON logs go to `pops.log.json` under this directory
    /// (`LOG_DIR`); otherwise logs go to stderr.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GracefulConfig {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub check_interval: Duration,
    pub silent_time: Duration,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub datapoint_endpoint: Url,
    pub event_endpoint: Url,
    pub shutdown_timeout: Duration,
    pub num_workers: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct StatsdConfig {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; tests feed maps instead of process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, IngestError> {
        let statsd = match lookup("POPS_STATSD_HOST") {
            None => None,
            Some(host) => Some(StatsdConfig {
                host,
                port: parse(&lookup, "POPS_STATSD_PORT", 8125)?,
            }),
        };

        Ok(Config {
            ingest_port: parse(&lookup, "POPS_PORT", 8100)?,
            admin_port: parse(&lookup, "POPS_ADMIN_PORT", 6060)?,
            token_header: lookup("POPS_TOKEN_HEADER")
                .filter(|header| !header.is_empty())
                .unwrap_or_else(|| crate::TOKEN_HEADER.to_string()),
            graceful: GracefulConfig {
                min_wait: duration(&lookup, "POPS_GRACEFUL_MIN_WAIT_TIME", Duration::from_secs(5))?,
                max_wait: duration(&lookup, "POPS_GRACEFUL_MAX_WAIT_TIME", Duration::from_secs(25))?,
                check_interval: duration(
                    &lookup,
                    "POPS_GRACEFUL_CHECK_INTERVAL",
                    Duration::from_secs(1),
                )?,
                silent_time: duration(&lookup, "POPS_GRACEFUL_SILENT_TIME", Duration::from_secs(3))?,
            },
            sink: SinkConfig {
                datapoint_endpoint: url(&lookup, "DATA_SINK_DP_ENDPOINT", DEFAULT_DATAPOINT_ENDPOINT)?,
                event_endpoint: url(&lookup, "DATA_SINK_EVENT_ENDPOINT", DEFAULT_EVENT_ENDPOINT)?,
                shutdown_timeout: duration(
                    &lookup,
                    "DATA_SINK_SHUTDOWN_TIMEOUT",
                    Duration::from_secs(3),
                )?,
                num_workers: parse(&lookup, "NUM_DRAINING_THREADS", 50)?,
                // the key has always been spelled this way in the fleet
                buffer_size: parse(&lookup, "CHANEL_SIZE", 1_000_000)?,
                batch_size: parse(&lookup, "MAX_DRAIN_SIZE", 5_000)?,
            },
            source_name: lookup("SF_SOURCE_NAME").unwrap_or_default(),
            metrics_auth_token: lookup("SF_METRICS_AUTH_TOKEN").unwrap_or_default(),
            statsd,
            log_dir: lookup("LOG_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, IngestError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| IngestError::InvalidConfig {
            key,
            message: format!("{e}"),
        }),
    }
}

fn duration(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, IngestError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(&raw)
            .or_else(|_| raw.parse::<u64>().map(Duration::from_secs))
            .map_err(|_| IngestError::InvalidConfig {
                key,
                message: format!("'{raw}' is not a duration"),
            }),
    }
}

fn url(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<Url, IngestError> {
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    Url::parse(&raw).map_err(|e| IngestError::InvalidConfig {
        key,
        message: format!("{e}"),
    })
}
