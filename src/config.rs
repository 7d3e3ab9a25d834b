//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path for the lesson ledger
    pub ledger_path: PathBuf,

    /// Number of recent history entries the correction detector inspects
    pub correction_window: usize,

    /// Minimum confidence for a correction to count as found (0.0 - 1.0)
    pub correction_min_confidence: f64,

    /// Below this routing confidence callers should ask for confirmation
    pub routing_confirm_threshold: f64,

    /// Timeout for one call to the routing strategy
    pub reasoning_timeout: Duration,

    /// Timeout for one lesson delivery
    pub publish_timeout: Duration,

    /// Timeout for one tool handler invocation
    pub tool_timeout: Duration,

    /// Capacity of the in-order process message handler queue
    pub handler_queue_capacity: usize,

    /// Interval for periodic reflection (None = disabled)
    pub periodic_reflection_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            correction_window: 10,
            correction_min_confidence: 0.6,
            routing_confirm_threshold: 0.5,
            reasoning_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(15),
            tool_timeout: Duration::from_secs(120),
            handler_queue_capacity: 256,
            periodic_reflection_interval: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let ledger_path = std::env::var("PHASEFLOW_LEDGER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.ledger_path);

        let correction_window =
            env_parse("PHASEFLOW_CORRECTION_WINDOW")?.unwrap_or(defaults.correction_window);

        let correction_min_confidence: f64 = env_parse("PHASEFLOW_CORRECTION_MIN_CONFIDENCE")?
            .unwrap_or(defaults.correction_min_confidence);

        let routing_confirm_threshold: f64 = env_parse("PHASEFLOW_ROUTING_CONFIRM_THRESHOLD")?
            .unwrap_or(defaults.routing_confirm_threshold);

        let reasoning_timeout = env_parse::<u64>("PHASEFLOW_REASONING_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reasoning_timeout);

        let publish_timeout = env_parse::<u64>("PHASEFLOW_PUBLISH_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.publish_timeout);

        let tool_timeout = env_parse::<u64>("PHASEFLOW_TOOL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.tool_timeout);

        let handler_queue_capacity = env_parse::<usize>("PHASEFLOW_HANDLER_QUEUE")?
            .unwrap_or(defaults.handler_queue_capacity)
            .max(1);

        // 0 disables the periodic loop
        let periodic_reflection_interval = env_parse::<u64>("PHASEFLOW_REFLECTION_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            ledger_path,
            correction_window: correction_window.max(2),
            correction_min_confidence: correction_min_confidence.clamp(0.0, 1.0),
            routing_confirm_threshold: routing_confirm_threshold.clamp(0.0, 1.0),
            reasoning_timeout,
            publish_timeout,
            tool_timeout,
            handler_queue_capacity,
            periodic_reflection_interval,
        })
    }
}

/// Parse an optional environment variable, failing loudly on garbage
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

fn default_ledger_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phaseflow")
        .join("ledger.db")
}
