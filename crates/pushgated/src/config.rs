//! Relay configuration and the startup gate.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::uri::InvalidUri;
use thiserror::Error;

use pushgate_api::{external_url_path, resolve_route_prefix};
use pushgate_clear::MIN_CLEAR_INTERVAL;

/// Configuration rejected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("clear interval {0:?} is shorter than the 1m minimum")]
    ClearIntervalTooShort(Duration),

    #[error("the clear scheduler cannot be combined with a persistence file ({0:?})")]
    ClearWithPersistence(PathBuf),

    #[error("persistence interval must be non-zero when a persistence file is set")]
    ZeroPersistenceInterval,

    #[error("telemetry path {0:?} must start with '/' and contain no '{{' or '}}'")]
    TelemetryPath(String),

    #[error("telemetry path {0:?} collides with a built-in route")]
    TelemetryPathCollision(String),

    #[error("invalid external URL {url:?}: {source}")]
    ExternalUrl {
        url: String,
        #[source]
        source: InvalidUri,
    },
}

/// GET routes the router registers besides the telemetry path.
const RESERVED_PATHS: &[&str] = &["/", "/status", "/-/healthy", "/-/ready", "/metrics/all"];

/// Immutable relay configuration, built once from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub telemetry_path: String,
    pub external_url: String,
    pub route_prefix: String,
    pub persistence_file: Option<PathBuf>,
    pub persistence_interval: Duration,
    /// Zero disables the clear scheduler.
    pub clear_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9091".to_string(),
            telemetry_path: "/metrics".to_string(),
            external_url: String::new(),
            route_prefix: String::new(),
            persistence_file: None,
            persistence_interval: Duration::from_secs(5 * 60),
            clear_interval: Duration::ZERO,
        }
    }
}

impl Config {
    /// Check the startup constraints. Returns whether the clear scheduler
    /// is enabled.
    pub fn validate(&self) -> Result<bool, ConfigError> {
        let scheduler_enabled = !self.clear_interval.is_zero();

        if scheduler_enabled && self.clear_interval < MIN_CLEAR_INTERVAL {
            return Err(ConfigError::ClearIntervalTooShort(self.clear_interval));
        }
        if let Some(file) = &self.persistence_file {
            if scheduler_enabled {
                return Err(ConfigError::ClearWithPersistence(file.clone()));
            }
            if self.persistence_interval.is_zero() {
                return Err(ConfigError::ZeroPersistenceInterval);
            }
        }
        let telemetry = self.telemetry_path.as_str();
        if !telemetry.starts_with('/') || telemetry.contains(['{', '}']) {
            return Err(ConfigError::TelemetryPath(telemetry.to_string()));
        }
        if RESERVED_PATHS.contains(&telemetry) || telemetry.starts_with("/metrics/job/") {
            return Err(ConfigError::TelemetryPathCollision(telemetry.to_string()));
        }
        self.effective_route_prefix()?;

        Ok(scheduler_enabled)
    }

    /// Route prefix after falling back to the external URL path.
    pub fn effective_route_prefix(&self) -> Result<String, ConfigError> {
        let path = external_url_path(&self.external_url).map_err(|source| {
            ConfigError::ExternalUrl {
                url: self.external_url.clone(),
                source,
            }
        })?;
        Ok(resolve_route_prefix(&self.route_prefix, &path))
    }

    /// Socket address to bind. A bare `:port` listens on all interfaces.
    pub fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    /// Flag names and values as reported by `/status`.
    pub fn flags(&self) -> BTreeMap<String, String> {
        let persistence_file = self
            .persistence_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        [
            ("web.listen-address", self.listen_address.clone()),
            ("web.telemetry-path", self.telemetry_path.clone()),
            ("web.external-url", self.external_url.clone()),
            ("web.route-prefix", self.route_prefix.clone()),
            ("persistence.file", persistence_file),
            (
                "persistence.interval",
                format_duration(self.persistence_interval),
            ),
            ("clear.interval", format_duration(self.clear_interval)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h", a compound
/// such as "1h30m", or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut rest = s;
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let n = rest[..digits].parse::<u64>().ok()?;
        let unit_end = rest[digits..]
            .find(|c: char| c.is_ascii_digit())
            .map_or(rest.len(), |i| digits + i);
        let part = match &rest[digits..unit_end] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.checked_mul(60)?),
            "h" => Duration::from_secs(n.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_end..];
    }
    Some(total)
}

/// `clap` value parser wrapping [`parse_duration`].
pub fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration {s:?}, expected e.g. 500ms, 30s, 5m, 1h30m"))
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
