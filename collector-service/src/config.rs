use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use monitor_client::CounterPolicy;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("power_monitor.db"),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Path to the rtlamr decoder binary.
    pub rtlamr_path: String,
    /// Path to rtl_tcp; `None` assumes a server is already running.
    pub rtl_tcp_path: Option<String>,
    pub rtltcp_host: String,
    pub rtltcp_port: u16,
    /// Pass `-unique=true` so the decoder suppresses repeated frames.
    pub unique: bool,
    /// Comma-separated tracked meter IDs; missing or empty file means
    /// discovery mode. Rewritten by the dashboard via the boundary API.
    pub filter_ids_path: PathBuf,
    /// Replay a capture file once instead of supervising the live decoder.
    pub replay_csv: Option<PathBuf>,
    /// Hard cap on one stdout line; longer frames are dropped and resynced.
    pub max_line_bytes: usize,
    /// rtl_tcp needs a moment to own the dongle before rtlamr connects.
    pub rtl_tcp_warmup_ms: u64,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            rtlamr_path: "rtlamr".to_string(),
            rtl_tcp_path: Some("rtl_tcp".to_string()),
            rtltcp_host: "127.0.0.1".to_string(),
            rtltcp_port: 1234,
            unique: true,
            filter_ids_path: PathBuf::from("filter_ids.txt"),
            replay_csv: None,
            max_line_bytes: 4096,
            rtl_tcp_warmup_ms: 7000,
            restart_backoff_initial_ms: 5000,
            restart_backoff_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Meter-native counter units per kWh (rtlamr reports hundredths).
    pub units_per_kwh: f64,
    /// Counter drops beyond this fraction of the previous value count as a
    /// meter reset rather than a glitch.
    pub reset_drop_fraction: f64,
    /// Reading pairs further apart than this are unusable for power
    /// estimates.
    pub max_power_interval_minutes: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            units_per_kwh: 100.0,
            reset_drop_fraction: 0.5,
            max_power_interval_minutes: 360,
        }
    }
}

impl CounterConfig {
    pub fn policy(&self) -> CounterPolicy {
        CounterPolicy {
            reset_drop_fraction: self.reset_drop_fraction,
            max_power_interval: Duration::from_secs(self.max_power_interval_minutes * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Stored rows between streamed progress events.
    pub progress_every_rows: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            progress_every_rows: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub collector: CollectorConfig,
    pub counter: CounterConfig,
    pub import: ImportConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Load from the file named by `COLLECTOR_CONFIG`, falling back to
    /// `collector-config.toml` next to the working directory and finally to
    /// built-in defaults when no file exists.
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        match env::var("COLLECTOR_CONFIG") {
            Ok(path) => {
                let contents = fs::read_to_string(&path)?;
                Ok(toml::from_str(&contents)?)
            }
            Err(_) => {
                let default_path = "collector-config.toml";
                match fs::read_to_string(default_path) {
                    Ok(contents) => Ok(toml::from_str(&contents)?),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [database]
            path = "/var/lib/monitor/readings.db"

            [collector]
            rtlamr_path = "/usr/local/bin/rtlamr"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.database.path, PathBuf::from("/var/lib/monitor/readings.db"));
        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.collector.rtlamr_path, "/usr/local/bin/rtlamr");
        assert_eq!(cfg.collector.rtltcp_port, 1234);
        assert_eq!(cfg.counter.units_per_kwh, 100.0);
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn counter_policy_converts_minutes() {
        let cfg = CounterConfig {
            max_power_interval_minutes: 90,
            ..Default::default()
        };
        assert_eq!(cfg.policy().max_power_interval, Duration::from_secs(5400));
    }
}
