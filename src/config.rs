use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 60;
pub const MIN_BATCH_SPACING_SECS: u64 = 1;
/// One day between synthesized points
pub const MAX_BATCH_SPACING_SECS: u64 = 86_400;

/// Where the telemetry server lives and how the live view is refreshed
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
    pub interval_secs: u64,
    pub push_enabled: bool,
    /// Gap between synthesized timestamps when a batch arrives without them
    pub batch_spacing_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            interval_secs: 5,
            push_enabled: true,
            batch_spacing_secs: 300,
        }
    }
}

impl DashboardConfig {
    /// Reads an optional TOML file, then `NETDASH_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: DashboardConfig = builder
            .add_source(Environment::with_prefix("NETDASH"))
            .build()?
            .try_deserialize()?;
        Ok(config.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.interval_secs = self.interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        self.batch_spacing_secs = self
            .batch_spacing_secs
            .clamp(MIN_BATCH_SPACING_SECS, MAX_BATCH_SPACING_SECS);
        self
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS))
    }

    pub fn batch_spacing(&self) -> chrono::TimeDelta {
        let secs = self
            .batch_spacing_secs
            .clamp(MIN_BATCH_SPACING_SECS, MAX_BATCH_SPACING_SECS);
        chrono::TimeDelta::try_seconds(secs as i64).unwrap_or_else(|| chrono::TimeDelta::minutes(5))
    }

    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn interval_is_clamped() {
        let config = DashboardConfig::default().with_interval_secs(0);
        assert_eq!(config.interval(), Duration::from_secs(1));
        let config = DashboardConfig::default().with_interval_secs(600);
        assert_eq!(config.interval(), Duration::from_secs(60));
    }

    #[test]
    fn batch_spacing_is_clamped() {
        let config = DashboardConfig {
            batch_spacing_secs: 20_000_000_000_000_000,
            ..DashboardConfig::default()
        };
        assert_eq!(config.batch_spacing(), chrono::TimeDelta::days(1));
        assert_eq!(config.clone().normalized().batch_spacing_secs, MAX_BATCH_SPACING_SECS);

        let config = DashboardConfig {
            batch_spacing_secs: 0,
            ..DashboardConfig::default()
        }
        .normalized();
        assert_eq!(config.batch_spacing(), chrono::TimeDelta::seconds(1));
    }

    #[test]
    fn urls_follow_endpoint() {
        let config = DashboardConfig::default().with_endpoint("10.0.0.2", 9000);
        assert_eq!(config.api_base_url(), "http://10.0.0.2:9000");
        assert_eq!(config.ws_url(), "ws://10.0.0.2:9000/ws");
    }

    #[test]
    fn loads_partial_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "host = \"telemetry.lan\"\ninterval_secs = 120").unwrap();

        let config = DashboardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.host, "telemetry.lan");
        assert_eq!(config.port, 8000);
        assert_eq!(config.interval_secs, 60);
        assert!(config.push_enabled);
    }
}
