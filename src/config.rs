use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cli::Cli;
use crate::retry::Backoff;

pub const DEFAULT_CLUSTER_NAME: &str = "default-cluster";

/// Agent settings after merging the config file, environment and flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentConfig {
    pub cluster_name: String,
    pub collector_url: Option<String>,
    pub api_key: Option<String>,
    pub max_concurrent: usize,
    pub bulk_size: usize,
    pub bulk_interval_secs: u64,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub include_timestamps: bool,
    pub container_name: Option<String>,
    pub retry_delay_secs: u64,
    pub metrics_enabled: bool,
    pub metrics_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            collector_url: None,
            api_key: None,
            max_concurrent: 5,
            bulk_size: 100,
            bulk_interval_secs: 10,
            tail_lines: Some(100),
            since_seconds: Some(60),
            include_timestamps: true,
            container_name: None,
            retry_delay_secs: 5,
            metrics_enabled: true,
            metrics_interval_secs: 60,
        }
    }
}

impl AgentConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub(crate) fn apply_cli(&mut self, cli: &Cli) {
        if let Some(name) = &cli.cluster_name {
            self.cluster_name = name.clone();
        }
        if let Some(url) = &cli.collector_url {
            self.collector_url = Some(url.clone());
        }
        if let Some(key) = &cli.api_key {
            self.api_key = Some(key.clone());
        }
        if let Some(n) = cli.max_concurrent {
            self.max_concurrent = n;
        }
        if let Some(n) = cli.bulk_size {
            self.bulk_size = n;
        }
        if let Some(secs) = cli.bulk_interval {
            self.bulk_interval_secs = secs;
        }
        if let Some(n) = cli.tail_lines {
            self.tail_lines = Some(n);
        }
        if let Some(secs) = cli.since_seconds {
            self.since_seconds = Some(secs);
        }
        if cli.no_timestamps {
            self.include_timestamps = false;
        }
        if let Some(container) = &cli.container {
            self.container_name = Some(container.clone());
        }
        if let Some(secs) = cli.retry_delay {
            self.retry_delay_secs = secs;
        }
        if let Some(secs) = cli.metrics_interval {
            self.metrics_interval_secs = secs;
        }
        if cli.no_metrics {
            self.metrics_enabled = false;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent == 0 {
            bail!("maxConcurrent must be at least 1");
        }
        if self.bulk_size == 0 {
            bail!("bulkSize must be at least 1");
        }
        if self.bulk_interval_secs == 0 {
            bail!("bulkInterval must be a positive number of seconds");
        }
        if self.metrics_enabled && self.metrics_interval_secs == 0 {
            bail!("metricsInterval must be a positive number of seconds");
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_secs(self.retry_delay_secs))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            cluster: self.cluster_name.clone(),
            bulk_size: self.bulk_size,
            bulk_interval: Duration::from_secs(self.bulk_interval_secs),
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            include_timestamps: self.include_timestamps,
            container_name: self.container_name.clone(),
        }
    }
}

/// Per-stream settings handed to every log worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub cluster: String,
    pub bulk_size: usize,
    pub bulk_interval: Duration,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub include_timestamps: bool,
    pub container_name: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        AgentConfig::default().stream_options()
    }
}
