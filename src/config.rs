use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::netflow::template::DEFAULT_MAX_SAMPLERS_PER_EXPORTER;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Packets buffered per worker before the receiver waits
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            log_level: default_log_level(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2055))
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecoderConfig {
    /// Upper bound on distinct templates per exporter; unbounded when unset
    #[serde(default)]
    pub max_templates_per_exporter: Option<usize>,
    /// Upper bound on distinct sampler ids with a sampling rate, per exporter
    #[serde(default = "default_max_samplers")]
    pub max_samplers_per_exporter: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_templates_per_exporter: None,
            max_samplers_per_exporter: default_max_samplers(),
        }
    }
}

fn default_max_samplers() -> usize {
    DEFAULT_MAX_SAMPLERS_PER_EXPORTER
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            metrics: None,
            decoder: DecoderConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.collector.workers == 0 {
            anyhow::bail!("collector.workers must be at least 1");
        }
        if self.collector.queue_size == 0 {
            anyhow::bail!("collector.queue_size must be at least 1");
        }
        if self.decoder.max_templates_per_exporter == Some(0) {
            anyhow::bail!("decoder.max_templates_per_exporter must be at least 1 when set");
        }
        if self.decoder.max_samplers_per_exporter == 0 {
            anyhow::bail!("decoder.max_samplers_per_exporter must be at least 1");
        }
        Ok(())
    }
}
