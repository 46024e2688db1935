use anyhow::{Context, Result};
use clap::Parser;
use nf9_collector::collector::Collector;
use nf9_collector::config::{Config, MetricsConfig};
use nf9_collector::{metrics, Decoder, DecoderMetrics, TemplateCache};
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nf9-collector")]
#[command(about = "NetFlow v9 collector writing decoded flows as JSON lines")]
struct Args {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP address to receive NetFlow on, overrides the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Prometheus metrics address, overrides the configuration
    #[arg(long)]
    metrics_listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.collector.listen = listen;
    }
    if let Some(listen) = args.metrics_listen {
        config.metrics = Some(MetricsConfig { listen });
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.collector.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let registry = Registry::new();
    let decoder_metrics = DecoderMetrics::new(&registry).context("Failed to register metrics")?;
    let templates = TemplateCache::with_limit(config.decoder.max_templates_per_exporter)
        .with_sampler_limit(config.decoder.max_samplers_per_exporter);
    let decoder = Arc::new(Decoder::new(templates, decoder_metrics));

    if let Some(metrics_config) = &config.metrics {
        metrics::start_server(metrics_config.listen, registry);
    }

    Collector::new(config.collector.clone(), decoder)?.run().await
}
