mod cli;
mod config;
mod error;
mod kubernetes;
mod metrics;
mod quantity;
mod retry;
mod scheduler;
mod severity;
mod sink;
#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
mod transport;
mod types;
mod watcher;
mod worker;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::Cli;
use config::AgentConfig;
use kubernetes::{KubeLogSource, KubePodWatch, build_client};
use metrics::MetricsCollector;
use scheduler::{Scheduler, SchedulerConfig};
use sink::{ChannelSink, EventSink};
use transport::{CollectorTransport, Hello, print_events};
use watcher::PodWatcher;
use worker::WorkerContext;

/// How long queued events may take to reach the collector after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = AgentConfig::load(&cli)?;
    let client = build_client(cli.out_of_cluster).await?;
    info!(
        "Starting pod log agent for cluster {} (max {} concurrent streams)",
        config.cluster_name, config.max_concurrent
    );

    let (channel_sink, events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(channel_sink);
    let transport_stop = CancellationToken::new();
    let transport = spawn_transport(&config, events, transport_stop.clone());

    let cancel = CancellationToken::new();
    let ctx = Arc::new(WorkerContext {
        source: Arc::new(KubeLogSource::new(client.clone())),
        sink: Arc::clone(&sink),
        options: config.stream_options(),
    });
    let scheduler_config = SchedulerConfig {
        max_concurrent: config.max_concurrent,
        backoff: config.backoff(),
    };
    let (scheduler, scheduler_task) = Scheduler::spawn(scheduler_config, ctx, cancel.clone());

    let pod_watch = PodWatcher::new(
        Arc::new(KubePodWatch::new(client.clone())),
        scheduler.clone(),
        config.backoff(),
    );
    let watcher_task = tokio::spawn(pod_watch.run(cancel.clone()));

    let metrics_task = if config.metrics_enabled {
        let collector =
            MetricsCollector::new(client, Arc::clone(&sink), config.cluster_name.clone());
        Some(tokio::spawn(
            collector.run(config.metrics_interval(), cancel.clone()),
        ))
    } else {
        info!("Metrics collection disabled");
        None
    };

    shutdown_signal().await?;
    info!("Shutting down");
    if let Some(stats) = scheduler.stats().await {
        info!(
            "{} streams active ({} streaming), {} queued, {} awaiting retry",
            stats.active.len(),
            stats.streaming(),
            stats.queued.len(),
            stats.retrying.len()
        );
    }

    cancel.cancel();
    let _ = watcher_task.await;
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    let _ = scheduler_task.await;

    // The transport drains once the last sink handle is gone.
    drop(sink);
    drain_transport(transport, transport_stop).await;
    Ok(())
}

fn spawn_transport(
    config: &AgentConfig,
    events: tokio::sync::mpsc::UnboundedReceiver<types::AgentEvent>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    match &config.collector_url {
        Some(url) => {
            info!("Forwarding events to collector at {}", url);
            let hello = Hello::new(config.api_key.clone(), config.cluster_name.clone());
            let transport = CollectorTransport::new(url.clone(), hello, config.backoff(), events);
            tokio::spawn(transport.run(stop))
        }
        None => {
            info!("No collector URL configured, writing events to stdout");
            tokio::spawn(print_events(events))
        }
    }
}

async fn drain_transport(mut transport: JoinHandle<()>, stop: CancellationToken) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut transport)
        .await
        .is_err()
    {
        warn!("Collector did not drain within {:?}, dropping queued events", DRAIN_TIMEOUT);
        stop.cancel();
        transport.abort();
        let _ = transport.await;
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
