use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pod-log-agent")]
#[command(about = "Tail pod logs and snapshot resource metrics for a remote collector")]
pub struct Cli {
    /// YAML configuration file; flags and environment override its values
    #[arg(long, env = "AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cluster display name attached to every event
    #[arg(long, env = "AGENT_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Collector websocket URL; events go to stdout when unset
    #[arg(long, env = "AGENT_COLLECTOR_URL")]
    pub collector_url: Option<String>,

    /// API key presented to the collector
    #[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Maximum number of pods streamed at once
    #[arg(long, env = "AGENT_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Flush a pod's batch once it holds this many lines
    #[arg(long, env = "AGENT_BULK_SIZE")]
    pub bulk_size: Option<usize>,

    /// Flush non-empty batches at least this often (seconds)
    #[arg(long, env = "AGENT_BULK_INTERVAL")]
    pub bulk_interval: Option<u64>,

    /// Lines of history requested when a stream opens
    #[arg(long, env = "AGENT_TAIL_LINES")]
    pub tail_lines: Option<i64>,

    /// Seconds of history requested when a stream opens
    #[arg(long, env = "AGENT_SINCE_SECONDS")]
    pub since_seconds: Option<i64>,

    /// Stamp lines with receive time instead of the kubelet timestamp
    #[arg(long)]
    pub no_timestamps: bool,

    /// Container name (if multi-container pod)
    #[arg(short = 'c', long, env = "AGENT_CONTAINER")]
    pub container: Option<String>,

    /// Delay before retrying a failed watch or stream (seconds)
    #[arg(long, env = "AGENT_RETRY_DELAY")]
    pub retry_delay: Option<u64>,

    /// Metrics snapshot period (seconds)
    #[arg(long, env = "AGENT_METRICS_INTERVAL")]
    pub metrics_interval: Option<u64>,

    /// Do not collect resource metrics
    #[arg(long)]
    pub no_metrics: bool,

    /// Use kubeconfig credentials instead of the service account mount
    #[arg(long)]
    pub out_of_cluster: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
