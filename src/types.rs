use serde::Serialize;
use std::fmt;

use crate::metrics::MetricsSnapshot;
use crate::severity::Severity;

/// Identity of a pod for queue and active-set membership.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PodKey {
    pub namespace: String,
    pub pod_name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

/// A pod waiting for a stream slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: PodKey,
    pub node_name: Option<String>,
}

impl QueueEntry {
    pub fn new(key: PodKey, node_name: Option<String>) -> Self {
        Self { key, node_name }
    }
}

/// One parsed log line, as shipped in a `podLogLines` batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: Option<String>,
    pub node_name: Option<String>,
    /// Same value as `node_name`; collectors read either field.
    pub node: Option<String>,
    pub timestamp: String,
    pub message: String,
    pub severity: Severity,
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodLogEnd {
    pub namespace: String,
    pub pod_name: String,
    pub node_name: Option<String>,
    pub node: Option<String>,
    pub cluster: String,
}

impl PodLogEnd {
    pub fn new(key: &PodKey, node_name: Option<String>, cluster: &str) -> Self {
        Self {
            namespace: key.namespace.clone(),
            pod_name: key.pod_name.clone(),
            node: node_name.clone(),
            node_name,
            cluster: cluster.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodLogError {
    pub namespace: String,
    pub pod_name: String,
    pub node_name: Option<String>,
    pub node: Option<String>,
    pub error: String,
    pub cluster: String,
}

impl PodLogError {
    pub fn new(key: &PodKey, node_name: Option<String>, error: String, cluster: &str) -> Self {
        Self {
            namespace: key.namespace.clone(),
            pod_name: key.pod_name.clone(),
            node: node_name.clone(),
            node_name,
            error,
            cluster: cluster.to_string(),
        }
    }
}

/// Everything the agent sends to the collector.
///
/// Serializes as `{"event": <name>, "payload": <body>}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum AgentEvent {
    #[serde(rename = "podLogLines")]
    LogLines(Vec<LogRecord>),
    #[serde(rename = "podLogEnd")]
    LogEnd(PodLogEnd),
    #[serde(rename = "podLogError")]
    LogError(PodLogError),
    #[serde(rename = "kubernetesMetrics")]
    Metrics(Box<MetricsSnapshot>),
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::LogLines(_) => "podLogLines",
            AgentEvent::LogEnd(_) => "podLogEnd",
            AgentEvent::LogError(_) => "podLogError",
            AgentEvent::Metrics(_) => "kubernetesMetrics",
        }
    }
}
