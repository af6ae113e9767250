//! Periodic node and pod resource snapshots.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Container, Node, NodeSystemInfo, Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::kubernetes::fetch_cluster_state;
use crate::quantity::{Age, parse_cpu_quantity, parse_memory_quantity};
use crate::sink::EventSink;
use crate::types::AgentEvent;

/// `metrics.k8s.io/v1beta1` NodeMetrics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub metadata: ObjectMeta,
    pub usage: ResourceUsage,
}

/// `metrics.k8s.io/v1beta1` PodMetrics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    pub containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceUsage {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Raw API objects fetched for one snapshot.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub node_metrics: Vec<NodeMetrics>,
    pub pod_metrics: Vec<PodMetrics>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cluster: String,
    pub timestamp: String,
    pub nodes: Vec<NodeObject>,
    pub pods: Vec<PodObject>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodObject {
    pub metadata: PodMeta,
    pub status: PodStatusView,
    pub containers: BTreeMap<String, ContainerResources>,
    pub resources: PodResources,
    pub ready_containers: usize,
    pub total_containers: usize,
    pub restarts: i64,
    pub age: Option<Age>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub creation_timestamp: Option<Time>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusView {
    pub phase: Option<String>,
    pub conditions: Vec<PodCondition>,
    pub start_time: Option<Time>,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    #[serde(rename = "hostIP")]
    pub host_ip: Option<String>,
    pub qos_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResources {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsage {
    pub usage_nano_cores: Option<u64>,
    pub requests: Option<u64>,
    pub limits: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub usage_bytes: Option<u64>,
    pub requests: Option<u64>,
    pub limits: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResources {
    pub cpu: CpuTotals,
    pub memory: MemoryTotals,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuTotals {
    pub total_usage_nano_cores: Option<u64>,
    pub requests: Option<u64>,
    pub limits: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTotals {
    pub total_usage_bytes: Option<u64>,
    pub requests: Option<u64>,
    pub limits: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeObject {
    pub metadata: NodeMeta,
    pub status: NodeStatusView,
    pub resources: NodeResources,
    pub pods: PodCounts,
    pub age: Option<Age>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub creation_timestamp: Option<Time>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusView {
    pub capacity: NodeCapacity,
    pub allocatable: NodeCapacity,
    pub conditions: BTreeMap<String, NodeConditionView>,
    pub node_info: Option<NodeSystemInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeCapacity {
    pub cpu: Option<u64>,
    pub memory: Option<u64>,
    pub pods: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConditionView {
    pub status: String,
    pub last_heartbeat_time: Option<Time>,
    pub last_transition_time: Option<Time>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    pub cpu: NodeCpu,
    pub memory: NodeMemory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCpu {
    pub usage_nano_cores: Option<u64>,
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMemory {
    pub usage_bytes: Option<u64>,
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PodCounts {
    pub running: usize,
    pub total: usize,
}

/// Join specs with metrics into one snapshot. Pure; `now` drives ages and the timestamp.
pub fn build_snapshot(cluster: &str, now: DateTime<Utc>, state: &ClusterState) -> MetricsSnapshot {
    let pod_usage: HashMap<(&str, &str), &PodMetrics> = state
        .pod_metrics
        .iter()
        .map(|m| {
            let ns = m.metadata.namespace.as_deref().unwrap_or_default();
            let name = m.metadata.name.as_deref().unwrap_or_default();
            ((ns, name), m)
        })
        .collect();
    let node_usage: HashMap<&str, &NodeMetrics> = state
        .node_metrics
        .iter()
        .map(|m| (m.metadata.name.as_deref().unwrap_or_default(), m))
        .collect();

    let pods: Vec<PodObject> = state
        .pods
        .iter()
        .map(|pod| {
            let meta = &pod.metadata;
            let key = (
                meta.namespace.as_deref().unwrap_or_default(),
                meta.name.as_deref().unwrap_or_default(),
            );
            pod_object(pod, pod_usage.get(&key).copied(), now)
        })
        .collect();

    let nodes = state
        .nodes
        .iter()
        .map(|node| {
            let name = node.metadata.name.as_deref().unwrap_or_default();
            node_object(node, node_usage.get(name).copied(), &pods, now)
        })
        .collect();

    MetricsSnapshot {
        cluster: cluster.to_string(),
        timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        nodes,
        pods,
    }
}

fn pod_object(pod: &Pod, metrics: Option<&PodMetrics>, now: DateTime<Utc>) -> PodObject {
    let meta = &pod.metadata;
    let spec_containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let containers: BTreeMap<String, ContainerResources> = spec_containers
        .iter()
        .map(|container| {
            let usage = metrics
                .and_then(|m| m.containers.iter().find(|c| c.name == container.name))
                .map(|c| &c.usage);
            (container.name.clone(), container_resources(container, usage))
        })
        .collect();

    let resources = PodResources {
        cpu: CpuTotals {
            total_usage_nano_cores: sum_present(
                containers.values().map(|c| c.cpu.usage_nano_cores),
            ),
            requests: sum_present(containers.values().map(|c| c.cpu.requests)),
            limits: sum_present(containers.values().map(|c| c.cpu.limits)),
        },
        memory: MemoryTotals {
            total_usage_bytes: sum_present(containers.values().map(|c| c.memory.usage_bytes)),
            requests: sum_present(containers.values().map(|c| c.memory.requests)),
            limits: sum_present(containers.values().map(|c| c.memory.limits)),
        },
    };

    let status = pod.status.as_ref();
    let statuses = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();

    PodObject {
        metadata: PodMeta {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            creation_timestamp: meta.creation_timestamp.clone(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
        },
        status: PodStatusView {
            phase: status.and_then(|s| s.phase.clone()),
            conditions: status
                .and_then(|s| s.conditions.clone())
                .unwrap_or_default(),
            start_time: status.and_then(|s| s.start_time.clone()),
            pod_ip: status.and_then(|s| s.pod_ip.clone()),
            host_ip: status.and_then(|s| s.host_ip.clone()),
            qos_class: status.and_then(|s| s.qos_class.clone()),
        },
        containers,
        resources,
        ready_containers: statuses.iter().filter(|c| c.ready).count(),
        total_containers: statuses.len(),
        restarts: statuses.iter().map(|c| i64::from(c.restart_count)).sum(),
        age: age_of(meta, now),
    }
}

fn container_resources(container: &Container, usage: Option<&ResourceUsage>) -> ContainerResources {
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    ContainerResources {
        cpu: CpuUsage {
            usage_nano_cores: usage
                .and_then(|u| u.cpu.as_deref())
                .and_then(parse_cpu_quantity),
            requests: quantity(requests, "cpu").and_then(parse_cpu_quantity),
            limits: quantity(limits, "cpu").and_then(parse_cpu_quantity),
        },
        memory: MemoryUsage {
            usage_bytes: usage
                .and_then(|u| u.memory.as_deref())
                .and_then(parse_memory_quantity),
            requests: quantity(requests, "memory").and_then(parse_memory_quantity),
            limits: quantity(limits, "memory").and_then(parse_memory_quantity),
        },
    }
}

fn node_object(
    node: &Node,
    metrics: Option<&NodeMetrics>,
    pods: &[PodObject],
    now: DateTime<Utc>,
) -> NodeObject {
    let meta = &node.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let status = node.status.as_ref();
    let capacity = node_capacity(status.and_then(|s| s.capacity.as_ref()));
    let allocatable = node_capacity(status.and_then(|s| s.allocatable.as_ref()));

    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .map(|c| {
            let view = NodeConditionView {
                status: c.status.clone(),
                last_heartbeat_time: c.last_heartbeat_time.clone(),
                last_transition_time: c.last_transition_time.clone(),
                reason: c.reason.clone(),
                message: c.message.clone(),
            };
            (c.type_.clone(), view)
        })
        .collect();

    let usage = metrics.map(|m| &m.usage);
    let resources = NodeResources {
        cpu: NodeCpu {
            usage_nano_cores: usage
                .and_then(|u| u.cpu.as_deref())
                .and_then(parse_cpu_quantity),
            capacity: capacity.cpu,
        },
        memory: NodeMemory {
            usage_bytes: usage
                .and_then(|u| u.memory.as_deref())
                .and_then(parse_memory_quantity),
            capacity: capacity.memory,
        },
    };

    let on_node = pods
        .iter()
        .filter(|p| p.metadata.node_name.as_deref() == Some(name.as_str()));
    let pod_counts = PodCounts {
        running: on_node
            .clone()
            .filter(|p| p.status.phase.as_deref() == Some("Running"))
            .count(),
        total: on_node.count(),
    };

    NodeObject {
        metadata: NodeMeta {
            name,
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            creation_timestamp: meta.creation_timestamp.clone(),
        },
        status: NodeStatusView {
            capacity,
            allocatable,
            conditions,
            node_info: status.and_then(|s| s.node_info.clone()),
        },
        resources,
        pods: pod_counts,
        age: age_of(meta, now),
    }
}

fn node_capacity(values: Option<&BTreeMap<String, Quantity>>) -> NodeCapacity {
    NodeCapacity {
        cpu: quantity(values, "cpu").and_then(parse_cpu_quantity),
        memory: quantity(values, "memory").and_then(parse_memory_quantity),
        pods: quantity(values, "pods").and_then(|p| p.trim().parse().ok()),
    }
}

fn quantity<'a>(values: Option<&'a BTreeMap<String, Quantity>>, name: &str) -> Option<&'a str> {
    values.and_then(|v| v.get(name)).map(|q| q.0.as_str())
}

/// Sum of the values that are present; `None` when none are.
fn sum_present(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    values
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0) + v))
}

fn age_of(meta: &ObjectMeta, now: DateTime<Utc>) -> Option<Age> {
    let created = meta.creation_timestamp.as_ref()?.0;
    Some(Age::since(created, now))
}

/// Polls the cluster and emits a `kubernetesMetrics` snapshot on every tick.
pub struct MetricsCollector {
    client: Client,
    sink: Arc<dyn EventSink>,
    cluster: String,
}

impl MetricsCollector {
    pub fn new(client: Client, sink: Arc<dyn EventSink>, cluster: String) -> Self {
        Self {
            client,
            sink,
            cluster,
        }
    }

    pub async fn collect(&self) -> anyhow::Result<()> {
        let state = fetch_cluster_state(&self.client).await?;
        let snapshot = build_snapshot(&self.cluster, Utc::now(), &state);
        debug!(
            "Collected metrics for {} nodes and {} pods",
            snapshot.nodes.len(),
            snapshot.pods.len()
        );
        self.sink.emit(AgentEvent::Metrics(Box::new(snapshot)));
        Ok(())
    }

    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        info!("Collecting Kubernetes metrics every {:?}", period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.collect().await {
                        error!("Error collecting Kubernetes metrics: {:#}", err);
                    }
                }
            }
        }
        debug!("Metrics collector stopped");
    }
}
