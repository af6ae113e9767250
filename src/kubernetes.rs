use anyhow::Context;
use async_trait::async_trait;
use futures::io::AsyncBufReadExt;
use futures::stream::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{
    ApiResource, DynamicObject, GroupVersionKind, ListParams, LogParams, WatchEvent, WatchParams,
};
use kube::{Api, Client, Config};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::{StreamError, WatchError};
use crate::metrics::{ClusterState, NodeMetrics, PodMetrics};
use crate::types::PodKey;
use crate::watcher::{PodEvent, PodEventKind, PodEventSource, PodEventStream};
use crate::worker::{LineStream, LogSource, StreamTarget};

/// Lines or events buffered between the API connection and its consumer.
const STREAM_BUFFER: usize = 1024;

pub async fn build_client(out_of_cluster: bool) -> anyhow::Result<Client> {
    let config = if out_of_cluster {
        Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?
    } else {
        Config::incluster().context("Failed to load in-cluster service account configuration")?
    };
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Forward `stream` into `tx` until either side is done.
///
/// The connection lives as long as this task, so dropping the receiving end
/// closes it.
async fn pump<S, T>(stream: S, tx: mpsc::Sender<T>)
where
    S: Stream<Item = T>,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            item = stream.next() => match item {
                Some(item) => {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Follow-mode pod logs from the API server.
pub struct KubeLogSource {
    client: Client,
}

impl KubeLogSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn log_params(target: &StreamTarget) -> LogParams {
    LogParams {
        follow: true,
        container: target.container.clone(),
        tail_lines: target.tail_lines,
        since_seconds: target.since_seconds,
        timestamps: target.timestamps,
        ..Default::default()
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(&self, target: &StreamTarget) -> Result<LineStream, StreamError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.key.namespace);
        let key = target.key.clone();
        let lp = log_params(target);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let reader = match api.log_stream(&key.pod_name, &lp).await {
                Ok(reader) => reader,
                Err(err) => {
                    let _ = opened_tx.send(Err(err));
                    return;
                }
            };
            if opened_tx.send(Ok(())).is_err() {
                return;
            }
            let lines = reader.lines().map(|line| line.map_err(StreamError::from));
            pump(lines, tx).await;
            debug!("Log connection for pod {} closed", key);
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(ReceiverStream::new(rx).boxed()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(StreamError::Rejected(format!(
                "log stream for pod {} closed before opening",
                target.key
            ))),
        }
    }
}

/// Cluster-wide pod watch.
///
/// Every connection starts from resource version `"0"`; no cursor survives a
/// restart.
pub struct KubePodWatch {
    client: Client,
}

impl KubePodWatch {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodEventSource for KubePodWatch {
    async fn watch(&self) -> Result<PodEventStream, StreamError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let events = match api.watch(&WatchParams::default(), "0").await {
                Ok(events) => events,
                Err(err) => {
                    let _ = opened_tx.send(Err(err));
                    return;
                }
            };
            if opened_tx.send(Ok(())).is_err() {
                return;
            }
            let events = events.filter_map(|event| futures::future::ready(pod_event(event)));
            pump(events, tx).await;
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(ReceiverStream::new(rx).boxed()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(StreamError::Rejected("pod watch closed before opening".into())),
        }
    }
}

/// Translate one raw watch item. Bookmarks carry nothing for us and are dropped.
fn pod_event(
    event: Result<WatchEvent<Pod>, kube::Error>,
) -> Option<Result<PodEvent, WatchError>> {
    let (kind, pod) = match event {
        Ok(WatchEvent::Added(pod)) => (PodEventKind::Added, pod),
        Ok(WatchEvent::Modified(pod)) => (PodEventKind::Modified, pod),
        Ok(WatchEvent::Deleted(pod)) => (PodEventKind::Deleted, pod),
        Ok(WatchEvent::Bookmark(_)) => return None,
        Ok(WatchEvent::Error(status)) => {
            return Some(Err(StreamError::Rejected(format!("{:?}", status)).into()));
        }
        Err(kube::Error::SerdeError(err)) => {
            return Some(Err(WatchError::Malformed(err.to_string())));
        }
        Err(err) => return Some(Err(StreamError::Api(err).into())),
    };
    Some(pod_to_event(kind, pod))
}

fn pod_to_event(kind: PodEventKind, pod: Pod) -> Result<PodEvent, WatchError> {
    let (Some(namespace), Some(name)) = (pod.metadata.namespace, pod.metadata.name) else {
        return Err(WatchError::Malformed("pod event without namespace or name".into()));
    };
    Ok(PodEvent {
        kind,
        key: PodKey::new(namespace, name),
        node_name: pod.spec.and_then(|spec| spec.node_name),
    })
}

fn metrics_api(client: &Client, kind: &str, plural: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", kind);
    let resource = ApiResource::from_gvk_with_plural(&gvk, plural);
    Api::all_with(client.clone(), &resource)
}

fn decode_items<T: DeserializeOwned>(items: Vec<DynamicObject>) -> anyhow::Result<Vec<T>> {
    items
        .into_iter()
        .map(|item| -> anyhow::Result<T> {
            Ok(serde_json::from_value(serde_json::to_value(item)?)?)
        })
        .collect()
}

/// Fetch nodes, pods and their metrics concurrently. Any failure fails the whole fetch.
pub async fn fetch_cluster_state(client: &Client) -> anyhow::Result<ClusterState> {
    let nodes: Api<Node> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let node_metrics = metrics_api(client, "NodeMetrics", "nodes");
    let pod_metrics = metrics_api(client, "PodMetrics", "pods");
    let lp = ListParams::default();

    let (nodes, pods, node_metrics, pod_metrics) = futures::try_join!(
        async { nodes.list(&lp).await.context("Failed to list nodes") },
        async { pods.list(&lp).await.context("Failed to list pods") },
        async {
            node_metrics
                .list(&lp)
                .await
                .context("Failed to list node metrics")
        },
        async {
            pod_metrics
                .list(&lp)
                .await
                .context("Failed to list pod metrics")
        },
    )?;

    Ok(ClusterState {
        nodes: nodes.items,
        pods: pods.items,
        node_metrics: decode_items::<NodeMetrics>(node_metrics.items)
            .context("Invalid node metrics")?,
        pod_metrics: decode_items::<PodMetrics>(pod_metrics.items)
            .context("Invalid pod metrics")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_log_params_follow_target() {
        let target = StreamTarget {
            key: PodKey::new("ns", "a"),
            container: Some("app".into()),
            tail_lines: Some(100),
            since_seconds: Some(60),
            timestamps: true,
        };
        let lp = log_params(&target);
        assert!(lp.follow);
        assert_eq!(lp.container.as_deref(), Some("app"));
        assert_eq!(lp.tail_lines, Some(100));
        assert_eq!(lp.since_seconds, Some(60));
        assert!(lp.timestamps);
    }

    #[test]
    fn test_pod_event_translation() {
        let added = pod(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web-1", "namespace": "default" },
            "spec": { "nodeName": "node-1", "containers": [] }
        }));
        let event = pod_event(Ok(WatchEvent::Added(added))).unwrap().unwrap();
        assert_eq!(event.kind, PodEventKind::Added);
        assert_eq!(event.key, PodKey::new("default", "web-1"));
        assert_eq!(event.node_name.as_deref(), Some("node-1"));

        let pending = pod(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web-2", "namespace": "default" }
        }));
        let event = pod_event(Ok(WatchEvent::Deleted(pending))).unwrap().unwrap();
        assert_eq!(event.kind, PodEventKind::Deleted);
        assert_eq!(event.node_name, None);
    }

    #[test]
    fn test_pod_without_name_is_malformed() {
        let nameless = pod(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "namespace": "default" }
        }));
        let err = pod_event(Ok(WatchEvent::Modified(nameless))).unwrap().unwrap_err();
        assert!(matches!(err, WatchError::Malformed(_)));
    }

    #[test]
    fn test_in_band_error_ends_watch() {
        let status = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version: 1 (2)".into(),
            reason: "Expired".into(),
            code: 410,
        };
        let err = pod_event(Ok(WatchEvent::Error(status))).unwrap().unwrap_err();
        let WatchError::Stream(StreamError::Rejected(reason)) = err else {
            panic!("expected a rejected watch, got {:?}", err);
        };
        assert!(reason.contains("Expired"));
    }

    #[test]
    fn test_bookmark_is_skipped() {
        let bookmark: WatchEvent<Pod> = serde_json::from_value(json!({
            "type": "BOOKMARK",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "resourceVersion": "42" }
            }
        }))
        .unwrap();
        assert!(pod_event(Ok(bookmark)).is_none());
    }

    #[test]
    fn test_decode_metrics_items() {
        let item: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "NodeMetrics",
            "metadata": { "name": "node-1" },
            "timestamp": "2024-01-15T12:00:00Z",
            "window": "10s",
            "usage": { "cpu": "250m", "memory": "1Gi" }
        }))
        .unwrap();
        let decoded: Vec<NodeMetrics> = decode_items(vec![item]).unwrap();
        assert_eq!(decoded[0].metadata.name.as_deref(), Some("node-1"));
        assert_eq!(decoded[0].usage.cpu.as_deref(), Some("250m"));
    }
}
