use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StreamError, WatchError};
use crate::retry::Backoff;
use crate::scheduler::SchedulerHandle;
use crate::types::{PodKey, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

/// A decoded pod watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub key: PodKey,
    pub node_name: Option<String>,
}

pub type PodEventStream = BoxStream<'static, Result<PodEvent, WatchError>>;

/// Opens the cluster-wide pod watch.
#[async_trait]
pub trait PodEventSource: Send + Sync {
    async fn watch(&self) -> Result<PodEventStream, StreamError>;
}

/// Feeds pod lifecycle events into the scheduler, reconnecting forever.
pub struct PodWatcher {
    source: Arc<dyn PodEventSource>,
    scheduler: SchedulerHandle,
    backoff: Backoff,
}

impl PodWatcher {
    pub fn new(
        source: Arc<dyn PodEventSource>,
        scheduler: SchedulerHandle,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            scheduler,
            backoff,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting pod watcher for all namespaces");
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.watch_once() => result,
            };
            match result {
                Ok(()) => warn!("Pod watch closed, restarting in {:?}", self.backoff.delay()),
                Err(err) => warn!(
                    "Pod watch failed: {}, restarting in {:?}",
                    err,
                    self.backoff.delay()
                ),
            }
            if !self.backoff.wait(&cancel).await {
                break;
            }
        }
        info!("Pod watcher stopped");
    }

    /// Consume one watch connection until it closes or fails.
    async fn watch_once(&self) -> Result<(), StreamError> {
        let mut events = self.source.watch().await?;
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.dispatch(event),
                Err(WatchError::Malformed(reason)) => {
                    debug!("Skipping malformed watch event: {}", reason);
                }
                Err(WatchError::Stream(err)) => return Err(err),
            }
        }
        Ok(())
    }

    fn dispatch(&self, event: PodEvent) {
        match event.kind {
            PodEventKind::Added => {
                info!(
                    "NEW POD: {} on node {}",
                    event.key,
                    event.node_name.as_deref().unwrap_or("<unscheduled>")
                );
                self.scheduler
                    .enqueue(QueueEntry::new(event.key, event.node_name));
            }
            PodEventKind::Deleted => {
                info!("POD DELETED: {}", event.key);
                self.scheduler.remove(event.key, event.node_name);
            }
            PodEventKind::Modified => {}
        }
    }
}
