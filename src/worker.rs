//! Per-pod log streaming.
//!
//! A worker owns one follow-mode log stream, its batch and its flush timer. It
//! reports `Started` once the stream is open and `Finished` exactly once when it
//! stops, whatever the reason. Every worker emits exactly one terminal event:
//! `podLogEnd` when the stream ended or was aborted, `podLogError` when it failed.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::StreamOptions;
use crate::error::StreamError;
use crate::severity::classify_severity;
use crate::sink::EventSink;
use crate::types::{AgentEvent, LogRecord, PodKey, PodLogEnd, PodLogError, QueueEntry};

pub type LineStream = BoxStream<'static, Result<String, StreamError>>;

/// Parameters for one log-tail request.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTarget {
    pub key: PodKey,
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub timestamps: bool,
}

/// Opens follow-mode log streams.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn open(&self, target: &StreamTarget) -> Result<LineStream, StreamError>;
}

/// Shared, read-only dependencies of every worker.
pub struct WorkerContext {
    pub source: Arc<dyn LogSource>,
    pub sink: Arc<dyn EventSink>,
    pub options: StreamOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Streaming,
    Erroring,
    Restarting,
    Ended,
    Aborted,
}

/// How a worker stopped.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// The API server closed the stream.
    Ended,
    /// Stopped through [`WorkerHandle::abort`].
    Aborted,
    /// The stream could not be opened.
    StartFailed(StreamError),
    /// The stream broke while reading.
    Failed(StreamError),
}

impl WorkerOutcome {
    pub fn should_retry(&self) -> bool {
        matches!(self, WorkerOutcome::StartFailed(_) | WorkerOutcome::Failed(_))
    }

    fn final_state(&self) -> WorkerState {
        match self {
            WorkerOutcome::Ended => WorkerState::Ended,
            WorkerOutcome::Aborted => WorkerState::Aborted,
            WorkerOutcome::StartFailed(_) | WorkerOutcome::Failed(_) => WorkerState::Restarting,
        }
    }
}

#[derive(Debug)]
pub enum WorkerReport {
    Started {
        key: PodKey,
        id: WorkerId,
    },
    Finished {
        key: PodKey,
        id: WorkerId,
        outcome: WorkerOutcome,
    },
}

pub struct WorkerHandle {
    id: WorkerId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Stop the worker. It flushes, closes its stream and emits `podLogEnd` once,
    /// no matter how many times this is called. A worker that already failed
    /// has emitted `podLogError` instead and ignores the abort.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!("Log worker {} panicked: {}", self.id, err);
        }
    }
}

pub fn spawn_worker(
    ctx: Arc<WorkerContext>,
    entry: QueueEntry,
    id: WorkerId,
    reports: mpsc::UnboundedSender<WorkerReport>,
) -> WorkerHandle {
    let cancel = CancellationToken::new();
    let worker = LogStreamWorker::new(ctx, entry, id, reports);
    let task = tokio::spawn(worker.run(cancel.clone()));
    WorkerHandle { id, cancel, task }
}

/// Lines waiting to be shipped, at most `capacity` of them.
#[derive(Debug)]
pub struct LogBatch {
    records: Vec<LogRecord>,
    capacity: usize,
}

impl LogBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record; returns `true` once the batch is full.
    pub fn push(&mut self, record: LogRecord) -> bool {
        self.records.push(record);
        self.records.len() >= self.capacity
    }

    pub fn take(&mut self) -> Vec<LogRecord> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub(crate) struct LogStreamWorker {
    ctx: Arc<WorkerContext>,
    entry: QueueEntry,
    id: WorkerId,
    state: WorkerState,
    batch: LogBatch,
    reports: mpsc::UnboundedSender<WorkerReport>,
}

impl LogStreamWorker {
    pub(crate) fn new(
        ctx: Arc<WorkerContext>,
        entry: QueueEntry,
        id: WorkerId,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        let batch = LogBatch::new(ctx.options.bulk_size);
        Self {
            ctx,
            entry,
            id,
            state: WorkerState::Starting,
            batch,
            reports,
        }
    }

    fn target(&self) -> StreamTarget {
        let opts = &self.ctx.options;
        StreamTarget {
            key: self.entry.key.clone(),
            container: opts.container_name.clone(),
            tail_lines: opts.tail_lines,
            since_seconds: opts.since_seconds,
            timestamps: opts.include_timestamps,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let target = self.target();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.ctx.source.open(&target) => Some(result),
        };
        let mut lines = match opened {
            None => return self.finish(WorkerOutcome::Aborted),
            Some(Err(err)) => return self.finish(WorkerOutcome::StartFailed(err)),
            Some(Ok(lines)) => lines,
        };

        self.set_state(WorkerState::Streaming);
        info!("Streaming logs for pod {} (worker {})", self.entry.key, self.id);
        let _ = self.reports.send(WorkerReport::Started {
            key: self.entry.key.clone(),
            id: self.id,
        });

        let period = self.ctx.options.bulk_interval;
        let mut flush_timer = tokio::time::interval_at(Instant::now() + period, period);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break WorkerOutcome::Aborted,
                _ = flush_timer.tick() => self.flush(),
                next = lines.next() => match next {
                    Some(Ok(line)) => self.handle_line(&line),
                    Some(Err(err)) => break WorkerOutcome::Failed(err),
                    None => break WorkerOutcome::Ended,
                },
            }
        };
        // Dropping the stream closes the connection.
        drop(lines);
        self.finish(outcome);
    }

    pub(crate) fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return;
        }
        let (timestamp, message) = split_timestamp(line, self.ctx.options.include_timestamps);
        let record = LogRecord {
            namespace: self.entry.key.namespace.clone(),
            pod_name: self.entry.key.pod_name.clone(),
            container_name: self.ctx.options.container_name.clone(),
            node_name: self.entry.node_name.clone(),
            node: self.entry.node_name.clone(),
            severity: classify_severity(&message),
            timestamp,
            message,
            cluster: self.ctx.options.cluster.clone(),
        };
        if self.batch.push(record) {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        debug!(
            "Flushing {} log lines for pod {}",
            self.batch.len(),
            self.entry.key
        );
        let records = self.batch.take();
        self.ctx.sink.emit(AgentEvent::LogLines(records));
    }

    fn finish(mut self, outcome: WorkerOutcome) {
        let key = self.entry.key.clone();
        let ctx = Arc::clone(&self.ctx);
        let cluster = &ctx.options.cluster;
        match &outcome {
            WorkerOutcome::Ended | WorkerOutcome::Aborted => {
                self.flush();
                self.set_state(outcome.final_state());
                info!("Log stream for pod {} stopped ({:?})", key, self.state);
                ctx.sink.emit(AgentEvent::LogEnd(PodLogEnd::new(
                    &key,
                    self.entry.node_name.clone(),
                    cluster,
                )));
            }
            WorkerOutcome::StartFailed(err) | WorkerOutcome::Failed(err) => {
                self.set_state(WorkerState::Erroring);
                self.flush();
                warn!("Log stream for pod {} failed: {}", key, err);
                ctx.sink.emit(AgentEvent::LogError(PodLogError::new(
                    &key,
                    self.entry.node_name.clone(),
                    err.to_string(),
                    cluster,
                )));
                self.set_state(WorkerState::Restarting);
            }
        }
        let _ = self.reports.send(WorkerReport::Finished {
            key,
            id: self.id,
            outcome,
        });
    }

    fn set_state(&mut self, state: WorkerState) {
        trace!(
            "Worker {} for pod {}: {:?} -> {:?}",
            self.id, self.entry.key, self.state, state
        );
        self.state = state;
    }
}

/// Split a kubelet-timestamped line into `(timestamp, message)`.
///
/// Lines without timestamps (or without a separating space) are stamped with the
/// receive time.
fn split_timestamp(line: &str, timestamps: bool) -> (String, String) {
    if timestamps && let Some((ts, message)) = line.split_once(' ') {
        return (ts.to_string(), message.to_string());
    }
    (
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        line.to_string(),
    )
}
