//! Admission control for log streams.
//!
//! The scheduler is a single task that owns the pending queue, the active set and
//! the pods waiting out a retry delay. Everything else talks to it through a
//! [`SchedulerHandle`], so operations on those collections never interleave.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::Backoff;
use crate::types::{AgentEvent, PodKey, PodLogEnd, QueueEntry};
use crate::worker::{
    WorkerContext, WorkerHandle, WorkerId, WorkerOutcome, WorkerReport, WorkerState, spawn_worker,
};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub backoff: Backoff,
}

/// Point-in-time view of the scheduler's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    /// Pending pods in promotion order.
    pub queued: Vec<PodKey>,
    pub active: Vec<(PodKey, WorkerState)>,
    pub retrying: Vec<PodKey>,
}

impl SchedulerStats {
    pub fn streaming(&self) -> usize {
        self.active
            .iter()
            .filter(|(_, state)| *state == WorkerState::Streaming)
            .count()
    }
}

#[derive(Debug)]
enum Command {
    Enqueue(QueueEntry),
    Remove {
        key: PodKey,
        node_name: Option<String>,
    },
    RetryDue {
        key: PodKey,
        id: WorkerId,
    },
    Stats(oneshot::Sender<SchedulerStats>),
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Queue a pod for streaming unless it is already queued, active or retrying.
    pub fn enqueue(&self, entry: QueueEntry) {
        self.send(Command::Enqueue(entry));
    }

    /// Forget a pod: drop it from the queue, cancel its retry, abort its worker.
    /// Exactly one `podLogEnd` is emitted for the pod as a result.
    pub fn remove(&self, key: PodKey, node_name: Option<String>) {
        self.send(Command::Remove { key, node_name });
    }

    pub async fn stats(&self) -> Option<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx));
        rx.await.ok()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Scheduler stopped, ignoring command");
        }
    }
}

struct ActiveStream {
    entry: QueueEntry,
    state: WorkerState,
    handle: WorkerHandle,
}

struct PendingRetry {
    entry: QueueEntry,
    id: WorkerId,
    cancel: CancellationToken,
}

/// A worker aborted by `remove` whose `Finished` report is still outstanding.
struct Removed {
    key: PodKey,
    node_name: Option<String>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    ctx: Arc<WorkerContext>,
    queue: VecDeque<QueueEntry>,
    active: HashMap<PodKey, ActiveStream>,
    retrying: HashMap<PodKey, PendingRetry>,
    removed: HashMap<WorkerId, Removed>,
    next_id: u64,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports: mpsc::UnboundedReceiver<WorkerReport>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        ctx: Arc<WorkerContext>,
        cancel: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            tx: commands_tx.clone(),
        };
        let scheduler = Self {
            config,
            ctx,
            queue: VecDeque::new(),
            active: HashMap::new(),
            retrying: HashMap::new(),
            removed: HashMap::new(),
            next_id: 0,
            commands_tx,
            commands,
            reports_tx,
            reports,
            cancel,
        };
        (scheduler, handle)
    }

    pub fn spawn(
        config: SchedulerConfig,
        ctx: Arc<WorkerContext>,
        cancel: CancellationToken,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (scheduler, handle) = Self::new(config, ctx, cancel);
        (handle, tokio::spawn(scheduler.run()))
    }

    pub async fn run(mut self) {
        info!(
            "Log stream scheduler started (max {} concurrent streams)",
            self.config.max_concurrent
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(report) = self.reports.recv() => self.handle_report(report),
            }
        }
        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(entry) => self.enqueue(entry),
            Command::Remove { key, node_name } => self.remove(key, node_name),
            Command::RetryDue { key, id } => self.retry_due(key, id),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn handle_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Started { key, id } => {
                if let Some(stream) = self.active.get_mut(&key)
                    && stream.handle.id() == id
                {
                    stream.state = WorkerState::Streaming;
                }
            }
            WorkerReport::Finished { key, id, outcome } => self.finished(key, id, outcome),
        }
    }

    fn enqueue(&mut self, entry: QueueEntry) {
        let key = &entry.key;
        if self.active.contains_key(key)
            || self.retrying.contains_key(key)
            || self.queue.iter().any(|queued| &queued.key == key)
        {
            debug!("Pod {} is already tracked, ignoring", key);
            return;
        }
        debug!("Queued pod {}", key);
        self.queue.push_back(entry);
        self.promote();
    }

    fn promote(&mut self) {
        while self.active.len() < self.config.max_concurrent {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            self.start(entry);
        }
        debug_assert!(self.active.len() <= self.config.max_concurrent);
    }

    fn start(&mut self, entry: QueueEntry) {
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        debug!("Starting worker {} for pod {}", id, entry.key);
        let handle = spawn_worker(
            Arc::clone(&self.ctx),
            entry.clone(),
            id,
            self.reports_tx.clone(),
        );
        self.active.insert(
            entry.key.clone(),
            ActiveStream {
                entry,
                state: WorkerState::Starting,
                handle,
            },
        );
    }

    fn remove(&mut self, key: PodKey, node_name: Option<String>) {
        self.queue.retain(|queued| queued.key != key);
        let retry = self.retrying.remove(&key);
        if let Some(retry) = &retry {
            retry.cancel.cancel();
        }

        match self.active.remove(&key) {
            // The worker emits podLogEnd itself after its final flush, unless it
            // failed before seeing the abort.
            Some(stream) => {
                stream.handle.abort();
                self.bury(stream, node_name);
            }
            None => {
                let node_name = node_name.or_else(|| retry.and_then(|r| r.entry.node_name));
                self.emit_end(&key, node_name);
            }
        }
        self.promote();
    }

    fn bury(&mut self, stream: ActiveStream, node_name: Option<String>) {
        let ActiveStream { entry, handle, .. } = stream;
        let removed = Removed {
            node_name: node_name.or(entry.node_name),
            key: entry.key,
        };
        self.removed.insert(handle.id(), removed);
    }

    fn emit_end(&self, key: &PodKey, node_name: Option<String>) {
        self.ctx.sink.emit(AgentEvent::LogEnd(PodLogEnd::new(
            key,
            node_name,
            &self.ctx.options.cluster,
        )));
    }

    fn finished(&mut self, key: PodKey, id: WorkerId, outcome: WorkerOutcome) {
        if let Some(removed) = self.removed.remove(&id) {
            // A failed worker only emitted podLogError; the pod is gone, so end it here.
            if outcome.should_retry() {
                debug!("Removed pod {} failed before its abort landed", removed.key);
                self.emit_end(&removed.key, removed.node_name);
            }
            return;
        }
        let stream = match self.active.entry(key) {
            Entry::Occupied(slot) if slot.get().handle.id() == id => slot.remove(),
            // Superseded by a newer worker.
            _ => return,
        };
        if outcome.should_retry() {
            self.schedule_retry(stream.entry, id);
        }
        self.promote();
    }

    fn schedule_retry(&mut self, entry: QueueEntry, id: WorkerId) {
        let backoff = self.config.backoff;
        let cancel = self.cancel.child_token();
        let timer = cancel.clone();
        let tx = self.commands_tx.clone();
        let key = entry.key.clone();
        warn!("Retrying pod {} in {:?}", key, backoff.delay());
        tokio::spawn(async move {
            if backoff.wait(&timer).await {
                let _ = tx.send(Command::RetryDue { key, id });
            }
        });
        self.retrying
            .insert(entry.key.clone(), PendingRetry { entry, id, cancel });
    }

    fn retry_due(&mut self, key: PodKey, id: WorkerId) {
        let retry = match self.retrying.entry(key) {
            Entry::Occupied(slot) if slot.get().id == id => slot.remove(),
            _ => return,
        };
        self.queue.push_back(retry.entry);
        self.promote();
    }

    fn stats(&self) -> SchedulerStats {
        let mut active: Vec<_> = self
            .active
            .iter()
            .map(|(key, stream)| (key.clone(), stream.state))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        let mut retrying: Vec<_> = self.retrying.keys().cloned().collect();
        retrying.sort();
        SchedulerStats {
            queued: self.queue.iter().map(|entry| entry.key.clone()).collect(),
            active,
            retrying,
        }
    }

    async fn shutdown(&mut self) {
        for (_, retry) in self.retrying.drain() {
            retry.cancel.cancel();
        }
        self.queue.clear();
        info!("Stopping {} log streams", self.active.len());
        let mut handles = Vec::with_capacity(self.active.len());
        for (key, stream) in self.active.drain() {
            stream.handle.abort();
            let node_name = stream.entry.node_name;
            self.removed.insert(stream.handle.id(), Removed { key, node_name });
            handles.push(stream.handle);
        }
        futures::future::join_all(handles.into_iter().map(WorkerHandle::join)).await;

        // Every worker has reported by now; settle the ones that failed mid-abort.
        while let Ok(report) = self.reports.try_recv() {
            if let WorkerReport::Finished { key, id, outcome } = report {
                self.finished(key, id, outcome);
            }
        }
        self.removed.clear();
    }
}
