//! In-memory stand-ins for the Kubernetes API, used by unit and scenario tests.

use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{StreamError, WatchError};
use crate::scheduler::SchedulerStats;
use crate::types::{AgentEvent, PodKey};
use crate::watcher::{PodEvent, PodEventKind, PodEventSource, PodEventStream};
use crate::worker::{LineStream, LogSource, StreamTarget};

type LineFeed = mpsc::UnboundedSender<Result<String, StreamError>>;

#[derive(Default)]
struct SourceState {
    feeds: HashMap<PodKey, LineFeed>,
    opened: Vec<PodKey>,
    failing: HashMap<PodKey, usize>,
    hanging: HashSet<PodKey>,
}

/// Log source whose streams are driven by the test.
pub struct ScriptedSource {
    state: Mutex<SourceState>,
    attempts: mpsc::UnboundedSender<(PodKey, bool)>,
}

impl ScriptedSource {
    /// Returns the source and a feed of `(pod, opened)` for every open attempt.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(PodKey, bool)>) {
        let (attempts, rx) = mpsc::unbounded_channel();
        let source = Self {
            state: Mutex::new(SourceState::default()),
            attempts,
        };
        (Arc::new(source), rx)
    }

    pub fn fail_next_open(&self, key: &PodKey) {
        *self.lock().failing.entry(key.clone()).or_default() += 1;
    }

    pub fn hang_open(&self, key: &PodKey) {
        self.lock().hanging.insert(key.clone());
    }

    pub fn send_line(&self, key: &PodKey, line: &str) -> bool {
        match self.lock().feeds.get(key) {
            Some(feed) => feed.send(Ok(line.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn fail_stream(&self, key: &PodKey, reason: &str) {
        if let Some(feed) = self.lock().feeds.remove(key) {
            let _ = feed.send(Err(std::io::Error::other(reason.to_string()).into()));
        }
    }

    /// End the pod's stream cleanly.
    pub fn close(&self, key: &PodKey) {
        self.lock().feeds.remove(key);
    }

    /// Pods whose stream opened successfully, in order.
    pub fn opened(&self) -> Vec<PodKey> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn open(&self, target: &StreamTarget) -> Result<LineStream, StreamError> {
        let key = target.key.clone();
        if self.lock().hanging.contains(&key) {
            futures::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if let Some(left) = state.failing.get_mut(&key).filter(|left| **left > 0) {
            *left -= 1;
            let _ = self.attempts.send((key, false));
            return Err(std::io::Error::other("connection refused").into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.feeds.insert(key.clone(), tx);
        state.opened.push(key.clone());
        let _ = self.attempts.send((key, true));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Pod watch that replays prepared sessions, one per `watch()` call.
///
/// Once the sessions run out, further watches stay open without events.
pub struct ScriptedWatch {
    sessions: Mutex<VecDeque<Vec<Result<PodEvent, WatchError>>>>,
    calls: mpsc::UnboundedSender<usize>,
    count: Mutex<usize>,
}

impl ScriptedWatch {
    pub fn new(
        sessions: Vec<Vec<Result<PodEvent, WatchError>>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<usize>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let watch = Self {
            sessions: Mutex::new(sessions.into()),
            calls,
            count: Mutex::new(0),
        };
        (Arc::new(watch), rx)
    }
}

#[async_trait]
impl PodEventSource for ScriptedWatch {
    async fn watch(&self) -> Result<PodEventStream, StreamError> {
        let call = {
            let mut count = self.count.lock().unwrap();
            *count += 1;
            *count
        };
        let _ = self.calls.send(call);
        match self.sessions.lock().unwrap().pop_front() {
            Some(events) => Ok(futures::stream::iter(events).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn added(namespace: &str, name: &str, node: &str) -> Result<PodEvent, WatchError> {
    Ok(PodEvent {
        kind: PodEventKind::Added,
        key: PodKey::new(namespace, name),
        node_name: Some(node.to_string()),
    })
}

pub fn deleted(namespace: &str, name: &str, node: &str) -> Result<PodEvent, WatchError> {
    Ok(PodEvent {
        kind: PodEventKind::Deleted,
        key: PodKey::new(namespace, name),
        node_name: Some(node.to_string()),
    })
}

/// Everything currently sitting in the sink's queue.
pub fn drain(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn is_active(stats: &SchedulerStats, key: &PodKey) -> bool {
    stats.active.iter().any(|(active, _)| active == key)
}
