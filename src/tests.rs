#[cfg(test)]
mod tests {
    use crate::cli::Cli;
    use crate::config::{AgentConfig, StreamOptions};
    use crate::error::WatchError;
    use crate::retry::Backoff;
    use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
    use crate::sink::ChannelSink;
    use crate::testing::{ScriptedSource, ScriptedWatch, added, deleted, drain};
    use crate::types::{AgentEvent, PodKey};
    use crate::watcher::{PodEvent, PodWatcher};
    use crate::worker::WorkerContext;
    use clap::Parser;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct Agent {
        source: Arc<ScriptedSource>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        scheduler: SchedulerHandle,
        scheduler_task: JoinHandle<()>,
        cancel: CancellationToken,
    }

    /// Scheduler and watcher wired together the way `main` does it.
    fn agent(max_concurrent: usize, sessions: Vec<Vec<Result<PodEvent, WatchError>>>) -> Agent {
        let (source, _attempts) = ScriptedSource::new();
        let (sink, events) = ChannelSink::new();
        let ctx = Arc::new(WorkerContext {
            source: source.clone(),
            sink: Arc::new(sink),
            options: StreamOptions {
                cluster: "scenario".into(),
                ..Default::default()
            },
        });
        let cancel = CancellationToken::new();
        let config = SchedulerConfig {
            max_concurrent,
            backoff: Backoff::default(),
        };
        let (scheduler, scheduler_task) = Scheduler::spawn(config, ctx, cancel.clone());
        let (watch, _calls) = ScriptedWatch::new(sessions);
        let watcher = PodWatcher::new(watch, scheduler.clone(), Backoff::default());
        tokio::spawn(watcher.run(cancel.clone()));
        Agent {
            source,
            events,
            scheduler,
            scheduler_task,
            cancel,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn pod(name: &str) -> PodKey {
        PodKey::new("shop", name)
    }

    #[test]
    fn test_cli_parsing_defaults() {
        let cli = Cli::try_parse_from(["pod-log-agent"]).unwrap();
        assert!(cli.config.is_none());
        assert!(!cli.no_metrics);
        assert!(!cli.out_of_cluster);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parsing_collector() {
        let args = vec![
            "pod-log-agent",
            "--collector-url",
            "wss://collector.example.com/agent",
            "--api-key",
            "k-123",
            "--cluster-name",
            "prod-eu",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(
            cli.collector_url.as_deref(),
            Some("wss://collector.example.com/agent")
        );
        assert_eq!(cli.api_key.as_deref(), Some("k-123"));
        assert_eq!(cli.cluster_name.as_deref(), Some("prod-eu"));
    }

    #[test]
    fn test_cli_parsing_stream_settings() {
        let args = vec![
            "pod-log-agent",
            "--bulk-size",
            "50",
            "--bulk-interval",
            "2",
            "--tail-lines",
            "10",
            "--since-seconds",
            "30",
            "--no-metrics",
            "-v",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        let mut config = AgentConfig::default();
        config.apply_cli(&cli);
        let opts = config.stream_options();
        assert_eq!(opts.bulk_size, 50);
        assert_eq!(opts.bulk_interval, Duration::from_secs(2));
        assert_eq!(opts.tail_lines, Some(10));
        assert_eq!(opts.since_seconds, Some(30));
        assert!(!config.metrics_enabled);
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_rejects_non_numeric_limits() {
        assert!(Cli::try_parse_from(["pod-log-agent", "--max-concurrent", "many"]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_and_fifo_promotion() {
        let mut agent = agent(
            3,
            vec![vec![
                added("shop", "p1", "n1"),
                added("shop", "p2", "n1"),
                added("shop", "p3", "n1"),
                added("shop", "p4", "n2"),
                added("shop", "p5", "n2"),
            ]],
        );
        settle().await;
        assert_eq!(agent.source.opened(), vec![pod("p1"), pod("p2"), pod("p3")]);

        agent.source.close(&pod("p1"));
        settle().await;
        agent.source.close(&pod("p3"));
        settle().await;

        assert_eq!(
            agent.source.opened(),
            vec![pod("p1"), pod("p2"), pod("p3"), pod("p4"), pod("p5")]
        );
        let stats = agent.scheduler.stats().await.unwrap();
        assert_eq!(stats.active.len(), 3);
        assert!(stats.queued.is_empty());

        let ended: Vec<_> = drain(&mut agent.events)
            .into_iter()
            .filter_map(|event| match event {
                AgentEvent::LogEnd(end) => Some(end.pod_name),
                _ => None,
            })
            .collect();
        assert_eq!(ended, vec!["p1".to_string(), "p3".to_string()]);
        agent.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_flushes_active_pod_then_ends() {
        let mut agent = agent(2, vec![vec![added("shop", "web", "n1")]]);
        settle().await;
        for i in 0..3 {
            let line = format!("2024-01-15T10:30:0{}Z WARN slow request", i);
            assert!(agent.source.send_line(&pod("web"), &line));
        }
        settle().await;

        agent.scheduler.remove(pod("web"), Some("n1".into()));
        settle().await;

        let events = drain(&mut agent.events);
        assert_eq!(events.len(), 2, "{:?}", events);
        let AgentEvent::LogLines(records) = &events[0] else {
            panic!("expected podLogLines, got {:?}", events[0]);
        };
        assert_eq!(records.len(), 3);
        assert!(
            records
                .iter()
                .all(|r| r.cluster == "scenario" && r.message == "WARN slow request")
        );
        assert!(matches!(&events[1], AgentEvent::LogEnd(end) if end.pod_name == "web"));
        agent.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_add_delete_emits_only_end() {
        let mut agent = agent(
            1,
            vec![vec![
                added("shop", "blocker", "n1"),
                added("shop", "short-lived", "n1"),
                deleted("shop", "short-lived", "n1"),
            ]],
        );
        settle().await;

        let events = drain(&mut agent.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::LogEnd(end) if end.pod_name == "short-lived"));
        assert_eq!(agent.source.opened(), vec![pod("blocker")]);
        agent.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_every_stream() {
        let mut agent = agent(
            5,
            vec![vec![added("shop", "a", "n1"), added("shop", "b", "n1")]],
        );
        settle().await;
        agent.source.send_line(&pod("a"), "2024-01-15T10:30:00Z INFO ready");
        settle().await;

        agent.cancel.cancel();
        agent.scheduler_task.await.unwrap();

        let events = drain(&mut agent.events);
        let lines = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::LogLines(_)))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::LogEnd(_)))
            .count();
        assert_eq!(lines, 1);
        assert_eq!(ends, 2);
    }
}
