//! End-to-end step runs against the scripted cluster.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::cluster::{ContainerStatus, DeletePolicy, PodPhase, PodSnapshot, RawPodEvent};
    use crate::config::{RunConfig, WatchConfig};
    use crate::definition::PodDefinition;
    use crate::errors::{ClusterError, PaddleError, StepError, StepFailure};
    use crate::events::{names, CollectingEventSink};
    use crate::orchestrator::{PipelineRunner, StepRunner};
    use crate::testing::{pipeline, step, step_with_storage, ClusterCall, FakeCluster, StaticRenderer};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn step_runner(cluster: &Arc<FakeCluster>, config: RunConfig) -> (StepRunner, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let runner = StepRunner::new(
            cluster.clone(),
            Arc::new(StaticRenderer::default()),
            WatchConfig::default(),
            config,
        )
        .with_event_sink(events.clone());
        (runner, events)
    }

    fn runner(cluster: &Arc<FakeCluster>, config: RunConfig) -> (PipelineRunner, Arc<CollectingEventSink>) {
        let (steps, events) = step_runner(cluster, config);
        (PipelineRunner::new(steps), events)
    }

    fn running(pod: &str) -> RawPodEvent {
        RawPodEvent::Modified(
            PodSnapshot::new("jobs", pod)
                .with_phase(PodPhase::Running)
                .with_containers(["main"])
                .with_status(ContainerStatus::running("main")),
        )
    }

    fn succeeded(pod: &str) -> RawPodEvent {
        RawPodEvent::Modified(PodSnapshot::new("jobs", pod).with_phase(PodPhase::Succeeded))
    }

    fn exited(pod: &str, exit_code: i32, message: &str) -> RawPodEvent {
        RawPodEvent::Modified(
            PodSnapshot::new("jobs", pod)
                .with_phase(PodPhase::Running)
                .with_status(ContainerStatus::terminated("main", exit_code, Some(message))),
        )
    }

    fn script_success(cluster: &FakeCluster, pod: &str) {
        cluster.script(
            pod,
            vec![
                (Duration::from_secs(1), running(pod)),
                (Duration::from_secs(5), succeeded(pod)),
            ],
        );
    }

    fn step_error(err: PaddleError) -> StepError {
        match err {
            PaddleError::Step(e) => e,
            other => panic!("expected a step error, got {other:?}"),
        }
    }

    fn creates(cluster: &FakeCluster) -> Vec<String> {
        cluster
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::CreatePod(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_run_in_order_and_clean_up() {
        let cluster = Arc::new(FakeCluster::new());
        script_success(&cluster, "test-v1-prepare-master");
        script_success(&cluster, "test-v1-train-master");
        cluster.set_logs("main", ["epoch 1", "done"]);
        let (runner, events) = runner(&cluster, RunConfig::default());

        let report = runner
            .run(&pipeline(vec![step("prepare"), step("train")]), |msg| {
                panic!("unexpected fatal error: {msg}")
            })
            .await
            .unwrap();

        let ran: Vec<_> = report.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(ran, vec!["prepare", "train"]);
        assert_eq!(report.steps[1].pod, "test-v1-train-master");
        assert_eq!(report.steps[1].containers, vec!["main".to_string()]);
        assert!(report.skipped.is_empty());

        assert_eq!(
            creates(&cluster),
            vec!["test-v1-prepare-master", "test-v1-train-master"]
        );
        assert!(cluster.pod("test-v1-prepare-master").is_none());
        assert!(cluster.pod("test-v1-train-master").is_none());

        let types = events.event_types();
        assert_eq!(types.first().map(String::as_str), Some(names::STEP_STARTED));
        assert_eq!(types.last().map(String::as_str), Some(names::STEP_COMPLETED));
        assert_eq!(events.events_of_type(names::CONTAINER_LOG).len(), 4);
        assert_eq!(events.events_of_type(names::CONTAINER_STARTED).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_halts_later_steps() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(
            pod,
            vec![
                (Duration::from_secs(1), running(pod)),
                (Duration::from_secs(5), exited(pod, 1, "boom")),
            ],
        );
        let (runner, events) = runner(&cluster, RunConfig::default());
        let fatal = Mutex::new(Vec::new());

        let err = runner
            .run(&pipeline(vec![step("train"), step("publish")]), |msg| {
                fatal.lock().push(msg);
            })
            .await
            .unwrap_err();

        let err = step_error(err);
        assert_eq!(err.step, "train");
        assert_eq!(err.container.as_deref(), Some("main"));
        assert_eq!(
            err.failure,
            StepFailure::ContainerFailed {
                message: "boom".to_string()
            }
        );

        let fatal = fatal.into_inner();
        assert_eq!(fatal.len(), 1);
        assert!(fatal[0].contains("boom"));
        assert_eq!(creates(&cluster), vec![pod]);
        assert_eq!(events.events_of_type(names::STEP_FAILED).len(), 1);
        assert_eq!(events.events_of_type(names::CONTAINER_REMOVED).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_missing_pod_is_success() {
        let cluster = Arc::new(FakeCluster::new());
        let (runner, _) = step_runner(&cluster, RunConfig::default());
        let definition = PodDefinition::new(&pipeline(vec![step("train")]), &step("train")).unwrap();

        runner
            .reconcile(&definition, "jobs", "test-v1-train-master", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            cluster.calls(),
            vec![ClusterCall::DeletePod(
                "test-v1-train-master".to_string(),
                DeletePolicy::Graceful
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_waits_for_terminating_pod() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_pod(PodSnapshot::new("jobs", "test-v1-train-master"));
        cluster.set_delete_lag("test-v1-train-master", 2);
        let (runner, _) = step_runner(&cluster, RunConfig::default());
        let definition = PodDefinition::new(&pipeline(vec![step("train")]), &step("train")).unwrap();

        let started = tokio::time::Instant::now();
        runner
            .reconcile(&definition, "jobs", "test-v1-train-master", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cluster.count(|c| matches!(c, ClusterCall::DeletePod(..))), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_times_out() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_pod(PodSnapshot::new("jobs", "test-v1-train-master"));
        cluster.set_delete_lag("test-v1-train-master", usize::MAX);
        let config = RunConfig::new()
            .with_delete_polling(Duration::from_secs(2), Duration::from_secs(10));
        let (runner, _) = runner(&cluster, config);

        let err = runner
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap_err();

        assert_eq!(
            step_error(err).failure,
            StepFailure::ReconcileTimeout { seconds: 10 }
        );
        assert!(creates(&cluster).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_error_aborts_before_submit() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_deletes(ClusterError::api(500, "etcd unavailable"));
        let (runner, _) = runner(&cluster, RunConfig::default());

        let err = runner
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PaddleError::Cluster(ClusterError::Api { code: 500, .. })));
        assert!(creates(&cluster).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_force_deletes_pod() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(
            pod,
            vec![(
                Duration::from_secs(1),
                RawPodEvent::Modified(
                    PodSnapshot::new("jobs", pod)
                        .with_status(ContainerStatus::waiting("main", Some("ImagePullBackOff"))),
                ),
            )],
        );
        let config = RunConfig::new().with_start_timeout(Duration::from_secs(60));
        let (runner, _) = runner(&cluster, config);

        let err = runner
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("cluster might not have sufficient resources"));
        assert!(message.contains("ImagePullBackOff"));
        assert_eq!(
            step_error(err).failure,
            StepFailure::StartTimeout {
                detail: Some("ImagePullBackOff".to_string())
            }
        );
        assert_eq!(
            cluster.count(|c| *c == ClusterCall::DeletePod(pod.to_string(), DeletePolicy::Force)),
            1
        );
        assert!(cluster.pod(pod).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_stream_failure_fails_step() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(
            pod,
            vec![
                (Duration::from_secs(1), running(pod)),
                (Duration::from_secs(30), succeeded(pod)),
            ],
        );
        cluster.fail_logs("main");
        let (runner, _) = runner(&cluster, RunConfig::default());

        let err = step_error(
            runner
                .run(&pipeline(vec![step("train")]), |_| {})
                .await
                .unwrap_err(),
        );

        assert_eq!(err.container.as_deref(), Some("main"));
        assert!(matches!(err.failure, StepFailure::LogStream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_tailing_can_be_disabled() {
        let cluster = Arc::new(FakeCluster::new());
        script_success(&cluster, "test-v1-train-master");
        cluster.fail_logs("main");
        let (runner, _) = runner(&cluster, RunConfig::new().with_tail_logs(false));

        runner
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap();
        assert_eq!(cluster.count(|c| matches!(c, ClusterCall::StreamLogs(..))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstarted_failing_container_is_tailed() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(pod, vec![(Duration::from_secs(1), exited(pod, 137, "OOMKilled"))]);
        cluster.set_logs("main", ["allocating"]);
        let (runner, events) = runner(&cluster, RunConfig::default());

        let err = step_error(
            runner
                .run(&pipeline(vec![step("train")]), |_| {})
                .await
                .unwrap_err(),
        );

        assert_eq!(err.container.as_deref(), Some("main"));
        assert_eq!(
            cluster.calls().last(),
            Some(&ClusterCall::StreamLogs(pod.to_string(), "main".to_string()))
        );
        assert_eq!(events.events_of_type(names::CONTAINER_LOG).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_failure_without_container() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        let mut evicted = PodSnapshot::new("jobs", pod).with_phase(PodPhase::Failed);
        evicted.message = Some("The node was low on resource: memory.".to_string());
        cluster.script(pod, vec![(Duration::from_secs(1), RawPodEvent::Modified(evicted))]);
        let (runner, _) = runner(&cluster, RunConfig::default());

        let err = step_error(
            runner
                .run(&pipeline(vec![step("train")]), |_| {})
                .await
                .unwrap_err(),
        );

        assert_eq!(err.failure, StepFailure::PodFailed);
        assert_eq!(err.container, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_of_tailed_container_skips_grace_wait() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(
            pod,
            vec![
                (Duration::from_secs(1), running(pod)),
                (Duration::from_secs(5), exited(pod, 1, "boom")),
            ],
        );
        let (steps, _) = step_runner(
            &cluster,
            RunConfig::default().with_failure_log_grace(Duration::from_secs(60)),
        );
        let definition = PodDefinition::new(&pipeline(vec![step("train")]), &step("train")).unwrap();

        let started = tokio::time::Instant::now();
        steps
            .run_step(&definition, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_of_unseen_container_waits_for_logs() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(pod, vec![(Duration::from_secs(1), exited(pod, 137, "OOMKilled"))]);
        let (steps, _) = step_runner(
            &cluster,
            RunConfig::default().with_failure_log_grace(Duration::from_secs(60)),
        );
        let definition = PodDefinition::new(&pipeline(vec![step("train")]), &step("train")).unwrap();

        let started = tokio::time::Instant::now();
        steps
            .run_step(&definition, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_deletion_fails_step() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(
            pod,
            vec![
                (Duration::from_secs(1), running(pod)),
                (
                    Duration::from_secs(5),
                    RawPodEvent::Deleted(PodSnapshot::new("jobs", pod)),
                ),
            ],
        );
        let (runner, _) = runner(&cluster, RunConfig::default());

        let err = runner
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap_err();

        assert!(err.to_string().contains("pod was deleted unexpectedly"));
        assert_eq!(step_error(err).failure, StepFailure::DeletedExternally);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_claim_lifecycle() {
        let cluster = Arc::new(FakeCluster::new());
        let claim = "test-v1-train-master-volume-claim";
        cluster.insert_claim(claim);
        script_success(&cluster, "test-v1-train-master");
        let (runner, events) = runner(&cluster, RunConfig::default());

        runner
            .run(&pipeline(vec![step_with_storage("train", 512)]), |_| {})
            .await
            .unwrap();

        let claim_calls: Vec<_> = cluster
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    ClusterCall::CreateVolumeClaim(_) | ClusterCall::DeleteVolumeClaim(_)
                )
            })
            .collect();
        assert_eq!(
            claim_calls,
            vec![
                ClusterCall::DeleteVolumeClaim(claim.to_string()),
                ClusterCall::CreateVolumeClaim(claim.to_string()),
                ClusterCall::DeleteVolumeClaim(claim.to_string()),
            ]
        );
        assert!(!cluster.has_claim(claim));
        assert_eq!(events.events_of_type(names::VOLUME_PROVISIONED).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_claim_delete_is_tolerated() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_claim_deletes(ClusterError::forbidden(
            "persistentvolumeclaim",
            "test-v1-train-master-volume-claim",
            "cannot delete",
        ));
        script_success(&cluster, "test-v1-train-master");
        let (runner, _) = runner(&cluster, RunConfig::default());

        runner
            .run(&pipeline(vec![step_with_storage("train", 512)]), |_| {})
            .await
            .unwrap();
        assert!(cluster.has_claim("test-v1-train-master-volume-claim"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_filter_and_overrides() {
        let cluster = Arc::new(FakeCluster::new());
        script_success(&cluster, "test-v2-train-feature-x");
        let config = RunConfig::new()
            .with_step("train")
            .with_step_branch("feature/X")
            .with_step_version("v2")
            .with_image_tag("Release_1");
        let (runner, events) = runner(&cluster, config);

        let report = runner
            .run(&pipeline(vec![step("prepare"), step("train")]), |_| {})
            .await
            .unwrap();

        assert_eq!(report.skipped, vec!["prepare".to_string()]);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].pod, "test-v2-train-feature-x");
        assert_eq!(creates(&cluster), vec!["test-v2-train-feature-x"]);
        assert_eq!(events.events_of_type(names::STEP_SKIPPED).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_env_follows_launch_branch() {
        let cluster = Arc::new(FakeCluster::new());
        script_success(&cluster, "test-v1-train-master");
        let renderer = Arc::new(StaticRenderer::default());
        let steps = StepRunner::new(
            cluster.clone(),
            renderer.clone(),
            WatchConfig::default(),
            RunConfig::new().with_current_branch("master"),
        );
        let mut definition = pipeline(vec![step("train")]);
        definition.global_env = BTreeMap::from([
            (
                "bucket_name".to_string(),
                BTreeMap::from([
                    ("master".to_string(), "prod".to_string()),
                    ("other".to_string(), "dev".to_string()),
                ]),
            ),
            (
                "TRAINING_MODE".to_string(),
                BTreeMap::from([("other".to_string(), "fast".to_string())]),
            ),
        ]);

        PipelineRunner::new(steps)
            .run(&definition, |msg| panic!("unexpected fatal error: {msg}"))
            .await
            .unwrap();

        let rendered = renderer.rendered();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].bucket, "prod");
        assert!(rendered[0]
            .env
            .iter()
            .any(|v| v.name == "TRAINING_MODE" && v.value == "fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_step_filter_is_fatal() {
        let cluster = Arc::new(FakeCluster::new());
        let (runner, _) = runner(&cluster, RunConfig::new().with_step("missing"));
        let mut fatal_calls = 0;

        let err = runner
            .run(&pipeline(vec![step("train")]), |_| fatal_calls += 1)
            .await
            .unwrap_err();

        assert!(matches!(err, PaddleError::Config(_)));
        assert_eq!(fatal_calls, 1);
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_manifest_has_no_side_effects() {
        let cluster = Arc::new(FakeCluster::new());
        let events = Arc::new(CollectingEventSink::new());
        let steps = StepRunner::new(
            cluster.clone(),
            Arc::new(StaticRenderer::new("kind: Pod\nmetadata: {}\n")),
            WatchConfig::default(),
            RunConfig::default(),
        )
        .with_event_sink(events);

        let err = PipelineRunner::new(steps)
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PaddleError::Manifest(_)));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_tracking() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = "test-v1-train-master";
        cluster.script(pod, vec![(Duration::from_secs(1), running(pod))]);
        let token = CancellationToken::new();
        let (runner, _) = runner(&cluster, RunConfig::default());
        let runner = runner.with_cancel_token(token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            canceller.cancel("operator abort");
        });

        let err = runner
            .run(&pipeline(vec![step("train")]), |_| {})
            .await
            .unwrap_err();

        assert_eq!(
            step_error(err).failure,
            StepFailure::Cancelled("operator abort".to_string())
        );
    }
}
