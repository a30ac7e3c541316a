//! Scénarios de bout en bout : heartbeats, sweeps, réassignation, fan-out.

use crate::fixtures::{gpu_usage, job, HeartbeatBuilder, ProviderBuilder, T0};
use crate::test_utils::TestHarness;
use qubix_kernel::protocol::{JobProgressDetails, StatusEvent};
use qubix_kernel::{JobStatus, WorkerStatus};
use serde_json::json;

#[tokio::test]
async fn scenario_timeout_after_missed_heartbeats() {
    let harness = TestHarness::new().with_provider(ProviderBuilder::new("wkr-1").build());
    let mut market = harness.connect();
    market.subscribe_marketplace().await;
    let mut watcher = harness.connect();
    watcher.subscribe_provider("wkr-1").await;

    let hb = HeartbeatBuilder::new("wkr-1").status(WorkerStatus::Online).build();
    assert!(harness.heartbeat_at(0, hb).await.success);
    market.frames();
    watcher.frames();
    harness.recorder.clear();

    let early = harness.sweep_at(40).await;
    assert_eq!(early.marked_offline, 0);
    assert!(harness.provider("wkr-1").unwrap().is_online);
    assert!(market.frames().is_empty());

    let late = harness.sweep_at(95).await;
    assert_eq!(late.marked_offline, 1);
    assert!(!harness.provider("wkr-1").unwrap().is_online);

    for client in [&mut market, &mut watcher] {
        let frames = client.frames_of("PROVIDER_STATUS_CHANGED");
        assert_eq!(frames.len(), 1);
        TestHarness::assert_field_equals(&frames[0], "data.status.event", &json!("PROVIDER_TIMEOUT")).unwrap();
        TestHarness::assert_field_equals(&frames[0], "data.providerId", &json!("wkr-1")).unwrap();
    }
    assert_eq!(harness.recorder.status_events("wkr-1"), vec![StatusEvent::ProviderTimeout]);
}

#[tokio::test]
async fn scenario_topics_keyed_by_provider_id() {
    let harness = TestHarness::new()
        .with_provider(ProviderBuilder::new("wkr-7").id("prov-7").online_since(T0).build());
    let mut by_provider = harness.connect();
    by_provider.subscribe_provider("prov-7").await;
    let mut by_worker = harness.connect();
    by_worker.subscribe_provider("wkr-7").await;

    let hb = HeartbeatBuilder::new("wkr-7").usage(gpu_usage(50.0, 60.0, 1024.0)).build();
    assert!(harness.heartbeat_at(10, hb).await.success);
    assert_eq!(harness.store.metric_samples()[0].provider_id, "prov-7");

    let report = harness.sweep_at(200).await;
    assert_eq!(report.marked_offline, 1);

    let frames = by_provider.frames();
    assert_eq!(frames.len(), 2);
    TestHarness::assert_field_equals(&frames[0], "type", &json!("GPU_METRICS_UPDATE")).unwrap();
    TestHarness::assert_field_equals(&frames[1], "data.providerId", &json!("prov-7")).unwrap();
    TestHarness::assert_field_equals(&frames[1], "data.status.event", &json!("PROVIDER_TIMEOUT")).unwrap();
    assert!(by_worker.frames().is_empty());
    assert!(!harness.provider("wkr-7").unwrap().is_online);
}

#[tokio::test]
async fn scenario_job_progress_fan_out() {
    let harness = TestHarness::new();
    let mut subscriber = harness.connect();
    subscriber.subscribe_job("J123").await;
    let mut bystander = harness.connect();

    harness.hub.broadcast_job_progress("J123", 42.0, &JobProgressDetails::default()).await;

    let frames = subscriber.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "JOB_PROGRESS");
    assert_eq!(frames[0]["data"]["progress"], 42.0);
    assert!(bystander.frames().is_empty());
}

#[tokio::test]
async fn scenario_running_job_requeued_on_timeout() {
    let harness = TestHarness::new()
        .with_provider(ProviderBuilder::new("wkr-2").online_since(T0).running("J9").build())
        .with_job(job("J9", Some("wkr-2"), JobStatus::Running));
    let mut job_watcher = harness.connect();
    job_watcher.subscribe_job("J9").await;

    let report = harness.sweep_at(91).await;
    assert_eq!(report.jobs_requeued, 1);

    let j9 = harness.job("J9").unwrap();
    assert_eq!(j9.status, JobStatus::Pending);
    assert_eq!(j9.provider_id, None);
    assert_eq!(j9.error.as_deref(), Some("Provider wkr-2 timed out, job queued for reassignment"));

    let frames = job_watcher.frames_of("JOB_PROGRESS");
    assert_eq!(frames.len(), 1);
    TestHarness::assert_field_equals(&frames[0], "data.status", &json!("PENDING")).unwrap();
    TestHarness::assert_field_equals(&frames[0], "data.jobId", &json!("J9")).unwrap();
}

#[tokio::test]
async fn scenario_busy_heartbeat_brings_provider_online() {
    let harness = TestHarness::new()
        .with_provider(ProviderBuilder::new("wkr-3").build())
        .with_job(job("J5", Some("wkr-3"), JobStatus::Assigned));

    let hb = HeartbeatBuilder::new("wkr-3").status(WorkerStatus::Busy).current_job("J5").build();
    let resp = harness.heartbeat_at(0, hb).await;
    assert!(resp.success);
    assert_eq!(resp.pending_jobs.len(), 1);

    let p = harness.provider("wkr-3").unwrap();
    assert!(p.is_online);
    assert!(!p.is_available);
    assert_eq!(p.current_job_id.as_deref(), Some("J5"));

    assert_eq!(harness.recorder.status_events("wkr-3"), vec![StatusEvent::ProviderOnline]);
    assert_eq!(harness.recorder.metrics_count("wkr-3"), 0);
}

#[tokio::test]
async fn property_resweep_marks_offline_once() {
    let harness = TestHarness::new()
        .with_provider(ProviderBuilder::new("a").online_since(T0).build())
        .with_provider(ProviderBuilder::new("b").online_since(T0).build());

    let mut total = 0;
    for t in [100, 130, 160, 190] {
        total += harness.sweep_at(t).await.marked_offline;
    }
    assert_eq!(total, 2);
    assert_eq!(harness.recorder.status_events("a"), vec![StatusEvent::ProviderTimeout]);
    assert_eq!(harness.recorder.status_events("b"), vec![StatusEvent::ProviderTimeout]);

    // un heartbeat remet en ligne, un nouveau silence repasse offline une fois
    harness.heartbeat_at(200, HeartbeatBuilder::new("a").build()).await;
    assert_eq!(harness.sweep_at(250).await.marked_offline, 0);
    assert_eq!(harness.sweep_at(291).await.marked_offline, 1);
    assert_eq!(
        harness.recorder.status_events("a"),
        vec![StatusEvent::ProviderTimeout, StatusEvent::ProviderOnline, StatusEvent::ProviderTimeout]
    );
}

#[tokio::test]
async fn property_unknown_worker_is_noop() {
    let harness = TestHarness::new();
    let mut market = harness.connect();
    market.subscribe_marketplace().await;

    let hb = HeartbeatBuilder::new("ghost").usage(gpu_usage(99.0, 80.0, 2048.0)).build();
    let resp = harness.heartbeat_at(0, hb).await;

    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("Provider not found"));
    assert!(harness.provider("ghost").is_err());
    assert!(harness.store.metric_samples().is_empty());
    assert_eq!(harness.recorder.count(), 0);
    assert!(market.frames().is_empty());
}

#[tokio::test]
async fn property_broadcast_to_empty_topic_is_silent() {
    let harness = TestHarness::new();
    let mut idle = harness.connect();

    harness.hub.broadcast_job_progress("J-nobody", 1.0, &JobProgressDetails::default()).await;
    harness.hub.broadcast_earnings_update("p-nobody", json!({ "amount": 1 })).await;

    assert!(idle.frames().is_empty());
    assert_eq!(harness.hub.stats().total_subscriptions, 0);
    assert_eq!(harness.hub.stats().total_clients, 1);
}

#[tokio::test]
async fn property_only_active_jobs_requeued() {
    let cases = [
        (JobStatus::Running, true),
        (JobStatus::Assigned, true),
        (JobStatus::Completed, false),
        (JobStatus::Failed, false),
    ];
    for (status, requeued) in cases {
        let harness = TestHarness::new()
            .with_provider(ProviderBuilder::new("wkr-x").online_since(T0).running("JX").build())
            .with_job(job("JX", Some("wkr-x"), status));

        let report = harness.sweep_at(120).await;
        assert_eq!(report.marked_offline, 1);
        assert_eq!(report.jobs_requeued, usize::from(requeued), "{:?}", status);

        let jx = harness.job("JX").unwrap();
        if requeued {
            assert_eq!(jx.status, JobStatus::Pending);
            assert_eq!(jx.provider_id, None);
            assert_eq!(harness.recorder.job_progress("JX").len(), 1);
        } else {
            assert_eq!(jx, job("JX", Some("wkr-x"), status));
            assert!(harness.recorder.job_progress("JX").is_empty());
        }
    }
}

#[tokio::test]
async fn usage_heartbeat_records_sample_and_streams_metrics() {
    let harness = TestHarness::new().with_provider(ProviderBuilder::new("wkr-4").online_since(T0).build());
    let mut watcher = harness.connect();
    watcher.subscribe_provider("wkr-4").await;

    let hb = HeartbeatBuilder::new("wkr-4").usage(gpu_usage(75.0, 66.0, 4096.0)).build();
    assert!(harness.heartbeat_at(30, hb).await.success);

    let samples = harness.store.metric_samples();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].gpu_mem_used_gb, Some(4.0));

    let frames = watcher.frames();
    assert_eq!(frames.len(), 1);
    TestHarness::assert_field_equals(&frames[0], "type", &json!("GPU_METRICS_UPDATE")).unwrap();
    TestHarness::assert_field_equals(&frames[0], "data.metrics.gpuPercent", &json!(75.0)).unwrap();
}

#[tokio::test]
async fn idle_client_evicted_and_closed() {
    let harness = TestHarness::new();
    let mut client = harness.connect();
    client.subscribe_marketplace().await;

    let later = tokio::time::Instant::now() + std::time::Duration::from_secs(120);
    assert_eq!(harness.hub.evict_stale_at(later), 1);
    client.frames();
    assert!(client.was_closed());
    assert_eq!(harness.hub.stats().total_subscriptions, 0);
}
