/**
 * LIVENESS TRACKER - Machine d'état online/available/offline des providers
 *
 * RÔLE :
 * Ingestion des heartbeats workers, détection des heartbeats manqués et
 * réassignation des jobs des providers disparus.
 *
 * FONCTIONNEMENT :
 * - processHeartbeat : lookup par workerId → update atomique → échantillon
 *   métriques → broadcast si l'état online a basculé → jobs en attente
 * - Sweep périodique : providers online silencieux depuis
 *   interval × seuil (30s × 3 = 90s) → offline + PROVIDER_TIMEOUT + requeue
 * - Les transitions sont lues dans le résultat de l'update atomique du store :
 *   heartbeat et sweep ne peuvent pas annoncer la même bascule tous les deux
 *
 * ERREURS :
 * Best-effort, pas de transaction : une erreur store au milieu d'un heartbeat
 * laisse les écritures déjà faites en place et retourne success=false.
 * Dans un sweep, l'échec d'un provider n'arrête pas les autres.
 */

use crate::hub::Broadcaster;
use crate::metrics::MetricsSampler;
use crate::models::{HeartbeatRequest, HeartbeatResponse, Job, JobStatus, Provider};
use crate::protocol::{JobProgressDetails, ProviderStatus, StatusEvent};
use crate::state::TaskSlot;
use crate::store::{
    JobCondition, JobPatch, ProviderCondition, ProviderPatch, ProviderQuery, ResourceStore, StoreError,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

const REQUEUE_REASON: &str = "Provider timeout - awaiting reassignment";

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    pub missed_heartbeats_threshold: u32,
    pub check_interval: Duration,
    pub pending_jobs_limit: usize,
    pub store_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats_threshold: 3,
            check_interval: Duration::from_secs(30),
            pending_jobs_limit: 5,
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl LivenessConfig {
    pub fn timeout_window(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.missed_heartbeats_threshold)
    }
}

/// `now - span`, borné à la plus petite date représentable
fn instant_before(now: OffsetDateTime, span: Duration) -> OffsetDateTime {
    time::Duration::try_from(span)
        .ok()
        .and_then(|span| now.checked_sub(span))
        .unwrap_or_else(|| time::Date::MIN.midnight().assume_utc())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LivenessError {
    #[error("Provider not found")]
    ProviderNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessStats {
    pub total_providers: usize,
    pub online_providers: usize,
    pub recent_heartbeats: usize,
    pub timeout_threshold_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub is_running: bool,
}

/// Bilan d'un passage du sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub marked_offline: usize,
    pub jobs_requeued: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkOutcome {
    /// un heartbeat est arrivé entre la requête et l'écriture
    Skipped,
    Offline { requeued: bool },
}

#[derive(Clone)]
pub struct LivenessTracker {
    store: Arc<dyn ResourceStore>,
    broadcaster: Arc<dyn Broadcaster>,
    sampler: MetricsSampler,
    config: LivenessConfig,
    sweeper: TaskSlot,
}

impl LivenessTracker {
    pub fn new(store: Arc<dyn ResourceStore>, broadcaster: Arc<dyn Broadcaster>, config: LivenessConfig) -> Self {
        Self {
            sampler: MetricsSampler::new(store.clone()),
            store,
            broadcaster,
            config,
            sweeper: TaskSlot::new(),
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.config.store_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.config.store_timeout))?
    }

    pub async fn process_heartbeat(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        self.process_heartbeat_at(request, OffsetDateTime::now_utc()).await
    }

    pub async fn process_heartbeat_at(&self, request: HeartbeatRequest, now: OffsetDateTime) -> HeartbeatResponse {
        match self.try_process_heartbeat_at(&request, now).await {
            Ok(pending_jobs) => HeartbeatResponse::ok(pending_jobs),
            Err(e) => HeartbeatResponse::failed(e.to_string()),
        }
    }

    /// Variante typée : l'appelant distingue provider inconnu et panne store
    pub async fn try_process_heartbeat(&self, request: &HeartbeatRequest) -> Result<Vec<Job>, LivenessError> {
        self.try_process_heartbeat_at(request, OffsetDateTime::now_utc()).await
    }

    pub async fn try_process_heartbeat_at(
        &self,
        request: &HeartbeatRequest,
        now: OffsetDateTime,
    ) -> Result<Vec<Job>, LivenessError> {
        let result = self.apply_heartbeat(request, now).await;
        match &result {
            Err(LivenessError::ProviderNotFound(worker_id)) => {
                debug!("[liveness] heartbeat from unknown worker {}", worker_id);
            }
            Err(e) => error!("[liveness] error processing heartbeat from {}: {}", request.worker_id, e),
            Ok(_) => {}
        }
        result
    }

    async fn apply_heartbeat(&self, request: &HeartbeatRequest, now: OffsetDateTime) -> Result<Vec<Job>, LivenessError> {
        let worker_id = request.worker_id.as_str();
        let not_found = || LivenessError::ProviderNotFound(worker_id.to_string());

        // aucun effet de bord tant que le provider n'est pas connu
        let provider = self
            .bounded(self.store.find_provider_by_worker_id(worker_id))
            .await?
            .ok_or_else(not_found)?;

        let patch = ProviderPatch {
            is_online: Some(request.is_online()),
            is_available: Some(request.is_available()),
            last_heartbeat: Some(now),
            current_job_id: Some(request.current_job().map(str::to_string)),
        };
        // le provider peut disparaître entre le lookup et l'écriture
        let transition = match self
            .bounded(self.store.update_provider(worker_id, patch, ProviderCondition::Always))
            .await
        {
            Ok(Some(transition)) => transition,
            Ok(None) | Err(StoreError::NotFound(_)) => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        if let Some(usage) = &request.usage {
            self.bounded(self.sampler.record(&provider.id, usage, now)).await?;
        }

        let event = if transition.came_online() {
            Some(StatusEvent::ProviderOnline)
        } else if transition.went_offline() {
            Some(StatusEvent::ProviderOffline)
        } else {
            None
        };
        if let Some(event) = event {
            info!("[liveness] provider {} → {:?}", provider.id, transition.current.state());
            let current = &transition.current;
            let status = ProviderStatus {
                is_online: current.is_online,
                is_available: current.is_available,
                last_heartbeat: current.last_heartbeat,
                event,
                reason: None,
            };
            self.broadcaster.provider_status_changed(&provider.id, status).await;
        }

        if let Some(usage) = &request.usage {
            self.broadcaster.gpu_metrics_update(&provider.id, usage).await;
        }

        let pending = self
            .bounded(self.store.find_jobs_by_provider_and_status(
                &provider.id,
                &[JobStatus::Assigned, JobStatus::Pending],
                self.config.pending_jobs_limit,
            ))
            .await?;
        Ok(pending)
    }

    pub async fn check_for_timeouts(&self) -> SweepReport {
        self.check_for_timeouts_at(OffsetDateTime::now_utc()).await
    }

    /// Un passage du sweep évalué à l'instant `now`
    pub async fn check_for_timeouts_at(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = instant_before(now, self.config.timeout_window());
        let query = ProviderQuery {
            is_online: Some(true),
            heartbeat_before: Some(cutoff),
            ..Default::default()
        };

        let timed_out = match self.bounded(self.store.list_providers(&query)).await {
            Ok(providers) => providers,
            Err(e) => {
                error!("[liveness] error checking for provider timeouts: {}", e);
                report.failures += 1;
                return report;
            }
        };
        if timed_out.is_empty() {
            return report;
        }

        warn!("[liveness] found {} timed out providers", timed_out.len());
        report.timed_out = timed_out.len();

        for provider in &timed_out {
            match self.mark_offline(provider, now, cutoff).await {
                Ok(MarkOutcome::Offline { requeued }) => {
                    report.marked_offline += 1;
                    report.jobs_requeued += usize::from(requeued);
                }
                Ok(MarkOutcome::Skipped) => {
                    debug!("[liveness] provider {} heartbeat arrived during sweep", provider.id);
                }
                Err(e) => {
                    error!("[liveness] failed to mark provider {} offline: {}", provider.id, e);
                    report.failures += 1;
                }
            }
        }
        report
    }

    async fn mark_offline(
        &self,
        provider: &Provider,
        now: OffsetDateTime,
        cutoff: OffsetDateTime,
    ) -> Result<MarkOutcome, LivenessError> {
        let patch = ProviderPatch {
            is_online: Some(false),
            is_available: Some(false),
            ..Default::default()
        };
        let Some(transition) = self
            .bounded(self.store.update_provider(&provider.worker_id, patch, ProviderCondition::StaleSince(cutoff)))
            .await?
        else {
            return Ok(MarkOutcome::Skipped);
        };

        // StaleSince garantit un lastHeartbeat présent
        let silent_for = transition
            .previous
            .last_heartbeat
            .map(|hb| (now - hb).whole_seconds().max(0))
            .unwrap_or_default();
        info!(
            "[liveness] provider {} (worker {}) timed out after {}s",
            provider.id, provider.worker_id, silent_for
        );

        let status = ProviderStatus {
            is_online: false,
            is_available: false,
            last_heartbeat: transition.previous.last_heartbeat,
            event: StatusEvent::ProviderTimeout,
            reason: Some(format!("No heartbeat for {}s", silent_for)),
        };
        self.broadcaster.provider_status_changed(&provider.id, status).await;

        // le provider est déjà offline : un échec de requeue ne l'annule pas
        let requeued = match &transition.previous.current_job_id {
            Some(job_id) => match self.reassign_job(job_id, &provider.id).await {
                Ok(requeued) => requeued,
                Err(e) => {
                    error!("[liveness] failed to requeue job {} of provider {}: {}", job_id, provider.id, e);
                    false
                }
            },
            None => false,
        };
        Ok(MarkOutcome::Offline { requeued })
    }

    /// Remet en PENDING un job encore actif ; sans effet sur un job terminé
    async fn reassign_job(&self, job_id: &str, provider_id: &str) -> Result<bool, LivenessError> {
        let Some(job) = self.bounded(self.store.find_job_by_id(job_id)).await? else {
            warn!("[liveness] job {} of provider {} not found", job_id, provider_id);
            return Ok(false);
        };
        if !job.status.is_active() {
            debug!("[liveness] job {} already {}, nothing to reassign", job_id, job.status.as_str());
            return Ok(false);
        }

        info!("[liveness] reassigning job {} due to provider {} timeout", job_id, provider_id);
        let patch = JobPatch {
            status: Some(JobStatus::Pending),
            provider_id: Some(None),
            error: Some(Some(format!(
                "Provider {} timed out, job queued for reassignment",
                provider_id
            ))),
        };
        let Some(updated) = self
            .bounded(self.store.update_job(job_id, patch, JobCondition::Active))
            .await?
        else {
            debug!("[liveness] job {} finished before requeue", job_id);
            return Ok(false);
        };

        let details = JobProgressDetails {
            status: Some(JobStatus::Pending),
            reason: Some(REQUEUE_REASON.to_string()),
            ..Default::default()
        };
        self.broadcaster.job_progress(job_id, updated.progress, details).await;
        Ok(true)
    }

    pub async fn stats(&self) -> Result<LivenessStats, LivenessError> {
        self.stats_at(OffsetDateTime::now_utc()).await
    }

    pub async fn stats_at(&self, now: OffsetDateTime) -> Result<LivenessStats, LivenessError> {
        let recent = ProviderQuery {
            heartbeat_since: Some(instant_before(now, self.config.heartbeat_interval.saturating_mul(2))),
            ..Default::default()
        };
        let online = ProviderQuery { is_online: Some(true), ..Default::default() };

        let all = ProviderQuery::default();
        let (total, online, recent) = tokio::try_join!(
            self.bounded(self.store.count_providers(&all)),
            self.bounded(self.store.count_providers(&online)),
            self.bounded(self.store.count_providers(&recent)),
        )?;

        Ok(LivenessStats {
            total_providers: total,
            online_providers: online,
            recent_heartbeats: recent,
            timeout_threshold_seconds: self.config.timeout_window().as_secs(),
            heartbeat_interval_seconds: self.config.heartbeat_interval.as_secs(),
            is_running: self.is_running(),
        })
    }

    /// Démarre le sweep périodique (premier passage immédiat)
    pub fn start(&self) {
        let tracker = self.clone();
        let period = self.config.check_interval;
        let started = self.sweeper.install(move || {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let report = tracker.check_for_timeouts().await;
                    if report.marked_offline > 0 || report.failures > 0 {
                        info!("[liveness] sweep: {:?}", report);
                    }
                }
            })
        });

        if started {
            info!(
                "[liveness] heartbeat monitoring started (interval {:?}, timeout {:?}, threshold {})",
                self.config.heartbeat_interval,
                self.config.timeout_window(),
                self.config.missed_heartbeats_threshold
            );
        } else {
            warn!("[liveness] heartbeat monitoring already running");
        }
    }

    pub fn stop(&self) {
        self.sweeper.abort();
        info!("[liveness] heartbeat monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{EventHub, HubConfig};
    use crate::models::{MetricSample, ResourceUsage, WorkerStatus};
    use crate::registry::Outbound;
    use crate::store::{MemoryStore, ProviderTransition};
    use async_trait::async_trait;
    use serde_json::Value;
    use time::macros::datetime;
    use tokio::sync::mpsc;

    const T0: OffsetDateTime = datetime!(2025-06-01 10:00:00 UTC);

    fn provider(worker_id: &str, online: bool, hb: Option<OffsetDateTime>) -> Provider {
        Provider {
            id: worker_id.to_string(),
            worker_id: worker_id.to_string(),
            is_online: online,
            is_available: online,
            last_heartbeat: hb,
            current_job_id: None,
        }
    }

    fn job(id: &str, provider_id: &str, status: JobStatus) -> Job {
        Job {
            id: id.into(),
            status,
            provider_id: Some(provider_id.into()),
            progress: 10.0,
            error: None,
            created_at: T0,
        }
    }

    async fn watch(hub: &EventHub, message: &str) -> mpsc::Receiver<Outbound> {
        let (id, mut rx) = hub.open_connection();
        hub.handle_message(&id, message).await;
        while rx.try_recv().is_ok() {}
        rx
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn setup(store: Arc<dyn ResourceStore>) -> (LivenessTracker, EventHub) {
        let hub = EventHub::new(HubConfig::default());
        let tracker = LivenessTracker::new(store, Arc::new(hub.clone()), LivenessConfig::default());
        (tracker, hub)
    }

    #[tokio::test]
    async fn test_heartbeat_brings_provider_online() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("wkr-1", false, None));
        store.insert_job(job("J1", "wkr-1", JobStatus::Assigned));
        let (tracker, hub) = setup(store.clone());
        let mut market = watch(&hub, r#"{"type":"subscribe:marketplace"}"#).await;

        let mut hb = HeartbeatRequest::new("wkr-1");
        hb.status = Some(WorkerStatus::Online);
        let resp = tracker.process_heartbeat_at(hb, T0).await;

        assert!(resp.success);
        assert_eq!(resp.pending_jobs.len(), 1);
        let p = store.provider("wkr-1").unwrap();
        assert!(p.is_online && p.is_available);
        assert_eq!(p.last_heartbeat, Some(T0));

        let f = frames(&mut market);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0]["data"]["status"]["event"], "PROVIDER_ONLINE");
    }

    #[tokio::test]
    async fn test_no_broadcast_when_online_state_unchanged() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("wkr-1", true, Some(T0)));
        let (tracker, hub) = setup(store.clone());
        let mut market = watch(&hub, r#"{"type":"subscribe:marketplace"}"#).await;

        let mut hb = HeartbeatRequest::new("wkr-1");
        hb.status = Some(WorkerStatus::Busy);
        assert!(tracker.process_heartbeat_at(hb, T0 + Duration::from_secs(30)).await.success);

        assert!(!store.provider("wkr-1").unwrap().is_available);
        assert!(frames(&mut market).is_empty());
    }

    #[tokio::test]
    async fn test_explicit_offline_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("wkr-1", true, Some(T0)));
        let (tracker, hub) = setup(store.clone());
        let mut watcher = watch(&hub, r#"{"type":"subscribe:provider","subscriptionId":"wkr-1"}"#).await;

        let mut hb = HeartbeatRequest::new("wkr-1");
        hb.status = Some(WorkerStatus::Offline);
        tracker.process_heartbeat_at(hb, T0).await;

        let f = frames(&mut watcher);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0]["data"]["status"]["event"], "PROVIDER_OFFLINE");
        assert!(!store.provider("wkr-1").unwrap().is_online);
    }

    #[tokio::test]
    async fn test_unknown_worker_has_no_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let (tracker, hub) = setup(store.clone());
        let mut market = watch(&hub, r#"{"type":"subscribe:marketplace"}"#).await;

        let mut hb = HeartbeatRequest::new("ghost");
        hb.usage = Some(ResourceUsage { cpu_percent: 1.0, ram_percent: 1.0, ..Default::default() });
        let resp = tracker.process_heartbeat_at(hb, T0).await;

        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Provider not found"));
        assert!(resp.pending_jobs.is_empty());
        assert_eq!(store.provider_count(), 0);
        assert!(store.metric_samples().is_empty());
        assert!(frames(&mut market).is_empty());
    }

    #[tokio::test]
    async fn test_usage_produces_sample_and_metrics_event() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("wkr-1", true, Some(T0)));
        let (tracker, hub) = setup(store.clone());
        let mut watcher = watch(&hub, r#"{"type":"subscribe:provider","subscriptionId":"wkr-1"}"#).await;

        let mut hb = HeartbeatRequest::new("wkr-1");
        hb.usage = Some(ResourceUsage { cpu_percent: 20.0, ram_percent: 30.0, gpu_temp: Some(71.0), ..Default::default() });
        tracker.process_heartbeat_at(hb, T0).await;

        assert_eq!(store.metric_samples().len(), 1);
        let f = frames(&mut watcher);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0]["type"], "GPU_METRICS_UPDATE");
        assert_eq!(f[0]["data"]["metrics"]["gpuTemp"], 71.0);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("wkr-1", true, Some(T0)));
        store.insert_provider(provider("wkr-2", true, Some(T0 + Duration::from_secs(60))));
        let (tracker, hub) = setup(store.clone());
        let mut market = watch(&hub, r#"{"type":"subscribe:marketplace"}"#).await;

        let at = T0 + Duration::from_secs(95);
        let first = tracker.check_for_timeouts_at(at).await;
        assert_eq!(first.marked_offline, 1);
        let second = tracker.check_for_timeouts_at(at + Duration::from_secs(30)).await;
        assert_eq!(second, SweepReport::default());

        let f = frames(&mut market);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0]["data"]["status"]["event"], "PROVIDER_TIMEOUT");
        assert_eq!(f[0]["data"]["status"]["reason"], "No heartbeat for 95s");
        assert!(store.provider("wkr-2").unwrap().is_online);
    }

    #[tokio::test]
    async fn test_timeout_requeues_running_job() {
        let store = Arc::new(MemoryStore::new());
        let mut p = provider("wkr-2", true, Some(T0));
        p.current_job_id = Some("J9".into());
        store.insert_provider(p);
        store.insert_job(job("J9", "wkr-2", JobStatus::Running));
        let (tracker, hub) = setup(store.clone());
        let mut job_watch = watch(&hub, r#"{"type":"subscribe:job","subscriptionId":"J9"}"#).await;

        let report = tracker.check_for_timeouts_at(T0 + Duration::from_secs(120)).await;
        assert_eq!(report.jobs_requeued, 1);

        let j = store.job("J9").unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.provider_id, None);
        assert!(j.error.unwrap().contains("timed out"));

        let f = frames(&mut job_watch);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0]["type"], "JOB_PROGRESS");
        assert_eq!(f[0]["data"]["status"], "PENDING");
        assert_eq!(f[0]["data"]["reason"], REQUEUE_REASON);
    }

    #[tokio::test]
    async fn test_timeout_leaves_finished_job_alone() {
        for status in [JobStatus::Completed, JobStatus::Failed] {
            let store = Arc::new(MemoryStore::new());
            let mut p = provider("wkr-2", true, Some(T0));
            p.current_job_id = Some("J9".into());
            store.insert_provider(p);
            store.insert_job(job("J9", "wkr-2", status));
            let (tracker, _hub) = setup(store.clone());

            let report = tracker.check_for_timeouts_at(T0 + Duration::from_secs(120)).await;
            assert_eq!(report.marked_offline, 1);
            assert_eq!(report.jobs_requeued, 0);
            assert_eq!(store.job("J9").unwrap(), job("J9", "wkr-2", status));
        }
    }

    /// Store dont certaines opérations échouent ou traînent
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        failing_worker: &'static str,
        slow_lookup: bool,
        /// la ligne disparaît entre lookup et update
        vanishing_worker: &'static str,
        failing_job_lookup: bool,
        /// heartbeat concurrent écrit juste après la requête du sweep
        heartbeat_during_list: Option<OffsetDateTime>,
    }

    impl FaultyStore {
        fn new(inner: MemoryStore) -> Self {
            Self { inner, ..Default::default() }
        }
    }

    #[async_trait]
    impl ResourceStore for FaultyStore {
        async fn find_provider_by_worker_id(&self, worker_id: &str) -> Result<Option<Provider>, StoreError> {
            if self.slow_lookup {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.inner.find_provider_by_worker_id(worker_id).await
        }

        async fn update_provider(
            &self,
            worker_id: &str,
            patch: ProviderPatch,
            condition: ProviderCondition,
        ) -> Result<Option<ProviderTransition>, StoreError> {
            if worker_id == self.failing_worker {
                return Err(StoreError::Backend("disk on fire".into()));
            }
            if worker_id == self.vanishing_worker {
                return Err(StoreError::NotFound(worker_id.to_string()));
            }
            self.inner.update_provider(worker_id, patch, condition).await
        }

        async fn list_providers(&self, query: &ProviderQuery) -> Result<Vec<Provider>, StoreError> {
            let providers = self.inner.list_providers(query).await?;
            if let Some(at) = self.heartbeat_during_list {
                for p in &providers {
                    let patch = ProviderPatch { last_heartbeat: Some(at), ..Default::default() };
                    self.inner.update_provider(&p.worker_id, patch, ProviderCondition::Always).await?;
                }
            }
            Ok(providers)
        }

        async fn count_providers(&self, query: &ProviderQuery) -> Result<usize, StoreError> {
            self.inner.count_providers(query).await
        }

        async fn create_metric_sample(&self, sample: MetricSample) -> Result<MetricSample, StoreError> {
            self.inner.create_metric_sample(sample).await
        }

        async fn find_jobs_by_provider_and_status(
            &self,
            provider_id: &str,
            statuses: &[JobStatus],
            limit: usize,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.find_jobs_by_provider_and_status(provider_id, statuses, limit).await
        }

        async fn find_job_by_id(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
            if self.failing_job_lookup {
                return Err(StoreError::Backend("jobs table locked".into()));
            }
            self.inner.find_job_by_id(job_id).await
        }

        async fn update_job(&self, job_id: &str, patch: JobPatch, condition: JobCondition) -> Result<Option<Job>, StoreError> {
            self.inner.update_job(job_id, patch, condition).await
        }
    }

    #[tokio::test]
    async fn test_sweep_failure_is_isolated_per_provider() {
        let inner = MemoryStore::new();
        inner.insert_provider(provider("wkr-a", true, Some(T0)));
        inner.insert_provider(provider("wkr-b", true, Some(T0)));
        inner.insert_provider(provider("wkr-c", true, Some(T0)));
        let store = Arc::new(FaultyStore { failing_worker: "wkr-b", ..FaultyStore::new(inner) });
        let (tracker, _hub) = setup(store.clone());

        let report = tracker.check_for_timeouts_at(T0 + Duration::from_secs(100)).await;
        assert_eq!(report.timed_out, 3);
        assert_eq!(report.marked_offline, 2);
        assert_eq!(report.failures, 1);
        assert!(!store.inner.provider("wkr-c").unwrap().is_online);
    }

    #[tokio::test]
    async fn test_store_failure_becomes_failed_response() {
        let inner = MemoryStore::new();
        inner.insert_provider(provider("wkr-b", false, None));
        let store = Arc::new(FaultyStore { failing_worker: "wkr-b", ..FaultyStore::new(inner) });
        let (tracker, _hub) = setup(store);

        let resp = tracker.process_heartbeat_at(HeartbeatRequest::new("wkr-b"), T0).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_slow_store_is_bounded() {
        let inner = MemoryStore::new();
        inner.insert_provider(provider("wkr-1", false, None));
        let store = Arc::new(FaultyStore { slow_lookup: true, ..FaultyStore::new(inner) });
        let hub = EventHub::new(HubConfig::default());
        let config = LivenessConfig { store_timeout: Duration::from_millis(20), ..LivenessConfig::default() };
        let tracker = LivenessTracker::new(store, Arc::new(hub), config);

        let resp = tracker.process_heartbeat_at(HeartbeatRequest::new("wkr-1"), T0).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_provider_vanishing_before_update_is_not_found() {
        let inner = MemoryStore::new();
        inner.insert_provider(provider("wkr-v", true, Some(T0)));
        let store = Arc::new(FaultyStore { vanishing_worker: "wkr-v", ..FaultyStore::new(inner) });
        let (tracker, _hub) = setup(store);

        let err = tracker
            .try_process_heartbeat_at(&HeartbeatRequest::new("wkr-v"), T0)
            .await
            .unwrap_err();
        assert_eq!(err, LivenessError::ProviderNotFound("wkr-v".into()));

        let resp = tracker.process_heartbeat_at(HeartbeatRequest::new("wkr-v"), T0).await;
        assert_eq!(resp.error.as_deref(), Some("Provider not found"));
    }

    #[tokio::test]
    async fn test_requeue_failure_still_counts_provider_offline() {
        let inner = MemoryStore::new();
        let mut p = provider("wkr-2", true, Some(T0));
        p.current_job_id = Some("J9".into());
        inner.insert_provider(p);
        inner.insert_job(job("J9", "wkr-2", JobStatus::Running));
        let store = Arc::new(FaultyStore { failing_job_lookup: true, ..FaultyStore::new(inner) });
        let (tracker, hub) = setup(store.clone());
        let mut market = watch(&hub, r#"{"type":"subscribe:marketplace"}"#).await;

        let report = tracker.check_for_timeouts_at(T0 + Duration::from_secs(120)).await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.marked_offline, 1);
        assert_eq!(report.jobs_requeued, 0);
        assert_eq!(report.failures, 0);
        assert!(!store.inner.provider("wkr-2").unwrap().is_online);
        assert_eq!(store.inner.job("J9").unwrap().status, JobStatus::Running);
        assert_eq!(frames(&mut market).len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_during_sweep_skips_timeout() {
        let inner = MemoryStore::new();
        inner.insert_provider(provider("wkr-1", true, Some(T0)));
        let at = T0 + Duration::from_secs(100);
        let store = Arc::new(FaultyStore { heartbeat_during_list: Some(at), ..FaultyStore::new(inner) });
        let (tracker, hub) = setup(store.clone());
        let mut market = watch(&hub, r#"{"type":"subscribe:marketplace"}"#).await;

        let report = tracker.check_for_timeouts_at(at).await;
        assert_eq!(report, SweepReport { timed_out: 1, ..Default::default() });
        let p = store.inner.provider("wkr-1").unwrap();
        assert!(p.is_online);
        assert_eq!(p.last_heartbeat, Some(at));
        assert!(frames(&mut market).is_empty());
    }

    #[tokio::test]
    async fn test_huge_intervals_do_not_overflow() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("wkr-1", true, Some(T0)));
        let config = LivenessConfig {
            heartbeat_interval: Duration::from_secs(1_000_000_000_000),
            missed_heartbeats_threshold: u32::MAX,
            ..LivenessConfig::default()
        };
        assert_eq!(config.timeout_window(), Duration::MAX);
        let tracker = LivenessTracker::new(store.clone(), Arc::new(EventHub::new(HubConfig::default())), config);

        let report = tracker.check_for_timeouts_at(T0 + Duration::from_secs(3600)).await;
        assert_eq!(report, SweepReport::default());
        assert!(store.provider("wkr-1").unwrap().is_online);

        let stats = tracker.stats_at(T0).await.unwrap();
        assert_eq!(stats.recent_heartbeats, 1);
        assert_eq!(stats.timeout_threshold_seconds, u64::MAX);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(provider("a", true, Some(T0)));
        store.insert_provider(provider("b", true, Some(T0 - Duration::from_secs(61))));
        store.insert_provider(provider("c", false, None));
        let (tracker, _hub) = setup(store);

        let stats = tracker.stats_at(T0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.total_providers, 3);
        assert_eq!(stats.online_providers, 2);
        assert_eq!(stats.recent_heartbeats, 1);
        assert_eq!(stats.timeout_threshold_seconds, 90);
        assert_eq!(stats.heartbeat_interval_seconds, 30);
        assert!(!stats.is_running);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let store = Arc::new(MemoryStore::new());
        let (tracker, _hub) = setup(store);
        tracker.start();
        tracker.start();
        assert!(tracker.is_running());
        tracker.stop();
        assert!(!tracker.is_running());
    }
}
