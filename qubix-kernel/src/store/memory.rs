/**
 * MEMORY STORE - Implémentation en process du Resource Store
 *
 * RÔLE :
 * Store utilisé par le binaire standalone et par les tests. Les providers,
 * jobs et échantillons vivent dans un cache mémoire protégé par un seul
 * verrou parking_lot : chaque update (garde + écriture) est atomique.
 *
 * DONNÉES EXEMPLE (seed) :
 * ```json
 * { "providers": [{ "id": "p-1", "workerId": "wkr-1", "isOnline": false,
 *                   "isAvailable": false, "lastHeartbeat": null, "currentJobId": null }],
 *   "jobs": [] }
 * ```
 */

use super::{
    JobCondition, JobPatch, ProviderCondition, ProviderPatch, ProviderQuery, ProviderTransition,
    ResourceStore, StoreError,
};
use crate::models::{Job, JobStatus, MetricSample, Provider};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Contenu initial chargeable depuis un fichier JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Default)]
struct Tables {
    /// Index principal par workerId (clé des updates heartbeat)
    providers: HashMap<String, Provider>,
    jobs: HashMap<String, Job>,
    metrics: Vec<MetricSample>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for provider in seed.providers {
            store.insert_provider(provider);
        }
        for job in seed.jobs {
            store.insert_job(job);
        }
        store
    }

    /// Charge un seed JSON ; fichier absent = store vide
    pub async fn load_seed<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("[store] no seed file at {:?}, starting empty", path);
            return Ok(Self::new());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let seed: Seed = serde_json::from_str(&content)?;
        tracing::info!(
            "[store] loaded {} providers and {} jobs from {:?}",
            seed.providers.len(),
            seed.jobs.len(),
            path
        );
        Ok(Self::from_seed(seed))
    }

    pub fn insert_provider(&self, provider: Provider) {
        self.tables.lock().providers.insert(provider.worker_id.clone(), provider);
    }

    pub fn insert_job(&self, job: Job) {
        self.tables.lock().jobs.insert(job.id.clone(), job);
    }

    pub fn provider(&self, worker_id: &str) -> Option<Provider> {
        self.tables.lock().providers.get(worker_id).cloned()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.tables.lock().jobs.get(job_id).cloned()
    }

    pub fn metric_samples(&self) -> Vec<MetricSample> {
        self.tables.lock().metrics.clone()
    }

    pub fn provider_count(&self) -> usize {
        self.tables.lock().providers.len()
    }
}

fn apply_provider_patch(provider: &mut Provider, patch: ProviderPatch) {
    if let Some(online) = patch.is_online {
        provider.is_online = online;
    }
    if let Some(available) = patch.is_available {
        provider.is_available = available;
    }
    if let Some(hb) = patch.last_heartbeat {
        // monotone : un heartbeat en retard ne recule pas l'horloge
        provider.last_heartbeat = Some(provider.last_heartbeat.map_or(hb, |prev| prev.max(hb)));
    }
    if let Some(job) = patch.current_job_id {
        provider.current_job_id = job;
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn find_provider_by_worker_id(&self, worker_id: &str) -> Result<Option<Provider>, StoreError> {
        Ok(self.provider(worker_id))
    }

    async fn update_provider(
        &self,
        worker_id: &str,
        patch: ProviderPatch,
        condition: ProviderCondition,
    ) -> Result<Option<ProviderTransition>, StoreError> {
        let mut tables = self.tables.lock();
        let provider = tables
            .providers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::NotFound(format!("provider with workerId {}", worker_id)))?;

        if !condition.holds(provider) {
            return Ok(None);
        }

        let previous = provider.clone();
        apply_provider_patch(provider, patch);
        Ok(Some(ProviderTransition { previous, current: provider.clone() }))
    }

    async fn list_providers(&self, query: &ProviderQuery) -> Result<Vec<Provider>, StoreError> {
        let tables = self.tables.lock();
        let mut providers: Vec<Provider> =
            tables.providers.values().filter(|p| query.matches(p)).cloned().collect();
        // ordre stable pour les sweeps et les tests
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(providers)
    }

    async fn count_providers(&self, query: &ProviderQuery) -> Result<usize, StoreError> {
        Ok(self.tables.lock().providers.values().filter(|p| query.matches(p)).count())
    }

    async fn create_metric_sample(&self, sample: MetricSample) -> Result<MetricSample, StoreError> {
        self.tables.lock().metrics.push(sample.clone());
        Ok(sample)
    }

    async fn find_jobs_by_provider_and_status(
        &self,
        provider_id: &str,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.lock();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.provider_id.as_deref() == Some(provider_id) && statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_job_by_id(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.job(job_id))
    }

    async fn update_job(
        &self,
        job_id: &str,
        patch: JobPatch,
        condition: JobCondition,
    ) -> Result<Option<Job>, StoreError> {
        let mut tables = self.tables.lock();
        let job = tables
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;

        if !condition.holds(job) {
            return Ok(None);
        }

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(provider_id) = patch.provider_id {
            job.provider_id = provider_id;
        }
        if let Some(error) = patch.error {
            job.error = error;
        }
        Ok(Some(job.clone()))
    }
}
