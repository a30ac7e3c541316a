use crate::models::{MetricSample, ResourceUsage};
use crate::store::{ResourceStore, StoreError};
use std::sync::Arc;
use time::OffsetDateTime;

const MB_PER_GB: f64 = 1024.0;

/// Persiste un échantillon d'utilisation par heartbeat portant `usage`
#[derive(Clone)]
pub struct MetricsSampler {
    store: Arc<dyn ResourceStore>,
}

impl MetricsSampler {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Timestamp assigné par le serveur, celui du worker est ignoré
    pub fn sample(provider_id: &str, usage: &ResourceUsage, now: OffsetDateTime) -> MetricSample {
        MetricSample {
            provider_id: provider_id.to_string(),
            cpu_percent: usage.cpu_percent,
            ram_percent: usage.ram_percent,
            gpu_percent: usage.gpu_percent,
            gpu_temp: usage.gpu_temp,
            gpu_mem_used_gb: usage.gpu_mem_used_mb.map(|mb| mb / MB_PER_GB),
            timestamp: now,
        }
    }

    pub async fn record(
        &self,
        provider_id: &str,
        usage: &ResourceUsage,
        now: OffsetDateTime,
    ) -> Result<MetricSample, StoreError> {
        self.store.create_metric_sample(Self::sample(provider_id, usage, now)).await
    }
}
