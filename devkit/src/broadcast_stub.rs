/*!
Broadcaster enregistreur pour tests sans WebSocket

Implémente `qubix_kernel::Broadcaster` en enregistrant chaque appel du tracker.
Peut relayer vers un autre broadcaster (le vrai hub) pour observer les deux côtés.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use qubix_kernel::protocol::{JobProgressDetails, ProviderStatus, StatusEvent};
use qubix_kernel::{Broadcaster, ResourceUsage};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    ProviderStatus { provider_id: String, status: ProviderStatus },
    GpuMetrics { provider_id: String, usage: ResourceUsage },
    JobProgress { job_id: String, progress: f64, details: JobProgressDetails },
}

#[derive(Clone, Default)]
pub struct RecordingBroadcaster {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
    forward: Option<Arc<dyn Broadcaster>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre puis relaie vers `inner`
    pub fn forwarding_to(inner: Arc<dyn Broadcaster>) -> Self {
        Self { events: Arc::default(), forward: Some(inner) }
    }

    fn record(&self, event: RecordedEvent) {
        log::debug!("[stub] recorded {:?}", event);
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Événements de statut d'un provider, dans l'ordre d'émission
    pub fn status_events(&self, provider_id: &str) -> Vec<StatusEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::ProviderStatus { provider_id: id, status } if id == provider_id => Some(status.event),
                _ => None,
            })
            .collect()
    }

    pub fn metrics_count(&self, provider_id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::GpuMetrics { provider_id: id, .. } if id == provider_id))
            .count()
    }

    pub fn job_progress(&self, job_id: &str) -> Vec<(f64, JobProgressDetails)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::JobProgress { job_id: id, progress, details } if id == job_id => {
                    Some((*progress, details.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn provider_status_changed(&self, provider_id: &str, status: ProviderStatus) {
        self.record(RecordedEvent::ProviderStatus { provider_id: provider_id.to_string(), status: status.clone() });
        if let Some(inner) = &self.forward {
            inner.provider_status_changed(provider_id, status).await;
        }
    }

    async fn gpu_metrics_update(&self, provider_id: &str, usage: &ResourceUsage) {
        self.record(RecordedEvent::GpuMetrics { provider_id: provider_id.to_string(), usage: usage.clone() });
        if let Some(inner) = &self.forward {
            inner.gpu_metrics_update(provider_id, usage).await;
        }
    }

    async fn job_progress(&self, job_id: &str, progress: f64, details: JobProgressDetails) {
        self.record(RecordedEvent::JobProgress { job_id: job_id.to_string(), progress, details: details.clone() });
        if let Some(inner) = &self.forward {
            inner.job_progress(job_id, progress, details).await;
        }
    }
}
