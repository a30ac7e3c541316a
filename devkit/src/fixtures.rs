/*!
Builders de données de test : providers, jobs, heartbeats, usage

Toutes les horloges de test partent de `T0` ; `at(secs)` donne T0 + secs.
*/

use qubix_kernel::{HeartbeatRequest, Job, JobStatus, Provider, ResourceUsage, WorkerStatus};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

pub const T0: OffsetDateTime = datetime!(2025-06-01 12:00:00 UTC);

pub fn at(secs: i64) -> OffsetDateTime {
    T0 + Duration::seconds(secs)
}

/// Provider dont l'id est égal au workerId par défaut (topics lisibles en test)
pub struct ProviderBuilder {
    provider: Provider,
}

impl ProviderBuilder {
    pub fn new(worker_id: &str) -> Self {
        Self {
            provider: Provider {
                id: worker_id.to_string(),
                worker_id: worker_id.to_string(),
                is_online: false,
                is_available: false,
                last_heartbeat: None,
                current_job_id: None,
            },
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.provider.id = id.to_string();
        self
    }

    pub fn online_since(mut self, heartbeat: OffsetDateTime) -> Self {
        self.provider.is_online = true;
        self.provider.is_available = true;
        self.provider.last_heartbeat = Some(heartbeat);
        self
    }

    pub fn running(mut self, job_id: &str) -> Self {
        self.provider.is_available = false;
        self.provider.current_job_id = Some(job_id.to_string());
        self
    }

    pub fn build(self) -> Provider {
        self.provider
    }
}

pub fn job(id: &str, provider_id: Option<&str>, status: JobStatus) -> Job {
    Job {
        id: id.to_string(),
        status,
        provider_id: provider_id.map(str::to_string),
        progress: 0.0,
        error: None,
        created_at: T0,
    }
}

pub struct HeartbeatBuilder {
    request: HeartbeatRequest,
}

impl HeartbeatBuilder {
    pub fn new(worker_id: &str) -> Self {
        Self { request: HeartbeatRequest::new(worker_id) }
    }

    pub fn status(mut self, status: WorkerStatus) -> Self {
        self.request.status = Some(status);
        self
    }

    pub fn current_job(mut self, job_id: &str) -> Self {
        self.request.current_job = Some(job_id.to_string());
        self
    }

    pub fn usage(mut self, usage: ResourceUsage) -> Self {
        self.request.usage = Some(usage);
        self
    }

    pub fn build(self) -> HeartbeatRequest {
        self.request
    }
}

pub fn usage(cpu: f64, ram: f64) -> ResourceUsage {
    ResourceUsage { cpu_percent: cpu, ram_percent: ram, ..Default::default() }
}

pub fn gpu_usage(gpu: f64, temp: f64, mem_used_mb: f64) -> ResourceUsage {
    ResourceUsage {
        gpu_percent: Some(gpu),
        gpu_temp: Some(temp),
        gpu_mem_used_mb: Some(mem_used_mb),
        ..usage(10.0, 20.0)
    }
}
