/**
 * MODELS - Tranche des entités marketplace manipulée par le kernel
 *
 * RÔLE : Provider, Job, échantillons de métriques et messages heartbeat.
 * Le kernel ne possède pas ces enregistrements (c'est le Resource Store),
 * il ne lit/écrit que les champs liés à la vivacité.
 *
 * FORMAT : JSON camelCase sur le fil, timestamps RFC3339.
 */

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type ProviderId = String;
pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: ProviderId,
    pub worker_id: String,          // identité présentée par le worker
    pub is_online: bool,
    pub is_available: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_heartbeat: Option<OffsetDateTime>,
    pub current_job_id: Option<JobId>,
}

/// État conceptuel dérivé des flags persistés
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderState {
    OnlineAvailable,
    OnlineBusy,
    Offline,
}

impl Provider {
    pub fn state(&self) -> ProviderState {
        match (self.is_online, self.is_available) {
            (false, _) => ProviderState::Offline,
            (true, true) => ProviderState::OnlineAvailable,
            (true, false) => ProviderState::OnlineBusy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Job encore rattaché à un provider vivant
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Assigned)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Assigned => "ASSIGNED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub provider_id: Option<ProviderId>,
    pub progress: f64,              // 0..100
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
    Busy,
}

/// Snapshot d'utilisation envoyé par le worker avec son heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_used_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_total_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_used_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_total_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    #[serde(default)]
    pub current_job: Option<JobId>,
    #[serde(default)]
    pub usage: Option<ResourceUsage>,
}

impl HeartbeatRequest {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: None,
            current_job: None,
            usage: None,
        }
    }

    /// Job courant, une chaîne vide compte comme absente
    pub fn current_job(&self) -> Option<&str> {
        self.current_job.as_deref().filter(|j| !j.is_empty())
    }

    pub fn is_online(&self) -> bool {
        self.status != Some(WorkerStatus::Offline)
    }

    pub fn is_busy(&self) -> bool {
        self.status == Some(WorkerStatus::Busy) || self.current_job().is_some()
    }

    pub fn is_available(&self) -> bool {
        self.is_online() && !self.is_busy()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
    pub pending_jobs: Vec<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HeartbeatResponse {
    pub fn ok(pending_jobs: Vec<Job>) -> Self {
        Self { success: true, pending_jobs, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, pending_jobs: Vec::new(), error: Some(error.into()) }
    }
}

/// Ligne append-only créée à chaque heartbeat portant `usage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub provider_id: ProviderId,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub gpu_percent: Option<f64>,
    pub gpu_temp: Option<f64>,
    pub gpu_mem_used_gb: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
