/**
 * RESOURCE STORE - Contrat de persistance consommé par le kernel
 *
 * RÔLE :
 * Le kernel ne possède ni les providers ni les jobs : il passe par ce trait
 * pour lire/écrire la tranche "vivacité" des enregistrements.
 *
 * FONCTIONNEMENT :
 * - ResourceStore trait = interface commune (lookup, update conditionnel, requêtes)
 * - ProviderPatch / JobPatch = champs à écrire, None = champ inchangé
 * - ProviderCondition / JobCondition = garde évaluée atomiquement avec l'écriture
 * - Les updates retournent l'état avant/après pour détecter les transitions
 *   sans relire (pas de read-then-write entre heartbeat et sweep)
 *
 * IMPLÉMENTATIONS :
 * - memory::MemoryStore : en process, un seul verrou pour toutes les mutations
 */

pub mod memory;

use crate::models::{Job, JobId, JobStatus, MetricSample, Provider, ProviderId};
use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

pub use memory::MemoryStore;

/// Erreurs possibles lors des opérations sur le store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Filtre sur les providers ; chaque champ None est ignoré
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderQuery {
    pub is_online: Option<bool>,
    /// lastHeartbeat strictement antérieur
    pub heartbeat_before: Option<OffsetDateTime>,
    /// lastHeartbeat postérieur ou égal
    pub heartbeat_since: Option<OffsetDateTime>,
}

impl ProviderQuery {
    pub fn matches(&self, provider: &Provider) -> bool {
        if let Some(online) = self.is_online {
            if provider.is_online != online {
                return false;
            }
        }
        if let Some(before) = self.heartbeat_before {
            match provider.last_heartbeat {
                Some(hb) if hb < before => {}
                _ => return false,
            }
        }
        if let Some(since) = self.heartbeat_since {
            match provider.last_heartbeat {
                Some(hb) if hb >= since => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderPatch {
    pub is_online: Option<bool>,
    pub is_available: Option<bool>,
    /// Jamais appliqué en arrière : lastHeartbeat reste monotone
    pub last_heartbeat: Option<OffsetDateTime>,
    /// Some(None) efface le job courant
    pub current_job_id: Option<Option<JobId>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProviderCondition {
    Always,
    /// Garde du sweep : encore online et silencieux depuis `cutoff`
    StaleSince(OffsetDateTime),
}

impl ProviderCondition {
    pub fn holds(&self, provider: &Provider) -> bool {
        match self {
            ProviderCondition::Always => true,
            ProviderCondition::StaleSince(cutoff) => {
                provider.is_online && provider.last_heartbeat.is_some_and(|hb| hb < *cutoff)
            }
        }
    }
}

/// Résultat d'un update : l'enregistrement avant et après écriture
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTransition {
    pub previous: Provider,
    pub current: Provider,
}

impl ProviderTransition {
    pub fn came_online(&self) -> bool {
        !self.previous.is_online && self.current.is_online
    }

    pub fn went_offline(&self) -> bool {
        self.previous.is_online && !self.current.is_online
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub provider_id: Option<Option<ProviderId>>,
    pub error: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobCondition {
    Always,
    /// N'écrit que si le job est encore RUNNING ou ASSIGNED
    Active,
}

impl JobCondition {
    pub fn holds(&self, job: &Job) -> bool {
        match self {
            JobCondition::Always => true,
            JobCondition::Active => job.status.is_active(),
        }
    }
}

/// Interface commune de persistance attendue par le kernel
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn find_provider_by_worker_id(&self, worker_id: &str) -> Result<Option<Provider>, StoreError>;

    /// Update atomique par workerId.
    /// Ok(None) si la condition ne tient plus, Err(NotFound) si le provider n'existe pas.
    async fn update_provider(
        &self,
        worker_id: &str,
        patch: ProviderPatch,
        condition: ProviderCondition,
    ) -> Result<Option<ProviderTransition>, StoreError>;

    async fn list_providers(&self, query: &ProviderQuery) -> Result<Vec<Provider>, StoreError>;

    async fn count_providers(&self, query: &ProviderQuery) -> Result<usize, StoreError>;

    async fn create_metric_sample(&self, sample: MetricSample) -> Result<MetricSample, StoreError>;

    /// Jobs du provider dans l'un des statuts, plus anciens d'abord
    async fn find_jobs_by_provider_and_status(
        &self,
        provider_id: &str,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    async fn find_job_by_id(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Ok(None) si la condition ne tient plus au moment de l'écriture
    async fn update_job(
        &self,
        job_id: &str,
        patch: JobPatch,
        condition: JobCondition,
    ) -> Result<Option<Job>, StoreError>;
}
