/**
 * QUBIX KERNEL - Vivacité des providers et distribution temps réel
 *
 * RÔLE : Suivi online/offline des workers GPU par heartbeats, réassignation
 * des jobs orphelins, et pub/sub WebSocket par topic pour les dashboards.
 *
 * MODULES : models, store (contrat + mémoire), registry/hub/protocol (temps réel),
 * liveness/metrics (heartbeats), http/ws/health/config (surface process).
 */

pub mod config;
pub mod health;
pub mod http;
pub mod hub;
pub mod liveness;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod store;
pub mod topic;
pub mod ws;

pub use hub::{Broadcaster, EventHub, HubConfig, HubStats};
pub use liveness::{LivenessConfig, LivenessError, LivenessStats, LivenessTracker, SweepReport};
pub use models::{HeartbeatRequest, HeartbeatResponse, Job, JobStatus, Provider, ResourceUsage, WorkerStatus};
pub use store::{MemoryStore, ResourceStore, StoreError};
pub use topic::Topic;
