/*!
Test Harness pour le kernel Qubix

Assemble un environnement complet en mémoire :
- MemoryStore seedé via les fixtures
- EventHub réel avec des clients simulés (FakeClient)
- LivenessTracker branché sur un RecordingBroadcaster qui relaie vers le hub
- Horloge explicite : heartbeats et sweeps sont datés en secondes depuis T0
*/

use crate::broadcast_stub::RecordingBroadcaster;
use crate::fixtures::at;
use anyhow::Result;
use qubix_kernel::registry::{ConnectionId, Outbound};
use qubix_kernel::{
    EventHub, HeartbeatRequest, HeartbeatResponse, HubConfig, Job, LivenessConfig, LivenessTracker, MemoryStore,
    Provider, SweepReport,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Client WebSocket simulé : écrit dans le hub, lit son canal sortant
pub struct FakeClient {
    pub id: ConnectionId,
    hub: EventHub,
    outbound: mpsc::Receiver<Outbound>,
    closed: bool,
}

impl FakeClient {
    pub async fn send(&self, text: &str) {
        self.hub.handle_message(&self.id, text).await;
    }

    pub async fn subscribe_marketplace(&mut self) {
        self.send(r#"{"type":"subscribe:marketplace"}"#).await;
        self.frames();
    }

    pub async fn subscribe_provider(&mut self, provider_id: &str) {
        self.send(&format!(r#"{{"type":"subscribe:provider","subscriptionId":"{}"}}"#, provider_id))
            .await;
        self.frames();
    }

    pub async fn subscribe_job(&mut self, job_id: &str) {
        self.send(&format!(r#"{{"type":"subscribe:job","subscriptionId":"{}"}}"#, job_id))
            .await;
        self.frames();
    }

    /// Vide le canal et retourne les trames JSON reçues
    pub fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(out) = self.outbound.try_recv() {
            match out {
                Outbound::Frame(text) => match serde_json::from_str(&text) {
                    Ok(v) => frames.push(v),
                    Err(e) => log::warn!("[harness] unparsable frame {}: {}", text, e),
                },
                Outbound::Close => self.closed = true,
            }
        }
        frames
    }

    /// Trames d'un type donné (ex: `PROVIDER_STATUS_CHANGED`)
    pub fn frames_of(&mut self, kind: &str) -> Vec<Value> {
        self.frames().into_iter().filter(|f| f["type"] == kind).collect()
    }

    pub fn was_closed(&self) -> bool {
        self.closed
    }

    pub fn disconnect(self) {
        self.hub.close_connection(&self.id);
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub hub: EventHub,
    pub tracker: LivenessTracker,
    pub recorder: RecordingBroadcaster,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(LivenessConfig::default())
    }

    pub fn with_config(config: LivenessConfig) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let store = Arc::new(MemoryStore::new());
        let hub = EventHub::new(HubConfig::default());
        let recorder = RecordingBroadcaster::forwarding_to(Arc::new(hub.clone()));
        let tracker = LivenessTracker::new(store.clone(), Arc::new(recorder.clone()), config);
        Self { store, hub, tracker, recorder }
    }

    pub fn with_provider(self, provider: Provider) -> Self {
        self.store.insert_provider(provider);
        self
    }

    pub fn with_job(self, job: Job) -> Self {
        self.store.insert_job(job);
        self
    }

    /// Nouveau client connecté, message de bienvenue consommé
    pub fn connect(&self) -> FakeClient {
        let (id, outbound) = self.hub.open_connection();
        let mut client = FakeClient { id, hub: self.hub.clone(), outbound, closed: false };
        client.frames();
        client
    }

    pub async fn heartbeat_at(&self, secs: i64, request: HeartbeatRequest) -> HeartbeatResponse {
        log::info!("[harness] t={}s heartbeat {}", secs, request.worker_id);
        self.tracker.process_heartbeat_at(request, at(secs)).await
    }

    pub async fn sweep_at(&self, secs: i64) -> SweepReport {
        let report = self.tracker.check_for_timeouts_at(at(secs)).await;
        log::info!("[harness] t={}s sweep {:?}", secs, report);
        report
    }

    pub fn provider(&self, worker_id: &str) -> Result<Provider> {
        self.store
            .provider(worker_id)
            .ok_or_else(|| anyhow::anyhow!("Provider not in store: {}", worker_id))
    }

    pub fn job(&self, job_id: &str) -> Result<Job> {
        self.store
            .job(job_id)
            .ok_or_else(|| anyhow::anyhow!("Job not in store: {}", job_id))
    }

    /// Assert qu'un champ (chemin pointé) a une valeur donnée
    pub fn assert_field_equals(frame: &Value, field_path: &str, expected: &Value) -> Result<()> {
        match get_nested_field(frame, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => anyhow::bail!("Field '{}' not found in {}", field_path, frame),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}
