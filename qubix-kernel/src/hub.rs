/**
 * EVENT HUB - Distribution des événements temps réel par topic
 *
 * RÔLE :
 * Couche pub/sub entre le kernel et les dashboards connectés en WebSocket.
 * API publique de broadcast utilisée par le tracker de vivacité et par le
 * code d'exécution des jobs.
 *
 * FONCTIONNEMENT :
 * - Chaque connexion = un canal mpsc borné vers sa tâche d'écriture (ws.rs)
 * - Abonnements tenus par le ConnectionRegistry derrière un Mutex
 * - broadcast() : snapshot des destinataires sous verrou, puis envois
 *   concurrents hors verrou, chacun borné par `send_timeout`
 * - Sweep périodique : ferme les connexions silencieuses depuis `idle_timeout`
 *
 * ERREURS :
 * Un envoi raté est loggé et isolé, jamais remonté à l'appelant de broadcast.
 * Une trame client invalide produit une trame `error`, la connexion reste ouverte.
 */

use crate::models::{JobStatus, ResourceUsage};
use crate::protocol::{
    now_iso, parse_client_message, ClientMessage, EventKind, JobProgressDetails, ProviderStatus, ServerMessage,
};
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound};
use crate::state::{new_state, Shared, TaskSlot};
use crate::topic::Topic;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(2),
            outbound_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetail {
    pub subscription_id: String,
    pub subscriber_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_clients: usize,
    pub total_subscriptions: usize,
    pub subscription_details: Vec<SubscriptionDetail>,
}

/// Opérations de broadcast dont le tracker de vivacité a besoin
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn provider_status_changed(&self, provider_id: &str, status: ProviderStatus);
    async fn gpu_metrics_update(&self, provider_id: &str, usage: &ResourceUsage);
    async fn job_progress(&self, job_id: &str, progress: f64, details: JobProgressDetails);
}

#[derive(Debug, Clone)]
pub struct EventHub {
    registry: Shared<ConnectionRegistry>,
    config: HubConfig,
    sweeper: TaskSlot,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: new_state(ConnectionRegistry::new()),
            config,
            sweeper: TaskSlot::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Enregistre une nouvelle connexion et met le message de bienvenue en file.
    /// Le receiver retourné alimente la tâche d'écriture de la connexion.
    pub fn open_connection(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let id = self.registry.lock().register(tx.clone());

        match ServerMessage::connected(&id).to_frame() {
            Ok(frame) => {
                if let Err(e) = tx.try_send(Outbound::Frame(frame)) {
                    warn!("[hub] failed to queue welcome for {}: {}", id, e);
                }
            }
            Err(e) => error!("[hub] failed to encode welcome for {}: {}", id, e),
        }

        info!("[hub] new connection {}", id);
        (id, rx)
    }

    /// Fermeture transport (close ou erreur) : nettoyage inconditionnel
    pub fn close_connection(&self, id: &str) {
        if self.registry.lock().remove(id).is_some() {
            info!("[hub] connection closed {}", id);
        }
    }

    /// Traite une trame texte reçue d'un client
    pub async fn handle_message(&self, id: &str, text: &str) {
        if !self.registry.lock().touch(id) {
            warn!("[hub] message from unknown connection {}", id);
            return;
        }

        let reply = match parse_client_message(text) {
            Ok(ClientMessage::SubscribeMarketplace) => self.subscribe(id, Topic::marketplace()),
            Ok(ClientMessage::SubscribeProvider(provider_id)) => self.subscribe(id, Topic::provider(&provider_id)),
            Ok(ClientMessage::SubscribeJob(job_id)) => self.subscribe(id, Topic::job(&job_id)),
            Ok(ClientMessage::Unsubscribe(key)) => self.unsubscribe(id, Topic::raw(key)),
            Ok(ClientMessage::Ping) => ServerMessage::pong(),
            Err(e) => {
                debug!("[hub] rejected message from {}: {}", id, e);
                ServerMessage::error(e.to_string())
            }
        };

        self.send_to(id, &reply).await;
    }

    /// Activité sans trame applicative (ping transport)
    pub fn touch(&self, id: &str) {
        self.registry.lock().touch(id);
    }

    fn subscribe(&self, id: &str, topic: Topic) -> ServerMessage {
        if self.registry.lock().subscribe(id, topic.clone()) {
            debug!("[hub] {} subscribed to {}", id, topic);
        }
        ServerMessage::subscribed(&topic)
    }

    fn unsubscribe(&self, id: &str, topic: Topic) -> ServerMessage {
        if self.registry.lock().unsubscribe(id, &topic) {
            debug!("[hub] {} unsubscribed from {}", id, topic);
        }
        ServerMessage::unsubscribed(&topic)
    }

    /// Envoi direct à une connexion (réponses protocolaires)
    pub async fn send_to(&self, id: &str, message: &ServerMessage) -> bool {
        let Some(sender) = self.registry.lock().sender(id) else { return false; };
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("[hub] failed to encode {:?} for {}: {}", message.kind, id, e);
                return false;
            }
        };
        self.deliver(id.to_string(), sender, frame).await
    }

    async fn deliver(&self, id: ConnectionId, sender: mpsc::Sender<Outbound>, frame: String) -> bool {
        match sender.send_timeout(Outbound::Frame(frame), self.config.send_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("[hub] send to {} timed out after {:?}", id, self.config.send_timeout);
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                // tâche d'écriture terminée : la connexion est morte
                warn!("[hub] send to {} failed: connection gone", id);
                self.close_connection(&id);
                false
            }
        }
    }

    /// Fan-out vers tous les abonnés du topic ; retourne le nombre de livraisons.
    /// Topic sans abonné = no-op silencieux.
    pub async fn broadcast(&self, topic: &Topic, message: &ServerMessage) -> usize {
        let recipients = self.registry.lock().senders_of(topic);
        if recipients.is_empty() {
            return 0;
        }

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("[hub] failed to encode {:?} for {}: {}", message.kind, topic, e);
                return 0;
            }
        };

        let sends = recipients
            .into_iter()
            .map(|(id, sender)| self.deliver(id, sender, frame.clone()));
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();

        debug!("[hub] {:?} → {} ({} delivered)", message.kind, topic, delivered);
        delivered
    }

    pub async fn broadcast_provider_registered<T: Serialize>(&self, provider: &T) {
        match serde_json::to_value(provider) {
            Ok(data) => {
                let msg = ServerMessage::event(EventKind::ProviderRegistered, data);
                self.broadcast(&Topic::marketplace(), &msg).await;
            }
            Err(e) => error!("[hub] failed to encode registered provider: {}", e),
        }
    }

    /// Publié sur `marketplace` et sur `provider:<id>`
    pub async fn broadcast_provider_status_changed(&self, provider_id: &str, status: &ProviderStatus) {
        let msg = ServerMessage::event(
            EventKind::ProviderStatusChanged,
            json!({ "providerId": provider_id, "status": status }),
        );
        self.broadcast(&Topic::marketplace(), &msg).await;
        self.broadcast(&Topic::provider(provider_id), &msg).await;
    }

    pub async fn broadcast_gpu_metrics_update(&self, provider_id: &str, usage: &ResourceUsage) {
        let msg = ServerMessage::event(
            EventKind::GpuMetricsUpdate,
            json!({ "providerId": provider_id, "metrics": usage, "timestamp": now_iso() }),
        );
        self.broadcast(&Topic::provider(provider_id), &msg).await;
    }

    pub async fn broadcast_job_progress(&self, job_id: &str, progress: f64, details: &JobProgressDetails) {
        let mut data = json!({ "jobId": job_id, "progress": progress, "timestamp": now_iso() });
        merge_into(&mut data, details);
        let msg = ServerMessage::event(EventKind::JobProgress, data);
        self.broadcast(&Topic::job(job_id), &msg).await;
    }

    pub async fn broadcast_job_completed(&self, job_id: &str, status: JobStatus, result: Value) {
        if !status.is_terminal() {
            warn!("[hub] JOB_COMPLETED for {} with non-terminal status {}", job_id, status.as_str());
        }
        let msg = ServerMessage::event(
            EventKind::JobCompleted,
            json!({ "jobId": job_id, "status": status, "result": result, "timestamp": now_iso() }),
        );
        self.broadcast(&Topic::job(job_id), &msg).await;
    }

    pub async fn broadcast_job_logs(&self, job_id: &str, logs: Vec<Value>) {
        let msg = ServerMessage::event(
            EventKind::JobLogs,
            json!({ "jobId": job_id, "logs": logs, "timestamp": now_iso() }),
        );
        self.broadcast(&Topic::job(job_id), &msg).await;
    }

    pub async fn broadcast_marketplace_update(&self, update: Value) {
        let msg = ServerMessage::event(EventKind::MarketplaceUpdate, update);
        self.broadcast(&Topic::marketplace(), &msg).await;
    }

    /// Les champs de `earnings` sont aplatis dans la trame
    pub async fn broadcast_earnings_update(&self, provider_id: &str, earnings: Value) {
        let mut data = json!({ "providerId": provider_id });
        merge_into(&mut data, &earnings);
        if let Value::Object(map) = &mut data {
            map.insert("timestamp".into(), Value::String(now_iso()));
        }
        let msg = ServerMessage::event(EventKind::EarningsUpdate, data);
        self.broadcast(&Topic::provider(provider_id), &msg).await;
    }

    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(Instant::now())
    }

    /// Ferme et retire les connexions inactives depuis plus de `idle_timeout`
    pub fn evict_stale_at(&self, now: Instant) -> usize {
        let evicted = {
            let mut registry = self.registry.lock();
            let stale = registry.stale_connections(now, self.config.idle_timeout);
            stale
                .into_iter()
                .filter_map(|id| registry.remove(&id).map(|entry| (id, entry)))
                .collect::<Vec<_>>()
        };

        for (id, entry) in &evicted {
            info!("[hub] connection {} timed out, closing", id);
            // file pleine : le drop du sender ferme la tâche d'écriture quand même
            let _ = entry.sender.try_send(Outbound::Close);
        }
        evicted.len()
    }

    /// Démarre le sweep d'éviction ; sans effet s'il tourne déjà
    pub fn start_eviction_sweep(&self) {
        let hub = self.clone();
        let period = self.config.sweep_interval;
        let started = self.sweeper.install(move || {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let evicted = hub.evict_stale();
                    if evicted > 0 {
                        info!("[hub] evicted {} stale connections", evicted);
                    }
                }
            })
        });
        if started {
            info!(
                "[hub] eviction sweep started (every {:?}, idle timeout {:?})",
                period, self.config.idle_timeout
            );
        }
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry.lock();
        HubStats {
            total_clients: registry.connection_count(),
            total_subscriptions: registry.topic_count(),
            subscription_details: registry
                .topic_details()
                .into_iter()
                .map(|d| SubscriptionDetail {
                    subscription_id: d.topic.to_string(),
                    subscriber_count: d.subscriber_count,
                })
                .collect(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connection_count()
    }

    pub fn subscribers_of(&self, topic: &Topic) -> usize {
        self.registry.lock().subscribers_of(topic).len()
    }

    /// Stoppe le sweep, ferme toutes les connexions, vide les index
    pub fn shutdown(&self) {
        self.sweeper.abort();
        let drained = self.registry.lock().drain();
        for (_, entry) in &drained {
            let _ = entry.sender.try_send(Outbound::Close);
        }
        info!("[hub] shutdown, closed {} connections", drained.len());
    }
}

fn merge_into<T: Serialize>(target: &mut Value, extra: &T) {
    let (Value::Object(map), Ok(Value::Object(fields))) = (target, serde_json::to_value(extra)) else {
        return;
    };
    for (key, value) in fields {
        map.entry(key).or_insert(value);
    }
}

#[async_trait]
impl Broadcaster for EventHub {
    async fn provider_status_changed(&self, provider_id: &str, status: ProviderStatus) {
        self.broadcast_provider_status_changed(provider_id, &status).await;
    }

    async fn gpu_metrics_update(&self, provider_id: &str, usage: &ResourceUsage) {
        self.broadcast_gpu_metrics_update(provider_id, usage).await;
    }

    async fn job_progress(&self, job_id: &str, progress: f64, details: JobProgressDetails) {
        self.broadcast_job_progress(job_id, progress, &details).await;
    }
}
