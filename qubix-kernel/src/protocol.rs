/**
 * PROTOCOLE WEBSOCKET - Trames JSON échangées entre clients et hub
 *
 * Client → Serveur : {"type": "...", "data"?: ..., "subscriptionId"?: "..."}
 *   subscribe:marketplace | subscribe:provider | subscribe:job | unsubscribe | ping
 *
 * Serveur → Client : {"type": "...", "data"?: {...}}
 *   connected | subscribed | unsubscribed | pong | error | événements typés
 *
 * Une trame invalide ne ferme jamais la connexion : elle produit une trame `error`.
 */

use crate::models::JobStatus;
use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Enveloppe brute reçue d'un client
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, rename = "subscriptionId")]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SubscribeMarketplace,
    SubscribeProvider(String),
    SubscribeJob(String),
    /// Clé de topic complète (ex: `job:J123`)
    Unsubscribe(String),
    Ping,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidJson,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Missing subscriptionId for {0}")]
    MissingSubscriptionId(String),
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    let subscription = |kind: &str| {
        envelope
            .subscription_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::MissingSubscriptionId(kind.to_string()))
    };

    match envelope.kind.as_str() {
        "subscribe:marketplace" => Ok(ClientMessage::SubscribeMarketplace),
        "subscribe:provider" => Ok(ClientMessage::SubscribeProvider(subscription("subscribe:provider")?)),
        "subscribe:job" => Ok(ClientMessage::SubscribeJob(subscription("subscribe:job")?)),
        "unsubscribe" => Ok(ClientMessage::Unsubscribe(subscription("unsubscribe")?)),
        "ping" => Ok(ClientMessage::Ping),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// Types de trames émises par le serveur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "subscribed")]
    Subscribed,
    #[serde(rename = "unsubscribed")]
    Unsubscribed,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "PROVIDER_REGISTERED")]
    ProviderRegistered,
    #[serde(rename = "PROVIDER_STATUS_CHANGED")]
    ProviderStatusChanged,
    #[serde(rename = "GPU_METRICS_UPDATE")]
    GpuMetricsUpdate,
    #[serde(rename = "JOB_PROGRESS")]
    JobProgress,
    #[serde(rename = "JOB_COMPLETED")]
    JobCompleted,
    #[serde(rename = "JOB_LOGS")]
    JobLogs,
    #[serde(rename = "MARKETPLACE_UPDATE")]
    MarketplaceUpdate,
    #[serde(rename = "EARNINGS_UPDATE")]
    EarningsUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerMessage {
    pub fn event(kind: EventKind, data: Value) -> Self {
        Self { kind, data: Some(data) }
    }

    pub fn connected(client_id: &str) -> Self {
        Self::event(EventKind::Connected, json!({ "clientId": client_id, "timestamp": now_iso() }))
    }

    pub fn subscribed(topic: &Topic) -> Self {
        Self::event(EventKind::Subscribed, json!({ "subscription": topic }))
    }

    pub fn unsubscribed(topic: &Topic) -> Self {
        Self::event(EventKind::Unsubscribed, json!({ "subscription": topic }))
    }

    pub fn pong() -> Self {
        Self { kind: EventKind::Pong, data: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::event(EventKind::Error, json!({ "message": message.into() }))
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn now_iso() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Raison d'un changement d'état provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusEvent {
    ProviderOnline,
    ProviderOffline,
    ProviderTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub is_online: bool,
    pub is_available: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_heartbeat: Option<OffsetDateTime>,
    pub event: StatusEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Champs optionnels d'un JOB_PROGRESS
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_so_far: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
