use crate::hub::HubConfig;
use crate::liveness::LivenessConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// Plafond des périodes configurables (une semaine)
const MAX_PERIOD_SECS: u64 = 7 * 24 * 3600;
const MAX_MISSED_HEARTBEATS: u32 = 1_000;

fn period_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(1, MAX_PERIOD_SECS))
}

fn period_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(1, MAX_PERIOD_SECS * 1_000))
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub liveness: LivenessConf,
    pub hub: HubConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String, // ex: "0.0.0.0:8080"
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LivenessConf {
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats_threshold: u32,
    pub check_interval_secs: u64,
    pub pending_jobs_limit: usize,
    pub store_timeout_ms: u64,
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            missed_heartbeats_threshold: 3,
            check_interval_secs: 30,
            pending_jobs_limit: 5,
            store_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HubConf {
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub send_timeout_ms: u64,
    pub outbound_buffer: usize,
}

impl Default for HubConf {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            idle_timeout_secs: 60,
            send_timeout_ms: 2000,
            outbound_buffer: 64,
        }
    }
}

impl KernelConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.http
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.http.bind))
    }

    /// Fenêtre au-delà de laquelle un provider silencieux passe offline
    pub fn timeout_window(&self) -> Duration {
        self.liveness_config().timeout_window()
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        let l = &self.liveness;
        LivenessConfig {
            heartbeat_interval: period_secs(l.heartbeat_interval_secs),
            missed_heartbeats_threshold: l.missed_heartbeats_threshold.clamp(1, MAX_MISSED_HEARTBEATS),
            check_interval: period_secs(l.check_interval_secs),
            pending_jobs_limit: l.pending_jobs_limit,
            store_timeout: period_ms(l.store_timeout_ms),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        let h = &self.hub;
        HubConfig {
            sweep_interval: period_secs(h.sweep_interval_secs),
            idle_timeout: Duration::from_secs(h.idle_timeout_secs.min(MAX_PERIOD_SECS)),
            send_timeout: period_ms(h.send_timeout_ms),
            outbound_buffer: h.outbound_buffer.max(1),
        }
    }

    /// Surcharges d'environnement ; une valeur illisible est ignorée
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("QUBIX_BIND") {
            self.http.bind = bind;
        }
        if let Some(v) = lookup("QUBIX_HEARTBEAT_INTERVAL_SECS") {
            match v.parse() {
                Ok(secs) => self.liveness.heartbeat_interval_secs = secs,
                Err(_) => warn!("[config] QUBIX_HEARTBEAT_INTERVAL_SECS invalide: {}", v),
            }
        }
        if let Some(v) = lookup("QUBIX_MISSED_HEARTBEATS") {
            match v.parse() {
                Ok(n) => self.liveness.missed_heartbeats_threshold = n,
                Err(_) => warn!("[config] QUBIX_MISSED_HEARTBEATS invalide: {}", v),
            }
        }
    }
}

/// Lecture stricte d'un fichier YAML ; fichier absent ou vide = défauts
pub async fn load_from(path: impl AsRef<Path>) -> anyhow::Result<KernelConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).with_context(|| format!("parsing {}", path.display()))
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("QUBIX_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        info!("[config] pas de {}, usage config par défaut", path);
    }
    let mut cfg = load_from(&path).await.unwrap_or_else(|e| {
        warn!("[config] config invalide: {:#}", e);
        KernelConfig::default()
    });
    cfg.apply_overrides(|key| std::env::var(key).ok());
    cfg
}
