use crate::hub::EventHub;
use crate::liveness::LivenessTracker;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub connected_clients: usize,
    pub active_topics: usize,
    /// None si le store n'a pas répondu
    pub online_providers: Option<usize>,
    pub tracker_running: bool,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn get_health(&self, hub: &EventHub, tracker: &LivenessTracker) -> KernelHealth {
        let hub_stats = hub.stats();
        let online_providers = match tracker.stats().await {
            Ok(stats) => Some(stats.online_providers),
            Err(e) => {
                warn!("[health] provider stats unavailable: {}", e);
                None
            }
        };

        KernelHealth {
            uptime_seconds: self.uptime_seconds(),
            memory_usage_mb: get_memory_usage_mb(),
            connected_clients: hub_stats.total_clients,
            active_topics: hub_stats.total_subscriptions,
            online_providers,
            tracker_running: tracker.is_running(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return (kb as f32) / 1024.0; // KB -> MB
            }
        }
    }

    // inconnu hors Linux
    0.0
}
