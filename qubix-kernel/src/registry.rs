/**
 * CONNECTION REGISTRY - Comptabilité des connexions WebSocket vivantes
 *
 * RÔLE :
 * Sait qui est connecté, à quels topics, et depuis quand il est silencieux.
 * Aucune logique métier : le hub décide, le registre tient les index.
 *
 * INVARIANT :
 * connexion → topics et topic → connexions sont exactement inverses ;
 * un topic sans abonné est supprimé immédiatement.
 *
 * CONCURRENCE :
 * Toutes les opérations sont O(1) sur des HashMap ; le hub garde le registre
 * derrière un seul Mutex (state::Shared) et ne l'utilise jamais à travers un await.
 */

use crate::topic::Topic;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

pub type ConnectionId = String;

/// Ce que la tâche d'écriture d'une connexion reçoit
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close,
}

#[derive(Debug)]
pub struct ConnectionEntry {
    pub sender: mpsc::Sender<Outbound>,
    pub subscriptions: HashSet<Topic>,
    pub last_activity: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicDetail {
    pub topic: Topic,
    pub subscriber_count: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    topics: HashMap<Topic, HashSet<ConnectionId>>,
}

fn next_connection_id() -> ConnectionId {
    format!("client_{}", Uuid::new_v4().simple())
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sender: mpsc::Sender<Outbound>) -> ConnectionId {
        self.register_at(sender, Instant::now())
    }

    pub fn register_at(&mut self, sender: mpsc::Sender<Outbound>, now: Instant) -> ConnectionId {
        let mut id = next_connection_id();
        while self.connections.contains_key(&id) {
            id = next_connection_id();
        }
        self.connections.insert(
            id.clone(),
            ConnectionEntry { sender, subscriptions: HashSet::new(), last_activity: now },
        );
        id
    }

    /// Idempotent. Retourne true si la paire vient d'être ajoutée.
    pub fn subscribe(&mut self, id: &str, topic: Topic) -> bool {
        let Some(entry) = self.connections.get_mut(id) else { return false; };
        if !entry.subscriptions.insert(topic.clone()) {
            return false;
        }
        self.topics.entry(topic).or_default().insert(id.to_string());
        true
    }

    /// Idempotent. Retourne true si la paire existait.
    pub fn unsubscribe(&mut self, id: &str, topic: &Topic) -> bool {
        let Some(entry) = self.connections.get_mut(id) else { return false; };
        if !entry.subscriptions.remove(topic) {
            return false;
        }
        self.detach(id, topic);
        true
    }

    /// Supprime la connexion et toutes ses appartenances
    pub fn remove(&mut self, id: &str) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(id)?;
        for topic in &entry.subscriptions {
            self.detach(id, topic);
        }
        Some(entry)
    }

    fn detach(&mut self, id: &str, topic: &Topic) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(id);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    pub fn touch(&mut self, id: &str) -> bool {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&mut self, id: &str, now: Instant) -> bool {
        match self.connections.get_mut(id) {
            Some(entry) => {
                entry.last_activity = entry.last_activity.max(now);
                true
            }
            None => false,
        }
    }

    /// Topic inconnu = ensemble vide, jamais une erreur
    pub fn subscribers_of(&self, topic: &Topic) -> HashSet<ConnectionId> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Destinataires d'un topic avec leur canal, pour le fan-out hors verrou
    pub fn senders_of(&self, topic: &Topic) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        let Some(ids) = self.topics.get(topic) else { return Vec::new(); };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| (id.clone(), c.sender.clone())))
            .collect()
    }

    pub fn sender(&self, id: &str) -> Option<mpsc::Sender<Outbound>> {
        self.connections.get(id).map(|c| c.sender.clone())
    }

    /// Connexions dont la dernière activité date de plus de `timeout`
    pub fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_activity) > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn topic_details(&self) -> Vec<TopicDetail> {
        let mut details: Vec<TopicDetail> = self
            .topics
            .iter()
            .map(|(topic, ids)| TopicDetail { topic: topic.clone(), subscriber_count: ids.len() })
            .collect();
        details.sort_by(|a, b| a.topic.cmp(&b.topic));
        details
    }

    /// Vide les deux index ; retourne les entrées pour fermeture
    pub fn drain(&mut self) -> Vec<(ConnectionId, ConnectionEntry)> {
        self.topics.clear();
        self.connections.drain().collect()
    }

    /// Vérifie que les deux index sont inverses et sans topic vide
    pub fn is_consistent(&self) -> bool {
        for (topic, ids) in &self.topics {
            if ids.is_empty() {
                return false;
            }
            for id in ids {
                match self.connections.get(id) {
                    Some(c) if c.subscriptions.contains(topic) => {}
                    _ => return false,
                }
            }
        }
        self.connections.iter().all(|(id, c)| {
            c.subscriptions
                .iter()
                .all(|t| self.topics.get(t).is_some_and(|ids| ids.contains(id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> mpsc::Sender<Outbound> {
        mpsc::channel(4).0
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut reg = ConnectionRegistry::new();
        let id = reg.register(channel());

        assert!(reg.subscribe(&id, Topic::marketplace()));
        assert!(!reg.subscribe(&id, Topic::marketplace()));
        assert_eq!(reg.subscribers_of(&Topic::marketplace()).len(), 1);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_unsubscribe_drops_empty_topic() {
        let mut reg = ConnectionRegistry::new();
        let id = reg.register(channel());
        reg.subscribe(&id, Topic::job("J1"));
        assert_eq!(reg.topic_count(), 1);

        assert!(reg.unsubscribe(&id, &Topic::job("J1")));
        assert!(!reg.unsubscribe(&id, &Topic::job("J1")));
        assert_eq!(reg.topic_count(), 0);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_remove_cleans_every_topic() {
        let mut reg = ConnectionRegistry::new();
        let a = reg.register(channel());
        let b = reg.register(channel());
        reg.subscribe(&a, Topic::marketplace());
        reg.subscribe(&a, Topic::provider("p1"));
        reg.subscribe(&b, Topic::marketplace());

        assert!(reg.remove(&a).is_some());
        assert!(reg.remove(&a).is_none());
        assert_eq!(reg.subscribers_of(&Topic::marketplace()), HashSet::from([b.clone()]));
        assert!(reg.subscribers_of(&Topic::provider("p1")).is_empty());
        assert_eq!(reg.topic_count(), 1);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_unknown_connection_and_topic() {
        let mut reg = ConnectionRegistry::new();
        assert!(!reg.subscribe("nobody", Topic::marketplace()));
        assert!(!reg.touch("nobody"));
        assert!(reg.subscribers_of(&Topic::raw("job:none")).is_empty());
        assert_eq!(reg.topic_count(), 0);
    }

    #[test]
    fn test_index_symmetry_under_mixed_operations() {
        let mut reg = ConnectionRegistry::new();
        let ids: Vec<ConnectionId> = (0..6).map(|_| reg.register(channel())).collect();
        let topics = [
            Topic::marketplace(),
            Topic::provider("p1"),
            Topic::provider("p2"),
            Topic::job("J1"),
            Topic::job("J2"),
        ];

        // générateur congruentiel : séquence déterministe mais mélangée
        let mut seed: u64 = 0x5eed;
        let mut next = move |n: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % n
        };

        let mut live = ids.clone();
        for _ in 0..500 {
            if live.is_empty() {
                break;
            }
            let id = live[next(live.len())].clone();
            let topic = topics[next(topics.len())].clone();
            match next(10) {
                0 => {
                    reg.remove(&id);
                    live.retain(|l| l != &id);
                }
                1..=5 => {
                    reg.subscribe(&id, topic);
                }
                _ => {
                    reg.unsubscribe(&id, &topic);
                }
            }
            assert!(reg.is_consistent());
        }

        for id in &ids {
            reg.remove(id);
        }
        assert_eq!(reg.topic_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn test_stale_connections() {
        let mut reg = ConnectionRegistry::new();
        let t0 = Instant::now();
        let idle = reg.register_at(channel(), t0);
        let active = reg.register_at(channel(), t0);
        reg.touch_at(&active, t0 + Duration::from_secs(50));

        let stale = reg.stale_connections(t0 + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(stale, vec![idle]);
    }
}
