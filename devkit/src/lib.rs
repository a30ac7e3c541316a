/*!
# Qubix DevKit - Stubs et Utilitaires pour tester le kernel

Bibliothèque facilitant les tests du kernel Qubix avec:
- Broadcaster enregistreur (avec relais optionnel vers le hub réel)
- Builders de providers, jobs, heartbeats et usage
- Harness complet : store mémoire, hub, tracker, clients WebSocket simulés
*/

pub mod broadcast_stub;
pub mod fixtures;
pub mod test_utils;

#[cfg(test)]
mod scenarios;

pub use broadcast_stub::{RecordedEvent, RecordingBroadcaster};
pub use fixtures::{HeartbeatBuilder, ProviderBuilder};
pub use test_utils::{FakeClient, TestHarness};
