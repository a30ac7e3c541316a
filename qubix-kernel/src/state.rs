use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Emplacement d'une tâche de fond (sweep) annulable au shutdown
#[derive(Debug, Clone, Default)]
pub struct TaskSlot {
    handle: Shared<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installe la tâche si l'emplacement est libre ; false si déjà occupé
    pub fn install(&self, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        *slot = Some(spawn());
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Annule la tâche ; idempotent
    pub fn abort(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}
