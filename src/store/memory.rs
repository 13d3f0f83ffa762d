use super::{BrokerSnapshot, StateStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshot: Mutex<Option<BrokerSnapshot>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: BrokerSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> Option<BrokerSnapshot> {
        self.snapshot.lock().clone()
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }
}

impl StateStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self) -> anyhow::Result<Option<BrokerSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &BrokerSnapshot) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("in-memory store is set to fail");
        }
        *self.snapshot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_store_keeps_previous_snapshot() {
        let store = InMemoryStore::new();
        store
            .save(&BrokerSnapshot {
                counter: 1,
                ..BrokerSnapshot::default()
            })
            .unwrap();

        store.set_failing(true);
        assert!(store
            .save(&BrokerSnapshot {
                counter: 2,
                ..BrokerSnapshot::default()
            })
            .is_err());

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap().unwrap().counter, 1);
    }
}
