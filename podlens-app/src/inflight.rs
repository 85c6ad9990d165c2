use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Targets with a mutation running. A second mutation of the same
/// `(namespace, target)` is refused until the first guard drops.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    targets: Arc<Mutex<HashSet<(String, String)>>>,
}

#[derive(Debug)]
pub struct InFlightGuard {
    targets: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl InFlight {
    pub fn try_acquire(&self, namespace: &str, target: &str) -> Option<InFlightGuard> {
        let key = (namespace.to_string(), target.to_string());
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        if !targets.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            targets: self.targets.clone(),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
