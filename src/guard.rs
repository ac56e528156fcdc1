use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::models::LessonKey;

type InFlightMap = Arc<Mutex<HashMap<LessonKey, watch::Sender<()>>>>;

/// Per-lesson single-flight table.
///
/// At most one generation or video change runs per [`LessonKey`]. Keys are
/// independent: acquiring one lesson never waits on another.
#[derive(Clone, Default)]
pub struct GenerationGuard {
    in_flight: InFlightMap,
}

/// Outcome of [`GenerationGuard::try_acquire`].
pub enum Acquire {
    Acquired(GuardPermit),
    InFlight(InFlightWaiter),
}

impl GenerationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` if nobody holds it. Otherwise hand back a waiter for the current holder.
    pub fn try_acquire(&self, key: &LessonKey) -> Acquire {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = map.get(key) {
            return Acquire::InFlight(InFlightWaiter {
                rx: sender.subscribe(),
            });
        }
        let (tx, _rx) = watch::channel(());
        map.insert(key.clone(), tx);
        Acquire::Acquired(GuardPermit {
            in_flight: self.in_flight.clone(),
            key: key.clone(),
        })
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, key: &LessonKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// RAII permit. Dropping it releases the key and wakes every waiter,
/// whether the holder finished, failed, panicked, or was cancelled.
pub struct GuardPermit {
    in_flight: InFlightMap,
    key: LessonKey,
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        // Dropping the sender closes every subscribed receiver.
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct InFlightWaiter {
    rx: watch::Receiver<()>,
}

impl InFlightWaiter {
    /// Resolves once the current holder releases the key.
    pub async fn finished(mut self) {
        while self.rx.changed().await.is_ok() {}
    }
}
