//! Availability bookkeeping for the model-backed signals.
//!
//! When the embedder or the entity extractor fails, the matching signal
//! (vector or graph) is marked degraded engine-wide: queries give it zero
//! weight and sync records its store writes as failed without calling the
//! capability. After `cooldown` one probe call is let through; a success
//! from any caller clears the degradation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::models::StoreKind;

#[derive(Debug, Clone)]
struct Outage {
    reason: String,
    last_attempt: Instant,
}

#[derive(Debug)]
pub struct SignalHealth {
    cooldown: Duration,
    outages: Mutex<HashMap<StoreKind, Outage>>,
}

impl SignalHealth {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            outages: Mutex::new(HashMap::new()),
        }
    }

    fn outages(&self) -> std::sync::MutexGuard<'_, HashMap<StoreKind, Outage>> {
        self.outages.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_degraded(&self, kind: StoreKind) -> bool {
        self.outages().contains_key(&kind)
    }

    /// Whether a call to the capability behind `kind` should be made now.
    ///
    /// Healthy signals always answer yes. A degraded signal answers yes at
    /// most once per cooldown interval, and that caller becomes the probe.
    pub fn should_attempt(&self, kind: StoreKind) -> bool {
        let mut outages = self.outages();
        match outages.get_mut(&kind) {
            None => true,
            Some(outage) if outage.last_attempt.elapsed() >= self.cooldown => {
                outage.last_attempt = Instant::now();
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_failure(&self, kind: StoreKind, reason: &str) {
        let mut outages = self.outages();
        if !outages.contains_key(&kind) {
            warn!(store = %kind, error = reason, "signal degraded");
        }
        outages.insert(
            kind,
            Outage {
                reason: reason.to_string(),
                last_attempt: Instant::now(),
            },
        );
    }

    pub fn record_success(&self, kind: StoreKind) {
        if self.outages().remove(&kind).is_some() {
            info!(store = %kind, "signal recovered");
        }
    }

    /// Degraded signals with the reason of their latest failure.
    pub fn degraded(&self) -> Vec<(StoreKind, String)> {
        let mut list: Vec<(StoreKind, String)> = self
            .outages()
            .iter()
            .map(|(k, o)| (*k, o.reason.clone()))
            .collect();
        list.sort_by_key(|(k, _)| *k);
        list
    }
}

impl Default for SignalHealth {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_degrades_until_success() {
        let health = SignalHealth::new(Duration::from_secs(3600));
        assert!(health.should_attempt(StoreKind::Vector));

        health.record_failure(StoreKind::Vector, "connection refused");
        assert!(health.is_degraded(StoreKind::Vector));
        assert!(!health.should_attempt(StoreKind::Vector));
        assert!(!health.is_degraded(StoreKind::Graph));

        health.record_success(StoreKind::Vector);
        assert!(!health.is_degraded(StoreKind::Vector));
        assert!(health.should_attempt(StoreKind::Vector));
    }

    #[test]
    fn probe_allowed_once_per_cooldown() {
        let health = SignalHealth::new(Duration::ZERO);
        health.record_failure(StoreKind::Graph, "model offline");
        assert!(health.should_attempt(StoreKind::Graph));
        assert!(health.is_degraded(StoreKind::Graph));
        assert_eq!(
            health.degraded(),
            vec![(StoreKind::Graph, "model offline".to_string())]
        );
    }
}
