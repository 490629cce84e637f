//! Per-address replay guard.
//!
//! Tracks the most recent accepted client timestamp per signed endpoint
//! family. A report whose timestamp is not strictly greater than the cursor
//! is a replay. The guard is in-memory; the metrics family is re-seeded
//! from `inference_metrics.last_updated` at boot so the guard survives a
//! restart.

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointFamily {
    Metrics,
    NodeRegister,
    PipelineRegister,
    PipelineReady,
}

#[derive(Default)]
pub struct ReplayGuard {
    cursors: DashMap<(EndpointFamily, String), i64>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `timestamp` is strictly newer than the accepted cursor.
    /// Does not advance the cursor: only a fully-persisted request does.
    pub fn is_fresh(&self, family: EndpointFamily, address: &str, timestamp: i64) -> bool {
        match self.cursors.get(&(family, address.to_string())) {
            Some(cursor) => timestamp > *cursor,
            None => true,
        }
    }

    /// Advance the cursor after the request's effects are durable
    pub fn advance(&self, family: EndpointFamily, address: &str, timestamp: i64) {
        self.cursors
            .entry((family, address.to_string()))
            .and_modify(|c| *c = (*c).max(timestamp))
            .or_insert(timestamp);
    }

    /// Seed a cursor during bootstrap rehydration
    pub fn seed(&self, family: EndpointFamily, address: &str, timestamp: i64) {
        self.advance(family, address, timestamp);
    }

    pub fn cursor(&self, family: EndpointFamily, address: &str) -> Option<i64> {
        self.cursors
            .get(&(family, address.to_string()))
            .map(|c| *c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_until_advanced() {
        let guard = ReplayGuard::new();
        assert!(guard.is_fresh(EndpointFamily::Metrics, "0xaa", 1000));

        guard.advance(EndpointFamily::Metrics, "0xaa", 1000);
        assert!(!guard.is_fresh(EndpointFamily::Metrics, "0xaa", 1000));
        assert!(!guard.is_fresh(EndpointFamily::Metrics, "0xaa", 999));
        assert!(guard.is_fresh(EndpointFamily::Metrics, "0xaa", 1001));
    }

    #[test]
    fn families_are_independent() {
        let guard = ReplayGuard::new();
        guard.advance(EndpointFamily::Metrics, "0xaa", 1000);
        assert!(guard.is_fresh(EndpointFamily::NodeRegister, "0xaa", 1000));
    }

    #[test]
    fn advance_never_moves_backwards() {
        let guard = ReplayGuard::new();
        guard.advance(EndpointFamily::Metrics, "0xaa", 1000);
        guard.advance(EndpointFamily::Metrics, "0xaa", 900);
        assert_eq!(guard.cursor(EndpointFamily::Metrics, "0xaa"), Some(1000));
    }
}
