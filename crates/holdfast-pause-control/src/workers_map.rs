//! Registry of which worker classes run under which pause strategy.
//!
//! Populated once at boot through `&mut self`, then shared read-only behind an
//! `Arc`, so no lock is needed on the dispatch path.

use std::collections::BTreeMap;

use crate::error::PauseControlError;
use crate::strategy::PauseStrategy;

#[derive(Clone, Debug, Default)]
pub struct WorkersMap {
    bindings: BTreeMap<String, PauseStrategy>,
}

impl WorkersMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `worker` to the strategy called `strategy`.
    pub fn set_strategy_for(&mut self, strategy: &str, worker: &str) -> Result<(), PauseControlError> {
        self.bind(strategy.parse()?, worker)
    }

    /// Binding the same pair twice is a no-op; binding a worker to a second
    /// strategy is rejected.
    pub fn bind(&mut self, strategy: PauseStrategy, worker: &str) -> Result<(), PauseControlError> {
        match self.bindings.get(worker) {
            Some(existing) if *existing != strategy => Err(PauseControlError::ConflictingStrategy {
                worker: worker.to_string(),
                existing: existing.to_string(),
                requested: strategy.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.bindings.insert(worker.to_string(), strategy);
                Ok(())
            }
        }
    }

    pub fn strategy_for(&self, worker: &str) -> Option<PauseStrategy> {
        self.bindings.get(worker).copied()
    }

    /// Bound workers grouped by strategy, both in sorted order.
    pub fn workers(&self) -> BTreeMap<PauseStrategy, Vec<String>> {
        let mut grouped: BTreeMap<PauseStrategy, Vec<String>> = BTreeMap::new();
        for (worker, strategy) in &self.bindings {
            grouped.entry(*strategy).or_default().push(worker.clone());
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_is_a_config_error() {
        let mut map = WorkersMap::new();
        assert!(matches!(
            map.set_strategy_for("advanced_search", "W"),
            Err(PauseControlError::UnknownStrategy(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn rebinding_to_another_strategy_conflicts() {
        let mut map = WorkersMap::new();
        map.set_strategy_for("worker_toggle", "W").expect("bind");
        map.set_strategy_for("worker_toggle", "W").expect("idempotent");

        let err = map.set_strategy_for("search_indexing", "W").expect_err("conflict");
        assert!(matches!(err, PauseControlError::ConflictingStrategy { .. }));
        assert_eq!(map.strategy_for("W"), Some(PauseStrategy::WorkerToggle));
    }

    #[test]
    fn workers_are_grouped_by_strategy() {
        let mut map = WorkersMap::new();
        map.bind(PauseStrategy::SearchIndexing, "Search::B").expect("bind");
        map.bind(PauseStrategy::SearchIndexing, "Search::A").expect("bind");
        map.bind(PauseStrategy::WorkerToggle, "Export").expect("bind");

        let grouped = map.workers();
        assert_eq!(grouped[&PauseStrategy::SearchIndexing], vec!["Search::A", "Search::B"]);
        assert_eq!(grouped[&PauseStrategy::WorkerToggle], vec!["Export"]);
        assert_eq!(map.strategy_for("Unbound"), None);
    }
}
