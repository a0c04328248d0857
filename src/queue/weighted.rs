//! Weighted queue selection
//!
//! Claims pick a queue at random in proportion to its weight among the
//! queues that currently have work. A queue with weight 10 is served about
//! twice as often as one with weight 5, and every non-empty queue keeps a
//! non-zero share, so neither side can starve the other.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Ordered list of queue names with their weights
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWeights {
    entries: Vec<(String, u32)>,
}

impl QueueWeights {
    /// Build from `(name, weight)` pairs; zero weights are dropped
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .filter(|(_, weight)| *weight > 0)
                .map(|(name, weight)| (name.into(), weight))
                .collect(),
        }
    }

    /// A single queue
    pub fn single(name: impl Into<String>) -> Self {
        Self::new([(name.into(), 1)])
    }

    /// Weight configured for `name`
    pub fn weight_of(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(queue, _)| queue == name)
            .map(|(_, weight)| *weight)
    }

    /// Queue names in configuration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Whether no queue is configured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick one of the queues accepted by `has_work`, weighted at random
    pub fn pick<F, R>(&self, has_work: F, rng: &mut R) -> Option<&str>
    where
        F: Fn(&str) -> bool,
        R: Rng + ?Sized,
    {
        let candidates: Vec<&(String, u32)> = self
            .entries
            .iter()
            .filter(|(name, _)| has_work(name))
            .collect();

        let index = match candidates.len() {
            0 => return None,
            1 => 0,
            _ => WeightedIndex::new(candidates.iter().map(|(_, weight)| *weight))
                .ok()?
                .sample(rng),
        };
        candidates
            .get(index)
            .copied()
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weights() -> QueueWeights {
        QueueWeights::new([("critical", 10), ("default", 5)])
    }

    #[test]
    fn heavier_queue_wins_about_twice_as_often() {
        let weights = weights();
        let mut rng = StdRng::seed_from_u64(42);
        let mut critical = 0u32;
        let mut default = 0u32;

        for _ in 0..3000 {
            match weights.pick(|_| true, &mut rng) {
                Some("critical") => critical += 1,
                Some("default") => default += 1,
                other => panic!("unexpected pick {:?}", other),
            }
        }

        let ratio = f64::from(critical) / f64::from(default);
        assert!((1.7..2.3).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn lighter_queue_is_never_starved() {
        let weights = QueueWeights::new([("critical", 1000), ("default", 1)]);
        let mut rng = StdRng::seed_from_u64(7);
        let served = (0..20_000)
            .filter(|_| weights.pick(|_| true, &mut rng) == Some("default"))
            .count();
        assert!(served > 0);
    }

    #[test]
    fn only_queues_with_work_are_picked() {
        let weights = weights();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(weights.pick(|q| q == "default", &mut rng), Some("default"));
        }
        assert_eq!(weights.pick(|_| false, &mut rng), None);
    }

    #[test]
    fn zero_weights_are_dropped() {
        let weights = QueueWeights::new([("a", 0), ("b", 3)]);
        assert_eq!(weights.weight_of("a"), None);
        assert_eq!(weights.names().collect::<Vec<_>>(), vec!["b"]);
    }
}
