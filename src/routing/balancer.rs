/// Weighted backend selection among ONLINE candidates
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A backend eligible for selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub backend_id: String,
    pub weight: u32,
    /// Connections currently lent out for this backend
    pub in_flight: usize,
}

impl Candidate {
    pub fn new<S: Into<String>>(backend_id: S, weight: u32, in_flight: usize) -> Self {
        Self {
            backend_id: backend_id.into(),
            weight,
            in_flight,
        }
    }
}

/// Load balancing algorithm trait
pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Pick one of `candidates`, returning its index
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;

    /// Drop any state kept for a backend that left the topology
    fn forget(&self, _backend_id: &str) {}
}

/// Available selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    WeightedRoundRobin,
    WeightedRandom,
}

impl Selection {
    pub fn build(self) -> Box<dyn LoadBalancingAlgorithm> {
        match self {
            Selection::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
            Selection::WeightedRandom => Box::new(WeightedRandom),
        }
    }
}

/// Smooth weighted round-robin.
///
/// Each pick adds every candidate's weight to its running score, takes the
/// highest score and subtracts the total weight from the winner. Equal
/// scores go to the candidate with fewer connections in flight.
pub struct WeightedRoundRobin {
    scores: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            scores: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingAlgorithm for WeightedRoundRobin {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        match candidates.len() {
            0 => return None,
            1 => return Some(0),
            _ => {}
        }

        let mut scores = match self.scores.lock() {
            Ok(scores) => scores,
            Err(poisoned) => poisoned.into_inner(),
        };

        let total: i64 = candidates.iter().map(|c| i64::from(c.weight)).sum();
        let mut best: Option<(usize, i64)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let score = scores.entry(candidate.backend_id.clone()).or_insert(0);
            *score += i64::from(candidate.weight);
            let better = match best {
                None => true,
                Some((best_index, best_score)) => {
                    *score > best_score
                        || (*score == best_score
                            && candidate.in_flight < candidates[best_index].in_flight)
                }
            };
            if better {
                best = Some((index, *score));
            }
        }

        let (index, _) = best?;
        if let Some(score) = scores.get_mut(&candidates[index].backend_id) {
            *score -= total;
        }
        Some(index)
    }

    fn forget(&self, backend_id: &str) {
        let mut scores = match self.scores.lock() {
            Ok(scores) => scores,
            Err(poisoned) => poisoned.into_inner(),
        };
        scores.remove(backend_id);
    }
}

/// Random choice with probability proportional to weight
pub struct WeightedRandom;

impl LoadBalancingAlgorithm for WeightedRandom {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        match candidates.len() {
            0 => None,
            1 => Some(0),
            _ => {
                let dist = WeightedIndex::new(candidates.iter().map(|c| c.weight)).ok()?;
                Some(dist.sample(&mut rand::thread_rng()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(weights: &[u32]) -> Vec<Candidate> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| Candidate::new(format!("backend{}", i + 1), *w, 0))
            .collect()
    }

    #[test]
    fn test_round_robin_equal_weights() {
        let wrr = WeightedRoundRobin::new();
        let backends = candidates(&[1, 1, 1]);

        // Cycles through backends
        assert_eq!(wrr.select(&backends), Some(0));
        assert_eq!(wrr.select(&backends), Some(1));
        assert_eq!(wrr.select(&backends), Some(2));
        assert_eq!(wrr.select(&backends), Some(0));
    }

    #[test]
    fn test_weighted_round_robin() {
        let wrr = WeightedRoundRobin::new();
        let backends = candidates(&[3, 1]);

        let mut counts = [0, 0];
        for _ in 0..8 {
            if let Some(index) = wrr.select(&backends) {
                counts[index] += 1;
            }
        }

        assert_eq!(counts[0], 6);
        assert_eq!(counts[1], 2);
    }

    #[test]
    fn test_smooth_interleaving() {
        let wrr = WeightedRoundRobin::new();
        let backends = candidates(&[2, 1]);
        let picks: Vec<usize> = (0..6).filter_map(|_| wrr.select(&backends)).collect();
        // Heavier backend is never picked three times in a row
        assert_eq!(picks, vec![0, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn test_ties_prefer_fewer_in_flight() {
        let wrr = WeightedRoundRobin::new();
        let backends = vec![
            Candidate::new("busy", 1, 5),
            Candidate::new("idle", 1, 0),
        ];
        assert_eq!(wrr.select(&backends), Some(1));
    }

    #[test]
    fn test_forget_drops_score() {
        let wrr = WeightedRoundRobin::new();
        let backends = candidates(&[1, 1]);
        wrr.select(&backends);
        assert_eq!(wrr.scores.lock().unwrap().len(), 2);

        wrr.forget("backend1");
        wrr.forget("unknown");
        let scores = wrr.scores.lock().unwrap();
        assert_eq!(scores.len(), 1);
        assert!(scores.contains_key("backend2"));
    }

    #[test]
    fn test_empty_and_single() {
        let wrr = WeightedRoundRobin::new();
        assert_eq!(wrr.select(&[]), None);
        assert_eq!(wrr.select(&candidates(&[4])), Some(0));
        assert_eq!(WeightedRandom.select(&[]), None);
    }

    #[test]
    fn test_weighted_random_respects_weights() {
        let backends = candidates(&[9, 1]);
        let mut counts = [0usize; 2];
        for _ in 0..2000 {
            counts[WeightedRandom.select(&backends).unwrap()] += 1;
        }
        assert!(counts[0] > counts[1] * 3);
    }

    #[test]
    fn test_selection_from_config_name() {
        let selection: Selection = serde_json::from_str("\"weighted_random\"").unwrap();
        assert_eq!(selection, Selection::WeightedRandom);
        assert_eq!(Selection::default(), Selection::WeightedRoundRobin);
    }
}
