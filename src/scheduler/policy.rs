//! Scheduling policies.
//!
//! A policy turns the set of eligible tasks (`status = queued`,
//! `run_after <= now`) into a ranked candidate list. The claimer walks that
//! list top-down until one compare-and-swap succeeds.
//!
//! | Policy | Winner | Ties |
//! |--------|--------|------|
//! | FIFO | oldest `created_at` | lowest id |
//! | LIFO | newest `created_at` | highest id |
//! | Priority | highest priority | FIFO within the band |
//! | Weighted-Random | sampled with probability `w(p) / Σ w` | uniform |

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::RngExt;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::task::{Task, MIN_PRIORITY};

/// Selection rule applied when a worker asks for its next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    #[default]
    Fifo,
    Lifo,
    Priority,
    WeightedRandom,
}

impl SchedulingPolicy {
    /// All policies.
    pub const ALL: [SchedulingPolicy; 4] = [
        SchedulingPolicy::Fifo,
        SchedulingPolicy::Lifo,
        SchedulingPolicy::Priority,
        SchedulingPolicy::WeightedRandom,
    ];

    /// Returns the canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulingPolicy::Fifo => "fifo",
            SchedulingPolicy::Lifo => "lifo",
            SchedulingPolicy::Priority => "priority",
            SchedulingPolicy::WeightedRandom => "weighted_random",
        }
    }

    /// Returns whether ranking draws from a random source.
    pub fn is_randomized(self) -> bool {
        matches!(self, SchedulingPolicy::WeightedRandom)
    }

    /// SQL `ORDER BY` clause that yields candidates in policy order.
    ///
    /// Weighted-random has no deterministic order; the claimer samples it
    /// from the whole eligible set with [`weighted_sample`].
    pub fn order_by_clause(self) -> &'static str {
        match self {
            SchedulingPolicy::Fifo | SchedulingPolicy::WeightedRandom => {
                "created_at ASC, id ASC"
            }
            SchedulingPolicy::Lifo => "created_at DESC, id DESC",
            SchedulingPolicy::Priority => "priority DESC, created_at ASC, id ASC",
        }
    }

    /// Compares two tasks under a deterministic policy.
    ///
    /// `Ordering::Less` means `a` should be claimed before `b`. Weighted-random
    /// falls back to FIFO order.
    pub fn compare(self, a: &Task, b: &Task) -> Ordering {
        let fifo = || a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
        match self {
            SchedulingPolicy::Fifo | SchedulingPolicy::WeightedRandom => fifo(),
            SchedulingPolicy::Lifo => b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)),
            SchedulingPolicy::Priority => b.priority.cmp(&a.priority).then_with(fifo),
        }
    }

    /// Ranks `candidates` and keeps the best `limit`.
    pub fn rank(self, mut candidates: Vec<Task>, limit: usize, rng: &mut ChaCha8Rng) -> Vec<Task> {
        match self {
            SchedulingPolicy::WeightedRandom => weighted_sample(
                candidates.into_iter().map(|task| (task.priority, task)),
                limit,
                rng,
            ),
            _ => {
                candidates.sort_by(|a, b| self.compare(a, b));
                candidates.truncate(limit);
                candidates
            }
        }
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(SchedulingPolicy::Fifo),
            "lifo" => Ok(SchedulingPolicy::Lifo),
            "priority" => Ok(SchedulingPolicy::Priority),
            "weighted_random" | "weighted" => Ok(SchedulingPolicy::WeightedRandom),
            other => Err(format!(
                "unknown scheduling policy '{}' (expected fifo, lifo, priority or weighted_random)",
                other
            )),
        }
    }
}

/// Sampling weight of a priority: `priority - MIN_PRIORITY + 1`.
///
/// Strictly positive so the lowest band is never starved outright.
pub fn priority_weight(priority: i32) -> f64 {
    f64::from(priority.saturating_sub(MIN_PRIORITY).max(0)) + 1.0
}

/// Probability that each priority wins a weighted-random draw.
pub fn selection_probabilities(priorities: &[i32]) -> Vec<f64> {
    let total: f64 = priorities.iter().map(|&p| priority_weight(p)).sum();
    if total <= 0.0 {
        return vec![0.0; priorities.len()];
    }
    priorities
        .iter()
        .map(|&p| priority_weight(p) / total)
        .collect()
}

/// Draws up to `limit` items without replacement, each `(priority, item)`
/// pair weighted by [`priority_weight`].
///
/// The first item is the weighted-random winner; the rest are fallbacks in
/// draw order.
pub fn weighted_sample<T>(
    candidates: impl IntoIterator<Item = (i32, T)>,
    limit: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<T> {
    let mut keyed: Vec<(f64, T)> = candidates
        .into_iter()
        .map(|(priority, item)| (sampling_key(priority_weight(priority), rng), item))
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().take(limit).map(|(_, item)| item).collect()
}

/// Efraimidis-Spirakis key `ln(u) / w`; sorting keys descending yields a
/// weighted sample without replacement.
fn sampling_key(weight: f64, rng: &mut ChaCha8Rng) -> f64 {
    let u: f64 = rng.random::<f64>();
    u.ln() / weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{TaskId, TaskStatus};
    use chrono::{DateTime, Duration, Utc};
    use rand::SeedableRng;

    fn task(id: i64, priority: i32, created_at: DateTime<Utc>) -> Task {
        Task {
            id: TaskId(id),
            task_type: "demo".to_string(),
            parameters: serde_json::json!({}),
            priority,
            run_after: created_at,
            status: TaskStatus::Queued,
            claimed_by: None,
            claimed_at: None,
            retry_count: 0,
            max_retries: 3,
            result: None,
            error_message: None,
            cancel_requested: false,
            created_at,
            updated_at: created_at,
            completed_at: None,
        }
    }

    fn ids(tasks: &[Task]) -> Vec<i64> {
        tasks.iter().map(|t| t.id.get()).collect()
    }

    #[test]
    fn test_fifo_orders_by_creation_then_id() {
        let t0 = Utc::now();
        let candidates = vec![
            task(3, 0, t0 + Duration::seconds(1)),
            task(2, 0, t0),
            task(1, 0, t0),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ranked = SchedulingPolicy::Fifo.rank(candidates, 10, &mut rng);
        assert_eq!(ids(&ranked), vec![1, 2, 3]);
    }

    #[test]
    fn test_lifo_orders_newest_first() {
        let t0 = Utc::now();
        let candidates = vec![
            task(1, 0, t0),
            task(2, 0, t0),
            task(3, 0, t0 + Duration::seconds(1)),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ranked = SchedulingPolicy::Lifo.rank(candidates, 10, &mut rng);
        assert_eq!(ids(&ranked), vec![3, 2, 1]);
    }

    #[test]
    fn test_priority_bands_fall_back_to_fifo() {
        let t0 = Utc::now();
        let candidates = vec![
            task(1, 1, t0),
            task(2, 5, t0 + Duration::seconds(1)),
            task(3, 5, t0 + Duration::seconds(2)),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ranked = SchedulingPolicy::Priority.rank(candidates, 10, &mut rng);
        assert_eq!(ids(&ranked), vec![2, 3, 1]);
    }

    #[test]
    fn test_rank_respects_limit() {
        let t0 = Utc::now();
        let candidates = (1..=20).map(|i| task(i, 0, t0)).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ranked = SchedulingPolicy::WeightedRandom.rank(candidates, 4, &mut rng);
        assert_eq!(ranked.len(), 4);
    }

    #[test]
    fn test_weighted_random_converges() {
        let t0 = Utc::now();
        let priorities = [0, 1, 3, 10];
        let expected = selection_probabilities(&priorities);
        let base: Vec<Task> = priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| task(i as i64 + 1, p, t0))
            .collect();

        let trials = 20_000;
        let mut wins = [0usize; 4];
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..trials {
            let ranked = SchedulingPolicy::WeightedRandom.rank(base.clone(), 1, &mut rng);
            let idx = (ranked[0].id.get() - 1) as usize;
            wins[idx] += 1;
        }

        for (i, &p) in expected.iter().enumerate() {
            let observed = wins[i] as f64 / trials as f64;
            assert!(
                (observed - p).abs() < 0.02,
                "priority {} observed {:.4} expected {:.4}",
                priorities[i],
                observed,
                p
            );
        }
    }

    #[test]
    fn test_weighted_sample_draws_distinct_items() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut drawn = weighted_sample((0..50).map(|i| (i % 7, i)), 50, &mut rng);
        assert_eq!(drawn.len(), 50);
        drawn.sort_unstable();
        assert_eq!(drawn, (0..50).collect::<Vec<_>>());
        assert!(weighted_sample(Vec::<(i32, u8)>::new(), 3, &mut rng).is_empty());
    }

    #[test]
    fn test_weighted_random_exact_ties_are_uniform() {
        let t0 = Utc::now();
        let base: Vec<Task> = (1..=4).map(|i| task(i, 7, t0)).collect();
        let trials = 20_000;
        let mut wins = [0usize; 4];
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..trials {
            let ranked = SchedulingPolicy::WeightedRandom.rank(base.clone(), 1, &mut rng);
            wins[(ranked[0].id.get() - 1) as usize] += 1;
        }
        for count in wins {
            let observed = count as f64 / trials as f64;
            assert!((observed - 0.25).abs() < 0.02, "observed {:.4}", observed);
        }
    }

    #[test]
    fn test_priority_weight_is_monotonic() {
        assert!(priority_weight(0) > 0.0);
        for p in 0..100 {
            assert!(priority_weight(p + 1) > priority_weight(p));
        }
        let probs = selection_probabilities(&[0, 1, 3]);
        let total: f64 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((probs[2] - 4.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("FIFO".parse::<SchedulingPolicy>(), Ok(SchedulingPolicy::Fifo));
        assert_eq!(
            "weighted-random".parse::<SchedulingPolicy>(),
            Ok(SchedulingPolicy::WeightedRandom)
        );
        assert!("round_robin".parse::<SchedulingPolicy>().is_err());
        for policy in SchedulingPolicy::ALL {
            assert_eq!(policy.as_str().parse::<SchedulingPolicy>(), Ok(policy));
        }
    }
}
