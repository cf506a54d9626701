//! Fairness metrics over observed wait times.
//!
//! Fairness is measured, not enforced. The monitor and `jobforge stats`
//! feed the wait time of every claimed task (claim time minus eligibility
//! time) into [`FairnessReport::from_wait_times`].

use serde::{Deserialize, Serialize};

/// Gini coefficient of `values`.
///
/// 0 means every value is equal; values approach 1 as a single entry
/// dominates. Empty and all-zero inputs are perfectly equal.
pub fn gini_coefficient(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = values.iter().map(|v| v.max(0.0)).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len() as f64;
    let total: f64 = sorted.iter().sum();
    if total == 0.0 {
        return 0.0;
    }

    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, &value)| (2.0 * (i as f64 + 1.0) - n - 1.0) * value)
        .sum();

    weighted / (n * total)
}

/// Jain's fairness index of `values`: `(Σx)² / (n · Σx²)`.
///
/// 1 is perfectly fair; the index falls towards `1/n` when one entry takes
/// everything.
pub fn jain_index(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }

    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }

    (sum * sum) / (n * sum_sq)
}

/// Summary of how evenly waiting was spread across tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FairnessReport {
    pub samples: usize,
    pub mean_wait_secs: f64,
    pub max_wait_secs: f64,
    pub p95_wait_secs: f64,
    pub gini: f64,
    pub jain: f64,
}

impl FairnessReport {
    /// Builds a report from wait times in seconds.
    pub fn from_wait_times(wait_secs: &[f64]) -> Self {
        if wait_secs.is_empty() {
            return Self {
                jain: 1.0,
                ..Self::default()
            };
        }

        let mut sorted = wait_secs.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let p95_idx = ((n as f64 * 0.95).ceil() as usize).clamp(1, n) - 1;

        Self {
            samples: n,
            mean_wait_secs: sorted.iter().sum::<f64>() / n as f64,
            max_wait_secs: sorted[n - 1],
            p95_wait_secs: sorted[p95_idx],
            gini: gini_coefficient(&sorted),
            jain: jain_index(&sorted),
        }
    }
}
