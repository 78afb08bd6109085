// ============================================================
// Layer 3 — Hyperparameter Schedules
// ============================================================
// Learning rate and band dropout rate both follow the same
// optional linear warmup:
//
//   value
//     ^        ________________ final
//     |       /
//     |      /
//     |     /
//     |____/__________________> step
//     0    warmup
//
// The schedule is a pure function of the step. The training loop
// never trusts a stored value after a restart; it recomputes from
// the restored step, so a resumed run sees exactly the values an
// uninterrupted run would have seen.

use serde::{Deserialize, Serialize};

/// Value of a warmed-up hyperparameter at `step`.
///
/// With no warmup (None or 0) this is always `final_value`.
/// Otherwise it ramps linearly from 0 at step 0 to `final_value`
/// at `step == warmup`, and stays there. Steps before 0 (the run
/// has not started yet) count as step 0.
pub fn value_at(step: i64, final_value: f64, warmup: Option<u64>) -> f64 {
    match warmup {
        None | Some(0) => final_value,
        Some(length) => {
            let step = step.max(0) as f64;
            let length = length as f64;
            if step >= length {
                final_value
            } else {
                final_value * step / length
            }
        }
    }
}

/// A hyperparameter with an optional linear warmup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub final_value: f64,
    pub warmup:      Option<u64>,
}

impl Schedule {
    pub fn new(final_value: f64, warmup: Option<u64>) -> Self {
        Self { final_value, warmup }
    }

    /// A schedule that is `value` from the first step on
    #[cfg(test)]
    pub fn constant(value: f64) -> Self {
        Self::new(value, None)
    }

    /// True when the value changes over the first steps of training
    pub fn is_warmup_enabled(&self) -> bool {
        matches!(self.warmup, Some(n) if n > 0)
    }

    pub fn at(&self, step: i64) -> f64 {
        value_at(step, self.final_value, self.warmup)
    }
}
