//! Monotonic balance-threshold tracker.

use ethers::types::U256;
use tracing::{info, warn};

/// Tracks a required balance against its last observed value. Logs once per
/// transition in either direction, never on repeated observations.
#[derive(Debug)]
pub struct AmountRequired {
    description: &'static str,
    required: U256,
    current: U256,
    satisfied: Option<bool>,
}

impl AmountRequired {
    pub fn new(description: &'static str, required: U256) -> Self {
        Self {
            description,
            required,
            current: U256::zero(),
            satisfied: None,
        }
    }

    pub fn required(&self) -> U256 {
        self.required
    }

    pub fn current(&self) -> U256 {
        self.current
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied.unwrap_or(false)
    }

    /// Record a new observation of the tracked balance. The first
    /// observation counts as a transition.
    pub fn observe(&mut self, current: U256) {
        self.current = current;
        let now = current >= self.required;
        match (self.satisfied, now) {
            (Some(true), true) | (Some(false), false) => {}
            (_, true) => info!(
                what = self.description,
                current = %current,
                required = %self.required,
                "balance requirement satisfied"
            ),
            (_, false) => warn!(
                what = self.description,
                current = %current,
                required = %self.required,
                "balance requirement not satisfied"
            ),
        }
        self.satisfied = Some(now);
    }
}
