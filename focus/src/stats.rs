//! Running statistics over objective evaluations.
//!
//! Owned and updated by the minimizer only; observers receive copies.

use serde::Serialize;

/// Objective value history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObjectiveFunctionInfo {
    pub previous: f64,
    /// Change from the previous evaluation
    pub delta: f64,
    pub min_value: f64,
    /// Most negative change seen so far
    pub min_delta: f64,
}

impl Default for ObjectiveFunctionInfo {
    fn default() -> Self {
        Self {
            previous: f64::NAN,
            delta: f64::NAN,
            min_value: f64::NAN,
            min_delta: f64::NAN,
        }
    }
}

/// Supply currents at the last and at the best evaluation, in amperes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PsCurrentsInfo {
    pub previous: [f64; 2],
    pub min: [f64; 2],
}

impl Default for PsCurrentsInfo {
    fn default() -> Self {
        Self {
            previous: [f64::NAN; 2],
            min: [f64::NAN; 2],
        }
    }
}

/// Both records as published after each evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub objective: ObjectiveFunctionInfo,
    pub currents: PsCurrentsInfo,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationStats {
    snapshot: StatsSnapshot,
}

impl EvaluationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    /// Note the currents about to be applied.
    pub fn record_currents(&mut self, currents: [f64; 2]) {
        self.snapshot.currents.previous = currents;
    }

    /// Fold in one objective value.
    ///
    /// While no minimum is known the value seeds `previous`, `min_value` and
    /// the best currents; `min_delta` starts at infinity and `delta` stays
    /// undefined until a second value arrives. A NaN value never replaces a
    /// known minimum.
    pub fn record_value(&mut self, currents: [f64; 2], value: f64) {
        let objective = &mut self.snapshot.objective;
        if objective.min_value.is_nan() {
            objective.min_value = value;
            objective.previous = value;
            objective.min_delta = f64::INFINITY;
            self.snapshot.currents.min = currents;
            return;
        }

        if objective.min_value > value {
            objective.min_value = value;
            self.snapshot.currents.min = currents;
        }

        let delta = value - objective.previous;
        if delta < objective.min_delta {
            objective.min_delta = delta;
        }
        objective.delta = delta;
        objective.previous = value;
    }

    pub fn reset(&mut self) {
        self.snapshot = StatsSnapshot::default();
    }
}
