// Outcome of a diagnostic run, printable as JSON

use serde::{Deserialize, Serialize};

/// Steps of the diagnostic, in the order they run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Connect,
    Ping,
    ReadMinLimit,
    ReadMaxLimit,
    TorqueOff,
    WriteMinLimit,
    WriteMaxLimit,
    LedOn,
    TorqueOn,
    ReadPosition,
    GoalPosition,
    ReadSettledPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { value: Option<i32> },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: Outcome,
}

/// Everything the run learned about the motor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub id: u8,
    pub model: Option<u16>,
    pub goal: i32,
    pub final_position: Option<i32>,
    pub steps: Vec<StepRecord>,
}

impl DiagnosticReport {
    pub fn new(id: u8, goal: i32) -> Self {
        Self {
            id,
            goal,
            ..Self::default()
        }
    }

    pub fn record(&mut self, step: Step, outcome: Outcome) {
        self.steps.push(StepRecord { step, outcome });
    }

    /// Steps that failed without aborting the run
    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }

    pub fn outcome(&self, step: Step) -> Option<&Outcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }
}
