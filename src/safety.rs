//! Confirmation hook for actions the model flags as risky.

use serde_json::Value;
use tracing::warn;

use crate::types::{ActionCall, SAFETY_DECISION_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    Continue,
    Terminate,
}

/// Decides whether a flagged action may run.
pub trait SafetyPolicy: Send + Sync {
    fn confirm(&self, call: &ActionCall, decision: &Value) -> SafetyVerdict;
}

/// The `safety_decision` payload of a call, if the model attached one.
pub fn safety_decision(call: &ActionCall) -> Option<&Value> {
    call.args.get(SAFETY_DECISION_KEY)
}

/// Proceeds with every flagged action and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcknowledge;

impl SafetyPolicy for AutoAcknowledge {
    fn confirm(&self, call: &ActionCall, decision: &Value) -> SafetyVerdict {
        let explanation = decision
            .get("explanation")
            .and_then(Value::as_str)
            .unwrap_or_default();
        warn!(action = %call.name, %explanation, "auto-acknowledging safety decision");
        SafetyVerdict::Continue
    }
}

/// Declines every flagged action.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefuseAll;

impl SafetyPolicy for RefuseAll {
    fn confirm(&self, call: &ActionCall, _decision: &Value) -> SafetyVerdict {
        warn!(action = %call.name, "declining flagged action");
        SafetyVerdict::Terminate
    }
}
