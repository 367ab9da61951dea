//! Status conditions for SpecialResource
//!
//! The controller tracks one logical state per resource: Ready, Progressing
//! or Errored. In memory this is a single tagged [`ConditionState`], so the
//! three states are mutually exclusive by construction. Only when the state
//! is written to the status subresource is it expanded into three
//! independent [`Condition`] records, exactly one of them `True`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type for the Ready record
pub const CONDITION_READY: &str = "Ready";
/// Condition type for the Progressing record
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition type for the Errored record
pub const CONDITION_ERRORED: &str = "Errored";

/// Condition status value for the active record
pub const STATUS_TRUE: &str = "True";
/// Condition status value for the inactive records
pub const STATUS_FALSE: &str = "False";

/// Condition record as persisted in `status.conditions`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Progressing, Errored)
    pub r#type: String,

    /// Status of the condition ("True" or "False")
    pub status: String,

    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Whether this record is the active one
    pub fn is_true(&self) -> bool {
        self.status == STATUS_TRUE
    }
}

/// Which of the three mutually exclusive states is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    Ready,
    Progressing,
    Errored,
}

impl ConditionKind {
    /// Every kind, in the order records are written
    pub const ALL: [ConditionKind; 3] = [
        ConditionKind::Ready,
        ConditionKind::Progressing,
        ConditionKind::Errored,
    ];

    /// Condition type string of the persisted record
    pub fn condition_type(self) -> &'static str {
        match self {
            ConditionKind::Ready => CONDITION_READY,
            ConditionKind::Progressing => CONDITION_PROGRESSING,
            ConditionKind::Errored => CONDITION_ERRORED,
        }
    }

    /// Reason written onto the two inactive records while this kind is active
    pub fn inactive_reason(self) -> &'static str {
        match self {
            ConditionKind::Ready => "SpecialResourceIsReady",
            ConditionKind::Progressing => "Progressing",
            ConditionKind::Errored => "ErrorHasOccurred",
        }
    }

    fn from_condition_type(condition_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.condition_type() == condition_type)
    }
}

/// The single logical state of a SpecialResource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionState {
    pub kind: ConditionKind,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConditionState {
    /// Build a state of the given kind stamped with the current time
    pub fn new(kind: ConditionKind, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConditionKind::Ready, reason, message)
    }

    pub fn progressing(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConditionKind::Progressing, reason, message)
    }

    pub fn errored(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConditionKind::Errored, reason, message)
    }

    /// Expand this state into the three persisted records.
    ///
    /// Mirrors `meta.SetStatusCondition`: an existing record keeps its
    /// `lastTransitionTime` unless its status flips. Records of unrelated
    /// types are left untouched.
    pub fn apply_to(&self, conditions: &mut Vec<Condition>) {
        for kind in ConditionKind::ALL {
            let desired = if kind == self.kind {
                Condition {
                    r#type: kind.condition_type().to_string(),
                    status: STATUS_TRUE.to_string(),
                    reason: self.reason.clone(),
                    message: self.message.clone(),
                    last_transition_time: Some(self.timestamp),
                }
            } else {
                Condition {
                    r#type: kind.condition_type().to_string(),
                    status: STATUS_FALSE.to_string(),
                    reason: self.kind.inactive_reason().to_string(),
                    message: String::new(),
                    last_transition_time: Some(self.timestamp),
                }
            };
            set_status_condition(conditions, desired);
        }
    }

    /// Recover the active state from persisted records, if exactly one is `True`
    pub fn from_conditions(conditions: &[Condition]) -> Option<Self> {
        let mut active = conditions
            .iter()
            .filter(|c| c.is_true())
            .filter_map(|c| ConditionKind::from_condition_type(&c.r#type).map(|kind| (kind, c)));

        let (kind, condition) = active.next()?;
        if active.next().is_some() {
            return None;
        }

        Some(Self {
            kind,
            reason: condition.reason.clone(),
            message: condition.message.clone(),
            timestamp: condition.last_transition_time.unwrap_or_else(Utc::now),
        })
    }
}

fn set_status_condition(conditions: &mut Vec<Condition>, desired: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == desired.r#type) {
        Some(existing) => {
            if existing.status != desired.status {
                existing.status = desired.status;
                existing.last_transition_time = desired.last_transition_time;
            } else if existing.last_transition_time.is_none() {
                existing.last_transition_time = desired.last_transition_time;
            }
            existing.reason = desired.reason;
            existing.message = desired.message;
        }
        None => conditions.push(desired),
    }
}
