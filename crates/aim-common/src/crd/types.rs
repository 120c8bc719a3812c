//! Supporting types shared by all AIM CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, Valid, DeletionBlocked)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Keep the previous transition time when the same condition is already
    /// published, so re-publishing an unchanged status is a no-op.
    pub fn transition_from(mut self, previous: &[Condition]) -> Self {
        if let Some(prev) = previous.iter().find(|c| {
            c.type_ == self.type_
                && c.status == self.status
                && c.reason == self.reason
                && c.message == self.message
        }) {
            self.last_transition_time = prev.last_transition_time;
        }
        self
    }
}

/// Returns true if a condition of the given type is present with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let cond = Condition::new("Ready", ConditionStatus::True, "CacheReady", "ok");
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn transition_time_preserved_for_identical_condition() {
        let mut old = Condition::new("Valid", ConditionStatus::True, "ValidationSucceeded", "ok");
        old.last_transition_time = Utc::now() - Duration::hours(3);

        let new = Condition::new("Valid", ConditionStatus::True, "ValidationSucceeded", "ok")
            .transition_from(std::slice::from_ref(&old));
        assert_eq!(new.last_transition_time, old.last_transition_time);
        assert_eq!(new, old);
    }

    #[test]
    fn transition_time_refreshed_when_status_flips() {
        let mut old = Condition::new("Ready", ConditionStatus::False, "DeploymentNotReady", "no");
        old.last_transition_time = Utc::now() - Duration::hours(3);

        let new = Condition::new("Ready", ConditionStatus::True, "DeploymentReady", "yes")
            .transition_from(&[old.clone()]);
        assert!(new.last_transition_time > old.last_transition_time);
    }

    #[test]
    fn condition_true_lookup() {
        let conditions = vec![Condition::new(
            "DeletionBlocked",
            ConditionStatus::True,
            "EndpointsStillUsing",
            "blocked",
        )];
        assert!(is_condition_true(&conditions, "DeletionBlocked"));
        assert!(!is_condition_true(&conditions, "Ready"));
    }

    #[test]
    fn condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::default().to_string(), "Unknown");
    }
}
