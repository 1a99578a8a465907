// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Status condition engine.
//!
//! Resources carry two tracks of state: the coarse [`crate::model::Phase`]
//! and a sequence of named [`Condition`]s. This module computes the three
//! standard conditions (`Ready`, `Reconciling`, `Degraded`) for each
//! lifecycle transition and merges them into the existing sequence.
//!
//! # Transition-time rule
//!
//! A condition's `last_transition_time` advances only when its status value
//! actually changes; reason, message, and `observed_generation` update on
//! every write. Domain-specific conditions set by reconcilers go through the
//! same merge and obey the same rule.
//!
//! Conditions are unique by `type` and emitted in insertion order.

use chrono::Utc;

use crate::model::{Condition, ConditionStatus};

/// Standard condition: observed state matches desired state.
pub const CONDITION_READY: &str = "Ready";

/// Standard condition: an attempt is currently in flight.
pub const CONDITION_RECONCILING: &str = "Reconciling";

/// Standard condition: the last attempt reported an error.
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Lifecycle transitions that produce standard condition updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// An attempt is starting
    ReconcileStarted,
    /// The attempt succeeded
    ReconcileSucceeded,
    /// The attempt failed
    ReconcileFailed {
        /// CamelCase reason derived from the error
        reason: String,
        /// Human-readable failure message
        message: String,
    },
    /// Soft delete observed; the destroy path begins
    DeletionStarted,
}

/// Create a new condition stamped with the current time.
#[must_use]
pub fn create_condition(
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: i64,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now(),
        observed_generation,
    }
}

/// Find a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Merge a condition into the sequence, keyed by type.
///
/// If a condition of the same type exists and its status value is unchanged,
/// the existing `last_transition_time` is preserved; reason, message, and
/// `observed_generation` are always refreshed. New types append, preserving
/// insertion order.
pub fn merge_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        Some(existing) => {
            let transition_time = if existing.status == new.status {
                existing.last_transition_time
            } else {
                new.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..new
            };
        }
        None => conditions.push(new),
    }
}

/// Compute the standard condition updates for a lifecycle transition.
///
/// | Transition | Ready | Reconciling | Degraded |
/// |---|---|---|---|
/// | started   | Unknown / ReconcileStarted | True / InProgress | (unchanged) |
/// | succeeded | True / ReconcileSuccess | False / ReconcileComplete | False / NoErrors |
/// | failed    | False / from error | False / ReconcileComplete | True / from error |
/// | deleting  | Unknown / Deleting | False / Deleting | (unchanged) |
///
/// The returned conditions are fresh; merging them into a resource's
/// sequence (and the transition-time rule) happens in [`merge_condition`].
#[must_use]
pub fn transition_conditions(transition: &Transition, generation: i64) -> Vec<Condition> {
    match transition {
        Transition::ReconcileStarted => vec![
            create_condition(
                CONDITION_READY,
                ConditionStatus::Unknown,
                "ReconcileStarted",
                "Reconciliation in progress",
                generation,
            ),
            create_condition(
                CONDITION_RECONCILING,
                ConditionStatus::True,
                "InProgress",
                "Reconciliation in progress",
                generation,
            ),
        ],
        Transition::ReconcileSucceeded => vec![
            create_condition(
                CONDITION_READY,
                ConditionStatus::True,
                "ReconcileSuccess",
                "Resource is ready",
                generation,
            ),
            create_condition(
                CONDITION_RECONCILING,
                ConditionStatus::False,
                "ReconcileComplete",
                "Reconciliation finished",
                generation,
            ),
            create_condition(
                CONDITION_DEGRADED,
                ConditionStatus::False,
                "NoErrors",
                "Last reconciliation succeeded",
                generation,
            ),
        ],
        Transition::ReconcileFailed { reason, message } => vec![
            create_condition(
                CONDITION_READY,
                ConditionStatus::False,
                reason,
                message,
                generation,
            ),
            create_condition(
                CONDITION_RECONCILING,
                ConditionStatus::False,
                "ReconcileComplete",
                "Reconciliation finished",
                generation,
            ),
            create_condition(
                CONDITION_DEGRADED,
                ConditionStatus::True,
                reason,
                message,
                generation,
            ),
        ],
        Transition::DeletionStarted => vec![
            create_condition(
                CONDITION_READY,
                ConditionStatus::Unknown,
                "Deleting",
                "Resource is being deleted",
                generation,
            ),
            create_condition(
                CONDITION_RECONCILING,
                ConditionStatus::False,
                "Deleting",
                "Resource is being deleted",
                generation,
            ),
        ],
    }
}

/// Apply the standard condition updates for a lifecycle transition in place.
pub fn apply_transition(conditions: &mut Vec<Condition>, transition: &Transition, generation: i64) {
    for condition in transition_conditions(transition, generation) {
        merge_condition(conditions, condition);
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod status_tests;
