// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `status.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        apply_transition, create_condition, find_condition, merge_condition, Transition,
        CONDITION_DEGRADED, CONDITION_READY, CONDITION_RECONCILING,
    };
    use crate::model::ConditionStatus;

    #[test]
    fn test_started_transition_sets_ready_unknown() {
        let mut conditions = Vec::new();

        apply_transition(&mut conditions, &Transition::ReconcileStarted, 1);

        let ready = find_condition(&conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, "ReconcileStarted");

        let reconciling = find_condition(&conditions, CONDITION_RECONCILING).unwrap();
        assert_eq!(reconciling.status, ConditionStatus::True);
        assert_eq!(reconciling.reason, "InProgress");

        // Degraded is untouched on start
        assert!(find_condition(&conditions, CONDITION_DEGRADED).is_none());
    }

    #[test]
    fn test_success_transition_sets_all_three() {
        let mut conditions = Vec::new();

        apply_transition(&mut conditions, &Transition::ReconcileStarted, 1);
        apply_transition(&mut conditions, &Transition::ReconcileSucceeded, 1);

        let ready = find_condition(&conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "ReconcileSuccess");

        let reconciling = find_condition(&conditions, CONDITION_RECONCILING).unwrap();
        assert_eq!(reconciling.status, ConditionStatus::False);

        let degraded = find_condition(&conditions, CONDITION_DEGRADED).unwrap();
        assert_eq!(degraded.status, ConditionStatus::False);
        assert_eq!(degraded.reason, "NoErrors");
    }

    #[test]
    fn test_failure_transition_carries_error_reason() {
        let mut conditions = Vec::new();

        apply_transition(
            &mut conditions,
            &Transition::ReconcileFailed {
                reason: "ReconcileError".to_string(),
                message: "boom".to_string(),
            },
            2,
        );

        let ready = find_condition(&conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "ReconcileError");
        assert_eq!(ready.message, "boom");

        let degraded = find_condition(&conditions, CONDITION_DEGRADED).unwrap();
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.message, "boom");
    }

    #[test]
    fn test_deletion_transition_leaves_degraded_untouched() {
        let mut conditions = Vec::new();
        apply_transition(
            &mut conditions,
            &Transition::ReconcileFailed {
                reason: "ReconcileError".to_string(),
                message: "boom".to_string(),
            },
            1,
        );
        let degraded_before = find_condition(&conditions, CONDITION_DEGRADED).unwrap().clone();

        apply_transition(&mut conditions, &Transition::DeletionStarted, 1);

        let ready = find_condition(&conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, "Deleting");
        assert_eq!(
            find_condition(&conditions, CONDITION_DEGRADED).unwrap(),
            &degraded_before
        );
    }

    #[test]
    fn test_transition_time_preserved_when_status_unchanged() {
        let mut conditions = Vec::new();
        apply_transition(&mut conditions, &Transition::ReconcileSucceeded, 1);
        let first = find_condition(&conditions, CONDITION_READY).unwrap().clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        apply_transition(&mut conditions, &Transition::ReconcileSucceeded, 2);
        let second = find_condition(&conditions, CONDITION_READY).unwrap();

        // Status stayed True: the transition time must not advance
        assert_eq!(second.status, ConditionStatus::True);
        assert_eq!(second.last_transition_time, first.last_transition_time);
        // observed_generation always reflects the write-time generation
        assert_eq!(second.observed_generation, 2);
    }

    #[test]
    fn test_transition_time_advances_when_status_flips() {
        let mut conditions = Vec::new();
        apply_transition(&mut conditions, &Transition::ReconcileSucceeded, 1);
        let first = find_condition(&conditions, CONDITION_READY).unwrap().clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        apply_transition(
            &mut conditions,
            &Transition::ReconcileFailed {
                reason: "ReconcileError".to_string(),
                message: "boom".to_string(),
            },
            1,
        );
        let second = find_condition(&conditions, CONDITION_READY).unwrap();

        assert_eq!(second.status, ConditionStatus::False);
        assert!(second.last_transition_time > first.last_transition_time);
    }

    #[test]
    fn test_merge_preserves_insertion_order() {
        let mut conditions = Vec::new();
        merge_condition(
            &mut conditions,
            create_condition("CertificateValid", ConditionStatus::True, "Issued", "", 1),
        );
        apply_transition(&mut conditions, &Transition::ReconcileSucceeded, 1);

        // Re-merging an existing type updates in place without reordering
        merge_condition(
            &mut conditions,
            create_condition("CertificateValid", ConditionStatus::False, "Expired", "", 1),
        );

        let order: Vec<&str> = conditions.iter().map(|c| c.r#type.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "CertificateValid",
                CONDITION_READY,
                CONDITION_RECONCILING,
                CONDITION_DEGRADED
            ]
        );
        assert_eq!(conditions[0].reason, "Expired");
    }

    #[test]
    fn test_condition_types_stay_unique() {
        let mut conditions = Vec::new();
        for _ in 0..3 {
            apply_transition(&mut conditions, &Transition::ReconcileStarted, 1);
        }

        let ready_count = conditions.iter().filter(|c| c.r#type == CONDITION_READY).count();
        assert_eq!(ready_count, 1);
    }

    #[test]
    fn test_domain_condition_follows_transition_rule() {
        let mut conditions = Vec::new();
        merge_condition(
            &mut conditions,
            create_condition("EndpointHealthy", ConditionStatus::True, "Probed", "200 OK", 1),
        );
        let first = conditions[0].clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        merge_condition(
            &mut conditions,
            create_condition("EndpointHealthy", ConditionStatus::True, "Probed", "200 OK again", 2),
        );

        assert_eq!(conditions[0].last_transition_time, first.last_transition_time);
        assert_eq!(conditions[0].message, "200 OK again");
        assert_eq!(conditions[0].observed_generation, 2);
    }
}
