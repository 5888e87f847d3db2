//! Reputation tracker behaviour across many updates

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use tessera_core::NodeId;
use tessera_overlay::{AuditHistoryConfig, AuditOutcome, ReputationConfig, ReputationTracker};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn outcome_strategy() -> impl Strategy<Value = AuditOutcome> {
    prop_oneof![
        Just(AuditOutcome::Success),
        Just(AuditOutcome::Failure),
        Just(AuditOutcome::Unknown),
        Just(AuditOutcome::Offline),
    ]
}

fn replay(node: NodeId, outcomes: &[(AuditOutcome, i64)]) -> tessera_overlay::NodeReputation {
    let tracker = ReputationTracker::new(ReputationConfig::default()).unwrap();
    let history = AuditHistoryConfig::default();
    let mut last = None;
    for (outcome, offset_secs) in outcomes {
        let now = start() + TimeDelta::seconds(*offset_secs);
        last = Some(tracker.update(node, *outcome, now, &history).unwrap().0);
    }
    last.unwrap_or_else(|| tracker.get(&node).unwrap())
}

proptest! {
    #[test]
    fn prop_replay_is_deterministic(
        steps in proptest::collection::vec((outcome_strategy(), 0i64..3600), 1..200),
    ) {
        let node = NodeId::random();
        let mut elapsed = 0;
        let timeline: Vec<(AuditOutcome, i64)> = steps
            .into_iter()
            .map(|(outcome, gap)| {
                elapsed += gap;
                (outcome, elapsed)
            })
            .collect();

        let first = replay(node, &timeline);
        let second = replay(node, &timeline);
        prop_assert_eq!(first.audit_score(), second.audit_score());
        prop_assert_eq!(first.unknown_audit_score(), second.unknown_audit_score());
        prop_assert_eq!(first.online_score(), second.online_score());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_scores_stay_in_unit_interval(
        outcomes in proptest::collection::vec(outcome_strategy(), 1..300),
    ) {
        let timeline: Vec<(AuditOutcome, i64)> = outcomes
            .into_iter()
            .enumerate()
            .map(|(i, o)| (o, i as i64 * 600))
            .collect();
        let record = replay(NodeId::random(), &timeline);
        prop_assert!((0.0..=1.0).contains(&record.audit_score()));
        prop_assert!((0.0..=1.0).contains(&record.unknown_audit_score()));
        prop_assert!((0.0..=1.0).contains(&record.online_score()));
        prop_assert_eq!(record.total_audit_count, timeline.len() as u64);
    }
}

#[test]
fn test_concurrent_updates_are_not_lost() {
    let tracker = Arc::new(ReputationTracker::new(ReputationConfig::default()).unwrap());
    let nodes: Vec<NodeId> = (0..4).map(|_| NodeId::random()).collect();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let tracker = tracker.clone();
            let nodes = nodes.clone();
            std::thread::spawn(move || {
                let history = AuditHistoryConfig::default();
                for i in 0..250 {
                    let node = nodes[(t + i) % nodes.len()];
                    tracker
                        .update(node, AuditOutcome::Success, Utc::now(), &history)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: u64 = nodes
        .iter()
        .map(|n| tracker.get(n).unwrap().audit_success_count)
        .sum();
    assert_eq!(total, 8 * 250);
    assert_eq!(tracker.len(), 4);
}
