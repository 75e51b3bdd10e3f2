use canonry::core::config::GovernanceConfig;
use canonry::core::error::CanonryError;
use canonry::core::model::{CanonStage, LedgerPayload, PromotionTests, VoteChoice};
use canonry::core::store::Store;
use canonry::core::time::ManualClock;
use canonry::plugins::ledger;
use canonry::plugins::promotion::{
    GuardedPromotion, PromotionOutcome, advance, advance_with_tests, document, document_text,
    promote_guarded, propose, revoke, rollback, snapshot, state,
};
use canonry::plugins::quorum::record_vote;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = Store::open_with(
        tmp.path(),
        GovernanceConfig::default(),
        Arc::new(ManualClock::new(42)),
    )
    .unwrap();
    (tmp, store)
}

fn to_candidate(store: &Store, rule: &str) {
    propose(store, rule).unwrap();
    let outcome = advance(store, rule).unwrap();
    assert_eq!(outcome.state().state, CanonStage::Candidate);
}

fn to_stable(store: &Store, rule: &str) {
    to_candidate(store, rule);
    record_vote(store, "a1", rule, VoteChoice::Approve).unwrap();
    record_vote(store, "a2", rule, VoteChoice::Approve).unwrap();
    let outcome = advance(store, rule).unwrap();
    assert_eq!(outcome.state().state, CanonStage::Stable);
}

#[test]
fn test_fresh_document_is_empty_object() {
    let (_tmp, store) = test_store();
    assert_eq!(document_text(&store).unwrap(), "{}");
    assert!(state(&store, "rule-x").unwrap().is_none());
}

#[test]
fn test_propose_is_idempotent_only_in_draft() {
    let (_tmp, store) = test_store();
    let s = propose(&store, "rule-x").unwrap();
    assert_eq!(s.state, CanonStage::Draft);
    assert_eq!(propose(&store, "rule-x").unwrap().state, CanonStage::Draft);

    advance(&store, "rule-x").unwrap();
    assert!(matches!(
        propose(&store, "rule-x"),
        Err(CanonryError::ValidationError(_))
    ));
}

#[test]
fn test_two_of_three_approvals_promote() {
    let (_tmp, store) = test_store();
    to_stable(&store, "rule-x");
    assert_eq!(document_text(&store).unwrap(), r#"{"rule-x":"STABLE"}"#);
}

#[test]
fn test_single_approval_leaves_state_unchanged() {
    let (_tmp, store) = test_store();
    to_candidate(&store, "rule-x");
    record_vote(&store, "a1", "rule-x", VoteChoice::Approve).unwrap();
    let ledger_len = ledger::list(&store).unwrap().len();

    match advance(&store, "rule-x").unwrap() {
        PromotionOutcome::QuorumNotMet { state, tally } => {
            assert_eq!(state.state, CanonStage::Candidate);
            assert_eq!(tally.counted_approvals, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        state(&store, "rule-x").unwrap().unwrap().state,
        CanonStage::Candidate
    );
    assert_eq!(ledger::list(&store).unwrap().len(), ledger_len);
}

#[test]
fn test_stable_has_no_forward_transition() {
    let (_tmp, store) = test_store();
    to_stable(&store, "rule-x");
    assert!(matches!(
        advance(&store, "rule-x"),
        Err(CanonryError::ValidationError(_))
    ));
    assert!(matches!(
        advance(&store, "unknown"),
        Err(CanonryError::NotFound(_))
    ));
}

#[test]
fn test_rollback_restores_snapshot_exactly() {
    let (_tmp, store) = test_store();
    to_stable(&store, "ruleX");
    let snap = snapshot(&store, "ruleX").unwrap();
    let head_at_snapshot = ledger::head(&store).unwrap().unwrap().sequence;
    assert_eq!(snap.ledger_head, Some(head_at_snapshot));

    revoke(&store, "ruleX").unwrap();
    propose(&store, "ruleY").unwrap();
    assert_eq!(
        document_text(&store).unwrap(),
        r#"{"ruleX":"ROLLED_BACK","ruleY":"DRAFT"}"#
    );

    let result = rollback(&store, "ruleX").unwrap();
    assert_eq!(document_text(&store).unwrap(), r#"{"ruleX":"STABLE"}"#);
    assert_eq!(result.document.get("ruleX"), Some(&CanonStage::Stable));
    assert_eq!(result.snapshot.snapshot_id, snap.snapshot_id);
    assert_eq!(result.ledger_view.len() as u64, head_at_snapshot + 1);

    // History is never truncated; the rollback itself is recorded.
    let entries = ledger::list(&store).unwrap();
    assert!(matches!(
        entries.last().map(|e| &e.payload),
        Some(LedgerPayload::Rollback(r)) if r.snapshot_id == snap.snapshot_id
    ));
    assert!(ledger::verify(&store).unwrap().valid);
}

#[test]
fn test_rollback_without_snapshot_changes_nothing() {
    let (_tmp, store) = test_store();
    to_stable(&store, "ruleX");
    let before = document_text(&store).unwrap();
    let ledger_len = ledger::list(&store).unwrap().len();

    assert!(matches!(
        rollback(&store, "ruleX"),
        Err(CanonryError::RollbackUnavailable(_))
    ));
    assert_eq!(document_text(&store).unwrap(), before);
    assert_eq!(ledger::list(&store).unwrap().len(), ledger_len);
}

#[test]
fn test_rollback_of_draft_or_unknown_rule_is_rejected() {
    let (_tmp, store) = test_store();
    propose(&store, "draft").unwrap();
    assert!(matches!(
        rollback(&store, "draft"),
        Err(CanonryError::ValidationError(_))
    ));
    assert!(matches!(
        rollback(&store, "missing"),
        Err(CanonryError::NotFound(_))
    ));
}

#[test]
fn test_revoke_only_from_candidate_or_stable() {
    let (_tmp, store) = test_store();
    propose(&store, "r").unwrap();
    assert!(revoke(&store, "r").is_err());
    advance(&store, "r").unwrap();
    assert_eq!(revoke(&store, "r").unwrap().state, CanonStage::RolledBack);
    assert!(revoke(&store, "r").is_err());
}

#[test]
fn test_guarded_promotion_rolls_back_on_failed_check() {
    let (_tmp, store) = test_store();
    to_candidate(&store, "rule-x");
    record_vote(&store, "a1", "rule-x", VoteChoice::Approve).unwrap();
    record_vote(&store, "a2", "rule-x", VoteChoice::Approve).unwrap();
    let before = document_text(&store).unwrap();

    let result = promote_guarded(&store, "rule-x", |outcome| {
        assert_eq!(outcome.state().state, CanonStage::Stable);
        Err("post-promotion invariant failed".to_string())
    })
    .unwrap();

    match result {
        GuardedPromotion::RolledBack { reason, rollback } => {
            assert_eq!(reason, "post-promotion invariant failed");
            assert_eq!(rollback.document.get("rule-x"), Some(&CanonStage::Candidate));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(document_text(&store).unwrap(), before);
}

#[test]
fn test_guarded_promotion_keeps_passing_result() {
    let (_tmp, store) = test_store();
    to_candidate(&store, "rule-x");
    record_vote(&store, "a1", "rule-x", VoteChoice::Approve).unwrap();
    record_vote(&store, "a2", "rule-x", VoteChoice::Approve).unwrap();

    let result = promote_guarded(&store, "rule-x", |_| Ok(())).unwrap();
    assert!(matches!(result, GuardedPromotion::Promoted { .. }));
    assert_eq!(
        document(&store).unwrap().get("rule-x"),
        Some(&CanonStage::Stable)
    );
}

#[test]
fn test_concurrent_promotions_of_different_rules_keep_both() {
    let (_tmp, store) = test_store();
    let handles: Vec<_> = ["r1", "r2", "r3", "r4"]
        .into_iter()
        .map(|rule| {
            let store = store.clone();
            thread::spawn(move || {
                propose(&store, rule).unwrap();
                advance(&store, rule).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let doc = document(&store).unwrap();
    assert_eq!(doc.len(), 4);
    assert!(doc.values().all(|s| *s == CanonStage::Candidate));
}

fn passing_tests() -> PromotionTests {
    PromotionTests {
        resistance: true,
        reproducible: true,
        invariant_safe: true,
        feasibility_impact: true,
        evidence_refs: vec!["run-1".to_string()],
    }
}

#[test]
fn test_failing_promotion_test_keeps_rule_candidate() {
    let (_tmp, store) = test_store();
    to_candidate(&store, "rule-x");
    record_vote(&store, "a1", "rule-x", VoteChoice::Approve).unwrap();
    record_vote(&store, "a2", "rule-x", VoteChoice::Approve).unwrap();
    let ledger_len = ledger::list(&store).unwrap().len();

    let tests = PromotionTests {
        reproducible: false,
        ..passing_tests()
    };
    match advance_with_tests(&store, "rule-x", &tests).unwrap() {
        PromotionOutcome::TestsFailed { state, failed, .. } => {
            assert_eq!(state.state, CanonStage::Candidate);
            assert_eq!(failed, vec!["reproducible".to_string()]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        state(&store, "rule-x").unwrap().unwrap().state,
        CanonStage::Candidate
    );
    assert_eq!(ledger::list(&store).unwrap().len(), ledger_len);
}

#[test]
fn test_passing_promotion_tests_are_ledgered_with_the_step() {
    let (_tmp, store) = test_store();
    to_candidate(&store, "rule-x");
    record_vote(&store, "a1", "rule-x", VoteChoice::Approve).unwrap();
    record_vote(&store, "a2", "rule-x", VoteChoice::Approve).unwrap();

    let outcome = advance_with_tests(&store, "rule-x", &passing_tests()).unwrap();
    assert!(matches!(outcome, PromotionOutcome::Advanced { .. }));

    let entries = ledger::list(&store).unwrap();
    let Some(LedgerPayload::Promotion(record)) = entries.last().map(|e| &e.payload) else {
        panic!("expected a promotion entry last");
    };
    assert_eq!(record.to, CanonStage::Stable);
    assert_eq!(record.tests, Some(passing_tests()));
    assert!(ledger::verify(&store).unwrap().valid);
}

#[test]
fn test_passing_tests_still_need_quorum() {
    let (_tmp, store) = test_store();
    to_candidate(&store, "rule-x");
    assert!(matches!(
        advance_with_tests(&store, "rule-x", &passing_tests()).unwrap(),
        PromotionOutcome::QuorumNotMet { .. }
    ));
}
