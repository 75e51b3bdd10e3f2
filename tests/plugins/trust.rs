use canonry::core::config::{GovernanceConfig, TrustPolicy};
use canonry::core::error::CanonryError;
use canonry::core::model::{Failure, LedgerPayload};
use canonry::core::store::Store;
use canonry::core::time::ManualClock;
use canonry::plugins::ledger;
use canonry::plugins::trust::{TrustWorker, apply_failures, score, scores};
use std::sync::Arc;
use tempfile::tempdir;

fn store_with(config: GovernanceConfig) -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store =
        Store::open_with(tmp.path(), config, Arc::new(ManualClock::new(9))).unwrap();
    (tmp, store)
}

fn test_store() -> (tempfile::TempDir, Store) {
    store_with(GovernanceConfig::default())
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn test_unknown_agent_has_initial_score() {
    let (_tmp, store) = test_store();
    assert!(close(score(&store, "nobody").unwrap(), 1.0));
    assert!(scores(&store).unwrap().is_empty());
}

#[test]
fn test_each_failure_lowers_score_by_penalty() {
    let (_tmp, store) = test_store();
    let updated = apply_failures(
        &store,
        &[Failure::new("a", "denied"), Failure::new("a", "denied"), Failure::new("b", "x")],
    )
    .unwrap();
    assert_eq!(updated.len(), 2);
    assert!(close(score(&store, "a").unwrap(), 0.8));
    assert!(close(score(&store, "b").unwrap(), 0.9));

    let trust_entries = ledger::list(&store)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.payload, LedgerPayload::Trust(_)))
        .count();
    assert_eq!(trust_entries, 3);
}

#[test]
fn test_score_is_floored_at_zero() {
    let config = GovernanceConfig {
        trust: TrustPolicy {
            penalty: 0.4,
            initial: 1.0,
        },
        ..GovernanceConfig::default()
    };
    let (_tmp, store) = store_with(config);
    let failures: Vec<Failure> = (0..5).map(|_| Failure::new("a", "boom")).collect();
    apply_failures(&store, &failures).unwrap();
    assert!(close(score(&store, "a").unwrap(), 0.0));
}

#[test]
fn test_batch_with_missing_agent_applies_nothing() {
    let (_tmp, store) = test_store();
    let err = apply_failures(&store, &[Failure::new("a", "x"), Failure::new("", "x")]).unwrap_err();
    assert!(matches!(err, CanonryError::ValidationError(_)));
    assert!(close(score(&store, "a").unwrap(), 1.0));
}

#[test]
fn test_worker_drains_queue_on_shutdown() {
    let (_tmp, store) = test_store();
    let worker = TrustWorker::spawn(store.clone());
    for _ in 0..3 {
        worker.submit(Failure::new("a", "denied")).unwrap();
    }
    let sender = worker.sender().unwrap();
    sender.send(Failure::new("b", "denied")).unwrap();
    drop(sender);

    let report = worker.shutdown().unwrap();
    assert_eq!(report.applied, 4);
    assert_eq!(report.failed_batches, 0);
    assert!(close(score(&store, "a").unwrap(), 0.7));
    assert!(close(score(&store, "b").unwrap(), 0.9));
}

#[test]
fn test_worker_keeps_valid_failures_batched_with_invalid_one() {
    let (_tmp, store) = test_store();
    let worker = TrustWorker::spawn(store.clone());
    let sender = worker.sender().unwrap();
    for _ in 0..5 {
        sender.send(Failure::new("good", "denied")).unwrap();
    }
    sender.send(Failure::new("", "no agent")).unwrap();
    for _ in 0..5 {
        sender.send(Failure::new("good", "denied")).unwrap();
    }
    drop(sender);

    let report = worker.shutdown().unwrap();
    assert_eq!(report.applied, 10);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.failed_batches, 0);
    assert!(close(score(&store, "good").unwrap(), 0.0));
}

#[test]
fn test_worker_submit_rejects_missing_agent() {
    let (_tmp, store) = test_store();
    let worker = TrustWorker::spawn(store.clone());
    assert!(matches!(
        worker.submit(Failure::new(" ", "x")),
        Err(CanonryError::ValidationError(_))
    ));
    let report = worker.shutdown().unwrap();
    assert_eq!(report, canonry::plugins::trust::WorkerReport::default());
}
