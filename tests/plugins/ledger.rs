use canonry::core::config::GovernanceConfig;
use canonry::core::db::governance_db_path;
use canonry::core::error::CanonryError;
use canonry::core::model::{LedgerPayload, TrustRecord, Vote, VoteChoice};
use canonry::core::schemas::GENESIS_HASH;
use canonry::core::store::Store;
use canonry::core::time::ManualClock;
use canonry::plugins::ledger::{
    append, export_jsonl, head, list, read_jsonl, verify, verify_entries, verify_strict, view,
};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = Store::open_with(
        tmp.path().join("state"),
        GovernanceConfig::default(),
        Arc::new(ManualClock::new(1_000)),
    )
    .unwrap();
    (tmp, store)
}

fn vote_payload(agent: &str) -> LedgerPayload {
    LedgerPayload::Vote(Vote {
        agent_id: agent.to_string(),
        proposal_id: "rule-x".to_string(),
        choice: VoteChoice::Approve,
        timestamp: 1_000,
    })
}

#[test]
fn test_sequences_start_at_zero_and_chain() {
    let (_tmp, store) = test_store();
    let e0 = append(&store, &vote_payload("a")).unwrap();
    let e1 = append(&store, &vote_payload("b")).unwrap();
    let e2 = append(&store, &vote_payload("c")).unwrap();

    assert_eq!((e0.sequence, e1.sequence, e2.sequence), (0, 1, 2));
    assert_eq!(e0.previous_hash, GENESIS_HASH);
    assert_eq!(e1.previous_hash, e0.current_hash);
    assert_eq!(e2.previous_hash, e1.current_hash);
    assert_eq!(e0.timestamp, 1_000);

    let all = list(&store).unwrap();
    assert_eq!(all, vec![e0, e1, e2]);
}

#[test]
fn test_empty_ledger_verifies() {
    let (_tmp, store) = test_store();
    let result = verify(&store).unwrap();
    assert!(result.valid);
    assert_eq!(result.length, 0);
    assert!(head(&store).unwrap().is_none());
}

#[test]
fn test_tampered_payload_is_detected_at_its_index() {
    let (_tmp, store) = test_store();
    for agent in ["a", "b", "c"] {
        append(&store, &vote_payload(agent)).unwrap();
    }
    assert!(verify(&store).unwrap().valid);

    let conn = rusqlite::Connection::open(governance_db_path(store.root())).unwrap();
    conn.execute(
        "UPDATE ledger_entries SET payload = replace(payload, '\"a\"', '\"z\"') WHERE sequence = 0",
        [],
    )
    .unwrap();

    let result = verify(&store).unwrap();
    assert!(!result.valid);
    assert_eq!(result.first_bad_index, Some(0));

    match verify_strict(&store) {
        Err(CanonryError::LedgerTamperDetected { index }) => assert_eq!(index, 0),
        other => panic!("expected tamper error, got {:?}", other),
    }
}

#[test]
fn test_deleted_middle_entry_breaks_the_chain() {
    let (_tmp, store) = test_store();
    for agent in ["a", "b", "c"] {
        append(&store, &vote_payload(agent)).unwrap();
    }
    let conn = rusqlite::Connection::open(governance_db_path(store.root())).unwrap();
    conn.execute("DELETE FROM ledger_entries WHERE sequence = 1", [])
        .unwrap();
    assert_eq!(verify(&store).unwrap().first_bad_index, Some(1));
}

#[test]
fn test_identical_payloads_on_fresh_ledgers_hash_identically() {
    let (_t1, s1) = test_store();
    let (_t2, s2) = test_store();
    let a = append(&s1, &vote_payload("a")).unwrap();
    let b = append(&s2, &vote_payload("a")).unwrap();
    assert_eq!(a.current_hash, b.current_hash);
    assert_eq!(a.current_hash.len(), 64);
}

#[test]
fn test_view_returns_prefix() {
    let (_tmp, store) = test_store();
    for agent in ["a", "b", "c", "d"] {
        append(&store, &vote_payload(agent)).unwrap();
    }
    let prefix = view(&store, 1).unwrap();
    assert_eq!(prefix.len(), 2);
    assert_eq!(prefix[1].sequence, 1);
    assert_eq!(head(&store).unwrap().unwrap().sequence, 3);
}

#[test]
fn test_export_round_trip_verifies_offline() {
    let (tmp, store) = test_store();
    for agent in ["a", "b"] {
        append(&store, &vote_payload(agent)).unwrap();
    }
    let out = tmp.path().join("export/ledger.jsonl");
    assert_eq!(export_jsonl(&store, &out).unwrap(), 2);

    let text = std::fs::read_to_string(&out).unwrap();
    let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first["sequence"], 0);
    assert_eq!(first["previousHash"], GENESIS_HASH);
    assert_eq!(first["payload"]["kind"], "vote");

    let mut entries = read_jsonl(&out).unwrap();
    assert!(verify_entries(&entries).unwrap().valid);

    if let LedgerPayload::Vote(v) = &mut entries[1].payload {
        v.choice = VoteChoice::Reject;
    }
    let result = verify_entries(&entries).unwrap();
    assert_eq!(result.first_bad_index, Some(1));
}

#[test]
fn test_concurrent_appends_stay_contiguous() {
    let (_tmp, store) = test_store();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    append(&store, &vote_payload(&format!("agent-{}-{}", t, i))).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let entries = list(&store).unwrap();
    assert_eq!(entries.len(), 40);
    for (i, e) in entries.iter().enumerate() {
        assert_eq!(e.sequence, i as u64);
    }
    assert!(verify(&store).unwrap().valid);
}

#[test]
fn test_non_finite_record_is_refused_and_ledger_stays_readable() {
    let (_tmp, store) = test_store();
    append(&store, &vote_payload("a")).unwrap();
    for score in [f64::INFINITY, f64::NAN] {
        let err = append(
            &store,
            &LedgerPayload::Trust(TrustRecord {
                agent_id: "a".to_string(),
                score,
                reason: "overflow".to_string(),
                timestamp: 1_000,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, CanonryError::ValidationError(_)));
    }
    assert_eq!(list(&store).unwrap().len(), 1);
    assert_eq!(head(&store).unwrap().unwrap().sequence, 0);
    assert!(verify(&store).unwrap().valid);
}
