use canonry::core::config::{GovernanceConfig, LedgerConfig, QuorumPolicy};
use canonry::core::error::CanonryError;
use canonry::core::model::{LedgerPayload, VoteChoice};
use canonry::core::store::Store;
use canonry::core::time::ManualClock;
use canonry::plugins::ledger;
use canonry::plugins::quorum::{parse_choice, record_vote, tally, votes};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn store_with(config: GovernanceConfig) -> (tempfile::TempDir, Store, Arc<ManualClock>) {
    let tmp = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(100));
    let store = Store::open_with(tmp.path(), config, clock.clone()).unwrap();
    (tmp, store, clock)
}

fn test_store() -> (tempfile::TempDir, Store, Arc<ManualClock>) {
    store_with(GovernanceConfig::default())
}

#[test]
fn test_later_vote_replaces_earlier() {
    let (_tmp, store, clock) = test_store();
    record_vote(&store, "a1", "rule-x", VoteChoice::Approve).unwrap();
    clock.advance(10);
    record_vote(&store, "a1", "rule-x", VoteChoice::Reject).unwrap();

    let live = votes(&store, "rule-x").unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].choice, VoteChoice::Reject);
    assert_eq!(live[0].timestamp, 110);

    // The ledger keeps both casts.
    let history: Vec<_> = ledger::list(&store)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.payload, LedgerPayload::Vote(_)))
        .collect();
    assert_eq!(history.len(), 2);
}

#[test]
fn test_votes_not_ledgered_when_disabled() {
    let config = GovernanceConfig {
        ledger: LedgerConfig {
            record_votes: false,
        },
        ..GovernanceConfig::default()
    };
    let (_tmp, store, _clock) = store_with(config);
    record_vote(&store, "a1", "p", VoteChoice::Approve).unwrap();
    assert_eq!(votes(&store, "p").unwrap().len(), 1);
    assert!(ledger::list(&store).unwrap().is_empty());
}

#[test]
fn test_invalid_votes_are_rejected() {
    let (_tmp, store, _clock) = test_store();
    assert!(matches!(
        record_vote(&store, "", "p", VoteChoice::Approve),
        Err(CanonryError::InvalidVote(_))
    ));
    assert!(matches!(
        record_vote(&store, "a1", " ", VoteChoice::Approve),
        Err(CanonryError::InvalidVote(_))
    ));
    assert!(matches!(parse_choice(None), Err(CanonryError::InvalidVote(_))));
    assert!(matches!(
        parse_choice(Some("yes")),
        Err(CanonryError::InvalidVote(_))
    ));
    assert!(votes(&store, "p").unwrap().is_empty());
}

#[test]
fn test_tally_counts_live_votes() {
    let (_tmp, store, _clock) = test_store();
    record_vote(&store, "a1", "p", VoteChoice::Approve).unwrap();
    let t = tally(&store, "p").unwrap();
    assert_eq!((t.approve, t.reject, t.met), (1, 0, false));

    record_vote(&store, "a2", "p", VoteChoice::Approve).unwrap();
    record_vote(&store, "a3", "p", VoteChoice::Reject).unwrap();
    let t = tally(&store, "p").unwrap();
    assert_eq!((t.approve, t.reject, t.met), (2, 1, true));
}

#[test]
fn test_eligible_list_limits_counted_approvals() {
    let config = GovernanceConfig {
        quorum: QuorumPolicy {
            required: 2,
            of: 3,
            eligible: ["a1", "a2", "a3"].iter().map(|s| s.to_string()).collect(),
        },
        ..GovernanceConfig::default()
    };
    let (_tmp, store, _clock) = store_with(config);
    record_vote(&store, "a1", "p", VoteChoice::Approve).unwrap();
    record_vote(&store, "outsider", "p", VoteChoice::Approve).unwrap();
    let t = tally(&store, "p").unwrap();
    assert_eq!(t.approve, 2);
    assert_eq!(t.counted_approvals, 1);
    assert!(!t.met);
}

#[test]
fn test_concurrent_votes_do_not_conflict() {
    let (_tmp, store, _clock) = test_store();
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                record_vote(&store, &format!("agent-{}", i), "p", VoteChoice::Approve).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(votes(&store, "p").unwrap().len(), 6);
    assert!(ledger::verify(&store).unwrap().valid);
}
