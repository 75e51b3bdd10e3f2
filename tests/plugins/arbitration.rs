use canonry::core::config::{ArbitrationConfig, GovernanceConfig};
use canonry::core::error::CanonryError;
use canonry::core::model::{Failure, LedgerPayload};
use canonry::core::store::Store;
use canonry::core::time::ManualClock;
use canonry::plugins::arbitration::{
    Arbitrator, Resolution, current_lock, declare_scopes, detect_conflicts,
};
use canonry::plugins::{ledger, trust};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn store_with(config: GovernanceConfig) -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store =
        Store::open_with(tmp.path(), config, Arc::new(ManualClock::new(7_000))).unwrap();
    (tmp, store)
}

fn test_store() -> (tempfile::TempDir, Store) {
    store_with(GovernanceConfig::default())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_detect_conflicts_by_declared_scope() {
    let (_tmp, store) = test_store();
    declare_scopes(&store, "pkg-a", &strings(&["src/db", "docs"])).unwrap();
    declare_scopes(&store, "pkg-b", &strings(&["src/db"])).unwrap();
    declare_scopes(&store, "pkg-c", &strings(&["web"])).unwrap();

    let conflicts = detect_conflicts(&store, &strings(&["src/db"])).unwrap();
    let expected: BTreeSet<String> = strings(&["pkg-a", "pkg-b"]).into_iter().collect();
    assert_eq!(conflicts, expected);

    assert!(detect_conflicts(&store, &strings(&["nobody"])).unwrap().is_empty());
}

#[test]
fn test_invalid_scope_is_rejected() {
    let (_tmp, store) = test_store();
    let err = declare_scopes(&store, "pkg-a", &strings(&["bad scope"])).unwrap_err();
    assert!(matches!(err, CanonryError::ValidationError(_)));
}

#[test]
fn test_resolve_overwrites_lock_and_ledgers_it() {
    let (_tmp, store) = test_store();
    declare_scopes(&store, "pkg-a", &strings(&["src/db"])).unwrap();
    declare_scopes(&store, "pkg-b", &strings(&["src/db"])).unwrap();

    let first = Arbitrator::with_priority(&store, &strings(&["pkg-a", "pkg-b"]))
        .resolve("src/db", &strings(&["src/db"]))
        .unwrap();
    assert_eq!(first.winner(), Some("pkg-a"));

    let second = Arbitrator::with_priority(&store, &strings(&["pkg-b", "pkg-a"]))
        .resolve("src/db", &strings(&["src/db"]))
        .unwrap();
    assert_eq!(second.winner(), Some("pkg-b"));

    let lock = current_lock(&store, "src/db").unwrap().unwrap();
    assert_eq!(lock.owner, "pkg-b");
    assert_eq!(lock.timestamp, 7_000);

    let entries = ledger::list(&store).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(matches!(&entries[1].payload, LedgerPayload::Arbitration(l) if l.owner == "pkg-b"));
}

#[test]
fn test_single_writer_is_uncontested() {
    let (_tmp, store) = test_store();
    declare_scopes(&store, "pkg-a", &strings(&["src/db"])).unwrap();
    let resolution = Arbitrator::new(&store)
        .resolve("src/db", &strings(&["src/db"]))
        .unwrap();
    assert!(matches!(resolution, Resolution::Uncontested { .. }));
    assert!(current_lock(&store, "src/db").unwrap().is_none());
    assert!(ledger::list(&store).unwrap().is_empty());
}

#[test]
fn test_unranked_conflict_has_no_winner() {
    let (_tmp, store) = test_store();
    declare_scopes(&store, "pkg-a", &strings(&["s"])).unwrap();
    declare_scopes(&store, "pkg-b", &strings(&["s"])).unwrap();
    let err = Arbitrator::with_priority(&store, &strings(&["pkg-z"]))
        .resolve("s", &strings(&["s"]))
        .unwrap_err();
    match err {
        CanonryError::NoArbitrationWinner(agents) => {
            assert_eq!(agents, strings(&["pkg-a", "pkg-b"]))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(ledger::list(&store).unwrap().is_empty());
}

#[test]
fn test_configured_tiers_use_trust_inside_tier() {
    let config = GovernanceConfig {
        arbitration: ArbitrationConfig {
            tiers: vec![strings(&["lead"]), strings(&["pkg-b", "pkg-c"])],
        },
        ..GovernanceConfig::default()
    };
    let (_tmp, store) = store_with(config);
    for agent in ["pkg-b", "pkg-c", "lead"] {
        declare_scopes(&store, agent, &strings(&["s"])).unwrap();
    }
    trust::apply_failures(&store, &[Failure::new("pkg-b", "flaky")]).unwrap();
    trust::apply_failures(&store, &[Failure::new("lead", "flaky")]).unwrap();

    // lead outranks regardless of its lower trust.
    let r = Arbitrator::new(&store).resolve("s", &strings(&["s"])).unwrap();
    assert_eq!(r.winner(), Some("lead"));

    // Without lead, the more trusted member of the second tier wins.
    let conn = rusqlite::Connection::open(canonry::core::db::governance_db_path(store.root()))
        .unwrap();
    conn.execute("DELETE FROM write_scopes WHERE agent_id = 'lead'", [])
        .unwrap();
    let r = Arbitrator::new(&store).resolve("s", &strings(&["s"])).unwrap();
    assert_eq!(r.winner(), Some("pkg-c"));
}

#[test]
fn test_disjoint_scopes_resolve_concurrently() {
    let (_tmp, store) = test_store();
    for i in 0..4 {
        let scope = format!("scope-{}", i);
        declare_scopes(&store, "pkg-a", std::slice::from_ref(&scope)).unwrap();
        declare_scopes(&store, "pkg-b", std::slice::from_ref(&scope)).unwrap();
    }
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let scope = format!("scope-{}", i);
                Arbitrator::with_priority(&store, &strings(&["pkg-b", "pkg-a"]))
                    .resolve(&scope, std::slice::from_ref(&scope))
                    .unwrap()
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap().winner(), Some("pkg-b"));
    }
    assert_eq!(ledger::list(&store).unwrap().len(), 4);
    assert!(ledger::verify(&store).unwrap().valid);
}

#[test]
fn test_resolve_each_is_all_or_nothing() {
    let (_tmp, store) = test_store();
    declare_scopes(&store, "pkg-a", &strings(&["a"])).unwrap();
    declare_scopes(&store, "pkg-b", &strings(&["a"])).unwrap();
    declare_scopes(&store, "x", &strings(&["b"])).unwrap();
    declare_scopes(&store, "y", &strings(&["b"])).unwrap();
    let arbitrator = Arbitrator::with_priority(&store, &strings(&["pkg-a", "pkg-b"]));

    let err = arbitrator.resolve_each(&strings(&["a", "b"])).unwrap_err();
    assert!(matches!(err, CanonryError::NoArbitrationWinner(_)));
    assert!(current_lock(&store, "a").unwrap().is_none());
    assert!(ledger::list(&store).unwrap().is_empty());

    let resolutions = arbitrator.resolve_each(&strings(&["a", "docs"])).unwrap();
    assert_eq!(resolutions.len(), 2);
    assert_eq!(resolutions[0].winner(), Some("pkg-a"));
    assert!(matches!(resolutions[1], Resolution::Uncontested { .. }));
    assert_eq!(ledger::list(&store).unwrap().len(), 1);
}
