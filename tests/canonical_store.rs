use proptest::prelude::*;
use scout_nql::canonical::{
    CanonicalStore, CanonicalWatcher, MappingRepository, StaticVocabulary, StoreOptions, UpsertOutcome,
    VocabularySource,
};
use scout_nql::{NqlError, Result};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn memory_store() -> CanonicalStore {
    CanonicalStore::open(
        MappingRepository::in_memory().unwrap(),
        Arc::new(StaticVocabulary::new()),
        StoreOptions::default(),
    )
    .unwrap()
}

fn file_store(path: &std::path::Path) -> CanonicalStore {
    let repo = MappingRepository::open(path, Duration::from_secs(2)).unwrap();
    CanonicalStore::open(repo, Arc::new(StaticVocabulary::new()), StoreOptions::default()).unwrap()
}

#[test]
fn hoolywood_round_trip() {
    let store = memory_store();
    store.promote("area", "hoolywood", "Hollywood", None, None).unwrap();
    let resolved = store.lookup("area", "Hoolywood").unwrap();
    assert_eq!(resolved.value, "Hollywood");
    assert!(resolved.canonicalization_applied);
}

#[test]
fn wildcards_bypass_even_with_a_mapping() {
    let store = memory_store();
    store.promote("weapon", "%firearm%", "FIREARM", None, None).unwrap();
    let resolved = store.lookup("weapon", "%firearm%").unwrap();
    assert!(resolved.like_bypass);
    assert!(!resolved.canonicalization_applied);
}

#[test]
fn repromotion_overwrites_and_bumps_version() {
    let store = memory_store();
    let first = store.promote("area", "noho", "North Hollywood", Some(0.8), None).unwrap();
    let second = store.promote("area", "NoHo", "N Hollywood", Some(0.95), Some("bob")).unwrap();
    assert_eq!(first, UpsertOutcome::Inserted { version: 2 });
    assert_eq!(second, UpsertOutcome::Updated { previous_version: 2, version: 3 });
    assert_eq!(store.lookup("area", "noho").unwrap().value, "N Hollywood");
    assert_eq!(store.snapshot().unwrap().len(), 1);
}

#[test]
fn reload_picks_up_another_writer() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("canonical.db");
    let reader = file_store(&path);
    let writer = file_store(&path);

    writer.promote("area", "hwood", "Hollywood", None, None).unwrap();
    writer.promote("weapon", "gun", "HAND GUN", None, None).unwrap();
    assert_eq!(reader.version().unwrap(), 1);
    assert_eq!(reader.durable_version().unwrap(), 3);

    assert_eq!(reader.reload().unwrap(), 3);
    assert_eq!(reader.lookup("weapon", "GUN").unwrap().value, "HAND GUN");
    // idempotent
    assert_eq!(reader.reload().unwrap(), 3);
}

#[test]
fn promotion_after_another_writer_keeps_their_mappings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("canonical.db");
    let first = file_store(&path);
    let second = file_store(&path);

    second.promote("area", "hwood", "Hollywood", None, None).unwrap();
    let outcome = first.promote("weapon", "gun", "HAND GUN", None, None).unwrap();
    assert_eq!(outcome, UpsertOutcome::Inserted { version: 3 });
    assert_eq!(first.version().unwrap(), 3);

    let resolved = first.lookup("area", "hwood").unwrap();
    assert_eq!(resolved.value, "Hollywood");
    assert!(resolved.canonicalization_applied);
    assert_eq!(first.lookup("weapon", "gun").unwrap().value, "HAND GUN");
    assert_eq!(first.snapshot().unwrap().len(), 2);
}

#[test]
fn readers_never_see_version_go_backwards() {
    let store = memory_store();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let reader = store.clone();
            scope.spawn(move || {
                let mut last = 0;
                for _ in 0..200 {
                    let snapshot = reader.snapshot().unwrap();
                    assert!(snapshot.version() >= last);
                    last = snapshot.version();
                    let _ = reader.lookup("area", "syn-3").unwrap();
                }
            });
        }
        for i in 0..20 {
            store
                .promote("area", &format!("syn-{}", i % 5), &format!("Canonical {}", i), None, None)
                .unwrap();
        }
    });
    assert_eq!(store.version().unwrap(), 21);
    assert_eq!(store.lookup("area", "SYN-4").unwrap().value, "Canonical 19");
}

#[test]
fn search_orders_by_score_and_clamps() {
    let vocabulary = StaticVocabulary::new().with_values("area", ["Hollywood", "North Hollywood", "Harbor"]);
    let store = CanonicalStore::open(
        MappingRepository::in_memory().unwrap(),
        Arc::new(vocabulary),
        StoreOptions::default(),
    )
    .unwrap();
    store.promote("area", "hwood", "Hollywood", None, None).unwrap();

    let results = store.search("area", "holly").unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].candidate, "Hollywood");
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(results.iter().all(|c| (0.0..=1.0).contains(&c.score)));
    assert!(results.iter().all(|c| c.candidate != "Harbor"));
}

struct SlowVocabulary(Duration);

impl VocabularySource for SlowVocabulary {
    fn distinct_values(&self, _dimension: &str, _limit: usize) -> Result<Vec<String>> {
        std::thread::sleep(self.0);
        Ok(vec!["Hollywood".to_string()])
    }
}

#[tokio::test]
async fn slow_vocabulary_surfaces_as_unavailable() {
    let options = StoreOptions { io_timeout: Duration::from_millis(50), ..StoreOptions::default() };
    let store = CanonicalStore::open(
        MappingRepository::in_memory().unwrap(),
        Arc::new(SlowVocabulary(Duration::from_millis(400))),
        options,
    )
    .unwrap();

    let err = store.lookup_with_timeout("area", "hollywod").await.unwrap_err();
    assert!(matches!(err, NqlError::CanonicalStoreUnavailable(_)));

    // a mapping hit never touches the vocabulary
    store.promote("area", "hwood", "Hollywood", None, None).unwrap();
    let resolved = store.lookup_with_timeout("area", "hwood").await.unwrap();
    assert_eq!(resolved.value, "Hollywood");
}

#[tokio::test]
async fn watcher_reloads_only_when_version_advances() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("canonical.db");
    let reader = file_store(&path);
    let writer = file_store(&path);

    let watcher = CanonicalWatcher::spawn(reader.clone(), Duration::from_millis(20));
    writer.promote("area", "hwood", "Hollywood", None, None).unwrap();

    let mut seen = false;
    for _ in 0..100 {
        if reader.version().unwrap() == 2 {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen, "watcher never published version 2");
    assert!(!watcher.refresh_now().await.unwrap());
    watcher.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn promotion_is_monotonic(ops in prop::collection::vec((0usize..3, 0usize..4, "[A-Z][a-z]{2,8}"), 1..15)) {
        let store = memory_store();
        let dims = ["area", "weapon", "premise"];
        let mut last = store.version().unwrap();
        let mut latest = std::collections::HashMap::new();
        for (dim, syn, canonical) in &ops {
            let synonym = format!("syn{}", syn);
            let outcome = store.promote(dims[*dim], &synonym, canonical, None, None).unwrap();
            prop_assert!(outcome.version() > last);
            last = outcome.version();
            prop_assert_eq!(store.version().unwrap(), last);
            latest.insert((dims[*dim], synonym), canonical.clone());
        }
        prop_assert_eq!(last, 1 + ops.len() as i64);
        for ((dim, synonym), canonical) in latest {
            let resolved = store.lookup(dim, &synonym.to_uppercase()).unwrap();
            prop_assert_eq!(resolved.value, canonical);
        }
    }
}
