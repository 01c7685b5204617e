//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use oplog_sync::database::MemoryDatabase;
use oplog_sync::oplog::{parse_entry, Timestamp, UpdateDelta};
use oplog_sync::replicator::apply_entry;
use oplog_sync::{DestinationDatabase, Document, Namespace};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

// =============================================================================
// Timestamp Properties
// =============================================================================

proptest! {
    /// Timestamps order like `(time, increment)` tuples.
    #[test]
    fn timestamp_order_matches_tuple_order(
        t1 in any::<u32>(), i1 in any::<u32>(),
        t2 in any::<u32>(), i2 in any::<u32>(),
    ) {
        let a = Timestamp::new(t1, i1);
        let b = Timestamp::new(t2, i2);
        prop_assert_eq!(a.cmp(&b), (t1, i1).cmp(&(t2, i2)));
    }

    /// Display output parses back to the same timestamp.
    #[test]
    fn timestamp_display_parses_back(time in any::<u32>(), increment in any::<u32>()) {
        let ts = Timestamp::new(time, increment);
        let parsed: Timestamp = ts.to_string().parse().unwrap();
        prop_assert_eq!(parsed, ts);
    }

    /// The JSON form carries the same position.
    #[test]
    fn timestamp_value_form_preserves_position(time in any::<u32>(), increment in any::<u32>()) {
        let ts = Timestamp::new(time, increment);
        prop_assert_eq!(Timestamp::from_value(&ts.to_value()), Some(ts));
    }

    /// The next write's timestamp is strictly later, whatever the clock says.
    #[test]
    fn successor_is_strictly_greater(
        time in 0u32..u32::MAX,
        increment in any::<u32>(),
        now in any::<u32>(),
    ) {
        let ts = Timestamp::new(time, increment);
        prop_assert!(ts.successor(now) > ts);
    }

    /// Lag never underflows for positions ahead of the clock.
    #[test]
    fn lag_is_zero_when_ahead((time, now) in (1u32..u32::MAX).prop_flat_map(|t| (Just(t), 0..t))) {
        prop_assert_eq!(Timestamp::new(time, 0).lag_secs(i64::from(now)), 0);
    }

    /// Garbage never panics the parser.
    #[test]
    fn timestamp_parse_no_panic(s in ".*") {
        let _ = s.parse::<Timestamp>();
    }
}

// =============================================================================
// Namespace Properties
// =============================================================================

proptest! {
    /// Parsing splits at the first dot and round-trips through Display.
    #[test]
    fn namespace_parse_round_trip(db in "[a-z][a-z0-9_]{0,15}", coll in "[a-z][a-z0-9_.]{0,15}") {
        let ns = Namespace::parse(&format!("{}.{}", db, coll)).unwrap();
        prop_assert_eq!(&ns.database, &db);
        prop_assert_eq!(&ns.collection, &coll);
        prop_assert_eq!(ns.to_string(), format!("{}.{}", db, coll));
    }

    /// Anything in admin or local is internal.
    #[test]
    fn internal_databases_are_internal(db in prop::sample::select(vec!["admin", "local"]), coll in "[a-z]{1,10}") {
        prop_assert!(Namespace::new(db, coll).is_internal());
    }

    /// system.* collections are internal in any database.
    #[test]
    fn system_collections_are_internal(db in "[a-z]{1,10}", suffix in "[a-z]{1,10}") {
        let ns = Namespace::new(db, format!("system.{}", suffix));
        prop_assert!(ns.is_internal());
    }

    /// Ordinary user namespaces are replicated.
    #[test]
    fn user_namespaces_are_not_internal(db in "app[a-z]{0,6}", coll in "[a-z]{1,10}") {
        prop_assert!(!Namespace::new(db, coll).is_internal());
    }
}

// =============================================================================
// Update Delta Properties
// =============================================================================

fn field_name() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string)
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        Just(Value::Null),
    ]
}

fn flat_delta() -> impl Strategy<Value = UpdateDelta> {
    prop::collection::vec((field_name(), prop::option::of(scalar())), 1..6).prop_map(|ops| {
        ops.into_iter().fold(UpdateDelta::new(), |delta, (field, value)| match value {
            Some(value) => delta.set(field, value),
            None => delta.unset(field),
        })
    })
}

fn flat_document() -> impl Strategy<Value = Document> {
    prop::collection::btree_map(field_name(), scalar(), 0..4).prop_map(|fields| {
        let mut doc = Map::new();
        doc.insert("_id".into(), json!(1));
        doc.extend(fields);
        doc
    })
}

proptest! {
    /// Applying the same top-level delta twice equals applying it once.
    #[test]
    fn flat_delta_apply_is_idempotent(doc in flat_document(), delta in flat_delta()) {
        let mut once = doc.clone();
        delta.apply_to(&mut once).unwrap();
        let mut twice = once.clone();
        delta.apply_to(&mut twice).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// Operator rendering, when possible, parses back to a delta with the
    /// same effect.
    #[test]
    fn operator_document_reparses(doc in flat_document(), delta in flat_delta()) {
        let Some(o) = delta.to_operator_document() else {
            return Ok(());
        };
        let reparsed = UpdateDelta::from_operators(&o).unwrap();
        let mut a = doc.clone();
        let mut b = doc;
        delta.apply_to(&mut a).unwrap();
        reparsed.apply_to(&mut b).unwrap();
        prop_assert_eq!(a, b);
    }
}

// =============================================================================
// Replay Idempotence
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, Document),
    Replace(i64, Document),
    Update(i64, UpdateDelta),
    Delete(i64),
}

fn op() -> impl Strategy<Value = Op> {
    let id = 0i64..5;
    let body = prop::collection::btree_map(field_name(), scalar(), 0..3)
        .prop_map(|fields| fields.into_iter().collect::<Document>())
        .boxed();
    prop_oneof![
        (id.clone(), body.clone()).prop_map(|(id, body)| Op::Insert(id, body)),
        (id.clone(), body).prop_map(|(id, body)| Op::Replace(id, body)),
        (id.clone(), flat_delta()).prop_map(|(id, delta)| Op::Update(id, delta)),
        id.prop_map(Op::Delete),
    ]
}

fn with_id(id: i64, mut body: Document) -> Document {
    body.insert("_id".into(), json!(id));
    body
}

/// Run `ops` against a fresh source and return it with its change log.
async fn record(ops: &[Op], ns: &Namespace) -> (MemoryDatabase, Vec<Document>) {
    let source = MemoryDatabase::new("source");
    for op in ops {
        match op {
            // Inserts of an existing _id fail on the source and leave no entry
            Op::Insert(id, body) => {
                let _ = source.insert(ns, with_id(*id, body.clone())).await;
            }
            Op::Replace(id, body) => {
                source.upsert(ns, &json!(id), with_id(*id, body.clone())).await.unwrap();
            }
            Op::Update(id, delta) => {
                source.update(ns, &json!(id), delta).await.unwrap();
            }
            Op::Delete(id) => {
                source.delete(ns, &json!(id)).await.unwrap();
            }
        }
    }
    let log = source.oplog_entries().await;
    (source, log)
}

async fn replay(dest: &MemoryDatabase, entries: &[Document]) {
    for raw in entries {
        let entry = parse_entry(raw).unwrap();
        apply_entry(dest, &entry).await.unwrap();
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying the log once reproduces the source.
    #[test]
    fn replay_reproduces_source(ops in prop::collection::vec(op(), 0..40)) {
        let ns = Namespace::new("app", "items");
        let (source, dest) = block_on(async {
            let (source, log) = record(&ops, &ns).await;
            let dest = MemoryDatabase::new("destination");
            replay(&dest, &log).await;
            (source.documents(&ns).await, dest.documents(&ns).await)
        });
        prop_assert_eq!(source, dest);
    }

    /// Applying every entry twice in a row changes nothing.
    #[test]
    fn replay_each_entry_twice_is_idempotent(ops in prop::collection::vec(op(), 0..40)) {
        let ns = Namespace::new("app", "items");
        let (source, dest) = block_on(async {
            let (source, log) = record(&ops, &ns).await;
            let dest = MemoryDatabase::new("destination");
            for raw in &log {
                replay(&dest, std::slice::from_ref(raw)).await;
                replay(&dest, std::slice::from_ref(raw)).await;
            }
            (source.documents(&ns).await, dest.documents(&ns).await)
        });
        prop_assert_eq!(source, dest);
    }

    /// Re-applying any suffix after a full replay (a restart from an older
    /// checkpoint) converges to the same state.
    #[test]
    fn replaying_a_suffix_again_converges(
        ops in prop::collection::vec(op(), 1..40),
        cut in any::<prop::sample::Index>(),
    ) {
        let ns = Namespace::new("app", "items");
        let (source, dest) = block_on(async {
            let (source, log) = record(&ops, &ns).await;
            let dest = MemoryDatabase::new("destination");
            replay(&dest, &log).await;
            if !log.is_empty() {
                let from = cut.index(log.len());
                replay(&dest, &log[from..]).await;
            }
            (source.documents(&ns).await, dest.documents(&ns).await)
        });
        prop_assert_eq!(source, dest);
    }
}
