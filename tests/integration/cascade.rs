#![allow(missing_docs)]

use std::sync::{Arc, Once};

use linkgraph::consistency::ConsistencyManager;
use linkgraph::links::{Cardinality, LinkDefinition, LinkRegistry};
use linkgraph::store::{DocumentStore, Filter, MemoryStore, StoreError, StoreOp};
use linkgraph::LinkedStore;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("linkgraph=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn blog() -> Arc<LinkRegistry> {
    let mut reg = LinkRegistry::new();
    reg.add_link(
        "posts",
        "author",
        LinkDefinition::direct("users", "authorId", Cardinality::One),
    )
    .unwrap();
    reg.add_link(
        "posts",
        "editors",
        LinkDefinition::direct("users", "editorIds", Cardinality::Many),
    )
    .unwrap();
    reg.add_link("users", "posts", LinkDefinition::inverse("posts", "author"))
        .unwrap();
    reg.add_link(
        "users",
        "followers",
        LinkDefinition::direct("users", "followerIds", Cardinality::Many),
    )
    .unwrap();
    reg.freeze().unwrap()
}

#[test]
fn removing_a_document_prunes_every_reference_and_nothing_else() {
    init_tracing();
    let linked = LinkedStore::new(MemoryStore::new(), blog());
    let store = linked.store();
    store
        .insert_all(
            "users",
            [
                json!({"_id": 1, "followerIds": [2]}),
                json!({"_id": 2, "followerIds": [1]}),
            ],
        )
        .unwrap();
    store
        .insert_all(
            "posts",
            [
                json!({"_id": 10, "authorId": 1, "editorIds": [1, 2]}),
                json!({"_id": 11, "authorId": 2, "editorIds": [1]}),
            ],
        )
        .unwrap();
    store
        .insert("audit", json!({"_id": 1, "userId": 1, "editorIds": [1]}))
        .unwrap();

    let report = linked.remove("users", &Filter::eq("_id", 1)).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.deleted, 0);

    let post10 = store.get("posts", 10).unwrap();
    assert!(!post10.contains_key("authorId"));
    assert_eq!(post10["editorIds"], json!([2]));
    assert_eq!(store.get("posts", 11).unwrap()["editorIds"], json!([]));
    assert_eq!(store.get("posts", 11).unwrap()["authorId"], json!(2));
    assert_eq!(store.get("users", 2).unwrap()["followerIds"], json!([]));
    assert_eq!(
        store.get("audit", 1).unwrap()["editorIds"],
        json!([1]),
        "collections without a link to users stay untouched"
    );
}

fn four_collection_cycle() -> Arc<LinkRegistry> {
    let mut reg = LinkRegistry::new();
    for (from, to) in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "a")] {
        reg.add_link(
            from,
            "next",
            LinkDefinition::direct(to, "nextId", Cardinality::One).autoremove(),
        )
        .unwrap();
    }
    reg.freeze().unwrap()
}

#[test]
fn autoremove_cycle_deletes_each_document_once() {
    init_tracing();
    let manager = ConsistencyManager::new(four_collection_cycle());
    let store = MemoryStore::new();
    for (coll, id, next) in [("a", 1, 2), ("b", 2, 3), ("c", 3, 4), ("d", 4, 1)] {
        store
            .insert(coll, json!({"_id": id, "nextId": next}))
            .unwrap();
    }
    store.insert("b", json!({"_id": 99, "nextId": 3})).unwrap();

    let report = manager.remove(&store, "a", &Filter::eq("_id", 1)).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.deleted, 3);
    assert_eq!(store.metrics().documents_deleted, 4);
    for coll in ["a", "c", "d"] {
        assert_eq!(store.count(coll), 0, "{coll}");
    }
    // b/99 still points at c/3, which is gone; its reference is pruned.
    let survivor = store.get("b", 99).unwrap();
    assert!(!survivor.contains_key("nextId"));
}

#[test]
fn loopback_cycle_terminates() {
    init_tracing();
    let mut reg = LinkRegistry::new();
    reg.add_link(
        "nodes",
        "next",
        LinkDefinition::direct("nodes", "nextIds", Cardinality::Many).autoremove(),
    )
    .unwrap();
    let manager = ConsistencyManager::new(reg.freeze().unwrap());
    let store = MemoryStore::new();
    store
        .insert_all(
            "nodes",
            [
                json!({"_id": 1, "nextIds": [2, 3]}),
                json!({"_id": 2, "nextIds": [3, 1]}),
                json!({"_id": 3, "nextIds": [4]}),
                json!({"_id": 4, "nextIds": [1, 2]}),
                json!({"_id": 5, "nextIds": [1]}),
            ],
        )
        .unwrap();
    let plan = manager
        .plan_removal(&store, "nodes", &[store.get("nodes", 1).unwrap()])
        .unwrap();
    let deleted: Vec<_> = plan.deletions().map(|(_, id)| id.to_string()).collect();
    assert_eq!(deleted, vec!["2", "3", "4"]);

    store.delete_many("nodes", &Filter::eq("_id", 1)).unwrap();
    let report = manager.apply(&store, &plan).unwrap();
    assert_eq!(report.deleted, 3);
    assert_eq!(store.get("nodes", 5).unwrap()["nextIds"], json!([]));
}

#[test]
fn inverse_autoremove_cascades_transitively() {
    init_tracing();
    let mut reg = LinkRegistry::new();
    reg.add_link(
        "posts",
        "author",
        LinkDefinition::direct("users", "authorId", Cardinality::One),
    )
    .unwrap();
    reg.add_link(
        "users",
        "posts",
        LinkDefinition::inverse("posts", "author").autoremove(),
    )
    .unwrap();
    reg.add_link(
        "comments",
        "post",
        LinkDefinition::direct("posts", "postId", Cardinality::One),
    )
    .unwrap();
    reg.add_link(
        "posts",
        "comments",
        LinkDefinition::inverse("comments", "post").autoremove(),
    )
    .unwrap();
    let linked = LinkedStore::new(MemoryStore::new(), reg.freeze().unwrap());
    let store = linked.store();
    store.insert_all("users", [json!({"_id": 1}), json!({"_id": 2})]).unwrap();
    store
        .insert_all(
            "posts",
            [
                json!({"_id": 10, "authorId": 1}),
                json!({"_id": 11, "authorId": 2}),
            ],
        )
        .unwrap();
    store
        .insert_all(
            "comments",
            [
                json!({"_id": 100, "postId": 10}),
                json!({"_id": 101, "postId": 10}),
                json!({"_id": 102, "postId": 11}),
            ],
        )
        .unwrap();

    let report = linked.remove("users", &Filter::eq("_id", 1)).unwrap();
    assert_eq!(report.deleted, 3);
    assert_eq!(store.count("posts"), 1);
    assert_eq!(store.count("comments"), 1);
    assert!(store.get("comments", 102).is_some());

    // Removing a comment never removes its post: the flag sits on the post side.
    linked.remove("comments", &Filter::eq("_id", 102)).unwrap();
    assert!(store.get("posts", 11).is_some());
}

#[test]
fn rerunning_a_cascade_is_a_no_op() {
    init_tracing();
    let manager = ConsistencyManager::new(blog());
    let store = MemoryStore::new();
    store.insert("users", json!({"_id": 1})).unwrap();
    store
        .insert("posts", json!({"_id": 10, "authorId": 1, "editorIds": [1, 3]}))
        .unwrap();
    let removed = vec![store.get("users", 1).unwrap()];

    let first = manager.after_delete(&store, "users", &removed).unwrap();
    assert_eq!(first.pruned, 2);
    let snapshot = store.all("posts");
    let second = manager.after_delete(&store, "users", &removed).unwrap();
    assert_eq!(second.pruned, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(store.all("posts"), snapshot);
}

#[test]
fn interrupted_cascade_completes_when_reapplied() {
    init_tracing();
    let manager = ConsistencyManager::new(blog());
    let store = MemoryStore::new();
    store
        .insert("posts", json!({"_id": 10, "authorId": 1, "editorIds": [1]}))
        .unwrap();
    let removed = vec![json!({"_id": 1}).as_object().cloned().unwrap()];
    let plan = manager.plan_removal(&store, "users", &removed).unwrap();
    assert!(plan.prune_count() >= 2);

    store.fail_next(StoreOp::Update, StoreError::Unavailable("flaky".into()));
    let err = manager.apply(&store, &plan).unwrap_err();
    assert_eq!(err.code(), "StoreUnavailable");

    manager.apply(&store, &plan).unwrap();
    let post = store.get("posts", 10).unwrap();
    assert!(!post.contains_key("authorId"));
    assert_eq!(post["editorIds"], json!([]));
}
