#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::time::Duration;

use linkgraph::links::{Cardinality, LinkDefinition, LinkRegistry};
use linkgraph::query::{BatchExecutor, ExecutorOptions, Planner};
use linkgraph::store::{MemoryStore, StoreError, StoreOp};
use linkgraph::LinkError;
use serde_json::{json, Value};
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

fn social() -> Arc<LinkRegistry> {
    let mut reg = LinkRegistry::new();
    reg.add_link(
        "users",
        "friends",
        LinkDefinition::direct("users", "friendIds", Cardinality::Many),
    )
    .unwrap();
    reg.add_link(
        "posts",
        "author",
        LinkDefinition::direct("users", "authorId", Cardinality::One),
    )
    .unwrap();
    reg.add_link("users", "posts", LinkDefinition::inverse("posts", "author"))
        .unwrap();
    reg.add_link(
        "comments",
        "post",
        LinkDefinition::direct("posts", "postId", Cardinality::One),
    )
    .unwrap();
    reg.add_link("posts", "comments", LinkDefinition::inverse("comments", "post"))
        .unwrap();
    reg.add_link(
        "users",
        "team",
        LinkDefinition::direct("teams", "team", Cardinality::One).with_metadata(),
    )
    .unwrap();
    reg.add_link(
        "passports",
        "holder",
        LinkDefinition::direct("users", "holderId", Cardinality::One).unique(),
    )
    .unwrap();
    reg.add_link("users", "passport", LinkDefinition::inverse("passports", "holder"))
        .unwrap();
    reg.freeze().unwrap()
}

fn seed(store: &MemoryStore, users: i64) {
    for id in 1..=users {
        let friends: Vec<i64> = [(id % users) + 1, ((id + 1) % users) + 1]
            .into_iter()
            .filter(|f| *f != id)
            .collect();
        store
            .insert(
                "users",
                json!({"_id": id, "name": format!("user{id}"), "friendIds": friends}),
            )
            .unwrap();
        for p in 0..3 {
            let post = id * 100 + p;
            store
                .insert(
                    "posts",
                    json!({"_id": post, "title": format!("post{post}"), "authorId": id}),
                )
                .unwrap();
            store
                .insert("comments", json!({"_id": post * 10, "text": "hi", "postId": post}))
                .unwrap();
        }
    }
}

#[test]
fn fetch_count_equals_node_count_whatever_the_data_size() {
    init_tracing();
    let planner = Planner::new(social());
    let spec = json!({
        "name": 1,
        "friends": {"name": 1},
        "posts": {"title": 1, "comments": {"text": 1}, "author": {"name": 1}},
    });
    let plan = planner.plan("users", &spec).unwrap();
    assert_eq!(plan.node_count(), 5);

    for users in [3, 40] {
        let store = MemoryStore::new();
        seed(&store, users);
        let result = BatchExecutor::default().execute(&store, &plan, None).unwrap();
        assert_eq!(store.metrics().find_calls, 5, "with {users} users");
        assert_eq!(result.documents.len(), users as usize);
        assert_eq!(
            store.find_log(),
            vec!["users", "users", "posts", "users", "comments"],
            "breadth-first, children in name order"
        );
    }
}

#[test]
fn friends_of_friends_of_friends_is_three_fetches_three_levels() {
    init_tracing();
    let planner = Planner::new(social());
    let store = MemoryStore::new();
    store
        .insert_all(
            "users",
            [
                json!({"_id": 1, "name": "a", "friendIds": [2]}),
                json!({"_id": 2, "name": "b", "friendIds": [3]}),
                json!({"_id": 3, "name": "c", "friendIds": [1, 2]}),
            ],
        )
        .unwrap();
    let spec = json!({
        "$filters": {"_id": 1},
        "name": 1,
        "friends": {"name": 1, "friends": {"name": 1}},
    });
    let plan = planner.plan("users", &spec).unwrap();
    let result = BatchExecutor::new(ExecutorOptions {
        parallel_level_fetch: true,
    })
    .execute(&store, &plan, None)
    .unwrap();

    assert_eq!(store.metrics().find_calls, 3);
    assert_eq!(result.report.levels, 3);
    assert_eq!(
        Value::Object(result.documents[0].clone()),
        json!({
            "_id": 1,
            "name": "a",
            "friends": [{
                "_id": 2,
                "name": "b",
                "friends": [{"_id": 3, "name": "c"}],
            }],
        })
    );
}

#[test]
fn unique_inverse_attaches_single_object_or_null() {
    init_tracing();
    let planner = Planner::new(social());
    let store = MemoryStore::new();
    store
        .insert_all("users", [json!({"_id": 1}), json!({"_id": 2})])
        .unwrap();
    store
        .insert_all(
            "passports",
            [
                json!({"_id": "zz", "holderId": 1, "country": "x"}),
                json!({"_id": "aa", "holderId": 1, "country": "y"}),
            ],
        )
        .unwrap();
    let plan = planner
        .plan("users", &json!({"passport": {"country": 1}}))
        .unwrap();
    let result = BatchExecutor::default().execute(&store, &plan, None).unwrap();

    assert_eq!(
        result.documents[0]["passport"],
        json!({"_id": "aa", "country": "y"})
    );
    assert_eq!(result.documents[1]["passport"], Value::Null);
    assert_eq!(result.report.violations.len(), 1);
    assert_eq!(result.report.violations[0].candidates.len(), 2);
}

#[test]
fn metadata_one_link_carries_target_fields_and_metadata() {
    init_tracing();
    let planner = Planner::new(social());
    let store = MemoryStore::new();
    store
        .insert(
            "users",
            json!({"_id": 1, "name": "a", "team": {"_id": 5, "role": "lead", "since": 2020}}),
        )
        .unwrap();
    store
        .insert("teams", json!({"_id": 5, "name": "ops", "budget": 9}))
        .unwrap();
    let plan = planner
        .plan("users", &json!({"name": 1, "team": {"name": 1}}))
        .unwrap();
    let result = BatchExecutor::default().execute(&store, &plan, None).unwrap();
    assert_eq!(
        Value::Object(result.documents[0].clone()),
        json!({
            "_id": 1,
            "name": "a",
            "team": {"_id": 5, "name": "ops", "$metadata": {"role": "lead", "since": 2020}},
        })
    );
}

#[test]
fn unknown_link_aborts_before_any_fetch() {
    init_tracing();
    let planner = Planner::new(social());
    let err = planner
        .plan("users", &json!({"posts": {"reviewers": {"name": 1}}}))
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::LinkNotFound { ref collection, ref name }
            if collection == "posts" && name == "reviewers"
    ));
}

#[test]
fn store_failures_propagate_without_retry() {
    init_tracing();
    let planner = Planner::new(social());
    let store = MemoryStore::new();
    seed(&store, 2);
    store.fail_next(StoreOp::Find, StoreError::Timeout(Duration::from_millis(250)));
    let plan = planner
        .plan("users", &json!({"name": 1, "posts": {"title": 1}}))
        .unwrap();
    let err = BatchExecutor::default()
        .execute(&store, &plan, None)
        .unwrap_err();
    assert_eq!(err.code(), "StoreTimeout");
    assert_eq!(store.metrics().find_calls, 1);

    // The failure was consumed; the same plan now succeeds.
    let result = BatchExecutor::default().execute(&store, &plan, None).unwrap();
    assert_eq!(result.documents.len(), 2);
}
