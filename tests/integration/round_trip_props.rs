#![allow(missing_docs)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use linkgraph::consistency::ConsistencyManager;
use linkgraph::links::{Cardinality, LinkDefinition, LinkRegistry};
use linkgraph::query::{BatchExecutor, Planner};
use linkgraph::store::{Filter, MemoryStore};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn loopback_registry() -> Arc<LinkRegistry> {
    let mut reg = LinkRegistry::new();
    reg.add_link(
        "nodes",
        "next",
        LinkDefinition::direct("nodes", "nextIds", Cardinality::Many).autoremove(),
    )
    .unwrap();
    reg.add_link("nodes", "prev", LinkDefinition::inverse("nodes", "next"))
        .unwrap();
    reg.freeze().unwrap()
}

fn arb_graph() -> impl Strategy<Value = Vec<Vec<u32>>> {
    (1usize..24).prop_flat_map(|n| {
        prop::collection::vec(prop::collection::vec(0..n as u32, 0..4), n)
    })
}

fn load(store: &MemoryStore, graph: &[Vec<u32>]) {
    for (id, edges) in graph.iter().enumerate() {
        store
            .insert("nodes", json!({"_id": id, "nextIds": edges}))
            .unwrap();
    }
}

// Nested `next`/`prev` specification following `path`.
fn nested_spec(path: &[bool]) -> Value {
    let mut spec = json!({"_id": 1});
    for &forward in path.iter().rev() {
        let link = if forward { "next" } else { "prev" };
        let mut outer = Map::new();
        outer.insert("_id".to_owned(), json!(1));
        outer.insert(link.to_owned(), spec);
        spec = Value::Object(outer);
    }
    spec
}

proptest! {
    #[test]
    fn fetches_match_plan_nodes(
        graph in arb_graph(),
        path in prop::collection::vec(any::<bool>(), 0..5)
    ) {
        let planner = Planner::new(loopback_registry());
        let store = MemoryStore::new();
        load(&store, &graph);

        let plan = planner.plan("nodes", &nested_spec(&path)).unwrap();
        let result = BatchExecutor::default().execute(&store, &plan, None).unwrap();

        prop_assert_eq!(plan.node_count(), path.len() + 1);
        prop_assert_eq!(store.metrics().find_calls as usize, plan.node_count());
        prop_assert_eq!(result.report.fetches, plan.node_count());
        prop_assert_eq!(result.documents.len(), graph.len());
    }

    #[test]
    fn cascade_deletes_exactly_the_reachable_set(graph in arb_graph(), start in 0usize..24) {
        let start = start % graph.len();
        let manager = ConsistencyManager::new(loopback_registry());
        let store = MemoryStore::new();
        load(&store, &graph);

        let mut reachable = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &next in &graph[node] {
                if reachable.insert(next as usize) {
                    queue.push_back(next as usize);
                }
            }
        }

        let report = manager.remove(&store, "nodes", &Filter::eq("_id", start)).unwrap();
        prop_assert_eq!(report.deleted as usize + 1, reachable.len());
        prop_assert_eq!(store.metrics().documents_deleted as usize, reachable.len());
        prop_assert_eq!(store.count("nodes"), graph.len() - reachable.len());

        for doc in store.all("nodes") {
            for id in doc["nextIds"].as_array().unwrap() {
                let id = id.as_u64().unwrap() as usize;
                prop_assert!(!reachable.contains(&id), "dangling reference to {}", id);
            }
        }
    }
}
