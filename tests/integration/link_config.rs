#![allow(missing_docs)]

use std::fs;

use linkgraph::config::LinkConfig;
use linkgraph::links::Cardinality;
use linkgraph::store::{Filter, MemoryStore};
use linkgraph::LinkedStore;
use serde_json::json;
use tempfile::tempdir;

const LINKS: &str = r#"
[executor]
parallel_level_fetch = true
plan_cache_capacity = 8

[[links]]
collection = "orders"
name = "customer"
target = "customers"
cardinality = "one"
field = "customerId"
indexed = true

[[links]]
collection = "customers"
name = "orders"
target = "orders"
inverse_of = "customer"
autoremove = true

[[links]]
collection = "orders"
name = "items"
target = "products"
cardinality = "many"
field = "items"
metadata = true
"#;

#[test]
fn config_file_drives_a_linked_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("links.toml");
    fs::write(&path, LINKS).unwrap();

    let config = LinkConfig::load(&path).unwrap();
    assert_eq!(config.links.len(), 3);
    let linked = LinkedStore::from_config(MemoryStore::new(), &config).unwrap();

    let registry = linked.registry();
    assert_eq!(
        registry.resolve("customers", "orders").unwrap().cardinality,
        Cardinality::Many
    );
    let advice = registry.index_advice();
    assert_eq!(advice.len(), 1);
    assert_eq!(advice[0].collection, "orders");
    assert_eq!(advice[0].field, "customerId");

    let store = linked.store();
    store.insert("customers", json!({"_id": "c1", "name": "ada"})).unwrap();
    store
        .insert_all("products", [json!({"_id": 1, "sku": "p1"}), json!({"_id": 2, "sku": "p2"})])
        .unwrap();
    store
        .insert(
            "orders",
            json!({"_id": 7, "customerId": "c1", "items": [{"_id": 2, "qty": 3}]}),
        )
        .unwrap();

    let result = linked
        .query(
            "customers",
            &json!({"name": 1, "orders": {"items": {"sku": 1}}}),
        )
        .unwrap();
    assert_eq!(
        result.documents[0]["orders"],
        json!([{
            "_id": 7,
            "customerId": "c1",
            "items": [{"_id": 2, "sku": "p2", "$metadata": {"qty": 3}}],
        }])
    );

    let report = linked.remove("customers", &Filter::eq("_id", "c1")).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(store.count("orders"), 0);
    assert_eq!(store.count("products"), 2);
}

#[test]
fn missing_file_reports_read_error() {
    let dir = tempdir().unwrap();
    let err = LinkConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert_eq!(err.code(), "ConfigRead");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn invalid_declarations_fail_at_startup() {
    let config = LinkConfig::from_toml_str(
        r#"
        [[links]]
        collection = "orders"
        name = "customer"
        target = "customers"
        cardinality = "many"
        field = "customerId"
        unique = true
        "#,
    )
    .unwrap();
    let err = LinkedStore::from_config(MemoryStore::new(), &config)
        .err()
        .unwrap();
    assert_eq!(err.code(), "InvalidLinkDefinition");
}
