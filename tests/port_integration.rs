//! Integration tests for the port over a real SQLite database
//!
//! These tests drive the full read and write paths:
//! - Growing a tree from the introspected catalog
//! - Constraint-scoped reads with pagination, sorting and wildcards
//! - Facets, masks, custom filters and root-level parameters
//! - Diff/patch writes with optimistic concurrency and structural references

use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use treeport::{
    ConflictPolicy, ConstraintSet, Database, EntityDirective, ErrorKind, ParameterDirective, Port,
    PortConfig, SqliteStore, Value,
};

const SCHEMA: &str = r#"
CREATE TABLE "order" (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL,
    note TEXT,
    owner TEXT
);
CREATE TABLE item (
    id INTEGER PRIMARY KEY,
    order_id INTEGER NOT NULL REFERENCES "order"(id),
    sku TEXT,
    qty INTEGER NOT NULL DEFAULT 1,
    replaces_id INTEGER REFERENCES item(id)
);
CREATE TABLE invoice (
    id INTEGER PRIMARY KEY,
    order_id INTEGER NOT NULL UNIQUE REFERENCES "order"(id),
    total REAL NOT NULL
);
"#;

const SEED: &str = r#"
INSERT INTO "order" (id, code, owner) VALUES (7, 'A7', 'alice'), (8, 'A8', 'bob'), (9, 'A9', NULL);
INSERT INTO item (id, order_id, sku, qty) VALUES
    (1, 7, 'X1', 1),
    (2, 7, 'X2', 2),
    (3, 8, 'Y1', 5),
    (4, 9, 'Z1', 1),
    (5, 9, 'Z2', 1),
    (6, 9, NULL, 3);
INSERT INTO invoice (id, order_id, total) VALUES (1, 7, 10.0), (2, 8, 25.5);
"#;

// ============================================================================
// Helpers
// ============================================================================

async fn base(config: PortConfig) -> (Port, Database) {
    let db = Database::connect_url("sqlite::memory:", 1).await.unwrap();
    db.execute_script(SCHEMA).await.unwrap();
    db.execute_script(SEED).await.unwrap();
    let store = SqliteStore::open(db.clone()).await.unwrap();
    (Port::new(Arc::new(store), config), db)
}

fn orders_with_items(port: &Port) -> Port {
    port.grow(&[EntityDirective::new("", "order")
        .nest(EntityDirective::new("", "item"))
        .into()])
        .unwrap()
}

fn orders_with_invoices(port: &Port) -> Port {
    port.grow(&[EntityDirective::new("", "order")
        .nest(EntityDirective::new("", "invoice"))
        .into()])
        .unwrap()
}

/// Orders visible only to the `$user` they belong to.
fn owned_orders(port: &Port) -> Port {
    port.grow(&[
        ParameterDirective::new("user").into(),
        EntityDirective::new("", "order").mask("owner = $user").into(),
    ])
    .unwrap()
}

async fn order_count(db: &Database) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM \"order\"")
        .fetch_one(db.pool())
        .await
        .unwrap()
}

async fn shop() -> (Port, Database) {
    let (port, db) = base(PortConfig::default()).await;
    (orders_with_items(&port), db)
}

fn orders(data: &Value) -> &[Value] {
    data.get("order").and_then(Value::as_list).unwrap()
}

fn order_ids(data: &Value) -> Vec<i64> {
    orders(data).iter().map(|o| o.get("id").and_then(Value::as_i64).unwrap()).collect()
}

fn item_ids(order: &Value) -> Vec<i64> {
    order
        .get("item")
        .and_then(Value::as_list)
        .unwrap()
        .iter()
        .map(|i| i.get("id").and_then(Value::as_i64).unwrap())
        .collect()
}

async fn total_changes(db: &Database) -> i64 {
    sqlx::query_scalar("SELECT total_changes()")
        .fetch_one(db.pool())
        .await
        .unwrap()
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_top_limits_orders_but_keeps_all_items() {
    let (port, _db) = shop().await;
    let product = port.produce_query("order:top=2").await.unwrap();

    assert_eq!(order_ids(&product.data), vec![7, 8]);
    assert_eq!(item_ids(&orders(&product.data)[0]), vec![1, 2]);
    assert_eq!(item_ids(&orders(&product.data)[1]), vec![3]);
}

#[tokio::test]
async fn test_skip_and_top_select_a_window() {
    let (port, _db) = shop().await;

    let trunk = port.produce_query("order:skip=1&order:top=1").await.unwrap();
    assert_eq!(order_ids(&trunk.data), vec![8]);

    let branch = port
        .produce_query("order.item:skip=1&order.item:top=1")
        .await
        .unwrap();
    let per_order: Vec<Vec<i64>> = orders(&branch.data).iter().map(item_ids).collect();
    assert_eq!(per_order, vec![vec![2], vec![], vec![5]]);
}

#[tokio::test]
async fn test_unbounded_top_with_skip() {
    let (port, _db) = shop().await;
    let product = port
        .produce_query("order.item:top=9223372036854775807&order.item:skip=1")
        .await
        .unwrap();
    let per_order: Vec<Vec<i64>> = orders(&product.data).iter().map(item_ids).collect();
    assert_eq!(per_order, vec![vec![2], vec![], vec![5, 6]]);
}

#[tokio::test]
async fn test_sort_applies_before_pagination() {
    let (port, _db) = shop().await;
    let product = port
        .produce_query("order.item.qty:sort=desc&order.item:top=1")
        .await
        .unwrap();
    let per_order: Vec<Vec<i64>> = orders(&product.data).iter().map(item_ids).collect();
    assert_eq!(per_order, vec![vec![2], vec![3], vec![6]]);
}

#[tokio::test]
async fn test_child_constraints_restrict_collections_only() {
    let (port, _db) = shop().await;
    let product = port.produce_query("order.item.sku:contains=z").await.unwrap();
    assert_eq!(order_ids(&product.data), vec![7, 8, 9]);
    assert_eq!(item_ids(&orders(&product.data)[2]), vec![4, 5]);

    let with_items = port.produce_query("order.item:exists=true&order.code:ne=A8").await.unwrap();
    assert_eq!(order_ids(&with_items.data), vec![7, 9]);
}

#[tokio::test]
async fn test_wildcard_matches_explicit_constraints() {
    let (port, _db) = base(PortConfig::default()).await;
    let port = port
        .grow(&[EntityDirective::new("", "order")
            .nest(EntityDirective::new("", "item").deselect("replaces"))
            .into()])
        .unwrap();

    let wildcard = port.produce_query("order.item.*:null=false").await.unwrap();
    let explicit = port
        .produce_query("order.item.sku:null=false&order.item.qty:null=false")
        .await
        .unwrap();
    assert_eq!(wildcard.data, explicit.data);
    assert_eq!(item_ids(&orders(&wildcard.data)[2]), vec![4, 5]);
}

#[tokio::test]
async fn test_facet_reads_and_restricts_parent() {
    let (port, _db) = base(PortConfig::default()).await;
    let port = orders_with_invoices(&port);

    let all = port.produce_query("").await.unwrap();
    assert_eq!(order_ids(&all.data), vec![7, 8, 9]);
    let invoice = orders(&all.data)[0].get("invoice").unwrap();
    assert_eq!(invoice.get("id").and_then(Value::as_i64), Some(1));
    assert_eq!(invoice.get("total"), Some(&Value::Float(10.0)));
    assert_eq!(orders(&all.data)[2].get("invoice"), Some(&Value::Null));

    let large = port.produce_query("order.invoice.total:gt=20").await.unwrap();
    assert_eq!(order_ids(&large.data), vec![8]);

    let unbilled = port.produce_query("order.invoice:exists=false").await.unwrap();
    assert_eq!(order_ids(&unbilled.data), vec![9]);
}

#[tokio::test]
async fn test_masks_and_custom_filters() {
    let (port, _db) = base(PortConfig::default()).await;
    let port = port
        .grow(&[EntityDirective::new("", "order")
            .filter("coded($c)", "code = $c")
            .filter("search($text)", "code ~ $text")
            .nest(EntityDirective::new("", "item").mask("qty >= 2"))
            .into()])
        .unwrap();

    let all = port.produce_query("").await.unwrap();
    let per_order: Vec<Vec<i64>> = orders(&all.data).iter().map(item_ids).collect();
    assert_eq!(per_order, vec![vec![2], vec![3], vec![6]]);

    let coded = port.produce_query("order:coded=A9").await.unwrap();
    assert_eq!(order_ids(&coded.data), vec![9]);
    assert_eq!(item_ids(&orders(&coded.data)[0]), vec![6]);

    let searched = port.produce_query("order:search=a8").await.unwrap();
    assert_eq!(order_ids(&searched.data), vec![8]);
}

#[tokio::test]
async fn test_root_level_parameter_binding() {
    let (port, _db) = base(PortConfig::default()).await;
    let port = owned_orders(&port);

    let alice = port.produce_query(":user=alice").await.unwrap();
    assert_eq!(order_ids(&alice.data), vec![7]);

    let nobody = port.produce_query(":user=carol").await.unwrap();
    assert!(orders(&nobody.data).is_empty());

    let err = port.produce_query("").await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::MissingParameter { .. });
}

#[tokio::test]
async fn test_describe_conforms_to_produce() {
    let (port, _db) = shop().await;
    for query in ["", "order:top=1", "order.item.sku=X1", "order.item:top=0&:format=csv"] {
        let constraints = ConstraintSet::parse(query).unwrap();
        let shape = port.describe(&constraints).unwrap();
        let product = port.produce(&constraints).await.unwrap();
        assert!(shape.conforms(&product.data), "shape mismatch for `{}`", query);
        assert_eq!(shape, product.shape);
    }
}

#[tokio::test]
async fn test_format_negotiation() {
    let (port, _db) = shop().await;
    let product = port.produce_query(":format=yaml&order:top=0").await.unwrap();
    assert_eq!(product.format, treeport::OutputFormat::Yaml);
    assert_eq!(port.produce_query("").await.unwrap().format, treeport::OutputFormat::Json);
}

#[tokio::test]
async fn test_read_errors() {
    let (port, _db) = shop().await;
    let kind = |query: &'static str| {
        let port = port.clone();
        async move { port.produce_query(query).await.unwrap_err().kind }
    };

    assert_matches!(kind("order.nope=1").await, ErrorKind::UnknownAttribute { .. });
    assert_matches!(kind("order:exists=true").await, ErrorKind::StructureError(_));
    assert_matches!(kind("order.item:exists=maybe").await, ErrorKind::ArgumentError(_));
    assert_matches!(kind("order.item.qty:gt=many").await, ErrorKind::ArgumentError(_));
    assert_matches!(kind("order.code:top=1").await, ErrorKind::UnsupportedOperator { .. });
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_replace_inserts_one_item_into_order() {
    let (port, db) = shop().await;
    let old = json!({"order": [{"id": 7, "item": [{"id": 1}]}]});
    let new = json!({"order": [{"id": 7, "item": [{"id": 1}, {"sku": "X"}]}]});

    let data = port.replace(Some(&old), Some(&new)).await.unwrap();
    assert_eq!(order_ids(&data), vec![7]);
    let items = item_ids(&orders(&data)[0]);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], 1);

    let (order_id, sku): (i64, String) =
        sqlx::query_as("SELECT order_id, sku FROM item WHERE id = ?1")
            .bind(items[1])
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!((order_id, sku.as_str()), (7, "X"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item WHERE order_id = 7")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_replace_with_identical_payloads_writes_nothing() {
    let (port, db) = shop().await;
    let current = port.produce_query("order=8").await.unwrap();
    let payload = current.data.to_json();

    let before = total_changes(&db).await;
    let data = port.replace(Some(&payload), Some(&payload)).await.unwrap();
    assert_eq!(total_changes(&db).await, before);
    assert_eq!(data, current.data);
}

#[tokio::test]
async fn test_update_changes_only_differing_fields() {
    let (port, db) = shop().await;
    let old = json!({"order": [{"id": 8, "code": "A8", "item": [{"id": 3, "qty": 5}]}]});
    let new = json!({"order": [{"id": 8, "code": "B8", "item": [{"id": 3, "qty": 5}]}]});

    let data = port.replace(Some(&old), Some(&new)).await.unwrap();
    assert_eq!(orders(&data)[0].get("code").and_then(Value::as_str), Some("B8"));

    let sku: Option<String> = sqlx::query_scalar("SELECT sku FROM item WHERE id = 3")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(sku.as_deref(), Some("Y1"));
}

#[tokio::test]
async fn test_double_delete_is_a_conflict() {
    let (port, db) = shop().await;
    let payload = json!({"order": [{"id": 9, "item": [{"id": 4}, {"id": 5}, {"id": 6}]}]});

    let data = port.delete(&payload).await.unwrap();
    assert!(orders(&data).is_empty());

    let err = port.delete(&payload).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::ConcurrentModification { .. });

    assert_eq!(order_count(&db).await, 2);
}

#[tokio::test]
async fn test_stale_old_payload_rolls_back() {
    let (port, db) = shop().await;
    let old = json!({"order": [{"id": 7, "code": "WRONG"}]});
    let new = json!({"order": [{"id": 7, "code": "B7"}]});

    let err = port.replace(Some(&old), Some(&new)).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::ConcurrentModification { ref table, .. } if table == "order");

    let code: String = sqlx::query_scalar("SELECT code FROM \"order\" WHERE id = 7")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(code, "A7");
}

#[tokio::test]
async fn test_changed_only_policy_ignores_untouched_fields() {
    let old = json!({"order": [{"id": 7, "code": "A7", "note": "stale"}]});
    let new = json!({"order": [{"id": 7, "code": "B7", "note": "stale"}]});

    let (strict, _db) = shop().await;
    let err = strict.replace(Some(&old), Some(&new)).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::ConcurrentModification { .. });

    let config = PortConfig {
        conflict_policy: ConflictPolicy::ChangedOnly,
        ..PortConfig::default()
    };
    let (lenient, db) = base(config).await;
    let lenient = orders_with_items(&lenient);
    lenient.replace(Some(&old), Some(&new)).await.unwrap();

    let (code, note): (String, Option<String>) =
        sqlx::query_as("SELECT code, note FROM \"order\" WHERE id = 7")
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!((code.as_str(), note), ("B7", None));
}

#[tokio::test]
async fn test_new_children_link_to_new_parent() {
    let (port, db) = shop().await;
    let payload = json!({"order": [{"code": "N1", "item": [
        {"sku": "A"},
        {"sku": "B", "replaces": {"$ref": "order.0.item.0"}}
    ]}]});

    let data = port.insert(&payload).await.unwrap();
    let order = &orders(&data)[0];
    let order_id = order.get("id").and_then(Value::as_i64).unwrap();
    let items = item_ids(order);
    assert_eq!(items.len(), 2);

    let rows: Vec<(i64, i64, Option<i64>)> =
        sqlx::query_as("SELECT id, order_id, replaces_id FROM item WHERE order_id = ?1 ORDER BY id")
            .bind(order_id)
            .fetch_all(db.pool())
            .await
            .unwrap();
    assert_eq!(rows, vec![(items[0], order_id, None), (items[1], order_id, Some(items[0]))]);
}

#[tokio::test]
async fn test_replacing_a_facet_deletes_the_old_record_first() {
    let (port, db) = base(PortConfig::default()).await;
    let port = orders_with_invoices(&port);
    let old = json!({"order": [{"id": 7, "invoice": {"id": 1}}]});
    let new = json!({"order": [{"id": 7, "invoice": {"total": 9.0}}]});

    let data = port.replace(Some(&old), Some(&new)).await.unwrap();
    let invoice = orders(&data)[0].get("invoice").unwrap();
    assert_eq!(invoice.get("total"), Some(&Value::Float(9.0)));
    assert_ne!(invoice.get("id").and_then(Value::as_i64), Some(1));

    let rows: Vec<(i64, f64)> = sqlx::query_as("SELECT id, total FROM invoice WHERE order_id = 7")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, 9.0);
}

#[tokio::test]
async fn test_facet_update_and_removal() {
    let (port, db) = base(PortConfig::default()).await;
    let port = orders_with_invoices(&port);

    let old = json!({"order": [{"id": 8, "invoice": {"id": 2, "total": 25.5}}]});
    let new = json!({"order": [{"id": 8, "invoice": {"id": 2, "total": 30.0}}]});
    let data = port.replace(Some(&old), Some(&new)).await.unwrap();
    let invoice = orders(&data)[0].get("invoice").unwrap();
    assert_eq!(invoice.get("total"), Some(&Value::Float(30.0)));

    let old = json!({"order": [{"id": 8, "invoice": {"id": 2}}]});
    let new = json!({"order": [{"id": 8}]});
    let data = port.replace(Some(&old), Some(&new)).await.unwrap();
    assert_eq!(orders(&data)[0].get("invoice"), Some(&Value::Null));

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoice WHERE order_id = 8")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_writes_bind_root_level_parameters() {
    let (port, db) = base(PortConfig::default()).await;
    let port = owned_orders(&port);
    let payload = json!({"order": [{"code": "U1", "owner": "alice"}]});

    let err = port.insert(&payload).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::MissingParameter { .. });
    assert_eq!(order_count(&db).await, 3);

    let bindings = ConstraintSet::parse(":user=alice").unwrap();
    let data = port.replace_with(None, Some(&payload), &bindings).await.unwrap();
    assert_eq!(orders(&data).len(), 1);
    assert_eq!(orders(&data)[0].get("code").and_then(Value::as_str), Some("U1"));
    assert_eq!(order_count(&db).await, 4);

    let misplaced = ConstraintSet::parse("order:top=1").unwrap();
    let err = port.replace_with(None, Some(&payload), &misplaced).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::ArgumentError(_));
    assert_eq!(order_count(&db).await, 4);
}

#[tokio::test]
async fn test_payload_errors() {
    let (port, _db) = shop().await;

    let forward = json!({"order": [{"code": "N", "item": [
        {"sku": "A", "replaces": {"$ref": "order.0.item.1"}},
        {"sku": "B"}
    ]}]});
    let err = port.insert(&forward).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::DanglingReference { .. });

    let duplicated = json!({"order": [{"id": 7}, {"id": 7}]});
    let err = port.insert(&duplicated).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::DuplicateRecord { .. });

    let anonymous_old = json!({"order": [{"code": "A7"}]});
    let err = port.delete(&anonymous_old).await.unwrap_err();
    assert_matches!(err.kind, ErrorKind::ArgumentError(_));
}

// ============================================================================
// File-backed database
// ============================================================================

#[tokio::test]
async fn test_file_backed_database_persists_writes() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("port.db").display());

    let db = Database::connect_url(&url, 4).await.unwrap();
    db.execute_script(SCHEMA).await.unwrap();
    let store = SqliteStore::open(db).await.unwrap();
    let port = orders_with_items(&Port::new(Arc::new(store), PortConfig::default()));

    port.insert(&json!({"order": [{"code": "F1", "item": [{"sku": "S", "qty": 2}]}]}))
        .await
        .unwrap();

    let reopened = Database::connect_url(&url, 1).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item WHERE qty = 2")
        .fetch_one(reopened.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}
