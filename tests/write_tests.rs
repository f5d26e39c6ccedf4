//! Write query tests.
//!
//! Covers:
//! - INSERT batches, duplicate keys, best-effort error reporting
//! - UPDATE merge semantics, skipped rows, primary-key protection
//! - REPLACE with object or null results
//! - DELETE over filtered views
//! - point update/delete
//! - cancellation mid-batch

use std::rc::Rc;

use docql_core::ast::{
    Builtin, Comparison, Mapping, Predicate, Query, TableRef, Term, WriteQuery,
};
use docql_core::executor::QueryExecutor;
use docql_core::response::{Response, StatusCode};
use docql_core::source::{Interruptor, MemoryCluster, NullScriptPool};
use serde_json::{json, Value};

fn num(n: f64) -> Term {
    Term::Number(n)
}

fn var(name: &str) -> Term {
    Term::Var(name.to_string())
}

fn call(builtin: Builtin, args: Vec<Term>) -> Term {
    Term::Call { builtin, args }
}

fn get_attr(base: Term, attr: &str) -> Term {
    call(Builtin::GetAttr(attr.to_string()), vec![base])
}

fn object(fields: Vec<(&str, Term)>) -> Term {
    Term::Object(
        fields
            .into_iter()
            .map(|(name, term)| (name.to_string(), term))
            .collect(),
    )
}

fn mapping(arg: &str, body: Term) -> Mapping {
    Mapping {
        arg: arg.to_string(),
        body: Box::new(body),
    }
}

fn users_ref() -> TableRef {
    TableRef::new("test", "users")
}

fn users_table() -> Term {
    Term::Table(users_ref())
}

/// users, primary key "id", ages 10 and 30.
fn seeded_cluster() -> MemoryCluster {
    let cluster = MemoryCluster::new();
    cluster.create_table("test", "users", "id");
    cluster.seed(
        "test",
        "users",
        vec![json!({"id": 1, "age": 10}), json!({"id": 2, "age": 30})],
    );
    cluster
}

fn executor_for(cluster: &MemoryCluster) -> QueryExecutor {
    QueryExecutor::new(
        Rc::new(cluster.clone()),
        Rc::new(cluster.clone()),
        Rc::new(NullScriptPool),
    )
}

fn run_write(cluster: &MemoryCluster, wq: WriteQuery) -> Response {
    executor_for(cluster).execute(&Query::write(1, wq), &Interruptor::new())
}

/// Status object of a successful write response.
fn status(response: &Response) -> Value {
    assert_eq!(
        response.status_code,
        StatusCode::SuccessJson,
        "write failed: {:?}",
        response.error_message
    );
    serde_json::from_str(&response.response[0]).expect("status is valid JSON")
}

/// All rows of the users table, for verifying effects.
fn table_rows(cluster: &MemoryCluster) -> Vec<Value> {
    let response = executor_for(cluster).execute(&Query::read(2, users_table()), &Interruptor::new());
    assert_eq!(response.status_code, StatusCode::SuccessStream);
    response
        .response
        .iter()
        .map(|row| serde_json::from_str(row).expect("row is valid JSON"))
        .collect()
}

// ============================================================================
// INSERT
// ============================================================================

#[test]
fn test_insert_batch() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Insert {
        table: users_ref(),
        terms: vec![
            object(vec![("id", num(3.0)), ("age", num(40.0))]),
            object(vec![("id", num(4.0)), ("age", num(50.0))]),
        ],
    };
    let response = run_write(&cluster, wq);
    assert_eq!(status(&response), json!({"inserted": 2, "errors": 0}));
    assert_eq!(table_rows(&cluster).len(), 4);
}

#[test]
fn test_insert_duplicate_key_is_reported_not_fatal() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Insert {
        table: users_ref(),
        terms: vec![
            object(vec![("id", num(1.0)), ("age", num(99.0))]),
            object(vec![("id", num(5.0)), ("age", num(60.0))]),
        ],
    };
    let response = run_write(&cluster, wq);
    let status = status(&response);
    assert_eq!(status["inserted"], json!(1));
    assert_eq!(status["errors"], json!(1));
    assert!(status["first_error"]
        .as_str()
        .unwrap()
        .contains("duplicate primary key"));

    // The existing row was not overwritten; the other insert landed.
    let rows = table_rows(&cluster);
    assert_eq!(rows.len(), 3);
    assert!(rows.contains(&json!({"id": 1, "age": 10})));
}

#[test]
fn test_insert_without_primary_key_is_reported() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Insert {
        table: users_ref(),
        terms: vec![object(vec![("age", num(1.0))])],
    };
    let response = run_write(&cluster, wq);
    let status = status(&response);
    assert_eq!(status["inserted"], json!(0));
    assert_eq!(status["errors"], json!(1));
    assert!(status["first_error"]
        .as_str()
        .unwrap()
        .contains("`id` attribute"));
}

// ============================================================================
// UPDATE
// ============================================================================

#[test]
fn test_update_merges_mapping_result() {
    let cluster = seeded_cluster();
    // update(users, row -> {age: row.age + 1})
    let wq = WriteQuery::Update {
        view: users_table(),
        mapping: mapping(
            "row",
            object(vec![(
                "age",
                call(Builtin::Add, vec![get_attr(var("row"), "age"), num(1.0)]),
            )]),
        ),
    };
    let response = run_write(&cluster, wq);
    let status = status(&response);
    assert_eq!(status["updated"], json!(2));
    assert_eq!(status["skipped"], json!(0));

    let rows = table_rows(&cluster);
    assert!(rows.contains(&json!({"id": 1, "age": 11})));
    assert!(rows.contains(&json!({"id": 2, "age": 31})));
}

#[test]
fn test_update_with_no_effect_is_skipped() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Update {
        view: users_table(),
        mapping: mapping("row", object(vec![])),
    };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status["updated"], json!(0));
    assert_eq!(status["skipped"], json!(2));
}

#[test]
fn test_update_cannot_change_the_primary_key() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Update {
        view: users_table(),
        mapping: mapping("row", object(vec![("id", num(99.0))])),
    };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status["updated"], json!(0));
    assert_eq!(status["errors"], json!(2));
    assert!(status["first_error"]
        .as_str()
        .unwrap()
        .contains("primary key"));
}

#[test]
fn test_update_filtered_view() {
    let cluster = seeded_cluster();
    // update(filter(users, row.age > 18), row -> {adult: true})
    let filtered = call(
        Builtin::Filter(Predicate {
            arg: "row".to_string(),
            body: Box::new(call(
                Builtin::Compare(Comparison::Gt),
                vec![get_attr(var("row"), "age"), num(18.0)],
            )),
        }),
        vec![users_table()],
    );
    let wq = WriteQuery::Update {
        view: filtered,
        mapping: mapping("row", object(vec![("adult", Term::Bool(true))])),
    };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status["updated"], json!(1));

    let rows = table_rows(&cluster);
    assert!(rows.contains(&json!({"id": 1, "age": 10})));
    assert!(rows.contains(&json!({"id": 2, "age": 30, "adult": true})));
}

// ============================================================================
// REPLACE
// ============================================================================

#[test]
fn test_replace_rows_entirely() {
    let cluster = seeded_cluster();
    // replace(users, row -> {id: row.id, v: 1})
    let wq = WriteQuery::Replace {
        view: users_table(),
        mapping: mapping(
            "row",
            object(vec![("id", get_attr(var("row"), "id")), ("v", num(1.0))]),
        ),
    };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status["modified"], json!(2));
    assert_eq!(status["deleted"], json!(0));

    let rows = table_rows(&cluster);
    assert!(rows.contains(&json!({"id": 1, "v": 1})));
    assert!(rows.contains(&json!({"id": 2, "v": 1})));
}

#[test]
fn test_replace_with_null_deletes() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Replace {
        view: users_table(),
        mapping: mapping("row", Term::Null),
    };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status["modified"], json!(0));
    assert_eq!(status["deleted"], json!(2));
    assert!(table_rows(&cluster).is_empty());
}

#[test]
fn test_replace_must_keep_the_primary_key() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::Replace {
        view: users_table(),
        mapping: mapping("row", object(vec![("id", num(77.0))])),
    };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status["modified"], json!(0));
    assert_eq!(status["errors"], json!(2));
}

// ============================================================================
// DELETE
// ============================================================================

#[test]
fn test_delete_filtered_view() {
    let cluster = seeded_cluster();
    let filtered = call(
        Builtin::Filter(Predicate {
            arg: "row".to_string(),
            body: Box::new(call(
                Builtin::Compare(Comparison::Gt),
                vec![get_attr(var("row"), "age"), num(18.0)],
            )),
        }),
        vec![users_table()],
    );
    let wq = WriteQuery::Delete { view: filtered };
    let status = status(&run_write(&cluster, wq));
    assert_eq!(status, json!({"deleted": 1}));

    let rows = table_rows(&cluster);
    assert_eq!(rows, vec![json!({"id": 1, "age": 10})]);
}

// ============================================================================
// Point operations
// ============================================================================

#[test]
fn test_point_update() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::PointUpdate {
        table: users_ref(),
        attr: "id".to_string(),
        key: num(1.0),
        mapping: mapping("row", object(vec![("age", num(11.0))])),
    };
    let status1 = status(&run_write(&cluster, wq));
    assert_eq!(status1, json!({"updated": 1, "skipped": 0, "errors": 0}));
    assert!(table_rows(&cluster).contains(&json!({"id": 1, "age": 11})));

    // Missing key is skipped.
    let wq = WriteQuery::PointUpdate {
        table: users_ref(),
        attr: "id".to_string(),
        key: num(42.0),
        mapping: mapping("row", object(vec![("age", num(1.0))])),
    };
    let status2 = status(&run_write(&cluster, wq));
    assert_eq!(status2, json!({"updated": 0, "skipped": 1, "errors": 0}));
}

#[test]
fn test_point_delete() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::PointDelete {
        table: users_ref(),
        attr: "id".to_string(),
        key: num(1.0),
    };
    let status1 = status(&run_write(&cluster, wq));
    assert_eq!(status1, json!({"deleted": 1}));
    assert_eq!(table_rows(&cluster).len(), 1);

    let wq = WriteQuery::PointDelete {
        table: users_ref(),
        attr: "id".to_string(),
        key: num(1.0),
    };
    let status2 = status(&run_write(&cluster, wq));
    assert_eq!(status2, json!({"deleted": 0}));
}

#[test]
fn test_point_op_on_non_primary_attribute() {
    let cluster = seeded_cluster();
    let wq = WriteQuery::PointDelete {
        table: users_ref(),
        attr: "age".to_string(),
        key: num(10.0),
    };
    let response = run_write(&cluster, wq);
    assert_eq!(response.status_code, StatusCode::RuntimeError);
    assert!(response
        .error_message
        .as_deref()
        .unwrap()
        .contains("not the primary key"));
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancelled_write_raises() {
    let cluster = seeded_cluster();
    let interruptor = Interruptor::new();
    interruptor.interrupt();
    let wq = WriteQuery::Insert {
        table: users_ref(),
        terms: vec![object(vec![("id", num(9.0))])],
    };
    let response = executor_for(&cluster).execute(&Query::write(1, wq), &interruptor);
    assert_eq!(response.status_code, StatusCode::RuntimeError);
    assert!(response
        .error_message
        .as_deref()
        .unwrap()
        .contains("interrupted"));
}
