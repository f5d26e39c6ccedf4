//! Write query execution.
//!
//! Every write resolves its target to a table access handle and reports a
//! status object with operation counts. Record operations are best-effort
//! independent: one failing record is counted and its message kept, and
//! the rest of the batch proceeds. The cancellation signal is polled
//! before each record.

use std::rc::Rc;

use serde_json::{json, Map, Value};

use crate::ast::{Mapping, Term, WriteQuery};
use crate::backtrace::Backtrace;
use crate::error::{QlError, QlResult};
use crate::source::{TableHandle, WriteOutcome};

use super::call::apply_mapping;
use super::evaluate::{eval, eval_table_handle, eval_view};
use super::helpers::{attr_or_null, expect_object, fingerprint, values_equal};
use super::RuntimeEnvironment;

/// Execute a write query, returning its status object.
pub fn execute_write_query(
    wq: &WriteQuery,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Value> {
    match wq {
        WriteQuery::Insert { table, terms } => {
            let handle = eval_table_handle(table, env, bt)?;
            let pk = handle.primary_key().to_string();
            let mut inserted = 0usize;
            let mut tally = ErrorTally::default();
            for (i, term) in terms.iter().enumerate() {
                env.interruptor.check(bt)?;
                let child = bt.descend(format!("term:{}", i + 1));
                match insert_row(&handle, &pk, term, env, &child) {
                    Ok(()) => inserted += 1,
                    Err(e) => tally.record(e),
                }
            }
            tracing::debug!(inserted, errors = tally.errors, "insert batch complete");
            Ok(tally.finish(json!({ "inserted": inserted })))
        }

        WriteQuery::Update { view, mapping } => {
            let view = eval_view(view, env, &bt.descend("view"))?;
            let pk = view.access.primary_key().to_string();
            let mut stream = view.stream;
            let mbt = bt.descend("mapping");
            let mut updated = 0usize;
            let mut skipped = 0usize;
            let mut tally = ErrorTally::default();
            while let Some(row) = stream.next()? {
                env.interruptor.check(bt)?;
                match update_row(&view.access, &pk, mapping, row, env, &mbt) {
                    Ok(true) => updated += 1,
                    Ok(false) => skipped += 1,
                    Err(e) => tally.record(e),
                }
            }
            tracing::debug!(updated, skipped, errors = tally.errors, "update complete");
            Ok(tally.finish(json!({ "updated": updated, "skipped": skipped })))
        }

        WriteQuery::Replace { view, mapping } => {
            let view = eval_view(view, env, &bt.descend("view"))?;
            let pk = view.access.primary_key().to_string();
            let mut stream = view.stream;
            let mbt = bt.descend("mapping");
            let mut modified = 0usize;
            let mut deleted = 0usize;
            let mut tally = ErrorTally::default();
            while let Some(row) = stream.next()? {
                env.interruptor.check(bt)?;
                match replace_row(&view.access, &pk, mapping, row, env, &mbt) {
                    Ok(RowOutcome::Replaced) => modified += 1,
                    Ok(RowOutcome::Deleted) => deleted += 1,
                    Err(e) => tally.record(e),
                }
            }
            tracing::debug!(modified, deleted, errors = tally.errors, "replace complete");
            Ok(tally.finish(json!({ "modified": modified, "deleted": deleted })))
        }

        WriteQuery::Delete { view } => {
            let view = eval_view(view, env, &bt.descend("view"))?;
            let pk = view.access.primary_key().to_string();
            let mut stream = view.stream;
            let mut deleted = 0usize;
            while let Some(row) = stream.next()? {
                env.interruptor.check(bt)?;
                let key = attr_or_null(&row, &pk);
                let outcome = view
                    .access
                    .replace(&key, &mut |_| Ok(None))
                    .map_err(|e| e.at(bt))?;
                if outcome == WriteOutcome::Deleted {
                    deleted += 1;
                }
            }
            tracing::debug!(deleted, "delete complete");
            Ok(json!({ "deleted": deleted }))
        }

        WriteQuery::PointUpdate {
            table,
            attr,
            key,
            mapping,
        } => {
            let handle = eval_table_handle(table, env, bt)?;
            let pk = check_point_attr(&handle, attr, bt)?;
            let key = eval(key, env, &bt.descend("key"))?;
            env.interruptor.check(bt)?;
            match handle.get(&key).map_err(|e| e.at(bt))? {
                None => Ok(json!({ "updated": 0, "skipped": 1, "errors": 0 })),
                Some(row) => {
                    let changed =
                        update_row(&handle, &pk, mapping, row, env, &bt.descend("mapping"))?;
                    let (updated, skipped) = if changed { (1, 0) } else { (0, 1) };
                    Ok(json!({ "updated": updated, "skipped": skipped, "errors": 0 }))
                }
            }
        }

        WriteQuery::PointDelete { table, attr, key } => {
            let handle = eval_table_handle(table, env, bt)?;
            check_point_attr(&handle, attr, bt)?;
            let key = eval(key, env, &bt.descend("key"))?;
            env.interruptor.check(bt)?;
            let outcome = handle
                .replace(&key, &mut |_| Ok(None))
                .map_err(|e| e.at(bt))?;
            let deleted = usize::from(outcome == WriteOutcome::Deleted);
            Ok(json!({ "deleted": deleted }))
        }
    }
}

enum RowOutcome {
    Replaced,
    Deleted,
}

#[derive(Default)]
struct ErrorTally {
    errors: usize,
    first_error: Option<String>,
}

impl ErrorTally {
    fn record(&mut self, e: QlError) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(e.to_string());
        }
    }

    /// Fold the counters into the status object.
    fn finish(self, mut status: Value) -> Value {
        if let Some(obj) = status.as_object_mut() {
            obj.insert("errors".to_string(), json!(self.errors));
            if let Some(message) = self.first_error {
                obj.insert("first_error".to_string(), json!(message));
            }
        }
        status
    }
}

fn check_point_attr(
    handle: &Rc<dyn TableHandle>,
    attr: &str,
    bt: &Backtrace,
) -> QlResult<String> {
    let pk = handle.primary_key();
    if attr != pk {
        return Err(QlError::runtime(
            format!("attribute `{}` is not the primary key", attr),
            bt,
        ));
    }
    Ok(pk.to_string())
}

fn insert_row(
    handle: &Rc<dyn TableHandle>,
    pk: &str,
    term: &Term,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<()> {
    let doc = eval(term, env, bt)?;
    let key = {
        let obj = expect_object(&doc, "insert", bt)?;
        obj.get(pk)
            .ok_or_else(|| {
                QlError::runtime(
                    format!("inserted document must have the `{}` attribute", pk),
                    bt,
                )
            })?
            .clone()
    };
    if handle.get(&key).map_err(|e| e.at(bt))?.is_some() {
        return Err(QlError::runtime(
            format!("duplicate primary key {}", fingerprint(&key)),
            bt,
        ));
    }
    handle
        .replace(&key, &mut |_| Ok(Some(doc.clone())))
        .map_err(|e| e.at(bt))?;
    Ok(())
}

/// Merge the mapping's result into the row. Returns whether anything
/// changed. The primary key must not change.
fn update_row(
    handle: &Rc<dyn TableHandle>,
    pk: &str,
    mapping: &Mapping,
    row: Value,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<bool> {
    let key = attr_or_null(&row, pk);
    let patch = apply_mapping(mapping, row.clone(), env, bt)?;
    let patch_obj = expect_object(&patch, "update", bt)?;
    if let Some(new_key) = patch_obj.get(pk) {
        if !values_equal(new_key, &key) {
            return Err(QlError::runtime("update cannot change the primary key", bt));
        }
    }
    let base: &Map<String, Value> = expect_object(&row, "update", bt)?;
    let merged = super::helpers::merge_objects(base, patch_obj);
    if merged == row {
        return Ok(false);
    }
    handle
        .replace(&key, &mut |_| Ok(Some(merged.clone())))
        .map_err(|e| e.at(bt))?;
    Ok(true)
}

/// The mapping's result replaces the row entirely; `null` deletes it.
fn replace_row(
    handle: &Rc<dyn TableHandle>,
    pk: &str,
    mapping: &Mapping,
    row: Value,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<RowOutcome> {
    let key = attr_or_null(&row, pk);
    let replacement = apply_mapping(mapping, row, env, bt)?;
    match replacement {
        Value::Null => {
            handle
                .replace(&key, &mut |_| Ok(None))
                .map_err(|e| e.at(bt))?;
            Ok(RowOutcome::Deleted)
        }
        Value::Object(ref obj) => {
            match obj.get(pk) {
                Some(new_key) if values_equal(new_key, &key) => {}
                _ => {
                    return Err(QlError::runtime(
                        "replacement must keep the primary key",
                        bt,
                    ))
                }
            }
            handle
                .replace(&key, &mut |_| Ok(Some(replacement.clone())))
                .map_err(|e| e.at(bt))?;
            Ok(RowOutcome::Replaced)
        }
        _ => Err(QlError::runtime(
            "replacement must be an object or null",
            bt,
        )),
    }
}
