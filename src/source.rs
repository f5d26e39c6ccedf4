//! External collaborator contracts and in-memory implementations.
//!
//! The core does not own storage, cluster metadata, or the external script
//! runtime; it consumes them through the traits here. `MemoryCluster`
//! implements all of them in memory so the crate is testable and embeddable
//! without a server.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::ast::TableRef;
use crate::backtrace::Backtrace;
use crate::error::{QlError, QlResult};
use crate::executor::helpers::fingerprint;

/// Iterator over the rows of a table, as handed out by a [`TableHandle`].
/// An implementation may fetch lazily in batches; each item can fail.
pub type DocIter = Box<dyn Iterator<Item = QlResult<Value>>>;

/// Cancellation signal set by the surrounding request handler on client
/// disconnect or deadline expiry. Every suspension point polls it.
#[derive(Debug, Clone, Default)]
pub struct Interruptor {
    flag: Arc<AtomicBool>,
}

impl Interruptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self, bt: &Backtrace) -> QlResult<()> {
        if self.is_set() {
            Err(QlError::runtime("query interrupted", bt))
        } else {
            Ok(())
        }
    }
}

/// Outcome of a keyed replace on a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The replacement equals the stored row.
    Unchanged,
    Deleted,
    /// The row was absent and the replacement produced nothing.
    Skipped,
}

/// Replacement function: maps the current row (if any) to the new row
/// (`None` deletes).
pub type ReplaceFn<'a> = &'a mut dyn FnMut(Option<Value>) -> QlResult<Option<Value>>;

/// Access handle to one table's shard set.
pub trait TableHandle {
    fn primary_key(&self) -> &str;

    fn get(&self, key: &Value) -> QlResult<Option<Value>>;

    /// Atomically replace the row at `key` with the result of `f`.
    fn replace(&self, key: &Value, f: ReplaceFn) -> QlResult<WriteOutcome>;

    /// Open a full scan of the table.
    fn scan(&self) -> QlResult<DocIter>;
}

/// The namespace repository: resolves a table id to an access handle.
pub trait NamespaceRepo {
    fn access(&self, table_id: &str) -> QlResult<Rc<dyn TableHandle>>;
}

/// The external-process pool running user-supplied JavaScript. The closure
/// is the flattened variable scope; the argument is the implicit row, when
/// one is bound.
pub trait ScriptPool {
    fn run_js(
        &self,
        source: &str,
        closure: &Map<String, Value>,
        argument: Option<&Value>,
    ) -> QlResult<Value>;
}

/// A script pool that rejects every invocation. Used by embedders that do
/// not attach a JavaScript runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScriptPool;

impl ScriptPool for NullScriptPool {
    fn run_js(&self, _: &str, _: &Map<String, Value>, _: Option<&Value>) -> QlResult<Value> {
        Err(QlError::source("no JavaScript runtime is attached"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMetadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub id: String,
    pub db_name: String,
    pub name: String,
    pub primary_key: String,
}

/// Read-only snapshot of cluster metadata. Shared by reference within a
/// query; updates happen only between queries.
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    pub databases: Vec<DatabaseMetadata>,
    pub tables: Vec<TableMetadata>,
}

impl MetadataSnapshot {
    pub fn resolve(&self, table: &TableRef) -> Option<&TableMetadata> {
        self.tables
            .iter()
            .find(|t| t.db_name == table.db_name && t.name == table.table_name)
    }
}

pub trait MetadataView {
    fn snapshot(&self) -> MetadataSnapshot;
}

struct ClusterState {
    databases: Vec<DatabaseMetadata>,
    tables: Vec<TableMetadata>,
    /// table id → key fingerprint → row. BTreeMap keeps scans
    /// deterministic.
    rows: HashMap<String, BTreeMap<String, Value>>,
}

/// In-memory cluster: namespace repository, metadata view, and storage in
/// one. Single-threaded by design, matching the per-query worker model.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Rc<RefCell<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ClusterState {
                databases: Vec::new(),
                tables: Vec::new(),
                rows: HashMap::new(),
            })),
        }
    }

    /// Create a table (and its database, if new). Returns the table id.
    pub fn create_table(&self, db_name: &str, table_name: &str, primary_key: &str) -> String {
        let mut state = self.state.borrow_mut();
        if !state.databases.iter().any(|d| d.name == db_name) {
            state.databases.push(DatabaseMetadata {
                name: db_name.to_string(),
            });
        }
        let id = format!("{}.{}", db_name, table_name);
        state.tables.push(TableMetadata {
            id: id.clone(),
            db_name: db_name.to_string(),
            name: table_name.to_string(),
            primary_key: primary_key.to_string(),
        });
        state.rows.insert(id.clone(), BTreeMap::new());
        id
    }

    /// Insert rows directly, keyed by their primary-key attribute.
    ///
    /// # Panics
    /// Panics if the table was not created first; this is a fixture API
    /// for tests and embedders, not a query path.
    pub fn seed(&self, db_name: &str, table_name: &str, docs: Vec<Value>) {
        let mut state = self.state.borrow_mut();
        let (id, pk) = {
            let meta = state
                .tables
                .iter()
                .find(|t| t.db_name == db_name && t.name == table_name)
                .expect("seed: unknown table");
            (meta.id.clone(), meta.primary_key.clone())
        };
        let table = state.rows.get_mut(&id).expect("seed: missing row map");
        for doc in docs {
            let key = doc.get(&pk).cloned().unwrap_or(Value::Null);
            table.insert(fingerprint(&key), doc);
        }
    }
}

struct MemoryTable {
    table_id: String,
    primary_key: String,
    state: Rc<RefCell<ClusterState>>,
}

impl TableHandle for MemoryTable {
    fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn get(&self, key: &Value) -> QlResult<Option<Value>> {
        let state = self.state.borrow();
        let table = state
            .rows
            .get(&self.table_id)
            .ok_or_else(|| QlError::source(format!("table `{}` is gone", self.table_id)))?;
        Ok(table.get(&fingerprint(key)).cloned())
    }

    fn replace(&self, key: &Value, f: ReplaceFn) -> QlResult<WriteOutcome> {
        let mut state = self.state.borrow_mut();
        let table = state
            .rows
            .get_mut(&self.table_id)
            .ok_or_else(|| QlError::source(format!("table `{}` is gone", self.table_id)))?;
        let slot = fingerprint(key);
        let old = table.get(&slot).cloned();
        let new = f(old.clone())?;
        Ok(match (old, new) {
            (None, Some(row)) => {
                table.insert(slot, row);
                WriteOutcome::Inserted
            }
            (Some(old), Some(row)) => {
                if old == row {
                    WriteOutcome::Unchanged
                } else {
                    table.insert(slot, row);
                    WriteOutcome::Updated
                }
            }
            (Some(_), None) => {
                table.remove(&slot);
                WriteOutcome::Deleted
            }
            (None, None) => WriteOutcome::Skipped,
        })
    }

    fn scan(&self) -> QlResult<DocIter> {
        let state = self.state.borrow();
        let table = state
            .rows
            .get(&self.table_id)
            .ok_or_else(|| QlError::source(format!("table `{}` is gone", self.table_id)))?;
        let docs: Vec<Value> = table.values().cloned().collect();
        Ok(Box::new(docs.into_iter().map(Ok)))
    }
}

impl NamespaceRepo for MemoryCluster {
    fn access(&self, table_id: &str) -> QlResult<Rc<dyn TableHandle>> {
        let state = self.state.borrow();
        let meta = state
            .tables
            .iter()
            .find(|t| t.id == table_id)
            .ok_or_else(|| QlError::source(format!("no namespace for table id `{}`", table_id)))?;
        Ok(Rc::new(MemoryTable {
            table_id: meta.id.clone(),
            primary_key: meta.primary_key.clone(),
            state: Rc::clone(&self.state),
        }))
    }
}

impl MetadataView for MemoryCluster {
    fn snapshot(&self) -> MetadataSnapshot {
        let state = self.state.borrow();
        MetadataSnapshot {
            databases: state.databases.clone(),
            tables: state.tables.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(cluster: &MemoryCluster) -> Rc<dyn TableHandle> {
        cluster.access("test.users").unwrap()
    }

    fn seeded() -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.create_table("test", "users", "id");
        cluster.seed(
            "test",
            "users",
            vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})],
        );
        cluster
    }

    #[test]
    fn test_metadata_resolution() {
        let cluster = seeded();
        let snapshot = cluster.snapshot();
        let meta = snapshot.resolve(&TableRef::new("test", "users")).unwrap();
        assert_eq!(meta.id, "test.users");
        assert_eq!(meta.primary_key, "id");
        assert!(snapshot.resolve(&TableRef::new("test", "ghost")).is_none());
    }

    #[test]
    fn test_get_and_scan() {
        let cluster = seeded();
        let handle = handle(&cluster);
        assert_eq!(
            handle.get(&json!(1)).unwrap(),
            Some(json!({"id": 1, "name": "a"}))
        );
        assert_eq!(handle.get(&json!(9)).unwrap(), None);

        let docs: Vec<Value> = handle
            .scan()
            .unwrap()
            .collect::<QlResult<Vec<_>>>()
            .unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_replace_outcomes() {
        let cluster = seeded();
        let handle = handle(&cluster);

        let outcome = handle
            .replace(&json!(3), &mut |_| Ok(Some(json!({"id": 3}))))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Inserted);

        let outcome = handle
            .replace(&json!(3), &mut |old| Ok(old))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Unchanged);

        let outcome = handle
            .replace(&json!(3), &mut |_| Ok(Some(json!({"id": 3, "x": 1}))))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Updated);

        let outcome = handle.replace(&json!(3), &mut |_| Ok(None)).unwrap();
        assert_eq!(outcome, WriteOutcome::Deleted);

        let outcome = handle.replace(&json!(3), &mut |_| Ok(None)).unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped);
    }

    #[test]
    fn test_interruptor() {
        let interruptor = Interruptor::new();
        let bt = Backtrace::new();
        assert!(interruptor.check(&bt).is_ok());
        interruptor.interrupt();
        assert!(matches!(
            interruptor.check(&bt),
            Err(QlError::Runtime { .. })
        ));
    }
}
