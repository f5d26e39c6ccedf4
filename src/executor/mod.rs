//! Query execution engine.
//!
//! The executor walks a typechecked query tree and produces either a JSON
//! value, a lazy stream, or a write status object. Each query runs on one
//! worker; the only suspension points are table scans, external script
//! calls, and writes, all of which poll the interruptor.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::ast::{Query, QueryType};
use crate::backtrace::Backtrace;
use crate::cursor::{CursorStore, STREAM_BATCH_SIZE};
use crate::error::{QlError, QlResult};
use crate::response::Response;
use crate::scope::{ImplicitStack, VariableScope};
use crate::source::{Interruptor, MetadataView, NamespaceRepo, ScriptPool, TableHandle};
use crate::stream::{JsonStream, StreamMultiplexer};
use crate::typecheck::{check_read_query, check_write_query};
use crate::types::{TermType, TypeEnvironment};

mod call;
mod evaluate;
pub mod helpers;
mod write;

pub use evaluate::{eval, eval_stream, eval_view};
pub use write::execute_write_query;

/// A stream paired with the access handle of the table it reads from.
/// Write queries address their targets through views.
pub struct View {
    pub access: Rc<dyn TableHandle>,
    pub stream: JsonStream,
}

/// The evaluator's environment: runtime payloads for the same scopes the
/// typechecker proved, plus handles to the external collaborators.
///
/// Stream operators capture a clone of this environment in their closures;
/// collaborator handles are shared by reference count, scopes are copied.
pub struct RuntimeEnvironment {
    /// Variables bound to JSON values.
    pub scope: VariableScope<Value>,
    /// Variables bound to streams, multiplexed so every reference replays
    /// the full sequence.
    pub stream_scope: VariableScope<Rc<RefCell<StreamMultiplexer>>>,
    /// Static types of the bindings, consulted to pick value or stream
    /// mode for nested terms.
    pub type_env: TypeEnvironment,
    /// The implicit "current row".
    pub implicit_value: ImplicitStack<Value>,

    pub ns_repo: Rc<dyn NamespaceRepo>,
    pub metadata: Rc<dyn MetadataView>,
    pub scripts: Rc<dyn ScriptPool>,
    pub interruptor: Interruptor,
}

impl RuntimeEnvironment {
    pub fn new(
        ns_repo: Rc<dyn NamespaceRepo>,
        metadata: Rc<dyn MetadataView>,
        scripts: Rc<dyn ScriptPool>,
        interruptor: Interruptor,
    ) -> Self {
        Self {
            scope: VariableScope::new(),
            stream_scope: VariableScope::new(),
            type_env: TypeEnvironment::new(),
            implicit_value: ImplicitStack::new(),
            ns_repo,
            metadata,
            scripts,
            interruptor,
        }
    }

    /// Run `f` inside a fresh frame on all three variable scopes; the
    /// frames are popped on every exit path.
    pub fn with_frames<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scope.push();
        self.stream_scope.push();
        self.type_env.scope.push();
        let out = f(self);
        self.type_env.scope.pop();
        self.stream_scope.pop();
        self.scope.pop();
        out
    }

    /// Run `f` with `row` as the implicit value (and its type on the
    /// implicit type stack, for nested inference).
    pub fn with_implicit_row<R>(&mut self, row: Value, f: impl FnOnce(&mut Self) -> R) -> R {
        self.implicit_value.push(row);
        self.type_env.implicit_type.push(TermType::Json);
        let out = f(self);
        self.type_env.implicit_type.pop();
        self.implicit_value.pop();
        out
    }

    /// Bind a JSON value in the innermost frame.
    pub fn bind_value(&mut self, name: &str, value: Value) {
        self.type_env.scope.put(name, TermType::Json);
        self.scope.put(name, value);
    }

    /// Bind a multiplexed stream in the innermost frame.
    pub fn bind_stream(&mut self, name: &str, mux: Rc<RefCell<StreamMultiplexer>>) {
        self.type_env.scope.put(name, TermType::Stream);
        self.stream_scope.put(name, mux);
    }
}

impl Clone for RuntimeEnvironment {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            stream_scope: self.stream_scope.clone(),
            type_env: self.type_env.clone(),
            implicit_value: self.implicit_value.clone(),
            ns_repo: Rc::clone(&self.ns_repo),
            metadata: Rc::clone(&self.metadata),
            scripts: Rc::clone(&self.scripts),
            interruptor: self.interruptor.clone(),
        }
    }
}

/// Entry point: typechecks and executes wire queries, holding the live
/// streams that CONTINUE and STOP address by token.
pub struct QueryExecutor {
    ns_repo: Rc<dyn NamespaceRepo>,
    metadata: Rc<dyn MetadataView>,
    scripts: Rc<dyn ScriptPool>,
    cursors: CursorStore,
}

impl QueryExecutor {
    pub fn new(
        ns_repo: Rc<dyn NamespaceRepo>,
        metadata: Rc<dyn MetadataView>,
        scripts: Rc<dyn ScriptPool>,
    ) -> Self {
        Self {
            ns_repo,
            metadata,
            scripts,
            cursors: CursorStore::new(),
        }
    }

    /// Execute one query. Never panics; every failure becomes an error
    /// response carrying the query's token.
    pub fn execute(&mut self, q: &Query, interruptor: &Interruptor) -> Response {
        tracing::debug!(token = q.token, query_type = ?q.query_type, "executing query");
        match self.run(q, interruptor) {
            Ok(response) => response,
            Err(err) => Response::from_error(q.token, &err),
        }
    }

    fn run(&mut self, q: &Query, interruptor: &Interruptor) -> QlResult<Response> {
        let bt = Backtrace::new();
        match q.query_type {
            QueryType::Read => {
                let rq = q
                    .read
                    .as_ref()
                    .ok_or_else(|| QlError::bad_protobuf("READ query has no read subtree"))?;
                let mut type_env = TypeEnvironment::new();
                let term_type = check_read_query(rq, &mut type_env, &bt)?;

                let mut env = self.environment(interruptor);
                match term_type {
                    TermType::Stream | TermType::View => {
                        let stream = eval_stream(&rq.term, &mut env, &bt)?;
                        self.respond_with_batch(q.token, stream)
                    }
                    _ => {
                        let value = eval(&rq.term, &mut env, &bt)?;
                        Ok(Response::json(q.token, &value))
                    }
                }
            }
            QueryType::Write => {
                let wq = q
                    .write
                    .as_ref()
                    .ok_or_else(|| QlError::bad_protobuf("WRITE query has no write subtree"))?;
                let mut type_env = TypeEnvironment::new();
                check_write_query(wq, &mut type_env, &bt)?;

                let mut env = self.environment(interruptor);
                let status = execute_write_query(wq, &mut env, &bt)?;
                Ok(Response::json(q.token, &status))
            }
            QueryType::Continue => {
                let stream = self.cursors.resume(q.token).ok_or_else(|| {
                    QlError::runtime(format!("no open stream for token {}", q.token), &bt)
                })?;
                self.respond_with_batch(q.token, stream)
            }
            QueryType::Stop => {
                self.cursors.discard(q.token);
                Ok(Response::empty(q.token))
            }
        }
    }

    fn environment(&self, interruptor: &Interruptor) -> RuntimeEnvironment {
        RuntimeEnvironment::new(
            Rc::clone(&self.ns_repo),
            Rc::clone(&self.metadata),
            Rc::clone(&self.scripts),
            interruptor.clone(),
        )
    }

    /// Pull up to one batch. An exhausted stream answers with the final
    /// status; otherwise the remainder is parked under the token for a
    /// later CONTINUE.
    fn respond_with_batch(&mut self, token: i64, mut stream: JsonStream) -> QlResult<Response> {
        let mut batch = Vec::new();
        let mut exhausted = false;
        while batch.len() < STREAM_BATCH_SIZE {
            match stream.next()? {
                Some(doc) => batch.push(doc),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        if exhausted {
            Ok(Response::stream(token, &batch))
        } else {
            self.cursors.park(token, stream);
            Ok(Response::partial(token, &batch))
        }
    }
}
