//! DocQL Core - Storage-independent typechecker and evaluator for DocQL
//! query trees.
//!
//! This crate is the query-language core of a distributed document
//! database: it receives a client-submitted query tree (a nested
//! expression of read/write operations over JSON-valued tables), checks
//! it against a small type discipline, and evaluates it into a result
//! document or a lazy stream. Storage, cluster metadata, and the external
//! JavaScript runtime stay behind traits, so the same core serves the
//! server and embedded test harnesses.
//!
//! # Main Components
//!
//! - **AST**: the wire query tree (`Query`, `Term`, `Builtin`)
//! - **Typechecker**: rejects malformed messages and ill-typed queries
//!   before anything runs
//! - **Streams**: lazy single-pass document producers composed from
//!   filter/map/concat-map/limit/union, with a multiplexer for sharing
//! - **Executor**: evaluates typechecked trees and dispatches writes
//!
//! # Example
//!
//! ```rust
//! use docql_core::ast::{Builtin, Comparison, Predicate, Query, TableRef, Term};
//! use docql_core::executor::QueryExecutor;
//! use docql_core::response::StatusCode;
//! use docql_core::source::{Interruptor, MemoryCluster, NullScriptPool};
//! use serde_json::json;
//! use std::rc::Rc;
//!
//! let cluster = MemoryCluster::new();
//! cluster.create_table("test", "users", "id");
//! cluster.seed("test", "users", vec![
//!     json!({"id": 1, "age": 30}),
//!     json!({"id": 2, "age": 12}),
//! ]);
//!
//! // filter(users, row -> row.age > 18)
//! let term = Term::Call {
//!     builtin: Builtin::Filter(Predicate {
//!         arg: "row".to_string(),
//!         body: Box::new(Term::Call {
//!             builtin: Builtin::Compare(Comparison::Gt),
//!             args: vec![
//!                 Term::Call {
//!                     builtin: Builtin::GetAttr("age".to_string()),
//!                     args: vec![Term::Var("row".to_string())],
//!                 },
//!                 Term::Number(18.0),
//!             ],
//!         }),
//!     }),
//!     args: vec![Term::Table(TableRef::new("test", "users"))],
//! };
//!
//! let mut executor = QueryExecutor::new(
//!     Rc::new(cluster.clone()),
//!     Rc::new(cluster),
//!     Rc::new(NullScriptPool),
//! );
//! let response = executor.execute(&Query::read(1, term), &Interruptor::new());
//! assert_eq!(response.status_code, StatusCode::SuccessStream);
//! assert_eq!(response.response, vec![r#"{"age":30,"id":1}"#.to_string()]);
//! ```

pub mod ast;
pub mod backtrace;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod response;
pub mod scope;
pub mod source;
pub mod stream;
pub mod typecheck;
pub mod types;

// Re-export main types for convenience
pub use ast::{
    Builtin, Comparison, Mapping, OrderKey, Predicate, Query, QueryType, ReadQuery, Reduction,
    TableRef, Term, WriteQuery,
};
pub use backtrace::Backtrace;
pub use error::{QlError, QlResult};
pub use executor::{eval, eval_stream, eval_view, QueryExecutor, RuntimeEnvironment, View};
pub use response::{Response, StatusCode};
pub use source::{
    Interruptor, MemoryCluster, MetadataView, NamespaceRepo, NullScriptPool, ScriptPool,
    TableHandle,
};
pub use stream::{JsonStream, StreamMultiplexer};
pub use types::{FunctionType, TermType, TypeEnvironment};
