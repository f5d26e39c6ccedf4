//! AST for DocQL query trees.
//!
//! These types mirror the wire schema: a `Query` selects a read or write
//! operation, and a `Term` is one node of the nested expression over
//! JSON-valued tables. Trees are immutable once constructed; the
//! typechecker and the evaluator only walk them. The read/write subtrees
//! are optional the way they are on the wire, so a client that sets the
//! wrong discriminator is reported as a protocol fault rather than a user
//! error.

/// Wire-level query discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Read,
    Write,
    /// Fetch the next batch of a previously started stream.
    Continue,
    /// Discard a previously started stream.
    Stop,
}

/// A complete client-submitted query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query_type: QueryType,
    /// Client-chosen token echoed in the response; CONTINUE and STOP use it
    /// to address a live stream.
    pub token: i64,
    pub read: Option<ReadQuery>,
    pub write: Option<WriteQuery>,
}

impl Query {
    pub fn read(token: i64, term: Term) -> Self {
        Self {
            query_type: QueryType::Read,
            token,
            read: Some(ReadQuery { term }),
            write: None,
        }
    }

    pub fn write(token: i64, write: WriteQuery) -> Self {
        Self {
            query_type: QueryType::Write,
            token,
            read: None,
            write: Some(write),
        }
    }

    pub fn continue_stream(token: i64) -> Self {
        Self {
            query_type: QueryType::Continue,
            token,
            read: None,
            write: None,
        }
    }

    pub fn stop_stream(token: i64) -> Self {
        Self {
            query_type: QueryType::Stop,
            token,
            read: None,
            write: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuery {
    pub term: Term,
}

/// Write operations. `Update`/`Replace`/`Delete` address a view term (a
/// table, possibly narrowed by `filter`); the point variants address a
/// single row by primary key.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteQuery {
    Insert {
        table: TableRef,
        terms: Vec<Term>,
    },
    Update {
        view: Term,
        mapping: Mapping,
    },
    Replace {
        view: Term,
        mapping: Mapping,
    },
    Delete {
        view: Term,
    },
    PointUpdate {
        table: TableRef,
        attr: String,
        key: Term,
        mapping: Mapping,
    },
    PointDelete {
        table: TableRef,
        attr: String,
        key: Term,
    },
}

/// Reference to a table by database and table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub db_name: String,
    pub table_name: String,
}

impl TableRef {
    pub fn new(db_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            table_name: table_name.into(),
        }
    }
}

/// One node of the query expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Term>),
    Object(Vec<(String, Term)>),

    /// Variable reference.
    Var(String),

    /// Sequential let-bindings: later bindings see earlier ones.
    Let {
        bindings: Vec<(String, Term)>,
        body: Box<Term>,
    },

    If {
        test: Box<Term>,
        true_branch: Box<Term>,
        false_branch: Box<Term>,
    },

    /// Application of a builtin to argument terms.
    Call {
        builtin: Builtin,
        args: Vec<Term>,
    },

    /// Always fails at runtime with the given message. Typechecks as
    /// `Arbitrary`, so it satisfies any expected type.
    Error(String),

    /// Primary-key lookup on a table.
    GetByKey {
        table: TableRef,
        attr: String,
        key: Box<Term>,
    },

    Table(TableRef),

    /// User-supplied JavaScript source, run by the external process pool
    /// against the flattened variable scope.
    Javascript(String),

    /// The current row bound by the innermost shape-mapping operator.
    ImplicitVar,
}

/// Comparison discriminator for the chained `Compare` builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Sort key for `orderby`: attribute name plus direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub attr: String,
    pub ascending: bool,
}

impl OrderKey {
    pub fn asc(attr: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            ascending: true,
        }
    }

    pub fn desc(attr: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            ascending: false,
        }
    }
}

/// A one-argument function body. The argument is bound by name and also
/// becomes the implicit row while the body runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub arg: String,
    pub body: Box<Term>,
}

/// Like [`Mapping`] but the body must produce a boolean.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub arg: String,
    pub body: Box<Term>,
}

/// A two-argument fold step with a base value for the empty stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub base: Box<Term>,
    pub var1: String,
    pub var2: String,
    pub body: Box<Term>,
}

/// Builtin operators. Shape-mapping builtins carry their function bodies
/// here rather than as argument terms, matching the wire schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Builtin {
    Not,
    GetAttr(String),
    ImplicitGetAttr(String),
    HasAttr(String),
    PickAttrs(Vec<String>),
    MapMerge,
    ArrayAppend,

    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,

    Compare(Comparison),
    Any,
    All,

    Filter(Predicate),
    Map(Mapping),
    ConcatMap(Mapping),
    OrderBy(Vec<OrderKey>),
    Distinct,
    Limit,
    Slice,
    Union,

    Length,
    Nth,
    StreamToArray,
    ArrayToStream,
    Reduce(Reduction),
    GroupedMapReduce {
        grouping: Mapping,
        value_mapping: Mapping,
        reduction: Reduction,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_constructors() {
        let q = Query::read(7, Term::Null);
        assert_eq!(q.query_type, QueryType::Read);
        assert_eq!(q.token, 7);
        assert!(q.read.is_some());
        assert!(q.write.is_none());

        let q = Query::continue_stream(7);
        assert_eq!(q.query_type, QueryType::Continue);
        assert!(q.read.is_none());
    }

    #[test]
    fn test_term_tree_construction() {
        let term = Term::Call {
            builtin: Builtin::Add,
            args: vec![Term::Number(1.0), Term::Var("x".to_string())],
        };
        if let Term::Call { builtin, args } = term {
            assert_eq!(builtin, Builtin::Add);
            assert_eq!(args.len(), 2);
        } else {
            panic!("Expected Call");
        }
    }

    #[test]
    fn test_order_key() {
        assert!(OrderKey::asc("k").ascending);
        assert!(!OrderKey::desc("k").ascending);
    }
}
