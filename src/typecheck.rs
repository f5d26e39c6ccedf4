//! Static typechecking of query trees.
//!
//! A query is checked before any evaluation happens. Structural faults
//! (a READ query without a read subtree, an `orderby` without keys) are
//! protocol errors blamed on the client library; everything else that
//! fails here is a bad-query error blamed on the user, carrying the
//! descent backtrace. A tree that passes never raises a bad-query error
//! later: every variable the evaluator reads was proven in scope here.

use crate::ast::{Builtin, Mapping, Predicate, Query, QueryType, ReadQuery, Reduction, Term, WriteQuery};
use crate::backtrace::{argument_frame, Backtrace};
use crate::error::{QlError, QlResult};
use crate::types::{FunctionType, TermType, TypeEnvironment};

impl TypeEnvironment {
    /// Run `f` inside a fresh scope frame; pops on every exit path.
    pub fn with_scope_frame<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scope.push();
        let out = f(self);
        self.scope.pop();
        out
    }

    /// Run `f` with an implicit-row type on the stack.
    pub fn with_implicit_type<R>(&mut self, t: TermType, f: impl FnOnce(&mut Self) -> R) -> R {
        self.implicit_type.push(t);
        let out = f(self);
        self.implicit_type.pop();
        out
    }
}

/// Check a complete wire query. CONTINUE and STOP carry no tree and always
/// pass; READ and WRITE must carry the matching subtree.
pub fn check_query(q: &Query, env: &mut TypeEnvironment, bt: &Backtrace) -> QlResult<()> {
    match q.query_type {
        QueryType::Read => {
            let read = q
                .read
                .as_ref()
                .ok_or_else(|| QlError::bad_protobuf("READ query has no read subtree"))?;
            check_read_query(read, env, bt)?;
            Ok(())
        }
        QueryType::Write => {
            let write = q
                .write
                .as_ref()
                .ok_or_else(|| QlError::bad_protobuf("WRITE query has no write subtree"))?;
            check_write_query(write, env, bt)
        }
        QueryType::Continue | QueryType::Stop => Ok(()),
    }
}

/// Check a read query and report the type its term will evaluate to, which
/// decides whether the evaluator runs in value or stream mode.
pub fn check_read_query(rq: &ReadQuery, env: &mut TypeEnvironment, bt: &Backtrace) -> QlResult<TermType> {
    get_term_type(&rq.term, env, bt)
}

pub fn check_write_query(wq: &WriteQuery, env: &mut TypeEnvironment, bt: &Backtrace) -> QlResult<()> {
    match wq {
        WriteQuery::Insert { terms, .. } => {
            for (i, term) in terms.iter().enumerate() {
                let child = bt.descend(format!("term:{}", i + 1));
                check_term_type(term, TermType::Json, env, &child)?;
            }
            Ok(())
        }
        WriteQuery::Update { view, mapping } | WriteQuery::Replace { view, mapping } => {
            check_term_type(view, TermType::View, env, &bt.descend("view"))?;
            check_mapping(mapping, TermType::Json, env, &bt.descend("mapping"))
        }
        WriteQuery::Delete { view } => {
            check_term_type(view, TermType::View, env, &bt.descend("view"))
        }
        WriteQuery::PointUpdate { key, mapping, .. } => {
            check_term_type(key, TermType::Json, env, &bt.descend("key"))?;
            check_mapping(mapping, TermType::Json, env, &bt.descend("mapping"))
        }
        WriteQuery::PointDelete { key, .. } => {
            check_term_type(key, TermType::Json, env, &bt.descend("key"))
        }
    }
}

/// Infer the type of a term under the environment.
pub fn get_term_type(t: &Term, env: &mut TypeEnvironment, bt: &Backtrace) -> QlResult<TermType> {
    match t {
        Term::Null | Term::Bool(_) | Term::Number(_) | Term::String(_) => Ok(TermType::Json),

        Term::Array(elements) => {
            for (i, element) in elements.iter().enumerate() {
                let child = bt.descend(format!("element:{}", i + 1));
                check_term_type(element, TermType::Json, env, &child)?;
            }
            Ok(TermType::Json)
        }

        Term::Object(fields) => {
            for (name, value) in fields {
                let child = bt.descend(format!("field:{}", name));
                check_term_type(value, TermType::Json, env, &child)?;
            }
            Ok(TermType::Json)
        }

        Term::Var(name) => env.scope.get(name).copied().ok_or_else(|| {
            QlError::bad_query(format!("variable `{}` is not in scope", name), bt)
        }),

        Term::Let { bindings, body } => env.with_scope_frame(|env| {
            for (name, rhs) in bindings {
                let child = bt.descend(format!("bind:{}", name));
                let mut t = get_term_type(rhs, env, &child)?;
                // A let-bound view degrades to a plain stream: the binding
                // is replayed through a multiplexer, which has no access
                // handle.
                if t == TermType::View {
                    t = TermType::Stream;
                }
                env.scope.put(name.clone(), t);
            }
            get_term_type(body, env, &bt.descend("body"))
        }),

        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            check_term_type(test, TermType::Json, env, &bt.descend("test"))?;
            let t1 = get_term_type(true_branch, env, &bt.descend("true"))?;
            let t2 = get_term_type(false_branch, env, &bt.descend("false"))?;
            t1.join(t2).ok_or_else(|| {
                QlError::bad_query(
                    format!("branches of `if` have incompatible types: {} vs {}", t1, t2),
                    bt,
                )
            })
        }

        Term::Call { builtin, args } => check_call(builtin, args, env, bt),

        Term::Error(_) => Ok(TermType::Arbitrary),

        Term::GetByKey { key, .. } => {
            check_term_type(key, TermType::Json, env, &bt.descend("key"))?;
            Ok(TermType::Json)
        }

        Term::Table(_) => Ok(TermType::View),

        Term::Javascript(_) => Ok(TermType::Json),

        Term::ImplicitVar => env.implicit_type.get_value().copied().ok_or_else(|| {
            QlError::bad_query("implicit variable is not defined in this context", bt)
        }),
    }
}

/// Check a term against an expected type. An `Arbitrary` actual satisfies
/// anything; a `View` satisfies an expected `Stream`.
pub fn check_term_type(
    t: &Term,
    expected: TermType,
    env: &mut TypeEnvironment,
    bt: &Backtrace,
) -> QlResult<()> {
    let actual = get_term_type(t, env, bt)?;
    if actual.is_convertible_to(expected) {
        Ok(())
    } else {
        Err(QlError::bad_query(
            format!("expected type {}, got {}", expected, actual),
            bt,
        ))
    }
}

fn check_call(
    builtin: &Builtin,
    args: &[Term],
    env: &mut TypeEnvironment,
    bt: &Backtrace,
) -> QlResult<TermType> {
    let ft = get_function_type(builtin, env, bt)?;

    if !ft.arity_matches(args.len()) {
        return Err(QlError::bad_query(
            format!(
                "wrong number of arguments: expected {}, got {}",
                ft.n_args().unwrap_or_default(),
                args.len()
            ),
            bt,
        ));
    }

    for (i, arg) in args.iter().enumerate() {
        let child = bt.descend(argument_frame(i));
        check_term_type(arg, ft.arg_type(i), env, &child)?;
        check_literal_operand(builtin, arg, &child)?;
    }

    // Filtering a view keeps its access handle, so write queries can
    // target a narrowed table.
    if matches!(builtin, Builtin::Filter(_)) && !args.is_empty() {
        if get_term_type(&args[0], env, bt)? == TermType::View {
            return Ok(TermType::View);
        }
    }

    Ok(ft.return_type())
}

/// The JSON kind of a literal term, when it is one.
fn literal_kind(t: &Term) -> Option<&'static str> {
    match t {
        Term::Null => Some("null"),
        Term::Bool(_) => Some("boolean"),
        Term::Number(_) => Some("number"),
        Term::String(_) => Some("string"),
        Term::Array(_) => Some("array"),
        Term::Object(_) => Some("object"),
        _ => None,
    }
}

/// Kind-restricted builtins reject literal operands of the wrong JSON kind
/// already at typecheck time; non-literal operands are still checked at
/// runtime.
fn check_literal_operand(builtin: &Builtin, arg: &Term, bt: &Backtrace) -> QlResult<()> {
    let required = match builtin {
        Builtin::Add
        | Builtin::Subtract
        | Builtin::Multiply
        | Builtin::Divide
        | Builtin::Modulo => "number",
        Builtin::Concat => "string",
        Builtin::Not | Builtin::Any | Builtin::All => "boolean",
        _ => return Ok(()),
    };
    match literal_kind(arg) {
        Some(kind) if kind != required => Err(QlError::bad_query(
            format!("expected a {} here, got a {} literal", required, kind),
            bt,
        )),
        _ => Ok(()),
    }
}

/// Resolve a builtin's signature. Builtins that carry function bodies
/// (filter, map, reductions) typecheck those bodies here, under the
/// current environment.
pub fn get_function_type(
    builtin: &Builtin,
    env: &mut TypeEnvironment,
    bt: &Backtrace,
) -> QlResult<FunctionType> {
    use TermType::{Json, Stream};

    match builtin {
        Builtin::Not | Builtin::GetAttr(_) | Builtin::HasAttr(_) | Builtin::PickAttrs(_) => {
            Ok(FunctionType::fixed(&[Json], Json))
        }

        Builtin::ImplicitGetAttr(_) => {
            if !env.implicit_type.has_value() {
                return Err(QlError::bad_query(
                    "implicit attribute access outside of a row context",
                    bt,
                ));
            }
            Ok(FunctionType::fixed(&[], Json))
        }

        Builtin::MapMerge | Builtin::ArrayAppend => Ok(FunctionType::fixed(&[Json, Json], Json)),

        Builtin::Add | Builtin::Multiply | Builtin::Concat => {
            Ok(FunctionType::variadic(Json, Json))
        }

        Builtin::Subtract | Builtin::Divide | Builtin::Modulo => {
            Ok(FunctionType::fixed(&[Json, Json], Json))
        }

        Builtin::Compare(_) | Builtin::Any | Builtin::All => {
            Ok(FunctionType::variadic(Json, Json))
        }

        Builtin::Filter(predicate) => {
            check_predicate(predicate, env, &bt.descend("predicate"))?;
            Ok(FunctionType::fixed(&[Stream], Stream))
        }

        Builtin::Map(mapping) => {
            check_mapping(mapping, Json, env, &bt.descend("mapping"))?;
            Ok(FunctionType::fixed(&[Stream], Stream))
        }

        Builtin::ConcatMap(mapping) => {
            check_mapping(mapping, Stream, env, &bt.descend("mapping"))?;
            Ok(FunctionType::fixed(&[Stream], Stream))
        }

        Builtin::OrderBy(keys) => {
            if keys.is_empty() {
                return Err(QlError::bad_protobuf("orderby requires at least one key"));
            }
            Ok(FunctionType::fixed(&[Stream], Stream))
        }

        Builtin::Distinct => Ok(FunctionType::fixed(&[Stream], Stream)),
        Builtin::Limit => Ok(FunctionType::fixed(&[Stream, Json], Stream)),
        Builtin::Slice => Ok(FunctionType::fixed(&[Stream, Json, Json], Stream)),
        Builtin::Union => Ok(FunctionType::variadic(Stream, Stream)),

        Builtin::Length | Builtin::StreamToArray => Ok(FunctionType::fixed(&[Stream], Json)),
        Builtin::Nth => Ok(FunctionType::fixed(&[Stream, Json], Json)),
        Builtin::ArrayToStream => Ok(FunctionType::fixed(&[Json], Stream)),

        Builtin::Reduce(reduction) => {
            check_reduction(reduction, env, &bt.descend("reduction"))?;
            Ok(FunctionType::fixed(&[Stream], Json))
        }

        Builtin::GroupedMapReduce {
            grouping,
            value_mapping,
            reduction,
        } => {
            check_mapping(grouping, Json, env, &bt.descend("grouping"))?;
            check_mapping(value_mapping, Json, env, &bt.descend("mapping"))?;
            check_reduction(reduction, env, &bt.descend("reduction"))?;
            Ok(FunctionType::fixed(&[Stream], Json))
        }
    }
}

/// The mapping argument is bound by name and as the implicit row, both as
/// `Json`, while the body is checked against `return_type`.
pub fn check_mapping(
    m: &Mapping,
    return_type: TermType,
    env: &mut TypeEnvironment,
    bt: &Backtrace,
) -> QlResult<()> {
    env.with_scope_frame(|env| {
        env.scope.put(m.arg.clone(), TermType::Json);
        env.with_implicit_type(TermType::Json, |env| {
            check_term_type(&m.body, return_type, env, &bt.descend("body"))
        })
    })
}

pub fn check_predicate(p: &Predicate, env: &mut TypeEnvironment, bt: &Backtrace) -> QlResult<()> {
    env.with_scope_frame(|env| {
        env.scope.put(p.arg.clone(), TermType::Json);
        env.with_implicit_type(TermType::Json, |env| {
            check_term_type(&p.body, TermType::Json, env, &bt.descend("body"))
        })
    })
}

/// Both fold variables are plain JSON; the base must be JSON too.
pub fn check_reduction(r: &Reduction, env: &mut TypeEnvironment, bt: &Backtrace) -> QlResult<()> {
    check_term_type(&r.base, TermType::Json, env, &bt.descend("base"))?;
    env.with_scope_frame(|env| {
        env.scope.put(r.var1.clone(), TermType::Json);
        env.scope.put(r.var2.clone(), TermType::Json);
        check_term_type(&r.body, TermType::Json, env, &bt.descend("body"))
    })
}
