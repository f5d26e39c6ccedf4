//! Term evaluation.
//!
//! `eval` produces a JSON value, `eval_stream` a lazy stream, `eval_view`
//! a stream still carrying its table access handle. The mode for each
//! subtree follows its static type; `Let` and `If` delegate to whichever
//! mode their caller asked for.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::ast::{Builtin, TableRef, Term};
use crate::backtrace::{argument_frame, Backtrace};
use crate::error::{QlError, QlResult};
use crate::source::TableHandle;
use crate::stream::{JsonStream, StreamMultiplexer};
use crate::typecheck::get_term_type;
use crate::types::TermType;

use super::call;
use super::helpers::{expect_bool, number_from_f64};
use super::{RuntimeEnvironment, View};

/// Evaluate a term to a JSON value.
pub fn eval(t: &Term, env: &mut RuntimeEnvironment, bt: &Backtrace) -> QlResult<Value> {
    match t {
        Term::Null => Ok(Value::Null),
        Term::Bool(b) => Ok(Value::Bool(*b)),
        Term::Number(n) => Ok(Value::Number(number_from_f64(*n))),
        Term::String(s) => Ok(Value::String(s.clone())),

        Term::Array(elements) => {
            let mut out = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                let child = bt.descend(format!("element:{}", i + 1));
                out.push(eval(element, env, &child)?);
            }
            Ok(Value::Array(out))
        }

        Term::Object(fields) => {
            let mut out = Map::new();
            for (name, value) in fields {
                let child = bt.descend(format!("field:{}", name));
                out.insert(name.clone(), eval(value, env, &child)?);
            }
            Ok(Value::Object(out))
        }

        Term::Var(name) => env.scope.get(name).cloned().ok_or_else(|| {
            QlError::runtime(format!("variable `{}` is not bound to a value", name), bt)
        }),

        Term::Let { bindings, body } => {
            eval_let(bindings, env, bt, |env| eval(body, env, &bt.descend("body")))
        }

        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            if eval_test(test, env, bt)? {
                eval(true_branch, env, &bt.descend("true"))
            } else {
                eval(false_branch, env, &bt.descend("false"))
            }
        }

        Term::Call { builtin, args } => call::eval_call(builtin, args, env, bt),

        Term::Error(message) => Err(QlError::runtime(message.clone(), bt)),

        Term::GetByKey { table, attr, key } => {
            let handle = eval_table_handle(table, env, bt)?;
            if attr != handle.primary_key() {
                return Err(QlError::runtime(
                    format!("getbykey: attribute `{}` is not the primary key", attr),
                    bt,
                ));
            }
            let key = eval(key, env, &bt.descend("key"))?;
            env.interruptor.check(bt)?;
            let row = handle.get(&key).map_err(|e| e.at(bt))?;
            Ok(row.unwrap_or(Value::Null))
        }

        Term::Table(_) => Err(QlError::runtime("a table is not a value", bt)),

        Term::Javascript(source) => {
            let closure = capture_closure(env, bt)?;
            let argument = env.implicit_value.get_value().cloned();
            env.interruptor.check(bt)?;
            env.scripts
                .run_js(source, &closure, argument.as_ref())
                .map_err(|e| e.at(bt))
        }

        Term::ImplicitVar => env
            .implicit_value
            .get_value()
            .cloned()
            .ok_or_else(|| QlError::runtime("implicit value is not set", bt)),
    }
}

/// Evaluate a term to a stream.
pub fn eval_stream(t: &Term, env: &mut RuntimeEnvironment, bt: &Backtrace) -> QlResult<JsonStream> {
    match t {
        Term::Let { bindings, body } => eval_let(bindings, env, bt, |env| {
            eval_stream(body, env, &bt.descend("body"))
        }),

        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            if eval_test(test, env, bt)? {
                eval_stream(true_branch, env, &bt.descend("true"))
            } else {
                eval_stream(false_branch, env, &bt.descend("false"))
            }
        }

        Term::Var(name) => match env.stream_scope.get(name) {
            Some(mux) => Ok(StreamMultiplexer::reader(mux)),
            None => Err(QlError::runtime(
                format!("variable `{}` is not bound to a stream", name),
                bt,
            )),
        },

        Term::Call { builtin, args } => call::eval_call_stream(builtin, args, env, bt),

        Term::Table(_) => Ok(eval_view(t, env, bt)?.stream),

        Term::Error(message) => Err(QlError::runtime(message.clone(), bt)),

        _ => Err(QlError::runtime("term does not produce a stream", bt)),
    }
}

/// Evaluate a view term: a table scan, or a filter narrowing another view.
pub fn eval_view(t: &Term, env: &mut RuntimeEnvironment, bt: &Backtrace) -> QlResult<View> {
    match t {
        Term::Table(table) => {
            let handle = eval_table_handle(table, env, bt)?;
            let rows = handle.scan().map_err(|e| e.at(bt))?;
            let stream = JsonStream::scan(rows, env.interruptor.clone(), bt.clone());
            Ok(View {
                access: handle,
                stream,
            })
        }

        Term::Call {
            builtin: Builtin::Filter(predicate),
            args,
        } => {
            let arg = args
                .first()
                .ok_or_else(|| QlError::runtime("filter requires a stream argument", bt))?;
            let inner = eval_view(arg, env, &bt.descend(argument_frame(0)))?;
            let pred = call::compile_predicate(predicate, env, bt);
            Ok(View {
                access: inner.access,
                stream: JsonStream::filter(inner.stream, pred),
            })
        }

        Term::Let { bindings, body } => eval_let(bindings, env, bt, |env| {
            eval_view(body, env, &bt.descend("body"))
        }),

        Term::If {
            test,
            true_branch,
            false_branch,
        } => {
            if eval_test(test, env, bt)? {
                eval_view(true_branch, env, &bt.descend("true"))
            } else {
                eval_view(false_branch, env, &bt.descend("false"))
            }
        }

        _ => Err(QlError::runtime("term does not produce a view", bt)),
    }
}

/// Resolve a table reference through the metadata snapshot and the
/// namespace repository.
pub(super) fn eval_table_handle(
    table: &TableRef,
    env: &RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Rc<dyn TableHandle>> {
    let snapshot = env.metadata.snapshot();
    let meta = snapshot.resolve(table).ok_or_else(|| {
        QlError::runtime(
            format!("table `{}.{}` not found", table.db_name, table.table_name),
            bt,
        )
    })?;
    env.ns_repo.access(&meta.id).map_err(|e| e.at(bt))
}

fn eval_test(test: &Term, env: &mut RuntimeEnvironment, bt: &Backtrace) -> QlResult<bool> {
    let child = bt.descend("test");
    let value = eval(test, env, &child)?;
    expect_bool(&value, "branch test", &child)
}

/// Evaluate let-bindings sequentially, each in the mode its static type
/// dictates, then run `body` in the same frames. Stream bindings are
/// wrapped in a multiplexer so every later reference replays the whole
/// sequence.
fn eval_let<R>(
    bindings: &[(String, Term)],
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
    body: impl FnOnce(&mut RuntimeEnvironment) -> QlResult<R>,
) -> QlResult<R> {
    env.with_frames(|env| {
        for (name, rhs) in bindings {
            let child = bt.descend(format!("bind:{}", name));
            let t = get_term_type(rhs, &mut env.type_env, &child)?;
            match t {
                TermType::Stream | TermType::View => {
                    let stream = eval_stream(rhs, env, &child)?;
                    let mux = Rc::new(RefCell::new(StreamMultiplexer::new(stream)));
                    env.bind_stream(name, mux);
                }
                _ => {
                    let value = eval(rhs, env, &child)?;
                    env.bind_value(name, value);
                }
            }
        }
        body(env)
    })
}

/// Flatten the value scope into the closure map shipped to the script
/// pool. Stream-valued variables cannot cross the process boundary; any
/// stream binding not shadowed by a value binding is a runtime error.
fn capture_closure(env: &RuntimeEnvironment, bt: &Backtrace) -> QlResult<Map<String, Value>> {
    let values = env.scope.dump();
    for name in env.stream_scope.dump().keys() {
        if !values.contains_key(name) {
            return Err(QlError::runtime(
                format!("cannot capture stream variable `{}` in a JavaScript closure", name),
                bt,
            ));
        }
    }
    Ok(values.into_iter().collect())
}
