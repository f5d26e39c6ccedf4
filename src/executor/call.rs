//! Builtin dispatch.
//!
//! Value-producing builtins evaluate their arguments eagerly; stream
//! operators build lazy pipelines whose closures capture a clone of the
//! environment, so a stream stays usable after the frame that built it
//! returns.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::ast::{Builtin, Mapping, Predicate, Reduction, Term};
use crate::backtrace::{argument_frame, Backtrace};
use crate::error::{QlError, QlResult};
use crate::stream::{JsonStream, MapFn, PredicateFn, StreamMapFn};

use super::evaluate::{eval, eval_stream};
use super::helpers::{
    attr_or_null, compare_values, comparison_holds, expect_array, expect_bool, expect_f64,
    expect_nonneg_int, expect_object, expect_str, fingerprint, group_key_label, merge_objects,
    number_from_f64,
};
use super::RuntimeEnvironment;

/// Arity guard for fixed-arity arms. The typechecker already rejects
/// wrong counts; this keeps direct `eval` callers from indexing past the
/// argument list.
fn want_args(args: &[Term], n: usize, what: &str, bt: &Backtrace) -> QlResult<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(QlError::runtime(
            format!("{} requires {} arguments, got {}", what, n, args.len()),
            bt,
        ))
    }
}

pub(super) fn eval_call(
    builtin: &Builtin,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Value> {
    match builtin {
        Builtin::Not => {
            want_args(args, 1, "not", bt)?;
            let vals = eval_args(args, env, bt)?;
            let b = expect_bool(&vals[0], "not", &bt.descend(argument_frame(0)))?;
            Ok(Value::Bool(!b))
        }

        Builtin::GetAttr(attr) => {
            want_args(args, 1, "getattr", bt)?;
            let vals = eval_args(args, env, bt)?;
            get_attr(&vals[0], attr, &bt.descend(argument_frame(0)))
        }

        Builtin::ImplicitGetAttr(attr) => {
            let row = env
                .implicit_value
                .get_value()
                .cloned()
                .ok_or_else(|| QlError::runtime("implicit value is not set", bt))?;
            get_attr(&row, attr, bt)
        }

        Builtin::HasAttr(attr) => {
            want_args(args, 1, "hasattr", bt)?;
            let vals = eval_args(args, env, bt)?;
            let obj = expect_object(&vals[0], "hasattr", &bt.descend(argument_frame(0)))?;
            Ok(Value::Bool(obj.contains_key(attr)))
        }

        Builtin::PickAttrs(attrs) => {
            want_args(args, 1, "pickattrs", bt)?;
            let vals = eval_args(args, env, bt)?;
            let obj = expect_object(&vals[0], "pickattrs", &bt.descend(argument_frame(0)))?;
            let mut out = Map::new();
            for attr in attrs {
                if let Some(v) = obj.get(attr) {
                    out.insert(attr.clone(), v.clone());
                }
            }
            Ok(Value::Object(out))
        }

        Builtin::MapMerge => {
            want_args(args, 2, "mapmerge", bt)?;
            let vals = eval_args(args, env, bt)?;
            let base = expect_object(&vals[0], "mapmerge", &bt.descend(argument_frame(0)))?;
            let patch = expect_object(&vals[1], "mapmerge", &bt.descend(argument_frame(1)))?;
            Ok(merge_objects(base, patch))
        }

        Builtin::ArrayAppend => {
            want_args(args, 2, "arrayappend", bt)?;
            let vals = eval_args(args, env, bt)?;
            let mut out =
                expect_array(&vals[0], "arrayappend", &bt.descend(argument_frame(0)))?.clone();
            out.push(vals[1].clone());
            Ok(Value::Array(out))
        }

        Builtin::Add => fold_numbers(args, env, bt, "add", 0.0, |acc, n| acc + n),
        Builtin::Multiply => fold_numbers(args, env, bt, "multiply", 1.0, |acc, n| acc * n),

        Builtin::Subtract => {
            let (a, b) = two_numbers(args, env, bt, "subtract")?;
            finite_number(a - b, "subtract", bt)
        }

        Builtin::Divide => {
            let (a, b) = two_numbers(args, env, bt, "divide")?;
            if b == 0.0 {
                return Err(QlError::runtime("division by zero", bt));
            }
            finite_number(a / b, "divide", bt)
        }

        Builtin::Modulo => {
            let (a, b) = two_numbers(args, env, bt, "modulo")?;
            if b == 0.0 {
                return Err(QlError::runtime("division by zero", bt));
            }
            finite_number(a % b, "modulo", bt)
        }

        Builtin::Concat => {
            let vals = eval_args(args, env, bt)?;
            let mut out = String::new();
            for (i, v) in vals.iter().enumerate() {
                out.push_str(expect_str(v, "concat", &bt.descend(argument_frame(i)))?);
            }
            Ok(Value::String(out))
        }

        Builtin::Compare(cmp) => {
            let vals = eval_args(args, env, bt)?;
            let holds = vals.windows(2).all(|w| comparison_holds(*cmp, &w[0], &w[1]));
            Ok(Value::Bool(holds))
        }

        Builtin::Any => {
            let vals = eval_args(args, env, bt)?;
            let mut out = false;
            for (i, v) in vals.iter().enumerate() {
                out |= expect_bool(v, "any", &bt.descend(argument_frame(i)))?;
            }
            Ok(Value::Bool(out))
        }

        Builtin::All => {
            let vals = eval_args(args, env, bt)?;
            let mut out = true;
            for (i, v) in vals.iter().enumerate() {
                out &= expect_bool(v, "all", &bt.descend(argument_frame(i)))?;
            }
            Ok(Value::Bool(out))
        }

        Builtin::Length => {
            want_args(args, 1, "length", bt)?;
            let mut stream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let mut n: u64 = 0;
            while stream.next()?.is_some() {
                n += 1;
            }
            Ok(Value::Number(n.into()))
        }

        Builtin::Nth => {
            want_args(args, 2, "nth", bt)?;
            let mut stream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let index = eval(&args[1], env, &bt.descend(argument_frame(1)))?;
            let index = expect_nonneg_int(&index, "nth", &bt.descend(argument_frame(1)))?;
            for _ in 0..index {
                if stream.next()?.is_none() {
                    return Err(QlError::runtime("nth: index out of range", bt));
                }
            }
            stream
                .next()?
                .ok_or_else(|| QlError::runtime("nth: index out of range", bt))
        }

        Builtin::StreamToArray => {
            want_args(args, 1, "streamtoarray", bt)?;
            let mut stream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            Ok(Value::Array(stream.drain()?))
        }

        Builtin::Reduce(reduction) => {
            want_args(args, 1, "reduce", bt)?;
            let mut stream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let rbt = bt.descend("reduction");
            let mut acc = eval(&reduction.base, env, &rbt.descend("base"))?;
            while let Some(doc) = stream.next()? {
                acc = apply_reduction(reduction, acc, doc, env, &rbt)?;
            }
            Ok(acc)
        }

        Builtin::GroupedMapReduce {
            grouping,
            value_mapping,
            reduction,
        } => eval_grouped_map_reduce(grouping, value_mapping, reduction, args, env, bt),

        _ => Err(QlError::runtime("builtin does not produce a value", bt)),
    }
}

pub(super) fn eval_call_stream(
    builtin: &Builtin,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<JsonStream> {
    match builtin {
        Builtin::Filter(predicate) => {
            want_args(args, 1, "filter", bt)?;
            let upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let pred = compile_predicate(predicate, env, bt);
            Ok(JsonStream::filter(upstream, pred))
        }

        Builtin::Map(mapping) => {
            want_args(args, 1, "map", bt)?;
            let upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let mapper = compile_mapping(mapping, env, bt);
            Ok(JsonStream::map(upstream, mapper))
        }

        Builtin::ConcatMap(mapping) => {
            want_args(args, 1, "concatmap", bt)?;
            let upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let mapper = compile_stream_mapping(mapping, env, bt);
            JsonStream::concat_map(upstream, mapper)
        }

        Builtin::OrderBy(keys) => {
            want_args(args, 1, "orderby", bt)?;
            let mut upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let mut sorted = crate::stream::InMemoryStream::from_stream(&mut upstream)?;
            let keys = keys.clone();
            sorted.sort_by(move |a, b| {
                for key in &keys {
                    let ord =
                        compare_values(&attr_or_null(a, &key.attr), &attr_or_null(b, &key.attr));
                    let ord = if key.ascending { ord } else { ord.reverse() };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            Ok(JsonStream::InMemory(sorted))
        }

        Builtin::Distinct => {
            want_args(args, 1, "distinct", bt)?;
            let upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let mut seen = HashSet::new();
            Ok(JsonStream::filter(
                upstream,
                Box::new(move |doc| Ok(seen.insert(fingerprint(doc)))),
            ))
        }

        Builtin::Limit => {
            want_args(args, 2, "limit", bt)?;
            let upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let count = eval(&args[1], env, &bt.descend(argument_frame(1)))?;
            let count = expect_nonneg_int(&count, "limit", &bt.descend(argument_frame(1)))?;
            Ok(JsonStream::limit(upstream, count))
        }

        Builtin::Slice => {
            want_args(args, 3, "slice", bt)?;
            let upstream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
            let start = eval(&args[1], env, &bt.descend(argument_frame(1)))?;
            let start = expect_nonneg_int(&start, "slice", &bt.descend(argument_frame(1)))?;
            let end = eval(&args[2], env, &bt.descend(argument_frame(2)))?;
            let end = expect_nonneg_int(&end, "slice", &bt.descend(argument_frame(2)))?;
            if end < start {
                return Err(QlError::runtime("slice: end is before start", bt));
            }
            Ok(JsonStream::slice(upstream, start, end))
        }

        Builtin::Union => {
            let mut streams = Vec::with_capacity(args.len());
            for (i, arg) in args.iter().enumerate() {
                streams.push(eval_stream(arg, env, &bt.descend(argument_frame(i)))?);
            }
            Ok(JsonStream::union(streams))
        }

        Builtin::ArrayToStream => {
            want_args(args, 1, "arraytostream", bt)?;
            let value = eval(&args[0], env, &bt.descend(argument_frame(0)))?;
            let array = expect_array(&value, "arraytostream", &bt.descend(argument_frame(0)))?;
            Ok(JsonStream::from_vec(array.clone()))
        }

        _ => Err(QlError::runtime("builtin does not produce a stream", bt)),
    }
}

/// Bind `doc` as the lambda argument and the implicit row, then evaluate
/// the body. All frames pop on every exit path.
fn apply_lambda(
    arg: &str,
    body: &Term,
    doc: Value,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Value> {
    env.with_frames(|env| {
        env.bind_value(arg, doc.clone());
        env.with_implicit_row(doc, |env| eval(body, env, &bt.descend("body")))
    })
}

pub(super) fn apply_mapping(
    m: &Mapping,
    doc: Value,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Value> {
    apply_lambda(&m.arg, &m.body, doc, env, bt)
}

fn apply_reduction(
    r: &Reduction,
    acc: Value,
    doc: Value,
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Value> {
    env.with_frames(|env| {
        env.bind_value(&r.var1, acc);
        env.bind_value(&r.var2, doc);
        eval(&r.body, env, &bt.descend("body"))
    })
}

/// Compile a predicate into a stream closure over a captured copy of the
/// environment. The body must produce a boolean.
pub(super) fn compile_predicate(
    p: &Predicate,
    env: &RuntimeEnvironment,
    bt: &Backtrace,
) -> PredicateFn {
    let p = p.clone();
    let mut captured = env.clone();
    let bt = bt.descend("predicate");
    Box::new(move |doc| {
        let value = apply_lambda(&p.arg, &p.body, doc.clone(), &mut captured, &bt)?;
        expect_bool(&value, "predicate", &bt)
    })
}

fn compile_mapping(m: &Mapping, env: &RuntimeEnvironment, bt: &Backtrace) -> MapFn {
    let m = m.clone();
    let mut captured = env.clone();
    let bt = bt.descend("mapping");
    Box::new(move |doc| apply_lambda(&m.arg, &m.body, doc, &mut captured, &bt))
}

/// Like `compile_mapping`, but the body must produce a stream at runtime.
fn compile_stream_mapping(m: &Mapping, env: &RuntimeEnvironment, bt: &Backtrace) -> StreamMapFn {
    let m = m.clone();
    let mut captured = env.clone();
    let bt = bt.descend("mapping");
    Box::new(move |doc| {
        captured.with_frames(|env| {
            env.bind_value(&m.arg, doc.clone());
            env.with_implicit_row(doc, |env| eval_stream(&m.body, env, &bt.descend("body")))
        })
    })
}

fn eval_grouped_map_reduce(
    grouping: &Mapping,
    value_mapping: &Mapping,
    reduction: &Reduction,
    args: &[Term],
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
) -> QlResult<Value> {
    want_args(args, 1, "groupedmapreduce", bt)?;
    let mut stream = eval_stream(&args[0], env, &bt.descend(argument_frame(0)))?;
    let rbt = bt.descend("reduction");
    let mut groups: BTreeMap<String, Value> = BTreeMap::new();
    while let Some(doc) = stream.next()? {
        let key = apply_mapping(grouping, doc.clone(), env, &bt.descend("grouping"))?;
        let mapped = apply_mapping(value_mapping, doc, env, &bt.descend("mapping"))?;
        let label = group_key_label(&key);
        let acc = match groups.remove(&label) {
            Some(acc) => acc,
            None => eval(&reduction.base, env, &rbt.descend("base"))?,
        };
        groups.insert(label, apply_reduction(reduction, acc, mapped, env, &rbt)?);
    }
    Ok(Value::Object(groups.into_iter().collect()))
}

fn eval_args(args: &[Term], env: &mut RuntimeEnvironment, bt: &Backtrace) -> QlResult<Vec<Value>> {
    let mut out = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        out.push(eval(arg, env, &bt.descend(argument_frame(i)))?);
    }
    Ok(out)
}

fn get_attr(value: &Value, attr: &str, bt: &Backtrace) -> QlResult<Value> {
    let obj = expect_object(value, "getattr", bt)?;
    obj.get(attr)
        .cloned()
        .ok_or_else(|| QlError::runtime(format!("object has no attribute `{}`", attr), bt))
}

fn fold_numbers(
    args: &[Term],
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
    what: &str,
    init: f64,
    fold: impl Fn(f64, f64) -> f64,
) -> QlResult<Value> {
    let vals = eval_args(args, env, bt)?;
    let mut acc = init;
    for (i, v) in vals.iter().enumerate() {
        acc = fold(acc, expect_f64(v, what, &bt.descend(argument_frame(i)))?);
    }
    finite_number(acc, what, bt)
}

fn two_numbers(
    args: &[Term],
    env: &mut RuntimeEnvironment,
    bt: &Backtrace,
    what: &str,
) -> QlResult<(f64, f64)> {
    want_args(args, 2, what, bt)?;
    let vals = eval_args(args, env, bt)?;
    let a = expect_f64(&vals[0], what, &bt.descend(argument_frame(0)))?;
    let b = expect_f64(&vals[1], what, &bt.descend(argument_frame(1)))?;
    Ok((a, b))
}

fn finite_number(n: f64, what: &str, bt: &Backtrace) -> QlResult<Value> {
    if n.is_finite() {
        Ok(Value::Number(number_from_f64(n)))
    } else {
        Err(QlError::runtime(
            format!("{}: result is not a finite number", what),
            bt,
        ))
    }
}
