//! Lazy single-pass JSON streams.
//!
//! A stream produces finitely many documents one `next()` at a time and is
//! exhausted forever once it returns `None`. Operators compose by wrapping;
//! the whole family is one tagged enum with a single method rather than an
//! open hierarchy. Sharing an upstream between consumers requires a
//! [`StreamMultiplexer`], which replays from a growing buffer so each
//! upstream document is produced exactly once.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::Value;

use crate::backtrace::Backtrace;
use crate::error::QlResult;
use crate::source::{DocIter, Interruptor};

/// Predicate applied by a filter stream. Stateful closures are allowed;
/// `distinct` is a filter over a seen-set.
pub type PredicateFn = Box<dyn FnMut(&Value) -> QlResult<bool>>;

/// Document transform applied by a map stream.
pub type MapFn = Box<dyn FnMut(Value) -> QlResult<Value>>;

/// Substream constructor applied by a concat-map stream.
pub type StreamMapFn = Box<dyn FnMut(Value) -> QlResult<JsonStream>>;

pub enum JsonStream {
    InMemory(InMemoryStream),
    Scan(ScanStream),
    Filter(FilterStream),
    Map(MapStream),
    ConcatMap(ConcatMapStream),
    Limit(LimitStream),
    Slice(SliceStream),
    Union(UnionStream),
    Multiplexed(MultiplexedStream),
}

impl JsonStream {
    /// The next document, or `None` once the stream is exhausted. After
    /// exhaustion every further call returns `None` again.
    pub fn next(&mut self) -> QlResult<Option<Value>> {
        match self {
            JsonStream::InMemory(s) => Ok(s.next()),
            JsonStream::Scan(s) => s.next(),
            JsonStream::Filter(s) => s.next(),
            JsonStream::Map(s) => s.next(),
            JsonStream::ConcatMap(s) => s.next(),
            JsonStream::Limit(s) => s.next(),
            JsonStream::Slice(s) => s.next(),
            JsonStream::Union(s) => s.next(),
            JsonStream::Multiplexed(s) => s.next(),
        }
    }

    /// Materialize the remainder of the stream.
    pub fn drain(&mut self) -> QlResult<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next()? {
            out.push(doc);
        }
        Ok(out)
    }

    pub fn from_vec(docs: Vec<Value>) -> JsonStream {
        JsonStream::InMemory(InMemoryStream::from_vec(docs))
    }

    /// Wrap a table scan. Pulling is a suspension point, so the
    /// cancellation signal is polled on every call.
    pub fn scan(iter: DocIter, interruptor: Interruptor, backtrace: Backtrace) -> JsonStream {
        JsonStream::Scan(ScanStream {
            iter,
            interruptor,
            backtrace,
        })
    }

    pub fn filter(upstream: JsonStream, predicate: PredicateFn) -> JsonStream {
        JsonStream::Filter(FilterStream {
            upstream: Box::new(upstream),
            predicate,
        })
    }

    pub fn map(upstream: JsonStream, mapper: MapFn) -> JsonStream {
        JsonStream::Map(MapStream {
            upstream: Box::new(upstream),
            mapper,
        })
    }

    /// Construction is eager on the first upstream document so the first
    /// `next()` call has a substream ready.
    pub fn concat_map(mut upstream: JsonStream, mut mapper: StreamMapFn) -> QlResult<JsonStream> {
        let substream = match upstream.next()? {
            Some(doc) => Some(Box::new(mapper(doc)?)),
            None => None,
        };
        Ok(JsonStream::ConcatMap(ConcatMapStream {
            upstream: Box::new(upstream),
            mapper,
            substream,
        }))
    }

    pub fn limit(upstream: JsonStream, limit: usize) -> JsonStream {
        JsonStream::Limit(LimitStream {
            upstream: Box::new(upstream),
            remaining: limit,
        })
    }

    /// Documents in `[start, end)` of the upstream.
    pub fn slice(upstream: JsonStream, start: usize, end: usize) -> JsonStream {
        debug_assert!(start <= end);
        JsonStream::Slice(SliceStream {
            upstream: Box::new(upstream),
            to_skip: start,
            remaining: end - start,
        })
    }

    pub fn union(streams: Vec<JsonStream>) -> JsonStream {
        JsonStream::Union(UnionStream {
            streams: streams.into_iter().collect(),
        })
    }
}

/// Materialized sequence; supports in-place sorting before consumption.
pub struct InMemoryStream {
    data: VecDeque<Value>,
}

impl InMemoryStream {
    pub fn from_vec(docs: Vec<Value>) -> Self {
        Self { data: docs.into() }
    }

    /// Drain another stream into memory.
    pub fn from_stream(stream: &mut JsonStream) -> QlResult<Self> {
        Ok(Self::from_vec(stream.drain()?))
    }

    /// Stable sort; ties keep their input order.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.data.make_contiguous().sort_by(compare);
    }

    fn next(&mut self) -> Option<Value> {
        self.data.pop_front()
    }
}

pub struct ScanStream {
    iter: DocIter,
    interruptor: Interruptor,
    backtrace: Backtrace,
}

impl ScanStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        self.interruptor.check(&self.backtrace)?;
        match self.iter.next() {
            Some(doc) => Ok(Some(doc.map_err(|e| e.at(&self.backtrace))?)),
            None => Ok(None),
        }
    }
}

pub struct FilterStream {
    upstream: Box<JsonStream>,
    predicate: PredicateFn,
}

impl FilterStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        while let Some(doc) = self.upstream.next()? {
            if (self.predicate)(&doc)? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }
}

pub struct MapStream {
    upstream: Box<JsonStream>,
    mapper: MapFn,
}

impl MapStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        match self.upstream.next()? {
            Some(doc) => Ok(Some((self.mapper)(doc)?)),
            None => Ok(None),
        }
    }
}

/// Each upstream document yields a substream, flattened in order; a
/// substream is fully drained before the next upstream document is
/// requested.
pub struct ConcatMapStream {
    upstream: Box<JsonStream>,
    mapper: StreamMapFn,
    substream: Option<Box<JsonStream>>,
}

impl ConcatMapStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        loop {
            match &mut self.substream {
                None => return Ok(None),
                Some(sub) => {
                    if let Some(doc) = sub.next()? {
                        return Ok(Some(doc));
                    }
                    self.substream = match self.upstream.next()? {
                        Some(doc) => Some(Box::new((self.mapper)(doc)?)),
                        None => None,
                    };
                }
            }
        }
    }
}

/// Emits at most `remaining` documents and never pulls upstream after
/// that.
pub struct LimitStream {
    upstream: Box<JsonStream>,
    remaining: usize,
}

impl LimitStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.upstream.next()
    }
}

pub struct SliceStream {
    upstream: Box<JsonStream>,
    to_skip: usize,
    remaining: usize,
}

impl SliceStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        while self.to_skip > 0 {
            self.to_skip -= 1;
            if self.upstream.next()?.is_none() {
                self.remaining = 0;
                return Ok(None);
            }
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.upstream.next()
    }
}

/// Concatenates streams in list order.
pub struct UnionStream {
    streams: VecDeque<JsonStream>,
}

impl UnionStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        loop {
            match self.streams.front_mut() {
                None => return Ok(None),
                Some(stream) => match stream.next()? {
                    Some(doc) => return Ok(Some(doc)),
                    None => {
                        self.streams.pop_front();
                    }
                },
            }
        }
    }
}

/// Shares one upstream between any number of derived readers. Documents
/// are buffered as they are pulled, so each is produced by the upstream
/// exactly once and every reader observes the identical sequence, at the
/// cost of O(total-produced) memory.
pub struct StreamMultiplexer {
    upstream: Option<Box<JsonStream>>,
    buffer: Vec<Value>,
}

impl StreamMultiplexer {
    pub fn new(stream: JsonStream) -> Self {
        Self {
            upstream: Some(Box::new(stream)),
            buffer: Vec::new(),
        }
    }

    /// A new reader starting from the first document.
    pub fn reader(parent: &Rc<RefCell<StreamMultiplexer>>) -> JsonStream {
        JsonStream::Multiplexed(MultiplexedStream {
            parent: Rc::clone(parent),
            index: 0,
        })
    }

    fn pull(&mut self) -> QlResult<bool> {
        match &mut self.upstream {
            None => Ok(false),
            Some(up) => match up.next()? {
                Some(doc) => {
                    self.buffer.push(doc);
                    Ok(true)
                }
                None => {
                    self.upstream = None;
                    Ok(false)
                }
            },
        }
    }
}

pub struct MultiplexedStream {
    parent: Rc<RefCell<StreamMultiplexer>>,
    index: usize,
}

impl MultiplexedStream {
    fn next(&mut self) -> QlResult<Option<Value>> {
        let mut parent = self.parent.borrow_mut();
        while self.index >= parent.buffer.len() {
            if !parent.pull()? {
                return Ok(None);
            }
        }
        let doc = parent.buffer[self.index].clone();
        self.index += 1;
        Ok(Some(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn nums(ns: &[i64]) -> JsonStream {
        JsonStream::from_vec(ns.iter().map(|n| json!(n)).collect())
    }

    /// Scan stream whose pulls are counted, for purity checks.
    fn counted(ns: Vec<i64>, counter: Rc<Cell<usize>>) -> JsonStream {
        let iter = ns.into_iter().map(move |n| {
            counter.set(counter.get() + 1);
            Ok(json!(n))
        });
        JsonStream::scan(Box::new(iter), Interruptor::new(), Backtrace::new())
    }

    #[test]
    fn test_exhaustion_is_permanent() {
        let mut s = nums(&[1]);
        assert_eq!(s.next().unwrap(), Some(json!(1)));
        assert_eq!(s.next().unwrap(), None);
        assert_eq!(s.next().unwrap(), None);
    }

    #[test]
    fn test_filter() {
        let mut s = JsonStream::filter(
            nums(&[1, 2, 3, 4]),
            Box::new(|doc| Ok(doc.as_i64().unwrap() % 2 == 0)),
        );
        assert_eq!(s.drain().unwrap(), vec![json!(2), json!(4)]);
    }

    #[test]
    fn test_map_propagates_exhaustion() {
        let mut s = JsonStream::map(
            nums(&[1, 2]),
            Box::new(|doc| Ok(json!(doc.as_i64().unwrap() * 10))),
        );
        assert_eq!(s.drain().unwrap(), vec![json!(10), json!(20)]);
        assert_eq!(s.next().unwrap(), None);
    }

    #[test]
    fn test_concat_map_order() {
        // concat_map(f) over [1, 2, 3] yields f(1) ++ f(2) ++ f(3).
        let mut s = JsonStream::concat_map(
            nums(&[1, 2, 3]),
            Box::new(|doc| {
                let n = doc.as_i64().unwrap();
                Ok(JsonStream::from_vec(vec![json!(n), json!(n * 10)]))
            }),
        )
        .unwrap();
        assert_eq!(
            s.drain().unwrap(),
            vec![json!(1), json!(10), json!(2), json!(20), json!(3), json!(30)]
        );
    }

    #[test]
    fn test_concat_map_skips_empty_substreams() {
        let mut s = JsonStream::concat_map(
            nums(&[1, 2, 3]),
            Box::new(|doc| {
                let n = doc.as_i64().unwrap();
                if n == 2 {
                    Ok(JsonStream::from_vec(vec![]))
                } else {
                    Ok(JsonStream::from_vec(vec![json!(n)]))
                }
            }),
        )
        .unwrap();
        assert_eq!(s.drain().unwrap(), vec![json!(1), json!(3)]);
    }

    #[test]
    fn test_limit_pulls_at_most_n() {
        let counter = Rc::new(Cell::new(0));
        let upstream = counted(vec![1, 2, 3, 4, 5], Rc::clone(&counter));
        let mut s = JsonStream::limit(upstream, 2);
        assert_eq!(s.drain().unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(s.next().unwrap(), None);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_limit_zero() {
        let counter = Rc::new(Cell::new(0));
        let mut s = JsonStream::limit(counted(vec![1], Rc::clone(&counter)), 0);
        assert_eq!(s.next().unwrap(), None);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_slice() {
        let mut s = JsonStream::slice(nums(&[1, 2, 3, 4, 5]), 1, 3);
        assert_eq!(s.drain().unwrap(), vec![json!(2), json!(3)]);

        let mut s = JsonStream::slice(nums(&[1]), 2, 5);
        assert_eq!(s.next().unwrap(), None);
    }

    #[test]
    fn test_union_ordering() {
        let mut s = JsonStream::union(vec![nums(&[1, 2]), nums(&[]), nums(&[3])]);
        assert_eq!(s.drain().unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_multiplexer_replays_for_every_reader() {
        let counter = Rc::new(Cell::new(0));
        let mux = Rc::new(RefCell::new(StreamMultiplexer::new(counted(
            vec![1, 2, 3],
            Rc::clone(&counter),
        ))));

        let mut a = StreamMultiplexer::reader(&mux);
        let mut b = StreamMultiplexer::reader(&mux);

        // Interleaved consumption: both see the identical sequence.
        assert_eq!(a.next().unwrap(), Some(json!(1)));
        assert_eq!(b.next().unwrap(), Some(json!(1)));
        assert_eq!(b.next().unwrap(), Some(json!(2)));
        assert_eq!(a.next().unwrap(), Some(json!(2)));
        assert_eq!(a.drain().unwrap(), vec![json!(3)]);
        assert_eq!(b.drain().unwrap(), vec![json!(3)]);

        // The upstream produced each document exactly once.
        assert_eq!(counter.get(), 3);

        // A reader opened after exhaustion still replays everything.
        let mut c = StreamMultiplexer::reader(&mux);
        assert_eq!(c.drain().unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn test_in_memory_sort_is_stable() {
        let mut s = InMemoryStream::from_vec(vec![
            json!({"k": 1, "t": "a"}),
            json!({"k": 0, "t": "z"}),
            json!({"k": 1, "t": "b"}),
        ]);
        s.sort_by(|a, b| a["k"].as_i64().cmp(&b["k"].as_i64()));
        let mut s = JsonStream::InMemory(s);
        assert_eq!(
            s.drain().unwrap(),
            vec![
                json!({"k": 0, "t": "z"}),
                json!({"k": 1, "t": "a"}),
                json!({"k": 1, "t": "b"}),
            ]
        );
    }

    #[test]
    fn test_scan_polls_interruptor() {
        let interruptor = Interruptor::new();
        let iter = (0..3).map(|n| Ok(json!(n)));
        let mut s = JsonStream::scan(Box::new(iter), interruptor.clone(), Backtrace::new());
        assert_eq!(s.next().unwrap(), Some(json!(0)));
        interruptor.interrupt();
        assert!(s.next().is_err());
    }
}
