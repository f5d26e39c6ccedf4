//! Lexically nested variable scopes and the implicit-row stack.
//!
//! Both the typechecker and the evaluator thread these through their
//! recursion: the checker carries term types, the evaluator carries JSON
//! values and stream handles. Frames are pushed and popped by lexical
//! construct; the `with_frame`/`with_value` combinators guarantee the pop
//! runs on every exit path, including `?` propagation out of the closure.

use std::collections::HashMap;

/// A stack of name → payload frames searched newest-first.
#[derive(Debug, Clone)]
pub struct VariableScope<T> {
    frames: Vec<HashMap<String, T>>,
}

impl<T> Default for VariableScope<T> {
    fn default() -> Self {
        Self { frames: Vec::new() }
    }
}

impl<T: Clone> VariableScope<T> {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn pop(&mut self) {
        debug_assert!(!self.frames.is_empty(), "unbalanced scope pop");
        self.frames.pop();
    }

    /// Bind in the newest frame, overwriting any same-frame binding.
    pub fn put(&mut self, name: impl Into<String>, value: T) {
        debug_assert!(!self.frames.is_empty(), "binding outside any scope frame");
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    /// Search frames newest-first.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn is_in_scope(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Flatten to a single map where newer frames win. Used to capture a
    /// closure when a mapping body is shipped to the external script pool.
    pub fn dump(&self) -> HashMap<String, T> {
        let mut out = HashMap::new();
        for frame in self.frames.iter().rev() {
            for (name, value) in frame {
                out.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        out
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Run `f` inside a fresh frame; the frame is popped whether `f`
    /// returns a value or an error.
    pub fn with_frame<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push();
        let out = f(self);
        self.pop();
        out
    }
}

/// The implicit "current row" stack. Each frame holds at most one payload,
/// and lookup never walks past the innermost frame: a row bound by an outer
/// shape-mapping operator must not leak into a nested one.
#[derive(Debug, Clone)]
pub struct ImplicitStack<T> {
    frames: Vec<Option<T>>,
}

impl<T: Clone> Default for ImplicitStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ImplicitStack<T> {
    pub fn new() -> Self {
        Self { frames: vec![None] }
    }

    pub fn push_none(&mut self) {
        self.frames.push(None);
    }

    pub fn push(&mut self, value: T) {
        self.frames.push(Some(value));
    }

    pub fn pop(&mut self) {
        debug_assert!(self.frames.len() > 1, "unbalanced implicit pop");
        self.frames.pop();
    }

    /// Whether the innermost frame carries a payload. Outer frames are
    /// never consulted.
    pub fn has_value(&self) -> bool {
        matches!(self.frames.last(), Some(Some(_)))
    }

    pub fn get_value(&self) -> Option<&T> {
        self.frames.last().and_then(|frame| frame.as_ref())
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn with_value<R>(&mut self, value: T, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push(value);
        let out = f(self);
        self.pop();
        out
    }
}
