//! Backtraces for error attribution.
//!
//! A backtrace is the ordered path of descent through a query tree:
//! `"argument:2"`, `"predicate"`, `"body"`, and so on. The typechecker and
//! the evaluator both extend the trace with [`Backtrace::descend`] before
//! entering a subtree, so any error raised below carries the full path to
//! the node that caused it.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backtrace {
    frames: Vec<String>,
}

impl Backtrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this backtrace extended by one frame.
    pub fn descend(&self, frame: impl Into<String>) -> Backtrace {
        let mut frames = self.frames.clone();
        frames.push(frame.into());
        Backtrace { frames }
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, frame: &str) -> bool {
        self.frames.iter().any(|f| f == frame)
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.frames.join("/"))
    }
}

/// Frame label for the nth (0-based) argument of a builtin call. Frames are
/// numbered from 1 in the wire format.
pub fn argument_frame(n: usize) -> String {
    format!("argument:{}", n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descend_does_not_mutate_parent() {
        let root = Backtrace::new();
        let child = root.descend("argument:1").descend("predicate");
        assert!(root.is_empty());
        assert_eq!(child.frames(), ["argument:1", "predicate"]);
    }

    #[test]
    fn test_display() {
        let bt = Backtrace::new().descend("view").descend("mapping").descend("body");
        assert_eq!(bt.to_string(), "view/mapping/body");
    }

    #[test]
    fn test_argument_frame_is_one_based() {
        assert_eq!(argument_frame(0), "argument:1");
        assert_eq!(argument_frame(2), "argument:3");
    }
}
