//! The term type discipline and typechecking environment.

use std::fmt;

use crate::scope::{ImplicitStack, VariableScope};

/// Type of a term.
///
/// `View` is a stream that also carries a mutable table access handle, so
/// it satisfies an expected `Stream`. `Arbitrary` is the bottom type
/// inhabited only by `Error` terms; it satisfies every expected type, but
/// an expected `Arbitrary` accepts nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermType {
    Json,
    Stream,
    View,
    Arbitrary,
}

impl TermType {
    /// Whether an actual of this type satisfies `expected`.
    pub fn is_convertible_to(self, expected: TermType) -> bool {
        self == expected
            || self == TermType::Arbitrary
            || (self == TermType::View && expected == TermType::Stream)
    }

    /// Least upper bound of two branch types, if one exists. `Arbitrary`
    /// acts as a wildcard; `View` joined with `Stream` is `Stream`.
    pub fn join(self, other: TermType) -> Option<TermType> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (TermType::Arbitrary, b) => Some(b),
            (a, TermType::Arbitrary) => Some(a),
            (TermType::View, TermType::Stream) | (TermType::Stream, TermType::View) => {
                Some(TermType::Stream)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TermType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TermType::Json => "json",
            TermType::Stream => "stream",
            TermType::View => "view",
            TermType::Arbitrary => "arbitrary",
        };
        write!(f, "{}", name)
    }
}

/// Signature of a builtin: a fixed argument vector (at most three) or a
/// single repeated argument type, plus a return type.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionType {
    Fixed {
        args: Vec<TermType>,
        ret: TermType,
    },
    Variadic {
        arg: TermType,
        ret: TermType,
    },
}

impl FunctionType {
    pub fn fixed(args: &[TermType], ret: TermType) -> Self {
        debug_assert!(args.len() <= 3);
        FunctionType::Fixed {
            args: args.to_vec(),
            ret,
        }
    }

    pub fn variadic(arg: TermType, ret: TermType) -> Self {
        FunctionType::Variadic { arg, ret }
    }

    pub fn is_variadic(&self) -> bool {
        matches!(self, FunctionType::Variadic { .. })
    }

    pub fn return_type(&self) -> TermType {
        match self {
            FunctionType::Fixed { ret, .. } | FunctionType::Variadic { ret, .. } => *ret,
        }
    }

    pub fn arg_type(&self, n: usize) -> TermType {
        match self {
            FunctionType::Fixed { args, .. } => args[n],
            FunctionType::Variadic { arg, .. } => *arg,
        }
    }

    pub fn n_args(&self) -> Option<usize> {
        match self {
            FunctionType::Fixed { args, .. } => Some(args.len()),
            FunctionType::Variadic { .. } => None,
        }
    }

    /// Variadic functions accept any count, including zero.
    pub fn arity_matches(&self, n: usize) -> bool {
        match self {
            FunctionType::Fixed { args, .. } => args.len() == n,
            FunctionType::Variadic { .. } => true,
        }
    }
}

/// The typechecker's environment: a scope of variable types and the
/// implicit-row type stack.
#[derive(Debug, Clone, Default)]
pub struct TypeEnvironment {
    pub scope: VariableScope<TermType>,
    pub implicit_type: ImplicitStack<TermType>,
}

impl TypeEnvironment {
    pub fn new() -> Self {
        Self {
            scope: VariableScope::new(),
            implicit_type: ImplicitStack::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arbitrary_is_one_directional() {
        assert!(TermType::Arbitrary.is_convertible_to(TermType::Json));
        assert!(TermType::Arbitrary.is_convertible_to(TermType::Stream));
        assert!(TermType::Arbitrary.is_convertible_to(TermType::View));
        assert!(!TermType::Json.is_convertible_to(TermType::Arbitrary));
        assert!(!TermType::Stream.is_convertible_to(TermType::Arbitrary));
    }

    #[test]
    fn test_view_satisfies_stream() {
        assert!(TermType::View.is_convertible_to(TermType::Stream));
        assert!(!TermType::Stream.is_convertible_to(TermType::View));
        assert!(!TermType::Json.is_convertible_to(TermType::Stream));
    }

    #[test]
    fn test_join() {
        assert_eq!(TermType::Json.join(TermType::Json), Some(TermType::Json));
        assert_eq!(
            TermType::Arbitrary.join(TermType::Stream),
            Some(TermType::Stream)
        );
        assert_eq!(TermType::View.join(TermType::Stream), Some(TermType::Stream));
        assert_eq!(TermType::Json.join(TermType::Stream), None);
    }

    #[test]
    fn test_function_type_arity() {
        let f = FunctionType::fixed(&[TermType::Stream, TermType::Json], TermType::Stream);
        assert!(f.arity_matches(2));
        assert!(!f.arity_matches(1));
        assert_eq!(f.arg_type(0), TermType::Stream);
        assert_eq!(f.return_type(), TermType::Stream);

        let v = FunctionType::variadic(TermType::Json, TermType::Json);
        assert!(v.arity_matches(0));
        assert!(v.arity_matches(9));
        assert_eq!(v.arg_type(7), TermType::Json);
    }
}
