//! The typed error taxonomy surfaced at the boundary of the lowering engine.
//!
//! Internally, fallible functions return [`anyhow::Result`] (re-exported as [`crate::Result`]),
//! built up with `.context(...)` the way the rest of the crate composes errors. [`LowerError`] is
//! the fixed, matchable vocabulary attached at the point a failure is first detected; callers that
//! need to distinguish a fatal compiler bug from a merely unsupported source construct can recover
//! it with `error.downcast_ref::<LowerError>()`.

/// One of the five kinds of failure the lowering engine can report.
///
/// See the module documentation for how this relates to [`crate::Result`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LowerError {
    /// An identifier could not be found in any enclosing scope.
    #[error("could not resolve identifier `{name}`")]
    Resolution {
        /// The identifier that could not be resolved.
        name: String,
    },

    /// A declaring closure context for a captured variable could not be located while walking the
    /// parent chain. Per §4.2, this indicates a front-end bug and is always fatal.
    #[error("cannot resolve closure variable `{name}`")]
    ClosureVariableUnresolved {
        /// The captured variable's name.
        name: String,
    },

    /// An assignment or operator's operand types did not satisfy any applicable matching
    /// relation (exact, class-inherit, array-any, to-any, or from-any).
    #[error("type mismatch: cannot use a value of type `{found}` where `{expected}` was expected")]
    TypeMismatch {
        /// The type that was required by context.
        expected: String,
        /// The type that was actually supplied.
        found: String,
    },

    /// A source construct that is not (yet) lowered.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// An internal cache entry, slot index, or other invariant disagreed with itself. Always
    /// indicates a bug in this crate, never a malformed input.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// The emitted module failed the final [`wasmparser::Validator`] pass.
    #[error("emitted module failed validation: {0}")]
    ValidationFailure(String),
}

impl LowerError {
    /// Shorthand for constructing an [`LowerError::Unsupported`] wrapped in [`anyhow::Error`].
    pub(crate) fn unsupported(feature: &'static str) -> anyhow::Error {
        anyhow::Error::from(Self::Unsupported(feature))
    }

    /// Shorthand for constructing an [`LowerError::InvariantViolation`] wrapped in
    /// [`anyhow::Error`].
    pub(crate) fn invariant(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::from(Self::InvariantViolation(message.into()))
    }
}
