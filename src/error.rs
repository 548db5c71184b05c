//! The user-facing error taxonomy of the concretization pipeline.
//!
//! Every stage either returns a clean result or exactly one of these typed
//! errors; no stage leaves partial state behind. Internal invariant
//! violations (a validated assignment failing to materialize, for example)
//! are programming errors and panic instead of surfacing here.

use thiserror::Error;

/// Malformed abstract-spec text. Rejecting the input creates no state, so
/// this is always recoverable locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid spec `{input}`: {reason} (at offset {offset})")]
pub struct ParseError {
    /// The full text that was being parsed.
    pub input: String,
    /// What the parser expected or could not accept.
    pub reason: String,
    /// Byte offset into `input` where parsing failed.
    pub offset: usize,
}

impl ParseError {
    pub(crate) fn new(input: impl Into<String>, reason: impl Into<String>, offset: usize) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
            offset,
        }
    }
}

/// A hard-constraint conflict: no assignment can satisfy every constraint.
///
/// The message describes the first detected pairwise conflict together with
/// the dependency chains that produced both sides. This is a best-effort
/// diagnostic, not a guaranteed-minimal unsatisfiable core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", fmt_chain(.required_by))]
pub struct UnsatisfiableSpecError {
    /// Human-diagnosable description of the conflicting constraint pair.
    pub message: String,
    /// Dependency chain from the root to the package the conflict is about.
    pub required_by: Vec<String>,
}

impl UnsatisfiableSpecError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            required_by: Vec::new(),
        }
    }

    pub(crate) fn with_chain(message: impl Into<String>, required_by: Vec<String>) -> Self {
        Self {
            message: message.into(),
            required_by,
        }
    }
}

/// Any failure of [`crate::concretize`].
#[derive(Debug, Clone, Error)]
pub enum ConcretizeError {
    /// The abstract spec text could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A referenced package or virtual name does not exist in the repository.
    #[error("unknown package `{name}`{}", fmt_chain(.required_by))]
    UnknownPackage {
        /// The offending package or virtual name.
        name: String,
        /// Dependency chain from the root to the reference.
        required_by: Vec<String>,
    },

    /// No assignment satisfies all hard constraints.
    #[error(transparent)]
    Unsatisfiable(#[from] UnsatisfiableSpecError),

    /// Zero providers of a virtual dependency satisfy its condition.
    #[error("no provider of virtual `{virtual_name}` is satisfiable{}", fmt_chain(.required_by))]
    NoProvider {
        /// The virtual name that could not be resolved.
        virtual_name: String,
        /// Dependency chain from the root to the virtual edge.
        required_by: Vec<String>,
    },

    /// The search exceeded its bounded effort before finding any solution.
    /// The caller may retry with relaxed constraints or a larger budget; the
    /// engine never relaxes constraints on its own.
    #[error("concretization gave up after {decisions} decisions without finding a solution")]
    Timeout {
        /// Number of decisions explored before giving up.
        decisions: u64,
    },
}

fn fmt_chain(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (dependency chain: {})", chain.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_rendering() {
        let err = ConcretizeError::UnknownPackage {
            name: "mpifoo".to_string(),
            required_by: vec!["app".to_string(), "lib".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "unknown package `mpifoo` (dependency chain: app -> lib)"
        );

        let err = UnsatisfiableSpecError::new("package a requires b@:1.0 but package c requires b@2:");
        assert_eq!(
            err.to_string(),
            "package a requires b@:1.0 but package c requires b@2:"
        );
    }
}
