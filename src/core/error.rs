// This module defines the two tiers of failure in aot-image using thiserror. AotError
// covers invariant violations: a symbol defined twice while merging modules, inconsistent
// table bookkeeping, a module that fails verification. These abort the build rather than
// produce a possibly corrupt image. EmitDiagnostic covers soft failures at emission time:
// an output destination that cannot be opened or written, or a target that cannot produce
// object files. Those are reported and the affected output is skipped while the others
// proceed. AotResult<T> is the convenience alias used throughout the crate.

//! Error types for image building.

use crate::emit::OutputKind;
use crate::ir::{IrError, LinkError, VerifyError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Invariant violations. Any of these means no artifact may be written.
#[derive(Error, Debug)]
pub enum AotError {
    #[error("module merge failed: {0}")]
    Link(#[from] LinkError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("table bookkeeping inconsistent: {reason}")]
    TableInconsistency { reason: String },

    #[error("module verification failed with {} error(s), first: {}", .0.len(), first_error(.0))]
    Verification(Vec<VerifyError>),
}

fn first_error(errors: &[VerifyError]) -> String {
    errors
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

/// Result type alias for image building operations.
pub type AotResult<T> = Result<T, AotError>;

/// Recoverable problems reported while emitting an artifact.
#[derive(Error, Debug)]
pub enum EmitDiagnostic {
    #[error("failed to open {} file '{}': {}", .kind, .path.display(), .source)]
    OpenOutput {
        kind: OutputKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {} file '{}': {}", .kind, .path.display(), .source)]
    WriteOutput {
        kind: OutputKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("target `{triple}` does not support generation of object files")]
    UnsupportedTarget { triple: String },

    #[error("object emission for `{triple}` failed: {reason}")]
    ObjectWrite { triple: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = EmitDiagnostic::OpenOutput {
            kind: OutputKind::Object,
            path: PathBuf::from("/nonexistent/out.o"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such directory"),
        };
        assert_eq!(
            err.to_string(),
            "failed to open object file '/nonexistent/out.o': no such directory"
        );

        let err = AotError::Verification(vec![VerifyError::ComdatOnDeclaration("f".into())]);
        assert_eq!(
            err.to_string(),
            "module verification failed with 1 error(s), first: declaration `f` is placed in a comdat"
        );
    }
}
