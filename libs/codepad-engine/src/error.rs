use codepad_common::JobStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Service-level failures of the execution core
///
/// Anything the submitted program does wrong (compile error, crash,
/// timeout, output flood) is NOT an error here: those are recovered into
/// an `Outcome`. Only bad requests and broken infrastructure propagate.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unsupported language: '{0}'")]
    UnsupportedLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no toolchain found for {slot}: tried {candidates:?}")]
    ToolchainMissing {
        slot: String,
        candidates: Vec<String>,
    },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("illegal job status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExecError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// True when the service (not the request) is at fault
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            ExecError::UnsupportedLanguage(_) | ExecError::InvalidRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_internal() {
        assert!(!ExecError::UnsupportedLanguage("cobol".into()).is_internal());
        assert!(!ExecError::InvalidRequest("too big".into()).is_internal());
    }

    #[test]
    fn test_infrastructure_errors_are_internal() {
        let missing = ExecError::ToolchainMissing {
            slot: "python runtime".into(),
            candidates: vec!["python3".into(), "python".into()],
        };
        assert!(missing.is_internal());
        assert!(missing.to_string().contains("python3"));

        let io = ExecError::io(
            "failed to write source",
            "/tmp/x",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(io.is_internal());
    }

    #[test]
    fn test_unsupported_language_message() {
        let err = ExecError::UnsupportedLanguage("brainfuck".into());
        assert_eq!(err.to_string(), "unsupported language: 'brainfuck'");
    }
}
