use std::path::PathBuf;

/// Fault categories surfaced by the session and class browser engines.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("the external process is not running")]
    NotActive,

    #[error("a command is still in flight; wait for it to complete before sending another")]
    Busy,

    #[error("protocol desync: expected {expected}, got {line:?}")]
    ProtocolDesync { expected: &'static str, line: String },

    #[error("source file not found: {}", path.display())]
    ResourceUnavailable { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn desync(expected: &'static str, line: &str) -> Self {
        Self::ProtocolDesync {
            expected,
            line: line.to_string(),
        }
    }
}
