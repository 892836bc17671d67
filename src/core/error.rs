use std::path::{Path, PathBuf};

use thiserror::Error;

/// Every failure the agent pipeline can surface, with a distinct
/// exit-affecting class per kind.
///
/// Locally recoverable events (a binary file inside a glob, an unreadable
/// `.gitignore` layer, a missing `.mdflow` directory during search) are
/// logged and skipped by their call sites and never reach this enum.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("{} is {size} bytes, over the {limit}-byte input limit", path.display())]
    FileSizeLimit {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    #[error("{} is a binary file and cannot be imported", .0.display())]
    BinaryFileImport(PathBuf),

    #[error("symbol `{name}` not found in {}", path.display())]
    SymbolNotFound { path: PathBuf, name: String },

    #[error("circular import: {chain}")]
    CircularImport { chain: String },

    #[error("failed to fetch {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("{url} returned unsupported content type `{content_type}`")]
    UnsupportedContentType { url: String, content_type: String },

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("code fence failed: {0}")]
    CodeFenceFailed(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("import error: {0}")]
    Import(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("security error: {0}")]
    Security(String),

    #[error("cancelled by user")]
    UserCancelled,

    /// Non-error control flow (help, dry run); the caller exits 0.
    #[error("early exit")]
    EarlyExit,
}

impl AgentError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::EarlyExit => 0,
            AgentError::Configuration(_) => 2,
            AgentError::UserCancelled => 130,
            _ => 1,
        }
    }

    /// Map an I/O error on `path` to the matching agent error.
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            AgentError::FileNotFound(path.to_path_buf())
        } else {
            AgentError::Import(format!("{}: {}", path.display(), err))
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
