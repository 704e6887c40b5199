use std::path::PathBuf;

/// Failures of the EM engine collaborator.
///
/// Raised from a training round or the final assignment, these abort the run.
/// Raised from a single model-update sub-step, the controller keeps the
/// previous value and carries on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("EM training failed in round {round}: {message}")]
    Training { round: usize, message: String },

    #[error("final ML assignment failed: {0}")]
    Assignment(String),

    #[error("model update failed ({what}): {message}")]
    Update { what: &'static str, message: String },
}

impl EngineError {
    pub fn update(what: &'static str, message: impl Into<String>) -> Self {
        Self::Update {
            what,
            message: message.into(),
        }
    }
}

/// Problems with the experiment design or its input files.
#[derive(Debug, thiserror::Error)]
pub enum DesignError {
    #[error("I/O error: {source} ({path})")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("malformed line {line} in {path}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("no experiments specified in the design")]
    Empty,

    #[error("condition `{0}` has no signal replicate")]
    NoSignal(String),
}
