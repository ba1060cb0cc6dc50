use thiserror::Error;

/// Errors surfaced by a benchmark run.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Invalid parameter combination, detected before anything is executed.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A connection could not be opened or validated.
    #[error("connection error: {0:#}")]
    Connection(anyhow::Error),

    /// A statement failed for a reason other than the run shutting down.
    #[error("statement error: {0:#}")]
    Statement(anyhow::Error),

    /// The run was interrupted from the outside.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BenchError {
    /// The process exit status which should be reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Interrupted => 130,
            _ => 1,
        }
    }
}
