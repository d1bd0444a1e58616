//! Error taxonomy for the judging pipeline.
//!
//! Most internal paths use `anyhow` with context; this enum exists at the
//! process boundary so the CLI can map failures to stable exit codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("external service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("data integrity: {0}")]
    Integrity(String),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for MinerError {
    fn from(err: anyhow::Error) -> Self {
        classify(err)
    }
}

impl MinerError {
    /// Exit code contract: 0 success, 2 configuration, 3 external service,
    /// 4 database. Integrity failures refuse to write and count as data
    /// errors on the database side.
    pub fn exit_code(&self) -> i32 {
        match self {
            MinerError::Config(_) => 2,
            MinerError::ServiceUnavailable(_) => 3,
            MinerError::Database(_) | MinerError::Integrity(_) => 4,
            MinerError::Other(_) => 1,
        }
    }
}

pub type Result<T, E = MinerError> = std::result::Result<T, E>;

/// Map an anyhow error onto the taxonomy by inspecting its cause chain:
/// transport and embedding failures mean an external service is down,
/// sqlx errors are database errors, everything else stays generic.
pub fn classify(err: anyhow::Error) -> MinerError {
    for cause in err.chain() {
        if cause.downcast_ref::<reqwest::Error>().is_some()
            || cause.downcast_ref::<crate::embedding::EmbedError>().is_some()
        {
            return MinerError::ServiceUnavailable(format!("{err:#}"));
        }
        if cause.downcast_ref::<sqlx::Error>().is_some() {
            return MinerError::Database(sqlx::Error::Protocol(format!("{err:#}")));
        }
    }
    MinerError::Other(err)
}
