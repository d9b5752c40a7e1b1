use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("unknown workload: {0} (expected grid-walkers, game-of-life or cycle-churn)")]
    UnknownWorkload(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
