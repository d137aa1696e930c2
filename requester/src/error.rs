use thiserror::Error;

#[derive(Error, Debug)]
pub enum RequesterError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("concurrent update of job {job_id}")]
    ConcurrentUpdate { job_id: String },

    #[error("job {0} is in a terminal state")]
    JobTerminated(String),

    #[error("execution cannot move from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("verifier failed: {0}")]
    VerifierFailed(String),

    #[error("node selection failed: {0}")]
    SelectorFailed(String),
}

pub type Result<T> = std::result::Result<T, RequesterError>;
