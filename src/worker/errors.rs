use thiserror::Error;

use super::state::WorkerStatus;
use crate::messaging::MessagingError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("Worker startup failed: {0}")]
    Startup(String),

    #[error("Worker shutdown hook failed: {0}")]
    Shutdown(String),

    #[error("Invalid worker transition from {from} to {to}")]
    InvalidTransition { from: WorkerStatus, to: WorkerStatus },

    #[error("Worker {worker_id} is shutting down")]
    ShuttingDown { worker_id: String },
}

impl WorkerError {
    pub fn startup(reason: impl Into<String>) -> Self {
        Self::Startup(reason.into())
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown(reason.into())
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
