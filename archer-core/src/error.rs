use archer_model::{ModelError, TaskId, TaskStatus};
use thiserror::Error;

/// One rejected field of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub param: String,
    pub message: String,
}

impl FieldError {
    pub fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArcherError {
    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error("task {task} is already {status}")]
    AlreadyTerminal { task: TaskId, status: TaskStatus },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("pattern must not be blank")]
    InvalidPattern,

    #[error("handler registered for '{0}' is invalid")]
    InvalidHandler(String),

    #[error("pattern '{0}' is already registered")]
    DuplicatePattern(String),

    #[error("no handler found for job type '{0}'")]
    NoHandlerFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search index error: {0}")]
    Search(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("coordinator responded {status}: {message}")]
    Coordinator { status: u16, message: String },

    #[error("module execution failed: {0}")]
    ModuleExecution(String),

    #[error("module {0} does not support scheduling")]
    SchedulingUnsupported(String),

    #[error("task aborted after {processed} results: {source}")]
    TaskAborted {
        processed: u64,
        #[source]
        source: Box<ArcherError>,
    },

    #[error("module returned {returned} results but the indexer confirmed {indexed}")]
    Consistency { returned: u64, indexed: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.param, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ArcherError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ArcherError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(param: impl Into<String>, message: impl Into<String>) -> Self {
        ArcherError::Validation(vec![FieldError::new(param, message)])
    }

    /// Whether the queue should run the job again.
    ///
    /// Infrastructure hiccups and process failures are worth another attempt;
    /// request, state and routing errors will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArcherError::Database(_)
            | ArcherError::Redis(_)
            | ArcherError::Http(_)
            | ArcherError::Search(_)
            | ArcherError::Queue(_)
            | ArcherError::Io(_)
            | ArcherError::ModuleExecution(_)
            | ArcherError::Cancelled => true,
            ArcherError::Coordinator { status, .. } => *status >= 500,
            ArcherError::TaskAborted { source, .. } => source.is_retryable(),
            ArcherError::Validation(_)
            | ArcherError::AlreadyTerminal { .. }
            | ArcherError::NotFound { .. }
            | ArcherError::InvalidPattern
            | ArcherError::InvalidHandler(_)
            | ArcherError::DuplicatePattern(_)
            | ArcherError::NoHandlerFound(_)
            | ArcherError::Serialization(_)
            | ArcherError::SchedulingUnsupported(_)
            | ArcherError::Consistency { .. }
            | ArcherError::Internal(_) => false,
        }
    }

    /// Results already indexed before the failure, when known.
    pub fn processed(&self) -> Option<u64> {
        match self {
            ArcherError::TaskAborted { processed, .. } => Some(*processed),
            _ => None,
        }
    }
}

impl From<ModelError> for ArcherError {
    fn from(err: ModelError) -> Self {
        ArcherError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArcherError>;
