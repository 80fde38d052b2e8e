use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("GitLab API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("GitLab API error (status {status}) after {retries} retries")]
    ApiErrorAfterRetries { status: u16, retries: u32 },

    #[error("GraphQL errors in {query}: {errors}")]
    GraphQLError { query: String, errors: String },

    #[error("GraphQL response contained no data")]
    NoResponseData,

    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Sink '{sink}' failed to accept {kind}: {message}")]
    Sink {
        sink: String,
        kind: String,
        message: String,
    },

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Multiple(JoinedErrors),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Folds a list of errors into one.
    ///
    /// Cancellation wins over everything else and is returned bare so that
    /// callers can tell it apart from operational failures.
    pub fn join(errors: Vec<SyncError>) -> Option<SyncError> {
        if errors.iter().any(SyncError::is_cancelled) {
            return Some(Self::Cancelled);
        }

        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                Self::Multiple(JoinedErrors(inner)) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Multiple(JoinedErrors(flat))),
        }
    }

    /// Like [`SyncError::join`], but shaped as a `Result`.
    pub fn join_result(errors: Vec<SyncError>) -> Result<()> {
        match Self::join(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Errors collected from independent units of work.
#[derive(Debug)]
pub struct JoinedErrors(pub Vec<SyncError>);

impl JoinedErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.len())?;
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
