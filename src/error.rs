//! Error taxonomy for loancli.
//!
//! Variants are grouped by what the caller has to do about them: run setup
//! again (`NotConfigured`), fix the account (`LoginFailed`, `NoLibraryCard`),
//! skip a loan (`FormatUnavailable`) or report a loan as failed and move on
//! (`FulfillmentFailed`, `MalformedSession`, `IncompleteAssembly`).

use std::path::PathBuf;

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable session exists. Recoverable by running `loancli auth`.
    #[error("Libby has not been set up. Run `loancli auth` first.")]
    NotConfigured,

    /// Device registration failed. Fatal for the setup flow.
    #[error("cannot register device: {0}")]
    Registration(String),

    #[error("Could not log in with code: {0}")]
    LoginFailed(String),

    #[error("Could not sync your account. Make sure you have at least 1 registered library card.")]
    NoLibraryCard,

    #[error("format {wanted} is not available for loan {loan_id}")]
    FormatUnavailable { loan_id: String, wanted: String },

    #[error("fulfillment failed for loan {loan_id}: {reason}")]
    FulfillmentFailed { loan_id: String, reason: String },

    #[error("malformed open session for loan {loan_id}: {reason}")]
    MalformedSession { loan_id: String, reason: String },

    #[error("incomplete assembly: {0}")]
    IncompleteAssembly(String),

    #[error("request to {url} failed with status {status}: {message}")]
    Status {
        url: String,
        status: StatusCode,
        message: String,
    },

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid XML in {context}: {message}")]
    Xml { context: String, message: String },

    #[error("cannot write container: {0}")]
    Container(String),

    #[error("audio processing failed: {0}")]
    Audio(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    InvalidInput(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn xml(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Xml {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn fulfillment(loan_id: &str, reason: impl Into<String>) -> Self {
        Self::FulfillmentFailed {
            loan_id: loan_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed_session(loan_id: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSession {
            loan_id: loan_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the same request might succeed.
    ///
    /// Transport failures, 5xx and 429 are transient. Any other status is
    /// final, as is everything that did not come from the network.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.is_body()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Returns `true` if the failure only concerns the loan being processed,
    /// so a batch run should report it and continue with the next loan.
    pub fn is_per_loan(&self) -> bool {
        matches!(
            self,
            Self::FormatUnavailable { .. }
                | Self::FulfillmentFailed { .. }
                | Self::MalformedSession { .. }
                | Self::IncompleteAssembly(_)
                | Self::Status { .. }
                | Self::Http(_)
                | Self::Json(_)
                | Self::Xml { .. }
                | Self::Container(_)
                | Self::Audio(_)
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == StatusCode::UNAUTHORIZED,
            Self::Http(e) => e.status() == Some(StatusCode::UNAUTHORIZED),
            _ => false,
        }
    }
}
