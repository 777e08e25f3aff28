//! Error types for the synchronization engine.
//!
//! Each concern owns its error enum; `SyncError` wraps them for the pipelines
//! and carries the aggregate variants used to report partial failure.

use std::fmt;

use thiserror::Error;

/// Configuration and bootstrap errors. Fatal at process start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Key store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt key row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Distributed lock store errors. Contention is not an error.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),
}

/// Batch signing errors. Fatal for the batch being signed.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Invalid signing certificate: {0}")]
    Certificate(String),

    #[error("Invalid signing key: {0}")]
    PrivateKey(String),

    #[error("Signing failed: {0}")]
    Sign(String),
}

/// Invalid batching parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchingError {
    #[error("Batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("Maximum overlapping keys must be greater than zero")]
    ZeroMaxOverlapping,
}

/// Which remote call an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    GatewayUpload,
    GatewayDownload,
    IssueCode,
    VerifyCode,
    Certificate,
    Publish,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::GatewayUpload => "gateway_upload",
            Step::GatewayDownload => "gateway_download",
            Step::IssueCode => "issue_code",
            Step::VerifyCode => "verify_code",
            Step::Certificate => "certificate",
            Step::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// HTTP client errors, split along transport / protocol / business lines.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{step}: transport error: {message}")]
    Transport { step: Step, message: String },

    #[error("{step}: unexpected status {status}: {body}")]
    UnexpectedStatus {
        step: Step,
        status: u16,
        body: String,
    },

    #[error("{step}: malformed response: {message}")]
    Decode { step: Step, message: String },

    #[error("{step}: rejected code={code:?} message={message:?}")]
    Rejected {
        step: Step,
        code: String,
        message: String,
    },

    #[error("{step}: invalid request: {message}")]
    Request { step: Step, message: String },
}

impl ClientError {
    pub fn step(&self) -> Step {
        match self {
            ClientError::Transport { step, .. }
            | ClientError::UnexpectedStatus { step, .. }
            | ClientError::Decode { step, .. }
            | ClientError::Rejected { step, .. }
            | ClientError::Request { step, .. } => *step,
        }
    }
}

/// Pipeline-level error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Batching(#[from] BatchingError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("No Health Authority ID mapped for country {0}")]
    UnmappedCountry(String),

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Upload failed for {} batch(es): {}", .failures.len(), summarize(.failures))]
    UploadFailed { failures: Vec<(String, SyncError)> },

    #[error("Download failed for {} group(s): {}", .failures.len(), summarize(.failures))]
    DownloadFailed { failures: Vec<(String, SyncError)> },

    #[error("Publish failed for {} sub-batch(es): {}", .failures.len(), summarize(.failures))]
    PublishFailed { failures: Vec<(String, SyncError)> },
}

fn summarize(failures: &[(String, SyncError)]) -> String {
    failures
        .iter()
        .map(|(label, err)| format!("{}: {}", label, err))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_display() {
        let err = SyncError::DownloadFailed {
            failures: vec![
                ("XX".to_string(), SyncError::UnmappedCountry("XX".to_string())),
                (
                    "FR".to_string(),
                    SyncError::Client(ClientError::UnexpectedStatus {
                        step: Step::IssueCode,
                        status: 503,
                        body: String::new(),
                    }),
                ),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("Download failed for 2 group(s)"));
        assert!(text.contains("XX: No Health Authority ID mapped for country XX"));
        assert!(text.contains("issue_code: unexpected status 503"));
    }

    #[test]
    fn test_client_error_step() {
        let err = ClientError::Rejected {
            step: Step::Certificate,
            code: "token_expired".to_string(),
            message: "expired".to_string(),
        };
        assert_eq!(err.step(), Step::Certificate);
    }
}
