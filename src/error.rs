use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

/// Stored on an upload when a failure carries no archive message.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

#[derive(Debug, Error, Diagnostic)]
pub enum SubmitError {
    #[error("missing config file seq-submit.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("payload template references undefined field: {0}")]
    UndefinedPlaceholder(String),

    #[error("payload template did not render a valid document: {0}")]
    TemplateRender(String),

    #[error("payload has no string value at {0}")]
    PayloadField(String),

    #[error(
        "expected exactly one .tsv file and at least one .fasta/.fa(.gz) file, got: {}",
        file_names.join(", ")
    )]
    InvalidFileSet { file_names: Vec<String> },

    #[error("file is not valid UTF-8 text: {0}")]
    InvalidEncoding(String),

    #[error(
        "metadata headers do not match schema (missing: [{}], unknown: [{}], duplicate: [{}])",
        missing.join(", "),
        unknown.join(", "),
        duplicate.join(", ")
    )]
    HeaderMismatch {
        missing: Vec<String>,
        unknown: Vec<String>,
        duplicate: Vec<String>,
    },

    #[error("metadata has {} invalid field value(s)", errors.len())]
    InvalidFields { errors: Vec<FieldError> },

    #[error(
        "records and sequence files do not match (file missing in tsv: [{}], record missing file: [{}])",
        file_missing_in_tsv.join(", "),
        record_missing_file.join(", ")
    )]
    SampleMismatch {
        file_missing_in_tsv: Vec<String>,
        record_missing_file: Vec<String>,
    },

    #[error(
        "failed to decompress {}",
        failures.iter().map(|f| f.file_name.as_str()).collect::<Vec<_>>().join(", ")
    )]
    Decompression { failures: Vec<FileFailure> },

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("storage request failed: {0}")]
    StorageHttp(String),

    #[error("storage returned status {status}: {message}")]
    StorageStatus { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<SubmitError>,
    },

    #[error("unexpected protocol response: {0}")]
    Protocol(String),

    #[error("content digest mismatch for {file_name}: expected {expected}, computed {actual}")]
    DigestMismatch {
        file_name: String,
        expected: String,
        actual: String,
    },

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("upload queue is closed")]
    QueueClosed,

    #[error("failed to start thread: {0}")]
    Thread(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SubmitError {
    /// Human-readable cause stored on an upload that ended in ERROR.
    ///
    /// Only the archive's own message is surfaced; everything else collapses
    /// to [`INTERNAL_ERROR_MESSAGE`] so transport details never reach the record.
    pub fn persisted_message(&self) -> String {
        match self {
            SubmitError::ArchiveStatus { message, .. } => message.clone(),
            SubmitError::RetriesExhausted { source, .. } => match source.as_ref() {
                SubmitError::ArchiveStatus { message, .. } => message.clone(),
                _ => INTERNAL_ERROR_MESSAGE.to_string(),
            },
            _ => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SubmitError::ArchiveHttp(_)
                | SubmitError::ArchiveStatus { .. }
                | SubmitError::StorageHttp(_)
                | SubmitError::StorageStatus { .. }
                | SubmitError::RetriesExhausted { .. }
                | SubmitError::Protocol(_)
        )
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            SubmitError::InvalidFileSet { .. }
                | SubmitError::InvalidEncoding(_)
                | SubmitError::HeaderMismatch { .. }
                | SubmitError::InvalidFields { .. }
                | SubmitError::SampleMismatch { .. }
                | SubmitError::Decompression { .. }
                | SubmitError::PayloadField(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldErrorReason {
    NotAllowedToBeEmpty,
    NotANumber,
}

impl fmt::Display for FieldErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldErrorReason::NotAllowedToBeEmpty => write!(f, "NOT_ALLOWED_TO_BE_EMPTY"),
            FieldErrorReason::NotANumber => write!(f, "NOT_A_NUMBER"),
        }
    }
}

/// One offending cell in a metadata table. `row` is the 1-based line number
/// in the uploaded file, the header being line 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: FieldErrorReason,
    pub row: usize,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at row {}: {}", self.field, self.row, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file_name: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_message_is_persisted_verbatim() {
        let err = SubmitError::ArchiveStatus {
            status: 404,
            message: "analysis not found".to_string(),
        };
        assert_eq!(err.persisted_message(), "analysis not found");
    }

    #[test]
    fn wrapped_archive_message_is_unwrapped() {
        let err = SubmitError::RetriesExhausted {
            attempts: 4,
            source: Box::new(SubmitError::ArchiveStatus {
                status: 503,
                message: "archive unavailable".to_string(),
            }),
        };
        assert_eq!(err.persisted_message(), "archive unavailable");
    }

    #[test]
    fn transport_failures_are_generic() {
        let err = SubmitError::RetriesExhausted {
            attempts: 4,
            source: Box::new(SubmitError::StorageHttp("operation timed out".to_string())),
        };
        assert_eq!(err.persisted_message(), INTERNAL_ERROR_MESSAGE);
        let err = SubmitError::StorageStatus {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.persisted_message(), INTERNAL_ERROR_MESSAGE);
    }
}
