use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Queued,
    Processing,
    Complete,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Error)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Queued => write!(f, "QUEUED"),
            UploadStatus::Processing => write!(f, "PROCESSING"),
            UploadStatus::Complete => write!(f, "COMPLETE"),
            UploadStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// The five archive/storage steps an upload goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStep {
    Submit,
    FetchFileSpec,
    InitUpload,
    Transfer,
    Finalize,
}

impl ProtocolStep {
    pub const ALL: [ProtocolStep; 5] = [
        ProtocolStep::Submit,
        ProtocolStep::FetchFileSpec,
        ProtocolStep::InitUpload,
        ProtocolStep::Transfer,
        ProtocolStep::Finalize,
    ];
}

impl fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolStep::Submit => write!(f, "submit"),
            ProtocolStep::FetchFileSpec => write!(f, "fetch_file_spec"),
            ProtocolStep::InitUpload => write!(f, "init_upload"),
            ProtocolStep::Transfer => write!(f, "transfer"),
            ProtocolStep::Finalize => write!(f, "finalize"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
}

impl FromStr for FieldType {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "string" => Ok(FieldType::String),
            "number" => Ok(FieldType::Number),
            other => Err(SubmitError::InvalidConfig(format!(
                "unknown field type: {other}"
            ))),
        }
    }
}

/// How an uploaded file takes part in an intake, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Metadata,
    Sequence,
    CompressedSequence,
}

impl FileKind {
    /// Case-sensitive suffix match; `None` for anything outside the allow-list.
    pub fn classify(file_name: &str) -> Option<FileKind> {
        if file_name.ends_with(".tsv") {
            Some(FileKind::Metadata)
        } else if file_name.ends_with(".fasta.gz") || file_name.ends_with(".fa.gz") {
            Some(FileKind::CompressedSequence)
        } else if file_name.ends_with(".fasta") || file_name.ends_with(".fa") {
            Some(FileKind::Sequence)
        } else {
            None
        }
    }

    pub fn is_sequence(self) -> bool {
        matches!(self, FileKind::Sequence | FileKind::CompressedSequence)
    }
}

/// The authenticated caller, as resolved by whatever sits in front of the core.
pub trait Principal {
    fn user_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = SubmitError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return Err(SubmitError::InvalidConfig(format!(
                "invalid user id: {value:?}"
            )));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl Principal for UserId {
    fn user_id(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn classify_is_case_sensitive() {
        assert_eq!(FileKind::classify("meta.tsv"), Some(FileKind::Metadata));
        assert_eq!(FileKind::classify("meta.TSV"), None);
        assert_eq!(FileKind::classify("a.fa"), Some(FileKind::Sequence));
        assert_eq!(
            FileKind::classify("a.fasta.gz"),
            Some(FileKind::CompressedSequence)
        );
        assert_eq!(FileKind::classify("a.fastq"), None);
    }

    #[test]
    fn parse_user_id() {
        let user: UserId = " alice ".parse().unwrap();
        assert_eq!(user.user_id(), "alice");
        let err = "".parse::<UserId>().unwrap_err();
        assert_matches!(err, SubmitError::InvalidConfig(_));
    }

    #[test]
    fn terminal_states() {
        assert!(!UploadStatus::Queued.is_terminal());
        assert!(!UploadStatus::Processing.is_terminal());
        assert!(UploadStatus::Complete.is_terminal());
        assert!(UploadStatus::Error.is_terminal());
    }
}
