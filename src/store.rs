use std::collections::BTreeSet;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::Builder;
use uuid::Uuid;

use crate::domain::{ProtocolStep, UploadStatus};
use crate::error::SubmitError;
use crate::fasta::SequenceFileBlock;
use crate::feed::{ChangeFeed, FeedFilter, UploadFeed};
use crate::merge::SubmissionRequest;

/// One sample's journey through the archive protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub upload_id: Uuid,
    pub study_id: String,
    pub submitter_sample_id: String,
    pub submission_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: UploadStatus,
    pub original_file_pair: BTreeSet<String>,
    #[serde(default)]
    pub analysis_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_completed_step: Option<ProtocolStep>,
}

impl Upload {
    pub fn queued(
        submission_id: Uuid,
        user_id: &str,
        study_id: &str,
        sample_id: &str,
        original_file_pair: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: Uuid::new_v4(),
            study_id: study_id.to_string(),
            submitter_sample_id: sample_id.to_string(),
            submission_id,
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            status: UploadStatus::Queued,
            original_file_pair,
            analysis_id: None,
            error: None,
            last_completed_step: None,
        }
    }
}

/// One intake call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub submission_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub original_file_names: BTreeSet<String>,
    pub study_ids: BTreeSet<String>,
    pub total_records: usize,
}

/// A queued upload together with what the protocol needs to run it.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub upload: Upload,
    pub payload: Value,
    pub file: SequenceFileBlock,
}

impl UploadJob {
    pub fn from_request(submission_id: Uuid, user_id: &str, request: SubmissionRequest) -> Self {
        let upload = Upload::queued(
            submission_id,
            user_id,
            &request.study_id,
            &request.sample_id,
            request.original_file_names,
        );
        Self {
            upload,
            payload: request.payload,
            file: request.file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadQuery {
    pub user_id: String,
    pub submission_id: Option<Uuid>,
    pub page: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total: usize,
}

/// Source of truth for submissions and uploads. Every upload write must also
/// reach subscribers of the change feed.
pub trait UploadStore: Send + Sync {
    fn create_submission(
        &self,
        submission: &Submission,
        jobs: &[UploadJob],
    ) -> Result<(), SubmitError>;
    fn save_upload(&self, upload: &Upload) -> Result<(), SubmitError>;
    fn upload(&self, upload_id: Uuid) -> Result<Option<Upload>, SubmitError>;
    fn submission(&self, submission_id: Uuid) -> Result<Option<Submission>, SubmitError>;
    fn list_uploads(&self, query: &UploadQuery) -> Result<Page<Upload>, SubmitError>;
    fn queued_jobs(&self) -> Result<Vec<UploadJob>, SubmitError>;
    fn subscribe(&self, filter: FeedFilter) -> UploadFeed;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRequest {
    payload: Value,
    file: SequenceFileBlock,
}

/// JSON files under one root directory:
/// `submissions/<id>.json`, `uploads/<id>.json`, `requests/<id>.json` and
/// the raw sequence bytes in `requests/<id>.fasta`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Utf8PathBuf,
    feed: ChangeFeed,
}

impl FileStore {
    pub fn open(root: Utf8PathBuf) -> Result<Self, SubmitError> {
        for dir in ["submissions", "uploads", "requests"] {
            fs::create_dir_all(root.join(dir).as_std_path())
                .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        }
        Ok(Self {
            root,
            feed: ChangeFeed::new(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn submission_path(&self, id: Uuid) -> Utf8PathBuf {
        self.root.join("submissions").join(format!("{id}.json"))
    }

    fn upload_path(&self, id: Uuid) -> Utf8PathBuf {
        self.root.join("uploads").join(format!("{id}.json"))
    }

    fn request_path(&self, id: Uuid) -> Utf8PathBuf {
        self.root.join("requests").join(format!("{id}.json"))
    }

    fn blob_path(&self, id: Uuid) -> Utf8PathBuf {
        self.root.join("requests").join(format!("{id}.fasta"))
    }

    fn load_job(&self, upload: Upload) -> Result<UploadJob, SubmitError> {
        let stored: StoredRequest = read_json(&self.request_path(upload.upload_id))?
            .ok_or_else(|| SubmitError::UploadNotFound(upload.upload_id.to_string()))?;
        let content = fs::read(self.blob_path(upload.upload_id).as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        let mut file = stored.file;
        file.content = content;
        Ok(UploadJob {
            upload,
            payload: stored.payload,
            file,
        })
    }

    fn write_submission(
        &self,
        submission: &Submission,
        jobs: &[UploadJob],
    ) -> Result<(), SubmitError> {
        write_json_atomic(&self.submission_path(submission.submission_id), submission)?;
        for job in jobs {
            let id = job.upload.upload_id;
            write_bytes_atomic(&self.blob_path(id), &job.file.content)?;
            let stored = StoredRequest {
                payload: job.payload.clone(),
                file: job.file.clone(),
            };
            write_json_atomic(&self.request_path(id), &stored)?;
            write_json_atomic(&self.upload_path(id), &job.upload)?;
        }
        Ok(())
    }

    fn remove_submission(&self, submission: &Submission, jobs: &[UploadJob]) {
        let paths = jobs
            .iter()
            .flat_map(|job| {
                let id = job.upload.upload_id;
                [self.upload_path(id), self.request_path(id), self.blob_path(id)]
            })
            .chain(std::iter::once(
                self.submission_path(submission.submission_id),
            ));
        for path in paths {
            if path.as_std_path().is_file() {
                if let Err(err) = fs::remove_file(path.as_std_path()) {
                    tracing::warn!(%path, error = %err, "failed to remove file");
                }
            }
        }
    }

    fn all_uploads(&self) -> Result<Vec<Upload>, SubmitError> {
        let dir = self.root.join("uploads");
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
        let mut uploads = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| SubmitError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let content = fs::read_to_string(&path)
                    .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
                let upload: Upload = serde_json::from_str(&content)
                    .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
                uploads.push(upload);
            }
        }
        Ok(uploads)
    }
}

impl UploadStore for FileStore {
    /// Writes the submission record first. A failed write removes every file
    /// of the intake again.
    fn create_submission(
        &self,
        submission: &Submission,
        jobs: &[UploadJob],
    ) -> Result<(), SubmitError> {
        if let Err(err) = self.write_submission(submission, jobs) {
            tracing::warn!(
                submission_id = %submission.submission_id,
                error = %err,
                "rolling back partially written submission"
            );
            self.remove_submission(submission, jobs);
            return Err(err);
        }
        for job in jobs {
            self.feed.publish(&job.upload);
        }
        Ok(())
    }

    fn save_upload(&self, upload: &Upload) -> Result<(), SubmitError> {
        write_json_atomic(&self.upload_path(upload.upload_id), upload)?;
        self.feed.publish(upload);
        Ok(())
    }

    fn upload(&self, upload_id: Uuid) -> Result<Option<Upload>, SubmitError> {
        read_json(&self.upload_path(upload_id))
    }

    fn submission(&self, submission_id: Uuid) -> Result<Option<Submission>, SubmitError> {
        read_json(&self.submission_path(submission_id))
    }

    fn list_uploads(&self, query: &UploadQuery) -> Result<Page<Upload>, SubmitError> {
        let mut uploads = self
            .all_uploads()?
            .into_iter()
            .filter(|upload| upload.user_id == query.user_id)
            .filter(|upload| {
                query
                    .submission_id
                    .map(|id| id == upload.submission_id)
                    .unwrap_or(true)
            })
            .collect::<Vec<_>>();
        uploads.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.submitter_sample_id.cmp(&b.submitter_sample_id))
        });

        let total = uploads.len();
        let size = query.size.max(1);
        let items = uploads
            .into_iter()
            .skip(query.page.saturating_mul(size))
            .take(size)
            .collect();
        Ok(Page {
            items,
            page: query.page,
            size,
            total,
        })
    }

    /// Uploads whose submission record is missing belong to an intake that
    /// never completed and are skipped.
    fn queued_jobs(&self) -> Result<Vec<UploadJob>, SubmitError> {
        let mut queued = Vec::new();
        for upload in self.all_uploads()? {
            if upload.status != UploadStatus::Queued {
                continue;
            }
            if !self.submission_path(upload.submission_id).as_std_path().is_file() {
                tracing::warn!(
                    upload_id = %upload.upload_id,
                    submission_id = %upload.submission_id,
                    "skipping queued upload without submission record"
                );
                continue;
            }
            queued.push(upload);
        }
        queued.sort_by_key(|upload| upload.created_at);
        queued
            .into_iter()
            .map(|upload| self.load_job(upload))
            .collect()
    }

    fn subscribe(&self, filter: FeedFilter) -> UploadFeed {
        self.feed.subscribe(filter)
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, SubmitError> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    let value = serde_json::from_str(&content)
        .map_err(|err| SubmitError::Filesystem(format!("{path}: {err}")))?;
    Ok(Some(value))
}

fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SubmitError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SubmitError> {
    let parent = path
        .parent()
        .ok_or_else(|| SubmitError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".seq-submit")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| SubmitError::Filesystem(err.to_string()))?;
    Ok(())
}
