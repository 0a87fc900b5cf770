use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::bundle::{UploadedFile, accumulate};
use crate::config::{FieldSchema, ResolvedConfig, WorkerSettings};
use crate::domain::Principal;
use crate::error::SubmitError;
use crate::fasta::SkippedFragment;
use crate::feed::{FeedFilter, UploadFeed};
use crate::merge::{MergeOptions, SubmissionRequest, merge_bundle};
use crate::orchestrator::{Protocol, UploadOrchestrator};
use crate::store::{Page, Submission, Upload, UploadJob, UploadQuery, UploadStore};
use crate::template::PayloadTemplate;
use crate::tsv::MetadataParser;

/// Validated requests for one intake, not yet persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedSubmission {
    pub requests: Vec<SubmissionRequest>,
    pub original_file_names: BTreeSet<String>,
    pub skipped_fragments: Vec<SkippedFragment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub valid: bool,
    pub samples: Vec<String>,
    pub skipped_fragments: Vec<SkippedFragment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionCreated {
    pub submission_id: Uuid,
    pub total_records: usize,
    pub upload_ids: Vec<Uuid>,
    pub skipped_fragments: Vec<SkippedFragment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeResult {
    pub resumed: usize,
}

/// Parse, split and merge; everything that happens before persistence.
#[derive(Debug, Clone)]
pub struct Intake {
    schema: Vec<FieldSchema>,
    template: PayloadTemplate,
    merge: MergeOptions,
}

impl Intake {
    pub fn new(schema: Vec<FieldSchema>, template: PayloadTemplate, merge: MergeOptions) -> Self {
        Self {
            schema,
            template,
            merge,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            config.schema.clone(),
            config.template.clone(),
            config.merge.clone(),
        )
    }

    pub fn prepare(&self, files: Vec<UploadedFile>) -> Result<PreparedSubmission, SubmitError> {
        let parser = MetadataParser::new(&self.schema);
        let mut bundle = accumulate(files, &parser)?;
        let original_file_names = bundle.original_file_names.clone();
        let skipped_fragments = std::mem::take(&mut bundle.skipped);
        let requests = merge_bundle(bundle, &self.template, &self.merge)?;
        Ok(PreparedSubmission {
            requests,
            original_file_names,
            skipped_fragments,
        })
    }

    pub fn check(&self, files: Vec<UploadedFile>) -> Result<CheckResult, SubmitError> {
        let prepared = self.prepare(files)?;
        Ok(CheckResult {
            valid: true,
            samples: prepared
                .requests
                .iter()
                .map(|request| request.sample_id.clone())
                .collect(),
            skipped_fragments: prepared.skipped_fragments,
        })
    }
}

/// Intake and status surface handed to the routing layer.
pub struct SubmissionService {
    intake: Intake,
    store: Arc<dyn UploadStore>,
    orchestrator: UploadOrchestrator,
}

impl SubmissionService {
    pub fn start(
        intake: Intake,
        protocol: Protocol,
        store: Arc<dyn UploadStore>,
        workers: WorkerSettings,
    ) -> Result<Self, SubmitError> {
        let orchestrator = UploadOrchestrator::start(protocol, workers)?;
        Ok(Self {
            intake,
            store,
            orchestrator,
        })
    }

    pub fn check(&self, files: Vec<UploadedFile>) -> Result<CheckResult, SubmitError> {
        self.intake.check(files)
    }

    /// Validates the files, persists one submission with a QUEUED upload per
    /// sample and hands the uploads to the orchestrator. Nothing is persisted
    /// if validation fails.
    pub fn submit(
        &self,
        principal: &dyn Principal,
        files: Vec<UploadedFile>,
    ) -> Result<SubmissionCreated, SubmitError> {
        let user_id = principal.user_id();
        let prepared = self.intake.prepare(files)?;

        let submission_id = Uuid::new_v4();
        let jobs = prepared
            .requests
            .into_iter()
            .map(|request| UploadJob::from_request(submission_id, user_id, request))
            .collect::<Vec<_>>();
        let submission = Submission {
            submission_id,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            original_file_names: prepared.original_file_names,
            study_ids: jobs
                .iter()
                .map(|job| job.upload.study_id.clone())
                .collect(),
            total_records: jobs.len(),
        };
        self.store.create_submission(&submission, &jobs)?;
        tracing::info!(
            %submission_id,
            user_id,
            uploads = jobs.len(),
            "submission queued"
        );

        let upload_ids = jobs.iter().map(|job| job.upload.upload_id).collect();
        self.orchestrator.enqueue_detached(jobs)?;

        Ok(SubmissionCreated {
            submission_id,
            total_records: submission.total_records,
            upload_ids,
            skipped_fragments: prepared.skipped_fragments,
        })
    }

    pub fn list_uploads(
        &self,
        principal: &dyn Principal,
        submission_id: Option<Uuid>,
        page: usize,
        size: usize,
    ) -> Result<Page<Upload>, SubmitError> {
        user_uploads(self.store.as_ref(), principal, submission_id, page, size)
    }

    pub fn submission(
        &self,
        principal: &dyn Principal,
        submission_id: Uuid,
    ) -> Result<Submission, SubmitError> {
        owned_submission(self.store.as_ref(), principal, submission_id)
    }

    /// Live upload changes for the caller from now on.
    pub fn watch(&self, principal: &dyn Principal, submission_id: Option<Uuid>) -> UploadFeed {
        let filter = FeedFilter::user(principal.user_id());
        let filter = match submission_id {
            Some(id) => filter.with_submission(id),
            None => filter,
        };
        self.store.subscribe(filter)
    }

    /// Re-queues uploads left QUEUED by a previous run.
    pub fn resume_queued(&self) -> Result<ResumeResult, SubmitError> {
        let jobs = self.store.queued_jobs()?;
        let resumed = jobs.len();
        if resumed > 0 {
            tracing::info!(resumed, "resuming queued uploads");
            self.orchestrator.enqueue_detached(jobs)?;
        }
        Ok(ResumeResult { resumed })
    }

    pub fn is_healthy(&self) -> bool {
        self.orchestrator.is_alive()
    }

    /// Stops accepting work and waits until every queued upload has run.
    pub fn shutdown(self) {
        self.orchestrator.shutdown();
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.store
    }
}

/// Uploads of the caller, newest first.
pub fn user_uploads(
    store: &dyn UploadStore,
    principal: &dyn Principal,
    submission_id: Option<Uuid>,
    page: usize,
    size: usize,
) -> Result<Page<Upload>, SubmitError> {
    store.list_uploads(&UploadQuery {
        user_id: principal.user_id().to_string(),
        submission_id,
        page,
        size,
    })
}

/// Submissions of other users are reported as not found.
pub fn owned_submission(
    store: &dyn UploadStore,
    principal: &dyn Principal,
    submission_id: Uuid,
) -> Result<Submission, SubmitError> {
    store
        .submission(submission_id)?
        .filter(|submission| submission.user_id == principal.user_id())
        .ok_or_else(|| SubmitError::SubmissionNotFound(submission_id.to_string()))
}
