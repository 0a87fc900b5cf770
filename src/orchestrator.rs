//! Drives queued uploads through the archive protocol on a fixed pool of
//! worker threads fed by a bounded channel.
//!
//! Per upload the protocol is:
//! 1. submit the payload to the archive, which assigns an analysis id
//! 2. fetch the file spec the archive registered for that analysis
//! 3. initialise a staged upload with the storage tier
//! 4. PUT the bytes to the returned destination and keep the entity tag
//! 5. finalise the part and the upload, then publish the analysis
//!
//! The upload record is written after every step and must be persisted
//! before the next one starts. A failure anywhere ends the upload in ERROR.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use serde_json::Value;

use crate::archive::ArchiveClient;
use crate::config::WorkerSettings;
use crate::domain::{ProtocolStep, UploadStatus};
use crate::error::SubmitError;
use crate::fasta::{SequenceFileBlock, content_digest};
use crate::storage::{StorageClient, percent_decode};
use crate::store::{Upload, UploadJob, UploadStore};

const PART_NUMBER: u32 = 1;

/// Where an upload stands, carrying what the next step needs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Queued,
    Submitted {
        analysis_id: String,
    },
    FileResolved {
        analysis_id: String,
        object_id: String,
        file_size: u64,
    },
    Staged {
        analysis_id: String,
        object_id: String,
        upload_id: String,
        url: String,
    },
    Transferred {
        analysis_id: String,
        object_id: String,
        upload_id: String,
        etag: String,
        md5: String,
    },
    Published,
}

impl Progress {
    fn next_step(&self) -> Option<ProtocolStep> {
        match self {
            Progress::Queued => Some(ProtocolStep::Submit),
            Progress::Submitted { .. } => Some(ProtocolStep::FetchFileSpec),
            Progress::FileResolved { .. } => Some(ProtocolStep::InitUpload),
            Progress::Staged { .. } => Some(ProtocolStep::Transfer),
            Progress::Transferred { .. } => Some(ProtocolStep::Finalize),
            Progress::Published => None,
        }
    }
}

/// The archive and storage clients plus the store, shared by all workers.
#[derive(Clone)]
pub struct Protocol {
    archive: Arc<dyn ArchiveClient>,
    storage: Arc<dyn StorageClient>,
    store: Arc<dyn UploadStore>,
}

impl Protocol {
    pub fn new(
        archive: Arc<dyn ArchiveClient>,
        storage: Arc<dyn StorageClient>,
        store: Arc<dyn UploadStore>,
    ) -> Self {
        Self {
            archive,
            storage,
            store,
        }
    }

    /// Runs one upload to COMPLETE or ERROR and returns its final record.
    pub fn run(&self, job: UploadJob) -> Upload {
        let UploadJob {
            mut upload,
            payload,
            file,
        } = job;
        tracing::info!(
            upload_id = %upload.upload_id,
            sample_id = %upload.submitter_sample_id,
            "starting upload"
        );

        let mut progress = Progress::Queued;
        while let Some(step) = progress.next_step() {
            let advanced = self
                .advance(progress, &upload, &payload, &file)
                .and_then(|next| {
                    self.checkpoint(&mut upload, step, &next)?;
                    Ok(next)
                });
            match advanced {
                Ok(next) => progress = next,
                Err(err) => {
                    self.fail(&mut upload, step, &err);
                    return upload;
                }
            }
        }

        tracing::info!(upload_id = %upload.upload_id, "upload complete");
        upload
    }

    fn advance(
        &self,
        progress: Progress,
        upload: &Upload,
        payload: &Value,
        file: &SequenceFileBlock,
    ) -> Result<Progress, SubmitError> {
        let study_id = upload.study_id.as_str();
        match progress {
            Progress::Queued => {
                let response = self.archive.submit(study_id, payload)?;
                Ok(Progress::Submitted {
                    analysis_id: response.analysis_id,
                })
            }
            Progress::Submitted { analysis_id } => {
                let specs = self.archive.file_specs(study_id, &analysis_id)?;
                let spec = specs.into_iter().next().ok_or_else(|| {
                    SubmitError::Protocol(format!("analysis {analysis_id} has no files"))
                })?;
                Ok(Progress::FileResolved {
                    analysis_id,
                    object_id: spec.object_id,
                    file_size: spec.file_size,
                })
            }
            Progress::FileResolved {
                analysis_id,
                object_id,
                file_size,
            } => {
                let spec = self.storage.init_upload(&object_id, file_size, &file.md5)?;
                let part = spec.parts.into_iter().next().ok_or_else(|| {
                    SubmitError::Protocol(format!("upload {} has no parts", spec.upload_id))
                })?;
                Ok(Progress::Staged {
                    analysis_id,
                    object_id,
                    upload_id: spec.upload_id,
                    url: percent_decode(&part.url),
                })
            }
            Progress::Staged {
                analysis_id,
                object_id,
                upload_id,
                url,
            } => {
                let md5 = content_digest(&file.content);
                if md5 != file.md5 {
                    return Err(SubmitError::DigestMismatch {
                        file_name: file.file_name.clone(),
                        expected: file.md5.clone(),
                        actual: md5,
                    });
                }
                let etag = self.storage.transfer(&url, &file.content)?;
                Ok(Progress::Transferred {
                    analysis_id,
                    object_id,
                    upload_id,
                    etag,
                    md5,
                })
            }
            Progress::Transferred {
                analysis_id,
                object_id,
                upload_id,
                etag,
                md5,
            } => {
                self.storage
                    .finalize_part(&object_id, &upload_id, &etag, &md5, PART_NUMBER)?;
                self.storage.finalize_upload(&object_id, &upload_id)?;
                self.archive.publish(study_id, &analysis_id)?;
                Ok(Progress::Published)
            }
            Progress::Published => Ok(Progress::Published),
        }
    }

    fn checkpoint(
        &self,
        upload: &mut Upload,
        step: ProtocolStep,
        progress: &Progress,
    ) -> Result<(), SubmitError> {
        match progress {
            Progress::Submitted { analysis_id } => {
                upload.analysis_id = Some(analysis_id.clone());
                upload.status = UploadStatus::Processing;
            }
            Progress::Published => upload.status = UploadStatus::Complete,
            _ => {}
        }
        upload.last_completed_step = Some(step);
        upload.updated_at = Utc::now();
        tracing::debug!(upload_id = %upload.upload_id, %step, status = %upload.status, "step done");
        self.store.save_upload(upload)
    }

    fn fail(&self, upload: &mut Upload, step: ProtocolStep, err: &SubmitError) {
        tracing::error!(
            upload_id = %upload.upload_id,
            %step,
            error = %err,
            "upload failed"
        );
        upload.status = UploadStatus::Error;
        upload.error = Some(err.persisted_message());
        upload.updated_at = Utc::now();
        if let Err(store_err) = self.store.save_upload(upload) {
            tracing::error!(
                upload_id = %upload.upload_id,
                error = %store_err,
                "failed to persist upload error"
            );
        }
    }
}

/// Bounded fan-out over queued uploads.
///
/// At most `workers` uploads are in flight and `queue_capacity` more wait in
/// the channel; beyond that, senders block.
pub struct UploadOrchestrator {
    sender: Option<SyncSender<UploadJob>>,
    workers: Vec<JoinHandle<()>>,
    running: Arc<AtomicUsize>,
    settings: WorkerSettings,
}

impl UploadOrchestrator {
    pub fn start(protocol: Protocol, settings: WorkerSettings) -> Result<Self, SubmitError> {
        let (sender, receiver) = mpsc::sync_channel::<UploadJob>(settings.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let running = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(settings.workers);
        for index in 0..settings.workers {
            let receiver = Arc::clone(&receiver);
            let protocol = protocol.clone();
            let running = Arc::clone(&running);
            running.fetch_add(1, Ordering::SeqCst);
            let worker = thread::Builder::new()
                .name(format!("seq-submit-worker-{index}"))
                .spawn(move || {
                    let _guard = RunningGuard(running);
                    worker_loop(&receiver, &protocol);
                })
                .map_err(|err| SubmitError::Thread(err.to_string()))?;
            workers.push(worker);
        }
        tracing::info!(
            workers = settings.workers,
            queue_capacity = settings.queue_capacity,
            "upload orchestrator started"
        );

        Ok(Self {
            sender: Some(sender),
            workers,
            running,
            settings,
        })
    }

    /// Blocks while the channel is full.
    pub fn enqueue(&self, job: UploadJob) -> Result<(), SubmitError> {
        let sender = self.sender.as_ref().ok_or(SubmitError::QueueClosed)?;
        sender.send(job).map_err(|_| SubmitError::QueueClosed)
    }

    /// Feeds `jobs` from a separate thread so the caller does not wait on
    /// backpressure. The jobs are already persisted as QUEUED.
    pub fn enqueue_detached(&self, jobs: Vec<UploadJob>) -> Result<JoinHandle<()>, SubmitError> {
        let sender = self.sender.clone().ok_or(SubmitError::QueueClosed)?;
        thread::Builder::new()
            .name("seq-submit-feeder".to_string())
            .spawn(move || {
                for job in jobs {
                    let upload_id = job.upload.upload_id;
                    if sender.send(job).is_err() {
                        tracing::warn!(%upload_id, "queue closed; upload stays QUEUED");
                        break;
                    }
                }
            })
            .map_err(|err| SubmitError::Thread(err.to_string()))
    }

    /// True while the queue is open and every worker is still running.
    pub fn is_alive(&self) -> bool {
        self.sender.is_some() && self.running.load(Ordering::SeqCst) == self.settings.workers
    }

    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Closes the queue and waits for the workers to drain it.
    pub fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("upload worker panicked");
            }
        }
        tracing::info!("upload orchestrator stopped");
    }
}

fn worker_loop(receiver: &Mutex<Receiver<UploadJob>>, protocol: &Protocol) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.recv() {
                Ok(job) => job,
                Err(_) => break,
            }
        };
        protocol.run(job);
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
