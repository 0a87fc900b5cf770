use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use seq_submit::domain::UploadStatus;
use seq_submit::error::SubmitError;
use seq_submit::fasta::SequenceFileBlock;
use seq_submit::feed::FeedFilter;
use seq_submit::store::{FileStore, Submission, Upload, UploadJob, UploadQuery, UploadStore};

fn open_store() -> (tempfile::TempDir, FileStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("store")).unwrap();
    let store = FileStore::open(root).unwrap();
    (temp, store)
}

fn job(submission_id: Uuid, user_id: &str, sample_id: &str, minute: u32) -> UploadJob {
    let mut upload = Upload::queued(
        submission_id,
        user_id,
        "S1",
        sample_id,
        BTreeSet::from(["meta.tsv".to_string(), "seqs.fasta".to_string()]),
    );
    upload.created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap();
    upload.updated_at = upload.created_at;
    let content = format!(">A/{sample_id}/x\nACGT\n");
    UploadJob {
        upload,
        payload: json!({"studyId": "S1", "samples": [{"submitterSampleId": sample_id}]}),
        file: SequenceFileBlock::from_fragment(sample_id, content.as_bytes()),
    }
}

fn submit(store: &FileStore, user_id: &str, jobs: &[UploadJob]) -> Uuid {
    let submission_id = jobs[0].upload.submission_id;
    let submission = Submission {
        submission_id,
        user_id: user_id.to_string(),
        created_at: Utc::now(),
        original_file_names: BTreeSet::from(["meta.tsv".to_string()]),
        study_ids: BTreeSet::from(["S1".to_string()]),
        total_records: jobs.len(),
    };
    store.create_submission(&submission, jobs).unwrap();
    submission_id
}

#[test]
fn lists_newest_first_with_paging() {
    let (_temp, store) = open_store();
    let submission_id = Uuid::new_v4();
    let jobs = vec![
        job(submission_id, "alice", "sam1", 1),
        job(submission_id, "alice", "sam2", 3),
        job(submission_id, "alice", "sam3", 2),
    ];
    submit(&store, "alice", &jobs);

    let query = |page| UploadQuery {
        user_id: "alice".to_string(),
        submission_id: None,
        page,
        size: 2,
    };
    let first = store.list_uploads(&query(0)).unwrap();
    assert_eq!(first.total, 3);
    let samples = first
        .items
        .iter()
        .map(|upload| upload.submitter_sample_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(samples, vec!["sam2", "sam3"]);

    let second = store.list_uploads(&query(1)).unwrap();
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].submitter_sample_id, "sam1");
    assert!(store.list_uploads(&query(2)).unwrap().items.is_empty());
}

#[test]
fn listing_is_scoped_to_user_and_submission() {
    let (_temp, store) = open_store();
    let first = submit(&store, "alice", &[job(Uuid::new_v4(), "alice", "sam1", 1)]);
    submit(&store, "alice", &[job(Uuid::new_v4(), "alice", "sam2", 2)]);
    submit(&store, "bob", &[job(Uuid::new_v4(), "bob", "sam3", 3)]);

    let all = store
        .list_uploads(&UploadQuery {
            user_id: "alice".to_string(),
            submission_id: None,
            page: 0,
            size: 10,
        })
        .unwrap();
    assert_eq!(all.total, 2);

    let scoped = store
        .list_uploads(&UploadQuery {
            user_id: "alice".to_string(),
            submission_id: Some(first),
            page: 0,
            size: 10,
        })
        .unwrap();
    assert_eq!(scoped.total, 1);
    assert_eq!(scoped.items[0].submitter_sample_id, "sam1");
}

#[test]
fn queued_jobs_restore_payload_and_bytes() {
    let (_temp, store) = open_store();
    let submission_id = Uuid::new_v4();
    let jobs = vec![
        job(submission_id, "alice", "sam1", 1),
        job(submission_id, "alice", "sam2", 2),
    ];
    submit(&store, "alice", &jobs);

    let mut done = jobs[1].upload.clone();
    done.status = UploadStatus::Complete;
    store.save_upload(&done).unwrap();

    let queued = store.queued_jobs().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].upload, jobs[0].upload);
    assert_eq!(queued[0].payload, jobs[0].payload);
    assert_eq!(queued[0].file, jobs[0].file);
    assert_eq!(queued[0].file.content, b">A/sam1/x\nACGT\n");
}

#[test]
fn every_write_reaches_the_feed() {
    let (_temp, store) = open_store();
    let feed = store.subscribe(FeedFilter::user("alice"));
    let jobs = vec![job(Uuid::new_v4(), "alice", "sam1", 1)];
    submit(&store, "alice", &jobs);

    let mut processing = jobs[0].upload.clone();
    processing.status = UploadStatus::Processing;
    store.save_upload(&processing).unwrap();

    let first = feed.next_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first.status, UploadStatus::Queued);
    let second = feed.next_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(second.status, UploadStatus::Processing);
    assert_eq!(store.upload(first.upload_id).unwrap(), Some(processing));
}

#[test]
fn missing_records_are_none() {
    let (_temp, store) = open_store();
    assert!(store.upload(Uuid::new_v4()).unwrap().is_none());
    assert!(store.submission(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn failed_intake_leaves_nothing_to_resume() {
    let (_temp, store) = open_store();
    let submission_id = Uuid::new_v4();
    let jobs = vec![
        job(submission_id, "alice", "sam1", 1),
        job(submission_id, "alice", "sam2", 2),
    ];
    let blocked = store
        .root()
        .join("uploads")
        .join(format!("{}.json", jobs[1].upload.upload_id));
    fs::create_dir_all(blocked.as_std_path()).unwrap();

    let submission = Submission {
        submission_id,
        user_id: "alice".to_string(),
        created_at: Utc::now(),
        original_file_names: BTreeSet::from(["meta.tsv".to_string()]),
        study_ids: BTreeSet::from(["S1".to_string()]),
        total_records: jobs.len(),
    };
    let err = store.create_submission(&submission, &jobs).unwrap_err();
    assert_matches!(err, SubmitError::Filesystem(_));
    fs::remove_dir(blocked.as_std_path()).unwrap();

    assert!(store.submission(submission_id).unwrap().is_none());
    assert!(store.upload(jobs[0].upload.upload_id).unwrap().is_none());
    assert!(store.queued_jobs().unwrap().is_empty());
    let leftovers = fs::read_dir(store.root().join("requests").as_std_path())
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn queued_uploads_without_submission_are_skipped() {
    let (_temp, store) = open_store();
    let kept = submit(&store, "alice", &[job(Uuid::new_v4(), "alice", "sam1", 1)]);
    let orphaned = submit(&store, "alice", &[job(Uuid::new_v4(), "alice", "sam2", 2)]);
    let record = store
        .root()
        .join("submissions")
        .join(format!("{orphaned}.json"));
    fs::remove_file(record.as_std_path()).unwrap();

    let queued = store.queued_jobs().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].upload.submission_id, kept);
}
