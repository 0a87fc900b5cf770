//! Joins metadata records with their sequence blocks into archive payloads.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use serde_json::{Value, json};

use crate::bundle::SubmissionBundle;
use crate::error::SubmitError;
use crate::fasta::SequenceFileBlock;
use crate::template::PayloadTemplate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    pub sample_id_pointer: String,
    pub study_id_pointer: String,
    pub file_type: String,
    pub data_type: String,
    pub file_access: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            sample_id_pointer: "/samples/0/submitterSampleId".to_string(),
            study_id_pointer: "/studyId".to_string(),
            file_type: "FASTA".to_string(),
            data_type: "FASTA".to_string(),
            file_access: "open".to_string(),
        }
    }
}

/// One sample ready to go through the archive protocol.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRequest {
    pub study_id: String,
    pub sample_id: String,
    pub payload: Value,
    pub file: SequenceFileBlock,
    pub original_file_names: BTreeSet<String>,
}

impl SubmissionRequest {
    pub fn composite_key(&self) -> String {
        format!("{}{}", self.study_id, self.sample_id)
    }
}

#[derive(Default)]
struct MergeState {
    rendered: Vec<(String, String, Value)>,
    used: HashSet<String>,
    record_missing_file: Vec<String>,
}

/// Every record must find its file and every file must be claimed by a
/// record; otherwise both mismatch lists are returned, even if one is empty.
pub fn merge_bundle(
    bundle: SubmissionBundle,
    template: &PayloadTemplate,
    options: &MergeOptions,
) -> Result<Vec<SubmissionRequest>, SubmitError> {
    let state = bundle
        .records
        .iter()
        .try_fold(MergeState::default(), |mut state, record| {
            let mut payload = template.render(record)?;
            let sample_id = string_at(&payload, &options.sample_id_pointer)?;
            let study_id = string_at(&payload, &options.study_id_pointer)?;

            match bundle.files.get(&sample_id) {
                Some(file) => {
                    attach_file(&mut payload, file, options)?;
                    state.used.insert(sample_id.clone());
                    state.rendered.push((study_id, sample_id, payload));
                }
                None => state.record_missing_file.push(sample_id),
            }
            Ok::<_, SubmitError>(state)
        })?;

    let mut file_missing_in_tsv = bundle
        .files
        .keys()
        .filter(|sample_id| !state.used.contains(*sample_id))
        .cloned()
        .collect::<Vec<_>>();
    if !file_missing_in_tsv.is_empty() || !state.record_missing_file.is_empty() {
        file_missing_in_tsv.sort();
        let mut record_missing_file = state.record_missing_file;
        record_missing_file.sort();
        return Err(SubmitError::SampleMismatch {
            file_missing_in_tsv,
            record_missing_file,
        });
    }

    let requests = state
        .rendered
        .into_iter()
        .filter_map(|(study_id, sample_id, payload)| {
            let file = bundle.files.get(&sample_id)?.clone();
            Some(SubmissionRequest {
                study_id,
                sample_id,
                payload,
                file,
                original_file_names: bundle.original_file_names.clone(),
            })
        })
        .collect::<Vec<_>>();
    tracing::debug!(requests = requests.len(), "merged bundle");
    Ok(requests)
}

fn string_at(payload: &Value, pointer: &str) -> Result<String, SubmitError> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SubmitError::PayloadField(pointer.to_string()))
}

fn attach_file(
    payload: &mut Value,
    file: &SequenceFileBlock,
    options: &MergeOptions,
) -> Result<(), SubmitError> {
    let object = payload.as_object_mut().ok_or_else(|| {
        SubmitError::TemplateRender("payload template must render a JSON object".to_string())
    })?;
    object.insert(
        "files".to_string(),
        json!([{
            "fileName": file.file_name,
            "fileSize": file.size,
            "fileMd5sum": file.md5,
            "fileAccess": options.file_access,
            "fileType": options.file_type,
            "dataType": options.data_type,
        }]),
    );
    Ok(())
}
