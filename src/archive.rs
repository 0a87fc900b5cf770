use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientSettings;
use crate::error::SubmitError;
use crate::http::{Service, build_client, send_with_retries};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub analysis_id: String,
    #[serde(default)]
    pub status: String,
}

/// A file the archive registered for an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    pub object_id: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub file_md5sum: Option<String>,
}

pub trait ArchiveClient: Send + Sync {
    fn submit(&self, study_id: &str, payload: &Value) -> Result<SubmitResponse, SubmitError>;
    fn file_specs(&self, study_id: &str, analysis_id: &str)
    -> Result<Vec<FileSpec>, SubmitError>;
    fn publish(&self, study_id: &str, analysis_id: &str) -> Result<(), SubmitError>;
}

#[derive(Clone)]
pub struct ArchiveHttpClient {
    client: Client,
    base_url: String,
    max_retries: usize,
    ignore_undefined_md5: bool,
}

impl ArchiveHttpClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, SubmitError> {
        let client = build_client(Service::Archive, settings.token.as_deref(), settings.timeout)?;
        Ok(Self {
            client,
            base_url: settings.archive_url.clone(),
            max_retries: settings.max_retries,
            ignore_undefined_md5: settings.ignore_undefined_md5,
        })
    }
}

impl ArchiveClient for ArchiveHttpClient {
    fn submit(&self, study_id: &str, payload: &Value) -> Result<SubmitResponse, SubmitError> {
        let url = format!("{}/submit/{study_id}", self.base_url);
        let response = send_with_retries(Service::Archive, self.max_retries, || {
            self.client.post(&url).json(payload)
        })?;
        response
            .json()
            .map_err(|err| SubmitError::Protocol(format!("submit response: {err}")))
    }

    fn file_specs(
        &self,
        study_id: &str,
        analysis_id: &str,
    ) -> Result<Vec<FileSpec>, SubmitError> {
        let url = format!(
            "{}/studies/{study_id}/analysis/{analysis_id}/files",
            self.base_url
        );
        let response =
            send_with_retries(Service::Archive, self.max_retries, || self.client.get(&url))?;
        response
            .json()
            .map_err(|err| SubmitError::Protocol(format!("file spec response: {err}")))
    }

    fn publish(&self, study_id: &str, analysis_id: &str) -> Result<(), SubmitError> {
        let url = format!(
            "{}/studies/{study_id}/analysis/publish/{analysis_id}",
            self.base_url
        );
        let ignore = self.ignore_undefined_md5.to_string();
        send_with_retries(Service::Archive, self.max_retries, || {
            self.client
                .put(&url)
                .query(&[("ignoreUndefinedMd5", ignore.as_str())])
        })?;
        Ok(())
    }
}
