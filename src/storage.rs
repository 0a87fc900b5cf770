use reqwest::blocking::Client;
use reqwest::header::ETAG;
use serde::{Deserialize, Serialize};

use crate::config::ClientSettings;
use crate::error::SubmitError;
use crate::http::{Service, build_client, send_with_retries};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartSpec {
    pub part_number: u32,
    #[serde(default)]
    pub part_size: u64,
    #[serde(default)]
    pub offset: u64,
    pub url: String,
}

/// A staged upload as initialised by the storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSpec {
    pub object_id: String,
    pub upload_id: String,
    #[serde(default)]
    pub parts: Vec<PartSpec>,
}

pub trait StorageClient: Send + Sync {
    fn init_upload(
        &self,
        object_id: &str,
        file_size: u64,
        md5: &str,
    ) -> Result<UploadSpec, SubmitError>;
    /// PUTs the bytes and returns the entity tag, unquoted.
    fn transfer(&self, url: &str, content: &[u8]) -> Result<String, SubmitError>;
    fn finalize_part(
        &self,
        object_id: &str,
        upload_id: &str,
        etag: &str,
        md5: &str,
        part_number: u32,
    ) -> Result<(), SubmitError>;
    fn finalize_upload(&self, object_id: &str, upload_id: &str) -> Result<(), SubmitError>;
}

#[derive(Clone)]
pub struct StorageHttpClient {
    client: Client,
    transfer_client: Client,
    base_url: String,
    max_retries: usize,
}

impl StorageHttpClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, SubmitError> {
        let client = build_client(Service::Storage, settings.token.as_deref(), settings.timeout)?;
        // presigned destinations reject an extra Authorization header
        let transfer_client = build_client(Service::Storage, None, settings.timeout)?;
        Ok(Self {
            client,
            transfer_client,
            base_url: settings.storage_url.clone(),
            max_retries: settings.max_retries,
        })
    }
}

impl StorageClient for StorageHttpClient {
    fn init_upload(
        &self,
        object_id: &str,
        file_size: u64,
        md5: &str,
    ) -> Result<UploadSpec, SubmitError> {
        let url = format!("{}/upload/{object_id}/uploads", self.base_url);
        let file_size = file_size.to_string();
        let response = send_with_retries(Service::Storage, self.max_retries, || {
            self.client.post(&url).query(&[
                ("fileSize", file_size.as_str()),
                ("md5", md5),
                ("overwrite", "true"),
            ])
        })?;
        response
            .json()
            .map_err(|err| SubmitError::Protocol(format!("init upload response: {err}")))
    }

    fn transfer(&self, url: &str, content: &[u8]) -> Result<String, SubmitError> {
        let response = send_with_retries(Service::Storage, self.max_retries, || {
            self.transfer_client.put(url).body(content.to_vec())
        })?;
        response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(strip_etag)
            .ok_or_else(|| SubmitError::Protocol("transfer response has no ETag".to_string()))
    }

    fn finalize_part(
        &self,
        object_id: &str,
        upload_id: &str,
        etag: &str,
        md5: &str,
        part_number: u32,
    ) -> Result<(), SubmitError> {
        let url = format!("{}/upload/{object_id}/parts", self.base_url);
        let part_number = part_number.to_string();
        send_with_retries(Service::Storage, self.max_retries, || {
            self.client.post(&url).query(&[
                ("uploadId", upload_id),
                ("etag", etag),
                ("md5", md5),
                ("partNumber", part_number.as_str()),
            ])
        })?;
        Ok(())
    }

    fn finalize_upload(&self, object_id: &str, upload_id: &str) -> Result<(), SubmitError> {
        let url = format!("{}/upload/{object_id}", self.base_url);
        send_with_retries(Service::Storage, self.max_retries, || {
            self.client.post(&url).query(&[("uploadId", upload_id)])
        })?;
        Ok(())
    }
}

pub fn strip_etag(raw: &str) -> String {
    raw.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

/// Decodes `%XX` escapes. Destination URLs come back encoded and would be
/// encoded a second time by the HTTP client otherwise.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(((hi << 4) + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_presigned_url() {
        let url = "https://bucket.local/data/obj?X-Amz-Credential=abc%2F20240101%2Fus-east-1&sig=a%3Db";
        assert_eq!(
            percent_decode(url),
            "https://bucket.local/data/obj?X-Amz-Credential=abc/20240101/us-east-1&sig=a=b"
        );
    }

    #[test]
    fn keeps_incomplete_escapes() {
        assert_eq!(percent_decode("a%2"), "a%2");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%41"), "A");
    }

    #[test]
    fn strips_etag_quotes() {
        assert_eq!(
            strip_etag("\"9a0364b9e99bb480dd25e1f0284c8555\""),
            "9a0364b9e99bb480dd25e1f0284c8555"
        );
        assert_eq!(strip_etag("W/\"abc\""), "abc");
    }
}
