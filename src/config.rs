use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::FieldType;
use crate::error::SubmitError;
use crate::merge::MergeOptions;
use crate::template::PayloadTemplate;

pub const DEFAULT_CONFIG_FILE: &str = "seq-submit.json";
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub schema: Vec<FieldSchema>,
    #[serde(default)]
    pub payload_template: Option<String>,
    #[serde(default)]
    pub payload_template_path: Option<String>,
    #[serde(default)]
    pub sample_id_pointer: Option<String>,
    #[serde(default)]
    pub study_id_pointer: Option<String>,
    pub archive_url: String,
    pub storage_url: String,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub store_dir: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub file_access: Option<String>,
    #[serde(default)]
    pub ignore_undefined_md5: Option<bool>,
}

/// One expected metadata column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSchema {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::String,
            required: true,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::String,
            required: false,
        }
    }

    pub fn number(mut self) -> Self {
        self.field_type = FieldType::Number;
        self
    }
}

/// Settings shared by the archive and storage HTTP clients.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub archive_url: String,
    pub storage_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub max_retries: usize,
    pub ignore_undefined_md5: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema: Vec<FieldSchema>,
    pub template: PayloadTemplate,
    pub merge: MergeOptions,
    pub clients: ClientSettings,
    pub workers: WorkerSettings,
    pub store_dir: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SubmitError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SubmitError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SubmitError::ConfigRead(config_path.clone()))?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|err| SubmitError::ConfigParse(err.to_string()))?;

        if config.payload_template.is_none() {
            if let Some(template_path) = &config.payload_template_path {
                let template_path = config_path
                    .parent()
                    .map(|dir| dir.join(template_path))
                    .unwrap_or_else(|| PathBuf::from(template_path));
                let text = fs::read_to_string(&template_path)
                    .map_err(|_| SubmitError::ConfigRead(template_path.clone()))?;
                config.payload_template = Some(text);
            }
        }

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SubmitError> {
        let schema_version = config.schema_version.unwrap_or(CONFIG_SCHEMA_VERSION);
        if schema_version != CONFIG_SCHEMA_VERSION {
            return Err(SubmitError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}, expected {CONFIG_SCHEMA_VERSION}"
            )));
        }
        validate_schema(&config.schema)?;

        let template_text = config.payload_template.ok_or_else(|| {
            SubmitError::InvalidConfig(
                "one of payload_template or payload_template_path is required".to_string(),
            )
        })?;
        let template = PayloadTemplate::new(&template_text, &config.schema)?;

        let defaults = MergeOptions::default();
        let merge = MergeOptions {
            sample_id_pointer: config
                .sample_id_pointer
                .unwrap_or(defaults.sample_id_pointer),
            study_id_pointer: config.study_id_pointer.unwrap_or(defaults.study_id_pointer),
            file_type: config.file_type.unwrap_or(defaults.file_type),
            data_type: config.data_type.unwrap_or(defaults.data_type),
            file_access: config.file_access.unwrap_or(defaults.file_access),
        };
        for pointer in [&merge.sample_id_pointer, &merge.study_id_pointer] {
            if !pointer.starts_with('/') {
                return Err(SubmitError::InvalidConfig(format!(
                    "JSON pointer must start with '/': {pointer}"
                )));
            }
        }

        let token_env = config
            .token_env
            .unwrap_or_else(|| "SEQ_SUBMIT_TOKEN".to_string());
        let token = std::env::var(&token_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let clients = ClientSettings {
            archive_url: config.archive_url.trim_end_matches('/').to_string(),
            storage_url: config.storage_url.trim_end_matches('/').to_string(),
            token,
            timeout: Duration::from_secs(config.request_timeout_secs.unwrap_or(60)),
            max_retries: config.max_retries.unwrap_or(3),
            ignore_undefined_md5: config.ignore_undefined_md5.unwrap_or(false),
        };

        let default_workers = WorkerSettings::default();
        let workers = WorkerSettings {
            workers: config.workers.unwrap_or(default_workers.workers),
            queue_capacity: config
                .queue_capacity
                .unwrap_or(default_workers.queue_capacity),
        };
        if workers.workers == 0 {
            return Err(SubmitError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }

        let store_dir = match config.store_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_store_dir()?,
        };

        Ok(ResolvedConfig {
            schema: config.schema,
            template,
            merge,
            clients,
            workers,
            store_dir,
        })
    }
}

fn validate_schema(schema: &[FieldSchema]) -> Result<(), SubmitError> {
    if schema.is_empty() {
        return Err(SubmitError::InvalidConfig(
            "schema must declare at least one field".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for field in schema {
        if field.name.trim().is_empty() {
            return Err(SubmitError::InvalidConfig(
                "schema field names must not be empty".to_string(),
            ));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(SubmitError::InvalidConfig(format!(
                "duplicate schema field: {}",
                field.name
            )));
        }
    }
    Ok(())
}

pub fn default_store_dir() -> Result<Utf8PathBuf, SubmitError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("seq-submit")).ok())
        .ok_or_else(|| SubmitError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn base_config() -> Config {
        Config {
            schema_version: None,
            schema: vec![
                FieldSchema::required("study_id"),
                FieldSchema::required("sample_id"),
            ],
            payload_template: Some(
                r#"{"studyId": "{{study_id}}", "samples": [{"submitterSampleId": "{{sample_id}}"}]}"#
                    .to_string(),
            ),
            payload_template_path: None,
            sample_id_pointer: None,
            study_id_pointer: None,
            archive_url: "http://archive.local/".to_string(),
            storage_url: "http://storage.local".to_string(),
            token_env: Some("SEQ_SUBMIT_TEST_TOKEN_UNSET".to_string()),
            workers: None,
            queue_capacity: None,
            request_timeout_secs: None,
            max_retries: None,
            store_dir: Some("/tmp/seq-submit".to_string()),
            file_type: None,
            data_type: None,
            file_access: None,
            ignore_undefined_md5: None,
        }
    }

    #[test]
    fn resolve_applies_defaults() {
        let resolved = ConfigLoader::resolve_config(base_config()).unwrap();
        assert_eq!(resolved.workers, WorkerSettings::default());
        assert_eq!(resolved.clients.archive_url, "http://archive.local");
        assert_eq!(resolved.clients.max_retries, 3);
        assert_eq!(resolved.merge.sample_id_pointer, "/samples/0/submitterSampleId");
        assert!(resolved.clients.token.is_none());
    }

    #[test]
    fn unsupported_schema_version_is_rejected() {
        let mut config = base_config();
        config.schema_version = Some(2);
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SubmitError::InvalidConfig(message) if message.contains("schema_version 2"));

        let mut config = base_config();
        config.schema_version = Some(CONFIG_SCHEMA_VERSION);
        assert!(ConfigLoader::resolve_config(config).is_ok());
    }

    #[test]
    fn duplicate_schema_fields_are_rejected() {
        let mut config = base_config();
        config.schema.push(FieldSchema::optional("sample_id"));
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SubmitError::InvalidConfig(_));
    }

    #[test]
    fn undefined_placeholder_fails_fast() {
        let mut config = base_config();
        config.payload_template = Some(r#"{"studyId": "{{project}}"}"#.to_string());
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SubmitError::UndefinedPlaceholder(name) if name == "project");
    }
}
