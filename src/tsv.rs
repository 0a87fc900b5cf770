//! Tab-separated metadata tables.
//!
//! Validation runs in two passes: the header row is compared against the
//! schema first, then every row is scanned and all field errors are reported
//! together.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::FieldSchema;
use crate::domain::FieldType;
use crate::error::{FieldError, FieldErrorReason, SubmitError};

/// One metadata row keyed by header name. Every schema field is present,
/// absent trailing cells being filled with the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataRecord {
    row: usize,
    fields: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// 1-based line number in the source table.
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

pub struct MetadataParser<'a> {
    schema: &'a [FieldSchema],
}

impl<'a> MetadataParser<'a> {
    pub fn new(schema: &'a [FieldSchema]) -> Self {
        Self { schema }
    }

    /// Parses and validates a whole table.
    pub fn parse(&self, text: &str) -> Result<Vec<MetadataRecord>, SubmitError> {
        let records = self.rows(text)?.collect::<Vec<_>>();

        let errors = records
            .iter()
            .flat_map(|record| self.field_errors(record))
            .collect::<Vec<_>>();
        if !errors.is_empty() {
            return Err(SubmitError::InvalidFields { errors });
        }
        Ok(records)
    }

    /// Checks the header row and yields records lazily, without field validation.
    pub fn rows<'t>(
        &self,
        text: &'t str,
    ) -> Result<impl Iterator<Item = MetadataRecord> + 't, SubmitError> {
        let mut lines = text.lines().enumerate();
        let headers = lines
            .next()
            .map(|(_, line)| line.split('\t').map(clean_value).collect::<Vec<_>>())
            .unwrap_or_default();
        self.check_headers(&headers)?;

        Ok(lines.filter_map(move |(index, line)| {
            if line.trim().is_empty() {
                return None;
            }
            let mut cells = line.split('\t').map(clean_value);
            let fields = headers
                .iter()
                .map(|header| (header.clone(), cells.next().unwrap_or_default()))
                .filter(|(header, _)| !header.is_empty())
                .collect::<BTreeMap<_, _>>();
            if fields.values().all(String::is_empty) {
                return None;
            }
            Some(MetadataRecord {
                row: index + 1,
                fields,
            })
        }))
    }

    fn check_headers(&self, headers: &[String]) -> Result<(), SubmitError> {
        let expected = self
            .schema
            .iter()
            .map(|field| field.name.as_str())
            .collect::<BTreeSet<_>>();
        let mut actual = BTreeSet::new();
        let mut duplicate = BTreeSet::new();
        for header in headers.iter().filter(|header| !header.is_empty()) {
            if !actual.insert(header.as_str()) {
                duplicate.insert(header.clone());
            }
        }

        let missing = expected
            .difference(&actual)
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        let unknown = actual
            .difference(&expected)
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        if missing.is_empty() && unknown.is_empty() && duplicate.is_empty() {
            return Ok(());
        }
        Err(SubmitError::HeaderMismatch {
            missing,
            unknown,
            duplicate: duplicate.into_iter().collect(),
        })
    }

    fn field_errors(&self, record: &MetadataRecord) -> Vec<FieldError> {
        let mut errors = Vec::new();
        for field in self.schema {
            let value = record.get(&field.name).unwrap_or_default();
            let reason = if value.is_empty() {
                field.required.then_some(FieldErrorReason::NotAllowedToBeEmpty)
            } else if field.field_type == FieldType::Number && !is_number(value) {
                Some(FieldErrorReason::NotANumber)
            } else {
                None
            };
            if let Some(reason) = reason {
                errors.push(FieldError {
                    field: field.name.clone(),
                    reason,
                    row: record.row,
                });
            }
        }
        errors
    }
}

fn clean_value(raw: &str) -> String {
    raw.chars().filter(|ch| *ch != '\r' && *ch != '\n').collect()
}

/// Number cells are inserted bare into the JSON payload, so they follow the
/// JSON number grammar.
fn is_number(value: &str) -> bool {
    serde_json::from_str::<serde_json::Number>(value.trim()).is_ok()
}
