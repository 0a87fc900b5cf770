use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::config::FieldSchema;
use crate::domain::FieldType;
use crate::error::SubmitError;
use crate::tsv::MetadataRecord;

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}";

/// A JSON payload shape with `{{field}}` placeholders.
///
/// String fields are substituted JSON-escaped, so the template is expected to
/// quote them (`"{{sample_id}}"`). Number fields are substituted bare and
/// become `null` when empty.
#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    text: String,
    pattern: Regex,
    field_types: HashMap<String, FieldType>,
}

impl PayloadTemplate {
    /// Fails on the first placeholder that names no schema field.
    pub fn new(text: &str, schema: &[FieldSchema]) -> Result<Self, SubmitError> {
        let pattern = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|err| SubmitError::InvalidConfig(err.to_string()))?;
        let field_types = schema
            .iter()
            .map(|field| (field.name.clone(), field.field_type))
            .collect::<HashMap<_, _>>();

        for captures in pattern.captures_iter(text) {
            let name = &captures[1];
            if !field_types.contains_key(name) {
                return Err(SubmitError::UndefinedPlaceholder(name.to_string()));
            }
        }

        Ok(Self {
            text: text.to_string(),
            pattern,
            field_types,
        })
    }

    pub fn placeholders(&self) -> Vec<&str> {
        self.pattern
            .captures_iter(&self.text)
            .filter_map(|captures| captures.get(1).map(|name| name.as_str()))
            .collect()
    }

    pub fn render(&self, record: &MetadataRecord) -> Result<Value, SubmitError> {
        let mut rendered = String::with_capacity(self.text.len());
        let mut last = 0;
        for captures in self.pattern.captures_iter(&self.text) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let name = name.as_str();
            let value = record
                .get(name)
                .ok_or_else(|| SubmitError::UndefinedPlaceholder(name.to_string()))?;
            rendered.push_str(&self.text[last..whole.start()]);
            rendered.push_str(&self.substitution(name, value)?);
            last = whole.end();
        }
        rendered.push_str(&self.text[last..]);

        serde_json::from_str(&rendered).map_err(|err| {
            SubmitError::TemplateRender(format!("row {}: {err}", record.row()))
        })
    }

    fn substitution(&self, name: &str, value: &str) -> Result<String, SubmitError> {
        match self.field_types.get(name) {
            Some(FieldType::Number) if value.trim().is_empty() => Ok("null".to_string()),
            Some(FieldType::Number) => Ok(value.trim().to_string()),
            Some(FieldType::String) => {
                let quoted = serde_json::to_string(value)
                    .map_err(|err| SubmitError::TemplateRender(err.to_string()))?;
                Ok(quoted[1..quoted.len() - 1].to_string())
            }
            None => Err(SubmitError::UndefinedPlaceholder(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsv::MetadataParser;

    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::required("sample_id"),
            FieldSchema::optional("note"),
            FieldSchema::optional("age").number(),
        ]
    }

    #[test]
    fn escapes_strings_and_leaves_numbers_bare() {
        let schema = schema();
        let template = PayloadTemplate::new(
            r#"{"id": "{{sample_id}}", "note": "{{ note }}", "age": {{age}}}"#,
            &schema,
        )
        .unwrap();
        let records = MetadataParser::new(&schema)
            .parse("sample_id\tnote\tage\nsam1\tsaid \"hi\"\t42\nsam2\t\t\n")
            .unwrap();

        let first = template.render(&records[0]).unwrap();
        assert_eq!(first["note"], "said \"hi\"");
        assert_eq!(first["age"], 42);

        let second = template.render(&records[1]).unwrap();
        assert!(second["age"].is_null());
        assert_eq!(template.placeholders(), vec!["sample_id", "note", "age"]);
    }
}
