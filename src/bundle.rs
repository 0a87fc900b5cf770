use std::collections::{BTreeSet, HashMap};
use std::io::Read;

use flate2::read::MultiGzDecoder;

use crate::domain::FileKind;
use crate::error::{FileFailure, SubmitError};
use crate::fasta::{SequenceFileBlock, SkippedFragment, split_sequences};
use crate::tsv::{MetadataParser, MetadataRecord};

/// A named file as received from the intake boundary.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Everything one intake call contributed, ready for merging.
#[derive(Debug, Default)]
pub struct SubmissionBundle {
    pub records: Vec<MetadataRecord>,
    pub files: HashMap<String, SequenceFileBlock>,
    pub original_file_names: BTreeSet<String>,
    pub skipped: Vec<SkippedFragment>,
}

impl SubmissionBundle {
    fn fold(
        mut self,
        kind: FileKind,
        name: &str,
        content: &[u8],
        parser: &MetadataParser,
    ) -> Result<Self, SubmitError> {
        match kind {
            FileKind::Metadata => {
                let text = std::str::from_utf8(content)
                    .map_err(|_| SubmitError::InvalidEncoding(name.to_string()))?;
                self.records.extend(parser.parse(text)?);
            }
            FileKind::Sequence | FileKind::CompressedSequence => {
                let outcome = split_sequences(content);
                self.files.extend(outcome.files);
                self.skipped.extend(outcome.skipped);
            }
        }
        self.original_file_names.insert(name.to_string());
        Ok(self)
    }
}

/// Checks the file-type composition, decompresses gzip sequence files and
/// folds everything into one bundle.
pub fn accumulate(
    files: Vec<UploadedFile>,
    parser: &MetadataParser,
) -> Result<SubmissionBundle, SubmitError> {
    let classified = classify_all(&files)?;

    let mut failures = Vec::new();
    let mut prepared = Vec::with_capacity(files.len());
    for (file, kind) in files.into_iter().zip(classified) {
        if kind == FileKind::CompressedSequence {
            match decompress(&file.content) {
                Ok(content) => prepared.push((kind, file.name, content)),
                Err(reason) => {
                    tracing::warn!(file = %file.name, %reason, "failed to decompress");
                    failures.push(FileFailure {
                        file_name: file.name,
                        reason,
                    });
                }
            }
        } else {
            prepared.push((kind, file.name, file.content));
        }
    }
    if !failures.is_empty() {
        return Err(SubmitError::Decompression { failures });
    }

    prepared
        .iter()
        .try_fold(SubmissionBundle::default(), |bundle, (kind, name, content)| {
            bundle.fold(*kind, name, content, parser)
        })
}

fn classify_all(files: &[UploadedFile]) -> Result<Vec<FileKind>, SubmitError> {
    let kinds = files
        .iter()
        .map(|file| FileKind::classify(&file.name))
        .collect::<Option<Vec<_>>>();
    let metadata = kinds
        .iter()
        .flatten()
        .filter(|kind| **kind == FileKind::Metadata)
        .count();
    let sequences = kinds
        .iter()
        .flatten()
        .filter(|kind| kind.is_sequence())
        .count();

    match kinds {
        Some(kinds) if metadata == 1 && sequences >= 1 => Ok(kinds),
        _ => Err(SubmitError::InvalidFileSet {
            file_names: files.iter().map(|file| file.name.clone()).collect(),
        }),
    }
}

fn decompress(content: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = MultiGzDecoder::new(content);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| err.to_string())?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::FieldSchema;

    #[test]
    fn rejects_two_metadata_files() {
        let schema = vec![FieldSchema::required("sample_id")];
        let parser = MetadataParser::new(&schema);
        let files = vec![
            UploadedFile::new("a.tsv", "sample_id\n"),
            UploadedFile::new("b.tsv", "sample_id\n"),
            UploadedFile::new("a.fasta", ">A/sam1/x\nAC\n"),
        ];
        let err = accumulate(files, &parser).unwrap_err();
        assert_matches!(err, SubmitError::InvalidFileSet { file_names } => {
            assert_eq!(file_names, vec!["a.tsv", "b.tsv", "a.fasta"]);
        });
    }

    #[test]
    fn rejects_unknown_extension() {
        let schema = vec![FieldSchema::required("sample_id")];
        let parser = MetadataParser::new(&schema);
        let files = vec![
            UploadedFile::new("a.tsv", "sample_id\n"),
            UploadedFile::new("a.FASTA", ">A/sam1/x\nAC\n"),
        ];
        let err = accumulate(files, &parser).unwrap_err();
        assert_matches!(err, SubmitError::InvalidFileSet { .. });
    }
}
