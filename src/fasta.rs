//! Splits a multi-sample FASTA blob into one content block per sample.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const RECORD_MARKER: u8 = b'>';

/// One sample's slice of an uploaded sequence blob. `content` is the exact
/// fragment bytes, marker included, and `md5` is computed over them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFileBlock {
    pub sample_id: String,
    pub file_name: String,
    pub size: u64,
    pub md5: String,
    #[serde(skip)]
    pub content: Vec<u8>,
}

impl SequenceFileBlock {
    pub fn from_fragment(sample_id: &str, content: &[u8]) -> Self {
        Self {
            sample_id: sample_id.to_string(),
            file_name: format!("{sample_id}.fasta"),
            size: content.len() as u64,
            md5: content_digest(content),
            content: content.to_vec(),
        }
    }
}

/// A fragment that was dropped because its header carries no sample id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFragment {
    pub header: String,
}

#[derive(Debug, Default)]
pub struct SplitOutcome {
    pub files: HashMap<String, SequenceFileBlock>,
    pub skipped: Vec<SkippedFragment>,
}

/// Hex MD5 of the exact bytes; this is also the checksum the storage tier expects.
pub fn content_digest(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

/// Splits at every record marker. Blocks are hashed in parallel; when two
/// fragments share a sample id the later one wins.
pub fn split_sequences(blob: &[u8]) -> SplitOutcome {
    let fragments = fragments(blob);

    let parsed = fragments
        .par_iter()
        .map(|fragment| match parse_sample_id(fragment) {
            Ok(sample_id) => Ok(SequenceFileBlock::from_fragment(&sample_id, fragment)),
            Err(header) => Err(SkippedFragment { header }),
        })
        .collect::<Vec<_>>();

    let mut outcome = SplitOutcome::default();
    for item in parsed {
        match item {
            Ok(block) => {
                if outcome.files.contains_key(&block.sample_id) {
                    tracing::debug!(sample_id = %block.sample_id, "duplicate sample id replaces earlier fragment");
                }
                outcome.files.insert(block.sample_id.clone(), block);
            }
            Err(skipped) => {
                tracing::warn!(header = %skipped.header, "skipping sequence fragment without sample id");
                outcome.skipped.push(skipped);
            }
        }
    }
    outcome
}

fn fragments(blob: &[u8]) -> Vec<&[u8]> {
    let mut starts = blob
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte == RECORD_MARKER)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = starts.get(i + 1).copied().unwrap_or(blob.len());
            &blob[*start..end]
        })
        .filter(|fragment| !is_blank(fragment))
        .collect()
}

/// Second '/'-delimited token of the header line, e.g. `sam1` in `>A/sam1/x`.
fn parse_sample_id(fragment: &[u8]) -> Result<String, String> {
    let header_end = fragment
        .iter()
        .position(|byte| *byte == b'\n')
        .unwrap_or(fragment.len());
    let header = String::from_utf8_lossy(&fragment[..header_end])
        .trim_end_matches('\r')
        .to_string();

    let sample_id = header
        .strip_prefix(RECORD_MARKER as char)
        .and_then(|rest| rest.split('/').nth(1))
        .map(str::trim)
        .filter(|sample_id| !sample_id.is_empty())
        .map(str::to_string);
    sample_id.ok_or(header)
}

fn is_blank(fragment: &[u8]) -> bool {
    fragment
        .iter()
        .all(|byte| byte.is_ascii_whitespace() || *byte == RECORD_MARKER)
}
