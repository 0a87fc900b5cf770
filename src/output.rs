use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CheckResult, ResumeResult, SubmissionCreated};
use crate::store::{Page, Upload};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_submission(result: &SubmissionCreated) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_uploads(page: &Page<Upload>) -> io::Result<()> {
        Self::print_json(page)
    }

    pub fn print_resume(result: &ResumeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    /// One compact line per event, for following a submission live.
    pub fn print_event(upload: &Upload) -> io::Result<()> {
        let json = serde_json::to_string(upload).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
