use std::io::{self, Write};

use serde::Serialize;

use crate::outcome::Outcome;

/// Result of one sync job, as printed to stdout.
#[derive(Debug, Serialize)]
pub struct JobReport<'a> {
    pub job: &'a str,
    pub outcomes: &'a [Outcome],
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(job: &str, outcomes: &[Outcome]) -> io::Result<()> {
        Self::print_json(&JobReport { job, outcomes })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
