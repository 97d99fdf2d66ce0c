//! Machine-readable reports emitted by the node runners.
//!
//! Cypress and Playwright are launched with `--reporter json`. Cypress
//! interleaves its own banner with the reporter output, so the report is
//! the first JSON object found at the start of a line.

use serde_json::Value;

use super::Framework;

impl Framework {
    /// Whether this runner is asked to print a JSON report on stdout.
    pub fn emits_json_report(&self) -> bool {
        matches!(self, Framework::Cypress | Framework::Playwright)
    }

    /// Extract the JSON report from captured stdout.
    ///
    /// `None` for runners without a JSON reporter, or when no parsable
    /// object is present.
    pub fn parse_report(&self, stdout: &str) -> Option<Value> {
        if !self.emits_json_report() {
            return None;
        }
        let mut offset = 0;
        for line in stdout.split_inclusive('\n') {
            if line.trim_start().starts_with('{') {
                if let Some(report) = first_object(&stdout[offset..]) {
                    return Some(report);
                }
            }
            offset += line.len();
        }
        None
    }
}

fn first_object(text: &str) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_str(text.trim_start()).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) if value.is_object() => Some(value),
        _ => None,
    }
}
