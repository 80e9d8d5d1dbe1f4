//! Prompt-injection screening applied before content reaches any model.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;

use crate::document::Document;
use crate::errors::CrawlError;
use crate::flow::Processor;

const SIGNATURES: [&str; 4] = [
    r"(?i)ignore (all )?previous instructions",
    r"(?i)do not (use|mention|follow)",
    r"(?i)---(.*?)END OF PROMPT(.*?)---",
    r"(?i)\[(.*?)INTERNAL(.*?)\]",
];

/// Scans content against a fixed signature list.
///
/// Soft mode tags the document and forwards it; hard mode rejects with the
/// permanent security sentinel.
pub struct SecurityProcessor {
    patterns: Vec<Regex>,
    fail_on_violation: bool,
}

impl SecurityProcessor {
    /// Builds the processor; `fail_on_violation` selects hard mode.
    pub fn new(fail_on_violation: bool) -> Self {
        let patterns = SIGNATURES
            .iter()
            .map(|signature| Regex::new(signature).expect("injection signature"))
            .collect();
        Self {
            patterns,
            fail_on_violation,
        }
    }
}

#[async_trait]
impl Processor<Document<String>> for SecurityProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let content = doc.content.to_lowercase();
        let hits = self
            .patterns
            .iter()
            .filter(|pattern| pattern.is_match(&content))
            .count() as i64;

        if hits == 0 {
            return Ok(vec![doc]);
        }

        if self.fail_on_violation {
            return Err(anyhow::Error::new(CrawlError::SecurityViolation))
                .with_context(|| format!("found {hits} suspicious patterns"));
        }

        let mut out = doc.clone();
        out.set_meta("security_score", hits);
        out.set_meta("potential_injection", true);
        Ok(vec![out])
    }
}
