//! Text normalization applied before model-assisted metadata extraction.

use anyhow::Result;
use async_trait::async_trait;

use crate::document::Document;
use crate::flow::Processor;

// Longer contractions first so "won't" never degrades into "wo not".
const CONTRACTIONS: [(&str, &str); 11] = [
    ("can't", "cannot"),
    ("won't", "will not"),
    ("they're", "they are"),
    ("you're", "you are"),
    ("they'll", "they will"),
    ("i've", "i have"),
    ("i'd", "i would"),
    ("it's", "it is"),
    ("i'm", "i am"),
    ("n't", " not"),
    ("'re", " are"),
];

/// Lowercases content and expands a fixed contraction table into
/// `cleaned_content`. Idempotent: re-running over enriched text is a no-op.
pub struct EnrichmentProcessor;

impl EnrichmentProcessor {
    /// Builds the processor.
    pub fn new() -> Self {
        Self
    }
}

impl Default for EnrichmentProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor<Document<String>> for EnrichmentProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let mut out = doc.clone();
        let mut cleaned = out.content.to_lowercase();
        for (from, to) in CONTRACTIONS {
            cleaned = cleaned.replace(from, to);
        }

        out.cleaned_content = cleaned;
        out.set_meta("enriched", true);
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SOURCE_WEB;

    fn doc_with(content: &str) -> Document<String> {
        let mut doc: Document<String> = Document::new("https://example.com", SOURCE_WEB);
        doc.content = content.to_string();
        doc
    }

    #[tokio::test]
    async fn expands_contractions_and_lowercases() {
        let input = "I'm certain it's true they're coming; I'd bet they'll stay as I've seen they can't fail and won't quit.";
        let expected = "i am certain it is true they are coming; i would bet they will stay as i have seen they cannot fail and will not quit.";

        let results = EnrichmentProcessor::new()
            .process(doc_with(input))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cleaned_content, expected);
        assert_eq!(results[0].meta_bool("enriched"), Some(true));
    }

    #[tokio::test]
    async fn idempotent_on_enriched_text() {
        let proc = EnrichmentProcessor::new();
        let first = proc
            .process(doc_with("You're sure it's fine, aren't you?"))
            .await
            .unwrap();
        let second = proc.process(first[0].clone()).await.unwrap();
        assert_eq!(first[0].cleaned_content, second[0].cleaned_content);
    }

    #[tokio::test]
    async fn original_content_untouched() {
        let results = EnrichmentProcessor::new()
            .process(doc_with("It's Mixed CASE"))
            .await
            .unwrap();
        assert_eq!(results[0].content, "It's Mixed CASE");
        assert_eq!(results[0].cleaned_content, "it is mixed case");
    }
}
