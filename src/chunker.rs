//! Recursive delimiter-descent chunker producing overlapping chunks with
//! stable child ids.

use anyhow::Result;
use async_trait::async_trait;

use crate::document::Document;
use crate::flow::Processor;

const DELIMITERS: [&str; 8] = ["\n\n", "\n", ". ", "! ", "? ", ";", ":", " "];

/// Splits document content at natural boundaries, preferring paragraphs over
/// lines over sentences over clauses over words. Oversized runs with no
/// usable delimiter fall back to a char-indexed sliding window with step
/// `size - overlap`.
pub struct ChunkerProcessor {
    max_chunk_size: usize,
    overlap: usize,
}

impl ChunkerProcessor {
    /// Builds a chunker with the given size budget and overlap carry-over.
    pub fn new(max_chunk_size: usize, overlap: usize) -> Self {
        Self {
            max_chunk_size: max_chunk_size.max(1),
            overlap,
        }
    }

    fn split_recursive(&self, text: &str, delimiters: &[&str]) -> Vec<String> {
        if text.len() <= self.max_chunk_size {
            return vec![text.to_string()];
        }

        if delimiters.is_empty() {
            let chars: Vec<char> = text.chars().collect();
            let step = if self.max_chunk_size > self.overlap {
                self.max_chunk_size - self.overlap
            } else {
                self.max_chunk_size
            };
            let mut chunks = Vec::new();
            let mut start = 0;
            while start < chars.len() {
                let end = (start + self.max_chunk_size).min(chars.len());
                chunks.push(chars[start..end].iter().collect());
                if end == chars.len() {
                    break;
                }
                start += step;
            }
            return chunks;
        }

        let delimiter = delimiters[0];
        let parts: Vec<&str> = text.split(delimiter).collect();
        let mut result = Vec::new();
        let mut current = String::new();

        for (i, part) in parts.iter().enumerate() {
            let mut piece = (*part).to_string();
            if i < parts.len() - 1 {
                piece.push_str(delimiter);
            }

            if piece.len() > self.max_chunk_size {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
                result.extend(self.split_recursive(&piece, &delimiters[1..]));
            } else if current.len() + piece.len() <= self.max_chunk_size {
                current.push_str(&piece);
            } else {
                if !current.is_empty() {
                    result.push(current.clone());
                }
                current.clear();
                current.push_str(&piece);
            }
        }

        if !current.is_empty() {
            result.push(current);
        }
        result
    }
}

#[async_trait]
impl Processor<Document<String>> for ChunkerProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        if doc.content.is_empty() {
            return Ok(Vec::new());
        }
        if doc.meta_bool("is_chunk").unwrap_or(false) {
            return Ok(vec![doc.clone()]);
        }

        let raw_chunks = self.split_recursive(&doc.content, &DELIMITERS);

        let mut chunks = Vec::new();
        for (i, text) in raw_chunks.into_iter().enumerate() {
            if text.trim().is_empty() {
                continue;
            }

            let mut chunk = doc.clone();
            chunk.id = format!("{}#chunk{i}", doc.id);
            chunk.parent_id = doc.id.clone();
            chunk.cleaned_content = String::new();
            chunk.set_meta("is_chunk", true);
            chunk.set_meta("chunk_index", i as i64);
            chunk.set_meta("chunk_size", text.len() as i64);
            chunk.content = text;

            chunks.push(chunk);
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SOURCE_WEB;

    fn doc_with(content: &str) -> Document<String> {
        let mut doc: Document<String> = Document::new("https://example.com/page", SOURCE_WEB);
        doc.content = content.to_string();
        doc
    }

    #[tokio::test]
    async fn paragraph_split() {
        let chunker = ChunkerProcessor::new(10, 2);
        let results = chunker
            .process(doc_with("Part 1\n\nPart 2\n\nPart 3"))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "https://example.com/page#chunk0");
        assert_eq!(results[0].parent_id, "https://example.com/page");
        assert_eq!(results[0].meta_bool("is_chunk"), Some(true));
    }

    #[tokio::test]
    async fn existing_chunks_pass_through() {
        let mut doc = doc_with("already a chunk");
        doc.set_meta("is_chunk", true);
        doc.set_meta("chunk_index", 0i64);

        let chunker = ChunkerProcessor::new(20, 5);
        let results = chunker.process(doc).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "already a chunk");
    }

    #[tokio::test]
    async fn empty_content_drops() {
        let chunker = ChunkerProcessor::new(20, 5);
        let results = chunker.process(doc_with("")).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn sentence_delimiters_and_sizes() {
        let chunker = ChunkerProcessor::new(20, 5);
        let results = chunker
            .process(doc_with("This is a sentence. This is another one."))
            .await
            .unwrap();

        assert!(results.len() >= 2, "got {} chunks", results.len());
        assert_eq!(results[0].meta_i64("chunk_index"), Some(0));
        assert_eq!(results[1].meta_i64("chunk_size"), Some(20));
        assert!(results[0].cleaned_content.is_empty());
    }

    #[tokio::test]
    async fn multibyte_content_splits_on_char_boundaries() {
        let chunker = ChunkerProcessor::new(10, 2);
        let results = chunker
            .process(doc_with("こんにちは世界。これはテストです。"))
            .await
            .unwrap();
        assert!(results.len() >= 2);

        // A window never splits inside a code point.
        for chunk in &results {
            assert!(chunk.content.chars().count() <= 10);
        }
    }

    #[tokio::test]
    async fn tiny_multibyte_content_stays_whole() {
        let chunker = ChunkerProcessor::new(10, 0);
        let results = chunker.process(doc_with("a🌍b🌍")).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn chunks_cover_the_original() {
        let chunker = ChunkerProcessor::new(12, 3);
        let original = "alpha beta gamma delta epsilon zeta eta theta";
        let results = chunker.process(doc_with(original)).await.unwrap();

        let concatenated: String = results.iter().map(|c| c.content.as_str()).collect();
        for word in original.split_whitespace() {
            assert!(
                concatenated.contains(word),
                "lost {word:?} from {concatenated:?}"
            );
        }
    }

    #[test]
    fn rune_window_fallback_for_undelimited_text() {
        let chunker = ChunkerProcessor::new(10, 2);
        let chunks = chunker.split_recursive("ThisIsAReallyLongStringWithoutAnyDelimiters", &[]);
        assert!(chunks.len() >= 2);
        // Sliding-window overlap: next chunk starts `size - overlap` in.
        assert!(chunks[0].ends_with(&chunks[1][..2]));
    }
}
