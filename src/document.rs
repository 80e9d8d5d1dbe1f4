//! The document envelope carried through every pipeline and graph topology.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source tag for documents created by an API trigger.
pub const SOURCE_API_TRIGGER: &str = "api_trigger";
/// Source tag for documents produced by a web fetch.
pub const SOURCE_WEB: &str = "web";
/// Source tag for documents minted by link discovery.
pub const SOURCE_DISCOVERY: &str = "discovery";
/// Source tag for documents read from the local filesystem.
pub const SOURCE_LOCAL_FS: &str = "local_fs";

/// A single metadata value.
///
/// Metadata is schemaless but a handful of shapes cover every key the
/// platform writes. `Vector` keeps dense embeddings as `f32` so a round-trip
/// through the bus does not silently widen them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// Boolean flag (`is_chunk`, `enriched`, ...).
    Bool(bool),
    /// Integer value (`chunk_index`, `http_status`, ...).
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// String value (`title`, `job_id`, ...).
    Str(String),
    /// Dense embedding vector.
    Vector(Vec<f32>),
    /// Heterogeneous list (`keywords`, `questions`).
    List(Vec<MetaValue>),
}

impl MetaValue {
    /// Returns the value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an integer, accepting whole floats.
    ///
    /// JSON decoding may turn an integer written by another worker into a
    /// float; callers that gate on `max_depth` must tolerate both.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(n) => Some(*n),
            MetaValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Returns the value as a bool, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as an embedding vector, if it is one.
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            MetaValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<Vec<f32>> for MetaValue {
    fn from(value: Vec<f32>) -> Self {
        MetaValue::Vector(value)
    }
}

/// Schemaless metadata map attached to every document.
pub type Metadata = HashMap<String, MetaValue>;

struct AckShared {
    fired: AtomicBool,
    ack: Box<dyn Fn() + Send + Sync>,
    nack: Option<Box<dyn Fn(Duration) + Send + Sync>>,
}

/// One-shot acknowledgement handle bound to the originating bus message.
///
/// Clones share the latch, so no matter how many derived documents descend
/// from one message, the underlying ack (or negative-ack) fires at most once.
#[derive(Clone)]
pub struct AckHandle {
    shared: Arc<AckShared>,
}

impl AckHandle {
    /// Builds a handle with an ack arm only.
    pub fn new(ack: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(AckShared {
                fired: AtomicBool::new(false),
                ack: Box::new(ack),
                nack: None,
            }),
        }
    }

    /// Builds a handle with both an ack arm and a delayed negative-ack arm.
    pub fn with_nack(
        ack: impl Fn() + Send + Sync + 'static,
        nack: impl Fn(Duration) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(AckShared {
                fired: AtomicBool::new(false),
                ack: Box::new(ack),
                nack: Some(Box::new(nack)),
            }),
        }
    }

    /// Acknowledges the originating message. Subsequent calls are no-ops.
    pub fn ack(&self) {
        if !self.shared.fired.swap(true, Ordering::AcqRel) {
            (self.shared.ack)();
        }
    }

    /// Negatively acknowledges with a redelivery delay, consuming the latch.
    ///
    /// Returns true when this call won the latch and an arm actually ran.
    pub fn nack(&self, delay: Duration) -> bool {
        if self.shared.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        match &self.shared.nack {
            Some(nack) => nack(delay),
            None => (self.shared.ack)(),
        }
        true
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("fired", &self.shared.fired.load(Ordering::Acquire))
            .finish()
    }
}

/// Envelope flowing through the topology.
///
/// For a fetched page `id` equals the URL; a chunk derived from it gets
/// `<parent>#chunk<n>`. The ack handle never crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de> + Default"))]
pub struct Document<T> {
    /// Globally unique identity of the logical entity.
    pub id: String,
    /// Identity of the parent document; empty unless this is a derived chunk.
    #[serde(default)]
    pub parent_id: String,
    /// Origin tag: `api_trigger`, `web`, `discovery` or `local_fs`.
    #[serde(default)]
    pub source: String,
    /// Raw payload.
    pub content: T,
    /// Normalized payload produced by enrichment.
    #[serde(default)]
    pub cleaned_content: T,
    /// Schemaless per-document metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Ingress timestamp; immutable after creation.
    pub created_at: DateTime<Utc>,
    /// Crawl depth: 0 for seeds, parent + 1 for discovered links.
    #[serde(default)]
    pub depth: u32,
    /// Durable acknowledgement for the originating bus message.
    #[serde(skip)]
    pub ack: Option<AckHandle>,
}

impl<T: Default> Document<T> {
    /// Creates a fresh document with empty payloads.
    pub fn new(id: impl Into<String>, source: &str) -> Self {
        Self {
            id: id.into(),
            parent_id: String::new(),
            source: source.to_string(),
            content: T::default(),
            cleaned_content: T::default(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
            depth: 0,
            ack: None,
        }
    }
}

impl<T> Document<T> {
    /// Acknowledges the originating message, if any. Idempotent.
    pub fn do_ack(&self) {
        if let Some(ack) = &self.ack {
            ack.ack();
        }
    }

    /// Negative-acks the originating message with a redelivery delay, if any.
    pub fn do_nack(&self, delay: Duration) {
        if let Some(ack) = &self.ack {
            ack.nack(delay);
        }
    }

    /// Metadata lookup returning a string slice.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetaValue::as_str)
    }

    /// Metadata lookup returning an integer (whole floats accepted).
    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(MetaValue::as_i64)
    }

    /// Metadata lookup returning a bool.
    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(MetaValue::as_bool)
    }

    /// Inserts a metadata entry.
    pub fn set_meta(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn clone_isolates_metadata() {
        let mut original: Document<String> = Document::new("id-1", SOURCE_WEB);
        original.set_meta("deep", "value");
        original.set_meta("vector", vec![0.1f32, 0.2]);

        let mut clone = original.clone();
        clone.set_meta("deep", "changed");
        if let Some(MetaValue::Vector(v)) = clone.metadata.get_mut("vector") {
            v[0] = 9.9;
        }

        assert_eq!(original.meta_str("deep"), Some("value"));
        let vec = original.metadata["vector"].as_vector().unwrap();
        assert!((vec[0] - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn ack_fires_once_across_clones() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut doc: Document<String> = Document::new("id-1", SOURCE_WEB);
        doc.ack = Some(AckHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let clone_a = doc.clone();
        let clone_b = doc.clone();
        clone_a.do_ack();
        clone_b.do_ack();
        doc.do_ack();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nack_consumes_the_same_latch() {
        let acked = Arc::new(AtomicUsize::new(0));
        let nacked = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&acked);
        let n = Arc::clone(&nacked);
        let handle = AckHandle::with_nack(
            move || {
                a.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                n.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(handle.nack(Duration::from_secs(3)));
        handle.ack();
        assert!(!handle.nack(Duration::from_secs(1)));

        assert_eq!(acked.load(Ordering::SeqCst), 0);
        assert_eq!(nacked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serde_round_trip_drops_ack() {
        let mut doc: Document<String> = Document::new("https://example.com", SOURCE_API_TRIGGER);
        doc.content = "body".to_string();
        doc.set_meta("max_depth", 3i64);
        doc.set_meta("keywords", MetaValue::List(vec!["a".into(), "b".into()]));
        doc.ack = Some(AckHandle::new(|| {}));

        let wire = serde_json::to_string(&doc).unwrap();
        let back: Document<String> = serde_json::from_str(&wire).unwrap();

        assert!(back.ack.is_none());
        assert_eq!(back.id, doc.id);
        assert_eq!(back.meta_i64("max_depth"), Some(3));
        assert!(matches!(back.metadata["keywords"], MetaValue::List(_)));
    }

    #[test]
    fn numeric_wobble_tolerated() {
        let doc: Document<String> =
            serde_json::from_str(r#"{"id":"x","content":"","created_at":"2025-01-01T00:00:00Z","metadata":{"max_depth":5.0}}"#)
                .unwrap();
        assert_eq!(doc.meta_i64("max_depth"), Some(5));
    }
}
