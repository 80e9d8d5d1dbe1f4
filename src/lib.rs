#![warn(missing_docs)]
//! Distributed web-crawl and content-ingestion platform.
//!
//! Two subsystems carry the weight: a typed in-process dataflow engine
//! (sources, processors and sinks composed into pipelines or DAGs) and the
//! politeness front-end that decides whether a URL may be fetched now, later
//! or never. Everything else: fetching, chunking, enrichment, model-assisted
//! metadata, relational persistence and vector indexing, hangs off those two.

pub mod api;
pub mod bus;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod crawl;
pub mod discovery;
pub mod document;
pub mod embedding;
pub mod engine;
pub mod enrich;
pub mod errors;
pub mod flow;
pub mod graph;
pub mod llm;
pub mod metadata;
pub mod netutil;
pub mod pipeline;
pub mod politeness;
pub mod postgres;
pub mod qdrant;
pub mod robots;
pub mod scheduler;
pub mod search;
pub mod security;

pub use document::{AckHandle, Document, MetaValue, Metadata};
pub use errors::{is_retryable, CrawlError};
pub use flow::{FnProcessor, Processor, SharedStream, Sink, Source};
pub use graph::GraphRunner;
pub use pipeline::{PipelineConfig, PipelineRunner};
