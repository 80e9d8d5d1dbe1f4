//! Core dataflow abstractions: sources, processors, sinks and the shared
//! stream handle that worker pools drain.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::document::Document;

/// Multi-consumer handle over a source's output channel.
///
/// Mirrors the competing-consumer semantics of a work queue: each item is
/// observed by exactly one of the workers pulling from the handle.
pub struct SharedStream<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> SharedStream<T> {
    /// Builds a bounded channel pair; the receiver side is shareable.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Pulls the next item, or `None` once the channel is closed and drained.
    pub async fn next(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

/// Produces a lazy stream of items until exhaustion or cancellation.
///
/// A source is restartable only by constructing a new instance.
#[async_trait]
pub trait Source<T>: Send + Sync {
    /// Opens the stream. Implementations must observe `shutdown` promptly.
    async fn stream(&self, shutdown: CancellationToken) -> Result<SharedStream<T>>;
}

/// Pure transformation: one item in, zero or more items out.
///
/// Returning an empty vec drops the item; returning several expands it.
/// Implementations must be safe to invoke concurrently on distinct items.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    /// Transforms a single item.
    async fn process(&self, item: T) -> Result<Vec<T>>;
}

/// Terminal consumer. May buffer; `close` must flush.
#[async_trait]
pub trait Sink<T>: Send + Sync {
    /// Writes one item.
    async fn write(&self, item: T) -> Result<()>;

    /// Flushes buffered state. The runner never writes after close.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapts a closure into a [`Processor`].
pub struct FnProcessor<T, F> {
    f: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, F> FnProcessor<T, F> {
    /// Wraps the closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for FnProcessor<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>>> + Send,
{
    async fn process(&self, item: T) -> Result<Vec<T>> {
        (self.f)(item).await
    }
}

/// Forwards items unchanged while copying each onto a side sink.
///
/// Used to hand documents off to another bus subject mid-topology; a side
/// write failure is logged, never fatal to the main path.
pub struct TeeProcessor<T> {
    side: Arc<dyn Sink<T>>,
}

impl<T> TeeProcessor<T> {
    /// Builds a tee over the side sink.
    pub fn new(side: Arc<dyn Sink<T>>) -> Self {
        Self { side }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Processor<T> for TeeProcessor<T> {
    async fn process(&self, item: T) -> Result<Vec<T>> {
        if let Err(err) = self.side.write(item.clone()).await {
            tracing::warn!(error = %err, "side sink write failed");
        }
        Ok(vec![item])
    }
}

/// Source that emits one fixed seed document and closes.
pub struct SeedSource {
    seed: Document<String>,
}

impl SeedSource {
    /// Builds a source around the given seed.
    pub fn new(seed: Document<String>) -> Self {
        Self { seed }
    }
}

#[async_trait]
impl Source<Document<String>> for SeedSource {
    async fn stream(&self, shutdown: CancellationToken) -> Result<SharedStream<Document<String>>> {
        let (tx, stream) = SharedStream::channel(1);
        let seed = self.seed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tx.send(seed) => {}
            }
        });
        Ok(stream)
    }
}

/// Source that drains a fixed list of documents, then closes.
///
/// Backs the `local_fs` ingestion path and most tests.
pub struct ListSource<T> {
    items: Mutex<Vec<T>>,
}

impl<T> ListSource<T> {
    /// Builds a source over the given items.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Source<T> for ListSource<T> {
    async fn stream(&self, shutdown: CancellationToken) -> Result<SharedStream<T>> {
        let items: Vec<T> = self.items.lock().await.drain(..).collect();
        let (tx, stream) = SharedStream::channel(items.len().max(1));
        tokio::spawn(async move {
            for item in items {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    res = tx.send(item) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SOURCE_WEB;

    #[tokio::test]
    async fn seed_source_emits_once() {
        let seed: Document<String> = Document::new("https://seed.test", SOURCE_WEB);
        let source = SeedSource::new(seed);
        let stream = source.stream(CancellationToken::new()).await.unwrap();

        let first = stream.next().await.expect("seed emitted");
        assert_eq!(first.id, "https://seed.test");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn list_source_drains_in_order() {
        let source = ListSource::new(vec![1u32, 2, 3]);
        let stream = source.stream(CancellationToken::new()).await.unwrap();
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, Some(3));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn fn_processor_expands() {
        let double = FnProcessor::new(|n: u32| async move { Ok(vec![n, n]) });
        let out = double.process(7).await.unwrap();
        assert_eq!(out, vec![7, 7]);
    }
}
