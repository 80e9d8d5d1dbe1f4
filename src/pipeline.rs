//! Linear pipeline runner: one source, a processor chain, one terminal sink.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::flow::{Processor, Sink, Source};

/// Tuning for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of workers draining the source stream.
    pub concurrency: usize,
    /// Label used in logs.
    pub name: String,
}

impl PipelineConfig {
    /// Builds a config, clamping concurrency to at least one worker.
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            name: name.into(),
        }
    }
}

/// Runs a chain of processors between a source and a terminal sink.
///
/// Processor errors drop the current document; a sink write error terminates
/// the worker and the run reports the first such error observed.
pub struct PipelineRunner<T> {
    source: Box<dyn Source<T>>,
    processors: Vec<Arc<dyn Processor<T>>>,
    sink: Arc<dyn Sink<T>>,
    config: PipelineConfig,
}

impl<T: Send + 'static> PipelineRunner<T> {
    /// Creates a runner with an empty processor chain.
    pub fn new(
        source: impl Source<T> + 'static,
        sink: impl Sink<T> + 'static,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source: Box::new(source),
            processors: Vec::new(),
            sink: Arc::new(sink),
            config,
        }
    }

    /// Appends a processor to the chain.
    pub fn add_processor(&mut self, processor: impl Processor<T> + 'static) {
        self.processors.push(Arc::new(processor));
    }

    /// Drains the source to completion or cancellation.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let stream = self
            .source
            .stream(shutdown.clone())
            .await
            .with_context(|| format!("pipeline [{}] source error", self.config.name))?;

        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        for worker_id in 0..self.config.concurrency {
            let stream = stream.clone();
            let processors = self.processors.clone();
            let sink = Arc::clone(&self.sink);
            let shutdown = shutdown.clone();
            let name = self.config.name.clone();

            workers.spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        item = stream.next() => item,
                    };
                    let Some(item) = item else {
                        return Ok(());
                    };

                    let expanded = match process_recursive(&processors, item, 0).await {
                        Ok(items) => items,
                        Err(err) => {
                            warn!(pipeline = %name, worker = worker_id, error = %err, "processor error, dropping document");
                            continue;
                        }
                    };

                    for item in expanded {
                        sink.write(item).await.context("sink write error")?;
                    }
                }
            });
        }

        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    shutdown.cancel();
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(anyhow::anyhow!("worker panicked: {join_err}"));
                    }
                    shutdown.cancel();
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn process_recursive<'a, T: Send + 'static>(
    processors: &'a [Arc<dyn Processor<T>>],
    item: T,
    idx: usize,
) -> BoxFuture<'a, Result<Vec<T>>> {
    Box::pin(async move {
        if idx >= processors.len() {
            return Ok(vec![item]);
        }
        let expanded = processors[idx].process(item).await?;
        let mut results = Vec::new();
        for next in expanded {
            results.extend(process_recursive(processors, next, idx + 1).await?);
        }
        Ok(results)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FnProcessor, ListSource};
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Sink<String> for Arc<RecordingSink> {
        async fn write(&self, item: String) -> Result<()> {
            self.received.lock().unwrap().push(item);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl Sink<String> for FailingSink {
        async fn write(&self, _item: String) -> Result<()> {
            anyhow::bail!("sink down")
        }
    }

    #[tokio::test]
    async fn chain_applies_in_order() {
        let sink = RecordingSink::new();
        let mut runner = PipelineRunner::new(
            ListSource::new(vec!["a".to_string(), "b".to_string()]),
            Arc::clone(&sink),
            PipelineConfig::new("test", 1),
        );
        runner.add_processor(FnProcessor::new(|s: String| async move {
            Ok(vec![format!("{s}-1")])
        }));
        runner.add_processor(FnProcessor::new(|s: String| async move {
            Ok(vec![format!("{s}-2")])
        }));

        runner.run(CancellationToken::new()).await.unwrap();

        let got = sink.received.lock().unwrap().clone();
        assert_eq!(got, vec!["a-1-2".to_string(), "b-1-2".to_string()]);
    }

    #[tokio::test]
    async fn expansion_continues_from_next_processor() {
        let sink = RecordingSink::new();
        let mut runner = PipelineRunner::new(
            ListSource::new(vec!["x".to_string()]),
            Arc::clone(&sink),
            PipelineConfig::new("expand", 1),
        );
        runner.add_processor(FnProcessor::new(|s: String| async move {
            Ok(vec![format!("{s}a"), format!("{s}b")])
        }));
        runner.add_processor(FnProcessor::new(|s: String| async move {
            Ok(vec![format!("{s}!")])
        }));

        runner.run(CancellationToken::new()).await.unwrap();

        let got = sink.received.lock().unwrap().clone();
        assert_eq!(got, vec!["xa!".to_string(), "xb!".to_string()]);
    }

    #[tokio::test]
    async fn processor_error_drops_document_only() {
        let sink = RecordingSink::new();
        let mut runner = PipelineRunner::new(
            ListSource::new(vec!["bad".to_string(), "good".to_string()]),
            Arc::clone(&sink),
            PipelineConfig::new("errors", 1),
        );
        runner.add_processor(FnProcessor::new(|s: String| async move {
            if s == "bad" {
                anyhow::bail!("boom");
            }
            Ok(vec![s])
        }));

        runner.run(CancellationToken::new()).await.unwrap();

        let got = sink.received.lock().unwrap().clone();
        assert_eq!(got, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn sink_error_fails_the_run() {
        let runner = PipelineRunner::new(
            ListSource::new(vec!["a".to_string()]),
            FailingSink,
            PipelineConfig::new("sink-err", 2),
        );
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("sink write error"));
    }

    #[tokio::test]
    async fn concurrent_workers_deliver_everything() {
        let items: Vec<String> = (0..100).map(|i| format!("item-{i}")).collect();
        let sink = RecordingSink::new();
        let runner = PipelineRunner::new(
            ListSource::new(items),
            Arc::clone(&sink),
            PipelineConfig::new("stress", 10),
        );
        runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(sink.received.lock().unwrap().len(), 100);
    }
}
