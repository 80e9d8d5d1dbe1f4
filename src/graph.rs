//! DAG runner: named processor/sink/hybrid nodes with clone-on-fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::is_retryable;
use crate::flow::{Processor, Sink, Source};

/// Items flowing through a graph must be acknowledgeable on retry paths.
///
/// The runner consults this after a processor error: a retryable error with a
/// positive wait triggers a delayed negative-ack so the bus redelivers later;
/// a permanent error consumes the message so it cannot poison the queue.
pub trait GraphItem: Clone + Send + 'static {
    /// Acknowledges the originating message, if any.
    fn settle_ack(&self) {}
    /// Negative-acks with a redelivery delay, if supported.
    fn settle_nack(&self, _delay: std::time::Duration) {}
}

impl GraphItem for String {}

impl<T: Clone + Send + 'static> GraphItem for crate::document::Document<T> {
    fn settle_ack(&self) {
        self.do_ack();
    }

    fn settle_nack(&self, delay: std::time::Duration) {
        self.do_nack(delay);
    }
}

struct Node<T> {
    name: String,
    processor: Option<Arc<dyn Processor<T>>>,
    sink: Option<Arc<dyn Sink<T>>>,
    downstream: Vec<String>,
}

struct GraphCore<T> {
    name: String,
    nodes: HashMap<String, Node<T>>,
}

/// Directed acyclic topology of named nodes, drained by N workers.
///
/// The entry node must be named `start`. Fan-out always clones: the item type
/// carries the clone capability at construction time, so branches can mutate
/// metadata without racing each other.
pub struct GraphRunner<T> {
    name: String,
    source: Box<dyn Source<T>>,
    nodes: HashMap<String, Node<T>>,
    concurrency: usize,
}

impl<T: GraphItem + Sync> GraphRunner<T> {
    /// Builds an empty graph over the given source.
    pub fn new(name: impl Into<String>, source: impl Source<T> + 'static, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
            nodes: HashMap::new(),
            concurrency: concurrency.max(1),
        }
    }

    fn insert(&mut self, name: &str, node: Node<T>) -> Result<()> {
        if self.nodes.contains_key(name) {
            bail!("node {name} already exists in graph");
        }
        self.nodes.insert(name.to_string(), node);
        Ok(())
    }

    /// Adds a pure processor node.
    pub fn add_processor(&mut self, name: &str, processor: impl Processor<T> + 'static) -> Result<()> {
        self.insert(
            name,
            Node {
                name: name.to_string(),
                processor: Some(Arc::new(processor)),
                sink: None,
                downstream: Vec::new(),
            },
        )
    }

    /// Adds a pure sink node.
    pub fn add_sink(&mut self, name: &str, sink: impl Sink<T> + 'static) -> Result<()> {
        self.insert(
            name,
            Node {
                name: name.to_string(),
                processor: None,
                sink: Some(Arc::new(sink)),
                downstream: Vec::new(),
            },
        )
    }

    /// Adds a hybrid node: processor-then-sink, still forwarding downstream.
    pub fn add_hybrid(
        &mut self,
        name: &str,
        processor: impl Processor<T> + 'static,
        sink: impl Sink<T> + 'static,
    ) -> Result<()> {
        self.insert(
            name,
            Node {
                name: name.to_string(),
                processor: Some(Arc::new(processor)),
                sink: Some(Arc::new(sink)),
                downstream: Vec::new(),
            },
        )
    }

    /// Connects two existing nodes.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.nodes.contains_key(to) {
            bail!("connection failed: node {from} or {to} not found");
        }
        match self.nodes.get_mut(from) {
            Some(node) => {
                node.downstream.push(to.to_string());
                Ok(())
            }
            None => bail!("connection failed: node {from} or {to} not found"),
        }
    }

    /// Runs the topology until the source is exhausted or cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.nodes.contains_key("start") {
            bail!("graph execution error: no 'start' node found");
        }
        self.check_acyclic()?;

        let stream = self
            .source
            .stream(shutdown.clone())
            .await
            .context("source error")?;

        let core = Arc::new(GraphCore {
            name: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(name, node)| {
                    (
                        name.clone(),
                        Node {
                            name: node.name.clone(),
                            processor: node.processor.clone(),
                            sink: node.sink.clone(),
                            downstream: node.downstream.clone(),
                        },
                    )
                })
                .collect(),
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency {
            let stream = stream.clone();
            let core = Arc::clone(&core);
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        item = stream.next() => item,
                    };
                    let Some(item) = item else { return };
                    execute(Arc::clone(&core), "start".to_string(), item, shutdown.clone()).await;
                }
            });
        }

        while workers.join_next().await.is_some() {}
        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();
        for name in self.nodes.keys() {
            self.visit(name, &mut state)?;
        }
        Ok(())
    }

    fn visit<'a>(&'a self, name: &'a str, state: &mut HashMap<&'a str, u8>) -> Result<()> {
        match state.get(name) {
            Some(1) => bail!("graph contains a cycle through node {name}"),
            Some(2) => return Ok(()),
            _ => {}
        }
        state.insert(name, 1);
        if let Some(node) = self.nodes.get(name) {
            for next in &node.downstream {
                self.visit(next, state)?;
            }
        }
        state.insert(name, 2);
        Ok(())
    }
}

fn execute<T: GraphItem + Sync>(
    core: Arc<GraphCore<T>>,
    node_name: String,
    item: T,
    shutdown: CancellationToken,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if shutdown.is_cancelled() {
            return;
        }
        let Some(node) = core.nodes.get(&node_name) else {
            return;
        };

        let mut current = vec![item];

        if let Some(processor) = &node.processor {
            let input = current.remove(0);
            let settle = input.clone();
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = processor.process(input) => result,
            };
            match result {
                Ok(items) => current = items,
                Err(err) => {
                    warn!(graph = %core.name, node = %node.name, error = %err, "processor failure");
                    let (retryable, wait) = is_retryable(&err);
                    if !retryable {
                        settle.settle_ack();
                    } else if wait > std::time::Duration::ZERO {
                        settle.settle_nack(wait);
                    }
                    return;
                }
            }
        }

        if let Some(sink) = &node.sink {
            for item in &current {
                if let Err(err) = sink.write(item.clone()).await {
                    warn!(graph = %core.name, node = %node.name, error = %err, "sink error");
                }
            }
        }

        for item in current {
            match node.downstream.len() {
                0 => {}
                1 => {
                    execute(
                        Arc::clone(&core),
                        node.downstream[0].clone(),
                        item,
                        shutdown.clone(),
                    )
                    .await;
                }
                _ => {
                    let mut branches = JoinSet::new();
                    for next in &node.downstream {
                        branches.spawn(execute(
                            Arc::clone(&core),
                            next.clone(),
                            item.clone(),
                            shutdown.clone(),
                        ));
                    }
                    while branches.join_next().await.is_some() {}
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, MetaValue, SOURCE_WEB};
    use crate::flow::{FnProcessor, ListSource};
    use std::sync::Mutex;

    struct CollectingSink<T> {
        received: Mutex<Vec<T>>,
    }

    impl<T> CollectingSink<T> {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl<T: Send + 'static> Sink<T> for Arc<CollectingSink<T>> {
        async fn write(&self, item: T) -> Result<()> {
            self.received.lock().unwrap().push(item);
            Ok(())
        }
    }

    struct ErrSink;

    #[async_trait::async_trait]
    impl Sink<String> for ErrSink {
        async fn write(&self, _item: String) -> Result<()> {
            anyhow::bail!("sink fail")
        }
    }

    fn suffixer(suffix: &'static str) -> impl Processor<String> {
        FnProcessor::new(move |s: String| async move { Ok(vec![format!("{s}{suffix}")]) })
    }

    #[tokio::test]
    async fn duplicate_node_rejected() {
        let mut runner = GraphRunner::new("dup", ListSource::new(vec!["x".to_string()]), 1);
        runner.add_processor("node1", suffixer("-a")).unwrap();
        assert!(runner.add_processor("node1", suffixer("-b")).is_err());
    }

    #[tokio::test]
    async fn connect_requires_both_nodes() {
        let mut runner = GraphRunner::new("missing", ListSource::new(vec!["x".to_string()]), 1);
        assert!(runner.connect("missing", "target").is_err());
    }

    #[tokio::test]
    async fn run_requires_start_node() {
        let mut runner = GraphRunner::new("no-start", ListSource::new(vec!["x".to_string()]), 1);
        runner.add_processor("other", suffixer("-a")).unwrap();
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no 'start' node"));
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let mut runner = GraphRunner::new("cycle", ListSource::new(vec!["x".to_string()]), 1);
        runner.add_processor("start", suffixer("-a")).unwrap();
        runner.add_processor("loop", suffixer("-b")).unwrap();
        runner.connect("start", "loop").unwrap();
        runner.connect("loop", "start").unwrap();
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn chain_executes_in_topological_order() {
        let sink = CollectingSink::new();
        let mut runner = GraphRunner::new(
            "flow",
            ListSource::new(vec!["a".to_string(), "b".to_string()]),
            1,
        );
        runner.add_processor("start", suffixer("-1")).unwrap();
        runner.add_processor("p2", suffixer("-2")).unwrap();
        runner.add_sink("end", Arc::clone(&sink)).unwrap();
        runner.connect("start", "p2").unwrap();
        runner.connect("p2", "end").unwrap();

        runner.run(CancellationToken::new()).await.unwrap();

        let got = sink.received.lock().unwrap().clone();
        assert_eq!(got, vec!["a-1-2".to_string(), "b-1-2".to_string()]);
    }

    #[tokio::test]
    async fn hybrid_node_writes_and_forwards() {
        let intermediate = CollectingSink::new();
        let terminal = CollectingSink::new();
        let mut runner = GraphRunner::new("hybrid", ListSource::new(vec!["input".to_string()]), 1);
        runner
            .add_hybrid("start", suffixer("-proc"), Arc::clone(&intermediate))
            .unwrap();
        runner.add_sink("end", Arc::clone(&terminal)).unwrap();
        runner.connect("start", "end").unwrap();

        runner.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            intermediate.received.lock().unwrap().clone(),
            vec!["input-proc".to_string()]
        );
        assert_eq!(
            terminal.received.lock().unwrap().clone(),
            vec!["input-proc".to_string()]
        );
    }

    #[tokio::test]
    async fn processor_and_sink_errors_are_not_fatal() {
        let mut runner = GraphRunner::new("proc-err", ListSource::new(vec!["input".to_string()]), 1);
        runner
            .add_processor(
                "start",
                FnProcessor::new(|_: String| async move { anyhow::bail!("proc fail") }),
            )
            .unwrap();
        runner.run(CancellationToken::new()).await.unwrap();

        let mut runner = GraphRunner::new("sink-err", ListSource::new(vec!["input".to_string()]), 1);
        runner.add_sink("start", ErrSink).unwrap();
        runner.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_run_loses_nothing() {
        let items: Vec<String> = (0..100).map(|i| format!("item-{i}")).collect();
        let sink = CollectingSink::new();
        let mut runner = GraphRunner::new("stress", ListSource::new(items), 10);
        runner.add_processor("start", suffixer("")).unwrap();
        runner.add_sink("end", Arc::clone(&sink)).unwrap();
        runner.connect("start", "end").unwrap();

        runner.run(CancellationToken::new()).await.unwrap();
        assert_eq!(sink.received.lock().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn fan_out_acks_at_most_once_per_message() {
        use crate::document::AckHandle;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct AckingSink;

        #[async_trait::async_trait]
        impl Sink<Document<String>> for AckingSink {
            async fn write(&self, item: Document<String>) -> Result<()> {
                item.do_ack();
                Ok(())
            }
        }

        let acks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acks);
        let mut seed: Document<String> = Document::new("doc1", SOURCE_WEB);
        seed.ack = Some(AckHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut runner = GraphRunner::new("ack-once", ListSource::new(vec![seed]), 1);
        runner
            .add_processor(
                "start",
                FnProcessor::new(|d: Document<String>| async move { Ok(vec![d.clone(), d]) }),
            )
            .unwrap();
        runner.add_sink("s1", AckingSink).unwrap();
        runner.add_sink("s2", AckingSink).unwrap();
        runner.connect("start", "s1").unwrap();
        runner.connect("start", "s2").unwrap();

        runner.run(CancellationToken::new()).await.unwrap();

        // Two expanded documents, two fan-out branches, four sink writes:
        // still exactly one ack for the originating message.
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fan_out_branches_receive_independent_clones() {
        let mut seed: Document<String> = Document::new("doc1", SOURCE_WEB);
        seed.set_meta("shared", "original");

        let sink1 = CollectingSink::<Document<String>>::new();
        let sink2 = CollectingSink::<Document<String>>::new();

        let mut runner = GraphRunner::new("clone", ListSource::new(vec![seed]), 1);
        runner
            .add_processor(
                "start",
                FnProcessor::new(|d: Document<String>| async move { Ok(vec![d]) }),
            )
            .unwrap();
        runner.add_sink("s1", Arc::clone(&sink1)).unwrap();
        runner.add_sink("s2", Arc::clone(&sink2)).unwrap();
        runner.connect("start", "s1").unwrap();
        runner.connect("start", "s2").unwrap();

        runner.run(CancellationToken::new()).await.unwrap();

        let mut received1 = sink1.received.lock().unwrap();
        let received2 = sink2.received.lock().unwrap();
        assert_eq!(received1.len(), 1);
        assert_eq!(received2.len(), 1);

        received1[0]
            .metadata
            .insert("shared".to_string(), MetaValue::Str("mutated".to_string()));
        assert_eq!(received2[0].meta_str("shared"), Some("original"));
    }
}
