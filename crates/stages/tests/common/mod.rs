use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::{BrokerSettings, MemoryTransport, MessageBroker};
use pipeline::{
    DeliveryHandler, HandlerRegistry, InfrastructureError, PipelineDefinition, ResourceLocator,
    StatusPoller, TaskCreate, TaskId, TaskProgressReport, TaskStatus, TaskStatusRecord,
    TaskStatusStore, TaskUpdate,
};
use serde_json::json;
use stages::{
    build_registry, BuilderProcessor, CorpusSource, GraphBuilder, HandlerDeps, Processor,
    TaskSubmitter,
};
use storage::{MemoryBlobStore, MemoryGraphStore};
use tasks::MemoryTaskStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn definition() -> PipelineDefinition {
    serde_json::from_value(json!({
        "pipeline": {
            "crawler": {
                "handler": "crawler", "first": true, "next_task_name": "parser",
                "routing_key": "index.crawler", "bucket_name": "raw", "object_name": "raw.json"
            },
            "parser": {
                "handler": "parser", "next_task_name": "chunker",
                "routing_key": "index.parser", "bucket_name": "parsed", "object_name": "parsed.txt",
                "args": {"separator": "\n\n"}
            },
            "chunker": {
                "handler": "chunker", "next_task_name": "extractor",
                "routing_key": "index.chunker", "bucket_name": "chunks", "object_name": "chunks.json",
                "args": {"separator": "\n\n"}
            },
            "extractor": {
                "handler": "extractor", "last": true,
                "routing_key": "build.extractor", "bucket_name": "graph", "object_name": "graph.json"
            }
        },
        "exchange_name": "index",
        "backlog_queue_name": "backlog",
        "builder_queue_name": "builder"
    }))
    .unwrap()
}

pub fn corpus() -> CorpusSource {
    let docs = json!([
        {
            "title": "Graph Attention Networks",
            "authors": ["Petar Velickovic", "Yoshua Bengio"],
            "summary": "We present GAT, a graph neural network. It was introduced in 2018.",
            "url": "http://arxiv.org/abs/1710.10903"
        },
        {
            "title": "Inductive Representation Learning on Large Graphs",
            "authors": ["William Hamilton"],
            "summary": "GraphSAGE samples neighbourhoods at Stanford.",
            "published": "2017-06-07"
        }
    ]);
    CorpusSource::new("arxiv", serde_json::from_value(docs).unwrap())
}

/// Delays every `IN_PROGRESS` update, widening the window in which a later
/// stage can race the worker for the same record.
pub struct SlowProgressStore {
    inner: Arc<MemoryTaskStore>,
    delay: Duration,
}

#[async_trait]
impl TaskStatusStore for SlowProgressStore {
    async fn create(&self, task: TaskCreate) -> Result<(), InfrastructureError> {
        self.inner.create(task).await
    }

    async fn update(&self, update: TaskUpdate) -> Result<(), InfrastructureError> {
        if update.status == Some(TaskStatus::InProgress) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.update(update).await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>, InfrastructureError> {
        self.inner.get(task_id).await
    }
}

/// A worker and a builder running over one in-process bus.
pub struct Pipeline {
    pub transport: MemoryTransport,
    pub blobs: Arc<MemoryBlobStore>,
    pub graph: Arc<MemoryGraphStore>,
    pub tasks: Arc<MemoryTaskStore>,
    pub submitter: TaskSubmitter,
    pub poller: StatusPoller,
    stop: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start() -> Self {
        Self::with_progress_delay(Duration::ZERO).await
    }

    /// Starts the pipeline with every `IN_PROGRESS` status write delayed.
    pub async fn with_progress_delay(delay: Duration) -> Self {
        let definition = Arc::new(definition());
        let transport = MemoryTransport::new();
        let broker = MessageBroker::new(Arc::new(transport.clone()), BrokerSettings::default()).unwrap();
        for route in definition.routes() {
            broker
                .bind(&route.exchange, &route.queue, &route.routing_key)
                .await
                .unwrap();
        }

        let blobs = Arc::new(MemoryBlobStore::new());
        let graph = Arc::new(MemoryGraphStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let status: Arc<dyn TaskStatusStore> = Arc::new(SlowProgressStore {
            inner: tasks.clone(),
            delay,
        });
        let publisher = Arc::new(broker.clone());

        let registry: HandlerRegistry =
            build_registry(&definition, &HandlerDeps::new(blobs.clone(), Arc::new(corpus())))
                .unwrap();
        let worker: Arc<dyn DeliveryHandler> = Arc::new(Processor::new(
            definition.clone(),
            Arc::new(registry),
            blobs.clone(),
            status.clone(),
            publisher.clone(),
        ));
        let builder: Arc<dyn DeliveryHandler> = Arc::new(BuilderProcessor::new(
            GraphBuilder::new(blobs.clone(), graph.clone()),
            status,
        ));

        let (stop, shutdown) = watch::channel(false);
        let mut loops = Vec::new();
        for (queue, handler) in [
            (definition.backlog_queue_name().clone(), worker),
            (definition.builder_queue_name().clone(), builder),
        ] {
            let broker = broker.clone();
            let shutdown = shutdown.clone();
            loops.push(tokio::spawn(async move {
                broker.subscribe(&queue, handler, shutdown).await.unwrap();
            }));
        }

        Self {
            transport,
            blobs,
            graph,
            submitter: TaskSubmitter::new(definition.clone(), tasks.clone(), publisher),
            poller: StatusPoller::new(tasks.clone(), definition),
            tasks,
            stop,
            loops,
        }
    }

    pub async fn submit(&self, locator: &str) -> TaskId {
        let locator: ResourceLocator = locator.parse().unwrap();
        self.submitter
            .submit("arxiv", locator, Default::default())
            .await
            .unwrap()
    }

    /// Polls until the task reaches `COMPLETED` or `FAILED`.
    pub async fn settle(&self, task_id: &TaskId) -> TaskProgressReport {
        for _ in 0..500 {
            if let Some(report) = self.poller.poll(task_id).await.unwrap() {
                if matches!(report.status, TaskStatus::Completed | TaskStatus::Failed) {
                    return report;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not settle");
    }

    pub async fn shutdown(self) {
        self.stop.send(true).unwrap();
        for handle in self.loops {
            handle.await.unwrap();
        }
    }
}
