//! Wires adapters into the worker and builder loops and runs them until a
//! shutdown signal arrives.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use broker::{BrokerError, MemoryTransport, MessageBroker, SubscriptionStats};
use control::ControlClient;
use pipeline::{
    BlobStore, DeliveryHandler, Metadata, PipelineDefinition, QueueName, ResourceLocator,
    StatusPoller, TaskId, TaskProgressReport, TaskStatus, TaskStatusStore,
};
use stages::handlers::WEB_SCHEME;
use stages::{
    build_registry, BuilderProcessor, CorpusSource, GraphBuilder, HandlerDeps, Processor,
    TaskSubmitter,
};
use storage::{FsBlobStore, MemoryBlobStore, MemoryGraphStore};
use tasks::{MemoryTaskStore, PostgresTaskStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::settings::{DefinitionSource, Settings, Submission};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

type Subscription = JoinHandle<Result<SubscriptionStats, BrokerError>>;

/// Loads and validates a definition file.
pub async fn read_definition(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading pipeline definition {}", path.display()))?;
    control::parse_definition(&raw).with_context(|| format!("validating {}", path.display()))
}

async fn load_definition(source: &DefinitionSource) -> anyhow::Result<PipelineDefinition> {
    match source {
        DefinitionSource::File(path) => read_definition(path).await,
        DefinitionSource::Control { base_url, policy } => {
            let client = ControlClient::new(base_url, *policy)?;
            Ok(client.fetch_pipeline().await?)
        }
    }
}

async fn status_store(settings: &Settings) -> anyhow::Result<Arc<dyn TaskStatusStore>> {
    match &settings.database_url {
        Some(url) => {
            let store = PostgresTaskStore::connect(url, settings.database_max_connections)
                .await
                .context("connecting to the task status database")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database configured; task status is kept in memory");
            Ok(Arc::new(MemoryTaskStore::new()))
        }
    }
}

fn blob_store(settings: &Settings) -> Arc<dyn BlobStore> {
    match &settings.blob_dir {
        Some(root) => Arc::new(FsBlobStore::new(root)),
        None => {
            warn!("no blob directory configured; payloads are kept in memory");
            Arc::new(MemoryBlobStore::new())
        }
    }
}

async fn corpus(settings: &Settings) -> anyhow::Result<CorpusSource> {
    match &settings.corpus_file {
        Some(path) => {
            let corpus = CorpusSource::from_file(settings.source.as_str(), path).await?;
            info!(source = %settings.source, documents = corpus.len(), "corpus loaded");
            Ok(corpus)
        }
        None => Ok(CorpusSource::new(settings.source.as_str(), Vec::new())),
    }
}

/// Runs the worker and builder loops over one in-process broker.
///
/// Start-up failures (definition, adapters, bindings, handler table) are
/// returned as errors; after that the loops only stop on `shutdown` or, with
/// a waiting submission, once that task settles.
pub async fn run(settings: Settings, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let definition = Arc::new(load_definition(&settings.definition).await?);
    info!(
        stages = definition.ordered_stages().len(),
        exchange = %definition.exchange_name(),
        "pipeline definition loaded"
    );

    let blobs = blob_store(&settings);
    let tasks = status_store(&settings).await?;
    let graph = Arc::new(MemoryGraphStore::new());
    let broker = MessageBroker::new(Arc::new(MemoryTransport::new()), settings.broker)
        .context("building the bus pools")?;

    for route in definition.routes() {
        broker
            .bind(&route.exchange, &route.queue, &route.routing_key)
            .await
            .with_context(|| {
                format!(
                    "binding {} to {} on {}",
                    route.routing_key, route.queue, route.exchange
                )
            })?;
    }
    // The builder may start before any stage routes to it.
    broker
        .declare_queue(definition.builder_queue_name())
        .await
        .context("declaring the builder queue")?;

    let deps = HandlerDeps::new(blobs.clone(), Arc::new(corpus(&settings).await?))
        .with_blob_scheme(settings.blob_scheme.as_str());
    let registry = build_registry(&definition, &deps)?;
    info!(handlers = registry.len(), "handler registry built");

    let publisher = Arc::new(broker.clone());
    let worker: Arc<dyn DeliveryHandler> = Arc::new(Processor::new(
        definition.clone(),
        Arc::new(registry),
        blobs.clone(),
        tasks.clone(),
        publisher.clone(),
    ));
    let builder: Arc<dyn DeliveryHandler> = Arc::new(BuilderProcessor::new(
        GraphBuilder::new(blobs, graph).with_blob_scheme(settings.blob_scheme.as_str()),
        tasks.clone(),
    ));

    let (stop, loop_shutdown) = watch::channel(false);
    let subscriptions = vec![
        spawn_loop(&broker, definition.backlog_queue_name(), worker, &loop_shutdown),
        spawn_loop(&broker, definition.builder_queue_name(), builder, &loop_shutdown),
    ];

    let submitter = TaskSubmitter::new(definition.clone(), tasks.clone(), publisher);
    let poller = StatusPoller::new(tasks, definition);
    let outcome = drive(&settings, &submitter, &poller, shutdown).await;

    let _ = stop.send(true);
    for subscription in subscriptions {
        match subscription.await {
            Ok(Ok(stats)) => info!(acked = stats.acked, rejected = stats.rejected, "loop finished"),
            Ok(Err(error)) => warn!(%error, "loop ended with a broker error"),
            Err(error) => warn!(%error, "loop task aborted"),
        }
    }
    outcome
}

fn spawn_loop(
    broker: &MessageBroker,
    queue: &QueueName,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: &watch::Receiver<bool>,
) -> Subscription {
    let broker = broker.clone();
    let queue = queue.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move { broker.subscribe(&queue, handler, shutdown).await })
}

/// Submits the configured crawl, if any, then waits for shutdown or for the
/// task to settle.
async fn drive(
    settings: &Settings,
    submitter: &TaskSubmitter,
    poller: &StatusPoller,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let Some(submission) = &settings.submission else {
        wait_for(&mut shutdown).await;
        return Ok(());
    };

    let locator = crawl_locator(&settings.source, submission)?;
    let task_id = submitter
        .submit(&submission.department, locator, Metadata::new())
        .await
        .context("submitting crawl task")?;
    info!(task_id = %task_id, query = %submission.query, "task submitted");

    if !submission.wait {
        wait_for(&mut shutdown).await;
        return Ok(());
    }

    tokio::select! {
        report = settle(poller, &task_id, submission.settle_timeout) => {
            let report = report?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status == TaskStatus::Failed {
                anyhow::bail!("task {task_id} failed at {}", report.phase);
            }
            Ok(())
        }
        () = wait_for(&mut shutdown) => Ok(()),
    }
}

fn crawl_locator(source: &str, submission: &Submission) -> anyhow::Result<ResourceLocator> {
    let limit = submission.limit.to_string();
    Ok(ResourceLocator::with_query(
        WEB_SCHEME,
        source,
        [("query", submission.query.as_str()), ("limit", limit.as_str())],
    )?)
}

/// Polls until the task is `COMPLETED` or `FAILED`. A builder failure leaves
/// the task `IN_PROGRESS`, so the wait is bounded by `timeout`.
async fn settle(
    poller: &StatusPoller,
    task_id: &TaskId,
    timeout: Duration,
) -> anyhow::Result<TaskProgressReport> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let report = poller.poll(task_id).await?;
        if let Some(report) = &report {
            if matches!(report.status, TaskStatus::Completed | TaskStatus::Failed) {
                return Ok(report.clone());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            let last = report.map_or_else(
                || "no status record".to_owned(),
                |r| format!("{} at {}", r.status, r.phase),
            );
            anyhow::bail!("task {task_id} did not settle within {timeout:?}; last seen {last}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a shutdown request.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
