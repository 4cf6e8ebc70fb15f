use std::sync::Mutex;

use async_trait::async_trait;
use pipeline::{
    ExchangeName, InfrastructureError, MessagePublisher, PipelineDefinition, RoutingKey,
};
use serde_json::{json, Value};

pub fn definition_json() -> Value {
    json!({
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
                "routing_key": "index.chunker", "bucket_name": "chunks", "object_name": "chunks.json"
            },
            "extractor": {
                "handler": "extractor", "last": true,
                "routing_key": "build.extractor", "bucket_name": "graph", "object_name": "graph.json"
            }
        },
        "exchange_name": "index",
        "backlog_queue_name": "backlog",
        "builder_queue_name": "builder"
    })
}

pub fn definition() -> PipelineDefinition {
    serde_json::from_value(definition_json()).unwrap()
}

/// Captures publishes; fails every call when `fail` is set.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub fail: bool,
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        body: Vec<u8>,
    ) -> Result<(), InfrastructureError> {
        if self.fail {
            return Err(InfrastructureError::Bus("bus unreachable".into()));
        }
        self.published.lock().unwrap().push((
            exchange.to_string(),
            routing_key.to_string(),
            body,
        ));
        Ok(())
    }
}
