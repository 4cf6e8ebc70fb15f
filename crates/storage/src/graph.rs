use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pipeline::{ChunkNode, EntityNode, GraphStore, InfrastructureError};
use tracing::info;

#[derive(Debug, Default)]
struct Graph {
    indexed: bool,
    /// `(id, text)`
    chunks: BTreeSet<(String, String)>,
    /// `(name, type, description)`
    entities: BTreeSet<(String, String, String)>,
    /// `(chunk id, entity name)`
    contains: BTreeSet<(String, String)>,
}

/// Graph store with `MERGE` semantics: writing the same node or relationship
/// twice leaves a single copy.
///
/// Chunks are keyed by id and text, entities by name, type and description;
/// a `CONTAINS` link joins every chunk with the given id to every entity with
/// the given name.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: Mutex<Graph>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_indexed(&self) -> bool {
        self.lock().indexed
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.lock().contains.len()
    }

    pub fn contains(&self, chunk_id: &str, entity_name: &str) -> bool {
        self.lock()
            .contains
            .contains(&(chunk_id.to_string(), entity_name.to_string()))
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ensure_indexes(&self) -> Result<(), InfrastructureError> {
        let mut graph = self.lock();
        if !graph.indexed {
            graph.indexed = true;
            info!("Created graph indexes");
        }
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[ChunkNode]) -> Result<u64, InfrastructureError> {
        let mut graph = self.lock();
        for chunk in chunks {
            graph.chunks.insert((chunk.id.clone(), chunk.text.clone()));
        }
        Ok(chunks.len() as u64)
    }

    async fn upsert_entities(&self, entities: &[EntityNode]) -> Result<u64, InfrastructureError> {
        let mut graph = self.lock();
        for entity in entities {
            graph.entities.insert((
                entity.name.clone(),
                entity.entity_type.clone(),
                entity.description.clone(),
            ));
        }
        Ok(entities.len() as u64)
    }

    async fn link_entities(&self, entities: &[EntityNode]) -> Result<u64, InfrastructureError> {
        let mut graph = self.lock();
        let mut matched = 0u64;
        let mut links = Vec::new();
        for entity in entities {
            let chunk_ids: Vec<&String> = graph
                .chunks
                .iter()
                .filter(|(id, _)| *id == entity.chunk_id)
                .map(|(id, _)| id)
                .collect();
            let named = graph
                .entities
                .iter()
                .filter(|(name, _, _)| *name == entity.name)
                .count();
            for chunk_id in chunk_ids {
                matched += named as u64;
                if named > 0 {
                    links.push((chunk_id.clone(), entity.name.clone()));
                }
            }
        }
        graph.contains.extend(links);
        Ok(matched)
    }
}
