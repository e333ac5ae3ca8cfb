use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use gemledger_core::AggregateId;

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend};

#[derive(Debug, Default)]
struct Streams {
    by_id: HashMap<AggregateId, Vec<StoredEvent>>,
    /// Stream ids in creation order.
    order: Vec<AggregateId>,
}

/// In-memory append-only event store.
///
/// A batch is committed under one write lock: every version check runs before any
/// stream is touched. Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<Streams>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

/// Checks a single stream append is self-consistent; returns its target stream.
fn validate_append(idx: usize, append: &StreamAppend) -> Result<(AggregateId, &str), EventStoreError> {
    let first = append.events.first().ok_or_else(|| {
        EventStoreError::InvalidAppend(format!("batch entry {idx} has no events"))
    })?;
    let aggregate_id = first.aggregate_id;
    let aggregate_type = first.aggregate_type.as_str();

    for (pos, e) in append.events.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch entry {idx} mixes aggregate_ids (index {pos})"
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch entry {idx} mixes aggregate_types (index {pos})"
            )));
        }
    }
    Ok((aggregate_id, aggregate_type))
}

impl EventStore for InMemoryEventStore {
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batch: Vec<StreamAppend> = batch.into_iter().filter(|a| !a.events.is_empty()).collect();
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let mut seen = HashSet::with_capacity(batch.len());
        for (idx, append) in batch.iter().enumerate() {
            let (aggregate_id, _) = validate_append(idx, append)?;
            if !seen.insert(aggregate_id) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream {aggregate_id} appears more than once in the batch"
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // Check every stream before mutating any.
        for (idx, append) in batch.iter().enumerate() {
            let (aggregate_id, aggregate_type) = validate_append(idx, append)?;
            let stream = streams.by_id.get(&aggregate_id).map(Vec::as_slice).unwrap_or(&[]);
            let current = Self::current_version(stream);

            if !append.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {aggregate_id}: expected {:?}, found {current}",
                    append.expected_version
                )));
            }

            if let Some(existing) = stream.first() {
                if existing.aggregate_type != aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing.aggregate_type, aggregate_type
                    )));
                }
            }
        }

        let mut committed = Vec::new();
        for append in batch {
            let Some(aggregate_id) = append.events.first().map(|e| e.aggregate_id) else {
                continue;
            };
            if !streams.by_id.contains_key(&aggregate_id) {
                streams.order.push(aggregate_id);
            }
            let stream = streams.by_id.entry(aggregate_id).or_default();
            let mut next = Self::current_version(stream) + 1;
            for e in append.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.by_id.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn load_by_aggregate_type(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams
            .order
            .iter()
            .filter_map(|id| streams.by_id.get(id))
            .filter(|s| s.first().is_some_and(|e| e.aggregate_type == aggregate_type))
            .flat_map(|s| s.iter().cloned())
            .collect())
    }
}
