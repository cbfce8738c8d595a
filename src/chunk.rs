//! Chunk model and in-memory registry.
//!
//! A chunk is the unit of scheduling: an ordered, deduplicated slice of
//! addresses plus its lifecycle bookkeeping. Chunks are created by import
//! or split, live in the [`ChunkStore`] for the lifetime of the process,
//! and move through a small state machine:
//!
//! ```text
//! QUEUED ──► RUNNING ──► COMPLETED | FAILED | KILLED
//!    │                                  │
//!    └────────► KILLED (kill/split)     └──► QUEUED (requeue)
//! ```
//!
//! Terminal states are absorbing except for requeue, which clears the
//! timestamps, resets progress and bumps the attempt counter. All
//! mutations go through the store so the transition rules and timestamp
//! stamping cannot be bypassed.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ControlError;
use crate::events::now_ms;

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Killed
        )
    }

    fn allows(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Killed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Killed)
                | (Completed, Queued)
                | (Failed, Queued)
                | (Killed, Queued)
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkStatus::Queued => "queued",
            ChunkStatus::Running => "running",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// A scheduled unit of scanning work.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: Uuid,
    pub targets: Vec<String>,
    pub status: ChunkStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub progress_completed: usize,
    pub progress_total: usize,
    pub last_heartbeat: u64,
    pub parent_id: Option<Uuid>,
    pub attempt: u32,
    /// Creation order, the tie-breaker for equal `created_at` stamps.
    #[serde(skip)]
    seq: u64,
}

/// In-memory chunk registry with a parent-to-children back index.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: HashMap<Uuid, Chunk>,
    children: HashMap<Uuid, Vec<Uuid>>,
    next_seq: u64,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new chunk in QUEUED state.
    pub fn create(&mut self, targets: Vec<String>, parent_id: Option<Uuid>, attempt: u32) -> Chunk {
        let now = now_ms();
        let chunk = Chunk {
            id: Uuid::new_v4(),
            progress_total: targets.len(),
            targets,
            status: ChunkStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress_completed: 0,
            last_heartbeat: now,
            parent_id,
            attempt,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        if let Some(parent) = parent_id {
            self.children.entry(parent).or_default().push(chunk.id);
        }
        self.chunks.insert(chunk.id, chunk.clone());
        chunk
    }

    pub fn get(&self, id: Uuid) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn status_of(&self, id: Uuid) -> Option<ChunkStatus> {
        self.chunks.get(&id).map(|c| c.status)
    }

    pub fn children_of(&self, id: Uuid) -> Vec<Uuid> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.values().filter(|c| c.status == status).count()
    }

    /// Applies a status transition, enforcing the state machine and
    /// stamping the matching timestamp. The `from` state acts as a
    /// compare-and-set guard against concurrent control operations.
    pub fn transition(
        &mut self,
        id: Uuid,
        from: ChunkStatus,
        to: ChunkStatus,
    ) -> Result<&Chunk, ControlError> {
        let chunk = self
            .chunks
            .get_mut(&id)
            .ok_or(ControlError::UnknownChunk(id))?;
        if chunk.status != from || !from.allows(to) {
            return Err(ControlError::InvalidState {
                id,
                status: chunk.status,
                operation: "transition",
            });
        }
        let now = now_ms();
        chunk.status = to;
        chunk.last_heartbeat = now;
        match to {
            ChunkStatus::Running => chunk.started_at = Some(now),
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Killed => {
                chunk.completed_at = Some(now);
            }
            ChunkStatus::Queued => {
                // Requeue: back to a fresh attempt.
                chunk.started_at = None;
                chunk.completed_at = None;
                chunk.progress_completed = 0;
                chunk.attempt += 1;
            }
        }
        Ok(&*chunk)
    }

    /// Advances completion by `delta` hosts, clamped at the total, and
    /// refreshes the heartbeat.
    pub fn progress(&mut self, id: Uuid, delta: usize) -> Result<&Chunk, ControlError> {
        let chunk = self
            .chunks
            .get_mut(&id)
            .ok_or(ControlError::UnknownChunk(id))?;
        chunk.progress_completed = (chunk.progress_completed + delta).min(chunk.progress_total);
        chunk.last_heartbeat = now_ms();
        Ok(&*chunk)
    }

    /// Stable listing by creation time. Returns the total match count
    /// alongside the requested page.
    pub fn list(
        &self,
        status: Option<ChunkStatus>,
        limit: usize,
        offset: usize,
    ) -> (usize, Vec<Chunk>) {
        let mut items: Vec<&Chunk> = self
            .chunks
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .collect();
        items.sort_by_key(|c| (c.created_at, c.seq));
        let total = items.len();
        let page = items
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (total, page)
    }

    /// QUEUED chunk ids in promotion order.
    pub fn queued_in_order(&self) -> Vec<Uuid> {
        let mut queued: Vec<&Chunk> = self
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Queued)
            .collect();
        queued.sort_by_key(|c| (c.created_at, c.seq));
        queued.iter().map(|c| c.id).collect()
    }

    /// Carves the chunk's targets into `parts` contiguous slices and
    /// registers each as a QUEUED child with a bumped attempt counter.
    /// The caller decides when the parent moves to KILLED.
    pub fn split(&mut self, id: Uuid, parts: usize) -> Result<Vec<Uuid>, ControlError> {
        let parent = self.chunks.get(&id).ok_or(ControlError::UnknownChunk(id))?;
        if parent.status.is_terminal() {
            return Err(ControlError::InvalidState {
                id,
                status: parent.status,
                operation: "split",
            });
        }
        let targets = parent.targets.clone();
        let attempt = parent.attempt + 1;
        let slice_len = targets.len().div_ceil(parts.max(1)).max(1);
        let mut child_ids = Vec::new();
        for slice in targets.chunks(slice_len) {
            child_ids.push(self.create(slice.to_vec(), Some(id), attempt).id);
        }
        Ok(child_ids)
    }

    /// Earliest creation and latest completion stamps across all chunks.
    pub fn time_bounds(&self) -> (Option<u64>, Option<u64>) {
        let started = self.chunks.values().map(|c| c.created_at).min();
        let finished = self.chunks.values().filter_map(|c| c.completed_at).max();
        (started, finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("10.0.0.{i}")).collect()
    }

    #[test]
    fn create_starts_queued_with_full_total() {
        let mut store = ChunkStore::new();
        let chunk = store.create(targets(4), None, 0);
        assert_eq!(chunk.status, ChunkStatus::Queued);
        assert_eq!(chunk.progress_total, 4);
        assert_eq!(chunk.progress_completed, 0);
        assert!(chunk.started_at.is_none());
        assert!(chunk.completed_at.is_none());
    }

    #[test]
    fn transitions_stamp_timestamps() {
        let mut store = ChunkStore::new();
        let id = store.create(targets(2), None, 0).id;

        let chunk = store
            .transition(id, ChunkStatus::Queued, ChunkStatus::Running)
            .unwrap();
        assert!(chunk.started_at.is_some());
        assert!(chunk.completed_at.is_none());

        let chunk = store
            .transition(id, ChunkStatus::Running, ChunkStatus::Completed)
            .unwrap();
        assert!(chunk.completed_at.is_some());
    }

    #[test]
    fn illegal_transitions_are_rejected_without_mutation() {
        let mut store = ChunkStore::new();
        let id = store.create(targets(2), None, 0).id;

        let err = store
            .transition(id, ChunkStatus::Queued, ChunkStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidState { .. }));
        assert_eq!(store.status_of(id), Some(ChunkStatus::Queued));

        // Stale compare-and-set: claims RUNNING but the chunk is QUEUED.
        let err = store
            .transition(id, ChunkStatus::Running, ChunkStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidState { .. }));

        let err = store
            .transition(Uuid::new_v4(), ChunkStatus::Queued, ChunkStatus::Running)
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownChunk(_)));
    }

    #[test]
    fn requeue_resets_progress_and_bumps_attempt() {
        let mut store = ChunkStore::new();
        let id = store.create(targets(3), None, 0).id;
        store
            .transition(id, ChunkStatus::Queued, ChunkStatus::Running)
            .unwrap();
        store.progress(id, 2).unwrap();
        store
            .transition(id, ChunkStatus::Running, ChunkStatus::Killed)
            .unwrap();

        let chunk = store
            .transition(id, ChunkStatus::Killed, ChunkStatus::Queued)
            .unwrap();
        assert_eq!(chunk.attempt, 1);
        assert_eq!(chunk.progress_completed, 0);
        assert_eq!(chunk.progress_total, 3);
        assert!(chunk.started_at.is_none());
        assert!(chunk.completed_at.is_none());
    }

    #[test]
    fn progress_is_clamped_and_refreshes_heartbeat() {
        let mut store = ChunkStore::new();
        let id = store.create(targets(2), None, 0).id;
        store
            .transition(id, ChunkStatus::Queued, ChunkStatus::Running)
            .unwrap();
        let chunk = store.progress(id, 5).unwrap();
        assert_eq!(chunk.progress_completed, 2);
    }

    #[test]
    fn split_produces_contiguous_disjoint_children() {
        let mut store = ChunkStore::new();
        let parent = store.create(targets(8), None, 1);
        let child_ids = store.split(parent.id, 3).unwrap();

        // ceil(8/3) = 3 per slice, so three children of 3, 3 and 2.
        assert_eq!(child_ids.len(), 3);
        let sizes: Vec<usize> = child_ids
            .iter()
            .map(|id| store.get(*id).unwrap().targets.len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 2]);

        let mut reunited = Vec::new();
        for id in &child_ids {
            let child = store.get(*id).unwrap();
            assert_eq!(child.status, ChunkStatus::Queued);
            assert_eq!(child.parent_id, Some(parent.id));
            assert_eq!(child.attempt, 2);
            reunited.extend(child.targets.clone());
        }
        assert_eq!(reunited, parent.targets);
        assert_eq!(store.children_of(parent.id), child_ids);
    }

    #[test]
    fn split_of_terminal_chunk_is_rejected() {
        let mut store = ChunkStore::new();
        let id = store.create(targets(2), None, 0).id;
        store
            .transition(id, ChunkStatus::Queued, ChunkStatus::Killed)
            .unwrap();
        let err = store.split(id, 2).unwrap_err();
        assert!(matches!(err, ControlError::InvalidState { .. }));
    }

    #[test]
    fn list_is_stable_and_pages() {
        let mut store = ChunkStore::new();
        let ids: Vec<Uuid> = (0..5).map(|_| store.create(targets(1), None, 0).id).collect();

        let (total, items) = store.list(None, 10, 0);
        assert_eq!(total, 5);
        assert_eq!(items.iter().map(|c| c.id).collect::<Vec<_>>(), ids);

        let (total, items) = store.list(None, 2, 2);
        assert_eq!(total, 5);
        assert_eq!(items.iter().map(|c| c.id).collect::<Vec<_>>(), ids[2..4]);

        store
            .transition(ids[1], ChunkStatus::Queued, ChunkStatus::Running)
            .unwrap();
        let (total, items) = store.list(Some(ChunkStatus::Queued), 10, 0);
        assert_eq!(total, 4);
        assert!(items.iter().all(|c| c.status == ChunkStatus::Queued));
        assert_eq!(store.queued_in_order().len(), 4);
    }
}
