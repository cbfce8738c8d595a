//! # Orchestration engine
//!
//! The [`Orchestrator`] ties the leaf components into one scan pipeline
//! and exposes the control surface a transport layer projects outward.
//!
//! ```text
//! +----------------------------------------------------------+
//! |                      Orchestrator                        |
//! |  import, list, kill, split, requeue, settings, coverage, |
//! |  metrics, subscribe, details, result, export, shutdown   |
//! +-----------------------------+----------------------------+
//!                               |
//!                               v
//! +----------------------------------------------------------+
//! |                    Core (shared state)                   |
//! |  - ChunkStore + CoverageTracker + Settings (one mutex)   |
//! |  - EventBroker        - ArtifactStore                    |
//! |  - supervisor handles - shutdown token                   |
//! +-----------------------------+----------------------------+
//!                               |
//!                               v
//! +----------------------------------------------------------+
//! |                scheduler tick + supervisors              |
//! |  promote QUEUED chunks, one supervisor per RUNNING chunk,|
//! |  per-host scans bounded by a semaphore                   |
//! +----------------------------------------------------------+
//! ```
//!
//! Concurrency rules:
//!
//! - Chunk, coverage and settings state lives behind a single mutex that
//!   is never held across an await.
//! - Events that reflect a state change are published while that change's
//!   lock is still held, so subscribers observe them in the order the
//!   state machine took them.
//! - Supervisors own their chunk's terminal transition. The control
//!   surface kills a RUNNING chunk by cancelling its token and letting the
//!   supervisor wind down, which preserves per-chunk event ordering.
//!
//! The orchestrator is cheap to clone; clones share the same engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::chunk::{Chunk, ChunkStatus, ChunkStore};
use crate::coverage::{Coverage, CoverageTracker};
use crate::error::ControlError;
use crate::events::{EventBroker, EventKind, EventStream};
use crate::nmap::parser::{HostRecord, parse_host_xml};
use crate::nmap::{HostScanner, NmapScanner};
use crate::settings::{Settings, SettingsPatch};
use crate::targets::{self, DEFAULT_MAX_EXPAND};

mod report;
mod scheduler;

pub use report::ScanReport;

/// Default cadence of the promotion tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Default `chunk_size` for imports when the caller has no preference.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// One page of a chunk listing.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPage {
    pub total: usize,
    pub items: Vec<Chunk>,
}

/// Scheduler gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub running: usize,
    pub queued: usize,
    pub chunks: usize,
}

/// Liveness summary for a health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
    pub scanner: String,
    pub state_dir: PathBuf,
}

/// Per-address artifact presence for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostArtifact {
    pub address: String,
    pub has_result: bool,
}

/// Inspection view of a chunk's artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDetails {
    pub id: Uuid,
    pub targets: Vec<HostArtifact>,
}

/// Mutable engine state behind the single serializing lock.
pub(crate) struct EngineState {
    pub settings: Settings,
    pub chunks: ChunkStore,
    pub coverage: CoverageTracker,
}

/// Cancellation and join handle of one live supervisor.
pub(crate) struct ChunkHandle {
    pub cancel: CancellationToken,
    pub join: Option<JoinHandle<()>>,
}

/// Everything the orchestrator and its background tasks share.
pub(crate) struct Core {
    pub state: Mutex<EngineState>,
    pub broker: EventBroker,
    pub artifacts: ArtifactStore,
    pub scanner: Arc<dyn HostScanner>,
    pub handles: Mutex<HashMap<Uuid, ChunkHandle>>,
    pub shutdown: CancellationToken,
    pub state_dir: PathBuf,
}

/// Configures and starts an [`Orchestrator`].
pub struct OrchestratorBuilder {
    state_dir: PathBuf,
    settings: Settings,
    scanner: Option<Arc<dyn HostScanner>>,
    nmap_program: String,
    tick_interval: Duration,
}

impl OrchestratorBuilder {
    fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            settings: Settings::default(),
            scanner: None,
            nmap_program: "nmap".to_string(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Swaps the scanner implementation, mainly for tests and embedders
    /// with their own process handling.
    pub fn with_scanner(mut self, scanner: Arc<dyn HostScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Path of the scanner binary used when no scanner was injected.
    pub fn with_nmap_program(mut self, program: impl Into<String>) -> Self {
        self.nmap_program = program.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Validates the settings and starts the scheduler. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> Result<Orchestrator, ControlError> {
        self.settings.validate()?;
        let scanner = self
            .scanner
            .unwrap_or_else(|| Arc::new(NmapScanner::new(self.nmap_program)));
        let core = Arc::new(Core {
            state: Mutex::new(EngineState {
                settings: self.settings,
                chunks: ChunkStore::new(),
                coverage: CoverageTracker::new(),
            }),
            broker: EventBroker::new(),
            artifacts: ArtifactStore::new(&self.state_dir),
            scanner,
            handles: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            state_dir: self.state_dir,
        });
        scheduler::spawn_tick_loop(core.clone(), self.tick_interval);
        Ok(Orchestrator { core })
    }
}

/// The scan scheduling and execution engine.
#[derive(Clone)]
pub struct Orchestrator {
    core: Arc<Core>,
}

impl Orchestrator {
    pub fn builder(state_dir: impl Into<PathBuf>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(state_dir.into())
    }

    /// Expands raw target lines and partitions them into QUEUED chunks of
    /// at most `chunk_size` addresses ([`DEFAULT_CHUNK_SIZE`] is the
    /// conventional choice). Returns the new chunk ids in scheduling
    /// order.
    pub fn import<I, S>(&self, lines: I, chunk_size: usize) -> Result<Vec<Uuid>, ControlError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if chunk_size == 0 {
            return Err(ControlError::Input("chunk_size must be at least 1".into()));
        }
        let addresses = targets::expand_lines(lines, DEFAULT_MAX_EXPAND)?;
        if addresses.is_empty() {
            return Err(ControlError::Input("no targets provided".into()));
        }

        let mut created = Vec::new();
        let mut state = self.core.state.lock();
        for slice in addresses.chunks(chunk_size) {
            let chunk = state.chunks.create(slice.to_vec(), None, 0);
            state.coverage.ingest(slice.iter().map(String::as_str));
            self.core.broker.publish(EventKind::ChunkCreated {
                chunk_id: chunk.id,
                total_hosts: chunk.progress_total,
                parent_id: None,
            });
            created.push(chunk.id);
        }
        tracing::info!(
            chunks = created.len(),
            addresses = addresses.len(),
            "targets imported"
        );
        Ok(created)
    }

    /// Convenience wrapper for ingest-file content.
    pub fn import_text(&self, text: &str, chunk_size: usize) -> Result<Vec<Uuid>, ControlError> {
        self.import(text.lines(), chunk_size)
    }

    pub fn list_chunks(
        &self,
        status: Option<ChunkStatus>,
        limit: usize,
        offset: usize,
    ) -> ChunkPage {
        let state = self.core.state.lock();
        let (total, items) = state.chunks.list(status, limit, offset);
        ChunkPage { total, items }
    }

    pub fn get_chunk(&self, id: Uuid) -> Result<Chunk, ControlError> {
        self.core
            .state
            .lock()
            .chunks
            .get(id)
            .cloned()
            .ok_or(ControlError::UnknownChunk(id))
    }

    pub fn children_of(&self, id: Uuid) -> Vec<Uuid> {
        self.core.state.lock().chunks.children_of(id)
    }

    /// Kills a chunk. QUEUED chunks die in place; RUNNING chunks get
    /// their abort signal and the supervisor finishes the job. Killing an
    /// already KILLED chunk is a no-op.
    pub fn kill(&self, id: Uuid) -> Result<(), ControlError> {
        let running_handle = {
            let mut state = self.core.state.lock();
            let status = state
                .chunks
                .status_of(id)
                .ok_or(ControlError::UnknownChunk(id))?;
            match status {
                ChunkStatus::Queued => {
                    state
                        .chunks
                        .transition(id, ChunkStatus::Queued, ChunkStatus::Killed)?;
                    self.core.broker.publish(EventKind::ChunkKilled {
                        chunk_id: id,
                        reason: "user".to_string(),
                    });
                    false
                }
                ChunkStatus::Running => true,
                ChunkStatus::Killed => return Ok(()),
                status @ (ChunkStatus::Completed | ChunkStatus::Failed) => {
                    return Err(ControlError::InvalidState {
                        id,
                        status,
                        operation: "kill",
                    });
                }
            }
        };
        if running_handle {
            if let Some(handle) = self.core.handles.lock().get(&id) {
                handle.cancel.cancel();
            }
        }
        tracing::info!(chunk_id = %id, "kill requested");
        Ok(())
    }

    /// Splits a chunk into `parts` contiguous children. The children are
    /// QUEUED immediately; a QUEUED parent is KILLED in the same breath,
    /// a RUNNING parent is aborted and KILLED by its supervisor.
    pub fn split(&self, id: Uuid, parts: usize) -> Result<Vec<Uuid>, ControlError> {
        if parts == 0 {
            return Err(ControlError::Input("split parts must be at least 1".into()));
        }
        let (children, was_running) = {
            let mut state = self.core.state.lock();
            let status = state
                .chunks
                .status_of(id)
                .ok_or(ControlError::UnknownChunk(id))?;
            if status.is_terminal() {
                return Err(ControlError::InvalidState {
                    id,
                    status,
                    operation: "split",
                });
            }
            let children = state.chunks.split(id, parts)?;
            for child_id in &children {
                if let Some(child) = state.chunks.get(*child_id) {
                    self.core.broker.publish(EventKind::ChunkCreated {
                        chunk_id: child.id,
                        total_hosts: child.progress_total,
                        parent_id: Some(id),
                    });
                }
            }
            self.core.broker.publish(EventKind::ChunkSplit {
                chunk_id: id,
                children: children.clone(),
            });
            if status == ChunkStatus::Queued {
                state
                    .chunks
                    .transition(id, ChunkStatus::Queued, ChunkStatus::Killed)?;
            }
            (children, status == ChunkStatus::Running)
        };
        if was_running {
            if let Some(handle) = self.core.handles.lock().get(&id) {
                handle.cancel.cancel();
            }
        }
        tracing::info!(chunk_id = %id, children = children.len(), "chunk split");
        Ok(children)
    }

    /// Returns a terminal chunk to the queue for another attempt.
    pub fn requeue(&self, id: Uuid) -> Result<(), ControlError> {
        let mut state = self.core.state.lock();
        let status = state
            .chunks
            .status_of(id)
            .ok_or(ControlError::UnknownChunk(id))?;
        match status {
            // Postcondition already holds.
            ChunkStatus::Queued => Ok(()),
            ChunkStatus::Running => Err(ControlError::InvalidState {
                id,
                status,
                operation: "requeue",
            }),
            _ => {
                let attempt = state.chunks.transition(id, status, ChunkStatus::Queued)?.attempt;
                self.core
                    .broker
                    .publish(EventKind::ChunkRequeued { chunk_id: id, attempt });
                tracing::info!(chunk_id = %id, attempt, "chunk requeued");
                Ok(())
            }
        }
    }

    /// Applies a settings patch. Takes effect for chunks promoted after
    /// this call; running supervisors keep their snapshot.
    pub fn update_settings(&self, patch: SettingsPatch) -> Result<Settings, ControlError> {
        let mut state = self.core.state.lock();
        state.settings.apply(patch)?;
        let updated = state.settings.clone();
        self.core.broker.publish(EventKind::SettingsUpdated {
            settings: updated.clone(),
        });
        tracing::info!(version = updated.version, "settings updated");
        Ok(updated)
    }

    pub fn settings(&self) -> Settings {
        self.core.state.lock().settings.clone()
    }

    pub fn coverage(&self) -> Coverage {
        let state = self.core.state.lock();
        let killed = state.chunks.count(ChunkStatus::Killed);
        state.coverage.snapshot(killed)
    }

    pub fn metrics(&self) -> Metrics {
        let state = self.core.state.lock();
        Metrics {
            running: state.chunks.count(ChunkStatus::Running),
            queued: state.chunks.count(ChunkStatus::Queued),
            chunks: state.chunks.len(),
        }
    }

    pub fn health(&self) -> Health {
        Health {
            ok: true,
            scanner: self.core.scanner.describe(),
            state_dir: self.core.state_dir.clone(),
        }
    }

    /// Attaches an event subscriber; its first event is `hello`.
    pub fn subscribe(&self) -> EventStream {
        self.core.broker.subscribe()
    }

    /// Artifact presence per address of one chunk.
    pub async fn chunk_details(&self, id: Uuid) -> Result<ChunkDetails, ControlError> {
        let targets = {
            let state = self.core.state.lock();
            state
                .chunks
                .get(id)
                .ok_or(ControlError::UnknownChunk(id))?
                .targets
                .clone()
        };
        let mut hosts = Vec::with_capacity(targets.len());
        for address in targets {
            let has_result = self.core.artifacts.has_data(id, &address).await;
            hosts.push(HostArtifact {
                address,
                has_result,
            });
        }
        Ok(ChunkDetails { id, targets: hosts })
    }

    /// Reads one artifact through the parser. An empty artifact reads as
    /// a host that never answered.
    pub async fn get_scan_result(
        &self,
        id: Uuid,
        address: &str,
    ) -> Result<HostRecord, ControlError> {
        {
            let state = self.core.state.lock();
            let chunk = state.chunks.get(id).ok_or(ControlError::UnknownChunk(id))?;
            if !chunk.targets.iter().any(|t| t == address) {
                return Err(ControlError::Input(format!(
                    "address {address} is not part of chunk {id}"
                )));
            }
        }
        match self.core.artifacts.read(id, address).await? {
            Some(bytes) => Ok(parse_host_xml(&bytes)),
            None => Err(ControlError::MissingResult {
                chunk_id: id,
                address: address.to_string(),
            }),
        }
    }

    /// Consolidates every artifact into one report keyed by address.
    pub async fn export(&self) -> Result<ScanReport, ControlError> {
        let (scan_started, scan_finished) = self.core.state.lock().chunks.time_bounds();
        Ok(report::consolidate(&self.core.artifacts, scan_started, scan_finished).await?)
    }

    /// Stops the scheduler, aborts every live supervisor and waits for
    /// them to record their terminal state.
    pub async fn shutdown(&self) {
        self.core.shutdown.cancel();
        let handles: Vec<ChunkHandle> = {
            let mut map = self.core.handles.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if let Some(join) = handle.join {
                let _ = join.await;
            }
        }
        tracing::info!("orchestrator shut down");
    }
}
