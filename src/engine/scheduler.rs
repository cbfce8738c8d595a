//! Scheduling loop and per-chunk supervisors.
//!
//! A single tick task promotes QUEUED chunks to RUNNING, oldest first,
//! whenever capacity under `max_workers` frees up. Promotion transitions
//! the chunk under the state lock, which doubles as the guard against two
//! supervisors ever driving the same chunk.
//!
//! Each supervisor snapshots its chunk's targets and the settings at start,
//! then fans host scans out under a semaphore of `per_host_workers`. Every
//! host completion writes its artifact, advances progress, moves the
//! address in the coverage sets and publishes `host_completed` followed by
//! `chunk_progress`. The supervisor owns its chunk's terminal transition:
//! cancelled runs end KILLED, panicking runs end FAILED, everything else
//! ends COMPLETED. Per-host scanner failures never fail the chunk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::ChunkStatus;
use crate::events::{EventKind, now_ms};
use crate::settings::Settings;

use super::{ChunkHandle, Core};

/// Runs promotion on a coarse cadence until shutdown.
pub(crate) fn spawn_tick_loop(core: Arc<Core>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = core.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            promote_queued(&core);
        }
        tracing::debug!("scheduler tick loop stopped");
    });
}

/// Promotes QUEUED chunks into free worker slots, creation order first.
pub(crate) fn promote_queued(core: &Arc<Core>) {
    let mut promoted = Vec::new();
    {
        let mut state = core.state.lock();
        let running = state.chunks.count(ChunkStatus::Running);
        let cap = state.settings.max_workers.saturating_sub(running);
        if cap == 0 {
            return;
        }
        for id in state.chunks.queued_in_order().into_iter().take(cap) {
            // The transition is the at-most-one-supervisor guard.
            if state
                .chunks
                .transition(id, ChunkStatus::Queued, ChunkStatus::Running)
                .is_ok()
            {
                promoted.push(id);
            }
        }
    }
    for id in promoted {
        let cancel = CancellationToken::new();
        core.handles.lock().insert(
            id,
            ChunkHandle {
                cancel: cancel.clone(),
                join: None,
            },
        );
        let join = tokio::spawn(run_chunk(core.clone(), id, cancel));
        // The supervisor may already have finished and cleared its slot;
        // only a live entry gets the join handle.
        if let Some(handle) = core.handles.lock().get_mut(&id) {
            handle.join = Some(join);
        }
        tracing::debug!(chunk_id = %id, "chunk promoted");
    }
}

enum Terminal {
    Completed,
    Failed(String),
    Killed,
}

/// Supervisor for one RUNNING chunk.
pub(crate) async fn run_chunk(core: Arc<Core>, chunk_id: Uuid, cancel: CancellationToken) {
    let Some((targets, settings, started_at)) = snapshot(&core, chunk_id) else {
        core.handles.lock().remove(&chunk_id);
        return;
    };
    tracing::info!(chunk_id = %chunk_id, hosts = targets.len(), "chunk started");
    core.broker.publish(EventKind::ChunkStarted { chunk_id });

    let semaphore = Arc::new(Semaphore::new(settings.per_host_workers));
    let mut scans = JoinSet::new();
    for address in targets {
        let core = core.clone();
        let settings = settings.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        scans.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            // Past the semaphore but not yet spawned: the last cheap
            // place to honor an abort.
            if cancel.is_cancelled() {
                return;
            }
            scan_host(&core, chunk_id, &address, &settings, &cancel).await;
        });
    }

    let mut failure: Option<String> = None;
    while let Some(joined) = scans.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                failure.get_or_insert_with(|| err.to_string());
            }
        }
    }

    let terminal = if cancel.is_cancelled() {
        Terminal::Killed
    } else if let Some(error) = failure {
        Terminal::Failed(error)
    } else {
        Terminal::Completed
    };
    finish_chunk(&core, chunk_id, started_at, terminal);
    core.handles.lock().remove(&chunk_id);
}

fn snapshot(core: &Core, chunk_id: Uuid) -> Option<(Vec<String>, Settings, u64)> {
    let state = core.state.lock();
    let chunk = state.chunks.get(chunk_id)?;
    Some((
        chunk.targets.clone(),
        state.settings.clone(),
        chunk.started_at.unwrap_or(chunk.created_at),
    ))
}

/// One host: scan, persist, account, announce.
async fn scan_host(
    core: &Core,
    chunk_id: Uuid,
    address: &str,
    settings: &Settings,
    cancel: &CancellationToken,
) {
    let outcome = core.scanner.scan(address, settings, cancel).await;
    let mut ok = outcome.ok;
    if let Err(err) = core.artifacts.write(chunk_id, address, &outcome.stdout).await {
        tracing::warn!(chunk_id = %chunk_id, address, error = %err, "failed to persist scan artifact");
        ok = false;
    }
    // Publishing while the lock is held keeps event order identical to
    // state order; the broker never blocks.
    let mut state = core.state.lock();
    state.coverage.record(address, ok);
    core.broker.publish(EventKind::HostCompleted {
        chunk_id,
        address: address.to_string(),
        ok,
        duration_ms: outcome.duration_ms,
    });
    if let Ok(chunk) = state.chunks.progress(chunk_id, 1) {
        core.broker.publish(EventKind::ChunkProgress {
            chunk_id,
            completed_hosts: chunk.progress_completed,
            total_hosts: chunk.progress_total,
        });
    }
}

/// Terminal transition plus its event, but only if this supervisor still
/// owns the RUNNING state.
fn finish_chunk(core: &Core, chunk_id: Uuid, started_at: u64, terminal: Terminal) {
    let to = match &terminal {
        Terminal::Completed => ChunkStatus::Completed,
        Terminal::Failed(_) => ChunkStatus::Failed,
        Terminal::Killed => ChunkStatus::Killed,
    };
    let mut state = core.state.lock();
    if state
        .chunks
        .transition(chunk_id, ChunkStatus::Running, to)
        .is_err()
    {
        // Someone else already moved the chunk out of RUNNING.
        return;
    }
    let duration_ms = now_ms().saturating_sub(started_at);
    match terminal {
        Terminal::Completed => {
            tracing::info!(chunk_id = %chunk_id, duration_ms, "chunk completed");
            core.broker.publish(EventKind::ChunkCompleted {
                chunk_id,
                duration_ms,
            });
        }
        Terminal::Failed(error) => {
            tracing::warn!(chunk_id = %chunk_id, %error, "chunk failed");
            core.broker.publish(EventKind::ChunkFailed { chunk_id, error });
        }
        Terminal::Killed => {
            tracing::info!(chunk_id = %chunk_id, duration_ms, "chunk killed");
            core.broker.publish(EventKind::ChunkKilled {
                chunk_id,
                reason: "cancelled".to_string(),
            });
        }
    }
}
