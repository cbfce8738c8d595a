//! # scanherd
//!
//! A bulk port-scan orchestration engine. Feed it large target lists and
//! it fans the work out across a bounded pool of workers, running the
//! external `nmap` binary once per host, while streaming progress events
//! to any number of subscribers and persisting every raw result for later
//! aggregation.
//!
//! ## What it does
//!
//! - **Target expansion**: plain addresses, CIDR blocks, inclusive ranges
//!   and hostnames, with comment handling, dedup and a guard against
//!   accidental giant expansions.
//! - **Chunked scheduling**: targets are partitioned into chunks, the unit
//!   of scheduling, promoted oldest-first into at most `max_workers`
//!   concurrent supervisors.
//! - **Process supervision**: one scanner process per host, bounded per
//!   chunk by `per_host_workers`, with a watchdog deadline on top of the
//!   scanner's own timeout and SIGTERM/SIGKILL escalation.
//! - **Live control**: kill a chunk, split a slow one into smaller
//!   children, requeue a finished one, retune settings at runtime.
//! - **Events**: every state change is published to per-subscriber
//!   bounded queues with a lossy slow-consumer policy.
//! - **Results**: raw XML artifacts on disk, a total parser to structured
//!   host records, per-address coverage accounting and a consolidated
//!   export.
//!
//! ## Architecture
//!
//! ```text
//! raw lines ──► targets ──► ChunkStore (QUEUED chunks)
//!                               │ promotion, oldest first
//!                               v
//!                    scheduler + supervisors
//!                     │ per-host semaphore
//!                     v
//!               NmapScanner (one process per host)
//!                     │ raw XML
//!                     v
//!       ArtifactStore ── parser ── export/report
//!           │
//!           └─ progress + coverage ──► EventBroker ──► subscribers
//! ```
//!
//! The [`Orchestrator`] is the facade over all of it; everything else is
//! public so embedders can reuse the pieces.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use scanherd::{Orchestrator, SettingsPatch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), scanherd::ControlError> {
//!     let orchestrator = Orchestrator::builder("/var/lib/scanherd").build()?;
//!
//!     // Watch everything the engine does.
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{}", event.to_json());
//!         }
//!     });
//!
//!     // Tune the pool, then hand over targets.
//!     orchestrator.update_settings(SettingsPatch {
//!         max_workers: Some(4),
//!         ..SettingsPatch::default()
//!     })?;
//!     orchestrator.import_text("10.0.0.0/28\n10.1.0.1-10.1.0.32\nscanme.example.org\n", 8)?;
//!
//!     // ... later: consolidate whatever has been scanned so far.
//!     let report = orchestrator.export().await?;
//!     println!("{} hosts", report.hosts.len());
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Scanner contract
//!
//! The engine treats the scanner as a black box: it must accept the argv
//! built by [`nmap::build_argv`], write scan XML to stdout and
//! diagnostics to stderr, and exit zero on success. Anything honoring
//! that contract can stand in via the [`HostScanner`] trait, which is
//! also how the test suite runs without a scanner binary installed.

pub mod artifacts;
pub mod chunk;
pub mod coverage;
pub mod engine;
pub mod error;
pub mod events;
pub mod nmap;
pub mod settings;
pub mod targets;

pub use artifacts::{ArtifactEntry, ArtifactStore};
pub use chunk::{Chunk, ChunkStatus};
pub use coverage::Coverage;
pub use engine::{
    ChunkDetails, ChunkPage, DEFAULT_CHUNK_SIZE, Health, Metrics, Orchestrator,
    OrchestratorBuilder, ScanReport,
};
pub use error::{ControlError, ExpandError};
pub use events::{Event, EventBroker, EventKind, EventStream};
pub use nmap::parser::{HostRecord, parse_host_xml};
pub use nmap::{HostScanner, NmapScanner, ScanOutcome, build_argv};
pub use settings::{ScanProfile, Settings, SettingsPatch};
pub use targets::expand_lines;
