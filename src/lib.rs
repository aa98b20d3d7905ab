//! projctx keeps per-project state (memory, commit history, snapshot, events)
//! as JSON documents that survive concurrent writers and corruption, bounds
//! their growth, merges them into one unified context and mirrors that into
//! a rebuildable SQLite index.

pub mod clock;
pub mod config;
pub mod context;
pub mod document_store;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod indexer;
pub mod layout;
pub mod maintenance;
pub mod memory;
pub mod readme;
pub mod snapshot;
pub mod telemetry;
pub mod vcs;
pub mod write_core;
pub mod write_lock;

pub use config::{EngineConfig, IndexConfig, LimitsConfig, ProjectConfig, UserMemory};
pub use context::{ContextGenerator, UnifiedContext};
pub use document_store::{DocumentStore, StoreOptions};
pub use engine::{Engine, EngineHandle, RunRecord};
pub use error::{IndexError, LayoutError, ReadOutcome, ReadStatus};
pub use events::EventEntry;
pub use history::{CommitHistory, CommitRecord, HistoryStore};
pub use indexer::{Indexer, SyncMetadata, SyncMode, SyncReport, Table};
pub use layout::{ProjectLayout, Workspace};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use memory::{ActionKind, ProjectMemory, SemanticContext};
pub use snapshot::{Snapshot, SnapshotUpdate};
pub use vcs::{CommitLogSource, ExternalCommit, GitCli};
pub use write_core::DurabilityMode;
