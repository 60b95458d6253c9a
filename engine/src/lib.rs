//! # Twoway Engine
//!
//! A reconciliation engine for two-way sync between a local record store and
//! a remote service that do not share a stable identifier for every record.
//!
//! The engine keeps, per account, the remote snapshot as it last reconciled
//! it. Each cycle it correlates the remote's change report against that
//! snapshot, turns whole-record replacements into field-level modifications,
//! writes the result locally, collects local changes to push back, and
//! persists the new snapshot.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a list of typed [`Detail`]s plus a local identifier once
//! persisted. Two details identify a record across systems:
//! - the GUID, `"<accountId>:<remoteId>"`, stamped by the remote
//! - the group-id, the local identifier of a record pushed to the remote
//!   before it had a GUID
//!
//! ### Sessions
//!
//! [`SyncEngine`] runs one session per account through seven steps:
//! `init`, `read_state`, (adapter fetches remote changes),
//! `store_remote_changes`, `determine_local_changes`, (adapter pushes local
//! changes), `store_sync_state`. Out-of-order calls are rejected. Store
//! failures reset the session so the next cycle starts from the last
//! persisted state.
//!
//! ### Delta Engine
//!
//! [`delta::apply_delta`] pairs removed and added details of the same kind by
//! a greedy minimum-distance match, so an edited phone number keeps the
//! identity of the detail it replaces.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use twoway_engine::{
//!     Detail, EngineConfig, MemoryRecordStore, MemoryStateStore, Record, SyncEngine,
//! };
//!
//! let engine = SyncEngine::new(
//!     EngineConfig::new("example"),
//!     Arc::new(MemoryRecordStore::default()),
//!     Arc::new(MemoryStateStore::new()),
//! );
//!
//! // 1-2. Start a session and load persisted state
//! engine.init("acct", None)?;
//! let remote_since = engine.read_state("acct")?;
//! assert!(remote_since.is_none());
//!
//! // 3-4. The adapter fetched one remote record; store it locally
//! let reported = vec![Record::new()
//!     .with_guid("acct:1")
//!     .with_detail(Detail::phone("555"))];
//! engine.store_remote_changes("acct", &[], &reported)?;
//!
//! // 5-6. Nothing local to push yet
//! let local = engine.determine_local_changes("acct")?;
//! assert!(local.is_empty());
//!
//! // 7. Persist the snapshot and finish
//! engine.store_sync_state("acct")?;
//! assert_eq!(engine.records().len(), 1);
//! # Ok::<(), twoway_engine::Error>(())
//! ```
//!
//! Adapters implementing [`SyncAdapter`] can run all seven steps with
//! [`SyncEngine::run_cycle`].

pub mod adapter;
pub mod clock;
pub mod config;
pub mod correlate;
pub mod delta;
pub mod detail;
pub mod engine;
pub mod error;
pub mod local;
pub mod provenance;
pub mod reconcile;
pub mod record;
pub mod session;
pub mod state;
pub mod store;

// Re-export main types at crate root
pub use adapter::{RemoteChanges, SyncAdapter, SyncSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use detail::{Detail, DetailId, DetailKind, FieldId, FieldValue, Primitive};
pub use engine::SyncEngine;
pub use error::{Error, Result, StoreError};
pub use local::LocalChanges;
pub use provenance::{AccountProvenance, ProvenanceFilter};
pub use reconcile::{RemoteDelta, RemoteDeltaStats};
pub use record::{format_guid, guid_belongs_to, parse_guid, Record};
pub use session::{SessionState, SessionStatus};
pub use state::{MemoryStateStore, PersistedState, StateKey, StateStore, STATE_FORMAT_VERSION};
pub use store::{ConflictPolicy, FetchedChanges, MemoryRecordStore, RecordStore, SyncPair};

/// Type aliases for clarity
pub type AccountId = String;
pub type LocalId = String;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
