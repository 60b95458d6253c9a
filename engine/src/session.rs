//! Per-account session state.

use crate::{LocalId, Record, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a session is in the sync protocol.
///
/// Steps run in this order; each step requires its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    #[default]
    Inactive,
    Initialized,
    ReadSyncStateData,
    StoredRemoteChanges,
    DeterminedLocalChanges,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Inactive => "Inactive",
            SessionStatus::Initialized => "Initialized",
            SessionStatus::ReadSyncStateData => "ReadSyncStateData",
            SessionStatus::StoredRemoteChanges => "StoredRemoteChanges",
            SessionStatus::DeterminedLocalChanges => "DeterminedLocalChanges",
        };
        f.write_str(name)
    }
}

/// Everything the engine knows about one account during a cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub status: SessionStatus,
    /// Side-store scope for this account
    pub oob_scope: String,
    pub local_since: Option<Timestamp>,
    pub remote_since: Option<Timestamp>,
    /// Becomes next cycle's `remote_since`
    pub new_remote_since: Option<Timestamp>,
    /// Local records pushed remotely that have no GUID yet
    pub exported_ids: Vec<LocalId>,
    /// Remote snapshot as last reconciled
    pub prev_remote: Vec<Record>,
    /// Snapshot being built this cycle
    pub mutated_prev_remote: Vec<Record>,
    /// Whether `mutated_prev_remote` has been derived this cycle
    pub mutated: bool,
    /// A step has checked this session out of the engine
    #[serde(skip)]
    pub in_step: bool,
}

impl SessionState {
    /// A fresh `Initialized` session for the given side-store scope.
    pub fn initialized(oob_scope: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Initialized,
            oob_scope: oob_scope.into(),
            ..Self::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Inactive
    }

    /// Drop the cycle's data and return to `Inactive`. The side-store scope
    /// is kept so that a later purge still reaches it.
    pub fn reset(&mut self) {
        let oob_scope = std::mem::take(&mut self.oob_scope);
        *self = Self {
            oob_scope,
            ..Self::default()
        };
    }

    /// Derive the working snapshot from `prev_remote` if this cycle has not
    /// done so yet.
    pub fn ensure_mutated(&mut self) {
        if !self.mutated {
            self.mutated_prev_remote = self.prev_remote.clone();
            self.mutated = true;
        }
    }

    /// Add a local identifier to the exported list, once.
    pub fn export(&mut self, id: &str) {
        if !self.exported_ids.iter().any(|e| e == id) {
            self.exported_ids.push(id.to_string());
        }
    }
}
