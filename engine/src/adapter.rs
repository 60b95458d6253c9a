//! Adapter contract and the async cycle driver.
//!
//! An adapter owns the transport to one remote service. The engine asks it
//! for remote changes (step 3) and hands it local changes to push (step 6);
//! both calls are async and may take as long as the transport needs. The
//! engine spawns nothing and runs on whatever executor awaits it.
//!
//! Adapters that prefer callbacks can skip [`SyncEngine::run_cycle`] and
//! call the step methods directly.

use crate::error::Result;
use crate::local::LocalChanges;
use crate::provenance::ProvenanceFilter;
use crate::state::StateStore;
use crate::store::RecordStore;
use crate::{Record, SyncEngine, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What changed on the remote since the last cycle.
///
/// Every record carries a GUID of the form `"<accountId>:<remoteId>"`;
/// records created from a local record also carry its group-id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChanges {
    pub deleted: Vec<Record>,
    pub added_or_modified: Vec<Record>,
}

/// The remote side of a sync cycle.
#[async_trait]
pub trait SyncAdapter: Send {
    /// Fetch everything changed remotely after `remote_since` (everything
    /// when unset).
    async fn determine_remote_changes(
        &mut self,
        account: &str,
        remote_since: Option<Timestamp>,
    ) -> Result<RemoteChanges>;

    /// Push local changes. Additions carry their group-id and must keep it
    /// on the remote until they come back with a GUID.
    async fn upsync_local_changes(&mut self, account: &str, changes: &LocalChanges) -> Result<()>;
}

/// Counts from one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// Records written to the local store
    pub stored_remote: usize,
    pub upsynced_added: usize,
    pub upsynced_modified: usize,
    pub upsynced_deleted: usize,
}

impl<R, S, F> SyncEngine<R, S, F>
where
    R: RecordStore,
    S: StateStore,
    F: ProvenanceFilter,
{
    /// Run one full cycle for `account` against `adapter`.
    ///
    /// An adapter failure aborts the session; nothing persisted moves, so the
    /// next cycle sees the same changes again.
    pub async fn run_cycle<A>(
        &self,
        adapter: &mut A,
        account: &str,
        oob_key: Option<&str>,
    ) -> Result<SyncSummary>
    where
        A: SyncAdapter + ?Sized,
    {
        self.init(account, oob_key)?;
        let remote_since = self.read_state(account)?;

        let remote = match adapter.determine_remote_changes(account, remote_since).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::error!(account = %account, error = %e, "Fetching remote changes failed");
                self.abort(account);
                return Err(e);
            }
        };
        let stored_remote =
            self.store_remote_changes(account, &remote.deleted, &remote.added_or_modified)?;

        let local = self.determine_local_changes(account)?;
        if let Err(e) = adapter.upsync_local_changes(account, &local).await {
            tracing::error!(account = %account, error = %e, "Pushing local changes failed");
            self.abort(account);
            return Err(e);
        }

        self.store_sync_state(account)?;

        let summary = SyncSummary {
            stored_remote,
            upsynced_added: local.added.len(),
            upsynced_modified: local.modified.len(),
            upsynced_deleted: local.deleted.len(),
        };
        tracing::info!(account = %account, ?summary, "Sync cycle complete");
        Ok(summary)
    }
}
