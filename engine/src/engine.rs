//! The per-account sync session state machine.
//!
//! A cycle runs seven steps in strict order. Steps 3 and 6 belong to the
//! adapter (see [`crate::adapter`]); the engine owns the other five:
//!
//! | step | method                                      | requires               |
//! |------|---------------------------------------------|------------------------|
//! | 1    | [`init`](SyncEngine::init)                  | `Inactive`             |
//! | 2    | [`read_state`](SyncEngine::read_state)      | `Initialized`          |
//! | 4    | [`store_remote_changes`](SyncEngine::store_remote_changes) | `ReadSyncStateData` |
//! | 5    | [`determine_local_changes`](SyncEngine::determine_local_changes) | `StoredRemoteChanges` |
//! | 7    | [`store_sync_state`](SyncEngine::store_sync_state) | `DeterminedLocalChanges` |
//!
//! A step called out of order fails with [`Error::ProtocolViolation`] and
//! leaves the session untouched. A store failure resets the session to
//! `Inactive` before the error is returned; nothing persisted is advanced,
//! so the next cycle reconciles from the last good state.
//!
//! Record and state store calls run with no lock held on the session map;
//! a second step for the same account meanwhile fails with
//! [`Error::StepInProgress`].

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::correlate::IdentityIndex;
use crate::error::{Error, Result};
use crate::local::{self, LocalChanges};
use crate::provenance::{AccountProvenance, ProvenanceFilter};
use crate::reconcile::{reconcile_remote, RemoteDelta};
use crate::session::{SessionState, SessionStatus};
use crate::state::{PersistedState, StateStore};
use crate::store::{ConflictPolicy, RecordStore};
use crate::{AccountId, Record, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Drives sync sessions for any number of accounts.
///
/// Thread-safe; sessions of different accounts may run concurrently.
pub struct SyncEngine<R, S, F = AccountProvenance> {
    config: EngineConfig,
    records: Arc<R>,
    state: Arc<S>,
    filter: F,
    clock: Arc<dyn Clock>,
    sessions: DashMap<AccountId, SessionState>,
}

impl<R, S> SyncEngine<R, S, AccountProvenance>
where
    R: RecordStore,
    S: StateStore,
{
    /// Create an engine with the default provenance filter and system clock.
    pub fn new(config: EngineConfig, records: Arc<R>, state: Arc<S>) -> Self {
        Self {
            config,
            records,
            state,
            filter: AccountProvenance,
            clock: Arc::new(SystemClock),
            sessions: DashMap::new(),
        }
    }
}

impl<R, S, F> SyncEngine<R, S, F>
where
    R: RecordStore,
    S: StateStore,
    F: ProvenanceFilter,
{
    /// Use `clock` for watermarks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the provenance filter.
    pub fn with_filter<G: ProvenanceFilter>(self, filter: G) -> SyncEngine<R, S, G> {
        SyncEngine {
            config: self.config,
            records: self.records,
            state: self.state,
            filter,
            clock: self.clock,
            sessions: self.sessions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<R> {
        &self.records
    }

    pub fn state_store(&self) -> &Arc<S> {
        &self.state
    }

    /// Current status of an account's session.
    pub fn status(&self, account: &str) -> SessionStatus {
        self.sessions
            .get(account)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// A copy of an account's session, if one was ever started.
    pub fn session(&self, account: &str) -> Option<SessionState> {
        self.sessions.get(account).map(|s| s.clone())
    }

    /// Check the session out for `step`, failing without side effects when it
    /// is not in the `expected` state.
    ///
    /// The map keeps a placeholder with the status and scope until
    /// [`commit`](Self::commit), so no shard lock is held while the stores
    /// or the provenance filter run.
    fn checkout(
        &self,
        account: &str,
        step: &'static str,
        expected: SessionStatus,
    ) -> Result<SessionState> {
        let actual = match self.sessions.get_mut(account) {
            Some(session) if session.in_step => {
                tracing::error!(account = %account, step, "Sync step called while another is running");
                return Err(Error::StepInProgress {
                    account: account.to_string(),
                    step,
                });
            }
            Some(mut session) if session.status == expected => {
                let placeholder = SessionState {
                    status: session.status,
                    oob_scope: session.oob_scope.clone(),
                    in_step: true,
                    ..SessionState::default()
                };
                return Ok(std::mem::replace(&mut *session, placeholder));
            }
            Some(session) => session.status,
            None => SessionStatus::Inactive,
        };

        tracing::error!(
            account = %account,
            step,
            expected = %expected,
            actual = %actual,
            "Sync step called out of order"
        );
        Err(Error::ProtocolViolation {
            account: account.to_string(),
            step,
            expected,
            actual,
        })
    }

    /// Put a checked-out session back. If the session was aborted, purged or
    /// cleared meanwhile, that outcome stands and `session` is dropped.
    fn commit(&self, account: &str, session: SessionState) {
        match self.sessions.get_mut(account) {
            Some(mut slot) if slot.in_step => *slot = session,
            _ => tracing::warn!(account = %account, "Session reset during a step, result discarded"),
        }
    }

    /// Reset the checked-out session, put it back and return `err`.
    fn fail<T>(
        &self,
        account: &str,
        step: &'static str,
        mut session: SessionState,
        err: Error,
    ) -> Result<T> {
        tracing::error!(account = %account, step, error = %err, "Sync step failed, session reset");
        session.reset();
        self.commit(account, session);
        Err(err)
    }

    fn already_active(account: &str) -> Error {
        tracing::error!(account = %account, "Sync session already active");
        Error::SessionActive(account.to_string())
    }

    /// Step 1: start a session.
    ///
    /// The side-store scope is `oob_key` when given, otherwise
    /// `"<syncTarget>-<accountId>"`.
    pub fn init(&self, account: &str, oob_key: Option<&str>) -> Result<()> {
        let scope = oob_key
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_oob_scope(account));

        if self.sessions.get(account).is_some_and(|s| s.is_active()) {
            return Err(Self::already_active(account));
        }

        if !self.records.is_available() {
            tracing::error!(account = %account, "Local record store unavailable");
            return Err(Error::StoreUnavailable);
        }

        match self.sessions.entry(account.to_string()) {
            Entry::Occupied(existing) if existing.get().is_active() => {
                Err(Self::already_active(account))
            }
            entry => {
                tracing::debug!(account = %account, scope = %scope, "Sync session initialized");
                entry.insert(SessionState::initialized(scope));
                Ok(())
            }
        }
    }

    /// Step 2: load persisted state. Returns the previous `remoteSince`,
    /// the point after which the adapter should fetch remote changes.
    pub fn read_state(&self, account: &str) -> Result<Option<Timestamp>> {
        let mut session = self.checkout(account, "readState", SessionStatus::Initialized)?;

        let persisted = match PersistedState::load(self.state.as_ref(), &session.oob_scope) {
            Ok(persisted) => persisted,
            Err(e) => return self.fail(account, "readState", session, e),
        };

        session.remote_since = persisted.remote_since;
        session.local_since = persisted.local_since;
        session.prev_remote = persisted.prev_remote;
        session.exported_ids = persisted.exported_ids;
        session.new_remote_since = Some(self.clock.now());
        session.status = SessionStatus::ReadSyncStateData;

        tracing::info!(
            account = %account,
            remote_since = ?session.remote_since,
            local_since = ?session.local_since,
            snapshot = session.prev_remote.len(),
            exported = session.exported_ids.len(),
            "Read sync state"
        );
        let remote_since = session.remote_since;
        self.commit(account, session);
        Ok(remote_since)
    }

    /// Step 4: reconcile the remote report against the retained snapshot and
    /// write the result to the record store. Returns the number of records
    /// written.
    pub fn store_remote_changes(
        &self,
        account: &str,
        remote_deleted: &[Record],
        remote_added_or_modified: &[Record],
    ) -> Result<usize> {
        let mut session =
            self.checkout(account, "storeRemoteChanges", SessionStatus::ReadSyncStateData)?;

        let mut exported_ids = session.exported_ids.clone();
        let RemoteDelta {
            mut pairs,
            mutated_prev_remote,
            stats,
        } = reconcile_remote(
            &session.prev_remote,
            remote_deleted,
            remote_added_or_modified,
            &mut exported_ids,
        );
        tracing::debug!(account = %account, ?stats, "Reconciled remote changes");

        if !pairs.is_empty() {
            if let Err(e) = self.records.store_sync_records(
                &self.config.sync_target,
                ConflictPolicy::PreserveLocalChanges,
                &mut pairs,
            ) {
                return self.fail(account, "storeRemoteChanges", session, Error::RecordStore(e));
            }
        }

        // The store fills in local and detail identifiers on write.
        let mut mutated = mutated_prev_remote;
        let index = IdentityIndex::for_snapshot(&mutated);
        for updated in pairs.iter().filter_map(|p| p.updated.as_ref()) {
            if let Some(i) = updated.guid().and_then(|g| index.by_guid(g)) {
                mutated[i] = updated.clone();
            }
        }

        session.mutated_prev_remote = mutated;
        session.mutated = true;
        session.exported_ids = exported_ids;
        session.status = SessionStatus::StoredRemoteChanges;

        let written = pairs.len();
        tracing::info!(account = %account, written, "Stored remote changes");
        self.commit(account, session);
        Ok(written)
    }

    /// Step 5: collect local changes to push to the remote.
    pub fn determine_local_changes(&self, account: &str) -> Result<LocalChanges> {
        let mut session = self.checkout(
            account,
            "determineLocalChanges",
            SessionStatus::StoredRemoteChanges,
        )?;

        let fetched = match self.records.fetch_sync_records(
            &self.config.sync_target,
            session.local_since,
            &session.exported_ids,
        ) {
            Ok(fetched) => fetched,
            Err(e) => {
                return self.fail(account, "determineLocalChanges", session, Error::RecordStore(e))
            }
        };

        let changes = local::determine_local_changes(account, &mut session, fetched, &self.filter);
        session.status = SessionStatus::DeterminedLocalChanges;

        tracing::info!(account = %account, changes = changes.len(), "Determined local changes");
        self.commit(account, session);
        Ok(changes)
    }

    /// Step 7: persist the new snapshot and watermarks and finish the cycle.
    pub fn store_sync_state(&self, account: &str) -> Result<()> {
        let mut session = self.checkout(
            account,
            "storeSyncStateData",
            SessionStatus::DeterminedLocalChanges,
        )?;

        let local_since = session
            .mutated_prev_remote
            .iter()
            .filter_map(Record::last_modified)
            .max()
            .or(session.new_remote_since);

        let persisted = PersistedState {
            remote_since: session.new_remote_since,
            local_since,
            prev_remote: std::mem::take(&mut session.mutated_prev_remote),
            exported_ids: std::mem::take(&mut session.exported_ids),
        };
        if let Err(e) = persisted.save(self.state.as_ref(), &session.oob_scope) {
            return self.fail(account, "storeSyncStateData", session, e);
        }

        tracing::info!(
            account = %account,
            remote_since = ?persisted.remote_since,
            local_since = ?persisted.local_since,
            snapshot = persisted.prev_remote.len(),
            "Stored sync state"
        );
        session.reset();
        self.commit(account, session);
        Ok(())
    }

    /// Forget everything persisted for `account` and reset its session, so
    /// the next cycle is a clean sync.
    ///
    /// Uses the scope of the account's last session, or the default scope
    /// when it never had one.
    pub fn purge(&self, account: &str) -> Result<()> {
        let scope = self
            .sessions
            .get(account)
            .map(|s| s.oob_scope.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.config.default_oob_scope(account));
        self.abort(account);

        PersistedState::purge(self.state.as_ref(), &scope).inspect_err(|e| {
            tracing::error!(account = %account, scope = %scope, error = %e, "Failed to purge sync state");
        })?;
        tracing::info!(account = %account, scope = %scope, "Purged sync state");
        Ok(())
    }

    /// Reset the session without touching persisted state.
    pub fn abort(&self, account: &str) {
        if let Some(mut session) = self.sessions.get_mut(account) {
            if session.is_active() {
                tracing::warn!(account = %account, status = %session.status, "Sync session aborted");
            }
            session.reset();
        }
    }

    /// Purge `account` and forget it entirely.
    pub fn clear_account(&self, account: &str) -> Result<()> {
        let result = self.purge(account);
        self.sessions.remove(account);
        result
    }
}
