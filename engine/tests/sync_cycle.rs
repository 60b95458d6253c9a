//! Full sync cycles against an in-memory remote.
//!
//! The loopback remote behaves like a minimal remote service: it stamps
//! GUIDs on creation, keeps the group-id cross-reference it was given, and
//! reports changes newer than a watermark.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use twoway_engine::{
    format_guid, Detail, DetailKind, EngineConfig, Error, LocalChanges, ManualClock,
    MemoryRecordStore, MemoryStateStore, PersistedState, Record, RemoteChanges, Result,
    SessionStatus, SyncAdapter, SyncEngine, Timestamp,
};

type Engine = SyncEngine<MemoryRecordStore, MemoryStateStore>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct RemoteRow {
    record: Record,
    modified: Timestamp,
    deleted: bool,
}

struct LoopbackRemote {
    account: String,
    clock: Arc<ManualClock>,
    rows: BTreeMap<String, RemoteRow>,
    next_id: u64,
    fail_fetch: bool,
}

impl LoopbackRemote {
    fn new(account: &str, clock: Arc<ManualClock>) -> Self {
        Self {
            account: account.to_string(),
            clock,
            rows: BTreeMap::new(),
            next_id: 0,
            fail_fetch: false,
        }
    }

    fn tick(&self) -> Timestamp {
        self.clock.advance(Duration::seconds(1))
    }

    /// What the remote keeps of a pushed record.
    fn sanitize(record: &Record) -> Record {
        Record {
            id: None,
            details: record
                .details
                .iter()
                .filter(|d| !d.is_ignorable())
                .map(|d| Detail {
                    id: None,
                    ..d.clone()
                })
                .collect(),
        }
    }

    fn create(&mut self, record: &Record) -> String {
        self.next_id += 1;
        let remote_id = format!("r{}", self.next_id);
        let guid = format_guid(&self.account, &remote_id);
        let mut record = Self::sanitize(record);
        record.set_guid(guid.clone());
        let modified = self.tick();
        self.rows.insert(
            remote_id,
            RemoteRow {
                record,
                modified,
                deleted: false,
            },
        );
        guid
    }

    fn find_mut(&mut self, record: &Record) -> Option<&mut RemoteRow> {
        let group_id = record.group_id().or(record.id.as_deref());
        let key = self
            .rows
            .iter()
            .find(|(_, row)| {
                !row.deleted
                    && match record.guid() {
                        Some(guid) => row.record.guid() == Some(guid),
                        None => group_id.is_some() && row.record.group_id() == group_id,
                    }
            })
            .map(|(k, _)| k.clone())?;
        self.rows.get_mut(&key)
    }

    fn edit(&mut self, guid: &str, edit: impl FnOnce(&mut Record)) {
        let modified = self.tick();
        let row = self
            .rows
            .values_mut()
            .find(|r| r.record.guid() == Some(guid))
            .expect("remote record");
        edit(&mut row.record);
        row.modified = modified;
    }

    fn delete(&mut self, guid: &str) {
        let modified = self.tick();
        let row = self
            .rows
            .values_mut()
            .find(|r| r.record.guid() == Some(guid))
            .expect("remote record");
        row.deleted = true;
        row.modified = modified;
    }

    fn live(&self) -> Vec<&Record> {
        self.rows
            .values()
            .filter(|r| !r.deleted)
            .map(|r| &r.record)
            .collect()
    }

    fn get(&self, guid: &str) -> Option<&Record> {
        self.live().into_iter().find(|r| r.guid() == Some(guid))
    }
}

#[async_trait]
impl SyncAdapter for LoopbackRemote {
    async fn determine_remote_changes(
        &mut self,
        _account: &str,
        remote_since: Option<Timestamp>,
    ) -> Result<RemoteChanges> {
        if self.fail_fetch {
            return Err(Error::Adapter("remote unreachable".into()));
        }

        let mut changes = RemoteChanges::default();
        for row in self.rows.values() {
            let changed = remote_since.map_or(true, |since| row.modified > since);
            match (changed, row.deleted) {
                (true, true) if remote_since.is_some() => changes.deleted.push(row.record.clone()),
                (true, false) => changes.added_or_modified.push(row.record.clone()),
                _ => {}
            }
        }
        Ok(changes)
    }

    async fn upsync_local_changes(&mut self, _account: &str, changes: &LocalChanges) -> Result<()> {
        for record in &changes.added {
            self.create(record);
        }
        for record in &changes.modified {
            let modified = self.tick();
            let sanitized = Self::sanitize(record);
            if let Some(row) = self.find_mut(record) {
                let guid = row.record.guid().map(str::to_string);
                row.record = sanitized;
                if let Some(guid) = guid {
                    row.record.set_guid(guid);
                }
                row.modified = modified;
            }
        }
        for record in &changes.deleted {
            let modified = self.tick();
            if let Some(row) = self.find_mut(record) {
                row.deleted = true;
                row.modified = modified;
            }
        }
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    remote: LoopbackRemote,
}

impl Harness {
    fn new(account: &str) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
        ));
        let engine = SyncEngine::new(
            EngineConfig::new("twoway"),
            Arc::new(MemoryRecordStore::new(clock.clone())),
            Arc::new(MemoryStateStore::new()),
        )
        .with_clock(clock.clone());
        let remote = LoopbackRemote::new(account, clock.clone());
        Self {
            engine,
            clock,
            remote,
        }
    }

    fn store(&self) -> &MemoryRecordStore {
        self.engine.records()
    }

    fn persisted(&self, account: &str) -> PersistedState {
        PersistedState::load(
            self.engine.state_store().as_ref(),
            &self.engine.config().default_oob_scope(account),
        )
        .unwrap()
    }

    async fn cycle(&mut self, account: &str) -> twoway_engine::SyncSummary {
        self.engine
            .run_cycle(&mut self.remote, account, None)
            .await
            .unwrap()
    }

    /// A local record created by the user and synced twice, so it carries
    /// the GUID the remote assigned. Returns `(localId, guid)`.
    async fn synced_local_record(&mut self) -> (String, String) {
        let id = self
            .store()
            .insert_local(
                Record::new()
                    .with_detail(Detail::name("Alice", "Smith"))
                    .with_detail(Detail::phone("555-0100")),
                Some("twoway"),
            )
            .unwrap();
        self.cycle("acct").await;
        self.cycle("acct").await;
        let guid = self
            .store()
            .get(&id)
            .and_then(|r| r.guid().map(str::to_string))
            .expect("guid assigned");
        (id, guid)
    }
}

#[tokio::test]
async fn local_addition_round_trips_its_guid() {
    let mut h = Harness::new("acct");
    let id = h
        .store()
        .insert_local(Record::new().with_detail(Detail::name("X", "")), Some("twoway"))
        .unwrap();

    let summary = h.cycle("acct").await;
    assert_eq!(summary.upsynced_added, 1);
    assert_eq!(h.persisted("acct").exported_ids, vec![id.clone()]);
    let pushed = h.remote.live()[0].clone();
    assert_eq!(pushed.group_id(), Some(id.as_str()));
    let guid = pushed.guid().unwrap().to_string();

    let summary = h.cycle("acct").await;
    assert_eq!(summary.stored_remote, 1);
    assert_eq!(summary.upsynced_added + summary.upsynced_modified, 0);

    let local = h.store().get(&id).unwrap();
    assert_eq!(local.guid(), Some(guid.as_str()));
    let persisted = h.persisted("acct");
    assert_eq!(persisted.prev_remote.len(), 1);
    assert_eq!(persisted.prev_remote[0].guid(), Some(guid.as_str()));
    assert!(persisted.exported_ids.is_empty());
    assert_eq!(h.store().len(), 1);
    assert_eq!(h.remote.live().len(), 1);
}

#[tokio::test]
async fn quiet_cycle_changes_nothing() {
    let mut h = Harness::new("acct");
    h.synced_local_record().await;
    let before = h.persisted("acct");

    let summary = h.cycle("acct").await;
    assert_eq!(summary, twoway_engine::SyncSummary::default());
    let after = h.persisted("acct");
    assert_eq!(after.prev_remote, before.prev_remote);
    assert_eq!(after.local_since, before.local_since);
}

#[tokio::test]
async fn remote_addition_is_stored_locally() {
    let mut h = Harness::new("acct");
    let guid = h
        .remote
        .create(&Record::new().with_detail(Detail::name("Bob", "Jones")));

    let summary = h.cycle("acct").await;
    assert_eq!(summary.stored_remote, 1);
    assert_eq!(summary.upsynced_added + summary.upsynced_modified, 0);

    let local = h.store().find_by_guid(&guid).unwrap();
    assert_eq!(local.sync_target(), Some("twoway"));
    assert!(local.detail(DetailKind::Name).is_some());
}

#[tokio::test]
async fn remote_edit_keeps_detail_identity() {
    let mut h = Harness::new("acct");
    let (id, guid) = h.synced_local_record().await;
    let phone_id = h.store().get(&id).unwrap().detail(DetailKind::PhoneNumber).unwrap().id.clone();

    h.remote.edit(&guid, |r| {
        r.details.retain(|d| d.kind != DetailKind::PhoneNumber);
        r.details.push(Detail::phone("555-0199"));
    });
    let summary = h.cycle("acct").await;
    assert_eq!(summary.stored_remote, 1);
    assert_eq!(summary.upsynced_modified, 0);

    let local = h.store().get(&id).unwrap();
    let phone = local.detail(DetailKind::PhoneNumber).unwrap();
    assert!(phone.same_values(&Detail::phone("555-0199")));
    assert_eq!(phone.id, phone_id);
}

#[tokio::test]
async fn local_edit_is_pushed_once() {
    let mut h = Harness::new("acct");
    let (id, guid) = h.synced_local_record().await;

    h.clock.advance(Duration::seconds(10));
    h.store()
        .modify_local(&id, |r| r.details.push(Detail::email("alice@example.org")))
        .unwrap();

    let summary = h.cycle("acct").await;
    assert_eq!(summary.upsynced_modified, 1);
    assert!(h
        .remote
        .get(&guid)
        .unwrap()
        .detail(DetailKind::EmailAddress)
        .is_some());

    // The remote echoes the edit back; it matches the snapshot.
    let summary = h.cycle("acct").await;
    assert_eq!(summary.stored_remote, 0);
    assert_eq!(summary.upsynced_modified, 0);
}

#[tokio::test]
async fn concurrent_edits_of_different_fields_merge() {
    let mut h = Harness::new("acct");
    let (id, guid) = h.synced_local_record().await;

    h.clock.advance(Duration::seconds(10));
    h.store()
        .modify_local(&id, |r| r.details.push(Detail::note("met at conference")))
        .unwrap();
    h.remote.edit(&guid, |r| r.details.push(Detail::url("https://alice.example.org")));

    let summary = h.cycle("acct").await;
    assert_eq!(summary.stored_remote, 1);
    assert_eq!(summary.upsynced_modified, 1);

    let local = h.store().get(&id).unwrap();
    assert!(local.detail(DetailKind::Note).is_some());
    assert!(local.detail(DetailKind::Url).is_some());
    let remote = h.remote.get(&guid).unwrap();
    assert!(remote.detail(DetailKind::Note).is_some());
    assert!(remote.detail(DetailKind::Url).is_some());
}

#[tokio::test]
async fn remote_deletion_removes_local_record() {
    let mut h = Harness::new("acct");
    let (id, guid) = h.synced_local_record().await;

    h.remote.delete(&guid);
    let summary = h.cycle("acct").await;
    assert_eq!(summary.stored_remote, 1);
    assert_eq!(summary.upsynced_deleted, 0);
    assert!(h.store().get(&id).is_none());
    assert!(h.persisted("acct").prev_remote.is_empty());
}

#[tokio::test]
async fn remote_deletion_leaves_other_records() {
    let mut h = Harness::new("acct");
    let keep = h.remote.create(&Record::new().with_detail(Detail::name("Keep", "")));
    let drop = h.remote.create(&Record::new().with_detail(Detail::name("Drop", "")));
    h.cycle("acct").await;
    assert_eq!(h.store().len(), 2);

    h.remote.delete(&drop);
    h.cycle("acct").await;

    let snapshot = h.persisted("acct").prev_remote;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].guid(), Some(keep.as_str()));
    assert!(h.store().find_by_guid(&keep).is_some());
    assert!(h.store().find_by_guid(&drop).is_none());
}

#[tokio::test]
async fn local_deletion_is_pushed() {
    let mut h = Harness::new("acct");
    let (id, guid) = h.synced_local_record().await;

    h.clock.advance(Duration::seconds(10));
    h.store().delete_local(&id).unwrap();

    let summary = h.cycle("acct").await;
    assert_eq!(summary.upsynced_deleted, 1);
    assert!(h.remote.get(&guid).is_none());
    assert!(h.persisted("acct").prev_remote.is_empty());
}

#[tokio::test]
async fn remote_edit_of_locally_deleted_record_is_not_resurrected() {
    let mut h = Harness::new("acct");
    let (id, guid) = h.synced_local_record().await;

    h.clock.advance(Duration::seconds(10));
    h.store().delete_local(&id).unwrap();
    h.remote.edit(&guid, |r| r.details.push(Detail::note("remote note")));

    let summary = h.cycle("acct").await;
    assert_eq!(summary.upsynced_deleted, 1);
    assert!(h.store().get(&id).is_none());
    assert!(h.store().is_empty());
}

#[tokio::test]
async fn adapter_failure_leaves_state_untouched() {
    let mut h = Harness::new("acct");
    h.synced_local_record().await;
    let before = h.persisted("acct");

    h.remote.fail_fetch = true;
    let err = h
        .engine
        .run_cycle(&mut h.remote, "acct", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Adapter(_)));
    assert_eq!(h.engine.status("acct"), SessionStatus::Inactive);
    assert_eq!(h.persisted("acct"), before);

    h.remote.fail_fetch = false;
    h.cycle("acct").await;
}

#[tokio::test]
async fn store_failure_aborts_cycle_and_next_cycle_recovers() {
    let mut h = Harness::new("acct");
    let guid = h.remote.create(&Record::new().with_detail(Detail::name("Bob", "")));

    h.store().fail_next_write();
    let err = h
        .engine
        .run_cycle(&mut h.remote, "acct", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordStore(_)));
    assert_eq!(h.engine.status("acct"), SessionStatus::Inactive);
    assert!(h.store().is_empty());

    h.cycle("acct").await;
    assert!(h.store().find_by_guid(&guid).is_some());
}

#[tokio::test]
async fn purge_forces_clean_sync() {
    let mut h = Harness::new("acct");
    h.synced_local_record().await;
    assert!(h.persisted("acct").local_since.is_some());

    h.engine.purge("acct").unwrap();
    assert_eq!(h.persisted("acct"), PersistedState::default());

    h.engine.init("acct", None).unwrap();
    assert_eq!(h.engine.read_state("acct").unwrap(), None);
    let session = h.engine.session("acct").unwrap();
    assert!(session.local_since.is_none());
    assert!(session.prev_remote.is_empty());
}

#[tokio::test]
async fn foreign_records_are_not_pushed() {
    let mut h = Harness::new("acct");
    h.synced_local_record().await;

    // A record synced by another account shares the sync target.
    let foreign = h
        .store()
        .insert_local(
            Record::new()
                .with_guid("other:9")
                .with_detail(Detail::name("Eve", "")),
            Some("twoway"),
        )
        .unwrap();
    h.clock.advance(Duration::seconds(10));
    h.store()
        .modify_local(&foreign, |r| r.details.push(Detail::note("x")))
        .unwrap();

    let summary = h.cycle("acct").await;
    assert_eq!(summary.upsynced_modified, 0);
    assert_eq!(summary.upsynced_added, 0);
    assert_eq!(h.remote.live().len(), 1);
}

#[tokio::test]
async fn accounts_sync_concurrently() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
    ));
    let engine = SyncEngine::new(
        EngineConfig::new("twoway"),
        Arc::new(MemoryRecordStore::new(clock.clone())),
        Arc::new(MemoryStateStore::new()),
    )
    .with_clock(clock.clone());

    let mut a = LoopbackRemote::new("a", clock.clone());
    let mut b = LoopbackRemote::new("b", clock.clone());
    let guid_a = a.create(&Record::new().with_detail(Detail::name("Ann", "")));
    let guid_b = b.create(&Record::new().with_detail(Detail::name("Ben", "")));

    let (ra, rb) = tokio::join!(
        engine.run_cycle(&mut a, "a", None),
        engine.run_cycle(&mut b, "b", None)
    );
    assert_eq!(ra.unwrap().stored_remote, 1);
    assert_eq!(rb.unwrap().stored_remote, 1);

    let scope = |account: &str| engine.config().default_oob_scope(account);
    let state_a = PersistedState::load(engine.state_store().as_ref(), &scope("a")).unwrap();
    let state_b = PersistedState::load(engine.state_store().as_ref(), &scope("b")).unwrap();
    assert_eq!(state_a.prev_remote.len(), 1);
    assert_eq!(state_a.prev_remote[0].guid(), Some(guid_a.as_str()));
    assert_eq!(state_b.prev_remote.len(), 1);
    assert_eq!(state_b.prev_remote[0].guid(), Some(guid_b.as_str()));
    assert_eq!(engine.records().len(), 2);
}
