//! Raft types, log storage, and the quota state machine for one shard.
//!
//! Each shard is an independent replicated state machine over the alloc
//! records it owns. Log entries and votes live in memory; the applied state
//! is persisted per entry — record plus applied-index bookkeeping in a
//! single transaction — so a replica resumes from its own disk or from a
//! leader snapshot without replaying history it has already seen.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in Trait) rather than
//! `async_trait::async_trait`. Implementations of its traits must use plain
//! `async fn` — NOT `#[async_trait]` — to match the expected signature.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, ErrorSubject, ErrorVerb, LogId, LogState, RaftLogId, Snapshot,
    SnapshotMeta, StorageError as RaftStorageError, StorageIOError, StoredMembership, TokioRuntime,
    Vote,
};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alloc_local::QuotaRecord;
use crate::error::StorageError;
use crate::rate::quota_id;

// ── Type configuration ─────────────────────────────────────────────────────────

/// A replicated quota mutation. Reads never enter the log; they go through
/// the linearizable-read path and consult the state machine directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuotaCommand {
    Alloc {
        namespace: String,
        resource: String,
        tokens: i64,
        version: i64,
    },
    Free {
        namespace: String,
        resource: String,
        tokens: i64,
        version: i64,
    },
    RegisterQuota {
        namespace: String,
        resource: String,
        capacity: i64,
    },
}

/// State-machine response after applying a command. Domain errors travel in
/// `err` so transport bytes alone reconstruct them at the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaCommandResult {
    pub remaining_tokens: i64,
    pub current_version: i64,
    pub ok: bool,
    pub err: String,
}

impl QuotaCommandResult {
    fn from_outcome(result: Result<(i64, i64, bool), StorageError>) -> Self {
        match result {
            Ok((remaining_tokens, current_version, ok)) => Self {
                remaining_tokens,
                current_version,
                ok,
                err: String::new(),
            },
            Err(e) => Self {
                err: e.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn into_storage_result(self) -> Result<(i64, i64, bool), StorageError> {
        if self.err.is_empty() {
            Ok((self.remaining_tokens, self.current_version, self.ok))
        } else {
            Err(StorageError::from_wire(&self.err))
        }
    }
}

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls (including `Responder` via `OneshotResponder`).
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = QuotaCommand,
        R            = QuotaCommandResult,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Shard assignment for a quota key.
pub fn shard_id_for_key(key: &str, shards: u64) -> u64 {
    (crc32fast::hash(key.as_bytes()) as u64 % shards) + 1
}

pub fn shard_id_for_quota(namespace: &str, resource: &str, shards: u64) -> u64 {
    shard_id_for_key(&quota_id(namespace, resource), shards)
}

// ── Persisted shard data ───────────────────────────────────────────────────────

const QUOTAS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const APPLIED_ENTRY_INDEX_KEY: &str = "__applied_entry_index__";
const APPLIED_LOG_ID_KEY: &str = "__applied_log_id__";
const MEMBERSHIP_KEY: &str = "__membership__";
const VOTE_KEY: &str = "__vote__";

const DB_FILE: &str = "shard.redb";

/// Everything a snapshot carries: the full key→record map plus the log
/// position it reflects.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ShardSnapshotData {
    pub records: Vec<(String, i64, i64, i64)>,
    pub applied_log_id: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, BasicNode>,
}

/// The durable half of one shard: quota records and raft bookkeeping in a
/// transactional store.
pub struct ShardData {
    db: Database,
    dir: PathBuf,
}

impl ShardData {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Corrupt {
            key: dir.display().to_string(),
            reason: format!("failed to create shard dir: {}", e),
        })?;

        let db = Database::create(dir.join(DB_FILE))?;

        let txn = db.begin_write()?;
        txn.open_table(QUOTAS_TABLE)?;
        txn.open_table(META_TABLE)?;
        txn.commit()?;

        Ok(Self { db, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn view(&self, namespace: &str, resource: &str) -> Result<(i64, i64, i64), StorageError> {
        let id = quota_id(namespace, resource);

        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUOTAS_TABLE)?;
        let guard = table.get(id.as_str())?.ok_or(StorageError::NotFound)?;
        let record = QuotaRecord::decode(&id, guard.value())?;

        Ok((record.allocated, record.capacity, record.version))
    }

    /// Applies one committed command, writing the mutated record and the
    /// applied-index bookkeeping in the same transaction.
    pub fn apply_command(
        &self,
        cmd: &QuotaCommand,
        log_id: LogId<NodeId>,
    ) -> QuotaCommandResult {
        let result = match cmd {
            QuotaCommand::Alloc {
                namespace,
                resource,
                tokens,
                version,
            } => self.mutate(namespace, resource, *version, log_id, |record| {
                let new_allocated = record.allocated + tokens;
                (new_allocated <= record.capacity).then_some(new_allocated)
            }),
            QuotaCommand::Free {
                namespace,
                resource,
                tokens,
                version,
            } => self.mutate(namespace, resource, *version, log_id, |record| {
                let new_allocated = record.allocated - tokens;
                (new_allocated >= 0).then_some(new_allocated)
            }),
            QuotaCommand::RegisterQuota {
                namespace,
                resource,
                capacity,
            } => self
                .register_quota(namespace, resource, *capacity, log_id)
                .map(|_| (0, 0, true)),
        };

        QuotaCommandResult::from_outcome(result)
    }

    fn mutate(
        &self,
        namespace: &str,
        resource: &str,
        version: i64,
        log_id: LogId<NodeId>,
        apply: impl FnOnce(&QuotaRecord) -> Option<i64>,
    ) -> Result<(i64, i64, bool), StorageError> {
        let id = quota_id(namespace, resource);

        let txn = self.db.begin_write()?;
        let outcome;
        {
            let mut table = txn.open_table(QUOTAS_TABLE)?;
            let record = {
                let guard = table.get(id.as_str())?.ok_or(StorageError::NotFound)?;
                QuotaRecord::decode(&id, guard.value())?
            };

            if version != 0 && record.version != version {
                // The version check failed, but the entry is still applied:
                // advance the log position so replay stays idempotent.
                drop(table);
                Self::write_applied(&txn, log_id)?;
                txn.commit()?;
                return Err(StorageError::InvalidVersion);
            }

            match apply(&record) {
                None => {
                    outcome = (record.capacity - record.allocated, record.version, false);
                }
                Some(new_allocated) => {
                    let updated = QuotaRecord {
                        allocated: new_allocated,
                        capacity: record.capacity,
                        version: record.version + 1,
                    };
                    table.insert(id.as_str(), updated.encode().as_slice())?;
                    outcome = (
                        updated.capacity - updated.allocated,
                        updated.version,
                        true,
                    );
                }
            }
        }
        Self::write_applied(&txn, log_id)?;
        txn.commit()?;

        Ok(outcome)
    }

    fn register_quota(
        &self,
        namespace: &str,
        resource: &str,
        capacity: i64,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError> {
        let id = quota_id(namespace, resource);

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUOTAS_TABLE)?;
            if table.get(id.as_str())?.is_none() {
                let record = QuotaRecord {
                    allocated: 0,
                    capacity,
                    version: 1,
                };
                table.insert(id.as_str(), record.encode().as_slice())?;
            }
        }
        Self::write_applied(&txn, log_id)?;
        txn.commit()?;

        Ok(())
    }

    fn write_applied(
        txn: &redb::WriteTransaction,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError> {
        let mut meta = txn.open_table(META_TABLE)?;
        meta.insert(
            APPLIED_ENTRY_INDEX_KEY,
            log_id.index.to_be_bytes().as_slice(),
        )?;
        let encoded = serde_json::to_vec(&log_id).unwrap_or_default();
        meta.insert(APPLIED_LOG_ID_KEY, encoded.as_slice())?;
        Ok(())
    }

    pub fn applied_entry_index(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META_TABLE)?;
        match meta.get(APPLIED_ENTRY_INDEX_KEY)? {
            Some(guard) => {
                let raw = guard.value();
                let bytes: [u8; 8] = raw.try_into().map_err(|_| StorageError::Corrupt {
                    key: APPLIED_ENTRY_INDEX_KEY.to_string(),
                    reason: format!("expected 8 bytes, got {}", raw.len()),
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn applied_log_id(&self) -> Result<Option<LogId<NodeId>>, StorageError> {
        self.read_meta_json(APPLIED_LOG_ID_KEY)
    }

    pub fn membership(
        &self,
    ) -> Result<Option<StoredMembership<NodeId, BasicNode>>, StorageError> {
        self.read_meta_json(MEMBERSHIP_KEY)
    }

    pub fn save_membership(
        &self,
        membership: &StoredMembership<NodeId, BasicNode>,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META_TABLE)?;
            let encoded = serde_json::to_vec(membership).unwrap_or_default();
            meta.insert(MEMBERSHIP_KEY, encoded.as_slice())?;
        }
        Self::write_applied(&txn, log_id)?;
        txn.commit()?;
        Ok(())
    }

    pub fn vote(&self) -> Result<Option<Vote<NodeId>>, StorageError> {
        self.read_meta_json(VOTE_KEY)
    }

    pub fn save_vote(&self, vote: &Vote<NodeId>) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META_TABLE)?;
            let encoded = serde_json::to_vec(vote).unwrap_or_default();
            meta.insert(VOTE_KEY, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read_meta_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META_TABLE)?;
        match meta.get(key)? {
            Some(guard) => {
                let value =
                    serde_json::from_slice(guard.value()).map_err(|e| StorageError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// The full record map, for snapshots.
    pub fn all_records(&self) -> Result<Vec<(String, i64, i64, i64)>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUOTAS_TABLE)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let id = key.value().to_string();
            let record = QuotaRecord::decode(&id, value.value())?;
            records.push((id, record.allocated, record.capacity, record.version));
        }

        Ok(records)
    }

    /// Replaces the entire shard content with the snapshot's, in one
    /// transaction. Restoring S and replaying entries after its applied
    /// index converges with replaying everything from scratch.
    pub fn install(&self, snapshot: &ShardSnapshotData) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUOTAS_TABLE)?;
            // redb 2 has no truncate; drain the table through its key list.
            let existing: Vec<String> = {
                let mut keys = Vec::new();
                for item in table.iter()? {
                    let (key, _) = item?;
                    keys.push(key.value().to_string());
                }
                keys
            };
            for key in existing {
                table.remove(key.as_str())?;
            }

            for (id, allocated, capacity, version) in &snapshot.records {
                let record = QuotaRecord {
                    allocated: *allocated,
                    capacity: *capacity,
                    version: *version,
                };
                table.insert(id.as_str(), record.encode().as_slice())?;
            }

            let mut meta = txn.open_table(META_TABLE)?;
            if let Some(log_id) = snapshot.applied_log_id {
                meta.insert(
                    APPLIED_ENTRY_INDEX_KEY,
                    log_id.index.to_be_bytes().as_slice(),
                )?;
                let encoded = serde_json::to_vec(&log_id).unwrap_or_default();
                meta.insert(APPLIED_LOG_ID_KEY, encoded.as_slice())?;
            }
            let encoded = serde_json::to_vec(&snapshot.last_membership).unwrap_or_default();
            meta.insert(MEMBERSHIP_KEY, encoded.as_slice())?;
        }
        txn.commit()?;

        Ok(())
    }

    pub fn snapshot_data(&self) -> Result<ShardSnapshotData, StorageError> {
        Ok(ShardSnapshotData {
            records: self.all_records()?,
            applied_log_id: self.applied_log_id()?,
            last_membership: self.membership()?.unwrap_or_default(),
        })
    }
}

// ── Combined storage (openraft v1 RaftStorage) ────────────────────────────────

fn io_error<E: std::error::Error + 'static>(e: E) -> RaftStorageError<NodeId> {
    StorageIOError::new(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        AnyError::new(&e),
    )
    .into()
}

/// Combined raft storage for one shard: in-memory log entries and votes
/// cached over the durable vote record, with the state machine in [`ShardData`].
///
/// Wrapped by `openraft::storage::Adaptor::new(store)` to produce the v2
/// `(RaftLogStorage, RaftStateMachine)` split required by `Raft::new`.
pub struct ShardStore {
    log: BTreeMap<u64, Entry<TypeConfig>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot: Option<Snapshot<TypeConfig>>,
    data: Arc<ShardData>,
}

impl ShardStore {
    /// Opens the shard at `dir`, resuming from whatever the state machine
    /// already holds. With an empty log, the applied position doubles as the
    /// purge watermark so the log appears compacted up to it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data = Arc::new(ShardData::open(dir)?);

        let last_applied = data.applied_log_id()?;
        let last_membership = data.membership()?.unwrap_or_default();
        let vote = data.vote()?;

        if let Some(applied) = last_applied {
            info!(
                dir = %data.dir().display(),
                applied_index = applied.index,
                "resuming shard from local state"
            );
        }

        Ok(Self {
            log: BTreeMap::new(),
            vote,
            committed: None,
            last_purged: last_applied,
            last_applied,
            last_membership,
            snapshot: None,
            data,
        })
    }

    /// Handle to the durable half, shared with the linearizable read path.
    pub fn data(&self) -> Arc<ShardData> {
        Arc::clone(&self.data)
    }
}

// RaftStorage v1 requires the store to implement RaftLogReader directly.
impl RaftLogReader<TypeConfig> for ShardStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, RaftStorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct ShardLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for ShardLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, RaftStorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder — serialises the shard's durable state.
pub struct ShardSnapshotBuilder {
    data: Arc<ShardData>,
}

impl RaftSnapshotBuilder<TypeConfig> for ShardSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, RaftStorageError<NodeId>> {
        let snapshot_data = self.data.snapshot_data().map_err(io_error)?;
        let bytes = serde_json::to_vec(&snapshot_data).map_err(io_error)?;

        let snapshot_id = snapshot_data
            .applied_log_id
            .map(|lid| lid.to_string())
            .unwrap_or_else(|| "0".to_string());

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: snapshot_data.applied_log_id,
                last_membership: snapshot_data.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation for `ShardStore`.
impl RaftStorage<TypeConfig> for ShardStore {
    type LogReader = ShardLogReader;
    type SnapshotBuilder = ShardSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), RaftStorageError<NodeId>> {
        self.data.save_vote(vote).map_err(io_error)?;
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, RaftStorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, RaftStorageError<NodeId>> {
        let last = self
            .log
            .values()
            .next_back()
            .map(|e| *e.get_log_id())
            .or(self.last_purged);
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), RaftStorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<NodeId>>, RaftStorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        ShardLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), RaftStorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), RaftStorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), RaftStorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>),
        RaftStorageError<NodeId>,
    > {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<QuotaCommandResult>, RaftStorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let log_id = *entry.get_log_id();
            self.last_applied = Some(log_id);

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(QuotaCommandResult {
                        ok: true,
                        ..Default::default()
                    });
                }
                openraft::EntryPayload::Normal(cmd) => {
                    responses.push(self.data.apply_command(cmd, log_id));
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership = StoredMembership::new(Some(log_id), m.clone());
                    self.data
                        .save_membership(&self.last_membership, log_id)
                        .map_err(io_error)?;
                    responses.push(QuotaCommandResult {
                        ok: true,
                        ..Default::default()
                    });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        ShardSnapshotBuilder { data: self.data() }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, RaftStorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), RaftStorageError<NodeId>> {
        let mut snapshot_data: ShardSnapshotData =
            serde_json::from_slice(snapshot.get_ref()).map_err(io_error)?;
        snapshot_data.applied_log_id = meta.last_log_id;
        snapshot_data.last_membership = meta.last_membership.clone();

        self.data.install(&snapshot_data).map_err(io_error)?;

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.snapshot = Some(Snapshot {
            meta: meta.clone(),
            snapshot,
        });

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, RaftStorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload};

    fn log_id(index: u64) -> LogId<NodeId> {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn entry(index: u64, cmd: QuotaCommand) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    fn register(namespace: &str, resource: &str, capacity: i64) -> QuotaCommand {
        QuotaCommand::RegisterQuota {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            capacity,
        }
    }

    fn alloc(namespace: &str, resource: &str, tokens: i64, version: i64) -> QuotaCommand {
        QuotaCommand::Alloc {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            tokens,
            version,
        }
    }

    #[test]
    fn shard_assignment_is_stable_and_in_range() {
        for shards in [1u64, 4, 16] {
            for key in ["svc_req", "pool_mem", "a_b"] {
                let id = shard_id_for_key(key, shards);
                assert!(id >= 1 && id <= shards);
                assert_eq!(id, shard_id_for_key(key, shards));
            }
        }
        assert_eq!(
            shard_id_for_quota("svc", "req", 4),
            shard_id_for_key("svc_req", 4)
        );
    }

    #[tokio::test]
    async fn applies_commands_and_tracks_the_applied_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ShardStore::open(dir.path()).unwrap();

        let responses = store
            .apply_to_state_machine(&[
                entry(1, register("pool", "mem", 10)),
                entry(2, alloc("pool", "mem", 3, 1)),
            ])
            .await
            .unwrap();

        assert!(responses[0].ok);
        assert!(responses[1].ok);
        assert_eq!(responses[1].remaining_tokens, 7);
        assert_eq!(responses[1].current_version, 2);

        let data = store.data();
        assert_eq!(data.view("pool", "mem").unwrap(), (3, 10, 2));
        assert_eq!(data.applied_entry_index().unwrap(), 2);
    }

    #[tokio::test]
    async fn version_mismatch_is_reported_in_the_result_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ShardStore::open(dir.path()).unwrap();

        store
            .apply_to_state_machine(&[entry(1, register("pool", "mem", 10))])
            .await
            .unwrap();

        let responses = store
            .apply_to_state_machine(&[entry(2, alloc("pool", "mem", 1, 9))])
            .await
            .unwrap();

        assert!(!responses[0].ok);
        assert!(responses[0].err.contains("invalid version"));
        assert!(matches!(
            responses[0].clone().into_storage_result(),
            Err(StorageError::InvalidVersion)
        ));

        // State untouched, applied index advanced anyway.
        let data = store.data();
        assert_eq!(data.view("pool", "mem").unwrap(), (0, 10, 1));
        assert_eq!(data.applied_entry_index().unwrap(), 2);
    }

    #[tokio::test]
    async fn reopening_resumes_from_the_applied_position() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = ShardStore::open(dir.path()).unwrap();
            store
                .apply_to_state_machine(&[
                    entry(1, register("pool", "mem", 10)),
                    entry(2, alloc("pool", "mem", 4, 0)),
                ])
                .await
                .unwrap();
        }

        let mut reopened = ShardStore::open(dir.path()).unwrap();
        let (applied, _) = reopened.last_applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(2)));
        assert_eq!(reopened.data().view("pool", "mem").unwrap(), (4, 10, 2));

        // The empty log reports itself compacted up to the applied position.
        let state = reopened.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(2)));
        assert_eq!(state.last_log_id, Some(log_id(2)));
    }

    #[tokio::test]
    async fn snapshot_restore_reproduces_the_state() {
        let source_dir = tempfile::tempdir().unwrap();
        let mut source = ShardStore::open(source_dir.path()).unwrap();

        source
            .apply_to_state_machine(&[
                entry(1, register("pool", "mem", 10)),
                entry(2, register("svc", "conn", 5)),
                entry(3, alloc("pool", "mem", 2, 0)),
            ])
            .await
            .unwrap();

        let mut builder = source.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(3)));

        let target_dir = tempfile::tempdir().unwrap();
        let mut target = ShardStore::open(target_dir.path()).unwrap();
        let meta = snapshot.meta.clone();
        target
            .install_snapshot(&meta, snapshot.snapshot)
            .await
            .unwrap();

        let data = target.data();
        assert_eq!(data.view("pool", "mem").unwrap(), (2, 10, 3));
        assert_eq!(data.view("svc", "conn").unwrap(), (0, 5, 1));
        assert_eq!(data.applied_entry_index().unwrap(), 3);

        let (applied, _) = target.last_applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(3)));
    }

    #[tokio::test]
    async fn snapshot_install_replaces_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ShardStore::open(dir.path()).unwrap();

        store
            .apply_to_state_machine(&[
                entry(1, register("stale", "key", 3)),
                entry(2, alloc("stale", "key", 1, 0)),
            ])
            .await
            .unwrap();

        let snapshot_data = ShardSnapshotData {
            records: vec![("fresh_key".to_string(), 0, 8, 1)],
            applied_log_id: Some(log_id(9)),
            last_membership: StoredMembership::default(),
        };
        store.data().install(&snapshot_data).unwrap();

        assert!(matches!(
            store.data().view("stale", "key"),
            Err(StorageError::NotFound)
        ));
        assert_eq!(store.data().view("fresh", "key").unwrap(), (0, 8, 1));
        assert_eq!(store.data().applied_entry_index().unwrap(), 9);
    }

    #[tokio::test]
    async fn vote_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vote = Vote::new(3, 42);

        {
            let mut store = ShardStore::open(dir.path()).unwrap();
            RaftStorage::save_vote(&mut store, &vote).await.unwrap();
            assert_eq!(store.read_vote().await.unwrap(), Some(vote));
        }

        let mut reopened = ShardStore::open(dir.path()).unwrap();
        assert_eq!(reopened.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn register_quota_replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ShardStore::open(dir.path()).unwrap();

        store
            .apply_to_state_machine(&[
                entry(1, register("pool", "mem", 10)),
                entry(2, alloc("pool", "mem", 3, 0)),
                // A duplicate registration must not reset the bucket.
                entry(3, register("pool", "mem", 10)),
            ])
            .await
            .unwrap();

        assert_eq!(store.data().view("pool", "mem").unwrap(), (3, 10, 2));
    }

    #[test]
    fn command_serialization_round_trips() {
        let cmd = alloc("pool", "mem", 3, 1);
        let raw = serde_json::to_vec(&cmd).unwrap();
        assert!(matches!(
            serde_json::from_slice::<QuotaCommand>(&raw).unwrap(),
            QuotaCommand::Alloc { tokens: 3, .. }
        ));

        let result = QuotaCommandResult {
            remaining_tokens: 7,
            current_version: 2,
            ok: true,
            err: String::new(),
        };
        let raw = serde_json::to_vec(&result).unwrap();
        let parsed: QuotaCommandResult = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed.into_storage_result().unwrap(), (7, 2, true));
    }
}
