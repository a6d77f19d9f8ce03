//! Raft storage: in-memory log, metadata FSM application, durable
//! snapshots.
//!
//! The log and vote state live in memory; durability comes from snapshots
//! persisted through an object store rooted at `<data_dir>/raft/` (an
//! in-memory store under dev mode). Snapshot writes use a temp-file plus
//! rename commit so a crash mid-write never leaves a half snapshot behind.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::types::{RaftNodeId, TypeConfig};
use crate::fsm::{MetadataFsm, MetadataRequest, MetadataResponse};

/// Snapshot metadata persisted alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    snapshot_id: String,
}

/// The latest snapshot, cached in memory.
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

/// Combined log and state machine storage for raft.
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    fsm: Arc<MetadataFsm>,
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    snapshot_path: ObjectPath,
}

fn storage_read_error(e: impl std::fmt::Display) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn storage_write_error(e: impl std::fmt::Display) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

impl RaftStore {
    /// Create a store applying committed entries to `fsm`, with snapshots
    /// persisted under `snapshot_prefix` in `object_store`.
    pub fn new(
        fsm: Arc<MetadataFsm>,
        object_store: Arc<dyn ObjectStore>,
        snapshot_prefix: &str,
    ) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            fsm,
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            snapshot_path: ObjectPath::from(snapshot_prefix),
        }
    }

    fn share(&self) -> Self {
        Self {
            vote: self.vote.clone(),
            log: self.log.clone(),
            last_purged_log_id: self.last_purged_log_id.clone(),
            fsm: self.fsm.clone(),
            last_applied_log: self.last_applied_log.clone(),
            last_membership: self.last_membership.clone(),
            cached_snapshot: self.cached_snapshot.clone(),
            object_store: self.object_store.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }

    fn data_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.snapshot", self.snapshot_path))
    }

    fn meta_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.meta", self.snapshot_path))
    }

    /// Load the latest snapshot from the object store on startup.
    ///
    /// Returns `Ok(true)` when a snapshot was restored, `Ok(false)` on a
    /// clean start. A snapshot that exists but cannot be read back is
    /// corruption and fails startup rather than silently losing state.
    pub async fn load_snapshot_from_store(&self) -> Result<bool, StorageError<RaftNodeId>> {
        self.cleanup_temp_files().await;

        let meta_bytes = match self.object_store.get(&self.meta_path()).await {
            Ok(result) => result.bytes().await.map_err(|e| {
                error!(error = %e, "snapshot metadata exists but could not be read");
                storage_read_error(e)
            })?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!("no existing snapshot found (clean start)");
                return Ok(false);
            }
            Err(e) => {
                error!(error = %e, "failed to access snapshot metadata");
                return Err(storage_read_error(e));
            }
        };

        let metadata: SnapshotMetadata = bincode::deserialize(&meta_bytes).map_err(|e| {
            error!(error = %e, "snapshot metadata is corrupted");
            storage_read_error(e)
        })?;

        let data_bytes = match self.object_store.get(&self.data_path()).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| {
                    error!(error = %e, "snapshot data exists but could not be read");
                    storage_read_error(e)
                })?
                .to_vec(),
            Err(object_store::Error::NotFound { .. }) => {
                error!(
                    snapshot_id = %metadata.snapshot_id,
                    "snapshot metadata exists but the data file is missing"
                );
                return Err(storage_read_error("snapshot data file missing"));
            }
            Err(e) => {
                error!(error = %e, "failed to access snapshot data");
                return Err(storage_read_error(e));
            }
        };

        self.fsm
            .restore(&data_bytes)
            .await
            .map_err(storage_read_error)?;
        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: metadata.last_log_id,
            last_membership: metadata.last_membership,
            snapshot_id: metadata.snapshot_id,
        };
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "restored snapshot"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta,
            data: data_bytes,
        });

        Ok(true)
    }

    /// Delete temp files orphaned by a crash mid snapshot write. Temp files
    /// are never referenced by a committed snapshot, so this is safe at any
    /// time.
    async fn cleanup_temp_files(&self) {
        let mut listing = self.object_store.list(Some(&self.snapshot_path));
        let mut temp_files = Vec::new();
        while let Some(entry) = listing.next().await {
            match entry {
                Ok(meta) => {
                    let path = meta.location.to_string();
                    if path.contains("/temp-")
                        && (path.ends_with(".snapshot") || path.ends_with(".meta"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => debug!(error = %e, "error listing snapshot files during cleanup"),
            }
        }
        for path in temp_files {
            match self.object_store.delete(&path).await {
                Ok(()) => info!(path = %path, "cleaned up orphaned temp snapshot file"),
                Err(e) => debug!(error = %e, path = %path, "failed to delete temp file"),
            }
        }
    }

    /// Move a temp object into its final location. Prefers rename; falls
    /// back to copy + delete on backends without native rename.
    async fn promote(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> Result<(), StorageError<RaftNodeId>> {
        if let Err(rename_err) = self.object_store.rename(from, to).await {
            self.object_store.copy(from, to).await.map_err(|e| {
                error!(error = %e, from = %from, to = %to, "failed to commit snapshot file");
                storage_write_error(e)
            })?;
            let _ = self.object_store.delete(from).await;
            debug!(error = %rename_err, "used copy+delete fallback (rename not supported)");
        }
        Ok(())
    }

    /// Persist a snapshot: data and metadata are written to temp paths and
    /// promoted data-first, so the metadata file acts as the commit marker.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<RaftNodeId>> {
        let temp_data = ObjectPath::from(format!(
            "{}/temp-{}.snapshot",
            self.snapshot_path, meta.snapshot_id
        ));
        let temp_meta = ObjectPath::from(format!(
            "{}/temp-{}.meta",
            self.snapshot_path, meta.snapshot_id
        ));

        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes = bincode::serialize(&metadata).map_err(storage_write_error)?;

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(storage_write_error)?;
        if let Err(e) = self
            .object_store
            .put(&temp_meta, Bytes::from(meta_bytes).into())
            .await
        {
            let _ = self.object_store.delete(&temp_data).await;
            return Err(storage_write_error(e));
        }

        self.promote(&temp_data, &self.data_path()).await?;
        self.promote(&temp_meta, &self.meta_path()).await?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "persisted snapshot"
        );
        Ok(())
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.share()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().last().map(|e| e.log_id);
        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<MetadataResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            *self.last_applied_log.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => responses.push(MetadataResponse::Noop),
                EntryPayload::Normal(encoded) => {
                    // A committed entry that does not decode means replicas
                    // disagree on the wire format; refuse to apply it.
                    let request = MetadataRequest::decode(encoded).map_err(|e| {
                        error!(
                            log_index = entry.log_id.index,
                            error = %e,
                            "undecodable log entry"
                        );
                        StorageError::from_io_error(
                            openraft::ErrorSubject::Apply(entry.log_id),
                            openraft::ErrorVerb::Read,
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                        )
                    })?;
                    responses.push(self.fsm.apply(request).await);
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(MetadataResponse::Noop);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.share()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();

        self.fsm.restore(&data).await.map_err(storage_read_error)?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        let cached = self.cached_snapshot.read().await;
        Ok(cached.as_ref().map(|snapshot| Snapshot {
            meta: snapshot.meta.clone(),
            snapshot: Box::new(Cursor::new(snapshot.data.clone())),
        }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let data = self.fsm.snapshot().await.map_err(storage_write_error)?;

        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        let snapshot_id = format!("snapshot-{}", last_applied.map(|l| l.index).unwrap_or(0));

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        self.persist_snapshot(&meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{HealthCheck, Node, RegisterNodeRequest};
    use object_store::memory::InMemory;
    use openraft::{RaftLogReader, RaftSnapshotBuilder};

    fn create_test_store() -> RaftStore {
        RaftStore::new(
            Arc::new(MetadataFsm::new()),
            Arc::new(InMemory::new()),
            "test/snapshots",
        )
    }

    fn make_log_id(term: u64, node: u64, index: u64) -> LogId<RaftNodeId> {
        LogId::new(openraft::CommittedLeaderId::new(term, node), index)
    }

    fn make_entry(index: u64, payload: EntryPayload<TypeConfig>) -> Entry<TypeConfig> {
        Entry {
            log_id: make_log_id(1, 0, index),
            payload,
        }
    }

    fn register_node_entry(index: u64, node_id: i32) -> Entry<TypeConfig> {
        let request = MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: Node {
                id: node_id,
                address: format!("127.0.0.1:{}", 9092 + node_id),
                meta: Default::default(),
                check: HealthCheck::alive(node_id),
            },
        });
        make_entry(index, EntryPayload::Normal(request.encode().unwrap()))
    }

    #[tokio::test]
    async fn test_save_and_read_vote() {
        let mut store = create_test_store();
        assert!(store.read_vote().await.unwrap().is_none());

        let vote = Vote::new(1, 42);
        store.save_vote(&vote).await.unwrap();
        let read = store.read_vote().await.unwrap().unwrap();
        assert_eq!(read.leader_id().voted_for(), Some(42));
    }

    #[tokio::test]
    async fn test_log_append_conflict_and_purge() {
        let mut store = create_test_store();
        store
            .append_to_log((1..=4).map(|i| make_entry(i, EntryPayload::Blank)))
            .await
            .unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 4);

        store
            .delete_conflict_logs_since(make_log_id(1, 0, 3))
            .await
            .unwrap();
        let entries = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(entries.len(), 2);

        store.purge_logs_upto(make_log_id(1, 0, 1)).await.unwrap();
        let entries = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id.index, 2);
    }

    #[tokio::test]
    async fn test_apply_decodes_and_updates_fsm() {
        let mut store = create_test_store();
        let responses = store
            .apply_to_state_machine(&[
                make_entry(1, EntryPayload::Blank),
                register_node_entry(2, 7),
            ])
            .await
            .unwrap();

        assert_eq!(responses[0], MetadataResponse::Noop);
        assert_eq!(responses[1], MetadataResponse::NodeRegistered { node_id: 7 });
        assert!(store.fsm.state().await.get_node(7).is_some());
        assert_eq!(store.last_applied_log.read().await.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_apply_rejects_undecodable_entry() {
        let mut store = create_test_store();
        let garbage = make_entry(1, EntryPayload::Normal(vec![0xfe, 0x01]));
        assert!(store.apply_to_state_machine(&[garbage]).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_persists_and_restores() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        {
            let mut store = RaftStore::new(
                Arc::new(MetadataFsm::new()),
                object_store.clone(),
                "persistence-test",
            );
            store
                .apply_to_state_machine(&[register_node_entry(1, 42)])
                .await
                .unwrap();
            store.build_snapshot().await.unwrap();
        }

        let store = RaftStore::new(
            Arc::new(MetadataFsm::new()),
            object_store,
            "persistence-test",
        );
        assert!(store.load_snapshot_from_store().await.unwrap());
        let state = store.fsm.state().await;
        assert_eq!(state.get_node(42).unwrap().address, "127.0.0.1:9134");
    }

    #[tokio::test]
    async fn test_load_snapshot_clean_start() {
        let store = create_test_store();
        assert!(!store.load_snapshot_from_store().await.unwrap());
    }

    #[tokio::test]
    async fn test_get_current_snapshot_after_build() {
        let mut store = create_test_store();
        store
            .apply_to_state_machine(&[register_node_entry(1, 1)])
            .await
            .unwrap();
        let built = store.build_snapshot().await.unwrap();

        let current = store.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, built.meta.snapshot_id);
    }
}
