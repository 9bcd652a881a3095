//! Per-path fingerprints and sync timestamps, persisted under the hidden
//! metadata directory of a working root.
//!
//! The store answers the two change-detection questions the helpers ask:
//! "did this change locally since the last sync" and "did this change
//! remotely since the last sync", without comparing content.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use dxsync_core::{Artifact, ArtifactKind, SyncError};

pub const METADATA_DIR: &str = ".metadata";
const HASHES_FILE: &str = "hashes.json";
const LAST_PULL_FILE: &str = "last-pull.json";
const LAST_PUSH_FILE: &str = "last-push.json";

/// Mutations are buffered in memory and flushed at most this often; runs
/// call [`HashStore::flush`] on completion to make the tail durable.
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashRecord {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pulled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pushed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Pull,
    Push,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedHashes {
    records: BTreeMap<String, BTreeMap<String, HashRecord>>,
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<String, BTreeMap<String, HashRecord>>,
    pull_at: BTreeMap<String, DateTime<Utc>>,
    push_at: BTreeMap<String, DateTime<Utc>>,
    dirty: bool,
    last_flush: Option<Instant>,
}

pub struct HashStore {
    metadata_dir: PathBuf,
    state: Mutex<State>,
}

impl HashStore {
    /// Open (or start) the store for a working root. Unreadable persistence
    /// is treated as absent: the worst case is re-transferring artifacts.
    pub async fn open(working_root: &Path) -> Result<Self, SyncError> {
        let metadata_dir = working_root.join(METADATA_DIR);
        fs::create_dir_all(&metadata_dir).await.map_err(|err| SyncError::LocalIo {
            context: format!("creating {}", metadata_dir.display()),
            source: err,
        })?;

        let records = match read_json::<PersistedHashes>(&metadata_dir.join(HASHES_FILE)).await {
            Some(persisted) => persisted.records,
            None => BTreeMap::new(),
        };
        let pull_at = read_json(&metadata_dir.join(LAST_PULL_FILE)).await.unwrap_or_default();
        let push_at = read_json(&metadata_dir.join(LAST_PUSH_FILE)).await.unwrap_or_default();

        Ok(Self {
            metadata_dir,
            state: Mutex::new(State {
                records,
                pull_at,
                push_at,
                dirty: false,
                last_flush: None,
            }),
        })
    }

    /// Upsert the fingerprint for a path after a successful transfer.
    pub async fn record(
        &self,
        kind: ArtifactKind,
        path: &str,
        md5: Option<&str>,
        resource_id: Option<&str>,
        remote_last_modified: Option<DateTime<Utc>>,
        direction: SyncDirection,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .entry(kind.label().to_string())
            .or_default()
            .entry(path.to_string())
            .or_insert_with(|| HashRecord {
                path: path.to_string(),
                md5: None,
                resource_id: None,
                last_pulled_at: None,
                last_pushed_at: None,
                remote_last_modified: None,
            });

        if let Some(md5) = md5 {
            record.md5 = Some(md5.to_string());
        }
        if let Some(resource_id) = resource_id {
            record.resource_id = Some(resource_id.to_string());
        }
        if remote_last_modified.is_some() {
            record.remote_last_modified = remote_last_modified;
        }
        match direction {
            SyncDirection::Pull => record.last_pulled_at = Some(Utc::now()),
            SyncDirection::Push => record.last_pushed_at = Some(Utc::now()),
        }

        state.dirty = true;
        self.maybe_flush(&mut state).await
    }

    pub async fn lookup(&self, kind: ArtifactKind, path: &str) -> Option<HashRecord> {
        let state = self.state.lock().await;
        state.records.get(kind.label())?.get(path).cloned()
    }

    /// True when no fingerprint exists or the current content hash differs
    /// from the hash recorded at the last successful sync.
    pub async fn is_local_modified(
        &self,
        kind: ArtifactKind,
        path: &str,
        current_md5: &str,
    ) -> bool {
        match self.lookup(kind, path).await {
            Some(record) => record.md5.as_deref() != Some(current_md5),
            None => true,
        }
    }

    /// True when no fingerprint exists, the server timestamp moved past the
    /// recorded one, or the server hash differs from the recorded hash.
    pub async fn is_remote_modified(&self, kind: ArtifactKind, artifact: &Artifact) -> bool {
        let Some(path) = artifact.path.as_deref().or(artifact.id.as_deref()) else {
            return true;
        };
        let Some(record) = self.lookup(kind, path).await else {
            return true;
        };
        if let (Some(remote), Some(known)) = (artifact.last_modified, record.remote_last_modified) {
            if remote > known {
                return true;
            }
        }
        if let Some(md5) = artifact.md5.as_deref() {
            if record.md5.as_deref() != Some(normalize_md5(md5).as_str()) {
                return true;
            }
        }
        false
    }

    pub async fn known_paths(&self, kind: ArtifactKind) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state
            .records
            .get(kind.label())
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the remote side of a fingerprint after a remote delete.
    pub async fn mark_remote_absent(
        &self,
        kind: ArtifactKind,
        path: &str,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .records
            .get_mut(kind.label())
            .and_then(|records| records.get_mut(path))
        {
            record.remote_last_modified = None;
            record.resource_id = None;
            state.dirty = true;
        }
        self.maybe_flush(&mut state).await
    }

    pub async fn last_pull_at(&self, kind: ArtifactKind) -> Option<DateTime<Utc>> {
        self.state.lock().await.pull_at.get(kind.label()).copied()
    }

    pub async fn last_push_at(&self, kind: ArtifactKind) -> Option<DateTime<Utc>> {
        self.state.lock().await.push_at.get(kind.label()).copied()
    }

    pub async fn set_last_pull_at(
        &self,
        kind: ArtifactKind,
        when: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.pull_at.insert(kind.label().to_string(), when);
        state.dirty = true;
        self.maybe_flush(&mut state).await
    }

    pub async fn set_last_push_at(
        &self,
        kind: ArtifactKind,
        when: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.push_at.insert(kind.label().to_string(), when);
        state.dirty = true;
        self.maybe_flush(&mut state).await
    }

    /// Write any buffered mutations out now.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if state.dirty {
            self.write_all(&mut state).await?;
        }
        Ok(())
    }

    async fn maybe_flush(&self, state: &mut State) -> Result<(), SyncError> {
        let due = match state.last_flush {
            Some(at) => at.elapsed() >= FLUSH_INTERVAL,
            None => true,
        };
        if state.dirty && due {
            self.write_all(state).await?;
        }
        Ok(())
    }

    async fn write_all(&self, state: &mut State) -> Result<(), SyncError> {
        let hashes = PersistedHashes {
            records: state.records.clone(),
        };
        write_json_atomic(&self.metadata_dir.join(HASHES_FILE), &hashes).await?;
        write_json_atomic(&self.metadata_dir.join(LAST_PULL_FILE), &state.pull_at).await?;
        write_json_atomic(&self.metadata_dir.join(LAST_PUSH_FILE), &state.push_at).await?;
        state.dirty = false;
        state.last_flush = Some(Instant::now());
        Ok(())
    }
}

/// Normalize an md5 given in either hex or base64 form to lowercase hex,
/// the encoding records are stored in.
pub fn normalize_md5(value: &str) -> String {
    if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        return value.to_ascii_lowercase();
    }
    match base64::engine::general_purpose::STANDARD.decode(value) {
        Ok(raw) if raw.len() == 16 => hex::encode(raw),
        _ => value.to_string(),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let text = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable metadata file");
            None
        }
    }
}

/// Readers see either the previous or the new document, never a torn one.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    let parent = path.parent().expect("metadata files always have a parent");
    let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| SyncError::Body(format!("serializing {}: {err}", path.display())))?;
    fs::write(&temp, &bytes).await.map_err(|err| SyncError::LocalIo {
        context: format!("writing {}", temp.display()),
        source: err,
    })?;
    match fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp).await;
            Err(SyncError::LocalIo {
                context: format!("renaming {} over {}", temp.display(), path.display()),
                source: err,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn asset(path: &str, md5: &str, modified: &str) -> Artifact {
        Artifact {
            path: Some(path.to_string()),
            md5: Some(md5.to_string()),
            last_modified: Some(modified.parse().unwrap()),
            ..Artifact::default()
        }
    }

    #[tokio::test]
    async fn record_then_lookup_round_trips() {
        let dir = tempdir().unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        store
            .record(
                ArtifactKind::Asset,
                "/images/a.png",
                Some("abc123"),
                Some("r1"),
                Some("2024-05-01T10:00:00Z".parse().unwrap()),
                SyncDirection::Push,
            )
            .await
            .unwrap();

        let record = store.lookup(ArtifactKind::Asset, "/images/a.png").await.unwrap();
        assert_eq!(record.md5.as_deref(), Some("abc123"));
        assert_eq!(record.resource_id.as_deref(), Some("r1"));
        assert!(record.last_pushed_at.is_some());
        assert!(record.last_pulled_at.is_none());
    }

    #[tokio::test]
    async fn local_modified_tracks_md5_changes() {
        let dir = tempdir().unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        assert!(store.is_local_modified(ArtifactKind::Asset, "/a", "m1").await);

        store
            .record(ArtifactKind::Asset, "/a", Some("m1"), None, None, SyncDirection::Pull)
            .await
            .unwrap();
        assert!(!store.is_local_modified(ArtifactKind::Asset, "/a", "m1").await);
        assert!(store.is_local_modified(ArtifactKind::Asset, "/a", "m2").await);
    }

    #[tokio::test]
    async fn remote_modified_tracks_timestamp_and_md5() {
        let dir = tempdir().unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        let seen = asset("/a", "m1", "2024-05-01T10:00:00Z");
        assert!(store.is_remote_modified(ArtifactKind::Asset, &seen).await);

        store
            .record(
                ArtifactKind::Asset,
                "/a",
                Some("m1"),
                None,
                seen.last_modified,
                SyncDirection::Pull,
            )
            .await
            .unwrap();
        assert!(!store.is_remote_modified(ArtifactKind::Asset, &seen).await);
        assert!(
            store
                .is_remote_modified(ArtifactKind::Asset, &asset("/a", "m1", "2024-05-02T10:00:00Z"))
                .await
        );
        assert!(
            store
                .is_remote_modified(ArtifactKind::Asset, &asset("/a", "m2", "2024-05-01T10:00:00Z"))
                .await
        );
    }

    #[tokio::test]
    async fn kinds_do_not_share_paths() {
        let dir = tempdir().unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        store
            .record(ArtifactKind::Asset, "/x", Some("m1"), None, None, SyncDirection::Pull)
            .await
            .unwrap();
        assert!(store.lookup(ArtifactKind::Content, "/x").await.is_none());
        assert_eq!(store.known_paths(ArtifactKind::Asset).await.len(), 1);
        assert!(store.known_paths(ArtifactKind::Content).await.is_empty());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = HashStore::open(dir.path()).await.unwrap();
            store
                .record(ArtifactKind::Content, "c1", Some("m1"), None, None, SyncDirection::Push)
                .await
                .unwrap();
            store
                .set_last_push_at(ArtifactKind::Content, "2024-05-01T10:00:00Z".parse().unwrap())
                .await
                .unwrap();
            store.flush().await.unwrap();
        }
        let reopened = HashStore::open(dir.path()).await.unwrap();
        assert!(reopened.lookup(ArtifactKind::Content, "c1").await.is_some());
        assert_eq!(
            reopened.last_push_at(ArtifactKind::Content).await,
            Some("2024-05-01T10:00:00Z".parse().unwrap())
        );
        assert_eq!(reopened.last_pull_at(ArtifactKind::Content).await, None);
    }

    #[tokio::test]
    async fn mark_remote_absent_clears_remote_fields_only() {
        let dir = tempdir().unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        store
            .record(
                ArtifactKind::Asset,
                "/a",
                Some("m1"),
                Some("r1"),
                Some(Utc::now()),
                SyncDirection::Push,
            )
            .await
            .unwrap();
        store.mark_remote_absent(ArtifactKind::Asset, "/a").await.unwrap();
        let record = store.lookup(ArtifactKind::Asset, "/a").await.unwrap();
        assert_eq!(record.md5.as_deref(), Some("m1"));
        assert!(record.resource_id.is_none());
        assert!(record.remote_last_modified.is_none());
    }

    #[test]
    fn md5_encodings_normalize_to_hex() {
        assert_eq!(
            normalize_md5("XrY7u+Ae7tCTyyK7j1rNww=="),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(
            normalize_md5("5EB63BBBE01EEED093CB22BB8F5ACDC3"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(normalize_md5("not-a-hash"), "not-a-hash");
    }

    #[tokio::test]
    async fn remote_modified_accepts_base64_md5() {
        let dir = tempdir().unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        store
            .record(
                ArtifactKind::Asset,
                "/a",
                Some("5eb63bbbe01eeed093cb22bb8f5acdc3"),
                None,
                Some("2024-05-01T10:00:00Z".parse().unwrap()),
                SyncDirection::Pull,
            )
            .await
            .unwrap();
        let same = asset("/a", "XrY7u+Ae7tCTyyK7j1rNww==", "2024-05-01T10:00:00Z");
        assert!(!store.is_remote_modified(ArtifactKind::Asset, &same).await);
    }

    #[tokio::test]
    async fn corrupt_persistence_starts_empty() {
        let dir = tempdir().unwrap();
        let metadata = dir.path().join(METADATA_DIR);
        std::fs::create_dir_all(&metadata).unwrap();
        std::fs::write(metadata.join(HASHES_FILE), b"{not json").unwrap();
        let store = HashStore::open(dir.path()).await.unwrap();
        assert!(store.lookup(ArtifactKind::Asset, "/a").await.is_none());
    }
}
