//! Per-kind orchestration of push and pull, between the REST adapter, the
//! filesystem adapter, and the hash store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dxsync_adapters::{ListFilter, PageCursor, RemoteStore, ResourceStore, ResourceUpload};
use dxsync_core::{
    validate_path, Artifact, ArtifactKind, AssetScope, ItemFailure, Options, SyncError,
};
use dxsync_storage::hash_store::{HashStore, SyncDirection};
use dxsync_storage::http::file_body_factory;
use dxsync_storage::local::{md5_digest, LocalStore};

use crate::driver::{self, BoxFut, DriverConfig, Summary};
use crate::events::{EventBus, SyncEvent};

/// Assets under this subtree carry a metadata sidecar next to the binary.
const CONTENT_ASSET_PREFIX: &str = "/dxdam/";

fn is_content_asset(path: &str) -> bool {
    path.starts_with(CONTENT_ASSET_PREFIX)
}

fn scope_allows(scope: AssetScope, path: &str) -> bool {
    match scope {
        AssetScope::Both => true,
        AssetScope::WebOnly => !is_content_asset(path),
        AssetScope::ContentOnly => is_content_asset(path),
    }
}

fn file_name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn local_not_found(path: &str) -> SyncError {
    SyncError::LocalIo {
        context: format!("{path} does not exist locally"),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such artifact"),
    }
}

/// One artifact kind's push/pull logic. Owns nothing persistent; the hash
/// store, local files, and adapters are injected collaborators.
pub struct ArtifactHelper {
    kind: ArtifactKind,
    remote: Arc<dyn RemoteStore>,
    resources: Option<Arc<dyn ResourceStore>>,
    local: Arc<dyn LocalStore>,
    hashes: Arc<HashStore>,
    events: Arc<EventBus>,
    driver: DriverConfig,
    cancel: CancellationToken,
}

impl ArtifactHelper {
    pub fn new(
        kind: ArtifactKind,
        remote: Arc<dyn RemoteStore>,
        resources: Option<Arc<dyn ResourceStore>>,
        local: Arc<dyn LocalStore>,
        hashes: Arc<HashStore>,
        driver: DriverConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            remote,
            resources,
            local,
            hashes,
            events: Arc::new(EventBus::new()),
            driver,
            cancel,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The name a remote artifact syncs under locally: the logical path for
    /// binary kinds, `<id>.json` for everything else.
    fn item_name(&self, artifact: &Artifact) -> Option<String> {
        if self.kind.is_binary() {
            artifact.path.clone()
        } else {
            artifact.id.as_ref().map(|id| format!("{id}.json"))
        }
    }

    // ---- pull ----

    pub async fn pull_one(
        self: &Arc<Self>,
        path: &str,
        opts: &Options,
    ) -> Result<Artifact, SyncError> {
        let outcome = self.pull_one_inner(path, opts).await;
        match &outcome {
            Ok(_) => self.events.emit(SyncEvent::Pulled, path, None),
            Err(err) => self.events.emit(SyncEvent::PulledError, path, Some(err)),
        }
        outcome
    }

    async fn pull_one_inner(&self, path: &str, opts: &Options) -> Result<Artifact, SyncError> {
        let artifact = self.resolve_remote(path, opts).await?;
        self.pull_artifact(&artifact, opts).await?;
        Ok(artifact)
    }

    /// Look up the remote artifact a local name refers to: by logical path
    /// for binary kinds, by id for everything else.
    pub async fn resolve_remote(&self, name: &str, opts: &Options) -> Result<Artifact, SyncError> {
        if self.kind.is_binary() {
            validate_path(name)?;
            self.find_remote_by_path(name, opts)
                .await?
                .ok_or_else(|| SyncError::RemoteNotFound {
                    what: format!("{} {name}", self.kind.label()),
                })
        } else {
            let id = name.strip_suffix(".json").unwrap_or(name);
            self.remote.get(id, opts).await
        }
    }

    pub async fn pull_all(self: &Arc<Self>, opts: &Options) -> Result<Summary, SyncError> {
        self.pull_with_filter(ListFilter::default(), opts).await
    }

    /// Pull only artifacts the server reports as modified since the last
    /// clean pull; advances the pull timestamp on clean completion.
    pub async fn pull_modified(self: &Arc<Self>, opts: &Options) -> Result<Summary, SyncError> {
        let since = match opts.since {
            Some(since) => Some(since),
            None => self.hashes.last_pull_at(self.kind).await,
        };
        let started = Utc::now();
        let summary = self
            .pull_with_filter(
                ListFilter {
                    modified_since: since,
                },
                opts,
            )
            .await?;
        if summary.clean() {
            self.hashes.set_last_pull_at(self.kind, started).await?;
        }
        Ok(summary)
    }

    async fn pull_with_filter(
        self: &Arc<Self>,
        filter: ListFilter,
        opts: &Options,
    ) -> Result<Summary, SyncError> {
        let first = PageCursor {
            offset: opts.offset.unwrap_or(0),
            limit: opts.limit.unwrap_or(PageCursor::default().limit),
        };

        let pager = self.clone();
        let page_opts = opts.clone();
        let fetch_page = move |cursor: PageCursor| -> BoxFut<
            Result<(Vec<Artifact>, Option<PageCursor>), SyncError>,
        > {
            let helper = pager.clone();
            let opts = page_opts.clone();
            Box::pin(async move {
                let page = helper.remote.list(cursor, filter, &opts).await?;
                let items = page
                    .items
                    .into_iter()
                    .filter(|artifact| {
                        if !helper.kind.is_binary() {
                            return true;
                        }
                        artifact
                            .path
                            .as_deref()
                            .map(|path| scope_allows(opts.asset_types, path))
                            .unwrap_or(true)
                    })
                    .collect();
                Ok((items, page.next))
            })
        };

        let worker = self.clone();
        let item_opts = opts.clone();
        let run_item = move |artifact: Artifact| -> BoxFut<Result<String, ItemFailure>> {
            let helper = worker.clone();
            let opts = item_opts.clone();
            Box::pin(async move {
                let name = helper
                    .item_name(&artifact)
                    .unwrap_or_else(|| artifact.display_name().to_string());
                match helper.pull_artifact(&artifact, &opts).await {
                    Ok(path) => {
                        helper.events.emit(SyncEvent::Pulled, &path, None);
                        Ok(path)
                    }
                    Err(err) => {
                        helper.events.emit(SyncEvent::PulledError, &name, Some(&err));
                        Err(ItemFailure::new(name, err))
                    }
                }
            })
        };

        let summary = driver::run(
            &self.driver,
            &self.cancel,
            Some(first),
            Vec::new(),
            fetch_page,
            run_item,
        )
        .await?;
        self.hashes.flush().await?;
        Ok(summary)
    }

    async fn pull_artifact(&self, artifact: &Artifact, opts: &Options) -> Result<String, SyncError> {
        if self.kind.is_binary() {
            self.pull_binary(artifact, opts).await
        } else {
            self.pull_metadata(artifact).await
        }
    }

    async fn pull_metadata(&self, artifact: &Artifact) -> Result<String, SyncError> {
        let logical = self.local.write_metadata(artifact).await?;
        let bytes = serde_json::to_vec_pretty(artifact)
            .map_err(|err| SyncError::Body(format!("serializing {}: {err}", logical)))?;
        let digest = md5_digest(&bytes);
        self.hashes
            .record(
                self.kind,
                &logical,
                Some(&digest.hex),
                None,
                artifact.last_modified,
                SyncDirection::Pull,
            )
            .await?;
        Ok(logical)
    }

    /// Stream the resource blob into a temp file and commit it atomically;
    /// nothing appears at the target path when the download fails.
    async fn pull_binary(&self, artifact: &Artifact, opts: &Options) -> Result<String, SyncError> {
        let path = artifact.path.as_deref().ok_or_else(|| {
            SyncError::Body("asset listing entry carries no path".to_string())
        })?;
        validate_path(path)?;
        let resources = self.require_resources()?;
        let resource_id = artifact.resource_id.as_deref().ok_or_else(|| {
            SyncError::Body(format!("asset {path} carries no resource id"))
        })?;

        let existed = self.local.exists(path).await;
        let mut pending = self.local.open_write(path).await?;
        if let Err(err) = resources.download(resource_id, pending.writer(), opts).await {
            pending.abort().await;
            return Err(err);
        }
        pending.commit().await?;

        if is_content_asset(path) {
            self.local.write_sidecar(path, artifact).await?;
        }
        let digest = self.local.content_digest(path).await?;
        self.hashes
            .record(
                self.kind,
                path,
                Some(&digest.hex),
                Some(resource_id),
                artifact.last_modified,
                SyncDirection::Pull,
            )
            .await?;
        if existed {
            self.events.emit(SyncEvent::Rewrote, path, None);
        }
        Ok(path.to_string())
    }

    async fn find_remote_by_path(
        &self,
        path: &str,
        opts: &Options,
    ) -> Result<Option<Artifact>, SyncError> {
        let mut cursor = Some(PageCursor {
            offset: 0,
            limit: opts.limit.unwrap_or(PageCursor::default().limit),
        });
        while let Some(current) = cursor {
            let page = self.remote.list(current, ListFilter::default(), opts).await?;
            if let Some(found) = page
                .items
                .iter()
                .find(|artifact| artifact.path.as_deref() == Some(path))
            {
                return Ok(Some(found.clone()));
            }
            cursor = page.next;
        }
        Ok(None)
    }

    // ---- push ----

    pub async fn push_one(
        self: &Arc<Self>,
        path: &str,
        opts: &Options,
    ) -> Result<Artifact, SyncError> {
        let outcome = if self.local.exists(path).await {
            self.push_item(path, opts).await
        } else {
            Err(local_not_found(path))
        };
        match &outcome {
            Ok(_) => self.events.emit(SyncEvent::Pushed, path, None),
            Err(err) => self.events.emit(SyncEvent::PushedError, path, Some(err)),
        }
        outcome
    }

    pub async fn push_all(self: &Arc<Self>, opts: &Options) -> Result<Summary, SyncError> {
        let items = self.local_item_names(opts).await?;
        self.push_items(items, opts).await
    }

    /// Push only artifacts whose content hash moved since the last sync;
    /// advances the push timestamp on clean completion.
    pub async fn push_modified(self: &Arc<Self>, opts: &Options) -> Result<Summary, SyncError> {
        let started = Utc::now();
        let mut modified = Vec::new();
        for name in self.local_item_names(opts).await? {
            let digest = self.local.content_digest(&name).await?;
            if self
                .hashes
                .is_local_modified(self.kind, &name, &digest.hex)
                .await
            {
                modified.push(name);
            }
        }
        debug!(
            kind = self.kind.label(),
            count = modified.len(),
            "locally modified artifacts"
        );
        let summary = self.push_items(modified, opts).await?;
        if summary.clean() {
            self.hashes.set_last_push_at(self.kind, started).await?;
        }
        Ok(summary)
    }

    async fn push_items(
        self: &Arc<Self>,
        items: Vec<String>,
        opts: &Options,
    ) -> Result<Summary, SyncError> {
        let worker = self.clone();
        let item_opts = opts.clone();
        let run_item = move |path: String| -> BoxFut<Result<String, ItemFailure>> {
            let helper = worker.clone();
            let opts = item_opts.clone();
            Box::pin(async move {
                match helper.push_item(&path, &opts).await {
                    Ok(_) => {
                        helper.events.emit(SyncEvent::Pushed, &path, None);
                        Ok(path)
                    }
                    Err(err) => {
                        helper.events.emit(SyncEvent::PushedError, &path, Some(&err));
                        let retry = opts.should_retry_push(&err);
                        Err(ItemFailure { path, error: err, retry })
                    }
                }
            })
        };

        let summary = driver::run(
            &self.driver,
            &self.cancel,
            None,
            items,
            |_| unreachable!("push runs enumerate locally and fetch no pages"),
            run_item,
        )
        .await?;
        self.hashes.flush().await?;
        Ok(summary)
    }

    async fn push_item(&self, path: &str, opts: &Options) -> Result<Artifact, SyncError> {
        if self.kind.is_binary() {
            self.push_binary(path, opts).await
        } else {
            self.push_metadata(path, opts).await
        }
    }

    /// Two-phase binary push: make sure the blob exists server-side (by
    /// fingerprint, probe, or upload), then create or update the metadata
    /// that points at it.
    async fn push_binary(&self, path: &str, opts: &Options) -> Result<Artifact, SyncError> {
        validate_path(path)?;
        let resources = self.require_resources()?;
        let digest = self.local.content_digest(path).await?;

        let sidecar = format!("{path}.json");
        let mut artifact = if self.local.exists(&sidecar).await {
            self.local.read_metadata(&sidecar).await?
        } else {
            Artifact::default()
        };
        artifact.path = Some(path.to_string());
        if artifact.name.is_none() {
            artifact.name = Some(file_name_of(path));
        }

        let known = self.hashes.lookup(self.kind, path).await;
        let resource_id = match known {
            Some(record)
                if record.md5.as_deref() == Some(digest.hex.as_str())
                    && record.resource_id.is_some() =>
            {
                // Byte-identical content was already uploaded.
                record.resource_id.unwrap()
            }
            _ => {
                if resources.head(&digest.hex, opts).await.unwrap_or(false) {
                    digest.hex.clone()
                } else {
                    let upload = ResourceUpload {
                        name: file_name_of(path),
                        length: digest.length,
                        digest: Some(digest.clone()),
                        factory: file_body_factory(self.local.resolve(path)),
                    };
                    resources.upload(&upload, opts).await?
                }
            }
        };

        artifact.resource_id = Some(resource_id.clone());
        artifact.md5 = Some(digest.base64.clone());

        let result = self.create_or_update(artifact, opts).await?;
        self.hashes
            .record(
                self.kind,
                path,
                Some(&digest.hex),
                Some(&resource_id),
                result.last_modified,
                SyncDirection::Push,
            )
            .await?;
        Ok(result)
    }

    async fn push_metadata(&self, path: &str, opts: &Options) -> Result<Artifact, SyncError> {
        let artifact = self.local.read_metadata(path).await?;
        let digest = self.local.content_digest(path).await?;
        let result = self.create_or_update(artifact, opts).await?;
        self.hashes
            .record(
                self.kind,
                path,
                Some(&digest.hex),
                None,
                result.last_modified,
                SyncDirection::Push,
            )
            .await?;
        Ok(result)
    }

    async fn create_or_update(
        &self,
        artifact: Artifact,
        opts: &Options,
    ) -> Result<Artifact, SyncError> {
        let outcome = if artifact.id.is_none() {
            self.remote.create(&artifact, opts).await
        } else {
            match self.remote.update(&artifact, opts).await {
                // Deleted underneath the update: recreate it instead.
                Err(err) if err.is_not_found() => {
                    let mut fresh = artifact.clone();
                    fresh.rev = None;
                    self.remote.create(&fresh, opts).await
                }
                other => other,
            }
        };

        match outcome {
            Ok(updated) => Ok(updated),
            // Already-exists is acceptable under createOnly.
            Err(err) if err.is_conflict() && opts.create_only => Ok(artifact),
            Err(err) => Err(err),
        }
    }

    async fn local_item_names(&self, opts: &Options) -> Result<Vec<String>, SyncError> {
        let items = self.local.enumerate().await?;
        Ok(items
            .into_iter()
            .map(|item| item.path)
            .filter(|path| !self.kind.is_binary() || scope_allows(opts.asset_types, path))
            .collect())
    }

    fn require_resources(&self) -> Result<&Arc<dyn ResourceStore>, SyncError> {
        self.resources.as_ref().ok_or_else(|| {
            SyncError::Body(format!(
                "{} helper has no resource store",
                self.kind.label()
            ))
        })
    }

    // ---- listing and deletion ----

    pub async fn list_remote_names(&self, opts: &Options) -> Result<BTreeSet<String>, SyncError> {
        self.collect_remote_names(ListFilter::default(), opts).await
    }

    pub async fn list_remote_modified_names(
        &self,
        opts: &Options,
    ) -> Result<BTreeSet<String>, SyncError> {
        let since = match opts.since {
            Some(since) => Some(since),
            None => self.hashes.last_pull_at(self.kind).await,
        };
        self.collect_remote_names(
            ListFilter {
                modified_since: since,
            },
            opts,
        )
        .await
    }

    /// Names we synced at some point that the server no longer lists.
    pub async fn list_remote_deleted_names(
        &self,
        opts: &Options,
    ) -> Result<BTreeSet<String>, SyncError> {
        let remote = self.list_remote_names(opts).await?;
        let known = self.hashes.known_paths(self.kind).await;
        Ok(known.difference(&remote).cloned().collect())
    }

    pub async fn list_local_names(&self, opts: &Options) -> Result<BTreeSet<String>, SyncError> {
        Ok(self.local_item_names(opts).await?.into_iter().collect())
    }

    pub async fn list_local_modified_names(
        &self,
        opts: &Options,
    ) -> Result<BTreeSet<String>, SyncError> {
        let mut modified = BTreeSet::new();
        for name in self.local_item_names(opts).await? {
            let digest = self.local.content_digest(&name).await?;
            if self
                .hashes
                .is_local_modified(self.kind, &name, &digest.hex)
                .await
            {
                modified.insert(name);
            }
        }
        Ok(modified)
    }

    /// Names we synced at some point that no longer exist locally.
    pub async fn list_local_deleted_names(
        &self,
        opts: &Options,
    ) -> Result<BTreeSet<String>, SyncError> {
        let local = self.list_local_names(opts).await?;
        let known = self.hashes.known_paths(self.kind).await;
        Ok(known.difference(&local).cloned().collect())
    }

    /// Enumerate raw resource ids through the by-created view. Only
    /// meaningful for the binary kind.
    pub async fn list_remote_resource_ids(
        &self,
        opts: &Options,
    ) -> Result<BTreeSet<String>, SyncError> {
        let resources = self.require_resources()?;
        let mut ids = BTreeSet::new();
        let mut cursor = Some(PageCursor {
            offset: 0,
            limit: opts.limit.unwrap_or(PageCursor::default().limit),
        });
        while let Some(current) = cursor {
            let page = resources.list_by_created(current, opts).await?;
            for item in &page.items {
                if let Some(id) = &item.id {
                    ids.insert(id.clone());
                }
            }
            cursor = page.next;
        }
        Ok(ids)
    }

    async fn collect_remote_names(
        &self,
        filter: ListFilter,
        opts: &Options,
    ) -> Result<BTreeSet<String>, SyncError> {
        let mut names = BTreeSet::new();
        let mut cursor = Some(PageCursor {
            offset: 0,
            limit: opts.limit.unwrap_or(PageCursor::default().limit),
        });
        while let Some(current) = cursor {
            let page = self.remote.list(current, filter, opts).await?;
            for artifact in &page.items {
                if let Some(name) = self.item_name(artifact) {
                    names.insert(name);
                }
            }
            cursor = page.next;
        }
        Ok(names)
    }

    pub async fn delete_remote(
        &self,
        artifact: &Artifact,
        opts: &Options,
    ) -> Result<String, SyncError> {
        let name = self
            .item_name(artifact)
            .unwrap_or_else(|| artifact.display_name().to_string());
        match self.remote.delete(artifact, opts).await {
            Ok(message) => {
                self.hashes.mark_remote_absent(self.kind, &name).await?;
                self.events.emit(SyncEvent::Deleted, &name, None);
                Ok(message)
            }
            Err(err) => {
                self.events.emit(SyncEvent::DeletedError, &name, Some(&err));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    use dxsync_adapters::{Page, ResourceHeaders};
    use dxsync_storage::local::{LocalFiles, WorkingDir};

    fn server_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap()
    }

    struct StubRemote {
        kind: ArtifactKind,
        calls: Mutex<Vec<String>>,
        create_results: Mutex<VecDeque<Result<Artifact, SyncError>>>,
        update_results: Mutex<VecDeque<Result<Artifact, SyncError>>>,
        pages: Mutex<VecDeque<Vec<Artifact>>>,
    }

    impl StubRemote {
        fn new(kind: ArtifactKind) -> Self {
            Self {
                kind,
                calls: Mutex::new(Vec::new()),
                create_results: Mutex::new(VecDeque::new()),
                update_results: Mutex::new(VecDeque::new()),
                pages: Mutex::new(VecDeque::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn echo(artifact: &Artifact) -> Artifact {
            let mut echoed = artifact.clone();
            if echoed.id.is_none() {
                echoed.id = Some("srv-1".to_string());
            }
            echoed.rev = Some("1-abc".to_string());
            echoed.last_modified = Some(server_time());
            echoed
        }
    }

    #[async_trait]
    impl RemoteStore for StubRemote {
        fn kind(&self) -> ArtifactKind {
            self.kind
        }

        async fn list(
            &self,
            cursor: PageCursor,
            _filter: ListFilter,
            _opts: &Options,
        ) -> Result<Page, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("list offset={}", cursor.offset));
            let items = self.pages.lock().unwrap().pop_front().unwrap_or_default();
            let next = cursor.advance(items.len());
            Ok(Page { items, next })
        }

        async fn get(&self, id: &str, _opts: &Options) -> Result<Artifact, SyncError> {
            self.calls.lock().unwrap().push(format!("get {id}"));
            Err(SyncError::RemoteNotFound {
                what: format!("{} {id}", self.kind.label()),
            })
        }

        async fn create(&self, artifact: &Artifact, _opts: &Options) -> Result<Artifact, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {}", artifact.display_name()));
            let queued = self.create_results.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| Ok(Self::echo(artifact)))
        }

        async fn update(&self, artifact: &Artifact, _opts: &Options) -> Result<Artifact, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update {}", artifact.display_name()));
            let queued = self.update_results.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| Ok(Self::echo(artifact)))
        }

        async fn delete(&self, artifact: &Artifact, _opts: &Options) -> Result<String, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {}", artifact.display_name()));
            Ok(format!("deleted {}", artifact.display_name()))
        }
    }

    struct StubResources {
        calls: Mutex<Vec<String>>,
        head_exists: bool,
        upload_results: Mutex<VecDeque<Result<String, SyncError>>>,
        downloads: Mutex<VecDeque<Result<Vec<u8>, u16>>>,
        resource_pages: Mutex<VecDeque<Vec<Artifact>>>,
    }

    impl StubResources {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                head_exists: false,
                upload_results: Mutex::new(VecDeque::new()),
                downloads: Mutex::new(VecDeque::new()),
                resource_pages: Mutex::new(VecDeque::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceStore for StubResources {
        async fn upload(
            &self,
            upload: &ResourceUpload,
            _opts: &Options,
        ) -> Result<String, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("upload {}", upload.name));
            let queued = self.upload_results.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| Ok("r-uploaded".to_string()))
        }

        async fn head(&self, resource_id: &str, _opts: &Options) -> Result<bool, SyncError> {
            self.calls.lock().unwrap().push(format!("head {resource_id}"));
            Ok(self.head_exists)
        }

        async fn download(
            &self,
            resource_id: &str,
            writer: &mut (dyn AsyncWrite + Send + Unpin),
            _opts: &Options,
        ) -> Result<ResourceHeaders, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("download {resource_id}"));
            let next = self.downloads.lock().unwrap().pop_front();
            match next.unwrap_or_else(|| Ok(b"default-bytes".to_vec())) {
                Ok(bytes) => {
                    writer.write_all(&bytes).await.expect("stub write");
                    Ok(ResourceHeaders::default())
                }
                Err(status) => Err(SyncError::CannotGetAsset {
                    path: resource_id.to_string(),
                    status,
                }),
            }
        }

        async fn list_by_created(
            &self,
            cursor: PageCursor,
            _opts: &Options,
        ) -> Result<Page, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("by-created offset={}", cursor.offset));
            let items = self.resource_pages.lock().unwrap().pop_front().unwrap_or_default();
            let next = cursor.advance(items.len());
            Ok(Page { items, next })
        }
    }

    struct Rig {
        _dir: TempDir,
        helper: Arc<ArtifactHelper>,
        remote: Arc<StubRemote>,
        resources: Arc<StubResources>,
        hashes: Arc<HashStore>,
        working: WorkingDir,
    }

    async fn rig(kind: ArtifactKind, remote: StubRemote, resources: StubResources) -> Rig {
        let dir = tempdir().unwrap();
        let working = WorkingDir::new(dir.path());
        working.prepare().await.unwrap();
        let hashes = Arc::new(HashStore::open(dir.path()).await.unwrap());
        let local = Arc::new(LocalFiles::new(kind, working.clone()));
        let remote = Arc::new(remote);
        let resources = Arc::new(resources);
        let helper = Arc::new(ArtifactHelper::new(
            kind,
            remote.clone(),
            Some(resources.clone() as Arc<dyn ResourceStore>),
            local,
            hashes.clone(),
            DriverConfig {
                concurrency: 1,
                item_retry_limit: 1,
                retry_delay: Duration::from_millis(1),
            },
            CancellationToken::new(),
        ));
        Rig {
            _dir: dir,
            helper,
            remote,
            resources,
            hashes,
            working,
        }
    }

    fn write_asset(working: &WorkingDir, path: &str, bytes: &[u8]) {
        let file = working.root().join("assets").join(path.trim_start_matches('/'));
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, bytes).unwrap();
    }

    fn remote_asset(path: &str, resource_id: &str) -> Artifact {
        Artifact {
            id: Some(format!("id-{resource_id}")),
            rev: Some("1-abc".to_string()),
            path: Some(path.to_string()),
            resource_id: Some(resource_id.to_string()),
            last_modified: Some(server_time()),
            ..Artifact::default()
        }
    }

    #[tokio::test]
    async fn two_phase_push_uploads_then_creates_metadata() {
        let rig = rig(ArtifactKind::Asset, StubRemote::new(ArtifactKind::Asset), StubResources::new()).await;
        write_asset(&rig.working, "/images/a.png", b"payload");

        let pushed = rig
            .helper
            .push_one("/images/a.png", &Options::default())
            .await
            .unwrap();
        assert_eq!(pushed.id.as_deref(), Some("srv-1"));

        let expected = md5_digest(b"payload");
        let resource_calls = rig.resources.calls();
        assert_eq!(
            resource_calls,
            [format!("head {}", expected.hex), "upload a.png".to_string()]
        );
        assert_eq!(rig.remote.calls(), ["create /images/a.png"]);

        let record = rig
            .hashes
            .lookup(ArtifactKind::Asset, "/images/a.png")
            .await
            .unwrap();
        assert_eq!(record.md5.as_deref(), Some(expected.hex.as_str()));
        assert_eq!(record.resource_id.as_deref(), Some("r-uploaded"));
        assert_eq!(record.remote_last_modified, Some(server_time()));
        assert!(record.last_pushed_at.is_some());
    }

    #[tokio::test]
    async fn pushing_identical_content_twice_uploads_once() {
        let rig = rig(ArtifactKind::Asset, StubRemote::new(ArtifactKind::Asset), StubResources::new()).await;
        write_asset(&rig.working, "/images/a.png", b"payload");

        rig.helper
            .push_one("/images/a.png", &Options::default())
            .await
            .unwrap();
        rig.helper
            .push_one("/images/a.png", &Options::default())
            .await
            .unwrap();

        let uploads = rig
            .resources
            .calls()
            .iter()
            .filter(|call| call.starts_with("upload"))
            .count();
        assert_eq!(uploads, 1);
        // The metadata phase still runs on the second push.
        assert_eq!(rig.remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn head_hit_skips_the_upload() {
        let mut resources = StubResources::new();
        resources.head_exists = true;
        let rig = rig(ArtifactKind::Asset, StubRemote::new(ArtifactKind::Asset), resources).await;
        write_asset(&rig.working, "/images/a.png", b"payload");

        rig.helper
            .push_one("/images/a.png", &Options::default())
            .await
            .unwrap();

        let expected = md5_digest(b"payload");
        assert_eq!(rig.resources.calls(), [format!("head {}", expected.hex)]);
        let record = rig
            .hashes
            .lookup(ArtifactKind::Asset, "/images/a.png")
            .await
            .unwrap();
        assert_eq!(record.resource_id.as_deref(), Some(expected.hex.as_str()));
    }

    #[tokio::test]
    async fn metadata_conflict_under_create_only_is_success() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote.create_results.lock().unwrap().push_back(Err(SyncError::Conflict {
            what: "asset /images/a.png".to_string(),
        }));
        let resources = StubResources::new();
        resources
            .upload_results
            .lock()
            .unwrap()
            .push_back(Ok("R".to_string()));
        let rig = rig(ArtifactKind::Asset, remote, resources).await;
        write_asset(&rig.working, "/images/a.png", b"payload");

        let opts = Options {
            create_only: true,
            ..Options::default()
        };
        let pushed = rig.helper.push_one("/images/a.png", &opts).await.unwrap();
        assert_eq!(pushed.resource_id.as_deref(), Some("R"));

        let record = rig
            .hashes
            .lookup(ArtifactKind::Asset, "/images/a.png")
            .await
            .unwrap();
        assert_eq!(record.resource_id.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn update_404_falls_back_to_create() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote.update_results.lock().unwrap().push_back(Err(SyncError::RemoteNotFound {
            what: "asset /images/a.png".to_string(),
        }));
        let rig = rig(ArtifactKind::Asset, remote, StubResources::new()).await;
        write_asset(&rig.working, "/images/a.png", b"payload");
        // A sidecar from an earlier pull carries the stale id and rev.
        let sidecar = rig.working.root().join("assets/images/a.png.json");
        std::fs::write(
            &sidecar,
            serde_json::to_vec_pretty(&remote_asset("/images/a.png", "r-old")).unwrap(),
        )
        .unwrap();

        rig.helper
            .push_one("/images/a.png", &Options::default())
            .await
            .unwrap();
        assert_eq!(
            rig.remote.calls(),
            ["update /images/a.png", "create /images/a.png"]
        );
    }

    #[tokio::test]
    async fn pull_missing_resource_commits_nothing() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote
            .pages
            .lock()
            .unwrap()
            .push_back(vec![remote_asset("/images/miss.png", "r404")]);
        let resources = StubResources::new();
        resources.downloads.lock().unwrap().push_back(Err(404));
        let rig = rig(ArtifactKind::Asset, remote, resources).await;

        let summary = rig.helper.pull_all(&Options::default()).await.unwrap();
        assert!(summary.succeeded.is_empty());
        assert_eq!(summary.failed.len(), 1);
        let message = summary.failed[0].error.to_string();
        assert!(message.contains("Cannot get asset"), "{message}");
        assert!(message.contains("404"), "{message}");

        let target = rig.working.root().join("assets/images/miss.png");
        assert!(!target.exists());
        let leftovers: Vec<_> = std::fs::read_dir(rig.working.root().join("assets/images"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "temp files must not survive: {leftovers:?}");
    }

    #[tokio::test]
    async fn pull_writes_content_asset_with_sidecar() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote
            .pages
            .lock()
            .unwrap()
            .push_back(vec![remote_asset("/dxdam/ab/photo.jpg", "r1")]);
        let resources = StubResources::new();
        resources
            .downloads
            .lock()
            .unwrap()
            .push_back(Ok(b"jpeg-bytes".to_vec()));
        let rig = rig(ArtifactKind::Asset, remote, resources).await;

        let summary = rig.helper.pull_all(&Options::default()).await.unwrap();
        assert_eq!(summary.succeeded, ["/dxdam/ab/photo.jpg"]);

        let file = rig.working.root().join("assets/dxdam/ab/photo.jpg");
        assert_eq!(std::fs::read(&file).unwrap(), b"jpeg-bytes");
        assert!(rig
            .working
            .root()
            .join("assets/dxdam/ab/photo.jpg.json")
            .exists());

        let record = rig
            .hashes
            .lookup(ArtifactKind::Asset, "/dxdam/ab/photo.jpg")
            .await
            .unwrap();
        assert_eq!(record.remote_last_modified, Some(server_time()));
        assert_eq!(
            record.md5.as_deref(),
            Some(md5_digest(b"jpeg-bytes").hex.as_str())
        );
    }

    #[tokio::test]
    async fn pull_then_push_modified_is_a_noop() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote
            .pages
            .lock()
            .unwrap()
            .push_back(vec![remote_asset("/images/logo.svg", "r1")]);
        let resources = StubResources::new();
        resources
            .downloads
            .lock()
            .unwrap()
            .push_back(Ok(b"<svg/>".to_vec()));
        let rig = rig(ArtifactKind::Asset, remote, resources).await;

        rig.helper.pull_all(&Options::default()).await.unwrap();
        let before = rig.remote.calls().len();

        let summary = rig.helper.push_modified(&Options::default()).await.unwrap();
        assert!(summary.succeeded.is_empty());
        assert!(summary.clean());
        // No create/update/upload happened for untouched content.
        assert_eq!(rig.remote.calls().len(), before);
        assert_eq!(rig.resources.calls(), ["download r1"]);
    }

    #[tokio::test]
    async fn clean_push_advances_the_push_timestamp() {
        let rig = rig(ArtifactKind::Asset, StubRemote::new(ArtifactKind::Asset), StubResources::new()).await;
        write_asset(&rig.working, "/images/a.png", b"payload");
        assert!(rig.hashes.last_push_at(ArtifactKind::Asset).await.is_none());

        rig.helper.push_modified(&Options::default()).await.unwrap();
        assert!(rig.hashes.last_push_at(ArtifactKind::Asset).await.is_some());
    }

    #[tokio::test]
    async fn failed_push_leaves_the_push_timestamp_alone() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote.create_results.lock().unwrap().push_back(Err(SyncError::Permanent {
            status: 400,
            message: "bad".to_string(),
        }));
        let rig = rig(ArtifactKind::Asset, remote, StubResources::new()).await;
        write_asset(&rig.working, "/images/a.png", b"payload");

        let summary = rig.helper.push_modified(&Options::default()).await.unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert!(rig.hashes.last_push_at(ArtifactKind::Asset).await.is_none());
    }

    #[tokio::test]
    async fn push_emits_events_after_outcomes() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        remote.create_results.lock().unwrap().push_back(Err(SyncError::Permanent {
            status: 400,
            message: "rejected".to_string(),
        }));
        let rig = rig(ArtifactKind::Asset, remote, StubResources::new()).await;
        write_asset(&rig.working, "/images/bad.png", b"bad");
        write_asset(&rig.working, "/images/good.png", b"good");

        let seen = Arc::new(Mutex::new(Vec::new()));
        for event in [SyncEvent::Pushed, SyncEvent::PushedError] {
            let seen = seen.clone();
            rig.helper.events().subscribe(event, move |payload| {
                seen.lock()
                    .unwrap()
                    .push((event.as_str(), payload.path.to_string()));
            });
        }

        let summary = rig.helper.push_all(&Options::default()).await.unwrap();
        assert_eq!(summary.succeeded, ["/images/good.png"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            [
                ("pushed-error", "/images/bad.png".to_string()),
                ("pushed", "/images/good.png".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn metadata_kind_pull_and_push_round_trip() {
        let remote = StubRemote::new(ArtifactKind::ContentType);
        let server_side = Artifact {
            id: Some("t1".to_string()),
            rev: Some("3-f".to_string()),
            name: Some("Article".to_string()),
            last_modified: Some(server_time()),
            ..Artifact::default()
        };
        remote.pages.lock().unwrap().push_back(vec![server_side]);
        let rig = rig(ArtifactKind::ContentType, remote, StubResources::new()).await;

        let summary = rig.helper.pull_all(&Options::default()).await.unwrap();
        assert_eq!(summary.succeeded, ["t1.json"]);
        assert!(rig.working.root().join("content-types/t1.json").exists());

        // Unchanged document: nothing to push.
        let summary = rig.helper.push_modified(&Options::default()).await.unwrap();
        assert!(summary.succeeded.is_empty());

        // Touch the document and push again: one update.
        let file = rig.working.root().join("content-types/t1.json");
        let mut artifact: Artifact =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        artifact.name = Some("Article v2".to_string());
        std::fs::write(&file, serde_json::to_vec_pretty(&artifact).unwrap()).unwrap();

        let summary = rig.helper.push_modified(&Options::default()).await.unwrap();
        assert_eq!(summary.succeeded, ["t1.json"]);
        assert!(rig
            .remote
            .calls()
            .iter()
            .any(|call| call == "update Article v2"));
    }

    #[tokio::test]
    async fn publishing_site_round_trips_like_other_metadata_kinds() {
        let remote = StubRemote::new(ArtifactKind::PublishingSite);
        let server_side = Artifact {
            id: Some("site-1".to_string()),
            rev: Some("1-a".to_string()),
            name: Some("Marketing".to_string()),
            last_modified: Some(server_time()),
            ..Artifact::default()
        };
        remote.pages.lock().unwrap().push_back(vec![server_side]);
        let rig = rig(ArtifactKind::PublishingSite, remote, StubResources::new()).await;

        let summary = rig.helper.pull_all(&Options::default()).await.unwrap();
        assert_eq!(summary.succeeded, ["site-1.json"]);
        let file = rig.working.root().join("sites/site-1.json");
        assert!(file.exists());

        let summary = rig.helper.push_modified(&Options::default()).await.unwrap();
        assert!(summary.succeeded.is_empty());

        let mut artifact: Artifact =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        artifact.name = Some("Marketing EMEA".to_string());
        std::fs::write(&file, serde_json::to_vec_pretty(&artifact).unwrap()).unwrap();

        let summary = rig.helper.push_modified(&Options::default()).await.unwrap();
        assert_eq!(summary.succeeded, ["site-1.json"]);
        assert!(rig
            .remote
            .calls()
            .iter()
            .any(|call| call == "update Marketing EMEA"));

        let record = rig
            .hashes
            .lookup(ArtifactKind::PublishingSite, "site-1.json")
            .await
            .unwrap();
        assert!(record.last_pulled_at.is_some());
        assert!(record.last_pushed_at.is_some());
    }

    #[tokio::test]
    async fn deleted_name_listings_compare_hashes_to_reality() {
        let remote = StubRemote::new(ArtifactKind::Asset);
        // Remote currently lists only /keep.png.
        remote
            .pages
            .lock()
            .unwrap()
            .push_back(vec![remote_asset("/keep.png", "r1")]);
        let rig = rig(ArtifactKind::Asset, remote, StubResources::new()).await;
        for path in ["/keep.png", "/gone-remotely.png"] {
            rig.hashes
                .record(ArtifactKind::Asset, path, Some("m"), None, None, SyncDirection::Pull)
                .await
                .unwrap();
        }
        write_asset(&rig.working, "/keep.png", b"k");

        let remote_deleted = rig
            .helper
            .list_remote_deleted_names(&Options::default())
            .await
            .unwrap();
        assert_eq!(
            remote_deleted.into_iter().collect::<Vec<_>>(),
            ["/gone-remotely.png"]
        );

        let local_deleted = rig
            .helper
            .list_local_deleted_names(&Options::default())
            .await
            .unwrap();
        assert_eq!(
            local_deleted.into_iter().collect::<Vec<_>>(),
            ["/gone-remotely.png"]
        );
    }

    #[tokio::test]
    async fn resource_enumeration_walks_the_by_created_view() {
        let resources = StubResources::new();
        {
            let mut pages = resources.resource_pages.lock().unwrap();
            pages.push_back(
                ["r1", "r2"]
                    .iter()
                    .map(|id| Artifact {
                        id: Some(id.to_string()),
                        ..Artifact::default()
                    })
                    .collect(),
            );
        }
        let rig = rig(ArtifactKind::Asset, StubRemote::new(ArtifactKind::Asset), resources).await;

        let opts = Options {
            limit: Some(2),
            ..Options::default()
        };
        let ids = rig.helper.list_remote_resource_ids(&opts).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), ["r1", "r2"]);
        // The full first page forced a second fetch that came back empty.
        assert_eq!(
            rig.resources.calls(),
            ["by-created offset=0", "by-created offset=2"]
        );
    }

    #[tokio::test]
    async fn delete_remote_marks_the_record_absent() {
        let rig = rig(ArtifactKind::Asset, StubRemote::new(ArtifactKind::Asset), StubResources::new()).await;
        rig.hashes
            .record(
                ArtifactKind::Asset,
                "/old.png",
                Some("m"),
                Some("r9"),
                Some(server_time()),
                SyncDirection::Push,
            )
            .await
            .unwrap();

        let artifact = remote_asset("/old.png", "r9");
        let message = rig
            .helper
            .delete_remote(&artifact, &Options::default())
            .await
            .unwrap();
        assert!(message.contains("/old.png"));

        let record = rig.hashes.lookup(ArtifactKind::Asset, "/old.png").await.unwrap();
        assert!(record.resource_id.is_none());
        assert!(record.remote_last_modified.is_none());
    }
}
