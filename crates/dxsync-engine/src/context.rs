//! Wires one working directory and one service base URL into the full set
//! of per-kind helpers. Helpers are plain collaborators handed out from
//! here; nothing in the engine is process-global.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;

use dxsync_adapters::{AuthoringApi, AuthoringResources, RemoteStore, ResourceStore};
use dxsync_core::{ArtifactKind, SyncError, PULL_ORDER};
use dxsync_storage::hash_store::HashStore;
use dxsync_storage::http::{HttpClient, HttpConfig};
use dxsync_storage::local::{LocalFiles, WorkingDir};

use crate::coordinator::{AllSwitch, KindRunner};
use crate::driver::DriverConfig;
use crate::helper::ArtifactHelper;

pub struct SyncContext {
    working: WorkingDir,
    hashes: Arc<HashStore>,
    helpers: BTreeMap<ArtifactKind, Arc<ArtifactHelper>>,
    cancel: CancellationToken,
}

impl SyncContext {
    pub async fn open(
        base_url: &str,
        working_root: &Path,
        http_config: HttpConfig,
        driver: DriverConfig,
    ) -> Result<Self> {
        let working = WorkingDir::new(working_root);
        working.prepare().await.with_context(|| {
            format!("preparing working directory {}", working_root.display())
        })?;
        let hashes = Arc::new(
            HashStore::open(working_root)
                .await
                .context("opening hash store")?,
        );
        let http = Arc::new(HttpClient::new(http_config).context("building HTTP client")?);
        let resources: Arc<dyn ResourceStore> =
            Arc::new(AuthoringResources::new(http.clone(), base_url));
        let cancel = CancellationToken::new();

        let mut helpers = BTreeMap::new();
        for kind in all_kinds() {
            let remote: Arc<dyn RemoteStore> =
                Arc::new(AuthoringApi::new(http.clone(), base_url, kind));
            let local = Arc::new(LocalFiles::new(kind, working.clone()));
            let helper = ArtifactHelper::new(
                kind,
                remote,
                kind.is_binary().then(|| resources.clone()),
                local,
                hashes.clone(),
                driver.clone(),
                cancel.child_token(),
            );
            helpers.insert(kind, Arc::new(helper));
        }

        Ok(Self {
            working,
            hashes,
            helpers,
            cancel,
        })
    }

    pub fn working(&self) -> &WorkingDir {
        &self.working
    }

    pub fn hashes(&self) -> &Arc<HashStore> {
        &self.hashes
    }

    pub fn helper(&self, kind: ArtifactKind) -> Arc<ArtifactHelper> {
        self.helpers
            .get(&kind)
            .expect("a helper exists for every kind")
            .clone()
    }

    /// Coordinator over every kind; selection happens per run.
    pub fn all_switch(&self) -> AllSwitch {
        let runners = self
            .helpers
            .values()
            .map(|helper| Arc::new(helper.clone()) as Arc<dyn KindRunner>)
            .collect();
        AllSwitch::new(runners)
    }

    /// Root cancellation: stops intake in every helper's bulk runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn flush(&self) -> Result<(), SyncError> {
        self.hashes.flush().await
    }
}

fn all_kinds() -> impl Iterator<Item = ArtifactKind> {
    PULL_ORDER
        .iter()
        .copied()
        .chain([ArtifactKind::PublishingJob])
}
