//! Per-kind view of the working directory: enumeration, metadata JSON,
//! and temp-file writes committed by atomic rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use dxsync_core::{normalize_path, Artifact, ArtifactKind, SyncError};

const TEMP_PREFIX: &str = ".dxsync-";
const TEMP_SUFFIX: &str = ".tmp";

fn io_err(context: String, source: std::io::Error) -> SyncError {
    SyncError::LocalIo { context, source }
}

/// Content fingerprint in both encodings the wire protocol uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub hex: String,
    pub base64: String,
    pub length: u64,
}

pub fn md5_digest(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let raw = hasher.finalize();
    ContentDigest {
        hex: hex::encode(raw),
        base64: base64::engine::general_purpose::STANDARD.encode(raw),
        length: bytes.len() as u64,
    }
}

/// The working root shared by every kind adapter.
#[derive(Debug, Clone)]
pub struct WorkingDir {
    root: PathBuf,
}

impl WorkingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and sweep temp files orphaned by an earlier crash.
    pub async fn prepare(&self) -> Result<(), SyncError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| io_err(format!("creating {}", self.root.display()), err))?;

        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => stack.push(path),
                    Ok(_) if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) => {
                        let _ = fs::remove_file(&path).await;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// One local artifact found by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    /// Logical path for binary kinds, `<id>.json` name for metadata kinds.
    pub path: String,
    pub file: PathBuf,
    pub size: u64,
}

/// An in-progress file write backed by a uniquely named temp file. Nothing
/// is visible at the target path until [`PendingWrite::commit`] renames it.
pub struct PendingWrite {
    temp: PathBuf,
    target: PathBuf,
    file: Option<fs::File>,
}

impl PendingWrite {
    pub fn writer(&mut self) -> &mut fs::File {
        self.file.as_mut().expect("pending write already finished")
    }

    pub async fn commit(mut self) -> Result<PathBuf, SyncError> {
        let mut file = self.file.take().expect("pending write already finished");
        file.flush()
            .await
            .map_err(|err| io_err(format!("flushing {}", self.temp.display()), err))?;
        drop(file);
        match fs::rename(&self.temp, &self.target).await {
            Ok(()) => Ok(self.target.clone()),
            Err(err) => {
                let _ = fs::remove_file(&self.temp).await;
                Err(io_err(
                    format!(
                        "renaming {} over {}",
                        self.temp.display(),
                        self.target.display()
                    ),
                    err,
                ))
            }
        }
    }

    pub async fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.temp).await;
    }
}

/// Filesystem half of an artifact kind. Implemented by [`LocalFiles`] for
/// the real working directory and by test doubles in the engine tests.
#[async_trait]
pub trait LocalStore: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    /// Absolute path a logical path resolves to.
    fn resolve(&self, path: &str) -> PathBuf;

    async fn enumerate(&self) -> Result<Vec<LocalItem>, SyncError>;

    async fn read_metadata(&self, path: &str) -> Result<Artifact, SyncError>;

    /// Persist metadata JSON, returning the logical path written.
    async fn write_metadata(&self, artifact: &Artifact) -> Result<String, SyncError>;

    /// Sidecar metadata next to a binary file (`<path>.json`).
    async fn write_sidecar(&self, path: &str, artifact: &Artifact) -> Result<(), SyncError>;

    async fn open_write(&self, path: &str) -> Result<PendingWrite, SyncError>;

    async fn content_digest(&self, path: &str) -> Result<ContentDigest, SyncError>;

    async fn exists(&self, path: &str) -> bool;

    async fn remove(&self, path: &str) -> Result<(), SyncError>;
}

/// Real on-disk layout: `assets/<logical-path>` for binary kinds (with an
/// optional JSON sidecar), `<kind-dir>/<id>.json` for everything else.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    kind: ArtifactKind,
    working: WorkingDir,
}

impl LocalFiles {
    pub fn new(kind: ArtifactKind, working: WorkingDir) -> Self {
        Self { kind, working }
    }

    fn kind_dir(&self) -> PathBuf {
        self.working.root().join(self.kind.dir_name())
    }

    async fn walk(&self) -> Result<Vec<LocalItem>, SyncError> {
        let base = self.kind_dir();
        let mut found = Vec::new();
        if !base.exists() {
            return Ok(found);
        }

        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|err| io_err(format!("reading {}", dir.display()), err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| io_err(format!("reading {}", dir.display()), err))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| io_err(format!("inspecting {}", path.display()), err))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|err| io_err(format!("inspecting {}", path.display()), err))?;
                let relative = path
                    .strip_prefix(&base)
                    .expect("walked files live under the kind dir")
                    .to_string_lossy()
                    .replace('\\', "/");
                found.push(LocalItem {
                    path: relative,
                    file: path,
                    size: meta.len(),
                });
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

#[async_trait]
impl LocalStore for LocalFiles {
    fn kind(&self) -> ArtifactKind {
        self.kind
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let relative = normalize_path(path);
        self.kind_dir().join(relative.trim_start_matches('/'))
    }

    async fn enumerate(&self) -> Result<Vec<LocalItem>, SyncError> {
        let mut items = self.walk().await?;
        if self.kind.is_binary() {
            // A `<path>.json` next to `<path>` is that file's metadata
            // sidecar, not an artifact of its own.
            let names: std::collections::BTreeSet<String> =
                items.iter().map(|item| item.path.clone()).collect();
            items.retain(|item| match item.path.strip_suffix(".json") {
                Some(stem) => !names.contains(stem),
                None => true,
            });
            for item in &mut items {
                item.path = normalize_path(&item.path);
            }
        } else {
            items.retain(|item| item.path.ends_with(".json"));
        }
        Ok(items)
    }

    async fn read_metadata(&self, path: &str) -> Result<Artifact, SyncError> {
        let file = self.resolve(path);
        let text = fs::read_to_string(&file)
            .await
            .map_err(|err| io_err(format!("reading {}", file.display()), err))?;
        serde_json::from_str(&text)
            .map_err(|err| SyncError::Body(format!("parsing {}: {err}", file.display())))
    }

    async fn write_metadata(&self, artifact: &Artifact) -> Result<String, SyncError> {
        let id = artifact
            .id
            .as_deref()
            .ok_or_else(|| SyncError::Body("artifact has no id to store under".to_string()))?;
        let logical = format!("{id}.json");
        write_json_file(&self.resolve(&logical), artifact).await?;
        Ok(logical)
    }

    async fn write_sidecar(&self, path: &str, artifact: &Artifact) -> Result<(), SyncError> {
        let sidecar = format!("{path}.json");
        write_json_file(&self.resolve(&sidecar), artifact).await
    }

    async fn open_write(&self, path: &str) -> Result<PendingWrite, SyncError> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| SyncError::Body(format!("path {path} has no parent directory")))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| io_err(format!("creating {}", parent.display()), err))?;
        let temp = parent.join(format!("{TEMP_PREFIX}{}{TEMP_SUFFIX}", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .await
            .map_err(|err| io_err(format!("opening {}", temp.display()), err))?;
        Ok(PendingWrite {
            temp,
            target,
            file: Some(file),
        })
    }

    async fn content_digest(&self, path: &str) -> Result<ContentDigest, SyncError> {
        let file_path = self.resolve(path);
        let mut file = fs::File::open(&file_path)
            .await
            .map_err(|err| io_err(format!("opening {}", file_path.display()), err))?;
        let mut hasher = Md5::new();
        let mut length = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file
                .read(&mut buf)
                .await
                .map_err(|err| io_err(format!("reading {}", file_path.display()), err))?;
            if read == 0 {
                break;
            }
            length += read as u64;
            hasher.update(&buf[..read]);
        }
        let raw = hasher.finalize();
        Ok(ContentDigest {
            hex: hex::encode(raw),
            base64: base64::engine::general_purpose::STANDARD.encode(raw),
            length,
        })
    }

    async fn exists(&self, path: &str) -> bool {
        fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }

    async fn remove(&self, path: &str) -> Result<(), SyncError> {
        let file = self.resolve(path);
        fs::remove_file(&file)
            .await
            .map_err(|err| io_err(format!("removing {}", file.display()), err))
    }
}

async fn write_json_file(file: &Path, artifact: &Artifact) -> Result<(), SyncError> {
    let parent = file
        .parent()
        .ok_or_else(|| SyncError::Body(format!("{} has no parent directory", file.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|err| io_err(format!("creating {}", parent.display()), err))?;
    let bytes = serde_json::to_vec_pretty(artifact)
        .map_err(|err| SyncError::Body(format!("serializing {}: {err}", file.display())))?;
    let temp = parent.join(format!("{TEMP_PREFIX}{}{TEMP_SUFFIX}", Uuid::new_v4()));
    fs::write(&temp, &bytes)
        .await
        .map_err(|err| io_err(format!("writing {}", temp.display()), err))?;
    match fs::rename(&temp, file).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp).await;
            Err(io_err(
                format!("renaming {} over {}", temp.display(), file.display()),
                err,
            ))
        }
    }
}
