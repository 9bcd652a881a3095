//! Local persistence and transport primitives: the hash store, the
//! retrying HTTP client, and the per-kind filesystem adapter.

pub mod hash_store;
pub mod http;
pub mod local;

pub use hash_store::{normalize_md5, HashRecord, HashStore, SyncDirection};
pub use http::{file_body_factory, HttpClient, HttpConfig, HttpRequest, RequestBody, RetryPolicy};
pub use local::{md5_digest, ContentDigest, LocalFiles, LocalItem, LocalStore, PendingWrite, WorkingDir};

pub const CRATE_NAME: &str = "dxsync-storage";
