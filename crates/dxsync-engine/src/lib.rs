//! The push/pull engine: per-kind helpers, the concurrent bulk driver, the
//! fixed-order coordinator, and the per-helper event bus.

pub mod context;
pub mod coordinator;
pub mod driver;
pub mod events;
pub mod helper;

pub use context::SyncContext;
pub use coordinator::{AllSwitch, KindRunner, Operation, RunReport};
pub use driver::{DriverConfig, Summary};
pub use events::{EventBus, EventPayload, SyncEvent};
pub use helper::ArtifactHelper;

pub const CRATE_NAME: &str = "dxsync-engine";
