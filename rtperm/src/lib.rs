//! rtperm: runtime permission state and requests
//!
//! Wraps an operating system's runtime-permission primitives behind a
//! [`PermissionsManager`] that answers, per permission group:
//!
//! - is it granted?
//! - should a rationale be shown?
//! - has the user blocked it for good ("never ask again")?
//! - request it and await a single-shot [`PermissionsResult`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PermissionsManager                      │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │  Inference   │  │ RequestCorrelator│  │     Audit      │  │
//! │  │ grant = OR   │  │ key → oneshot    │  │ - File (JSONL) │  │
//! │  │ rationale=AND│  │ single-flight    │  │ - Memory       │  │
//! │  │ never-ask    │  │ drop = withdraw  │  │ - Null         │  │
//! │  └──────┬───────┘  └────────┬─────────┘  └────────────────┘  │
//! └─────────┼───────────────────┼────────────────────────────────┘
//!           │                   │
//!   PermissionStore     SystemPermissionProbe / PermissionDialogLauncher
//!   (File, Memory)      (OS adapter, MockSystemPermissions)
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rtperm::{PermissionGroup, PermissionsManager};
//!
//! let manager = PermissionsManager::builder()
//!     .app_name("myapp")
//!     .platform(android_adapter)
//!     .build()?;
//!
//! if !manager.is_camera_granted() && manager.never_ask_for_camera() {
//!     manager.open_app_settings();
//! } else {
//!     let pending = manager.request(PermissionGroup::Camera)?;
//!     // ... the OS calls back on the main thread:
//!     // manager.on_request_permissions_result(&permissions, &results)?;
//!     let result = pending.await?;
//! }
//! ```

pub mod audit;
pub mod correlator;
pub mod error;
pub mod inference;
pub mod manager;
pub mod platform;
pub mod presets;
pub mod store;

pub use audit::{
    AuditError, AuditEvent, AuditEventType, AuditSink, FileAuditSink, MemoryAuditSink,
    NullAuditSink,
};
pub use correlator::{PendingPermission, RequestCorrelator, Resolution};
pub use error::PermissionError;
pub use inference::{infer_never_ask_again, InferenceEngine};
pub use manager::PermissionsManager;
pub use platform::{
    DialogOutcome, MockSystemPermissions, PermissionDialogLauncher, SystemPermissionProbe,
};
pub use presets::{PermissionPresets, PermissionsManagerBuilder, PresetError, TestHarness};
pub use rtperm_api::{
    raw, GrantResult, GroupStatus, ParseGroupError, PermissionGroup, PermissionsResult,
    RequestKey,
};
pub use store::{FilePermissionStore, MemoryPermissionStore, PermissionStore, StoreError};
