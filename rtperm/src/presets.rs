//! Building a [`PermissionsManager`]
//!
//! [`PermissionsManagerBuilder`] wires the store, the OS seams and the audit
//! sink. [`PermissionPresets`] covers the two common setups.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit::{AuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
use crate::manager::PermissionsManager;
use crate::platform::{MockSystemPermissions, PermissionDialogLauncher, SystemPermissionProbe};
use crate::store::{FilePermissionStore, MemoryPermissionStore, PermissionStore, DEFAULT_STORE_FILE};

/// Application name used for default paths when none is set
pub const DEFAULT_APP_NAME: &str = "rtperm";

/// Audit log file name used by [`PermissionPresets::production`]
pub const DEFAULT_AUDIT_FILE: &str = "permission_audit.jsonl";

/// Error type for manager construction
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("Failed to initialize store: {0}")]
    StoreInit(String),

    #[error("Failed to initialize audit: {0}")]
    AuditInit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Builder for [`PermissionsManager`]
///
/// `build` consumes the builder, so a configuration is applied exactly once.
/// The probe and launcher are required; the store defaults to a JSON file in
/// the application's config directory and the audit sink to a null sink.
pub struct PermissionsManagerBuilder {
    app_name: Option<String>,
    store: Option<Arc<dyn PermissionStore>>,
    probe: Option<Arc<dyn SystemPermissionProbe>>,
    launcher: Option<Arc<dyn PermissionDialogLauncher>>,
    audit: Option<Arc<dyn AuditSink>>,
    strict_assertions: bool,
}

impl PermissionsManagerBuilder {
    pub fn new() -> Self {
        Self {
            app_name: None,
            store: None,
            probe: None,
            launcher: None,
            audit: None,
            strict_assertions: cfg!(debug_assertions),
        }
    }

    /// Set the application name (used for default paths)
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn store(mut self, store: impl PermissionStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn probe(mut self, probe: impl SystemPermissionProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn launcher(mut self, launcher: impl PermissionDialogLauncher + 'static) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Use one value as both probe and launcher
    pub fn platform<P>(mut self, platform: P) -> Self
    where
        P: SystemPermissionProbe + PermissionDialogLauncher + Clone + 'static,
    {
        self.probe = Some(Arc::new(platform.clone()));
        self.launcher = Some(Arc::new(platform));
        self
    }

    pub fn audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    /// Fail requests that include an already granted raw permission
    ///
    /// Defaults to on in debug builds.
    pub fn strict_assertions(mut self, strict: bool) -> Self {
        self.strict_assertions = strict;
        self
    }

    /// Build the manager, bound to the calling thread
    pub fn build(self) -> Result<PermissionsManager, PresetError> {
        let probe = self
            .probe
            .ok_or_else(|| PresetError::InvalidConfig("no permission probe configured".into()))?;
        let launcher = self.launcher.ok_or_else(|| {
            PresetError::InvalidConfig("no permission dialog launcher configured".into())
        })?;

        let store: Arc<dyn PermissionStore> = match self.store {
            Some(s) => s,
            None => {
                let app_name = self.app_name.as_deref().unwrap_or(DEFAULT_APP_NAME);
                let store = FilePermissionStore::default_for_app(app_name)
                    .map_err(|e| PresetError::StoreInit(e.to_string()))?;
                Arc::new(store)
            }
        };

        tracing::debug!(strict_assertions = self.strict_assertions, "Built permissions manager");

        Ok(PermissionsManager::from_parts(
            store,
            probe,
            launcher,
            self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
            self.strict_assertions,
        ))
    }
}

impl Default for PermissionsManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PermissionsManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionsManagerBuilder")
            .field("app_name", &self.app_name)
            .field("strict_assertions", &self.strict_assertions)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Preset Configurations
// ============================================================================

/// Manager plus handles on its scripted collaborators
#[derive(Debug)]
pub struct TestHarness {
    pub manager: PermissionsManager,
    pub system: Arc<MockSystemPermissions>,
    pub store: Arc<MemoryPermissionStore>,
    pub audit: Arc<MemoryAuditSink>,
}

/// Preset configurations for common use cases
pub struct PermissionPresets;

impl PermissionPresets {
    /// Production setup
    ///
    /// - File-based asked registry in `<config>/<app>/asked_permissions.json`
    /// - JSONL audit log in `<config>/<app>/permission_audit.jsonl`
    /// - Strict assertions in debug builds only
    pub fn production<P>(app_name: &str, platform: P) -> Result<PermissionsManager, PresetError>
    where
        P: SystemPermissionProbe + PermissionDialogLauncher + Clone + 'static,
    {
        let app_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(app_name);
        Self::production_in(app_name, app_dir, platform)
    }

    /// Production setup with both files under `app_dir`
    pub fn production_in<P>(
        app_name: &str,
        app_dir: impl AsRef<Path>,
        platform: P,
    ) -> Result<PermissionsManager, PresetError>
    where
        P: SystemPermissionProbe + PermissionDialogLauncher + Clone + 'static,
    {
        let app_dir = app_dir.as_ref();

        let store = FilePermissionStore::new(app_dir.join(DEFAULT_STORE_FILE))
            .map_err(|e| PresetError::StoreInit(e.to_string()))?;

        let audit = FileAuditSink::new(app_dir.join(DEFAULT_AUDIT_FILE))
            .map_err(|e| PresetError::AuditInit(e.to_string()))?;

        PermissionsManagerBuilder::new()
            .app_name(app_name)
            .store(store)
            .platform(platform)
            .audit(audit)
            .build()
    }

    /// Testing setup
    ///
    /// - Mock OS, nothing granted, user declines by default
    /// - In-memory asked registry and audit log
    /// - Strict assertions on
    pub fn testing() -> TestHarness {
        let system = Arc::new(MockSystemPermissions::new());
        let store = Arc::new(MemoryPermissionStore::new());
        let audit = Arc::new(MemoryAuditSink::new());

        let manager = PermissionsManager::from_parts(
            store.clone(),
            system.clone(),
            system.clone(),
            audit.clone(),
            true,
        );

        TestHarness {
            manager,
            system,
            store,
            audit,
        }
    }
}
