//! The permissions facade
//!
//! [`PermissionsManager`] answers state queries per group and runs the
//! request flow: check, mark asked, launch, correlate. Build one with
//! [`PermissionsManager::builder`] or a preset.

use crate::audit::{self, AuditEvent, AuditEventType, AuditSink};
use crate::correlator::{PendingPermission, RequestCorrelator};
use crate::error::PermissionError;
use crate::inference::InferenceEngine;
use crate::platform::{PermissionDialogLauncher, SystemPermissionProbe};
use crate::presets::PermissionsManagerBuilder;
use crate::store::PermissionStore;
use rtperm_api::{
    collect_raw_permissions, GrantResult, GroupStatus, PermissionGroup, PermissionsResult,
    RequestKey,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tokio::sync::watch;

/// Runtime permission manager
///
/// Requests and result callbacks must happen on the thread that built the
/// manager, mirroring the platform's main-thread rule. State queries may run
/// anywhere.
pub struct PermissionsManager {
    store: Arc<dyn PermissionStore>,
    probe: Arc<dyn SystemPermissionProbe>,
    launcher: Arc<dyn PermissionDialogLauncher>,
    audit: Arc<dyn AuditSink>,
    correlator: RequestCorrelator,
    observers: Mutex<HashMap<PermissionGroup, watch::Sender<GroupStatus>>>,
    owner: ThreadId,
    strict_assertions: bool,
}

impl PermissionsManager {
    pub fn builder() -> PermissionsManagerBuilder {
        PermissionsManagerBuilder::new()
    }

    pub(crate) fn from_parts(
        store: Arc<dyn PermissionStore>,
        probe: Arc<dyn SystemPermissionProbe>,
        launcher: Arc<dyn PermissionDialogLauncher>,
        audit: Arc<dyn AuditSink>,
        strict_assertions: bool,
    ) -> Self {
        Self {
            store,
            probe,
            launcher,
            correlator: RequestCorrelator::new(Arc::clone(&audit)),
            audit,
            observers: Mutex::new(HashMap::new()),
            owner: thread::current().id(),
            strict_assertions,
        }
    }

    fn engine(&self) -> InferenceEngine<'_> {
        InferenceEngine::new(self.probe.as_ref(), self.store.as_ref())
    }

    fn ensure_owner_thread(&self) -> Result<(), PermissionError> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(PermissionError::WrongThread)
        }
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    pub fn is_granted(&self, group: PermissionGroup) -> bool {
        self.engine().is_granted(group)
    }

    pub fn has_asked_for_permission(&self, group: PermissionGroup) -> bool {
        self.engine().has_asked_before(group)
    }

    pub fn should_show_rationale(&self, group: PermissionGroup) -> bool {
        self.engine().should_show_rationale(group)
    }

    /// Whether the OS will refuse to show the dialog again
    ///
    /// Also true for a group that was asked and then granted; check
    /// [`is_granted`](Self::is_granted) first.
    pub fn never_ask_again(&self, group: PermissionGroup) -> bool {
        self.engine().never_ask_again(group)
    }

    pub fn status(&self, group: PermissionGroup) -> GroupStatus {
        self.engine().status(group)
    }

    /// Whether a request is waiting for the OS
    pub fn is_requesting(&self) -> bool {
        self.correlator.in_flight().is_some() || self.launcher.is_showing()
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn request(&self, group: PermissionGroup) -> Result<PendingPermission, PermissionError> {
        self.request_groups(&[group])
    }

    /// Request several groups in one dialog
    ///
    /// Resolves immediately with `{granted: true, was_asked_just_now: false}`
    /// when every group is already granted. Otherwise each group is marked as
    /// asked before the dialog launches, so the flag survives a crash while
    /// the dialog is up.
    pub fn request_groups(
        &self,
        groups: &[PermissionGroup],
    ) -> Result<PendingPermission, PermissionError> {
        self.ensure_owner_thread()?;
        if groups.is_empty() {
            return Err(PermissionError::EmptyRequest);
        }

        let mut groups = groups.to_vec();
        groups.sort();
        groups.dedup();

        let engine = self.engine();
        if groups.iter().all(|g| engine.is_granted(*g)) {
            tracing::debug!(?groups, "Permissions already granted, skipping dialog");
            return Ok(PendingPermission::ready(PermissionsResult::already_granted()));
        }

        if let Some(in_flight) = self.correlator.in_flight() {
            return Err(self.reject(
                &groups,
                PermissionError::ConcurrentRequest {
                    in_flight: in_flight.to_string(),
                },
            ));
        }
        if self.launcher.is_showing() {
            return Err(self.reject(
                &groups,
                PermissionError::ConcurrentRequest {
                    in_flight: "system permission dialog".to_string(),
                },
            ));
        }

        let permissions = collect_raw_permissions(&groups);
        self.check_declared(&groups, &permissions)?;
        if self.strict_assertions {
            if let Some(granted) = permissions.iter().find(|p| self.probe.is_granted(p)) {
                return Err(self.reject(
                    &groups,
                    PermissionError::AlreadyGranted(granted.to_string()),
                ));
            }
        }

        self.mark_asked(&groups)?;

        let key = RequestKey::from_permissions(permissions.iter().copied());
        let pending = self.correlator.register(key.clone(), &groups)?;

        tracing::info!(?groups, request = %key.digest(), "Launching permission dialog");
        audit::emit(self.audit.as_ref(), audit::permission_requested(&groups, &key));
        self.launcher.launch(&permissions);
        Ok(pending)
    }

    /// Deliver the OS answer for a launched dialog
    ///
    /// Returns whether the answer matched a pending request. Unknown,
    /// withdrawn and interrupted (empty) answers are ignored.
    pub fn on_request_permissions_result<S: AsRef<str>>(
        &self,
        permissions: &[S],
        grant_results: &[GrantResult],
    ) -> Result<bool, PermissionError> {
        self.ensure_owner_thread()?;

        match self.correlator.resolve(permissions, grant_results) {
            Some(resolution) => {
                tracing::info!(
                    groups = ?resolution.groups,
                    granted = resolution.result.granted,
                    "Permission request resolved"
                );
                self.refresh();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Same as [`on_request_permissions_result`](Self::on_request_permissions_result)
    /// with raw OS result codes
    pub fn on_request_permissions_result_codes<S: AsRef<str>>(
        &self,
        permissions: &[S],
        codes: &[i32],
    ) -> Result<bool, PermissionError> {
        let grant_results: Vec<GrantResult> =
            codes.iter().copied().map(GrantResult::from_code).collect();
        self.on_request_permissions_result(permissions, &grant_results)
    }

    fn check_declared(
        &self,
        groups: &[PermissionGroup],
        permissions: &[&str],
    ) -> Result<(), PermissionError> {
        let Some(declared) = self.probe.declared_permissions() else {
            return Ok(());
        };
        for perm in permissions {
            if !declared.iter().any(|d| d == perm) {
                return Err(self.reject(
                    groups,
                    PermissionError::UndeclaredPermission(perm.to_string()),
                ));
            }
        }
        Ok(())
    }

    /// Set every group's asked flag, or leave the store as it was
    fn mark_asked(&self, groups: &[PermissionGroup]) -> Result<(), PermissionError> {
        let unasked: Vec<PermissionGroup> = groups
            .iter()
            .copied()
            .filter(|g| !self.store.get_bool(g.store_key()))
            .collect();

        for (i, group) in unasked.iter().enumerate() {
            if let Err(e) = self.store.set_bool(group.store_key(), true) {
                for marked in &unasked[..i] {
                    if let Err(undo) = self.store.set_bool(marked.store_key(), false) {
                        tracing::warn!(
                            group = %marked,
                            error = %undo,
                            "Failed to roll back asked flag"
                        );
                    }
                }
                return Err(self.reject(groups, e.into()));
            }
        }
        Ok(())
    }

    fn reject(&self, groups: &[PermissionGroup], err: PermissionError) -> PermissionError {
        tracing::warn!(?groups, error = %err, "Permission request rejected");
        audit::emit(
            self.audit.as_ref(),
            audit::request_rejected(groups, &err.to_string()),
        );
        err
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    fn observers(&self) -> MutexGuard<'_, HashMap<PermissionGroup, watch::Sender<GroupStatus>>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch a group's status
    ///
    /// The receiver sees a new value only when the status actually changes,
    /// which is checked after every resolved request, on [`reset`](Self::reset)
    /// and on [`refresh`](Self::refresh).
    pub fn observe(&self, group: PermissionGroup) -> watch::Receiver<GroupStatus> {
        let status = self.status(group);
        match self.observers().entry(group) {
            Entry::Occupied(entry) => {
                publish(entry.get(), status);
                entry.get().subscribe()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(status);
                entry.insert(tx);
                rx
            }
        }
    }

    /// Re-evaluate every observed group
    ///
    /// Call when the application returns to the foreground; the user may
    /// have changed permissions in the system settings meanwhile.
    pub fn refresh(&self) {
        let mut observers = self.observers();
        observers.retain(|group, tx| {
            if tx.is_closed() {
                return false;
            }
            if publish(tx, self.status(*group)) {
                tracing::debug!(%group, "Permission status changed");
            }
            true
        });
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Forget which groups were asked for
    pub fn reset(&self) -> Result<(), PermissionError> {
        self.store.clear()?;
        tracing::info!("Cleared asked-permission registry");
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::RegistryReset, &[]),
        );
        self.refresh();
        Ok(())
    }

    /// Open the application's page in the system settings
    pub fn open_app_settings(&self) {
        tracing::info!("Opening application settings");
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::SettingsOpened, &[]),
        );
        self.launcher.open_app_settings();
    }

    /// Snapshot of the persisted asked flags
    pub fn asked_entries(&self) -> Vec<(String, bool)> {
        self.store.entries()
    }
}

fn publish(tx: &watch::Sender<GroupStatus>, status: GroupStatus) -> bool {
    tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    })
}

impl fmt::Debug for PermissionsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionsManager")
            .field("correlator", &self.correlator)
            .field("owner", &self.owner)
            .field("strict_assertions", &self.strict_assertions)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Per-group conveniences
// ============================================================================

macro_rules! group_operations {
    ($($group:ident => $is_granted:ident, $has_asked:ident, $never_ask:ident, $request:ident;)*) => {
        impl PermissionsManager {
            $(
                #[doc = concat!("[`is_granted`](Self::is_granted) for `", stringify!($group), "`")]
                pub fn $is_granted(&self) -> bool {
                    self.is_granted(PermissionGroup::$group)
                }

                #[doc = concat!("[`has_asked_for_permission`](Self::has_asked_for_permission) for `", stringify!($group), "`")]
                pub fn $has_asked(&self) -> bool {
                    self.has_asked_for_permission(PermissionGroup::$group)
                }

                #[doc = concat!("[`never_ask_again`](Self::never_ask_again) for `", stringify!($group), "`")]
                pub fn $never_ask(&self) -> bool {
                    self.never_ask_again(PermissionGroup::$group)
                }

                #[doc = concat!("[`request`](Self::request) for `", stringify!($group), "`")]
                pub fn $request(&self) -> Result<PendingPermission, PermissionError> {
                    self.request(PermissionGroup::$group)
                }
            )*
        }
    };
}

group_operations! {
    Camera => is_camera_granted, has_asked_for_camera_permission, never_ask_for_camera, request_camera_permission;
    Location => is_location_granted, has_asked_for_location_permission, never_ask_for_location, request_location_permission;
    Microphone => is_microphone_granted, has_asked_for_microphone_permission, never_ask_for_microphone, request_microphone_permission;
    Calendar => is_calendar_granted, has_asked_for_calendar_permission, never_ask_for_calendar, request_calendar_permission;
    Contacts => is_contacts_granted, has_asked_for_contacts_permission, never_ask_for_contacts, request_contacts_permission;
    Phone => is_phone_granted, has_asked_for_phone_permission, never_ask_for_phone, request_phone_permission;
    Storage => is_storage_granted, has_asked_for_storage_permission, never_ask_for_storage, request_storage_permission;
    BodySensor => is_body_sensors_granted, has_asked_for_body_sensors_permission, never_ask_for_body_sensors, request_body_sensors_permission;
    Sms => is_sms_granted, has_asked_for_sms_permission, never_ask_for_sms, request_sms_permission;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::platform::MockSystemPermissions;
    use crate::store::MemoryPermissionStore;
    use rtperm_api::raw;

    struct Fixture {
        manager: PermissionsManager,
        system: Arc<MockSystemPermissions>,
        store: Arc<MemoryPermissionStore>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture(strict: bool) -> Fixture {
        let system = Arc::new(MockSystemPermissions::new());
        let store = Arc::new(MemoryPermissionStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = PermissionsManager::from_parts(
            store.clone(),
            system.clone(),
            system.clone(),
            audit.clone(),
            strict,
        );
        Fixture {
            manager,
            system,
            store,
            audit,
        }
    }

    #[test]
    fn test_already_granted_skips_dialog() {
        let fx = fixture(true);
        fx.system.set_granted(PermissionGroup::Camera, true);

        let pending = fx.manager.request_camera_permission().unwrap();
        assert!(pending.is_immediate());
        assert_eq!(fx.system.launch_count(), 0);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_asked_flag_written_before_launch() {
        let fx = fixture(true);
        let _pending = fx.manager.request_sms_permission().unwrap();

        assert!(fx.manager.has_asked_for_sms_permission());
        assert_eq!(
            fx.system.launches(),
            vec![PermissionGroup::Sms
                .raw_permissions()
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()]
        );
        assert_eq!(
            fx.audit.event_types(),
            vec![AuditEventType::PermissionRequested]
        );
    }

    #[test]
    fn test_strict_assertion_on_partially_granted_request() {
        let fx = fixture(true);
        fx.system.set_granted(PermissionGroup::Camera, true);

        let err = fx
            .manager
            .request_groups(&[PermissionGroup::Camera, PermissionGroup::Microphone])
            .unwrap_err();
        assert!(matches!(err, PermissionError::AlreadyGranted(p) if p == raw::CAMERA));
        assert!(!fx.manager.has_asked_for_microphone_permission());
        assert_eq!(fx.system.launch_count(), 0);
    }

    #[test]
    fn test_lenient_mode_requests_partially_granted() {
        let fx = fixture(false);
        fx.system.set_granted(PermissionGroup::Camera, true);

        let pending = fx
            .manager
            .request_groups(&[PermissionGroup::Microphone, PermissionGroup::Camera])
            .unwrap();
        assert!(!pending.is_immediate());
        assert!(fx.manager.has_asked_for_camera_permission());
        assert!(fx.manager.has_asked_for_microphone_permission());
    }

    #[test]
    fn test_declared_permission_accepted() {
        let fx = fixture(true);
        fx.system.declare_permissions([raw::CAMERA]);

        let pending = fx.manager.request_camera_permission().unwrap();
        assert_eq!(
            pending.key(),
            Some(&RequestKey::from_permissions([raw::CAMERA]))
        );
    }

    #[test]
    fn test_undeclared_group_does_not_mark_asked() {
        let fx = fixture(true);
        fx.system.declare_permissions([raw::CAMERA]);

        let err = fx.manager.request_location_permission().unwrap_err();
        assert!(
            matches!(err, PermissionError::UndeclaredPermission(p) if p == raw::ACCESS_FINE_LOCATION)
        );
        assert!(!fx.manager.has_asked_for_location_permission());
        assert_eq!(
            fx.audit.event_types(),
            vec![AuditEventType::RequestRejected]
        );
    }

    #[test]
    fn test_empty_request() {
        let fx = fixture(true);
        assert!(matches!(
            fx.manager.request_groups(&[]),
            Err(PermissionError::EmptyRequest)
        ));
    }

    #[test]
    fn test_result_codes() {
        let fx = fixture(true);
        let _pending = fx.manager.request_camera_permission().unwrap();
        fx.system.complete_dialog();

        let matched = fx
            .manager
            .on_request_permissions_result_codes(&[raw::CAMERA], &[0])
            .unwrap();
        assert!(matched);
        assert!(!fx.manager.is_requesting());
    }

    #[test]
    fn test_open_app_settings_delegates() {
        let fx = fixture(true);
        fx.manager.open_app_settings();
        assert_eq!(fx.system.settings_opened(), 1);
        assert_eq!(fx.audit.event_types(), vec![AuditEventType::SettingsOpened]);
    }

    #[test]
    fn test_reset_clears_registry() {
        let fx = fixture(true);
        fx.store
            .set_bool(PermissionGroup::Contacts.store_key(), true)
            .unwrap();
        assert!(fx.manager.has_asked_for_contacts_permission());

        fx.manager.reset().unwrap();
        assert!(!fx.manager.has_asked_for_contacts_permission());
        assert!(fx.manager.asked_entries().is_empty());
    }

    #[test]
    fn test_observe_publishes_changes_only() {
        let fx = fixture(true);
        let mut rx = fx.manager.observe(PermissionGroup::Storage);
        assert!(!rx.borrow_and_update().granted);

        fx.manager.refresh();
        assert!(!rx.has_changed().unwrap());

        fx.system.set_granted(PermissionGroup::Storage, true);
        fx.manager.refresh();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().granted);
    }

    #[test]
    fn test_refresh_drops_closed_observers() {
        let fx = fixture(true);
        let rx = fx.manager.observe(PermissionGroup::Phone);
        drop(rx);

        fx.manager.refresh();
        assert!(fx.manager.observers().is_empty());
    }

    /// Memory store that refuses to set one key
    struct FailingKeyStore {
        inner: MemoryPermissionStore,
        failing_key: &'static str,
    }

    impl PermissionStore for FailingKeyStore {
        fn get_bool(&self, key: &str) -> bool {
            self.inner.get_bool(key)
        }

        fn set_bool(&self, key: &str, value: bool) -> Result<(), crate::store::StoreError> {
            if value && key == self.failing_key {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.set_bool(key, value)
        }

        fn clear(&self) -> Result<(), crate::store::StoreError> {
            self.inner.clear()
        }

        fn entries(&self) -> Vec<(String, bool)> {
            self.inner.entries()
        }
    }

    #[test]
    fn test_failed_store_write_rolls_back_marked_groups() {
        let system = Arc::new(MockSystemPermissions::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = PermissionsManager::from_parts(
            Arc::new(FailingKeyStore {
                inner: MemoryPermissionStore::new(),
                failing_key: PermissionGroup::Microphone.store_key(),
            }),
            system.clone(),
            system.clone(),
            audit.clone(),
            true,
        );

        let err = manager
            .request_groups(&[PermissionGroup::Camera, PermissionGroup::Microphone])
            .unwrap_err();
        assert!(matches!(err, PermissionError::Store(_)));

        assert!(!manager.has_asked_for_camera_permission());
        assert!(!manager.has_asked_for_microphone_permission());
        assert!(!manager.is_requesting());
        assert_eq!(system.launch_count(), 0);
        assert_eq!(audit.event_types(), vec![AuditEventType::RequestRejected]);
    }

    #[test]
    fn test_failed_store_write_keeps_earlier_asked_flags() {
        let system = Arc::new(MockSystemPermissions::new());
        let store = Arc::new(FailingKeyStore {
            inner: MemoryPermissionStore::new(),
            failing_key: PermissionGroup::Microphone.store_key(),
        });
        store
            .inner
            .set_bool(PermissionGroup::Camera.store_key(), true)
            .unwrap();
        let manager = PermissionsManager::from_parts(
            store.clone(),
            system.clone(),
            system.clone(),
            Arc::new(MemoryAuditSink::new()),
            true,
        );

        assert!(manager
            .request_groups(&[PermissionGroup::Camera, PermissionGroup::Microphone])
            .is_err());
        assert!(manager.has_asked_for_camera_permission());
        assert!(!manager.has_asked_for_microphone_permission());
    }
}
