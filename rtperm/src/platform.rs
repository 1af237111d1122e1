//! Seams to the operating system
//!
//! [`SystemPermissionProbe`] answers questions about raw permissions and
//! [`PermissionDialogLauncher`] starts the system dialog. Results of a launch
//! come back later through
//! [`PermissionsManager::on_request_permissions_result`](crate::PermissionsManager::on_request_permissions_result).
//!
//! [`MockSystemPermissions`] implements both traits with a scripted user so
//! grant, deny, rationale and never-ask-again flows can be driven
//! deterministically.

use rtperm_api::{GrantResult, PermissionGroup};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Live permission state as reported by the OS
///
/// Implementations own whatever OS context they need.
pub trait SystemPermissionProbe: Send + Sync {
    /// Whether the raw permission is currently granted
    fn is_granted(&self, permission: &str) -> bool;

    /// The OS hint that the user denied without choosing "don't ask again"
    fn should_show_request_rationale(&self, permission: &str) -> bool;

    /// Permissions declared by the application manifest
    ///
    /// `None` disables the declaration check.
    fn declared_permissions(&self) -> Option<Vec<String>> {
        None
    }
}

/// Starts the OS permission dialog
///
/// `launch` is fire-and-forget. The answer is delivered on the owner thread
/// through the manager's result callback.
pub trait PermissionDialogLauncher: Send + Sync {
    fn launch(&self, permissions: &[&str]);

    /// Whether a system dialog is currently on screen
    fn is_showing(&self) -> bool {
        false
    }

    /// Navigate to the application's settings page
    fn open_app_settings(&self);
}

impl<T: SystemPermissionProbe + ?Sized> SystemPermissionProbe for Arc<T> {
    fn is_granted(&self, permission: &str) -> bool {
        (**self).is_granted(permission)
    }

    fn should_show_request_rationale(&self, permission: &str) -> bool {
        (**self).should_show_request_rationale(permission)
    }

    fn declared_permissions(&self) -> Option<Vec<String>> {
        (**self).declared_permissions()
    }
}

impl<T: PermissionDialogLauncher + ?Sized> PermissionDialogLauncher for Arc<T> {
    fn launch(&self, permissions: &[&str]) {
        (**self).launch(permissions)
    }

    fn is_showing(&self) -> bool {
        (**self).is_showing()
    }

    fn open_app_settings(&self) {
        (**self).open_app_settings()
    }
}

// ============================================================================
// Mock OS (for testing and the demo)
// ============================================================================

/// What the simulated user answered to one dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogOutcome {
    /// Permissions in the order they were launched
    pub permissions: Vec<String>,
    pub grant_results: Vec<GrantResult>,
}

#[derive(Debug, Default)]
struct MockState {
    granted: HashSet<String>,
    ok_to_grant: HashSet<String>,
    never_ask_again: HashSet<String>,
    request_counts: HashMap<String, u32>,
    rationale_overrides: HashMap<String, bool>,
    declared: Option<Vec<String>>,
    showing: VecDeque<Vec<String>>,
    history: Vec<Vec<String>>,
    settings_opened: usize,
}

/// Scripted OS permission layer
///
/// Rationale follows the platform rule: shown once a permission has been
/// requested at least once, unless the user chose "don't ask again".
/// Group-level setters apply to every constituent raw permission.
#[derive(Debug, Default)]
pub struct MockSystemPermissions {
    state: Mutex<MockState>,
}

impl MockSystemPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant or revoke a group outside of any dialog (e.g. from settings)
    pub fn set_granted(&self, group: PermissionGroup, granted: bool) {
        let mut state = self.state();
        for raw in group.raw_permissions() {
            if granted {
                state.granted.insert(raw.to_string());
            } else {
                state.granted.remove(*raw);
            }
        }
    }

    /// Grant or revoke a single raw permission
    pub fn set_raw_granted(&self, permission: &str, granted: bool) {
        let mut state = self.state();
        if granted {
            state.granted.insert(permission.to_string());
        } else {
            state.granted.remove(permission);
        }
    }

    /// Make the simulated user accept (or decline) future dialogs for a group
    pub fn allow(&self, group: PermissionGroup, allow: bool) {
        let mut state = self.state();
        for raw in group.raw_permissions() {
            if allow {
                state.ok_to_grant.insert(raw.to_string());
            } else {
                state.ok_to_grant.remove(*raw);
            }
        }
    }

    /// Simulate the user ticking "don't ask again" for a group
    pub fn set_never_ask_again(&self, group: PermissionGroup, never: bool) {
        let mut state = self.state();
        for raw in group.raw_permissions() {
            if never {
                state.never_ask_again.insert(raw.to_string());
            } else {
                state.never_ask_again.remove(*raw);
            }
        }
    }

    /// Force the rationale hint for a group regardless of history
    pub fn override_rationale(&self, group: PermissionGroup, show: bool) {
        let mut state = self.state();
        for raw in group.raw_permissions() {
            state.rationale_overrides.insert(raw.to_string(), show);
        }
    }

    /// Restrict the permissions the simulated application declares
    pub fn declare_permissions<I, S>(&self, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().declared = Some(permissions.into_iter().map(Into::into).collect());
    }

    /// Number of times the dialog was requested for a raw permission
    pub fn request_count(&self, permission: &str) -> u32 {
        self.state()
            .request_counts
            .get(permission)
            .copied()
            .unwrap_or(0)
    }

    /// Every launch, in order
    pub fn launches(&self) -> Vec<Vec<String>> {
        self.state().history.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state().history.len()
    }

    pub fn settings_opened(&self) -> usize {
        self.state().settings_opened
    }

    /// Let the simulated user answer the oldest dialog on screen
    ///
    /// Permissions the user was told to allow become granted; all others
    /// are reported denied.
    pub fn complete_dialog(&self) -> Option<DialogOutcome> {
        let mut state = self.state();
        let permissions = state.showing.pop_front()?;

        let mut grant_results = Vec::with_capacity(permissions.len());
        for perm in &permissions {
            *state.request_counts.entry(perm.clone()).or_insert(0) += 1;
            if state.ok_to_grant.contains(perm) {
                state.granted.insert(perm.clone());
            }
            grant_results.push(if state.granted.contains(perm) {
                GrantResult::Granted
            } else {
                GrantResult::Denied
            });
        }

        Some(DialogOutcome {
            permissions,
            grant_results,
        })
    }

    /// Dismiss the oldest dialog without an answer
    ///
    /// The OS reports an interrupted request with empty arrays.
    pub fn interrupt_dialog(&self) -> Option<DialogOutcome> {
        self.state().showing.pop_front().map(|_| DialogOutcome {
            permissions: Vec::new(),
            grant_results: Vec::new(),
        })
    }
}

impl SystemPermissionProbe for MockSystemPermissions {
    fn is_granted(&self, permission: &str) -> bool {
        self.state().granted.contains(permission)
    }

    fn should_show_request_rationale(&self, permission: &str) -> bool {
        let state = self.state();
        if let Some(show) = state.rationale_overrides.get(permission) {
            return *show;
        }
        let requested = state.request_counts.get(permission).copied().unwrap_or(0) > 0;
        requested && !state.never_ask_again.contains(permission)
    }

    fn declared_permissions(&self) -> Option<Vec<String>> {
        self.state().declared.clone()
    }
}

impl PermissionDialogLauncher for MockSystemPermissions {
    fn launch(&self, permissions: &[&str]) {
        let permissions: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        let mut state = self.state();
        state.history.push(permissions.clone());
        state.showing.push_back(permissions);
    }

    fn is_showing(&self) -> bool {
        !self.state().showing.is_empty()
    }

    fn open_app_settings(&self) {
        self.state().settings_opened += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtperm_api::raw;

    #[test]
    fn test_rationale_requires_prior_request() {
        let system = MockSystemPermissions::new();
        assert!(!system.should_show_request_rationale(raw::CAMERA));

        system.launch(&[raw::CAMERA]);
        assert!(system.is_showing());
        let outcome = system.complete_dialog().unwrap();
        assert_eq!(outcome.grant_results, vec![GrantResult::Denied]);
        assert!(!system.is_showing());

        assert_eq!(system.request_count(raw::CAMERA), 1);
        assert!(system.should_show_request_rationale(raw::CAMERA));

        system.set_never_ask_again(PermissionGroup::Camera, true);
        assert!(!system.should_show_request_rationale(raw::CAMERA));
    }

    #[test]
    fn test_allowed_dialog_grants() {
        let system = MockSystemPermissions::new();
        system.allow(PermissionGroup::Location, true);
        system.launch(PermissionGroup::Location.raw_permissions());

        let outcome = system.complete_dialog().unwrap();
        assert_eq!(
            outcome.permissions,
            vec![raw::ACCESS_FINE_LOCATION, raw::ACCESS_COARSE_LOCATION]
        );
        assert!(outcome.grant_results.iter().all(|r| r.is_granted()));
        assert!(system.is_granted(raw::ACCESS_COARSE_LOCATION));
    }

    #[test]
    fn test_set_granted_covers_constituents() {
        let system = MockSystemPermissions::new();
        system.set_granted(PermissionGroup::Storage, true);
        assert!(system.is_granted(raw::READ_EXTERNAL_STORAGE));
        assert!(system.is_granted(raw::WRITE_EXTERNAL_STORAGE));

        system.set_raw_granted(raw::READ_EXTERNAL_STORAGE, false);
        assert!(!system.is_granted(raw::READ_EXTERNAL_STORAGE));
        assert!(system.is_granted(raw::WRITE_EXTERNAL_STORAGE));
    }

    #[test]
    fn test_interrupt_and_settings() {
        let system = MockSystemPermissions::new();
        assert!(system.complete_dialog().is_none());

        system.launch(&[raw::READ_SMS]);
        let outcome = system.interrupt_dialog().unwrap();
        assert!(outcome.permissions.is_empty());
        assert_eq!(system.request_count(raw::READ_SMS), 0);
        assert_eq!(system.launches(), vec![vec![raw::READ_SMS.to_string()]]);

        system.open_app_settings();
        assert_eq!(system.settings_opened(), 1);
    }

    #[test]
    fn test_declared_permissions() {
        let system = MockSystemPermissions::new();
        assert!(system.declared_permissions().is_none());

        system.declare_permissions([raw::CAMERA]);
        assert_eq!(
            system.declared_permissions(),
            Some(vec![raw::CAMERA.to_string()])
        );
    }
}
