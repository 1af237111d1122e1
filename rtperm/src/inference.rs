//! Group-level permission state
//!
//! The OS only answers two questions per raw permission: "is it granted?"
//! and "should a rationale be shown?". Neither distinguishes a permission
//! that was never requested from one the user blocked for good. Combining
//! the rationale hint with the persisted "asked before" flag does:
//!
//! | asked before | rationale | never ask again |
//! |--------------|-----------|-----------------|
//! | false        | false     | false           |
//! | false        | true      | true            |
//! | true         | false     | true            |
//! | true         | true      | false           |
//!
//! A granted group has no rationale, so once it was asked it reports
//! never-ask-again as well. Callers check [`InferenceEngine::is_granted`]
//! first.

use crate::platform::SystemPermissionProbe;
use crate::store::PermissionStore;
use rtperm_api::{GroupStatus, PermissionGroup};

/// Truth table for never-ask-again
pub fn infer_never_ask_again(asked_before: bool, should_show_rationale: bool) -> bool {
    asked_before != should_show_rationale
}

/// Read-only view combining the OS probe with the asked registry
#[derive(Clone, Copy)]
pub struct InferenceEngine<'a> {
    probe: &'a dyn SystemPermissionProbe,
    store: &'a dyn PermissionStore,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(probe: &'a dyn SystemPermissionProbe, store: &'a dyn PermissionStore) -> Self {
        Self { probe, store }
    }

    /// Granted if any constituent is granted
    pub fn is_granted(&self, group: PermissionGroup) -> bool {
        group
            .raw_permissions()
            .iter()
            .any(|raw| self.probe.is_granted(raw))
    }

    pub fn has_asked_before(&self, group: PermissionGroup) -> bool {
        self.store.get_bool(group.store_key())
    }

    /// Never for a granted group; otherwise every constituent must agree
    pub fn should_show_rationale(&self, group: PermissionGroup) -> bool {
        !self.is_granted(group)
            && group
                .raw_permissions()
                .iter()
                .all(|raw| self.probe.should_show_request_rationale(raw))
    }

    pub fn never_ask_again(&self, group: PermissionGroup) -> bool {
        infer_never_ask_again(
            self.has_asked_before(group),
            self.should_show_rationale(group),
        )
    }

    pub fn status(&self, group: PermissionGroup) -> GroupStatus {
        GroupStatus {
            group,
            granted: self.is_granted(group),
            has_asked: self.has_asked_before(group),
            never_ask_again: self.never_ask_again(group),
        }
    }
}

impl std::fmt::Debug for InferenceEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine").finish_non_exhaustive()
    }
}
