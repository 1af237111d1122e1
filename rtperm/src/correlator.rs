//! Request/response correlation for the system permission dialog
//!
//! Launching the dialog is fire-and-forget; the OS later reports the answer
//! for a list of raw permissions. The correlator keeps one pending entry per
//! [`RequestKey`] holding a oneshot sender, and resolves it when a callback
//! for the same permission set arrives. Only one entry may exist at a time.

use crate::audit::{self, AuditSink};
use crate::error::PermissionError;
use rtperm_api::{GrantResult, PermissionGroup, PermissionsResult, RequestKey};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

struct PendingEntry {
    /// Distinguishes successive requests for the same key
    id: u64,
    groups: Vec<PermissionGroup>,
    sender: oneshot::Sender<PermissionsResult>,
}

type PendingMap = Mutex<HashMap<RequestKey, PendingEntry>>;

fn lock_map(map: &PendingMap) -> MutexGuard<'_, HashMap<RequestKey, PendingEntry>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A callback that matched a pending request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: RequestKey,
    pub groups: Vec<PermissionGroup>,
    pub result: PermissionsResult,
}

/// Tracks the in-flight permission request
pub struct RequestCorrelator {
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    audit: Arc<dyn AuditSink>,
}

impl RequestCorrelator {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            audit,
        }
    }

    /// Key of the request currently awaiting an answer
    pub fn in_flight(&self) -> Option<RequestKey> {
        lock_map(&self.pending).keys().next().cloned()
    }

    pub fn pending_count(&self) -> usize {
        lock_map(&self.pending).len()
    }

    /// Register a pending entry for `key`
    ///
    /// Fails with [`PermissionError::ConcurrentRequest`] while any other
    /// request is pending.
    pub fn register(
        &self,
        key: RequestKey,
        groups: &[PermissionGroup],
    ) -> Result<PendingPermission, PermissionError> {
        let mut pending = lock_map(&self.pending);
        if let Some(existing) = pending.keys().next() {
            return Err(PermissionError::ConcurrentRequest {
                in_flight: existing.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = oneshot::channel();
        pending.insert(
            key.clone(),
            PendingEntry {
                id,
                groups: groups.to_vec(),
                sender,
            },
        );
        tracing::debug!(request = %key.digest(), id, "Registered pending permission request");

        Ok(PendingPermission {
            state: PendingState::Waiting {
                rx,
                guard: CancelGuard {
                    key,
                    id,
                    pending: Arc::downgrade(&self.pending),
                    audit: Arc::clone(&self.audit),
                },
            },
        })
    }

    /// Match an OS callback to the pending request and resolve it
    ///
    /// Returns `None` for interrupted (empty) and unmatched callbacks; those
    /// leave every pending entry untouched.
    pub fn resolve<S: AsRef<str>>(
        &self,
        permissions: &[S],
        grant_results: &[GrantResult],
    ) -> Option<Resolution> {
        let key = RequestKey::from_permissions(permissions);
        if key.is_empty() {
            tracing::debug!("Permission dialog was interrupted, ignoring empty result");
            audit::emit(self.audit.as_ref(), audit::stale_callback(&key));
            return None;
        }

        let entry = lock_map(&self.pending).remove(&key);
        let Some(entry) = entry else {
            tracing::debug!(request = %key, "Ignoring result for unknown or withdrawn request");
            audit::emit(self.audit.as_ref(), audit::stale_callback(&key));
            return None;
        };

        let result = if permissions.len() == grant_results.len() {
            PermissionsResult::from_grant_results(grant_results)
        } else {
            tracing::warn!(
                permissions = permissions.len(),
                results = grant_results.len(),
                "Mismatched permission result arrays, treating as denied"
            );
            PermissionsResult {
                granted: false,
                was_asked_just_now: true,
            }
        };

        if entry.sender.send(result).is_err() {
            tracing::debug!(request = %key.digest(), "Requester stopped waiting before the result arrived");
        }
        audit::emit(
            self.audit.as_ref(),
            audit::permission_resolved(&entry.groups, &key, result),
        );

        Some(Resolution {
            key,
            groups: entry.groups,
            result,
        })
    }
}

impl fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ============================================================================
// Pending handle
// ============================================================================

/// Removes the pending entry when the caller loses interest
struct CancelGuard {
    key: RequestKey,
    id: u64,
    pending: Weak<PendingMap>,
    audit: Arc<dyn AuditSink>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };

        let removed = {
            let mut map = lock_map(&pending);
            match map.get(&self.key) {
                Some(entry) if entry.id == self.id => map.remove(&self.key),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            tracing::debug!(request = %self.key.digest(), "Permission request withdrawn by caller");
            audit::emit(
                self.audit.as_ref(),
                audit::request_cancelled(&entry.groups, &self.key),
            );
        }
    }
}

enum PendingState {
    Ready(Option<PermissionsResult>),
    Waiting {
        rx: oneshot::Receiver<PermissionsResult>,
        guard: CancelGuard,
    },
}

/// Single-shot result of a permission request
///
/// Resolves when the OS answers. Dropping it before then withdraws the
/// request: the entry is removed and a late answer is ignored. The system
/// dialog itself stays on screen.
#[must_use = "dropping a PendingPermission withdraws the request"]
pub struct PendingPermission {
    state: PendingState,
}

impl PendingPermission {
    /// Already resolved, no dialog involved
    pub(crate) fn ready(result: PermissionsResult) -> Self {
        Self {
            state: PendingState::Ready(Some(result)),
        }
    }

    /// Whether the result was available without launching a dialog
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, PendingState::Ready(_))
    }

    /// Correlation key of the launched request
    pub fn key(&self) -> Option<&RequestKey> {
        match &self.state {
            PendingState::Ready(_) => None,
            PendingState::Waiting { guard, .. } => Some(&guard.key),
        }
    }
}

impl Future for PendingPermission {
    type Output = Result<PermissionsResult, PermissionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Ready(result) => {
                Poll::Ready(result.take().ok_or(PermissionError::RequestAbandoned))
            }
            PendingState::Waiting { rx, .. } => Pin::new(rx)
                .poll(cx)
                .map(|received| received.map_err(|_| PermissionError::RequestAbandoned)),
        }
    }
}

impl fmt::Debug for PendingPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPermission")
            .field("immediate", &self.is_immediate())
            .field("key", &self.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use rtperm_api::raw;

    fn correlator() -> (RequestCorrelator, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        (RequestCorrelator::new(audit.clone()), audit)
    }

    fn location_key() -> RequestKey {
        RequestKey::from_permissions(PermissionGroup::Location.raw_permissions())
    }

    #[tokio::test]
    async fn test_resolves_in_any_order() {
        let (correlator, audit) = correlator();
        let pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();
        assert_eq!(pending.key(), Some(&location_key()));

        // OS reports in a different order than launched
        let resolution = correlator
            .resolve(
                &[raw::ACCESS_COARSE_LOCATION, raw::ACCESS_FINE_LOCATION],
                &[GrantResult::Granted, GrantResult::Granted],
            )
            .unwrap();
        assert_eq!(resolution.groups, vec![PermissionGroup::Location]);

        let result = pending.await.unwrap();
        assert!(result.granted);
        assert!(result.was_asked_just_now);
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(
            audit.event_types(),
            vec![AuditEventType::PermissionGranted]
        );
    }

    #[tokio::test]
    async fn test_any_denial_denies() {
        let (correlator, _) = correlator();
        let pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();

        correlator.resolve(
            PermissionGroup::Location.raw_permissions(),
            &[GrantResult::Granted, GrantResult::Denied],
        );

        assert!(!pending.await.unwrap().granted);
    }

    #[tokio::test]
    async fn test_length_mismatch_is_denied() {
        let (correlator, _) = correlator();
        let pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();

        correlator.resolve(
            PermissionGroup::Location.raw_permissions(),
            &[GrantResult::Granted],
        );

        let result = pending.await.unwrap();
        assert!(!result.granted);
        assert!(result.was_asked_just_now);
    }

    #[test]
    fn test_second_registration_rejected() {
        let (correlator, _) = correlator();
        let _pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();

        let camera = RequestKey::from_permissions([raw::CAMERA]);
        let err = correlator
            .register(camera, &[PermissionGroup::Camera])
            .unwrap_err();
        assert!(matches!(err, PermissionError::ConcurrentRequest { .. }));
        assert_eq!(correlator.in_flight(), Some(location_key()));
    }

    #[test]
    fn test_unmatched_and_empty_callbacks_are_stale() {
        let (correlator, audit) = correlator();
        let _pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();

        assert!(correlator
            .resolve(&[raw::CAMERA], &[GrantResult::Granted])
            .is_none());
        assert!(correlator.resolve::<&str>(&[], &[]).is_none());

        assert_eq!(correlator.pending_count(), 1);
        assert_eq!(audit.find_by_type(AuditEventType::StaleCallback).len(), 2);
    }

    #[test]
    fn test_drop_withdraws_request() {
        let (correlator, audit) = correlator();
        let pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();
        drop(pending);

        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator
            .resolve(
                PermissionGroup::Location.raw_permissions(),
                &[GrantResult::Granted, GrantResult::Granted],
            )
            .is_none());
        assert_eq!(
            audit.event_types(),
            vec![
                AuditEventType::RequestCancelled,
                AuditEventType::StaleCallback
            ]
        );
    }

    #[tokio::test]
    async fn test_old_handle_does_not_cancel_new_request() {
        let (correlator, _) = correlator();
        let first = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();
        correlator.resolve(
            PermissionGroup::Location.raw_permissions(),
            &[GrantResult::Denied, GrantResult::Denied],
        );

        let second = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();
        drop(first);
        assert_eq!(correlator.pending_count(), 1);

        correlator.resolve(
            PermissionGroup::Location.raw_permissions(),
            &[GrantResult::Granted, GrantResult::Granted],
        );
        assert!(second.await.unwrap().granted);
    }

    #[tokio::test]
    async fn test_dropped_correlator_abandons_request() {
        let (correlator, _) = correlator();
        let pending = correlator
            .register(location_key(), &[PermissionGroup::Location])
            .unwrap();
        drop(correlator);

        assert!(matches!(
            pending.await,
            Err(PermissionError::RequestAbandoned)
        ));
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let pending = PendingPermission::ready(PermissionsResult::already_granted());
        assert!(pending.is_immediate());
        assert!(pending.key().is_none());
        assert_eq!(
            pending.await.unwrap(),
            PermissionsResult::already_granted()
        );
    }
}
