//! Audit trail for permission requests
//!
//! Every request, outcome, rejection and stale callback can be recorded to an
//! [`AuditSink`]. Sink failures are logged and never fail the request itself.

use chrono::{SecondsFormat, Utc};
use rtperm_api::{PermissionGroup, PermissionsResult, RequestKey};
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// RFC 3339 timestamp
pub type Timestamp = String;

fn now_rfc3339() -> Timestamp {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Audit event for one step of a permission request
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: Timestamp,
    pub event_type: AuditEventType,
    /// Groups involved (empty when the callback matched nothing)
    pub groups: Vec<PermissionGroup>,
    /// blake3 digest of the request key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, groups: &[PermissionGroup]) -> Self {
        Self {
            timestamp: now_rfc3339(),
            event_type,
            groups: groups.to_vec(),
            request_hash: None,
            reason: None,
        }
    }

    pub fn with_key(mut self, key: &RequestKey) -> Self {
        self.request_hash = Some(key.digest());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Type of audit event
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The system dialog was launched
    PermissionRequested,
    PermissionGranted,
    PermissionDenied,
    /// The caller dropped its pending handle before the answer arrived
    RequestCancelled,
    /// A request failed a precondition
    RequestRejected,
    /// A callback matched no pending request
    StaleCallback,
    /// The asked registry was cleared
    RegistryReset,
    SettingsOpened,
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize audit event: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Flush any buffered events
    fn flush(&self) -> Result<(), AuditError>;
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        (**self).record(event)
    }

    fn flush(&self) -> Result<(), AuditError> {
        (**self).flush()
    }
}

/// Record an event, logging instead of failing
pub(crate) fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let event_type = event.event_type;
    if let Err(e) = sink.record(event) {
        tracing::warn!(error = %e, ?event_type, "Failed to record audit event");
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

/// File-based audit sink (JSON Lines)
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory audit sink for testing
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Memory sink with default capacity (1000 events)
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::with_capacity(max_events.min(1000))),
            max_events,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Event types in recording order
    pub fn event_types(&self) -> Vec<AuditEventType> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.event_type)
            .collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.max_events {
            events.remove(0); // FIFO eviction
        }
        events.push(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("count", &self.count())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Null audit sink (discards all events)
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl NullAuditSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

pub fn permission_requested(groups: &[PermissionGroup], key: &RequestKey) -> AuditEvent {
    AuditEvent::new(AuditEventType::PermissionRequested, groups).with_key(key)
}

/// Granted or denied, depending on the result
pub fn permission_resolved(
    groups: &[PermissionGroup],
    key: &RequestKey,
    result: PermissionsResult,
) -> AuditEvent {
    let event_type = if result.granted {
        AuditEventType::PermissionGranted
    } else {
        AuditEventType::PermissionDenied
    };
    AuditEvent::new(event_type, groups).with_key(key)
}

pub fn request_cancelled(groups: &[PermissionGroup], key: &RequestKey) -> AuditEvent {
    AuditEvent::new(AuditEventType::RequestCancelled, groups).with_key(key)
}

pub fn request_rejected(groups: &[PermissionGroup], reason: &str) -> AuditEvent {
    AuditEvent::new(AuditEventType::RequestRejected, groups).with_reason(reason)
}

pub fn stale_callback(key: &RequestKey) -> AuditEvent {
    let event = AuditEvent::new(AuditEventType::StaleCallback, &[]);
    if key.is_empty() {
        event.with_reason("interrupted")
    } else {
        event.with_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtperm_api::raw;

    fn camera_key() -> RequestKey {
        RequestKey::from_permissions([raw::CAMERA])
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryAuditSink::new();
        sink.record(permission_requested(&[PermissionGroup::Camera], &camera_key()))
            .unwrap();

        assert_eq!(sink.count(), 1);
        let events = sink.find_by_type(AuditEventType::PermissionRequested);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].groups, vec![PermissionGroup::Camera]);
        assert_eq!(events[0].request_hash, Some(camera_key().digest()));
    }

    #[test]
    fn test_memory_sink_eviction() {
        let sink = MemoryAuditSink::with_capacity(2);
        let groups = [
            PermissionGroup::Camera,
            PermissionGroup::Sms,
            PermissionGroup::Phone,
        ];

        for group in groups {
            sink.record(request_rejected(&[group], "busy")).unwrap();
        }

        assert_eq!(sink.count(), 2);
        let events = sink.events();
        assert_eq!(events[0].groups, vec![PermissionGroup::Sms]);
        assert_eq!(events[1].groups, vec![PermissionGroup::Phone]);
    }

    #[test]
    fn test_resolved_event_type() {
        let key = camera_key();
        let granted = PermissionsResult {
            granted: true,
            was_asked_just_now: true,
        };
        let denied = PermissionsResult {
            granted: false,
            was_asked_just_now: true,
        };
        assert_eq!(
            permission_resolved(&[PermissionGroup::Camera], &key, granted).event_type,
            AuditEventType::PermissionGranted
        );
        assert_eq!(
            permission_resolved(&[PermissionGroup::Camera], &key, denied).event_type,
            AuditEventType::PermissionDenied
        );
    }

    #[test]
    fn test_stale_interrupted_has_reason() {
        let event = stale_callback(&RequestKey::from_permissions(Vec::<String>::new()));
        assert_eq!(event.reason.as_deref(), Some("interrupted"));
        assert!(event.request_hash.is_none());
    }

    #[test]
    fn test_null_sink() {
        let sink = NullAuditSink::new();
        assert!(sink.record(stale_callback(&camera_key())).is_ok());
        assert!(sink.flush().is_ok());
    }

    #[test]
    fn test_event_serialization() {
        let event = request_rejected(&[PermissionGroup::BodySensor], "already requesting");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"request_rejected\""));
        assert!(json.contains("\"body-sensor\""));
        assert!(json.contains("already requesting"));
        assert!(!json.contains("request_hash"));
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = FileAuditSink::new(&path).unwrap();
        sink.record(permission_requested(&[PermissionGroup::Camera], &camera_key()))
            .unwrap();
        sink.record(stale_callback(&camera_key())).unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("permission_requested"));
        assert!(lines[1].contains("stale_callback"));
    }
}
