//! rtperm-api: Shared types for the rtperm runtime-permission library
//!
//! This crate defines the vocabulary shared by the manager and the platform
//! adapters: permission groups, the static table of raw OS permissions behind
//! each group, and the values a permission flow produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raw OS permission identifiers
pub mod raw {
    pub const CAMERA: &str = "android.permission.CAMERA";

    pub const ACCESS_FINE_LOCATION: &str = "android.permission.ACCESS_FINE_LOCATION";
    pub const ACCESS_COARSE_LOCATION: &str = "android.permission.ACCESS_COARSE_LOCATION";

    pub const RECORD_AUDIO: &str = "android.permission.RECORD_AUDIO";

    pub const READ_CALENDAR: &str = "android.permission.READ_CALENDAR";
    pub const WRITE_CALENDAR: &str = "android.permission.WRITE_CALENDAR";

    pub const READ_CONTACTS: &str = "android.permission.READ_CONTACTS";
    pub const WRITE_CONTACTS: &str = "android.permission.WRITE_CONTACTS";
    pub const GET_ACCOUNTS: &str = "android.permission.GET_ACCOUNTS";

    pub const READ_PHONE_STATE: &str = "android.permission.READ_PHONE_STATE";
    pub const CALL_PHONE: &str = "android.permission.CALL_PHONE";
    pub const READ_CALL_LOG: &str = "android.permission.READ_CALL_LOG";
    pub const WRITE_CALL_LOG: &str = "android.permission.WRITE_CALL_LOG";
    pub const ADD_VOICEMAIL: &str = "com.android.voicemail.permission.ADD_VOICEMAIL";
    pub const USE_SIP: &str = "android.permission.USE_SIP";
    pub const PROCESS_OUTGOING_CALLS: &str = "android.permission.PROCESS_OUTGOING_CALLS";

    pub const WRITE_EXTERNAL_STORAGE: &str = "android.permission.WRITE_EXTERNAL_STORAGE";
    pub const READ_EXTERNAL_STORAGE: &str = "android.permission.READ_EXTERNAL_STORAGE";

    pub const BODY_SENSORS: &str = "android.permission.BODY_SENSORS";

    pub const SEND_SMS: &str = "android.permission.SEND_SMS";
    pub const RECEIVE_SMS: &str = "android.permission.RECEIVE_SMS";
    pub const READ_SMS: &str = "android.permission.READ_SMS";
    pub const RECEIVE_WAP_PUSH: &str = "android.permission.RECEIVE_WAP_PUSH";
    pub const RECEIVE_MMS: &str = "android.permission.RECEIVE_MMS";
}

/// Static description of a permission group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    /// Raw permissions backing the group, in request order
    pub raw_permissions: &'static [&'static str],
    /// Key under which the "has asked" flag is persisted
    pub store_key: &'static str,
}

const CAMERA: GroupSpec = GroupSpec {
    raw_permissions: &[raw::CAMERA],
    store_key: "has_asked_for_camera",
};

const LOCATION: GroupSpec = GroupSpec {
    raw_permissions: &[raw::ACCESS_FINE_LOCATION, raw::ACCESS_COARSE_LOCATION],
    store_key: "has_asked_for_location",
};

const MICROPHONE: GroupSpec = GroupSpec {
    raw_permissions: &[raw::RECORD_AUDIO],
    store_key: "has_asked_for_audio_recording",
};

const CALENDAR: GroupSpec = GroupSpec {
    raw_permissions: &[raw::READ_CALENDAR, raw::WRITE_CALENDAR],
    store_key: "has_asked_for_calendar",
};

const CONTACTS: GroupSpec = GroupSpec {
    raw_permissions: &[raw::READ_CONTACTS, raw::WRITE_CONTACTS, raw::GET_ACCOUNTS],
    store_key: "has_asked_for_contacts",
};

const PHONE: GroupSpec = GroupSpec {
    raw_permissions: &[
        raw::READ_PHONE_STATE,
        raw::CALL_PHONE,
        raw::READ_CALL_LOG,
        raw::WRITE_CALL_LOG,
        raw::ADD_VOICEMAIL,
        raw::USE_SIP,
        raw::PROCESS_OUTGOING_CALLS,
    ],
    store_key: "has_asked_for_calling",
};

const STORAGE: GroupSpec = GroupSpec {
    raw_permissions: &[raw::WRITE_EXTERNAL_STORAGE, raw::READ_EXTERNAL_STORAGE],
    store_key: "has_asked_for_storage",
};

const BODY_SENSOR: GroupSpec = GroupSpec {
    raw_permissions: &[raw::BODY_SENSORS],
    store_key: "has_asked_for_body_sensors",
};

const SMS: GroupSpec = GroupSpec {
    raw_permissions: &[
        raw::SEND_SMS,
        raw::RECEIVE_SMS,
        raw::READ_SMS,
        raw::RECEIVE_WAP_PUSH,
        raw::RECEIVE_MMS,
    ],
    store_key: "has_asked_for_sms",
};

/// A user-facing permission group
///
/// A group is granted when at least one of its raw permissions is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionGroup {
    Camera,
    Location,
    Microphone,
    Calendar,
    Contacts,
    Phone,
    Storage,
    BodySensor,
    Sms,
}

impl PermissionGroup {
    /// Every group, in declaration order
    pub const ALL: [PermissionGroup; 9] = [
        Self::Camera,
        Self::Location,
        Self::Microphone,
        Self::Calendar,
        Self::Contacts,
        Self::Phone,
        Self::Storage,
        Self::BodySensor,
        Self::Sms,
    ];

    /// Static table entry for this group
    pub const fn spec(self) -> &'static GroupSpec {
        match self {
            Self::Camera => &CAMERA,
            Self::Location => &LOCATION,
            Self::Microphone => &MICROPHONE,
            Self::Calendar => &CALENDAR,
            Self::Contacts => &CONTACTS,
            Self::Phone => &PHONE,
            Self::Storage => &STORAGE,
            Self::BodySensor => &BODY_SENSOR,
            Self::Sms => &SMS,
        }
    }

    /// Raw permissions backing this group (never empty, stable order)
    pub const fn raw_permissions(self) -> &'static [&'static str] {
        self.spec().raw_permissions
    }

    /// Persistence key for the "has asked" flag
    pub const fn store_key(self) -> &'static str {
        self.spec().store_key
    }

    /// Kebab-case name of the group
    pub const fn name(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Location => "location",
            Self::Microphone => "microphone",
            Self::Calendar => "calendar",
            Self::Contacts => "contacts",
            Self::Phone => "phone",
            Self::Storage => "storage",
            Self::BodySensor => "body-sensor",
            Self::Sms => "sms",
        }
    }

    /// Find the group a raw OS permission belongs to
    pub fn for_raw(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|group| group.raw_permissions().iter().any(|p| *p == raw))
    }
}

impl fmt::Display for PermissionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Error returned when a group name cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown permission group: {0}")]
pub struct ParseGroupError(pub String);

impl FromStr for PermissionGroup {
    type Err = ParseGroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "camera" => Ok(Self::Camera),
            "location" => Ok(Self::Location),
            "microphone" | "audio" => Ok(Self::Microphone),
            "calendar" => Ok(Self::Calendar),
            "contacts" => Ok(Self::Contacts),
            "phone" | "calling" => Ok(Self::Phone),
            "storage" => Ok(Self::Storage),
            "body-sensor" | "body-sensors" | "sensors" => Ok(Self::BodySensor),
            "sms" => Ok(Self::Sms),
            _ => Err(ParseGroupError(s.to_string())),
        }
    }
}

/// Union of the raw permissions of several groups, first occurrence wins
pub fn collect_raw_permissions(groups: &[PermissionGroup]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for group in groups {
        for raw in group.raw_permissions() {
            if !out.contains(raw) {
                out.push(raw);
            }
        }
    }
    out
}

/// OS code for a granted permission
pub const PERMISSION_GRANTED: i32 = 0;

/// OS code for a denied permission
pub const PERMISSION_DENIED: i32 = -1;

/// Per-permission outcome delivered by the OS dialog callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantResult {
    Granted,
    Denied,
}

impl GrantResult {
    /// Map an OS result code; anything but `PERMISSION_GRANTED` is a denial
    pub fn from_code(code: i32) -> Self {
        if code == PERMISSION_GRANTED {
            Self::Granted
        } else {
            Self::Denied
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Granted => PERMISSION_GRANTED,
            Self::Denied => PERMISSION_DENIED,
        }
    }

    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Terminal outcome of a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsResult {
    /// Whether every requested permission ended up granted
    pub granted: bool,
    /// Whether the OS dialog actually ran for this result
    pub was_asked_just_now: bool,
}

impl PermissionsResult {
    /// Result for a request that was already satisfied without asking
    pub fn already_granted() -> Self {
        Self {
            granted: true,
            was_asked_just_now: false,
        }
    }

    /// Result derived from the OS callback
    pub fn from_grant_results(results: &[GrantResult]) -> Self {
        Self {
            granted: results.iter().all(|r| r.is_granted()),
            was_asked_just_now: true,
        }
    }
}

/// Point-in-time view of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group: PermissionGroup,
    pub granted: bool,
    pub has_asked: bool,
    /// May be true for a granted group that was asked before; see the inference docs
    pub never_ask_again: bool,
}

/// Correlation key for an in-flight request: the exact raw permission set
///
/// The set is sorted and de-duplicated, so callback order does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Vec<String>);

impl RequestKey {
    pub fn from_permissions<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut perms: Vec<String> = permissions
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        perms.sort();
        perms.dedup();
        Self(perms)
    }

    pub fn permissions(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable blake3 digest of the set (hex)
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for perm in &self.0 {
            hasher.update(perm.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}
