use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Platforms with a live communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Resonite,
    VRChat,
}

impl Platform {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resonite => "Resonite",
            Self::VRChat => "VRChat",
        }
    }

    /// Parse a platform name as given on the command line or in config
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "resonite" => Some(Self::Resonite),
            "vrchat" | "vrc" => Some(Self::VRChat),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Canonical online status across platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnlineStatus {
    Offline,
    Online,
    Away,
    Busy,
    /// Resonite "Sociable", VRChat "join me"
    Sociable,
    /// VRChat "ask me"
    AskMe,
    Invisible,
}

impl OnlineStatus {
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline | Self::Invisible)
    }
}

/// Registry-assigned, process-unique session id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LiveSessionId(pub u64);

impl fmt::Display for LiveSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "live-{}", self.0)
    }
}

/// A session whose identity has been established
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownSession {
    /// In-platform session identifier
    pub session_id: String,
    /// Filled in by the registry once the session record exists
    pub assigned_id: Option<LiveSessionId>,
    pub name: Option<String>,
    pub space_name: Option<String>,
}

impl KnownSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            assigned_id: None,
            name: None,
            space_name: None,
        }
    }
}

/// How much is known about a user's current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionKnowledge {
    #[default]
    Indeterminate,
    Known(KnownSession),
    /// A session exists but its details are not cached (yet)
    KnownButNoData,
    PrivateWorld,
    Traveling,
    Offline,
}

impl SessionKnowledge {
    pub fn known(&self) -> Option<&KnownSession> {
        match self {
            Self::Known(k) => Some(k),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Indeterminate => "indeterminate",
            Self::Known(_) => "known",
            Self::KnownButNoData => "known (no data)",
            Self::PrivateWorld => "private world",
            Self::Traveling => "traveling",
            Self::Offline => "offline",
        }
    }
}

/// Derived state of the user's main (focused) session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MainSessionState {
    pub knowledge: SessionKnowledge,
    /// Raw platform reference (VRChat location string, Resonite session hash)
    pub reference: Option<String>,
}

impl MainSessionState {
    pub fn new(knowledge: SessionKnowledge) -> Self {
        Self {
            knowledge,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// What caused a user update to be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateTrigger {
    InitialPoll,
    StatusPush,
    LocationPush,
    ProfilePush,
    OfflinePush,
    Refresh,
}

/// Live presence of one account on one platform.
///
/// Every field except the key is optional: an absent field means "no new
/// information", never "clear the value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUserUpdate {
    pub platform: Platform,
    pub account_id: String,
    pub display_name: Option<String>,
    pub online_status: Option<OnlineStatus>,
    pub custom_status: Option<String>,
    pub main_session: Option<MainSessionState>,
    pub trigger: Option<UpdateTrigger>,
    pub connection_id: Option<Uuid>,
}

impl LiveUserUpdate {
    pub fn new(platform: Platform, account_id: impl Into<String>) -> Self {
        Self {
            platform,
            account_id: account_id.into(),
            display_name: None,
            online_status: None,
            custom_status: None,
            main_session: None,
            trigger: None,
            connection_id: None,
        }
    }

    pub fn key(&self) -> UserKey {
        UserKey {
            platform: self.platform,
            account_id: self.account_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub platform: Platform,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub platform: Platform,
    pub session_id: String,
}

/// Access and hosting properties of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionMarker {
    Public,
    Private,
    FriendsOnly,
    FriendsOfFriends,
    RegisteredUsers,
    Group,
    Lan,
    Headless,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRef {
    pub account_id: String,
    pub display_name: Option<String>,
}

/// Non-display fields of a session, merged non-destructively
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionDetails {
    pub world_id: Option<String>,
    pub host: Option<HostRef>,
    pub capacity: Option<u32>,
    pub attendance: Option<u32>,
    pub participants: Option<Vec<String>>,
    pub markers: Option<BTreeSet<SessionMarker>>,
}

impl SessionDetails {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Session as reported by a communicator, before the registry indexes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonIndexedSession {
    pub platform: Platform,
    pub session_id: String,
    pub name: Option<String>,
    pub space_name: Option<String>,
    pub details: SessionDetails,
}

impl NonIndexedSession {
    pub fn new(platform: Platform, session_id: impl Into<String>) -> Self {
        Self {
            platform,
            session_id: session_id.into(),
            name: None,
            space_name: None,
            details: SessionDetails::default(),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            platform: self.platform,
            session_id: self.session_id.clone(),
        }
    }
}

/// Canonical live session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    pub id: LiveSessionId,
    pub platform: Platform,
    pub session_id: String,
    pub name: Option<String>,
    pub space_name: Option<String>,
    pub world_id: Option<String>,
    pub host: Option<HostRef>,
    pub capacity: Option<u32>,
    pub attendance: Option<u32>,
    pub participants: Vec<String>,
    pub markers: BTreeSet<SessionMarker>,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entry of the hash resolver's candidate pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBrief {
    pub session_id: String,
    pub assigned_id: LiveSessionId,
}

/// Descriptive world data fetched in the background
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMetadata {
    pub world_id: String,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub capacity: Option<u32>,
    pub thumbnail_url: Option<String>,
}

/// Descriptive instance/session data fetched in the background
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub session_id: String,
    pub world_id: Option<String>,
    pub name: Option<String>,
    pub space_name: Option<String>,
    pub details: SessionDetails,
}

impl InstanceMetadata {
    pub fn to_session(&self, platform: Platform) -> NonIndexedSession {
        NonIndexedSession {
            platform,
            session_id: self.session_id.clone(),
            name: self.name.clone(),
            space_name: self.space_name.clone(),
            details: self.details.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_from_name_accepts_aliases() {
        assert_eq!(Platform::from_name("Resonite"), Some(Platform::Resonite));
        assert_eq!(Platform::from_name(" vrc "), Some(Platform::VRChat));
        assert_eq!(Platform::from_name("neos"), None);
    }

    #[test]
    fn invisible_counts_as_offline() {
        assert!(OnlineStatus::Invisible.is_offline());
        assert!(!OnlineStatus::Busy.is_offline());
    }

    #[test]
    fn empty_details() {
        assert!(SessionDetails::default().is_empty());
        let details = SessionDetails {
            capacity: Some(16),
            ..Default::default()
        };
        assert!(!details.is_empty());
    }
}
