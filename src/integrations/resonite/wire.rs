//! Resonite hub framing and payloads.
//!
//! The hub speaks the SignalR JSON protocol: every message is a JSON object
//! terminated by the record separator `0x1E`, and one websocket frame may
//! carry several messages.

use crate::data::{HostRef, InstanceMetadata, OnlineStatus, SessionDetails, SessionMarker};
use crate::util::strip_markup;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;

pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const MSG_INVOCATION: u8 = 1;
pub const MSG_COMPLETION: u8 = 3;
pub const MSG_PING: u8 = 6;
pub const MSG_CLOSE: u8 = 7;

pub const TARGET_STATUS_UPDATE: &str = "ReceiveStatusUpdate";
pub const TARGET_SESSION_UPDATE: &str = "ReceiveSessionUpdate";
pub const TARGET_REMOVE_SESSION: &str = "RemoveSession";
pub const TARGET_REQUEST_STATUS: &str = "RequestStatus";
pub const TARGET_LISTEN_ON_CONTACT: &str = "ListenOnContact";

pub fn handshake_frame() -> String {
    format!("{}{}", json!({"protocol": "json", "version": 1}), RECORD_SEPARATOR)
}

pub fn ping_frame() -> String {
    format!("{}{}", json!({"type": MSG_PING}), RECORD_SEPARATOR)
}

/// Fire-and-forget invocation (no invocation id, no completion expected)
pub fn invocation_frame(target: &str, arguments: Vec<Value>) -> String {
    let message = json!({
        "type": MSG_INVOCATION,
        "target": target,
        "arguments": arguments,
    });
    format!("{}{}", message, RECORD_SEPARATOR)
}

/// Split a websocket frame into hub messages
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

/// One hub message; the handshake ack is `{}` and has no type
#[derive(Debug, Clone, Deserialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: Option<u8>,
    pub target: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: String,
    pub online_status: Option<String>,
    pub user_session_id: Option<String>,
    pub current_session_index: Option<i32>,
    #[serde(default)]
    pub sessions: Vec<UserSessionMetadata>,
    pub hash_salt: Option<String>,
    pub app_version: Option<String>,
}

impl UserStatus {
    /// Entry the user is focused on, if any
    pub fn current_session(&self) -> Option<&UserSessionMetadata> {
        let index = usize::try_from(self.current_session_index?).ok()?;
        self.sessions.get(index)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionMetadata {
    pub session_hash: Option<String>,
    pub access_level: Option<String>,
    #[serde(default)]
    pub session_hidden: bool,
    #[serde(default)]
    pub is_host: bool,
}

impl UserSessionMetadata {
    pub fn is_private(&self) -> bool {
        self.session_hidden || self.access_level.as_deref() == Some("Private")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordId {
    pub id: String,
    pub owner_id: String,
}

impl RecordId {
    /// Canonical world id, `owner/record`
    pub fn world_id(&self) -> String {
        format!("{}/{}", self.owner_id, self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub username: Option<String>,
    #[serde(rename = "userID")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_present: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub name: Option<String>,
    pub host_user_id: Option<String>,
    pub host_username: Option<String>,
    pub corresponding_world_id: Option<RecordId>,
    pub joined_users: Option<u32>,
    pub active_users: Option<u32>,
    pub maximum_users: Option<u32>,
    #[serde(default)]
    pub session_users: Vec<SessionUser>,
    pub access_level: Option<String>,
    #[serde(default)]
    pub headless_host: bool,
    #[serde(default)]
    pub hide_from_listing: bool,
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub has_ended: bool,
}

impl SessionInfo {
    pub fn details(&self) -> SessionDetails {
        let host = self.host_user_id.as_ref().map(|id| HostRef {
            account_id: id.clone(),
            display_name: self.host_username.clone(),
        });

        let participants: Vec<String> = self
            .session_users
            .iter()
            .filter_map(|u| u.user_id.clone().or_else(|| u.username.clone()))
            .collect();

        let mut markers = BTreeSet::new();
        if let Some(marker) = self.access_level.as_deref().and_then(access_marker) {
            markers.insert(marker);
        }
        if self.headless_host {
            markers.insert(SessionMarker::Headless);
        }
        if self.hide_from_listing {
            markers.insert(SessionMarker::Hidden);
        }

        SessionDetails {
            world_id: self.corresponding_world_id.as_ref().map(RecordId::world_id),
            host,
            capacity: self.maximum_users,
            attendance: self.joined_users,
            participants: (!participants.is_empty()).then_some(participants),
            markers: (!markers.is_empty()).then_some(markers),
        }
    }

    pub fn to_instance(&self) -> InstanceMetadata {
        let details = self.details();
        InstanceMetadata {
            session_id: self.session_id.clone(),
            world_id: details.world_id.clone(),
            name: self.name.as_deref().map(strip_markup),
            space_name: None,
            details,
        }
    }
}

/// World record as returned by the records endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub owner_name: Option<String>,
    pub description: Option<String>,
    pub thumbnail_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub contact_username: Option<String>,
    pub contact_status: Option<String>,
    #[serde(default)]
    pub is_accepted: bool,
}

impl Contact {
    pub fn is_friend(&self) -> bool {
        self.is_accepted || self.contact_status.as_deref() == Some("Accepted")
    }
}

pub fn online_status(raw: &str) -> Option<OnlineStatus> {
    match raw {
        "Online" => Some(OnlineStatus::Online),
        "Away" => Some(OnlineStatus::Away),
        "Busy" => Some(OnlineStatus::Busy),
        "Sociable" => Some(OnlineStatus::Sociable),
        "Invisible" => Some(OnlineStatus::Invisible),
        "Offline" => Some(OnlineStatus::Offline),
        _ => None,
    }
}

pub fn access_marker(raw: &str) -> Option<SessionMarker> {
    match raw {
        "Anyone" => Some(SessionMarker::Public),
        "RegisteredUsers" => Some(SessionMarker::RegisteredUsers),
        "ContactsPlus" => Some(SessionMarker::FriendsOfFriends),
        "Contacts" => Some(SessionMarker::FriendsOnly),
        "LAN" => Some(SessionMarker::Lan),
        "Private" => Some(SessionMarker::Private),
        _ => None,
    }
}

/// Map `resdb:///<hash>.<ext>` asset links to the public asset host
pub fn asset_url(uri: &str, assets_url: &str) -> String {
    match uri.strip_prefix("resdb:///") {
        Some(asset) => {
            let hash = asset.split('.').next().unwrap_or(asset);
            format!("{}/{}", assets_url.trim_end_matches('/'), hash)
        }
        None => uri.to_string(),
    }
}
