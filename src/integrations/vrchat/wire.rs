//! VRChat pipeline envelopes, REST payloads and location strings.

use crate::data::{HostRef, InstanceMetadata, OnlineStatus, SessionDetails, SessionMarker, WorldMetadata};
use crate::integrations::error::ApiError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// `wrld_<id>:<instance>` followed by `~tag(value)` modifiers
static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(wrld_[0-9A-Za-z-]+):([^~]+)((?:~.*)?)$").expect("valid regex")
});

/// Pipeline message; `content` is usually a JSON document encoded as a string
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

impl PipelineEnvelope {
    pub fn content<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        match &self.content {
            Value::String(encoded) => Ok(serde_json::from_str(encoded)?),
            other => Ok(T::deserialize(other)?),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendEvent {
    pub user_id: String,
    pub location: Option<String>,
    pub traveling_to_location: Option<String>,
    pub world_id: Option<String>,
    pub user: Option<VrcUser>,
    pub world: Option<VrcWorld>,
    pub platform: Option<String>,
}

/// `LimitedUser` / `User` as returned by the API and the pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrcUser {
    pub id: String,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub status_description: Option<String>,
    pub location: Option<String>,
    pub traveling_to_location: Option<String>,
    pub state: Option<String>,
}

impl VrcUser {
    pub fn online_status(&self) -> Option<OnlineStatus> {
        if self.state.as_deref() == Some("offline") {
            return Some(OnlineStatus::Offline);
        }
        self.status.as_deref().and_then(online_status)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrcWorld {
    pub id: String,
    pub name: String,
    pub author_name: Option<String>,
    pub description: Option<String>,
    pub capacity: Option<u32>,
    pub thumbnail_image_url: Option<String>,
}

impl VrcWorld {
    pub fn to_metadata(&self) -> WorldMetadata {
        WorldMetadata {
            world_id: self.id.clone(),
            name: self.name.clone(),
            author: self.author_name.clone(),
            description: self.description.clone(),
            capacity: self.capacity,
            thumbnail_url: self.thumbnail_image_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VrcInstance {
    pub location: Option<String>,
    pub instance_id: Option<String>,
    pub world_id: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub owner_id: Option<String>,
    pub capacity: Option<u32>,
    pub n_users: Option<u32>,
    pub user_count: Option<u32>,
    pub world: Option<VrcWorld>,
}

impl VrcInstance {
    /// Canonical metadata keyed by the full location string
    pub fn to_instance(&self, location: &str) -> InstanceMetadata {
        let markers = match parse_location(location) {
            Location::Instance(parsed) => Some(parsed.markers()),
            _ => None,
        };
        let space_name = self.world.as_ref().map(|w| w.name.clone());
        let name = self
            .display_name
            .clone()
            .or_else(|| self.name.as_ref().map(|n| format!("#{n}")));

        InstanceMetadata {
            session_id: location.to_string(),
            world_id: Some(self.world_id.clone()),
            name,
            space_name,
            details: SessionDetails {
                world_id: Some(self.world_id.clone()),
                host: self.owner_id.as_ref().map(|id| HostRef {
                    account_id: id.clone(),
                    display_name: None,
                }),
                capacity: self.capacity,
                attendance: self.user_count.or(self.n_users),
                participants: None,
                markers,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Offline,
    Private,
    Traveling,
    Instance(InstanceLocation),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLocation {
    /// The full location string; serves as the session id
    pub raw: String,
    pub world_id: String,
    pub instance: String,
    /// `~name(value)` modifiers in order of appearance
    pub tags: Vec<(String, Option<String>)>,
}

impl InstanceLocation {
    fn tag(&self, name: &str) -> Option<&(String, Option<String>)> {
        self.tags.iter().find(|(tag, _)| tag == name)
    }

    pub fn owner(&self) -> Option<&str> {
        ["private", "friends", "hidden", "group"]
            .iter()
            .find_map(|name| self.tag(name))
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn region(&self) -> Option<&str> {
        self.tag("region").and_then(|(_, value)| value.as_deref())
    }

    pub fn markers(&self) -> BTreeSet<SessionMarker> {
        let access = if self.tag("private").is_some() {
            SessionMarker::Private
        } else if self.tag("friends").is_some() {
            SessionMarker::FriendsOnly
        } else if self.tag("hidden").is_some() {
            SessionMarker::FriendsOfFriends
        } else if self.tag("group").is_some() {
            SessionMarker::Group
        } else {
            SessionMarker::Public
        };
        BTreeSet::from([access])
    }
}

pub fn parse_location(raw: &str) -> Location {
    match raw.trim() {
        "" => Location::Unknown,
        "offline" => Location::Offline,
        "private" => Location::Private,
        "traveling" => Location::Traveling,
        trimmed => match LOCATION_RE.captures(trimmed) {
            Some(caps) => Location::Instance(InstanceLocation {
                raw: trimmed.to_string(),
                world_id: caps[1].to_string(),
                instance: caps[2].to_string(),
                tags: parse_tags(&caps[3]),
            }),
            None => Location::Unknown,
        },
    }
}

fn parse_tags(modifiers: &str) -> Vec<(String, Option<String>)> {
    modifiers
        .split('~')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('(') {
            Some((name, rest)) => (name.to_string(), Some(rest.trim_end_matches(')').to_string())),
            None => (part.to_string(), None),
        })
        .collect()
}

pub fn online_status(raw: &str) -> Option<OnlineStatus> {
    match raw {
        "active" => Some(OnlineStatus::Online),
        "join me" => Some(OnlineStatus::Sociable),
        "ask me" => Some(OnlineStatus::AskMe),
        "busy" => Some(OnlineStatus::Busy),
        "offline" => Some(OnlineStatus::Offline),
        _ => None,
    }
}
