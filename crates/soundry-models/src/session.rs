//! Session references to tracks and playlist groups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ModelError;
use crate::track::TrackId;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a playlist-style group.
    GroupId
);
string_id!(
    /// Identifier of a session's reference to a track.
    SessionItemId
);

/// An expanded multi-track request (playlist or album).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGroup {
    pub id: GroupId,
    pub session_token: String,
    pub title: String,
    pub total_tracks: u32,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionGroup {
    pub fn new(
        session_token: impl Into<String>,
        title: impl Into<String>,
        total_tracks: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GroupId::new(),
            session_token: session_token.into(),
            title: title.into(),
            total_tracks,
            paused: false,
            created_at: now,
        }
    }

    pub fn is_multi_item(&self) -> bool {
        self.total_tracks > 1
    }
}

/// How a session came to reference a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    /// Submitted by the session.
    #[default]
    Requested,
    /// Attached because the media was already converted.
    Downloaded,
}

impl ItemSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemSource::Requested => "requested",
            ItemSource::Downloaded => "downloaded",
        }
    }
}

impl FromStr for ItemSource {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(ItemSource::Requested),
            "downloaded" => Ok(ItemSource::Downloaded),
            other => Err(ModelError::unknown("item source", other)),
        }
    }
}

/// A session's reference to a track. Deleting it never deletes the track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionItem {
    pub id: SessionItemId,
    pub session_token: String,
    pub track_id: TrackId,
    pub group_id: Option<GroupId>,
    pub source: ItemSource,
    pub created_at: DateTime<Utc>,
}

impl SessionItem {
    pub fn new(
        session_token: impl Into<String>,
        track_id: TrackId,
        group_id: Option<GroupId>,
        source: ItemSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionItemId::new(),
            session_token: session_token.into(),
            track_id,
            group_id,
            source,
            created_at: now,
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::for_item(self.group_id.as_ref(), &self.session_token)
    }
}

/// Fairness key: the owning group if any, else the session itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    Group(GroupId),
    Session(String),
}

impl GroupKey {
    pub fn for_item(group_id: Option<&GroupId>, session_token: &str) -> Self {
        match group_id {
            Some(id) => GroupKey::Group(id.clone()),
            None => GroupKey::Session(session_token.to_string()),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Group(id) => write!(f, "group:{id}"),
            GroupKey::Session(token) => write!(f, "session:{token}"),
        }
    }
}
