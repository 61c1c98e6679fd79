//! Domain entities extracted from InnerTube responses.
//!
//! These are the stable shapes the rest of the application works with. The
//! raw wire format is treated as opaque; see [`crate::normalize`] for how
//! these get populated.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Playlist id of the built-in "Watch later" list.
pub const WATCH_LATER_ID: &str = "WL";

/// Playlist id of the built-in "Liked videos" list.
pub const LIKED_VIDEOS_ID: &str = "LL";

/// Whether a playlist id is one of the two reserved built-ins.
///
/// These are exposed through dedicated entry points and excluded from general
/// playlist enumeration.
pub fn is_reserved_playlist(id: &str) -> bool {
    id == WATCH_LATER_ID || id == LIKED_VIDEOS_ID
}

/// A single video as it appears in a feed or playlist.
///
/// Identity is the platform's global video id. The same video may appear in
/// many playlists; each membership carries its own [`playlist_item_id`]
/// removal handle.
///
/// [`playlist_item_id`]: Video::playlist_item_id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    /// Falls back to `"Unknown"` when the response carries no resolvable title.
    pub title: String,
    pub channel_name: String,
    pub channel_id: String,
    pub thumbnail_url: String,
    /// Display duration (`"12:34"` style), empty when not present.
    pub duration: String,
    /// Relative publish text as the platform renders it (`"3 days ago"`).
    pub published_at_text: String,
    /// Per-playlist membership handle, required for remove/move operations.
    ///
    /// Absent for read-only contexts such as subscription feed entries that
    /// are not members of any editable list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_item_id: Option<String>,
    /// Platform-reported watch progress in percent, 0..=100.
    pub watched_progress: u8,
}

impl Video {
    /// Absolute publish time derived from [`published_at_text`], if parseable.
    ///
    /// [`published_at_text`]: Video::published_at_text
    pub fn published_at(&self, now: Timestamp) -> Option<Timestamp> {
        crate::normalize::parse_relative_time(&self.published_at_text, now)
    }
}

/// A channel the user is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub thumbnail_url: String,
    pub subscriber_count_text: String,
    /// Derived, not authoritative: computed by scanning known video publish
    /// timestamps for this channel. May be stale or absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_upload: Option<Timestamp>,
}

/// A user-owned playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub video_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// One normalized domain object of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entity {
    Video(Video),
    Channel(Channel),
    Playlist(Playlist),
}

impl Entity {
    /// The platform-global id used for deduplication.
    pub fn id(&self) -> &str {
        match self {
            Entity::Video(v) => &v.id,
            Entity::Channel(c) => &c.id,
            Entity::Playlist(p) => &p.id,
        }
    }

    pub fn as_video(&self) -> Option<&Video> {
        match self {
            Entity::Video(v) => Some(v),
            _ => None,
        }
    }
}

/// The logical result stream a continuation cursor belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "camelCase")]
pub enum StreamKind {
    /// The subscriptions feed.
    SubscriptionFeed,
    /// The list of subscribed channels.
    ChannelList,
    /// The user's own playlists.
    PlaylistList,
    /// A specific playlist, including the reserved built-ins.
    Playlist { id: String },
}

impl StreamKind {
    /// The browse id that seeds a fetch of this stream.
    pub fn browse_id(&self) -> String {
        match self {
            StreamKind::SubscriptionFeed => "FEsubscriptions".to_string(),
            StreamKind::ChannelList => "FEchannels".to_string(),
            StreamKind::PlaylistList => "FEplaylist_aggregation".to_string(),
            StreamKind::Playlist { id } => format!("VL{id}"),
        }
    }
}

/// An opaque continuation token bound to the stream it came from.
///
/// A `None` cursor where one of these is expected means the stream is
/// exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub token: String,
    pub stream: StreamKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_playlists() {
        assert!(is_reserved_playlist("WL"));
        assert!(is_reserved_playlist("LL"));
        assert!(!is_reserved_playlist("PLxyz"));
    }

    #[test]
    fn browse_ids() {
        assert_eq!(StreamKind::SubscriptionFeed.browse_id(), "FEsubscriptions");
        assert_eq!(
            StreamKind::Playlist {
                id: "WL".to_string()
            }
            .browse_id(),
            "VLWL"
        );
    }

    #[test]
    fn entity_serialization_is_tagged() {
        let entity = Entity::Playlist(Playlist {
            id: "PLabc".to_string(),
            title: "Music".to_string(),
            video_count: 12,
            thumbnail_url: None,
        });
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["kind"], "playlist");
        assert_eq!(json["videoCount"], 12);
    }
}
