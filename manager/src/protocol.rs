//! The UI-surface protocol.
//!
//! UI surfaces never talk to the authenticated origin directly; they send one
//! of these tagged request shapes to the relay, which forwards trusted ones
//! to the privileged executor. The set is closed: anything that does not
//! deserialize into [`ControlMessage`] or [`SurfaceRequest`] is rejected as
//! unsupported rather than silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Surfaces we forward executor-bound requests for.
pub const TRUSTED_SURFACES: [&str; 2] = ["manager", "popup"];

/// Where a message came from. Filled in by the hosting shell, not by the
/// sender, so it can be trusted for routing decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceOrigin {
    /// Application instance id; messages from other applications are ignored
    /// outright.
    pub application: String,
    /// Which surface within the application sent this (`"manager"`,
    /// `"popup"`, `"player"`, ...).
    pub surface: String,
}

impl SurfaceOrigin {
    pub fn is_trusted_surface(&self) -> bool {
        TRUSTED_SURFACES.contains(&self.surface.as_str())
    }
}

/// A raw message as received from a surface, before shape validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub origin: SurfaceOrigin,
    pub body: Value,
}

/// The operation request set. One tag per operation; each variant carries
/// the minimal identifiers the operation needs. Most reach the executor;
/// the [`is_local`](SurfaceRequest::is_local) ones are served in-process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum SurfaceRequest {
    FetchWatchLater {
        /// Continuation from a previous page, for incremental loading. A
        /// request without one fetches the stream exhaustively.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    FetchPlaylist {
        playlist_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    FetchPlaylists,
    FetchSubscriptionFeed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    FetchChannels,
    AddToPlaylist {
        playlist_id: String,
        video_id: String,
    },
    RemoveItem {
        playlist_id: String,
        /// The per-playlist membership handle, not the video id.
        playlist_item_id: String,
    },
    MoveItem {
        playlist_id: String,
        playlist_item_id: String,
        /// `None` moves the item to the head of the playlist.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        move_after_item_id: Option<String>,
    },
    CreatePlaylist {
        title: String,
        video_ids: Vec<String>,
    },
    DeletePlaylist {
        playlist_id: String,
    },
    RenamePlaylist {
        playlist_id: String,
        title: String,
    },
    Subscribe {
        channel_id: String,
    },
    Unsubscribe {
        channel_id: String,
    },
    ToggleWatched {
        video_id: String,
    },
    HideVideo {
        video_id: String,
    },
    Undo,
}

impl SurfaceRequest {
    /// Requests that act on overlay and undo state owned by this process.
    /// The relay serves these from the local handler instead of forwarding
    /// them to the executor, which holds no such state.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SurfaceRequest::ToggleWatched { .. }
                | SurfaceRequest::HideVideo { .. }
                | SurfaceRequest::Undo
        )
    }
}

/// Messages the relay handles locally and never forwards to the executor.
/// Accepted from any surface of the same application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ControlMessage {
    /// Bring the manager UI to the front.
    FocusWindow,
}

/// Error taxonomy as it appears on the wire between contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Unauthenticated,
    RateLimited,
    ServerError,
    ClientError,
    Network,
    Delivery,
    Unsupported,
    Untrusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceError {
    pub kind: ErrorKind,
    /// HTTP status the classification came from, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl SurfaceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// The platform's ambiguous-conflict pattern on mutation endpoints.
    /// Whether it counts as success is the caller's policy decision.
    pub fn is_ambiguous_conflict(&self) -> bool {
        self.kind == ErrorKind::ClientError && self.status == Some(409)
    }
}

impl From<&innertube::ApiError> for SurfaceError {
    fn from(error: &innertube::ApiError) -> Self {
        use innertube::ApiError;
        let kind = match error {
            ApiError::Unauthenticated => ErrorKind::Unauthenticated,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::ServerError { .. } => ErrorKind::ServerError,
            ApiError::ClientError { .. } => ErrorKind::ClientError,
            ApiError::Network(_) => ErrorKind::Network,
        };
        Self {
            kind,
            status: error.status(),
            message: error.to_string(),
        }
    }
}

/// What goes back to the surface for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SurfaceError>,
}

impl SurfaceResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(error: SurfaceError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_tags_are_kebab_case_with_camel_case_fields() {
        let parsed: SurfaceRequest = serde_json::from_value(json!({
            "type": "remove-item",
            "playlistId": "WL",
            "playlistItemId": "56B44F6D10557CC6"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            SurfaceRequest::RemoveItem {
                playlist_id: "WL".to_string(),
                playlist_item_id: "56B44F6D10557CC6".to_string(),
            }
        );
    }

    #[test]
    fn unknown_shapes_do_not_deserialize() {
        assert!(serde_json::from_value::<SurfaceRequest>(json!({ "type": "mine-bitcoin" })).is_err());
        assert!(
            serde_json::from_value::<SurfaceRequest>(json!({
                "type": "remove-item",
                "playlistId": "WL",
                "playlistItemId": "x",
                "extra": true
            }))
            .is_err(),
            "unexpected fields are a different shape, not a lenient match"
        );
    }

    #[test]
    fn overlay_and_undo_tags_are_part_of_the_set_and_marked_local() {
        for (body, local) in [
            (json!({ "type": "toggle-watched", "videoId": "v0" }), true),
            (json!({ "type": "hide-video", "videoId": "v0" }), true),
            (json!({ "type": "undo" }), true),
            (json!({ "type": "fetch-playlists" }), false),
        ] {
            let parsed: SurfaceRequest = serde_json::from_value(body.clone()).unwrap();
            assert_eq!(parsed.is_local(), local, "{body}");
        }
    }

    #[test]
    fn control_messages_are_their_own_set() {
        let parsed: ControlMessage =
            serde_json::from_value(json!({ "type": "focus-window" })).unwrap();
        assert_eq!(parsed, ControlMessage::FocusWindow);
        assert!(serde_json::from_value::<ControlMessage>(json!({ "type": "fetch-watch-later" })).is_err());
    }

    #[test]
    fn ambiguous_conflict_detection() {
        let conflict = SurfaceError {
            kind: ErrorKind::ClientError,
            status: Some(409),
            message: "CONFLICT".to_string(),
        };
        assert!(conflict.is_ambiguous_conflict());

        let not_conflict = SurfaceError {
            kind: ErrorKind::ClientError,
            status: Some(400),
            message: String::new(),
        };
        assert!(!not_conflict.is_ambiguous_conflict());
    }

    #[test]
    fn responses_omit_empty_fields_on_the_wire() {
        let json = serde_json::to_value(SurfaceResponse::ok_empty()).unwrap();
        assert_eq!(json, json!({ "success": true }));

        let json = serde_json::to_value(SurfaceResponse::err(SurfaceError::new(
            ErrorKind::Unsupported,
            "unsupported message",
        )))
        .unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "unsupported");
    }
}
