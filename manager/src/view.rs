//! The serializable view-model handed to whatever renders the UI.
//!
//! Rendering, layout, and theming live outside this crate; this is the full
//! description of what the user is looking at, and it rides along in
//! mutation snapshots so undo restores selection and scroll position too.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tab {
    #[default]
    WatchLater,
    SubscriptionFeed,
    Playlists,
    Channels,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub tab: Tab,
    /// Index of the focused row within the currently visible (filtered) list.
    pub focus_index: usize,
    /// Multi-selection by entity id, for batch operations.
    pub selected: Vec<String>,
    /// Continuation token of the last loaded page, for explicit load-more.
    pub cursor: Option<String>,
}

impl ViewModel {
    /// Keeps the focus on a valid row after the visible list shrinks.
    pub fn clamp_focus(&mut self, visible_len: usize) {
        if visible_len == 0 {
            self.focus_index = 0;
        } else if self.focus_index >= visible_len {
            self.focus_index = visible_len - 1;
        }
    }
}
