//! Optimistic mutation coordination.
//!
//! Every mutating user action is applied to the local cache immediately and
//! confirmed against the platform in the background, so the UI never waits
//! on the network. Reconciliation applies the one policy the transport
//! refuses to: the platform's mutation endpoints frequently answer 409 for
//! operations that actually succeeded, so an ambiguous conflict counts as
//! success here. Any other failure is reported as a partial-failure notice
//! with the failed count, and the optimistic state is left in place; local
//! and remote may diverge until the next full reload or an explicit undo.
//!
//! Undo is a bounded stack of [`PendingMutation`]s, each carrying enough
//! prior state to invert the action both locally (snapshot restore) and
//! remotely (inverse calls). Batch mutations are one entry; undo of a batch
//! is all-or-nothing.

use crate::protocol::{ErrorKind, SurfaceRequest, SurfaceResponse};
use crate::relay::{CrossContextRelay, RelayError};
use crate::store::{Store, WatchedOverride};
use crate::view::{Tab, ViewModel};
use eyre::Context;
use innertube::{Channel, Playlist, Video};
use jiff::{SignedDuration, Timestamp};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Maximum undo depth; the oldest entry drops silently beyond this.
const UNDO_DEPTH: usize = 30;

/// Platform progress at or above this counts as watched.
const WATCHED_THRESHOLD: u8 = 90;

/// Watched overrides older than this that did not appear in the last full
/// load are pruned.
const OVERRIDE_RETENTION: SignedDuration = SignedDuration::from_hours(90 * 24);

/// User-facing reports from background reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Some items of a batch failed remotely; local state was kept.
    PartialFailure {
        operation: &'static str,
        failed: usize,
        total: usize,
    },
    /// The whole operation failed and was rolled back locally.
    Failed { operation: &'static str },
    /// The session is gone; the user must re-authenticate with the platform.
    Reauthenticate,
}

/// What a mutation needs to invert itself remotely.
#[derive(Debug, Clone)]
enum MutationKind {
    RemoveVideos {
        playlist_id: String,
        removed: Vec<Video>,
    },
    MoveVideo {
        playlist_id: String,
        playlist_item_id: String,
        /// The item's predecessor before the move; `None` means it was at
        /// the head.
        previous_after: Option<String>,
    },
    DeletePlaylist {
        playlist: Playlist,
        /// Memberships at deletion time, for re-creation on undo. Empty when
        /// the playlist's contents were never loaded this session.
        video_ids: Vec<String>,
    },
    CreatePlaylist {
        playlist_id: String,
    },
    Subscribe {
        channel: Channel,
    },
    Unsubscribe {
        channel: Channel,
    },
}

/// One undoable action.
#[derive(Debug, Clone)]
struct PendingMutation {
    kind: MutationKind,
    affected: Vec<String>,
    snapshot: Snapshot,
    timestamp: Timestamp,
}

/// Local state as it was before a mutation. Restored wholesale on undo so
/// selection and scroll position come back too.
#[derive(Debug, Clone)]
struct Snapshot {
    videos: Vec<Video>,
    playlists: Vec<Playlist>,
    channels: Vec<Channel>,
    view: ViewModel,
}

#[derive(Default)]
struct State {
    videos: Vec<Video>,
    playlists: Vec<Playlist>,
    channels: Vec<Channel>,
    view: ViewModel,
    undo: VecDeque<PendingMutation>,
    watched_overrides: HashMap<String, WatchedOverride>,
    hidden: HashSet<String>,
    hide_watched: bool,
    last_upload_by_channel: HashMap<String, Timestamp>,
}

impl State {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            videos: self.videos.clone(),
            playlists: self.playlists.clone(),
            channels: self.channels.clone(),
            view: self.view.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.videos = snapshot.videos;
        self.playlists = snapshot.playlists;
        self.channels = snapshot.channels;
        self.view = snapshot.view;
    }

    fn push_undo(&mut self, mutation: PendingMutation) {
        if self.undo.len() == UNDO_DEPTH {
            self.undo.pop_front();
        }
        self.undo.push_back(mutation);
    }

    /// Platform progress with the user's override applied: a watched
    /// override pins 100, clearing it falls back to platform data.
    fn effective_progress(&self, video: &Video) -> u8 {
        match self.watched_overrides.get(&video.id) {
            Some(o) if o.watched => 100,
            _ => video.watched_progress,
        }
    }

    fn is_watched(&self, video: &Video) -> bool {
        match self.watched_overrides.get(&video.id) {
            Some(o) => o.watched,
            None => video.watched_progress >= WATCHED_THRESHOLD,
        }
    }

    fn is_visible(&self, video: &Video) -> bool {
        !self.hidden.contains(&video.id) && !(self.hide_watched && self.is_watched(video))
    }

    fn visible_count(&self) -> usize {
        self.videos.iter().filter(|v| self.is_visible(v)).count()
    }
}

/// See the module docs. Cheap to clone; clones share the cache, undo stack,
/// and overlays.
#[derive(Clone)]
pub struct OptimisticMutationCoordinator {
    relay: CrossContextRelay,
    store: Store,
    state: Arc<Mutex<State>>,
    notices: mpsc::Sender<Notice>,
}

impl OptimisticMutationCoordinator {
    pub fn new(relay: CrossContextRelay, store: Store, notices: mpsc::Sender<Notice>) -> Self {
        Self {
            relay,
            store,
            state: Arc::new(Mutex::new(State::default())),
            notices,
        }
    }

    /// Loads the persisted overlays into the in-memory cache. Call once at
    /// startup, before the first fetch.
    pub async fn hydrate(&self) -> eyre::Result<()> {
        let persisted = self.store.load().await?;
        let mut state = self.state.lock().await;
        state.watched_overrides = persisted.watched_overrides;
        state.hidden = persisted.hidden_videos;
        state.hide_watched = persisted.settings.hide_watched;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The filtered video list as the UI should render it, with effective
    /// (override-aware) progress substituted in.
    pub async fn visible_videos(&self) -> Vec<Video> {
        let state = self.state.lock().await;
        state
            .videos
            .iter()
            .filter(|v| state.is_visible(v))
            .map(|v| {
                let mut v = v.clone();
                v.watched_progress = state.effective_progress(&v);
                v
            })
            .collect()
    }

    pub async fn playlists(&self) -> Vec<Playlist> {
        self.state.lock().await.playlists.clone()
    }

    /// Subscribed channels with derived `last_upload` filled in from videos
    /// observed this session.
    pub async fn channels(&self) -> Vec<Channel> {
        let state = self.state.lock().await;
        state
            .channels
            .iter()
            .map(|c| {
                let mut c = c.clone();
                c.last_upload = state.last_upload_by_channel.get(&c.id).copied();
                c
            })
            .collect()
    }

    pub async fn view(&self) -> ViewModel {
        self.state.lock().await.view.clone()
    }

    pub async fn undo_depth(&self) -> usize {
        self.state.lock().await.undo.len()
    }

    // =========================================================================
    // Fetches
    // =========================================================================

    pub async fn load_watch_later(&self, cursor: Option<String>) -> eyre::Result<()> {
        let response = self
            .relay
            .forward(SurfaceRequest::FetchWatchLater {
                cursor: cursor.clone(),
            })
            .await?;
        self.apply_video_load(response, Tab::WatchLater, cursor.is_some())
            .await
    }

    pub async fn load_playlist(
        &self,
        playlist_id: &str,
        cursor: Option<String>,
    ) -> eyre::Result<()> {
        let response = self
            .relay
            .forward(SurfaceRequest::FetchPlaylist {
                playlist_id: playlist_id.to_string(),
                cursor: cursor.clone(),
            })
            .await?;
        self.apply_video_load(response, Tab::Playlists, cursor.is_some())
            .await
    }

    pub async fn load_subscription_feed(&self, cursor: Option<String>) -> eyre::Result<()> {
        let response = self
            .relay
            .forward(SurfaceRequest::FetchSubscriptionFeed {
                cursor: cursor.clone(),
            })
            .await?;
        self.apply_video_load(response, Tab::SubscriptionFeed, cursor.is_some())
            .await
    }

    pub async fn load_playlists(&self) -> eyre::Result<()> {
        let response = self.relay.forward(SurfaceRequest::FetchPlaylists).await?;
        let data = self.expect_success(response, "fetch-playlists")?;
        let playlists: Vec<Playlist> = serde_json::from_value(data["playlists"].clone())
            .context("parse playlists payload")?;
        let mut state = self.state.lock().await;
        state.playlists = playlists;
        state.view.tab = Tab::Playlists;
        Ok(())
    }

    pub async fn load_channels(&self) -> eyre::Result<()> {
        let response = self.relay.forward(SurfaceRequest::FetchChannels).await?;
        let data = self.expect_success(response, "fetch-channels")?;
        let channels: Vec<Channel> = serde_json::from_value(data["channels"].clone())
            .context("parse channels payload")?;
        let mut state = self.state.lock().await;
        state.channels = channels;
        state.view.tab = Tab::Channels;
        Ok(())
    }

    async fn apply_video_load(
        &self,
        response: SurfaceResponse,
        tab: Tab,
        append: bool,
    ) -> eyre::Result<()> {
        let data = self.expect_success(response, "fetch")?;
        let videos: Vec<Video> =
            serde_json::from_value(data["videos"].clone()).context("parse videos payload")?;
        let cursor = data["cursor"].as_str().map(str::to_string);
        let now = Timestamp::now();

        let loaded_ids = {
            let mut state = self.state.lock().await;
            for video in &videos {
                if let Some(at) = video.published_at(now) {
                    let entry = state
                        .last_upload_by_channel
                        .entry(video.channel_id.clone())
                        .or_insert(at);
                    if at > *entry {
                        *entry = at;
                    }
                }
            }
            if append {
                let known: HashSet<String> =
                    state.videos.iter().map(|v| v.id.clone()).collect();
                state
                    .videos
                    .extend(videos.into_iter().filter(|v| !known.contains(&v.id)));
            } else {
                state.videos = videos;
            }
            state.view.tab = tab;
            state.view.cursor = cursor;
            let visible = state.visible_count();
            state.view.clamp_focus(visible);
            state.videos.iter().map(|v| v.id.clone()).collect()
        };

        // Overrides are pruned against full loads only; a single appended
        // page is not evidence of absence.
        if !append {
            self.prune_overrides(&loaded_ids).await?;
        }
        Ok(())
    }

    fn expect_success(
        &self,
        response: SurfaceResponse,
        operation: &str,
    ) -> eyre::Result<serde_json::Value> {
        if response.success {
            return Ok(response.data.unwrap_or(serde_json::Value::Null));
        }
        if let Some(error) = &response.error
            && error.kind == ErrorKind::Unauthenticated
        {
            let _ = self.notices.try_send(Notice::Reauthenticate);
        }
        let message = response
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown failure".to_string());
        eyre::bail!("{operation} failed: {message}")
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Removes the given videos from a playlist: the local list updates
    /// immediately, the remote calls complete in the background (returned as
    /// a join handle so callers can await completion when they care). One
    /// undo entry covers the whole batch.
    pub async fn remove_videos(&self, playlist_id: &str, video_ids: &[String]) -> JoinHandle<()> {
        let removed = {
            let mut state = self.state.lock().await;
            let snapshot = state.snapshot();
            let mut removed = Vec::new();
            state.videos.retain(|v| {
                if video_ids.contains(&v.id) {
                    removed.push(v.clone());
                    false
                } else {
                    true
                }
            });
            let visible = state.visible_count();
            state.view.clamp_focus(visible);
            state.push_undo(PendingMutation {
                kind: MutationKind::RemoveVideos {
                    playlist_id: playlist_id.to_string(),
                    removed: removed.clone(),
                },
                affected: removed.iter().map(|v| v.id.clone()).collect(),
                snapshot,
                timestamp: Timestamp::now(),
            });
            removed
        };

        let this = self.clone();
        let playlist_id = playlist_id.to_string();
        tokio::spawn(async move {
            let total = removed.len();
            let mut failed = 0;
            for video in removed {
                let Some(playlist_item_id) = video.playlist_item_id else {
                    tracing::warn!(video = %video.id, "no membership handle, cannot remove remotely");
                    failed += 1;
                    continue;
                };
                let result = this
                    .relay
                    .forward(SurfaceRequest::RemoveItem {
                        playlist_id: playlist_id.clone(),
                        playlist_item_id,
                    })
                    .await;
                if !this.effective_success("remove-item", &result) {
                    failed += 1;
                }
            }
            this.report_batch("remove-item", failed, total).await;
        })
    }

    /// Reorders one item within a playlist. `move_after_item_id: None` moves
    /// it to the head.
    pub async fn move_video(
        &self,
        playlist_id: &str,
        playlist_item_id: &str,
        move_after_item_id: Option<String>,
    ) -> JoinHandle<()> {
        {
            let mut state = self.state.lock().await;
            let Some(from) = state
                .videos
                .iter()
                .position(|v| v.playlist_item_id.as_deref() == Some(playlist_item_id))
            else {
                // Navigated away or already gone; nothing to move.
                return tokio::spawn(async {});
            };
            let snapshot = state.snapshot();
            let previous_after = (from > 0)
                .then(|| state.videos[from - 1].playlist_item_id.clone())
                .flatten();
            let video = state.videos.remove(from);
            let to = match &move_after_item_id {
                Some(after) => state
                    .videos
                    .iter()
                    .position(|v| v.playlist_item_id.as_deref() == Some(after.as_str()))
                    .map(|i| i + 1)
                    .unwrap_or(state.videos.len()),
                None => 0,
            };
            let affected = vec![video.id.clone()];
            state.videos.insert(to, video);
            state.push_undo(PendingMutation {
                kind: MutationKind::MoveVideo {
                    playlist_id: playlist_id.to_string(),
                    playlist_item_id: playlist_item_id.to_string(),
                    previous_after,
                },
                affected,
                snapshot,
                timestamp: Timestamp::now(),
            });
        }

        let this = self.clone();
        let request = SurfaceRequest::MoveItem {
            playlist_id: playlist_id.to_string(),
            playlist_item_id: playlist_item_id.to_string(),
            move_after_item_id,
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            if !this.effective_success("move-item", &result) {
                this.report_batch("move-item", 1, 1).await;
            }
        })
    }

    pub async fn delete_playlist(&self, playlist_id: &str) -> JoinHandle<()> {
        {
            let mut state = self.state.lock().await;
            let Some(index) = state.playlists.iter().position(|p| p.id == playlist_id) else {
                return tokio::spawn(async {});
            };
            let snapshot = state.snapshot();
            let playlist = state.playlists.remove(index);
            // Only useful when this playlist's contents are what we have
            // loaded; otherwise undo re-creates it empty.
            let video_ids = state.videos.iter().map(|v| v.id.clone()).collect();
            state.push_undo(PendingMutation {
                kind: MutationKind::DeletePlaylist {
                    playlist,
                    video_ids,
                },
                affected: vec![playlist_id.to_string()],
                snapshot,
                timestamp: Timestamp::now(),
            });
        }

        let this = self.clone();
        let request = SurfaceRequest::DeletePlaylist {
            playlist_id: playlist_id.to_string(),
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            if !this.effective_success("delete-playlist", &result) {
                this.report_batch("delete-playlist", 1, 1).await;
            }
        })
    }

    /// Creates a playlist. The local list shows a placeholder immediately;
    /// the placeholder picks up the real id on confirmation. This is the one
    /// mutation that rolls back on failure: without a resulting id there is
    /// nothing to address follow-up operations at.
    pub async fn create_playlist(&self, title: &str, video_ids: Vec<String>) -> JoinHandle<()> {
        let placeholder_id = format!("pending:{title}");
        let snapshot = {
            let mut state = self.state.lock().await;
            let snapshot = state.snapshot();
            state.playlists.push(Playlist {
                id: placeholder_id.clone(),
                title: title.to_string(),
                video_count: video_ids.len() as u32,
                thumbnail_url: None,
            });
            snapshot
        };

        let this = self.clone();
        let request = SurfaceRequest::CreatePlaylist {
            title: title.to_string(),
            video_ids,
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            let playlist_id = match &result {
                Ok(r) if r.success => r
                    .data
                    .as_ref()
                    .and_then(|d| d["playlistId"].as_str())
                    .map(str::to_string),
                _ => None,
            };
            let mut state = this.state.lock().await;
            match playlist_id {
                Some(id) => {
                    if let Some(p) = state
                        .playlists
                        .iter_mut()
                        .find(|p| p.id == placeholder_id)
                    {
                        p.id = id.clone();
                    }
                    let affected = vec![id.clone()];
                    state.push_undo(PendingMutation {
                        kind: MutationKind::CreatePlaylist { playlist_id: id },
                        affected,
                        snapshot,
                        timestamp: Timestamp::now(),
                    });
                }
                None => {
                    state.playlists.retain(|p| p.id != placeholder_id);
                    drop(state);
                    let _ = this
                        .notices
                        .try_send(Notice::Failed {
                            operation: "create-playlist",
                        });
                }
            }
        })
    }

    pub async fn rename_playlist(&self, playlist_id: &str, title: &str) -> JoinHandle<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(p) = state.playlists.iter_mut().find(|p| p.id == playlist_id) {
                p.title = title.to_string();
            }
        }
        let this = self.clone();
        let request = SurfaceRequest::RenamePlaylist {
            playlist_id: playlist_id.to_string(),
            title: title.to_string(),
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            if !this.effective_success("rename-playlist", &result) {
                this.report_batch("rename-playlist", 1, 1).await;
            }
        })
    }

    pub async fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> JoinHandle<()> {
        let this = self.clone();
        let request = SurfaceRequest::AddToPlaylist {
            playlist_id: playlist_id.to_string(),
            video_id: video_id.to_string(),
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            if !this.effective_success("add-to-playlist", &result) {
                this.report_batch("add-to-playlist", 1, 1).await;
            }
        })
    }

    /// Adds a video to the playlist assigned to a numeric quick slot.
    pub async fn add_to_quick_slot(&self, slot: u8, video_id: &str) -> eyre::Result<JoinHandle<()>> {
        let Some(playlist_id) = self.store.quick_slot(slot).await? else {
            eyre::bail!("no playlist assigned to slot {slot}");
        };
        Ok(self.add_to_playlist(&playlist_id, video_id).await)
    }

    pub async fn subscribe(&self, channel: Channel) -> JoinHandle<()> {
        {
            let mut state = self.state.lock().await;
            let snapshot = state.snapshot();
            if !state.channels.iter().any(|c| c.id == channel.id) {
                state.channels.push(channel.clone());
            }
            state.push_undo(PendingMutation {
                kind: MutationKind::Subscribe {
                    channel: channel.clone(),
                },
                affected: vec![channel.id.clone()],
                snapshot,
                timestamp: Timestamp::now(),
            });
        }
        let this = self.clone();
        let request = SurfaceRequest::Subscribe {
            channel_id: channel.id,
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            if !this.effective_success("subscribe", &result) {
                this.report_batch("subscribe", 1, 1).await;
            }
        })
    }

    pub async fn unsubscribe(&self, channel_id: &str) -> JoinHandle<()> {
        {
            let mut state = self.state.lock().await;
            let Some(index) = state.channels.iter().position(|c| c.id == channel_id) else {
                return tokio::spawn(async {});
            };
            let snapshot = state.snapshot();
            let channel = state.channels.remove(index);
            state.push_undo(PendingMutation {
                kind: MutationKind::Unsubscribe { channel },
                affected: vec![channel_id.to_string()],
                snapshot,
                timestamp: Timestamp::now(),
            });
        }
        let this = self.clone();
        let request = SurfaceRequest::Unsubscribe {
            channel_id: channel_id.to_string(),
        };
        tokio::spawn(async move {
            let result = this.relay.forward(request).await;
            if !this.effective_success("unsubscribe", &result) {
                this.report_batch("unsubscribe", 1, 1).await;
            }
        })
    }

    // =========================================================================
    // Overlays
    // =========================================================================

    /// Flips the watched override for one video. No override means the first
    /// toggle marks it watched; clearing back to unwatched keeps an explicit
    /// `watched: false` so the platform's own progress is shown but the
    /// video is never auto-classified as watched.
    pub async fn toggle_watched(&self, video_id: &str) -> eyre::Result<()> {
        let override_ = {
            let mut state = self.state.lock().await;
            let watched = match state.watched_overrides.get(video_id) {
                Some(o) => !o.watched,
                None => true,
            };
            let override_ = WatchedOverride {
                watched,
                timestamp: Timestamp::now(),
            };
            state
                .watched_overrides
                .insert(video_id.to_string(), override_);
            override_
        };
        let video_id = video_id.to_string();
        self.store
            .update(move |persisted| {
                persisted.watched_overrides.insert(video_id, override_);
            })
            .await?;
        Ok(())
    }

    pub async fn hide_video(&self, video_id: &str) -> eyre::Result<()> {
        {
            let mut state = self.state.lock().await;
            state.hidden.insert(video_id.to_string());
            let visible = state.visible_count();
            state.view.clamp_focus(visible);
        }
        let video_id = video_id.to_string();
        self.store
            .update(move |persisted| {
                persisted.hidden_videos.insert(video_id);
            })
            .await?;
        Ok(())
    }

    pub async fn set_hide_watched(&self, hide: bool) -> eyre::Result<()> {
        {
            let mut state = self.state.lock().await;
            state.hide_watched = hide;
            let visible = state.visible_count();
            state.view.clamp_focus(visible);
        }
        self.store
            .update(move |persisted| {
                persisted.settings.hide_watched = hide;
            })
            .await?;
        Ok(())
    }

    /// Drops overrides that are both stale and absent from the given full
    /// load.
    async fn prune_overrides(&self, loaded: &HashSet<String>) -> eyre::Result<()> {
        // saturating_sub only errors for calendar-unit spans; a MIN cutoff
        // prunes nothing.
        let cutoff = Timestamp::now()
            .saturating_sub(OVERRIDE_RETENTION)
            .unwrap_or(Timestamp::MIN);
        let pruned: Vec<String> = {
            let mut state = self.state.lock().await;
            let pruned: Vec<String> = state
                .watched_overrides
                .iter()
                .filter(|(id, o)| o.timestamp < cutoff && !loaded.contains(*id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &pruned {
                state.watched_overrides.remove(id);
            }
            pruned
        };
        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "pruned stale watched overrides");
            self.store
                .update(move |persisted| {
                    for id in &pruned {
                        persisted.watched_overrides.remove(id);
                    }
                })
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Undo
    // =========================================================================

    /// Pops the most recent mutation, restores its snapshot locally, and
    /// issues the inverse remote calls in the background. Returns `None`
    /// when the stack is empty.
    pub async fn undo(&self) -> Option<JoinHandle<()>> {
        let mutation = {
            let mut state = self.state.lock().await;
            let mutation = state.undo.pop_back()?;
            state.restore(mutation.snapshot.clone());
            mutation
        };
        tracing::info!(
            affected = ?mutation.affected,
            applied_at = %mutation.timestamp,
            "undoing mutation"
        );

        let this = self.clone();
        Some(tokio::spawn(async move {
            this.apply_inverse(mutation).await;
        }))
    }

    async fn apply_inverse(&self, mutation: PendingMutation) {
        match mutation.kind.clone() {
            MutationKind::RemoveVideos {
                playlist_id,
                removed,
            } => {
                let total = removed.len();
                let mut failed = 0;
                for video in removed {
                    let result = self
                        .relay
                        .forward(SurfaceRequest::AddToPlaylist {
                            playlist_id: playlist_id.clone(),
                            video_id: video.id,
                        })
                        .await;
                    if !self.effective_success("undo remove-item", &result) {
                        failed += 1;
                    }
                }
                self.report_batch("undo remove-item", failed, total).await;
            }
            MutationKind::MoveVideo {
                playlist_id,
                playlist_item_id,
                previous_after,
            } => {
                let result = self
                    .relay
                    .forward(SurfaceRequest::MoveItem {
                        playlist_id,
                        playlist_item_id,
                        move_after_item_id: previous_after,
                    })
                    .await;
                if !self.effective_success("undo move-item", &result) {
                    self.report_batch("undo move-item", 1, 1).await;
                }
            }
            MutationKind::DeletePlaylist {
                playlist,
                video_ids,
            } => {
                // A failed re-create is not re-pushed: the playlist is gone
                // and retrying from a stale snapshot would not bring its
                // membership handles back.
                let result = self
                    .relay
                    .forward(SurfaceRequest::CreatePlaylist {
                        title: playlist.title,
                        video_ids,
                    })
                    .await;
                if !self.effective_success("undo delete-playlist", &result) {
                    self.report_batch("undo delete-playlist", 1, 1).await;
                }
            }
            MutationKind::CreatePlaylist { playlist_id } => {
                let result = self
                    .relay
                    .forward(SurfaceRequest::DeletePlaylist { playlist_id })
                    .await;
                if !self.effective_success("undo create-playlist", &result) {
                    self.report_batch("undo create-playlist", 1, 1).await;
                }
            }
            MutationKind::Subscribe { channel } => {
                let result = self
                    .relay
                    .forward(SurfaceRequest::Unsubscribe {
                        channel_id: channel.id,
                    })
                    .await;
                if !self.effective_success("undo subscribe", &result) {
                    self.report_batch("undo subscribe", 1, 1).await;
                }
            }
            MutationKind::Unsubscribe { channel } => {
                let result = self
                    .relay
                    .forward(SurfaceRequest::Subscribe {
                        channel_id: channel.id,
                    })
                    .await;
                if !self.effective_success("undo unsubscribe", &result) {
                    // Resubscribing is cheap and idempotent, so keep the
                    // entry around for another attempt.
                    self.report_batch("undo unsubscribe", 1, 1).await;
                    self.state.lock().await.push_undo(mutation);
                }
            }
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Whether a completed remote call counts as success, applying the
    /// ambiguous-409 policy. Surfaces a re-authentication notice as a side
    /// effect when the session is gone.
    fn effective_success(
        &self,
        operation: &str,
        result: &Result<SurfaceResponse, RelayError>,
    ) -> bool {
        match result {
            Ok(response) if response.success => true,
            Ok(response) => {
                if let Some(error) = &response.error {
                    if error.is_ambiguous_conflict() {
                        tracing::warn!(operation, "treating ambiguous conflict as success");
                        return true;
                    }
                    if error.kind == ErrorKind::Unauthenticated {
                        let _ = self.notices.try_send(Notice::Reauthenticate);
                    }
                    tracing::warn!(operation, error = %error.message, "remote call failed");
                }
                false
            }
            Err(error) => {
                tracing::warn!(operation, error = %error, "could not reach executor");
                false
            }
        }
    }

    async fn report_batch(&self, operation: &'static str, failed: usize, total: usize) {
        if failed > 0 {
            let _ = self
                .notices
                .send(Notice::PartialFailure {
                    operation,
                    failed,
                    total,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorHandle, ExecutorRequest};
    use crate::protocol::SurfaceError;
    use crate::relay::ExecutorSpawner;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::oneshot;

    type Responder = Arc<dyn Fn(&SurfaceRequest) -> SurfaceResponse + Send + Sync>;

    /// Spawns executors that answer from a scripted responder, recording
    /// every request they see.
    struct ScriptedSpawner {
        respond: Responder,
        requests: Arc<std::sync::Mutex<Vec<SurfaceRequest>>>,
    }

    impl ExecutorSpawner for ScriptedSpawner {
        fn find_existing(&self) -> Option<ExecutorHandle> {
            None
        }

        fn create(&self) -> (ExecutorHandle, oneshot::Receiver<()>) {
            let (tx, mut rx) = mpsc::channel::<ExecutorRequest>(32);
            let (ready_tx, ready_rx) = oneshot::channel();
            let respond = Arc::clone(&self.respond);
            let requests = Arc::clone(&self.requests);
            tokio::spawn(async move {
                let _ = ready_tx.send(());
                while let Some(req) = rx.recv().await {
                    let response = respond(&req.request);
                    requests
                        .lock()
                        .unwrap()
                        .push(req.request);
                    let _ = req.reply.send(response);
                }
            });
            (ExecutorHandle::new(tx), ready_rx)
        }
    }

    struct Harness {
        coordinator: OptimisticMutationCoordinator,
        requests: Arc<std::sync::Mutex<Vec<SurfaceRequest>>>,
        notices: mpsc::Receiver<Notice>,
        _dir: tempfile::TempDir,
    }

    fn harness(respond: impl Fn(&SurfaceRequest) -> SurfaceResponse + Send + Sync + 'static) -> Harness {
        let requests = Arc::new(std::sync::Mutex::new(Vec::new()));
        let spawner = Arc::new(ScriptedSpawner {
            respond: Arc::new(respond),
            requests: Arc::clone(&requests),
        });
        let (control_tx, _control_rx) = mpsc::channel(8);
        // these tests drive the coordinator directly, so no local handler
        let (local_tx, _local_rx) = mpsc::channel(8);
        let relay = CrossContextRelay::new(spawner, "test-app", control_tx, local_tx);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("state.json"));
        let (notices_tx, notices_rx) = mpsc::channel(8);
        Harness {
            coordinator: OptimisticMutationCoordinator::new(relay, store, notices_tx),
            requests,
            notices: notices_rx,
            _dir: dir,
        }
    }

    fn conflict() -> SurfaceResponse {
        SurfaceResponse::err(SurfaceError {
            kind: ErrorKind::ClientError,
            status: Some(409),
            message: "CONFLICT".to_string(),
        })
    }

    fn server_error() -> SurfaceResponse {
        SurfaceResponse::err(SurfaceError {
            kind: ErrorKind::ServerError,
            status: Some(500),
            message: "oops".to_string(),
        })
    }

    fn video(id: &str, progress: u8) -> Video {
        Video {
            id: id.to_string(),
            title: format!("video {id}"),
            channel_name: "chan".to_string(),
            channel_id: "UCchan".to_string(),
            thumbnail_url: String::new(),
            duration: "3:45".to_string(),
            published_at_text: "2 days ago".to_string(),
            playlist_item_id: Some(format!("ITEM{id}")),
            watched_progress: progress,
        }
    }

    fn channel(id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            name: format!("channel {id}"),
            thumbnail_url: String::new(),
            subscriber_count_text: "1K subscribers".to_string(),
            last_upload: None,
        }
    }

    async fn seed_videos(coordinator: &OptimisticMutationCoordinator, count: usize) {
        let mut state = coordinator.state.lock().await;
        state.videos = (0..count).map(|i| video(&format!("v{i}"), 0)).collect();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_delete_with_all_conflicts_is_one_undoable_success() {
        let mut h = harness(|req| match req {
            SurfaceRequest::RemoveItem { .. } => conflict(),
            _ => SurfaceResponse::ok_empty(),
        });
        seed_videos(&h.coordinator, 10).await;

        let targets = vec!["v1".to_string(), "v4".to_string(), "v7".to_string()];
        let done = h.coordinator.remove_videos("WL", &targets).await;
        assert_eq!(h.coordinator.visible_videos().await.len(), 7);
        done.await.unwrap();

        // all three came back 409 but that is the platform lying; no notice
        assert!(h.notices.try_recv().is_err());
        assert_eq!(h.coordinator.undo_depth().await, 1);

        // batch undo restores all three and re-adds them remotely
        h.coordinator.undo().await.unwrap().await.unwrap();
        assert_eq!(h.coordinator.visible_videos().await.len(), 10);
        let adds = h
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, SurfaceRequest::AddToPlaylist { .. }))
            .count();
        assert_eq!(adds, 3);
        assert_eq!(h.coordinator.undo_depth().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_reports_count_without_rollback() {
        let mut h = harness(|req| match req {
            SurfaceRequest::RemoveItem {
                playlist_item_id, ..
            } if playlist_item_id == "ITEMv2" => server_error(),
            _ => SurfaceResponse::ok_empty(),
        });
        seed_videos(&h.coordinator, 5).await;

        let targets = vec!["v1".to_string(), "v2".to_string()];
        h.coordinator
            .remove_videos("WL", &targets)
            .await
            .await
            .unwrap();

        assert_eq!(
            h.notices.recv().await,
            Some(Notice::PartialFailure {
                operation: "remove-item",
                failed: 1,
                total: 2
            })
        );
        // optimistic state stays; divergence is resolved by reload or undo
        assert_eq!(h.coordinator.visible_videos().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_mutations_prompt_reauthentication() {
        let mut h = harness(|_| {
            SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Unauthenticated,
                "session expired",
            ))
        });
        seed_videos(&h.coordinator, 2).await;

        h.coordinator
            .remove_videos("WL", &["v0".to_string()])
            .await
            .await
            .unwrap();

        assert_eq!(h.notices.recv().await, Some(Notice::Reauthenticate));
        assert_eq!(
            h.notices.recv().await,
            Some(Notice::PartialFailure {
                operation: "remove-item",
                failed: 1,
                total: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_watched_pins_100_then_reverts_to_platform_progress() {
        let h = harness(|_| SurfaceResponse::ok_empty());
        {
            let mut state = h.coordinator.state.lock().await;
            state.videos = vec![video("v0", 40)];
        }

        h.coordinator.toggle_watched("v0").await.unwrap();
        assert_eq!(h.coordinator.visible_videos().await[0].watched_progress, 100);

        // reverts to the platform's 40, not to 0
        h.coordinator.toggle_watched("v0").await.unwrap();
        assert_eq!(h.coordinator.visible_videos().await[0].watched_progress, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn hide_watched_filter_is_reversible() {
        let h = harness(|_| SurfaceResponse::ok_empty());
        {
            let mut state = h.coordinator.state.lock().await;
            state.videos = vec![video("done", 100), video("half", 50)];
        }

        h.coordinator.set_hide_watched(true).await.unwrap();
        let visible = h.coordinator.visible_videos().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "half");

        h.coordinator.set_hide_watched(false).await.unwrap();
        assert_eq!(h.coordinator.visible_videos().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn marked_unwatched_video_survives_hide_watched() {
        let h = harness(|_| SurfaceResponse::ok_empty());
        {
            let mut state = h.coordinator.state.lock().await;
            state.videos = vec![video("v0", 100)];
        }
        h.coordinator.set_hide_watched(true).await.unwrap();
        assert_eq!(h.coordinator.visible_videos().await.len(), 0);

        // the override wins over the platform's 100%
        h.coordinator.toggle_watched("v0").await.unwrap();
        h.coordinator.toggle_watched("v0").await.unwrap();
        assert_eq!(h.coordinator.visible_videos().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undo_stack_is_bounded() {
        let h = harness(|_| SurfaceResponse::ok_empty());
        for i in 0..(UNDO_DEPTH + 5) {
            h.coordinator
                .subscribe(channel(&format!("UC{i}")))
                .await
                .await
                .unwrap();
        }
        assert_eq!(h.coordinator.undo_depth().await, UNDO_DEPTH);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resubscribe_undo_is_retryable_but_delete_undo_is_not() {
        let h = harness(|req| match req {
            // undo of unsubscribe and undo of delete-playlist both fail
            SurfaceRequest::Subscribe { .. } | SurfaceRequest::CreatePlaylist { .. } => {
                server_error()
            }
            _ => SurfaceResponse::ok_empty(),
        });
        {
            let mut state = h.coordinator.state.lock().await;
            state.channels = vec![channel("UCa")];
            state.playlists = vec![Playlist {
                id: "PLa".to_string(),
                title: "a".to_string(),
                video_count: 0,
                thumbnail_url: None,
            }];
        }

        h.coordinator.unsubscribe("UCa").await.await.unwrap();
        assert_eq!(h.coordinator.undo_depth().await, 1);
        h.coordinator.undo().await.unwrap().await.unwrap();
        // inverse failed, entry re-pushed for another attempt
        assert_eq!(h.coordinator.undo_depth().await, 1);
        {
            let mut state = h.coordinator.state.lock().await;
            state.undo.clear();
        }

        h.coordinator.delete_playlist("PLa").await.await.unwrap();
        assert_eq!(h.coordinator.undo_depth().await, 1);
        h.coordinator.undo().await.unwrap().await.unwrap();
        // inverse failed, but the membership handles are gone for good
        assert_eq!(h.coordinator.undo_depth().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_playlist_rolls_back_when_no_id_comes_back() {
        let mut h = harness(|req| match req {
            // success, but the payload carries no playlist id
            SurfaceRequest::CreatePlaylist { .. } => SurfaceResponse::ok_empty(),
            _ => SurfaceResponse::ok_empty(),
        });

        h.coordinator
            .create_playlist("mix", vec![])
            .await
            .await
            .unwrap();

        assert!(h.coordinator.playlists().await.is_empty());
        assert_eq!(
            h.notices.recv().await,
            Some(Notice::Failed {
                operation: "create-playlist"
            })
        );
        assert_eq!(h.coordinator.undo_depth().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_playlist_adopts_the_confirmed_id() {
        let h = harness(|req| match req {
            SurfaceRequest::CreatePlaylist { .. } => {
                SurfaceResponse::ok(json!({ "playlistId": "PLreal" }))
            }
            _ => SurfaceResponse::ok_empty(),
        });

        h.coordinator
            .create_playlist("mix", vec!["v0".to_string()])
            .await
            .await
            .unwrap();

        let playlists = h.coordinator.playlists().await;
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].id, "PLreal");
        assert_eq!(h.coordinator.undo_depth().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn move_restores_previous_position_on_undo() {
        let h = harness(|_| SurfaceResponse::ok_empty());
        seed_videos(&h.coordinator, 4).await;

        // move v2 to the head
        h.coordinator
            .move_video("WL", "ITEMv2", None)
            .await
            .await
            .unwrap();
        let order: Vec<String> = h
            .coordinator
            .visible_videos()
            .await
            .iter()
            .map(|v| v.id.clone())
            .collect();
        assert_eq!(order, ["v2", "v0", "v1", "v3"]);

        h.coordinator.undo().await.unwrap().await.unwrap();
        let order: Vec<String> = h
            .coordinator
            .visible_videos()
            .await
            .iter()
            .map(|v| v.id.clone())
            .collect();
        assert_eq!(order, ["v0", "v1", "v2", "v3"]);
        // and the inverse remote move targeted v1, the old predecessor
        let inverse = h
            .requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|r| match r {
                SurfaceRequest::MoveItem {
                    move_after_item_id, ..
                } => Some(move_after_item_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(inverse.as_deref(), Some("ITEMv1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_overrides_absent_from_a_full_load_are_pruned() {
        let h = harness(|req| match req {
            SurfaceRequest::FetchWatchLater { .. } => SurfaceResponse::ok(json!({
                "videos": [
                    {
                        "id": "kept",
                        "title": "t",
                        "channelName": "c",
                        "channelId": "UCc",
                        "thumbnailUrl": "",
                        "duration": "1:00",
                        "publishedAtText": "1 day ago",
                        "watchedProgress": 0
                    }
                ],
                "cursor": null
            })),
            _ => SurfaceResponse::ok_empty(),
        });

        let old = Timestamp::now()
            .saturating_sub(SignedDuration::from_hours(120 * 24))
            .unwrap();
        {
            let mut state = h.coordinator.state.lock().await;
            for (id, ts) in [("kept", old), ("gone", old), ("fresh", Timestamp::now())] {
                state.watched_overrides.insert(
                    id.to_string(),
                    WatchedOverride {
                        watched: true,
                        timestamp: ts,
                    },
                );
            }
        }

        h.coordinator.load_watch_later(None).await.unwrap();

        let state = h.coordinator.state.lock().await;
        // old but present in the load: kept; old and absent: pruned;
        // recent: kept regardless
        assert!(state.watched_overrides.contains_key("kept"));
        assert!(!state.watched_overrides.contains_key("gone"));
        assert!(state.watched_overrides.contains_key("fresh"));
    }
}
