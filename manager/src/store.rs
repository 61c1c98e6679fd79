//! Persisted local state.
//!
//! One JSON file holds everything that must survive restarts: the watched
//! and hidden overlays, quick-assign slots, and tunable settings. Writes go
//! through read-modify-write of the whole file; the data is tiny and the
//! single-threaded runtime means there is no interleaving to defend against.

use eyre::Context;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A user's manual judgement about one video, independent of what the
/// platform reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedOverride {
    pub watched: bool,
    /// When the override was set; used for pruning.
    pub timestamp: Timestamp,
}

/// Tunables the rest of the application reads through [`Store::settings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Retries after the first attempt of a remote call.
    pub max_retries: u32,
    pub hide_watched: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            hide_watched: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub watched_overrides: HashMap<String, WatchedOverride>,
    pub hidden_videos: HashSet<String>,
    /// Number key → playlist id, for one-keystroke add-to-playlist.
    pub quick_assignments: HashMap<u8, String>,
    pub settings: Settings,
}

/// Handle to the state file. Cheap to clone; clones share the file lock.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Loads the current state; a missing file is an empty state, not an
    /// error.
    pub async fn load(&self) -> eyre::Result<PersistedState> {
        let _guard = self.lock.lock().await;
        self.load_locked().await
    }

    async fn load_locked(&self) -> eyre::Result<PersistedState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => serde_json::from_str(&json)
                .with_context(|| format!("parse state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistedState::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("read state file {}", self.path.display()))
            }
        }
    }

    /// Read-modify-write of the whole state under the file lock.
    pub async fn update<F>(&self, mutate: F) -> eyre::Result<PersistedState>
    where
        F: FnOnce(&mut PersistedState),
    {
        let _guard = self.lock.lock().await;
        let mut state = self.load_locked().await?;
        mutate(&mut state);
        let json = serde_json::to_string_pretty(&state).context("serialize state")?;
        tokio::fs::write(&self.path, &json)
            .await
            .with_context(|| format!("write state file {}", self.path.display()))?;
        Ok(state)
    }

    /// Current settings, straight from disk. Callers that read these on
    /// every operation should wrap this in a TTL cache (see
    /// [`innertube::client::CachedRetryConfig`]); defaults apply when the
    /// file is unreadable so a corrupt state file cannot take requests down.
    pub async fn settings(&self) -> Settings {
        match self.load().await {
            Ok(state) => state.settings,
            Err(error) => {
                tracing::warn!(error = %error, "falling back to default settings");
                Settings::default()
            }
        }
    }

    pub async fn assign_quick_slot(&self, slot: u8, playlist_id: String) -> eyre::Result<()> {
        self.update(|state| {
            state.quick_assignments.insert(slot, playlist_id);
        })
        .await?;
        Ok(())
    }

    pub async fn quick_slot(&self, slot: u8) -> eyre::Result<Option<String>> {
        Ok(self.load().await?.quick_assignments.get(&slot).cloned())
    }
}
