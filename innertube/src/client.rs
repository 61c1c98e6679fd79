//! The authenticated request layer.
//!
//! [`InnerTubeClient`] issues single calls against the InnerTube origin:
//! it signs each request from the session credentials, merges the standard
//! client context into the body, classifies the outcome into [`ApiError`],
//! and retries transient failures with exponential backoff plus jitter.
//!
//! The retry count is user-tunable, so it is read through
//! [`CachedRetryConfig`], a small read-through cache that avoids hitting the
//! settings store on every call.

use crate::auth::{self, SessionCredentials};
use crate::error::ApiError;
use jiff::Timestamp;
use rand::Rng;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

/// Base path all InnerTube endpoints hang off.
pub const INNERTUBE_BASE: &str = "https://www.youtube.com/youtubei/v1";

/// Client identity reported in the context object of every request. The
/// backend shapes some responses based on this, so it is pinned rather than
/// derived from the environment.
const CLIENT_NAME: &str = "WEB";
const CLIENT_VERSION: &str = "2.20240702.01.00";
const CLIENT_LOCALE: &str = "en-US";

/// Upper bound on the random jitter added to each backoff delay, to avoid
/// synchronized retry storms across rapid repeated actions.
const JITTER_MS: u64 = 250;

/// How long a settings read stays fresh before the next call re-reads it.
pub const SETTINGS_TTL: Duration = Duration::from_secs(30);

/// Named InnerTube endpoints this client knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Browse,
    EditPlaylist,
    CreatePlaylist,
    DeletePlaylist,
    Subscribe,
    Unsubscribe,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Browse => "browse",
            Endpoint::EditPlaylist => "browse/edit_playlist",
            Endpoint::CreatePlaylist => "playlist/create",
            Endpoint::DeletePlaylist => "playlist/delete",
            Endpoint::Subscribe => "subscription/subscribe",
            Endpoint::Unsubscribe => "subscription/unsubscribe",
        }
    }

    /// Whether this endpoint mutates remote state. Mutation endpoints are the
    /// ones affected by the ambiguous-409 quirk (see [`ApiError`]).
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Endpoint::Browse)
    }
}

/// Retry behavior for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; a call makes `max_retries + 1`
    /// attempts in total.
    pub max_retries: u32,
    /// Backoff for attempt `n` is `base_delay * 2^n` plus bounded jitter.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay * 2u32.saturating_pow(attempt);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MS));
        exponential + jitter
    }
}

type PolicyFuture = Pin<Box<dyn Future<Output = RetryPolicy> + Send>>;

/// Read-through cache in front of the user-tunable retry settings.
///
/// The loader is typically a settings-store read; one result is held for
/// [`SETTINGS_TTL`] so per-call overhead stays in memory.
pub struct CachedRetryConfig {
    loader: Box<dyn Fn() -> PolicyFuture + Send + Sync>,
    cached: Mutex<Option<(Instant, RetryPolicy)>>,
    ttl: Duration,
}

impl std::fmt::Debug for CachedRetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRetryConfig")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CachedRetryConfig {
    pub fn new<F, Fut>(ttl: Duration, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RetryPolicy> + Send + 'static,
    {
        Self {
            loader: Box::new(move || Box::pin(loader())),
            cached: Mutex::new(None),
            ttl,
        }
    }

    /// A config that never consults a store. Used when the caller has no
    /// settings surface (and in tests).
    pub fn fixed(policy: RetryPolicy) -> Self {
        Self::new(Duration::MAX, move || std::future::ready(policy))
    }

    pub async fn get(&self) -> RetryPolicy {
        let mut cached = self.cached.lock().await;
        if let Some((at, policy)) = *cached
            && at.elapsed() < self.ttl
        {
            return policy;
        }
        let policy = (self.loader)().await;
        *cached = Some((Instant::now(), policy));
        policy
    }
}

/// A client for authenticated calls against the InnerTube origin.
///
/// Cheap to clone; clones share the HTTP connection pool, the credential
/// slot, and the retry-config cache.
#[derive(Debug, Clone)]
pub struct InnerTubeClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<Mutex<Option<SessionCredentials>>>,
    retry_config: Arc<CachedRetryConfig>,
}

impl InnerTubeClient {
    pub fn new(credentials: Option<SessionCredentials>, retry_config: CachedRetryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: INNERTUBE_BASE.to_string(),
            credentials: Arc::new(Mutex::new(credentials)),
            retry_config: Arc::new(retry_config),
        }
    }

    /// Points the client at a different origin. Only useful for tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Replaces the session. `None` makes subsequent calls fail as
    /// unauthenticated without a network round-trip.
    pub async fn set_credentials(&self, credentials: Option<SessionCredentials>) {
        *self.credentials.lock().await = credentials;
    }

    /// Issues one InnerTube call with classification and transient-failure
    /// retries.
    ///
    /// `body` is merged with the standard client context object before
    /// sending. Fails immediately as [`ApiError::Unauthenticated`] when no
    /// session secret is available.
    #[instrument(skip(self, body), fields(endpoint = endpoint.path()))]
    pub async fn call(&self, endpoint: Endpoint, body: Value) -> Result<Value, ApiError> {
        let credentials = self
            .credentials
            .lock()
            .await
            .clone()
            .ok_or(ApiError::Unauthenticated)?;

        let policy = self.retry_config.get().await;
        let url = format!("{}/{}", self.base_url, endpoint.path());
        let merged = merge_context(body);

        with_retries(policy, |attempt| {
            let url = url.clone();
            let credentials = credentials.clone();
            let merged = merged.clone();
            async move {
                if attempt > 0 {
                    tracing::debug!(attempt, "retrying after transient failure");
                }
                self.execute(&url, &credentials, &merged).await
            }
        })
        .await
    }

    async fn execute(
        &self,
        url: &str,
        credentials: &SessionCredentials,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(url)
            .header(
                http::header::AUTHORIZATION.as_str(),
                credentials.authorization_header(Timestamp::now()),
            )
            .header(http::header::COOKIE.as_str(), credentials.cookie_header())
            .header(http::header::ORIGIN.as_str(), auth::ORIGIN)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ApiError::from_status(status, message));
        }

        Ok(response.json().await?)
    }

    // ==========================================================================
    // Endpoint wrappers
    // ==========================================================================
    // Raw responses are returned as-is; shape interpretation belongs to
    // crate::normalize. Mutation wrappers surface the raw outcome, including
    // ambiguous 409s, for callers to apply policy to.

    /// Seeds a listing for the given browse id (`FEsubscriptions`, `VL<id>`,
    /// ...).
    pub async fn browse(&self, browse_id: &str) -> Result<Value, ApiError> {
        self.call(Endpoint::Browse, json!({ "browseId": browse_id }))
            .await
    }

    /// Follows a continuation token previously extracted from a browse
    /// response.
    pub async fn browse_continuation(&self, token: &str) -> Result<Value, ApiError> {
        self.call(Endpoint::Browse, json!({ "continuation": token }))
            .await
    }

    pub async fn add_to_playlist(
        &self,
        playlist_id: &str,
        video_id: &str,
    ) -> Result<Value, ApiError> {
        self.edit_playlist(
            playlist_id,
            json!([{ "action": "ACTION_ADD_VIDEO", "addedVideoId": video_id }]),
        )
        .await
    }

    /// Removes one membership. Takes the per-membership handle, not the video
    /// id: the same video may be a member of many playlists.
    pub async fn remove_from_playlist(
        &self,
        playlist_id: &str,
        playlist_item_id: &str,
    ) -> Result<Value, ApiError> {
        self.edit_playlist(
            playlist_id,
            json!([{ "action": "ACTION_REMOVE_VIDEO", "setVideoId": playlist_item_id }]),
        )
        .await
    }

    /// Moves a membership after another one, or to the head when
    /// `move_after_item_id` is `None`.
    pub async fn move_in_playlist(
        &self,
        playlist_id: &str,
        playlist_item_id: &str,
        move_after_item_id: Option<&str>,
    ) -> Result<Value, ApiError> {
        let action = match move_after_item_id {
            Some(after) => json!({
                "action": "ACTION_MOVE_VIDEO_AFTER",
                "setVideoId": playlist_item_id,
                "movedSetVideoIdSuccessor": after,
            }),
            None => json!({
                "action": "ACTION_MOVE_VIDEO_BEFORE",
                "setVideoId": playlist_item_id,
            }),
        };
        self.edit_playlist(playlist_id, json!([action])).await
    }

    pub async fn rename_playlist(
        &self,
        playlist_id: &str,
        new_title: &str,
    ) -> Result<Value, ApiError> {
        self.edit_playlist(
            playlist_id,
            json!([{ "action": "ACTION_SET_PLAYLIST_NAME", "playlistName": new_title }]),
        )
        .await
    }

    async fn edit_playlist(&self, playlist_id: &str, actions: Value) -> Result<Value, ApiError> {
        self.call(
            Endpoint::EditPlaylist,
            json!({ "playlistId": playlist_id, "actions": actions }),
        )
        .await
    }

    /// Creates a playlist and returns its id, or `None` when the backend
    /// reported success without one (callers treat that as total failure).
    pub async fn create_playlist(
        &self,
        title: &str,
        video_ids: &[String],
    ) -> Result<Option<String>, ApiError> {
        let response = self
            .call(
                Endpoint::CreatePlaylist,
                json!({ "title": title, "videoIds": video_ids }),
            )
            .await?;
        Ok(response
            .get("playlistId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn delete_playlist(&self, playlist_id: &str) -> Result<Value, ApiError> {
        self.call(
            Endpoint::DeletePlaylist,
            json!({ "playlistId": playlist_id }),
        )
        .await
    }

    pub async fn subscribe(&self, channel_id: &str) -> Result<Value, ApiError> {
        self.call(
            Endpoint::Subscribe,
            json!({ "channelIds": [channel_id] }),
        )
        .await
    }

    pub async fn unsubscribe(&self, channel_id: &str) -> Result<Value, ApiError> {
        self.call(
            Endpoint::Unsubscribe,
            json!({ "channelIds": [channel_id] }),
        )
        .await
    }
}

fn merge_context(body: Value) -> Value {
    let mut merged = json!({
        "context": {
            "client": {
                "clientName": CLIENT_NAME,
                "clientVersion": CLIENT_VERSION,
                "hl": CLIENT_LOCALE,
            }
        }
    });
    if let (Value::Object(target), Value::Object(extra)) = (&mut merged, body) {
        for (key, value) in extra {
            target.insert(key, value);
        }
    }
    merged
}

/// Runs `op` up to `policy.max_retries + 1` times, sleeping the exponential
/// backoff between attempts. Only transient classifications are retried.
pub(crate) async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_retries => {
                let delay = policy.backoff_delay(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> ApiError {
        ApiError::from_status(http::StatusCode::SERVICE_UNAVAILABLE, String::new())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exactly_max_retries_times() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        };

        let result: Result<(), _> = with_retries(policy, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(transient()))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        // max_retries retries on top of the initial attempt
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_once_successful() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(RetryPolicy::default(), |attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if attempt == 0 {
                Err(transient())
            } else {
                Ok(42)
            })
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(RetryPolicy::default(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(ApiError::from_status(
                http::StatusCode::CONFLICT,
                String::new(),
            )))
        })
        .await;

        assert!(result.unwrap_err().is_ambiguous_conflict());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network() {
        // The base URL points nowhere routable; an attempted network call
        // would fail with a different classification than Unauthenticated.
        let client = InnerTubeClient::new(None, CachedRetryConfig::fixed(RetryPolicy::default()))
            .with_base_url("http://127.0.0.1:9/youtubei/v1");

        let err = client.browse("FEsubscriptions").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn settings_cache_expires_after_ttl() {
        let reads = Arc::new(AtomicU32::new(0));
        let config = {
            let reads = Arc::clone(&reads);
            CachedRetryConfig::new(Duration::from_secs(30), move || {
                reads.fetch_add(1, Ordering::SeqCst);
                std::future::ready(RetryPolicy::default())
            })
        };

        config.get().await;
        config.get().await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        config.get().await;
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn context_is_merged_into_body() {
        let merged = merge_context(json!({ "browseId": "FEsubscriptions" }));
        assert_eq!(merged["browseId"], "FEsubscriptions");
        assert_eq!(merged["context"]["client"]["clientName"], "WEB");
    }

    #[test]
    fn mutation_endpoints_are_flagged() {
        assert!(!Endpoint::Browse.is_mutation());
        for endpoint in [
            Endpoint::EditPlaylist,
            Endpoint::CreatePlaylist,
            Endpoint::DeletePlaylist,
            Endpoint::Subscribe,
            Endpoint::Unsubscribe,
        ] {
            assert!(endpoint.is_mutation());
        }
    }
}
