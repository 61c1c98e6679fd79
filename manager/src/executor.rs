//! The privileged executor.
//!
//! Exactly one executor task exists at a time (enforced by the relay): it is
//! the only context holding the authenticated [`InnerTubeClient`], so every
//! remote operation funnels through its request loop. Requests arrive as
//! [`SurfaceRequest`]s over an mpsc channel and are answered over a oneshot
//! reply channel.
//!
//! The executor surfaces raw outcomes: an ambiguous 409 on a mutation comes
//! back as a failed [`SurfaceResponse`] carrying the status, and the
//! coordinator decides what that means.

use crate::protocol::{ErrorKind, SurfaceError, SurfaceRequest, SurfaceResponse};
use innertube::models::{self, StreamKind, WATCH_LATER_ID};
use innertube::paginate::Page;
use innertube::{ApiError, Cursor, Entity, InnerTubeClient, PaginatedFetcher};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

/// Depth of the executor's request queue. Dispatch is effectively
/// sequential; the buffer just absorbs bursts from rapid user actions.
const REQUEST_QUEUE_DEPTH: usize = 32;

/// One in-flight request with its reply slot.
#[derive(Debug)]
pub struct ExecutorRequest {
    pub request: SurfaceRequest,
    pub reply: oneshot::Sender<SurfaceResponse>,
}

/// A handle to a (possibly no longer live) executor task.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<ExecutorRequest>,
}

impl ExecutorHandle {
    pub(crate) fn new(tx: mpsc::Sender<ExecutorRequest>) -> Self {
        Self { tx }
    }

    /// Whether the executor task behind this handle is still reachable.
    pub fn is_reachable(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether two handles point at the same executor task.
    pub fn same_executor(&self, other: &ExecutorHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Hands a request to the executor. `Err` means the executor is gone and
    /// the caller should re-establish it.
    pub async fn send(&self, request: ExecutorRequest) -> Result<(), ()> {
        self.tx.send(request).await.map_err(|_| ())
    }
}

/// Spawns a fresh executor task around the authenticated client.
///
/// Returns the handle plus a readiness signal that fires once the task is
/// accepting requests.
pub fn spawn(client: InnerTubeClient) -> (ExecutorHandle, oneshot::Receiver<()>) {
    let (tx, mut rx) = mpsc::channel::<ExecutorRequest>(REQUEST_QUEUE_DEPTH);
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        let executor = Executor::new(client);
        // Readiness means "the request loop is about to run", not "the first
        // request has completed"; the relay adds its own grace period.
        let _ = ready_tx.send(());
        tracing::info!("executor ready");

        while let Some(ExecutorRequest { request, reply }) = rx.recv().await {
            let response = executor.handle(request).await;
            // A dropped reply just means the surface navigated away; the
            // operation itself already happened.
            let _ = reply.send(response);
        }
        tracing::info!("executor request channel closed, shutting down");
    });

    (ExecutorHandle::new(tx), ready_rx)
}

struct Executor {
    client: InnerTubeClient,
    fetcher: PaginatedFetcher,
}

impl Executor {
    fn new(client: InnerTubeClient) -> Self {
        let fetcher = PaginatedFetcher::new(client.clone());
        Self { client, fetcher }
    }

    #[instrument(skip(self))]
    async fn handle(&self, request: SurfaceRequest) -> SurfaceResponse {
        match request {
            SurfaceRequest::FetchWatchLater { cursor } => {
                self.fetch_videos(
                    StreamKind::Playlist {
                        id: WATCH_LATER_ID.to_string(),
                    },
                    cursor,
                )
                .await
            }
            SurfaceRequest::FetchPlaylist {
                playlist_id,
                cursor,
            } => {
                self.fetch_videos(StreamKind::Playlist { id: playlist_id }, cursor)
                    .await
            }
            SurfaceRequest::FetchPlaylists => self.fetch_playlists().await,
            SurfaceRequest::FetchSubscriptionFeed { cursor } => {
                self.fetch_videos(StreamKind::SubscriptionFeed, cursor).await
            }
            SurfaceRequest::FetchChannels => self.fetch_channels().await,
            SurfaceRequest::AddToPlaylist {
                playlist_id,
                video_id,
            } => unit(self.client.add_to_playlist(&playlist_id, &video_id).await),
            SurfaceRequest::RemoveItem {
                playlist_id,
                playlist_item_id,
            } => unit(
                self.client
                    .remove_from_playlist(&playlist_id, &playlist_item_id)
                    .await,
            ),
            SurfaceRequest::MoveItem {
                playlist_id,
                playlist_item_id,
                move_after_item_id,
            } => unit(
                self.client
                    .move_in_playlist(
                        &playlist_id,
                        &playlist_item_id,
                        move_after_item_id.as_deref(),
                    )
                    .await,
            ),
            SurfaceRequest::CreatePlaylist { title, video_ids } => {
                self.create_playlist(&title, &video_ids).await
            }
            SurfaceRequest::DeletePlaylist { playlist_id } => {
                unit(self.client.delete_playlist(&playlist_id).await)
            }
            SurfaceRequest::RenamePlaylist { playlist_id, title } => {
                unit(self.client.rename_playlist(&playlist_id, &title).await)
            }
            SurfaceRequest::Subscribe { channel_id } => {
                unit(self.client.subscribe(&channel_id).await)
            }
            SurfaceRequest::Unsubscribe { channel_id } => {
                unit(self.client.unsubscribe(&channel_id).await)
            }
            // Overlay and undo state lives with the coordinator; the relay
            // serves these locally and never forwards them here.
            SurfaceRequest::ToggleWatched { .. }
            | SurfaceRequest::HideVideo { .. }
            | SurfaceRequest::Undo => SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Unsupported,
                "request is served by the owning process, not the executor",
            )),
        }
    }

    /// Video listing for one stream. With a cursor this fetches a single
    /// continuation page (incremental loading); without one it walks the
    /// stream exhaustively.
    async fn fetch_videos(&self, stream: StreamKind, cursor: Option<String>) -> SurfaceResponse {
        match cursor {
            Some(token) => {
                let cursor = Cursor {
                    token,
                    stream: stream.clone(),
                };
                match self.fetcher.fetch_page(&stream, Some(&cursor)).await {
                    Ok(Page { entities, cursor }) => SurfaceResponse::ok(json!({
                        "videos": only_videos(entities),
                        "cursor": cursor.map(|c| c.token),
                    })),
                    Err(error) => fail(error),
                }
            }
            None => match self.fetcher.fetch_all(stream).await {
                Ok(entities) => SurfaceResponse::ok(json!({
                    "videos": only_videos(entities),
                    "cursor": Value::Null,
                })),
                Err(error) => fail(error),
            },
        }
    }

    async fn fetch_playlists(&self) -> SurfaceResponse {
        match self.fetcher.fetch_all(StreamKind::PlaylistList).await {
            // The built-ins are reachable through their own entry points and
            // stay out of general enumeration.
            Ok(entities) => {
                let playlists: Vec<Value> = entities
                    .into_iter()
                    .filter_map(|entity| match entity {
                        Entity::Playlist(p) if !models::is_reserved_playlist(&p.id) => {
                            serde_json::to_value(p).ok()
                        }
                        _ => None,
                    })
                    .collect();
                SurfaceResponse::ok(json!({ "playlists": playlists }))
            }
            Err(error) => fail(error),
        }
    }

    async fn fetch_channels(&self) -> SurfaceResponse {
        match self.fetcher.fetch_all(StreamKind::ChannelList).await {
            Ok(entities) => {
                let channels: Vec<Value> = entities
                    .into_iter()
                    .filter_map(|entity| match entity {
                        Entity::Channel(c) => serde_json::to_value(c).ok(),
                        _ => None,
                    })
                    .collect();
                SurfaceResponse::ok(json!({ "channels": channels }))
            }
            Err(error) => fail(error),
        }
    }

    async fn create_playlist(&self, title: &str, video_ids: &[String]) -> SurfaceResponse {
        match self.client.create_playlist(title, video_ids).await {
            Ok(Some(playlist_id)) => SurfaceResponse::ok(json!({ "playlistId": playlist_id })),
            // Success without a resulting id is a total failure for callers:
            // there is nothing to address follow-up operations at.
            Ok(None) => SurfaceResponse::err(SurfaceError::new(
                ErrorKind::ServerError,
                "create-playlist response carried no playlist id",
            )),
            Err(error) => fail(error),
        }
    }
}

fn only_videos(entities: Vec<Entity>) -> Vec<Value> {
    entities
        .into_iter()
        .filter_map(|entity| match entity {
            Entity::Video(v) => serde_json::to_value(v).ok(),
            _ => None,
        })
        .collect()
}

fn unit(result: Result<Value, ApiError>) -> SurfaceResponse {
    match result {
        Ok(_) => SurfaceResponse::ok_empty(),
        Err(error) => fail(error),
    }
}

fn fail(error: ApiError) -> SurfaceResponse {
    tracing::debug!(error = %error, "remote call failed");
    SurfaceResponse::err(SurfaceError::from(&error))
}
