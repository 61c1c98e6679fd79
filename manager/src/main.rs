//! Wires the pieces together: session credentials from a cookie file, the
//! authenticated client behind a relay-managed executor, and the coordinator
//! that owns the local cache and overlays. The UI is a line-based command
//! loop on stdin; rendering proper is out of scope, so listings are printed
//! from the view-model state.

use eyre::Context;
use innertube::InnerTubeClient;
use innertube::auth::SessionCredentials;
use innertube::client::{CachedRetryConfig, RetryPolicy, SETTINGS_TTL};
use innertube::models::WATCH_LATER_ID;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod coordinator;
mod executor;
mod protocol;
mod relay;
mod store;
mod view;

use coordinator::{Notice, OptimisticMutationCoordinator};
use executor::ExecutorRequest;
use protocol::{Envelope, ErrorKind, SurfaceError, SurfaceOrigin, SurfaceRequest, SurfaceResponse};
use relay::{ClientExecutorSpawner, CrossContextRelay};
use store::Store;

/// Cookie header captured from an authenticated browser session.
const COOKIE_FILE: &str = "cookies.txt";

const STATE_FILE: &str = "state.json";

const APPLICATION: &str = "playlist-manager";

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let credentials = match tokio::fs::read_to_string(COOKIE_FILE).await {
        Ok(header) => {
            let credentials = SessionCredentials::from_cookie_header(header.trim());
            if credentials.is_none() {
                tracing::warn!(
                    file = COOKIE_FILE,
                    "cookie file carries no session cookie, running unauthenticated"
                );
            }
            credentials
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(file = COOKIE_FILE, "no cookie file, running unauthenticated");
            None
        }
        Err(e) => return Err(e).with_context(|| format!("read {COOKIE_FILE}")),
    };

    let store = Store::new(STATE_FILE);
    let retry_config = {
        let store = store.clone();
        CachedRetryConfig::new(SETTINGS_TTL, move || {
            let store = store.clone();
            async move {
                RetryPolicy {
                    max_retries: store.settings().await.max_retries,
                    ..RetryPolicy::default()
                }
            }
        })
    };
    let client = InnerTubeClient::new(credentials, retry_config);

    let (control_tx, mut control_rx) = tokio::sync::mpsc::channel(16);
    let (local_tx, mut local_rx) = tokio::sync::mpsc::channel::<ExecutorRequest>(16);
    let relay = CrossContextRelay::new(
        Arc::new(ClientExecutorSpawner::new(client)),
        APPLICATION,
        control_tx,
        local_tx,
    );
    tokio::spawn(async move {
        while let Some(message) = control_rx.recv().await {
            // no window to focus in the headless binary; log and move on
            tracing::info!(?message, "control message");
        }
    });

    let (notices_tx, mut notices_rx) = tokio::sync::mpsc::channel(16);
    let coordinator = OptimisticMutationCoordinator::new(relay.clone(), store.clone(), notices_tx);
    coordinator.hydrate().await.context("load persisted state")?;
    let handler = coordinator.clone();
    tokio::spawn(async move {
        while let Some(ExecutorRequest { request, reply }) = local_rx.recv().await {
            let _ = reply.send(serve_local(&handler, request).await);
        }
    });
    tokio::spawn(async move {
        while let Some(notice) = notices_rx.recv().await {
            match notice {
                Notice::Reauthenticate => {
                    tracing::error!(
                        "session rejected; refresh {COOKIE_FILE} from an authenticated browser"
                    );
                }
                Notice::PartialFailure {
                    operation,
                    failed,
                    total,
                } => {
                    tracing::warn!(operation, failed, total, "some items failed, try again");
                }
                Notice::Failed { operation } => {
                    tracing::warn!(operation, "operation failed, try again");
                }
            }
        }
    });

    command_loop(coordinator, relay, store).await
}

/// Answers the overlay and undo requests the relay routes back to this
/// process instead of the executor.
async fn serve_local(
    coordinator: &OptimisticMutationCoordinator,
    request: SurfaceRequest,
) -> SurfaceResponse {
    let outcome = match &request {
        SurfaceRequest::ToggleWatched { video_id } => coordinator.toggle_watched(video_id).await,
        SurfaceRequest::HideVideo { video_id } => coordinator.hide_video(video_id).await,
        SurfaceRequest::Undo => {
            let undone = coordinator.undo().await.is_some();
            return SurfaceResponse::ok(serde_json::json!({ "undone": undone }));
        }
        _ => {
            return SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Unsupported,
                "not a locally served request",
            ));
        }
    };
    match outcome {
        Ok(()) => SurfaceResponse::ok_empty(),
        Err(error) => {
            SurfaceResponse::err(SurfaceError::new(ErrorKind::ServerError, format!("{error:#}")))
        }
    }
}

async fn command_loop(
    coordinator: OptimisticMutationCoordinator,
    relay: CrossContextRelay,
    store: Store,
) -> eyre::Result<()> {
    // Which playlist the current video listing belongs to; mutations that
    // need a membership context use this.
    let mut current_playlist = WATCH_LATER_ID.to_string();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    print_help();
    while let Some(line) = lines.next_line().await.context("read command")? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        let outcome = match (command, args.as_slice()) {
            ("wl", []) => {
                current_playlist = WATCH_LATER_ID.to_string();
                coordinator.load_watch_later(None).await.map(|()| true)
            }
            ("pl", [id]) => {
                current_playlist = id.to_string();
                coordinator.load_playlist(id, None).await.map(|()| true)
            }
            ("more", []) => {
                let cursor = coordinator.view().await.cursor;
                match cursor {
                    Some(_) => coordinator
                        .load_playlist(&current_playlist, cursor)
                        .await
                        .map(|()| true),
                    None => {
                        println!("nothing more to load");
                        Ok(false)
                    }
                }
            }
            ("feed", []) => coordinator.load_subscription_feed(None).await.map(|()| true),
            ("playlists", []) => {
                coordinator.load_playlists().await?;
                for playlist in coordinator.playlists().await {
                    println!("{:>4} videos  {}  {}", playlist.video_count, playlist.id, playlist.title);
                }
                Ok(false)
            }
            ("channels", []) => {
                coordinator.load_channels().await?;
                for channel in coordinator.channels().await {
                    let last = channel
                        .last_upload
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("{}  {}  last upload {last}", channel.id, channel.name);
                }
                Ok(false)
            }
            ("rm", ids) if !ids.is_empty() => {
                let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
                coordinator.remove_videos(&current_playlist, &ids).await;
                Ok(true)
            }
            ("mv", [item]) => {
                coordinator.move_video(&current_playlist, item, None).await;
                Ok(true)
            }
            ("mv", [item, after]) => {
                coordinator
                    .move_video(&current_playlist, item, Some(after.to_string()))
                    .await;
                Ok(true)
            }
            ("add", [playlist_id, video_id]) => {
                coordinator.add_to_playlist(playlist_id, video_id).await;
                Ok(false)
            }
            ("new", [title, rest @ ..]) => {
                let video_ids = rest.iter().map(|s| s.to_string()).collect();
                coordinator.create_playlist(title, video_ids).await;
                Ok(false)
            }
            ("del", [playlist_id]) => {
                coordinator.delete_playlist(playlist_id).await;
                Ok(false)
            }
            ("rename", [playlist_id, title]) => {
                coordinator.rename_playlist(playlist_id, title).await;
                Ok(false)
            }
            ("sub", [channel_id]) => {
                // optimistic entry; the real metadata arrives on the next
                // channel-list load
                coordinator
                    .subscribe(innertube::Channel {
                        id: channel_id.to_string(),
                        name: channel_id.to_string(),
                        thumbnail_url: String::new(),
                        subscriber_count_text: String::new(),
                        last_upload: None,
                    })
                    .await;
                Ok(false)
            }
            ("unsub", [channel_id]) => {
                coordinator.unsubscribe(channel_id).await;
                Ok(false)
            }
            ("watch", [video_id]) => coordinator.toggle_watched(video_id).await.map(|()| true),
            ("hide", [video_id]) => coordinator.hide_video(video_id).await.map(|()| true),
            ("hidewatched", [flag]) => coordinator
                .set_hide_watched(*flag == "on")
                .await
                .map(|()| true),
            ("assign", [slot, playlist_id]) => match slot.parse::<u8>() {
                Ok(slot) => store
                    .assign_quick_slot(slot, playlist_id.to_string())
                    .await
                    .map(|()| false),
                Err(_) => {
                    println!("slot must be a number");
                    Ok(false)
                }
            },
            ("quick", [slot, video_id]) => match slot.parse::<u8>() {
                Ok(slot) => coordinator
                    .add_to_quick_slot(slot, video_id)
                    .await
                    .map(|_| false),
                Err(_) => {
                    println!("slot must be a number");
                    Ok(false)
                }
            },
            ("undo", []) => {
                if coordinator.undo().await.is_none() {
                    println!("nothing to undo");
                }
                Ok(true)
            }
            // Escape hatch: feed a raw surface message through the relay the
            // way an out-of-process UI surface would deliver it.
            ("raw", body) if !body.is_empty() => {
                match serde_json::from_str(&body.join(" ")) {
                    Ok(body) => {
                        let response = relay
                            .handle_envelope(Envelope {
                                origin: SurfaceOrigin {
                                    application: APPLICATION.to_string(),
                                    surface: "manager".to_string(),
                                },
                                body,
                            })
                            .await;
                        println!("{}", serde_json::to_string_pretty(&response)?);
                        Ok(false)
                    }
                    Err(e) => {
                        println!("not valid JSON: {e}");
                        Ok(false)
                    }
                }
            }
            ("quit", []) | ("exit", []) => break,
            _ => {
                print_help();
                Ok(false)
            }
        };

        match outcome {
            Ok(true) => print_videos(&coordinator).await,
            Ok(false) => {}
            Err(error) => println!("error: {error:#}"),
        }
    }

    Ok(())
}

async fn print_videos(coordinator: &OptimisticMutationCoordinator) {
    let videos = coordinator.visible_videos().await;
    for video in &videos {
        println!(
            "{:>3}% {:>9} {}  {} ({})",
            video.watched_progress, video.duration, video.id, video.title, video.channel_name
        );
    }
    let view = coordinator.view().await;
    match view.cursor {
        Some(_) => println!("-- {} videos, more available --", videos.len()),
        None => println!("-- {} videos --", videos.len()),
    }
}

fn print_help() {
    println!(
        "commands: wl | pl <id> | more | feed | playlists | channels | \
         rm <video>.. | mv <item> [after] | add <playlist> <video> | \
         new <title> [video..] | del <playlist> | rename <playlist> <title> | \
         sub <channel> | unsub <channel> | watch <video> | hide <video> | \
         hidewatched on|off | assign <slot> <playlist> | quick <slot> <video> | \
         undo | raw <json> | quit"
    );
}
