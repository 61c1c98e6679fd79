//! Polymorphic response normalization.
//!
//! InnerTube represents the same logical entity with an open, evolving set of
//! renderer shapes: a video may arrive as `playlistVideoRenderer`,
//! `videoRenderer`, `gridVideoRenderer`, a `lockupViewModel`, or something
//! newer. This module extracts the stable [`Entity`] types from whatever
//! shape shows up, with three hard guarantees:
//!
//! * extraction never fails on malformed or missing fields; every field has
//!   a documented fallback (`"Unknown"` titles, empty strings, `None`);
//! * known renderer patterns are attempted in a fixed priority order, with
//!   structural heuristics only as a deterministic last resort;
//! * container traversal visits every reachable object exactly once, guarded
//!   by an identity-based visited set, and is iterative so arbitrarily deep
//!   nesting cannot overflow the stack.

use crate::models::{Channel, Entity, Playlist, Video};
use jiff::Timestamp;
use serde_json::Value;
use std::collections::HashSet;

/// Everything a container traversal produced: all matching entities (deduped
/// by id, in document order) and the last-seen continuation token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub continuation: Option<String>,
}

// Renderer keys in priority order. First match wins, so more specific shapes
// (playlist membership entries, which carry setVideoId) come before generic
// ones.
const VIDEO_RENDERERS: [&str; 5] = [
    "playlistVideoRenderer",
    "playlistPanelVideoRenderer",
    "videoRenderer",
    "gridVideoRenderer",
    "compactVideoRenderer",
];
const CHANNEL_RENDERERS: [&str; 2] = ["channelRenderer", "gridChannelRenderer"];
const PLAYLIST_RENDERERS: [&str; 3] = [
    "playlistRenderer",
    "gridPlaylistRenderer",
    "compactPlaylistRenderer",
];

/// Attempts to normalize one fragment into an entity.
///
/// Tries each known renderer wrapper in priority order, then the newer
/// `lockupViewModel` shape, then structural heuristics in a fixed order
/// (video, then channel, then playlist), so results are deterministic for a
/// given input. Returns `None` for fragments that are not entities.
pub fn normalize_fragment(value: &Value) -> Option<Entity> {
    let obj = value.as_object()?;

    for key in VIDEO_RENDERERS {
        if let Some(inner) = obj.get(key)
            && let Some(video) = extract_video(inner)
        {
            return Some(Entity::Video(video));
        }
    }
    for key in CHANNEL_RENDERERS {
        if let Some(inner) = obj.get(key)
            && let Some(channel) = extract_channel(inner)
        {
            return Some(Entity::Channel(channel));
        }
    }
    for key in PLAYLIST_RENDERERS {
        if let Some(inner) = obj.get(key)
            && let Some(playlist) = extract_playlist(inner)
        {
            return Some(Entity::Playlist(playlist));
        }
    }
    if let Some(inner) = obj.get("lockupViewModel")
        && let Some(entity) = extract_lockup(inner)
    {
        return Some(entity);
    }

    // No explicit type tag: fall back to structural heuristics. A bare
    // videoId is not enough (navigation endpoints carry those too); require
    // a title alongside it.
    if obj.contains_key("videoId") && obj.contains_key("title") {
        if let Some(video) = extract_video(value) {
            return Some(Entity::Video(video));
        }
    }
    if obj.contains_key("subscriberCountText") && obj.contains_key("channelId") {
        if let Some(channel) = extract_channel(value) {
            return Some(Entity::Channel(channel));
        }
    }
    if obj.contains_key("playlistId")
        && (obj.contains_key("videoCount") || obj.contains_key("videoCountText"))
    {
        if let Some(playlist) = extract_playlist(value) {
            return Some(Entity::Playlist(playlist));
        }
    }

    None
}

/// Collects all entities and the last-seen continuation token from an
/// arbitrarily nested container fragment.
///
/// Iterative depth-first traversal in document order. The pointer-identity
/// visited set means shared sub-objects are visited once, and traversal
/// terminates even on self-referential structures.
pub fn extract_all(root: &Value) -> Extraction {
    let mut visited: HashSet<*const Value> = HashSet::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut stack: Vec<&Value> = vec![root];
    let mut extraction = Extraction::default();

    while let Some(value) = stack.pop() {
        if !visited.insert(value as *const Value) {
            continue;
        }
        match value {
            Value::Object(map) => {
                if let Some(token) = continuation_token(value) {
                    extraction.continuation = Some(token);
                }
                if let Some(entity) = normalize_fragment(value)
                    && seen_ids.insert(entity.id().to_string())
                {
                    extraction.entities.push(entity);
                }
                // Reverse push so popping walks children in document order.
                for child in map.values().rev() {
                    stack.push(child);
                }
            }
            Value::Array(items) => {
                for child in items.iter().rev() {
                    stack.push(child);
                }
            }
            _ => {}
        }
    }

    extraction
}

/// Extracts a pagination cursor from a fragment, trying the known token
/// shapes in fixed order.
pub fn continuation_token(value: &Value) -> Option<String> {
    const TOKEN_PATHS: [&str; 3] = [
        "/continuationItemRenderer/continuationEndpoint/continuationCommand/token",
        "/nextContinuationData/continuation",
        "/continuationCommand/token",
    ];
    TOKEN_PATHS
        .iter()
        .find_map(|path| value.pointer(path)?.as_str().map(str::to_string))
}

// ==============================================================================
// Per-kind extractors
// ==============================================================================

fn extract_video(v: &Value) -> Option<Video> {
    // The id is the only hard requirement; everything else degrades.
    let id = v.get("videoId")?.as_str()?.to_string();

    let overlays = scan_overlays(v);
    let watched_progress = overlays.progress();
    let duration = v
        .get("lengthText")
        .and_then(text_of)
        .or(overlays.duration)
        .unwrap_or_default();

    let (channel_name, channel_id) = byline(v);

    Some(Video {
        id,
        title: v.get("title").and_then(text_of).unwrap_or_else(unknown),
        channel_name,
        channel_id,
        thumbnail_url: v.get("thumbnail").and_then(best_thumbnail).unwrap_or_default(),
        duration,
        published_at_text: v
            .get("publishedTimeText")
            .and_then(text_of)
            .unwrap_or_default(),
        playlist_item_id: v
            .get("setVideoId")
            .and_then(Value::as_str)
            .map(str::to_string),
        watched_progress,
    })
}

fn extract_channel(v: &Value) -> Option<Channel> {
    let id = v
        .get("channelId")
        .and_then(Value::as_str)
        .or_else(|| {
            v.pointer("/navigationEndpoint/browseEndpoint/browseId")
                .and_then(Value::as_str)
        })?
        .to_string();

    Some(Channel {
        id,
        name: v.get("title").and_then(text_of).unwrap_or_else(unknown),
        thumbnail_url: v.get("thumbnail").and_then(best_thumbnail).unwrap_or_default(),
        subscriber_count_text: v
            .get("subscriberCountText")
            .and_then(text_of)
            .unwrap_or_default(),
        // Derived later from observed video publish times, never from the
        // channel renderer itself.
        last_upload: None,
    })
}

fn extract_playlist(v: &Value) -> Option<Playlist> {
    let id = v.get("playlistId")?.as_str()?.to_string();

    let video_count = v
        .get("videoCount")
        .and_then(numeric_count)
        .or_else(|| v.get("videoCountText").and_then(text_of).as_deref().and_then(leading_count))
        .unwrap_or(0);

    let thumbnail_url = v
        .get("thumbnail")
        .and_then(best_thumbnail)
        .or_else(|| {
            v.pointer("/thumbnails/0")
                .and_then(best_thumbnail)
        });

    Some(Playlist {
        id,
        title: v.get("title").and_then(text_of).unwrap_or_else(unknown),
        video_count,
        thumbnail_url,
    })
}

/// The 2024-era view-model shape: type tag in `contentType`, fields under
/// nested view models instead of renderer keys.
fn extract_lockup(v: &Value) -> Option<Entity> {
    let id = v.get("contentId")?.as_str()?.to_string();
    let content_type = v.get("contentType").and_then(Value::as_str).unwrap_or("");

    let title = v
        .pointer("/metadata/lockupMetadataViewModel/title/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(unknown);
    let thumbnail_url = v
        .pointer("/contentImage/thumbnailViewModel/image/sources/0/url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();

    if content_type.contains("PLAYLIST") {
        return Some(Entity::Playlist(Playlist {
            id,
            title,
            video_count: 0,
            thumbnail_url: (!thumbnail_url.is_empty()).then_some(thumbnail_url),
        }));
    }

    Some(Entity::Video(Video {
        id,
        title,
        channel_name: String::new(),
        channel_id: String::new(),
        thumbnail_url,
        duration: String::new(),
        published_at_text: String::new(),
        playlist_item_id: None,
        watched_progress: 0,
    }))
}

// ==============================================================================
// Field helpers
// ==============================================================================

fn unknown() -> String {
    "Unknown".to_string()
}

/// Resolves the two text shapes InnerTube uses interchangeably:
/// `{"simpleText": "..."}` and `{"runs": [{"text": "..."}, ...]}`.
fn text_of(v: &Value) -> Option<String> {
    if let Some(s) = v.as_str() {
        return Some(s.to_string());
    }
    if let Some(s) = v.get("simpleText").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    let runs = v.get("runs")?.as_array()?;
    let joined: String = runs
        .iter()
        .filter_map(|run| run.get("text").and_then(Value::as_str))
        .collect();
    (!joined.is_empty()).then_some(joined)
}

/// Channel attribution for a video: name from the first byline run, id from
/// its browse endpoint. Byline keys vary by renderer.
fn byline(v: &Value) -> (String, String) {
    for key in ["shortBylineText", "longBylineText", "ownerText"] {
        let Some(run) = v.pointer(&format!("/{key}/runs/0")) else {
            continue;
        };
        let name = run
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = run
            .pointer("/navigationEndpoint/browseEndpoint/browseId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !name.is_empty() || !id.is_empty() {
            return (name, id);
        }
    }
    (String::new(), String::new())
}

/// Picks the largest variant from a `{"thumbnails": [...]}` list (they are
/// ordered small to large).
fn best_thumbnail(v: &Value) -> Option<String> {
    v.get("thumbnails")?
        .as_array()?
        .last()?
        .get("url")?
        .as_str()
        .map(str::to_string)
}

fn numeric_count(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    v.as_str().and_then(leading_count)
}

/// Parses the leading digit group of strings like `"1,234 videos"`.
fn leading_count(s: &str) -> Option<u32> {
    let digits: String = s
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[derive(Debug, Default)]
struct OverlayInfo {
    duration: Option<String>,
    percent: Option<u8>,
    resume: bool,
}

impl OverlayInfo {
    /// Watch progress per the overlay rules: an explicit percentage wins; a
    /// resume marker without one means fully watched; otherwise unwatched.
    fn progress(&self) -> u8 {
        match (self.percent, self.resume) {
            (Some(p), _) => p.min(100),
            (None, true) => 100,
            (None, false) => 0,
        }
    }
}

/// Scans a renderer's `thumbnailOverlays` for a time-formatted badge and a
/// resume/progress indicator.
fn scan_overlays(v: &Value) -> OverlayInfo {
    let mut info = OverlayInfo::default();
    let Some(overlays) = v.get("thumbnailOverlays").and_then(Value::as_array) else {
        return info;
    };

    for overlay in overlays {
        if let Some(text) = overlay
            .pointer("/thumbnailOverlayTimeStatusRenderer/text")
            .and_then(text_of)
            && looks_like_duration(&text)
        {
            info.duration = Some(text);
        }
        if let Some(resume) = overlay.get("thumbnailOverlayResumePlaybackRenderer") {
            info.resume = true;
            info.percent = resume
                .get("percentDurationWatched")
                .and_then(Value::as_f64)
                .map(|p| p.clamp(0.0, 100.0) as u8);
        }
    }

    info
}

/// Whether a badge text is `mm:ss` or `h:mm:ss` shaped.
fn looks_like_duration(text: &str) -> bool {
    let parts: Vec<&str> = text.trim().split(':').collect();
    matches!(parts.len(), 2 | 3)
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Converts relative-time text (`"3 days ago"`, `"Streamed 1 hour ago"`)
/// into an absolute timestamp using a fixed unit table. Unparseable text
/// yields `None`, never an error.
pub fn parse_relative_time(text: &str, now: Timestamp) -> Option<Timestamp> {
    // year ≈ 365 days, month ≈ 30 days
    const UNIT_SECONDS: [(&str, i64); 7] = [
        ("second", 1),
        ("minute", 60),
        ("hour", 3_600),
        ("day", 86_400),
        ("week", 604_800),
        ("month", 2_592_000),
        ("year", 31_536_000),
    ];

    let lowered = text.to_lowercase();
    if !lowered.contains("ago") {
        return None;
    }

    let mut words = lowered.split_whitespace();
    let count: i64 = loop {
        match words.next()?.parse() {
            Ok(n) => break n,
            // skip prefixes like "streamed" / "premiered" / "updated"
            Err(_) => continue,
        }
    };
    let unit = words.next()?.trim_end_matches('s');
    let seconds = UNIT_SECONDS
        .iter()
        .find_map(|(name, secs)| (*name == unit).then_some(*secs))?;

    Timestamp::from_second(now.as_second() - count.checked_mul(seconds)?).ok()
}
