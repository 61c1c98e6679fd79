//! Client library for YouTube's private InnerTube API.
//!
//! InnerTube is the undocumented backend behind youtube.com. It is authenticated
//! with session-derived signatures rather than API keys, returns deeply nested
//! JSON whose renderer shapes drift over time, and has famously inconsistent
//! failure semantics (mutation endpoints routinely answer 409 for operations
//! that succeeded).
//!
//! This crate deals with the three transport-level problems that creates:
//!
//! * [`client::InnerTubeClient`] signs and issues individual calls, classifies
//!   outcomes into the [`error::ApiError`] taxonomy, and retries transient
//!   failures with exponential backoff.
//! * [`normalize`] turns raw response fragments of unknown shape into the
//!   stable domain entities in [`models`], without ever failing on malformed
//!   input.
//! * [`paginate::PaginatedFetcher`] walks continuation cursors into exhaustive,
//!   deduplicated entity streams.
//!
//! Policy decisions (most notably whether a 409 on a mutation counts as
//! success) are deliberately left to callers; see
//! [`error::ApiError::is_ambiguous_conflict`].

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod normalize;
pub mod paginate;

pub use client::InnerTubeClient;
pub use error::ApiError;
pub use models::{Channel, Cursor, Entity, Playlist, StreamKind, Video};
pub use paginate::PaginatedFetcher;
