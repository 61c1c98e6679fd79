//! Error taxonomy for calls against the InnerTube backend.
//!
//! The classification here is contractual: callers route on it to decide what
//! is retryable, what needs the user to re-authenticate, and what should be
//! surfaced as-is. Notably, a 409 on a mutation endpoint is *not* treated as
//! success by this layer even though the platform frequently returns it for
//! mutations that succeeded; that reinterpretation is a policy decision that
//! belongs to each mutation's caller.

use http::StatusCode;

/// HTTP statuses that are worth retrying with backoff.
pub const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Outcome classification for a single InnerTube call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No usable session, or the backend rejected ours. Not retryable; the
    /// user has to sign in to youtube.com again.
    #[error("not signed in to YouTube; open youtube.com, sign in, and try again")]
    Unauthenticated,

    /// The backend is throttling us. Retried with backoff, then surfaced.
    #[error("rate limited by the backend (HTTP {status})")]
    RateLimited { status: u16 },

    /// A 5xx from the backend. Transient ones are retried with backoff.
    #[error("backend error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// A non-auth 4xx. Not retryable. Includes the ambiguous 409s that
    /// mutation callers may choose to reinterpret as success.
    #[error("request rejected (HTTP {status}): {message}")]
    ClientError { status: u16, message: String },

    /// The request never produced an HTTP status.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ApiError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => ApiError::Unauthenticated,
            429 => ApiError::RateLimited { status: 429 },
            s if status.is_client_error() => ApiError::ClientError { status: s, message },
            s => ApiError::ServerError { status: s, message },
        }
    }

    /// The HTTP status this classification was derived from, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited { status }
            | ApiError::ServerError { status, .. }
            | ApiError::ClientError { status, .. } => Some(*status),
            ApiError::Unauthenticated | ApiError::Network(_) => None,
        }
    }

    /// Whether retrying this call with backoff could plausibly help.
    pub fn is_transient(&self) -> bool {
        self.status()
            .is_some_and(|s| TRANSIENT_STATUSES.contains(&s))
    }

    /// Whether this is the platform's ambiguous-conflict pattern: a 409 on a
    /// mutation endpoint that frequently means the mutation actually went
    /// through. Callers decide whether to treat it as success.
    pub fn is_ambiguous_conflict(&self) -> bool {
        matches!(self, ApiError::ClientError { status: 409, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_map_to_unauthenticated() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = ApiError::from_status(status, String::new());
            assert!(matches!(err, ApiError::Unauthenticated), "{status}");
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn transient_statuses_are_retryable_and_others_terminal() {
        for status in TRANSIENT_STATUSES {
            let err = ApiError::from_status(
                StatusCode::from_u16(status).unwrap(),
                "try later".to_string(),
            );
            assert!(err.is_transient(), "HTTP {status} should be transient");
        }
        for status in [400, 404, 409, 410] {
            let err =
                ApiError::from_status(StatusCode::from_u16(status).unwrap(), String::new());
            assert!(!err.is_transient(), "HTTP {status} should be terminal");
        }
    }

    #[test]
    fn conflict_is_surfaced_raw_but_flagged() {
        let err = ApiError::from_status(StatusCode::CONFLICT, "CONFLICT".to_string());
        assert!(matches!(err, ApiError::ClientError { status: 409, .. }));
        assert!(err.is_ambiguous_conflict());

        let other = ApiError::from_status(StatusCode::BAD_REQUEST, String::new());
        assert!(!other.is_ambiguous_conflict());
    }
}
