//! Session credentials and per-request signatures.
//!
//! InnerTube does not use OAuth for first-party web clients. Instead, every
//! request carries the browser session cookies plus an `Authorization` header
//! of the form `SAPISIDHASH <timestamp>_<sha1(timestamp + sapisid + origin)>`,
//! where `SAPISID` is one of the session cookies. The signature is time-bound,
//! so it is recomputed per request rather than cached.

use jiff::Timestamp;
use sha1::{Digest, Sha1};
use std::fmt;

/// Origin the signature is bound to. Requests from any other origin are
/// rejected by the backend regardless of cookie validity.
pub const ORIGIN: &str = "https://www.youtube.com";

/// An authenticated browser session for youtube.com.
///
/// Holds the full cookie header for the session plus the extracted `SAPISID`
/// secret used for request signing. `Debug` redacts both.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    sapisid: String,
    cookie_header: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("sapisid", &"<redacted>")
            .field("cookie_header", &"<redacted>")
            .finish()
    }
}

impl SessionCredentials {
    /// Extracts signing material from a raw `Cookie` header value.
    ///
    /// Returns `None` when no session secret is present, in which case calls
    /// must fail as unauthenticated without touching the network.
    pub fn from_cookie_header(cookie_header: &str) -> Option<Self> {
        let sapisid = extract_cookie(cookie_header, "SAPISID")
            .or_else(|| extract_cookie(cookie_header, "__Secure-3PAPISID"))?;
        Some(Self {
            sapisid,
            cookie_header: cookie_header.to_string(),
        })
    }

    /// The raw `Cookie` header value for this session.
    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }

    /// Builds the time-bound `Authorization` header value for one request.
    pub fn authorization_header(&self, at: Timestamp) -> String {
        let seconds = at.as_second();
        let mut hasher = Sha1::new();
        hasher.update(format!("{seconds} {} {ORIGIN}", self.sapisid).as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("SAPISIDHASH {seconds}_{digest}")
    }
}

fn extract_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}
