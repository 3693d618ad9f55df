use thiserror::Error;

use crate::playlist::ExcludeUntil;

/// Reason why a single HTTP(S) request did not produce a usable response.
///
/// Variants are declared from the least to the most severe, so that the derived `Ord`
/// implementation can be used to elect the "worst" error out of several sibling requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestErrorKind {
    /// The request was cancelled on our side.
    Aborted,
    /// The request exceeded its configured timeout.
    Timeout,
    /// Any other failure: network error, unsatisfying HTTP status, invalid response.
    Failure,
}

/// Error linked to one request performed through the host's `Transport`.
#[derive(Error, Clone, Debug, PartialEq)]
#[error("{message}")]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub status: Option<u16>,
    pub uri: String,
    pub message: String,
}

impl RequestError {
    pub(crate) fn aborted(uri: &str, status: Option<u16>) -> Self {
        Self {
            kind: RequestErrorKind::Aborted,
            status,
            uri: uri.to_owned(),
            message: format!("HLS request aborted at URL: {uri}"),
        }
    }

    pub(crate) fn timed_out(uri: &str, status: Option<u16>) -> Self {
        Self {
            kind: RequestErrorKind::Timeout,
            status,
            uri: uri.to_owned(),
            message: format!("HLS request timed-out at URL: {uri}"),
        }
    }

    pub(crate) fn failed(uri: &str, status: Option<u16>) -> Self {
        Self {
            kind: RequestErrorKind::Failure,
            status,
            uri: uri.to_owned(),
            message: format!("HLS request errored at URL: {uri}"),
        }
    }

    pub(crate) fn with_message(mut self, message: String) -> Self {
        self.message = message;
        self
    }

    /// Returns `true` when this error is "more severe" than `other`, following the
    /// failure > timeout > abort ranking.
    pub fn is_worse_than(&self, other: &RequestError) -> bool {
        self.kind > other.kind
    }
}

/// Returns the most severe error out of the given ones, the first one winning ties.
pub(crate) fn worst_error(errors: Vec<RequestError>) -> Option<RequestError> {
    errors.into_iter().fold(None, |acc, err| match acc {
        Some(prev) if !err.is_worse_than(&prev) => Some(prev),
        _ => Some(err),
    })
}

/// Error reported by a `PlaylistLoader` through its `Error` event.
#[derive(Error, Clone, Debug, PartialEq)]
#[error("{message}")]
pub struct PlaylistError {
    /// URI of the playlist concerned, as written in the Multivariant Playlist.
    ///
    /// `None` when the initial playlist itself could not be loaded.
    pub playlist_uri: Option<String>,
    pub status: Option<u16>,
    pub message: String,
    /// `true` when the server is at fault (HTTP 5xx).
    pub server_fault: bool,
    /// Amount of time the playlist should be excluded for, if not the default.
    pub blacklist_duration: Option<BlacklistDuration>,
}

impl PlaylistError {
    pub(crate) fn from_request(playlist_uri: Option<String>, url: &str, err: &RequestError) -> Self {
        let server_fault = err.status.map_or(false, |s| s >= 500);
        Self {
            playlist_uri,
            status: err.status,
            message: format!("HLS playlist request error at URL: {url}"),
            server_fault,
            blacklist_duration: None,
        }
    }

    pub(crate) fn parsing(playlist_uri: Option<String>, url: &str, reason: &str) -> Self {
        Self {
            playlist_uri,
            status: None,
            message: format!("HLS playlist parsing error at URL: {url}: {reason}"),
            server_fault: false,
            blacklist_duration: None,
        }
    }

    /// Numeric classification compatible with media-element error codes: `4` for server
    /// faults, `2` for everything else (network).
    pub fn code(&self) -> u8 {
        if self.server_fault {
            4
        } else {
            2
        }
    }
}

/// Errors returned synchronously when misusing a `PlaylistLoader`.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PlaylistLoaderError {
    #[error("Cannot switch media playlist from {0}")]
    InvalidState(&'static str),
    #[error("Unknown playlist URI: {0}")]
    UnknownPlaylist(String),
}

/// How long a playlist should be excluded from selection after an error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BlacklistDuration {
    /// Exclusion for the given amount of seconds.
    Seconds(f64),
    /// Permanent exclusion: the variant is deemed incompatible.
    Forever,
}

impl BlacklistDuration {
    /// Convert that duration into the `ExcludeUntil` value to set on a playlist, based on the
    /// current wall-clock time in milliseconds.
    pub(crate) fn exclude_until(self, now_ms: f64) -> ExcludeUntil {
        match self {
            BlacklistDuration::Seconds(secs) => ExcludeUntil::Until(now_ms + secs * 1000.),
            BlacklistDuration::Forever => ExcludeUntil::Forever,
        }
    }
}

/// Error surfaced by a `SegmentLoader`.
#[derive(Error, Clone, Debug, PartialEq)]
#[error("{message}")]
pub struct SegmentLoaderError {
    pub message: String,
    pub status: Option<u16>,
    pub blacklist_duration: Option<BlacklistDuration>,
}

impl From<RequestError> for SegmentLoaderError {
    fn from(err: RequestError) -> Self {
        Self {
            message: err.message,
            status: err.status,
            blacklist_duration: None,
        }
    }
}

/// Error encountered when creating a buffer on the host's `MediaSink`.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SourceBufferError {
    #[error("The MediaSource is not open")]
    MediaSourceNotOpen,
    #[error("Unsupported mime-type: {0}")]
    TypeNotSupported(String),
    #[error("Quota exceeded while adding a SourceBuffer: {0}")]
    QuotaExceeded(String),
    #[error("Could not create SourceBuffer: {0}")]
    Unknown(String),
}

/// Error produced while decrypting an AES-128 segment.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Encrypted payload is not a multiple of the AES block size ({0} bytes)")]
    InvalidPayloadLength(usize),
    #[error("Invalid PKCS7 padding")]
    InvalidPadding,
    #[error("Decryption worker is gone")]
    WorkerGone,
}

/// Error produced while parsing a `Config`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Player-level error, emitted through the controller's `Error` event when playback cannot
/// continue.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum PlayerError {
    #[error("Invalid source URL `{0}`")]
    InvalidUrl(String),
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error(transparent)]
    Segment(#[from] SegmentLoaderError),
    #[error(transparent)]
    SourceBuffer(#[from] SourceBufferError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn err(kind: RequestErrorKind) -> RequestError {
        RequestError {
            kind,
            status: None,
            uri: "http://a/b".into(),
            message: String::new(),
        }
    }

    #[rstest]
    #[case(vec![RequestErrorKind::Aborted, RequestErrorKind::Timeout], RequestErrorKind::Timeout)]
    #[case(vec![RequestErrorKind::Timeout, RequestErrorKind::Failure, RequestErrorKind::Aborted], RequestErrorKind::Failure)]
    #[case(vec![RequestErrorKind::Aborted], RequestErrorKind::Aborted)]
    fn worst_error_follows_severity(
        #[case] kinds: Vec<RequestErrorKind>,
        #[case] expected: RequestErrorKind,
    ) {
        let errors = kinds.into_iter().map(err).collect();
        assert_eq!(worst_error(errors).map(|e| e.kind), Some(expected));
    }

    #[test]
    fn server_faults_are_classified() {
        let mut req = RequestError::failed("http://a/p.m3u8", Some(503));
        let pl = PlaylistError::from_request(Some("p.m3u8".into()), "http://a/p.m3u8", &req);
        assert!(pl.server_fault);
        assert_eq!(pl.code(), 4);
        req.status = Some(404);
        let pl = PlaylistError::from_request(None, "http://a/p.m3u8", &req);
        assert!(!pl.server_fault);
        assert_eq!(pl.code(), 2);
    }
}
