//! Interfaces to everything the engine needs from its environment.
//!
//! The engine never reads a global clock, creates a timer, performs a request or touches a
//! media buffer by itself: it asks its `Host`. Asynchronous results (fired timers, finished
//! requests, finished buffer operations, decrypted payloads) are given back by calling the
//! corresponding `on_*` method of the `MasterPlaylistController`.

use std::fmt;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{DecryptionError, SourceBufferError},
    playlist::ByteRange,
    utils::time_ranges::TimeRanges,
};

/// Identifier of a timer started through `Timers::set_timer`.
pub type TimerId = u64;

/// Identifier of a request started through `Transport::fetch`.
pub type RequestId = u64;

/// Identify one of the three loading pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoaderKind {
    /// The main content, either muxed or video-only.
    Main,
    /// Alternate audio rendition.
    Audio,
    /// Subtitles (WebVTT).
    Subtitle,
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoaderKind::Main => "main",
            LoaderKind::Audio => "audio",
            LoaderKind::Subtitle => "vtt",
        })
    }
}

/// Why a timer was started, given back when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerReason {
    /// A segment loader's periodic buffer check.
    BufferCheck(LoaderKind),
    /// A playlist loader's live refresh or final-rendition reload.
    PlaylistRefresh(LoaderKind),
    /// A playlist loader waiting before retrying a failed request.
    PlaylistRetry(LoaderKind),
    /// The playback watcher's clock polling.
    PlaybackMonitor,
    /// The playback watcher waiting to jump over a buffer gap.
    GapSkip,
}

/// How the body of a response should be given back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    Text,
    ArrayBuffer,
}

/// Everything needed to perform a request.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOptions {
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
    pub response_type: ResponseType,
    /// Timeout in milliseconds, `None` for no timeout.
    pub timeout_ms: Option<f64>,
    pub with_credentials: bool,
}

/// Final state of a request, reported through `on_request_finished`.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestOutcome {
    /// A response was received with a successful HTTP status.
    Loaded {
        status: u16,
        body: Bytes,
        /// URL of the response after redirections, if different.
        final_uri: Option<Url>,
    },
    /// Network error or unsuccessful HTTP status.
    Failed { status: Option<u16> },
    /// The request's timeout elapsed.
    TimedOut,
    /// The request was aborted.
    Aborted,
}

/// Events of the media element, reported through `on_media_event`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    Play,
    Playing,
    Pause,
    /// Playback stopped because of missing data.
    Waiting,
    Seeking,
    Seeked,
    Ended,
    Error,
}

/// `readyState` of the host's MediaSource-like object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaSourceReadyState {
    Closed,
    Open,
    Ended,
}

/// Reason given when ending the stream because of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOfStreamError {
    Network,
    Decode,
}

/// Information the host extracted from a media segment's container.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentProbe {
    /// Start, in seconds, of the media in the segment, in its own timeline.
    pub start: f64,
    /// End, in seconds, of the media in the segment, in its own timeline.
    pub end: f64,
    pub contains_audio: bool,
    pub contains_video: bool,
}

/// Text tracks on which cues can be added.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextTrackKind {
    /// One cue per appended segment, describing it.
    SegmentMetadata,
    /// Ad markers.
    CueTags,
    /// Subtitles.
    Subtitles,
}

/// A timed entry on one of the text tracks.
#[derive(Clone, Debug, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub payload: CuePayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CuePayload {
    /// Description of the segment covering that cue's time range.
    SegmentMetadata {
        uri: String,
        timeline: u64,
        bandwidth: Option<u64>,
        resolution: Option<(u32, u32)>,
        codecs: Option<String>,
        byte_length: usize,
    },
    /// An ad break, announced by a cue-out marker.
    AdCue {
        /// Raw value of the cue-out tag, empty when joining an ad break already started.
        cue_out: String,
        /// Presentation time at which the ad break starts.
        ad_start: f64,
        /// Presentation time at which the ad break is announced to end.
        ad_end: f64,
    },
    /// Raw subtitles payload (WebVTT), left for the host to decode.
    Subtitles(Bytes),
}

/// Message posted to the decryption worker.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptionMessage {
    /// Identifier of the segment request the payload comes from.
    pub source: u64,
    pub encrypted: Bytes,
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

/// Reply from the decryption worker.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    pub source: u64,
    pub decrypted: Result<Bytes, DecryptionError>,
}

/// Wall-clock access.
pub trait Clock {
    /// Current time, in milliseconds.
    fn now(&self) -> f64;

    /// A random number between `0.` (inclusive) and `1.` (exclusive).
    fn random(&mut self) -> f64;
}

pub trait Timers {
    /// Start a timer firing after `delay_ms` milliseconds.
    fn set_timer(&mut self, delay_ms: f64, reason: TimerReason) -> TimerId;

    /// Cancel a timer started with `set_timer`. Unknown ids are ignored.
    fn clear_timer(&mut self, id: TimerId);
}

pub trait Transport {
    /// Start a request. Its end will be reported through `on_request_finished`, and its
    /// progress through `on_request_progress`.
    ///
    /// Once `token` is cancelled, the host should abort the request and is not expected to
    /// report anything for it anymore.
    fn fetch(&mut self, options: RequestOptions, token: CancellationToken) -> RequestId;
}

/// MediaSource-like buffering sink.
pub trait MediaSink {
    fn ready_state(&self) -> MediaSourceReadyState;

    /// Create the buffer for the given track, with the given mime-type.
    fn add_source_buffer(
        &mut self,
        track: LoaderKind,
        mime_type: &str,
    ) -> Result<(), SourceBufferError>;

    /// Append data to the track's buffer. Completion is reported through
    /// `on_source_buffer_update`.
    fn append_buffer(&mut self, track: LoaderKind, data: Bytes);

    /// Remove data from the track's buffer. Completion is reported through
    /// `on_source_buffer_update`.
    fn remove_buffer(&mut self, track: LoaderKind, start: f64, end: f64);

    fn set_timestamp_offset(&mut self, track: LoaderKind, offset: f64);

    /// Ranges currently buffered for the given track.
    fn source_buffered(&self, track: LoaderKind) -> TimeRanges;

    fn end_of_stream(&mut self, error: Option<EndOfStreamError>);

    fn duration(&self) -> f64;

    fn set_duration(&mut self, duration: f64);

    /// Read timing and track information from a segment, `None` if it could not be parsed.
    fn probe_segment(&mut self, track: LoaderKind, data: &[u8], is_fmp4: bool)
        -> Option<SegmentProbe>;
}

/// The media element playing the content.
pub trait MediaElement {
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, time: f64);
    fn paused(&self) -> bool;
    fn seeking(&self) -> bool;
    fn ended(&self) -> bool;
    fn playback_rate(&self) -> f64;
    /// Ranges currently buffered, all tracks combined.
    fn buffered(&self) -> TimeRanges;
    /// Width and height, in CSS pixels, of the player.
    fn player_dimensions(&self) -> (u32, u32);
    /// `true` if the media element asked not to preload anything.
    fn preload_none(&self) -> bool;
}

pub trait TextTrackSink {
    fn add_cue(&mut self, track: TextTrackKind, cue: Cue);
    fn remove_cues(&mut self, track: TextTrackKind, start: f64, end: f64);
}

/// Boundary with the decryption worker.
pub trait Decrypter {
    /// Post a message to the worker. Its reply is given back through `on_decrypted`.
    fn post_decryption(&mut self, message: DecryptionMessage);
}

/// Everything the engine relies on.
pub trait Host:
    Clock + Timers + Transport + MediaSink + MediaElement + TextTrackSink + Decrypter
{
}

impl<T> Host for T where
    T: Clock + Timers + Transport + MediaSink + MediaElement + TextTrackSink + Decrypter
{
}
