use wasm_bindgen::prelude::*;

use crate::host::{self, LoaderKind, TextTrackKind, TimerReason};

/// # js_functions
///
/// JavaScript functions callable from Rust, and the types they exchange. Every function acts on
/// the media element and MediaSource of the `HlsPlayer` which called it.

#[wasm_bindgen]
extern "C" {
    // Starts a timer for `duration` milliseconds.
    //
    // Once elapsed, and unless `jsClearTimer` was called with the returned id meanwhile,
    // `on_timer_ended` is called with that id, `reason` and `media_type`.
    pub fn jsTimer(duration: f64, reason: JsTimerReason, media_type: MediaType) -> u32;

    // Clear a timer started with `jsTimer`.
    pub fn jsClearTimer(id: u32);

    // Fetch `url`, optionally a byte range of it (both bounds included).
    //
    // Its end is always reported asynchronously through either `on_request_finished` or
    // `on_request_failed`, and its progress through `on_request_progress`.
    // Nothing is reported anymore for requests aborted through `jsAbortRequest`.
    pub fn jsFetch(
        url: &str,
        range_start: Option<f64>,
        range_end: Option<f64>,
        timeout: Option<f64>,
        as_text: bool,
        with_credentials: bool,
    ) -> u32;

    // Abort a request started with `jsFetch`.
    pub fn jsAbortRequest(id: u32);

    pub fn jsMediaSourceReadyState() -> ReadyState;

    // Create a SourceBuffer with the given mime-type. Returns an error message on failure.
    pub fn jsAddSourceBuffer(media_type: MediaType, mime_type: &str) -> Option<String>;

    // Queue an append on the given SourceBuffer. `on_source_buffer_update` is called once
    // done.
    pub fn jsAppendBuffer(media_type: MediaType, data: &[u8]);

    // Queue a removal on the given SourceBuffer. `on_source_buffer_update` is called once
    // done.
    pub fn jsRemoveBuffer(media_type: MediaType, start: f64, end: f64);

    pub fn jsSetTimestampOffset(media_type: MediaType, offset: f64);

    // Buffered ranges of the given SourceBuffer, as `[start0, end0, start1, end1...]`.
    pub fn jsSourceBuffered(media_type: MediaType) -> Vec<f64>;

    pub fn jsEndOfStream(error: Option<EndOfStreamReason>);

    pub fn jsMediaSourceDuration() -> f64;

    pub fn jsSetMediaSourceDuration(duration: f64);

    // Read the timing of a segment: `[start, end, has_audio, has_video]`, the last two being
    // `0` or `1`.
    pub fn jsProbeSegment(media_type: MediaType, data: &[u8], is_fmp4: bool) -> Option<Vec<f64>>;

    pub fn jsCurrentTime() -> f64;

    pub fn jsSeek(position: f64);

    pub fn jsIsPaused() -> bool;

    pub fn jsIsSeeking() -> bool;

    pub fn jsIsEnded() -> bool;

    pub fn jsPlaybackRate() -> f64;

    // Buffered ranges of the media element, as `[start0, end0, start1, end1...]`.
    pub fn jsBuffered() -> Vec<f64>;

    // `[width, height]` of the media element, in CSS pixels.
    pub fn jsPlayerDimensions() -> Vec<u32>;

    pub fn jsIsPreloadNone() -> bool;

    // Add a cue on the given text track. `payload` is a JSON object, `data` the raw subtitles
    // for `TextTrack::Subtitles` cues.
    pub fn jsAddCue(track: TextTrack, start: f64, end: f64, payload: &str, data: Option<Vec<u8>>);

    pub fn jsRemoveCues(track: TextTrack, start: f64, end: f64);

    // Forward an event of the player. `detail` is a JSON value, when the event has one.
    pub fn jsOnEvent(name: &str, detail: Option<String>);
}

#[wasm_bindgen]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Main,
    Audio,
    Subtitle,
}

impl From<LoaderKind> for MediaType {
    fn from(kind: LoaderKind) -> Self {
        match kind {
            LoaderKind::Main => MediaType::Main,
            LoaderKind::Audio => MediaType::Audio,
            LoaderKind::Subtitle => MediaType::Subtitle,
        }
    }
}

impl From<MediaType> for LoaderKind {
    fn from(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Main => LoaderKind::Main,
            MediaType::Audio => LoaderKind::Audio,
            MediaType::Subtitle => LoaderKind::Subtitle,
        }
    }
}

#[wasm_bindgen]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsTimerReason {
    BufferCheck,
    PlaylistRefresh,
    PlaylistRetry,
    PlaybackMonitor,
    GapSkip,
}

/// Split a `TimerReason` into what is given to `jsTimer`.
pub(super) fn timer_reason_to_js(reason: TimerReason) -> (JsTimerReason, MediaType) {
    match reason {
        TimerReason::BufferCheck(kind) => (JsTimerReason::BufferCheck, kind.into()),
        TimerReason::PlaylistRefresh(kind) => (JsTimerReason::PlaylistRefresh, kind.into()),
        TimerReason::PlaylistRetry(kind) => (JsTimerReason::PlaylistRetry, kind.into()),
        TimerReason::PlaybackMonitor => (JsTimerReason::PlaybackMonitor, MediaType::Main),
        TimerReason::GapSkip => (JsTimerReason::GapSkip, MediaType::Main),
    }
}

pub(super) fn timer_reason_from_js(reason: JsTimerReason, media_type: MediaType) -> TimerReason {
    let kind = media_type.into();
    match reason {
        JsTimerReason::BufferCheck => TimerReason::BufferCheck(kind),
        JsTimerReason::PlaylistRefresh => TimerReason::PlaylistRefresh(kind),
        JsTimerReason::PlaylistRetry => TimerReason::PlaylistRetry(kind),
        JsTimerReason::PlaybackMonitor => TimerReason::PlaybackMonitor,
        JsTimerReason::GapSkip => TimerReason::GapSkip,
    }
}

#[wasm_bindgen]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Closed,
    Open,
    Ended,
}

impl From<ReadyState> for host::MediaSourceReadyState {
    fn from(state: ReadyState) -> Self {
        match state {
            ReadyState::Closed => host::MediaSourceReadyState::Closed,
            ReadyState::Open => host::MediaSourceReadyState::Open,
            ReadyState::Ended => host::MediaSourceReadyState::Ended,
        }
    }
}

#[wasm_bindgen]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOfStreamReason {
    Network,
    Decode,
}

impl From<host::EndOfStreamError> for EndOfStreamReason {
    fn from(err: host::EndOfStreamError) -> Self {
        match err {
            host::EndOfStreamError::Network => EndOfStreamReason::Network,
            host::EndOfStreamError::Decode => EndOfStreamReason::Decode,
        }
    }
}

#[wasm_bindgen]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextTrack {
    SegmentMetadata,
    CueTags,
    Subtitles,
}

impl From<TextTrackKind> for TextTrack {
    fn from(kind: TextTrackKind) -> Self {
        match kind {
            TextTrackKind::SegmentMetadata => TextTrack::SegmentMetadata,
            TextTrackKind::CueTags => TextTrack::CueTags,
            TextTrackKind::Subtitles => TextTrack::Subtitles,
        }
    }
}

/// Media element events, as reported through `on_media_event`.
#[wasm_bindgen]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsMediaEvent {
    Play,
    Playing,
    Pause,
    Waiting,
    Seeking,
    Seeked,
    Ended,
    Error,
}

impl From<JsMediaEvent> for host::MediaEvent {
    fn from(event: JsMediaEvent) -> Self {
        match event {
            JsMediaEvent::Play => host::MediaEvent::Play,
            JsMediaEvent::Playing => host::MediaEvent::Playing,
            JsMediaEvent::Pause => host::MediaEvent::Pause,
            JsMediaEvent::Waiting => host::MediaEvent::Waiting,
            JsMediaEvent::Seeking => host::MediaEvent::Seeking,
            JsMediaEvent::Seeked => host::MediaEvent::Seeked,
            JsMediaEvent::Ended => host::MediaEvent::Ended,
            JsMediaEvent::Error => host::MediaEvent::Error,
        }
    }
}
