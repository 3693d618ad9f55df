//! WebAssembly entry point: the `HlsPlayer` exported to JavaScript and the `JsHost` through
//! which the engine reaches the browser.

mod event_listeners;
pub mod formatters;
mod js_functions;

pub use js_functions::*;

use std::{collections::VecDeque, sync::Once};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use wasm_bindgen::prelude::*;

use crate::{
    decrypter::decrypt_message,
    error::SourceBufferError,
    host::{
        Clock, Cue, DecryptedMessage, DecryptionMessage, Decrypter, EndOfStreamError, LoaderKind,
        MediaElement, MediaSink, MediaSourceReadyState, RequestId, RequestOptions, ResponseType,
        SegmentProbe, TextTrackKind, TextTrackSink, TimerId, TimerReason, Timers, Transport,
    },
    master_playlist_controller::MasterPlaylistController,
    utils::time_ranges::TimeRanges,
};

use self::formatters::{format_cue_for_js, format_range_for_js, ranges_from_js};

static INIT: Once = Once::new();

/// Install the panic hook and the console logger, once per page.
fn init_environment() {
    INIT.call_once(|| {
        console_error_panic_hook::set_once();
        tracing_wasm::set_as_global_default_with_config(
            tracing_wasm::WASMLayerConfigBuilder::new()
                .set_max_level(tracing::Level::INFO)
                .build(),
        );
    });
}

/// `Host` backed by the JavaScript functions of `js_functions`.
#[derive(Default)]
pub struct JsHost {
    /// Requests which may still be reported, with their cancellation token.
    requests: Vec<(RequestId, CancellationToken)>,
    /// Decrypted payloads not yet given back to the engine.
    decrypted: VecDeque<DecryptedMessage>,
}

impl JsHost {
    /// Abort, on the JavaScript side, every request whose token was cancelled.
    fn abort_cancelled_requests(&mut self) {
        self.requests.retain(|(id, token)| {
            if token.is_cancelled() {
                jsAbortRequest(*id as u32);
                false
            } else {
                true
            }
        });
    }

    /// Stop tracking a request which will not be reported anymore.
    fn forget_request(&mut self, id: RequestId) {
        self.requests.retain(|(request_id, _)| *request_id != id);
    }
}

impl Clock for JsHost {
    fn now(&self) -> f64 {
        js_sys::Date::now()
    }

    fn random(&mut self) -> f64 {
        js_sys::Math::random()
    }
}

impl Timers for JsHost {
    fn set_timer(&mut self, delay_ms: f64, reason: TimerReason) -> TimerId {
        let (reason, media_type) = timer_reason_to_js(reason);
        jsTimer(delay_ms, reason, media_type) as TimerId
    }

    fn clear_timer(&mut self, id: TimerId) {
        jsClearTimer(id as u32);
    }
}

impl Transport for JsHost {
    fn fetch(&mut self, options: RequestOptions, token: CancellationToken) -> RequestId {
        let (range_start, range_end) = format_range_for_js(options.byte_range);
        let id = jsFetch(
            options.uri.as_str(),
            range_start,
            range_end,
            options.timeout_ms,
            options.response_type == ResponseType::Text,
            options.with_credentials,
        ) as RequestId;
        self.requests.push((id, token));
        id
    }
}

impl MediaSink for JsHost {
    fn ready_state(&self) -> MediaSourceReadyState {
        jsMediaSourceReadyState().into()
    }

    fn add_source_buffer(
        &mut self,
        track: LoaderKind,
        mime_type: &str,
    ) -> Result<(), SourceBufferError> {
        match jsAddSourceBuffer(track.into(), mime_type) {
            None => Ok(()),
            Some(message) => Err(SourceBufferError::Unknown(message)),
        }
    }

    fn append_buffer(&mut self, track: LoaderKind, data: Bytes) {
        jsAppendBuffer(track.into(), &data);
    }

    fn remove_buffer(&mut self, track: LoaderKind, start: f64, end: f64) {
        jsRemoveBuffer(track.into(), start, end);
    }

    fn set_timestamp_offset(&mut self, track: LoaderKind, offset: f64) {
        jsSetTimestampOffset(track.into(), offset);
    }

    fn source_buffered(&self, track: LoaderKind) -> TimeRanges {
        ranges_from_js(&jsSourceBuffered(track.into()))
    }

    fn end_of_stream(&mut self, error: Option<EndOfStreamError>) {
        jsEndOfStream(error.map(Into::into));
    }

    fn duration(&self) -> f64 {
        jsMediaSourceDuration()
    }

    fn set_duration(&mut self, duration: f64) {
        jsSetMediaSourceDuration(duration);
    }

    fn probe_segment(
        &mut self,
        track: LoaderKind,
        data: &[u8],
        is_fmp4: bool,
    ) -> Option<SegmentProbe> {
        match jsProbeSegment(track.into(), data, is_fmp4)?.as_slice() {
            [start, end, audio, video, ..] => Some(SegmentProbe {
                start: *start,
                end: *end,
                contains_audio: *audio != 0.,
                contains_video: *video != 0.,
            }),
            _ => None,
        }
    }
}

impl MediaElement for JsHost {
    fn current_time(&self) -> f64 {
        jsCurrentTime()
    }

    fn set_current_time(&mut self, time: f64) {
        jsSeek(time);
    }

    fn paused(&self) -> bool {
        jsIsPaused()
    }

    fn seeking(&self) -> bool {
        jsIsSeeking()
    }

    fn ended(&self) -> bool {
        jsIsEnded()
    }

    fn playback_rate(&self) -> f64 {
        jsPlaybackRate()
    }

    fn buffered(&self) -> TimeRanges {
        ranges_from_js(&jsBuffered())
    }

    fn player_dimensions(&self) -> (u32, u32) {
        match jsPlayerDimensions().as_slice() {
            [width, height, ..] => (*width, *height),
            _ => (0, 0),
        }
    }

    fn preload_none(&self) -> bool {
        jsIsPreloadNone()
    }
}

impl TextTrackSink for JsHost {
    fn add_cue(&mut self, track: TextTrackKind, cue: Cue) {
        let (payload, data) = format_cue_for_js(&cue.payload);
        jsAddCue(track.into(), cue.start, cue.end, &payload, data);
    }

    fn remove_cues(&mut self, track: TextTrackKind, start: f64, end: f64) {
        jsRemoveCues(track.into(), start, end);
    }
}

impl Decrypter for JsHost {
    // No worker thread in the browser: payloads are decrypted right away and given back once
    // the current entry point returns.
    fn post_decryption(&mut self, message: DecryptionMessage) {
        self.decrypted.push_back(decrypt_message(message));
    }
}

/// HLS player driven by JavaScript.
#[wasm_bindgen]
pub struct HlsPlayer {
    controller: MasterPlaylistController,
    host: JsHost,
}

impl HlsPlayer {
    /// Settle what the host deferred during the last entry point.
    fn flush(&mut self) {
        loop {
            self.host.abort_cancelled_requests();
            let Some(message) = self.host.decrypted.pop_front() else {
                break;
            };
            self.controller.on_decrypted(&mut self.host, message);
        }
    }
}
