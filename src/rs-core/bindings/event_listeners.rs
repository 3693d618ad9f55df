use bytes::Bytes;
use url::Url;
use wasm_bindgen::prelude::*;

use crate::{
    config::Config,
    host::{RequestId, RequestOutcome},
    master_playlist_controller::{MasterPlaylistController, PlayerEvent},
    utils::event_target::{Event, Subscribable, ALL_EVENTS},
};

use super::{
    formatters::{format_event_detail_for_js, ranges_for_js},
    init_environment, jsOnEvent,
    js_functions::{timer_reason_from_js, JsMediaEvent, JsTimerReason, MediaType},
    HlsPlayer, JsHost,
};

/// Methods called by the JavaScript code.
///
/// Those are only bindings converting to the right types: every decision is taken by the
/// `MasterPlaylistController`.
#[wasm_bindgen]
impl HlsPlayer {
    /// Create a player for the content at `src`. `config` is an optional JSON object
    /// overriding some of the default options.
    #[wasm_bindgen(constructor)]
    pub fn new(src: &str, config: Option<String>) -> Result<HlsPlayer, JsError> {
        init_environment();
        let config = match config {
            Some(json) => Config::from_json(&json)?,
            None => Config::default(),
        };
        let mut controller = MasterPlaylistController::new(src, config)?;
        controller.on(ALL_EVENTS, |event: &PlayerEvent| {
            jsOnEvent(event.name(), format_event_detail_for_js(event));
        });
        Ok(HlsPlayer {
            controller,
            host: JsHost::default(),
        })
    }

    /// Begin loading the Multivariant Playlist.
    pub fn start(&mut self) {
        self.controller.start(&mut self.host);
        self.flush();
    }

    /// Called once the MediaSource is "open".
    pub fn on_source_open(&mut self) {
        self.controller.on_source_open(&mut self.host);
        self.flush();
    }

    pub fn play(&mut self) {
        self.controller.play(&mut self.host);
        self.flush();
    }

    pub fn pause_loading(&mut self) {
        self.controller.pause_loading(&mut self.host);
        self.flush();
    }

    pub fn seek(&mut self, time: f64) {
        self.controller.set_current_time(&mut self.host, time);
        self.flush();
    }

    /// Called when a timer started with `jsTimer` elapsed.
    pub fn on_timer_ended(&mut self, id: u32, reason: JsTimerReason, media_type: MediaType) {
        let reason = timer_reason_from_js(reason, media_type);
        self.controller.on_timer(&mut self.host, id.into(), reason);
        self.flush();
    }

    /// Called each time new data of a request arrived. `loaded` is the total amount of bytes
    /// received until now.
    pub fn on_request_progress(&mut self, id: u32, loaded: f64) {
        self.controller
            .on_request_progress(&mut self.host, id.into(), loaded as u64);
        self.flush();
    }

    /// Called when a request started with `jsFetch` succeeded.
    ///
    /// `final_url` is the URL of the response, if redirections happened.
    pub fn on_request_finished(
        &mut self,
        id: u32,
        status: u16,
        body: Vec<u8>,
        final_url: Option<String>,
    ) {
        let final_uri = final_url.and_then(|url| Url::parse(&url).ok());
        self.report_request_end(
            id.into(),
            RequestOutcome::Loaded {
                status,
                body: Bytes::from(body),
                final_uri,
            },
        );
    }

    /// Called when a request started with `jsFetch` failed.
    pub fn on_request_failed(&mut self, id: u32, timed_out: bool, status: Option<u16>) {
        let outcome = if timed_out {
            RequestOutcome::TimedOut
        } else {
            RequestOutcome::Failed { status }
        };
        self.report_request_end(id.into(), outcome);
    }

    /// Called when an operation on a SourceBuffer ended.
    pub fn on_source_buffer_update(&mut self, media_type: MediaType) {
        self.controller
            .on_source_buffer_update(&mut self.host, media_type.into());
        self.flush();
    }

    pub fn on_media_event(&mut self, event: JsMediaEvent) {
        self.controller.on_media_event(&mut self.host, event.into());
        self.flush();
    }

    /// Variants which can be played, as a JSON array.
    pub fn representations(&self) -> Result<String, JsError> {
        Ok(serde_json::to_string(&self.controller.representations())?)
    }

    pub fn set_representation_enabled(&mut self, id: &str, enabled: bool) -> bool {
        let found = self
            .controller
            .set_representation_enabled(&mut self.host, id, enabled);
        self.flush();
        found
    }

    pub fn duration(&self) -> f64 {
        self.controller.duration(&self.host)
    }

    /// Seekable ranges, as `[start0, end0, start1, end1...]`.
    pub fn seekable(&self) -> Vec<f64> {
        ranges_for_js(self.controller.seekable())
    }

    /// Last bandwidth estimate, in bits per second.
    pub fn bandwidth(&self) -> f64 {
        self.controller.bandwidth()
    }

    pub fn dispose(&mut self) {
        self.controller.dispose(&mut self.host);
        self.flush();
    }
}

impl HlsPlayer {
    fn report_request_end(&mut self, id: RequestId, outcome: RequestOutcome) {
        self.host.forget_request(id);
        self.controller
            .on_request_finished(&mut self.host, id, outcome);
        self.flush();
    }
}
