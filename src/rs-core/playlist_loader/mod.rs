use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::{Config, RetryConfig},
    error::{PlaylistError, PlaylistLoaderError, RequestError, RequestErrorKind},
    host::{
        Clock, LoaderKind, RequestId, RequestOptions, RequestOutcome, ResponseType, TimerId,
        TimerReason, Timers, Transport,
    },
    parser::{parse_media_playlist, parse_playlist, ParsedPlaylist},
    playlist::{update_master, MasterPlaylist, Playlist},
    utils::event_target::{forward_subscribable, Event, EventTarget, Subscribable},
};

/// State of a `PlaylistLoader`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaylistLoaderState {
    /// Nothing loaded yet.
    HaveNothing,
    /// The Multivariant Playlist is known but no Media Playlist is.
    HaveMaster,
    /// A new Media Playlist is being loaded.
    SwitchingMedia,
    /// The current Media Playlist is loaded.
    HaveMetadata,
    /// The current Media Playlist is being refreshed.
    HaveCurrentMetadata,
}

impl PlaylistLoaderState {
    fn name(self) -> &'static str {
        match self {
            PlaylistLoaderState::HaveNothing => "HAVE_NOTHING",
            PlaylistLoaderState::HaveMaster => "HAVE_MASTER",
            PlaylistLoaderState::SwitchingMedia => "SWITCHING_MEDIA",
            PlaylistLoaderState::HaveMetadata => "HAVE_METADATA",
            PlaylistLoaderState::HaveCurrentMetadata => "HAVE_CURRENT_METADATA",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlaylistLoaderEvent {
    /// The first Media Playlist has been loaded.
    LoadedMetadata,
    /// A playlist (Multivariant or Media) has been loaded or refreshed.
    LoadedPlaylist,
    /// The Media Playlist is about to change.
    MediaChanging,
    /// The Media Playlist changed.
    MediaChange,
    /// A refresh of the Media Playlist brought nothing new.
    PlaylistUnchanged,
    Error(PlaylistError),
}

impl Event for PlaylistLoaderEvent {
    fn name(&self) -> &'static str {
        match self {
            PlaylistLoaderEvent::LoadedMetadata => "loadedmetadata",
            PlaylistLoaderEvent::LoadedPlaylist => "loadedplaylist",
            PlaylistLoaderEvent::MediaChanging => "mediachanging",
            PlaylistLoaderEvent::MediaChange => "mediachange",
            PlaylistLoaderEvent::PlaylistUnchanged => "playlistunchanged",
            PlaylistLoaderEvent::Error(_) => "error",
        }
    }
}

/// What a playlist request was made for.
#[derive(Clone, Debug, PartialEq)]
enum RequestTarget {
    /// The initial playlist, either Multivariant or Media.
    Initial,
    /// Switching to the Media Playlist with that URI.
    Switch {
        uri: String,
        starting_state: PlaylistLoaderState,
    },
    /// Refreshing the current, live, Media Playlist.
    Refresh { uri: String },
}

struct PendingRequest {
    /// Id of the last request made. Meaningless while waiting for a retry.
    request_id: RequestId,
    token: CancellationToken,
    url: Url,
    target: RequestTarget,
    attempts_failed: u32,
    /// Set while waiting before retrying the request.
    retry_timer: Option<TimerId>,
}

/// Loads the Multivariant Playlist, then keeps the selected Media Playlist up to date.
///
/// One `PlaylistLoader` exists for the main content and one per active alternate rendition.
pub struct PlaylistLoader {
    kind: LoaderKind,
    src_url: Url,
    state: PlaylistLoaderState,
    started: bool,
    master: Option<MasterPlaylist>,
    /// URI of the current Media Playlist.
    media_uri: Option<String>,
    request: Option<PendingRequest>,
    /// Live refresh or final-rendition reload.
    media_update_timer: Option<TimerId>,
    retry: RetryConfig,
    request_timeout: Option<f64>,
    with_credentials: bool,
    events: EventTarget<PlaylistLoaderEvent>,
}

forward_subscribable!(PlaylistLoader, PlaylistLoaderEvent, events);

impl PlaylistLoader {
    pub fn new(kind: LoaderKind, src_url: Url, config: &Config) -> Self {
        Self {
            kind,
            src_url,
            state: PlaylistLoaderState::HaveNothing,
            started: false,
            master: None,
            media_uri: None,
            request: None,
            media_update_timer: None,
            retry: config.playlist_retry,
            request_timeout: config.playlist_request_timeout,
            with_credentials: config.with_credentials,
            events: EventTarget::queued(),
        }
    }

    pub fn state(&self) -> PlaylistLoaderState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Current version of the Multivariant Playlist.
    pub fn master(&self) -> Option<&MasterPlaylist> {
        self.master.as_ref()
    }

    /// Replace the Multivariant Playlist by a newer version of it, e.g. with updated exclusion
    /// or timing information.
    pub fn replace_master(&mut self, master: MasterPlaylist) {
        self.master = Some(master);
    }

    /// The current Media Playlist.
    pub fn media(&self) -> Option<&Rc<Playlist>> {
        let uri = self.media_uri.as_deref()?;
        self.master.as_ref()?.playlist(uri)
    }

    /// Take every event triggered since the last call.
    pub fn drain_events(&mut self) -> Vec<PlaylistLoaderEvent> {
        self.events.drain()
    }

    /// Request the initial playlist.
    pub fn start<H: Transport>(&mut self, host: &mut H) {
        self.started = true;
        tracing::info!("PL({}): Loading {}", self.kind, self.src_url);
        let url = self.src_url.clone();
        self.issue_request(host, url, RequestTarget::Initial);
    }

    /// Switch to the Media Playlist with the given URI.
    ///
    /// Switching to a playlist already fully loaded (`end_list`) is done right away, other
    /// playlists are requested first.
    pub fn set_media<H: Transport>(
        &mut self,
        host: &mut H,
        uri: &str,
    ) -> Result<(), PlaylistLoaderError> {
        if self.state == PlaylistLoaderState::HaveNothing {
            return Err(PlaylistLoaderError::InvalidState(self.state.name()));
        }
        let starting_state = self.state;
        let master = self
            .master
            .as_ref()
            .ok_or(PlaylistLoaderError::InvalidState(self.state.name()))?;
        let playlist = master
            .playlist(uri)
            .ok_or_else(|| PlaylistLoaderError::UnknownPlaylist(uri.to_owned()))?;
        let end_list = playlist.end_list;
        let url = playlist.resolved_uri.clone();
        let media_change = self.media_uri.as_deref() != Some(uri);

        if end_list {
            self.stop_request();
            self.state = PlaylistLoaderState::HaveMetadata;
            self.media_uri = Some(uri.to_owned());
            if media_change {
                tracing::info!("PL({}): Switching to loaded playlist {uri}", self.kind);
                self.events.trigger(PlaylistLoaderEvent::MediaChanging);
                self.events.trigger(PlaylistLoaderEvent::MediaChange);
            }
            return Ok(());
        }

        if !media_change {
            return Ok(());
        }

        self.state = PlaylistLoaderState::SwitchingMedia;
        if let Some(req) = self.request.as_ref() {
            if req.url == url {
                return Ok(());
            }
            self.stop_request();
        }

        if self.media_uri.is_some() {
            self.events.trigger(PlaylistLoaderEvent::MediaChanging);
        }
        tracing::info!("PL({}): Switching to playlist {uri}", self.kind);
        self.issue_request(
            host,
            url,
            RequestTarget::Switch {
                uri: uri.to_owned(),
                starting_state,
            },
        );
        Ok(())
    }

    /// Select the first variant if the Multivariant Playlist was loaded and nothing selected a
    /// Media Playlist while reacting to its `LoadedPlaylist` event.
    pub fn select_default_media<H: Transport>(&mut self, host: &mut H) {
        if self.state != PlaylistLoaderState::HaveMaster
            || self.request.is_some()
            || self.media_uri.is_some()
        {
            return;
        }
        let first = self
            .master
            .as_ref()
            .and_then(|m| m.playlists.first())
            .map(|p| p.uri.clone());
        if let Some(uri) = first {
            if let Err(err) = self.set_media(host, &uri) {
                tracing::warn!("PL({}): Could not select first variant: {err}", self.kind);
            }
        }
    }

    /// Stop refreshing and loading playlists.
    pub fn pause<H: Timers>(&mut self, host: &mut H) {
        self.stop_request_with_host(host);
        self.clear_media_update_timer(host);
        match self.state {
            PlaylistLoaderState::HaveNothing => self.started = false,
            PlaylistLoaderState::SwitchingMedia => {
                self.state = if self.media_uri.is_some() {
                    PlaylistLoaderState::HaveMetadata
                } else {
                    PlaylistLoaderState::HaveMaster
                };
            }
            PlaylistLoaderState::HaveCurrentMetadata => {
                self.state = PlaylistLoaderState::HaveMetadata;
            }
            _ => {}
        }
    }

    /// Resume loading.
    ///
    /// When `is_final_rendition` is set, the current playlist is the last one which can be
    /// played: it is reloaded after a delay instead.
    pub fn load<H: Transport + Timers>(&mut self, host: &mut H, is_final_rendition: bool) {
        self.clear_media_update_timer(host);
        if is_final_rendition {
            let delay = match self.media() {
                Some(media) => media.target_duration / 2. * 1000.,
                None => 5. * 1000.,
            };
            tracing::info!("PL({}): Reloading final rendition in {delay}ms", self.kind);
            self.media_update_timer =
                Some(host.set_timer(delay, TimerReason::PlaylistRefresh(self.kind)));
            return;
        }
        if !self.started {
            self.start(host);
            return;
        }
        match self.media() {
            Some(media) if !media.end_list => self.refresh_media(host),
            _ => self.events.trigger(PlaylistLoaderEvent::LoadedPlaylist),
        }
    }

    /// To call when a timer fires. Returns `true` if it was one of this loader's.
    pub fn on_timer<H: Transport + Timers>(
        &mut self,
        host: &mut H,
        id: TimerId,
        reason: TimerReason,
    ) -> bool {
        match reason {
            TimerReason::PlaylistRefresh(kind)
                if kind == self.kind && self.media_update_timer == Some(id) =>
            {
                self.media_update_timer = None;
                self.load(host, false);
                true
            }
            TimerReason::PlaylistRetry(kind) if kind == self.kind => {
                let url = match self.request.as_ref() {
                    Some(req) if req.retry_timer == Some(id) => req.url.clone(),
                    _ => return false,
                };
                tracing::debug!("PL({}): Retrying request to {url}", self.kind);
                let options = self.request_options(url);
                let token = CancellationToken::new();
                let request_id = host.fetch(options, token.clone());
                if let Some(req) = self.request.as_mut() {
                    req.retry_timer = None;
                    req.token = token;
                    req.request_id = request_id;
                }
                true
            }
            _ => false,
        }
    }

    /// To call when a request ends. Returns `true` if it was one of this loader's.
    pub fn on_request_finished<H: Transport + Timers + Clock>(
        &mut self,
        host: &mut H,
        id: RequestId,
        outcome: RequestOutcome,
    ) -> bool {
        let is_ours = self
            .request
            .as_ref()
            .map_or(false, |r| r.retry_timer.is_none() && r.request_id == id);
        if !is_ours {
            return false;
        }
        match outcome {
            RequestOutcome::Loaded {
                body, final_uri, ..
            } => {
                let Some(req) = self.request.take() else {
                    return true;
                };
                let url = final_uri.unwrap_or(req.url);
                self.on_response(host, req.target, &body, url);
            }
            RequestOutcome::Aborted => {
                self.request = None;
            }
            RequestOutcome::TimedOut => {
                let err = self
                    .request
                    .as_ref()
                    .map(|r| RequestError::timed_out(r.url.as_str(), None));
                if let Some(err) = err {
                    self.on_request_failure(host, err);
                }
            }
            RequestOutcome::Failed { status } => {
                let err = self
                    .request
                    .as_ref()
                    .map(|r| RequestError::failed(r.url.as_str(), status));
                if let Some(err) = err {
                    self.on_request_failure(host, err);
                }
            }
        }
        true
    }

    /// Abort everything and forget listeners.
    pub fn dispose<H: Timers>(&mut self, host: &mut H) {
        self.stop_request_with_host(host);
        self.clear_media_update_timer(host);
        self.events.clear();
    }

    fn refresh_media<H: Transport>(&mut self, host: &mut H) {
        if self.state != PlaylistLoaderState::HaveMetadata {
            return;
        }
        let Some(media) = self.media() else {
            return;
        };
        let uri = media.uri.clone();
        let url = media.resolved_uri.clone();
        self.state = PlaylistLoaderState::HaveCurrentMetadata;
        tracing::debug!("PL({}): Refreshing {uri}", self.kind);
        self.issue_request(host, url, RequestTarget::Refresh { uri });
    }

    fn on_response<H: Transport + Timers>(
        &mut self,
        host: &mut H,
        target: RequestTarget,
        body: &[u8],
        url: Url,
    ) {
        match target {
            RequestTarget::Initial => self.on_initial_response(host, body, url),
            RequestTarget::Switch {
                uri,
                starting_state,
            } => {
                if self.have_metadata(host, body, &uri, &url, starting_state) {
                    if starting_state == PlaylistLoaderState::HaveMaster {
                        self.events.trigger(PlaylistLoaderEvent::LoadedMetadata);
                    } else {
                        self.events.trigger(PlaylistLoaderEvent::MediaChange);
                    }
                }
            }
            RequestTarget::Refresh { uri } => {
                self.have_metadata(host, body, &uri, &url, PlaylistLoaderState::HaveMetadata);
            }
        }
    }

    fn on_initial_response<H: Transport + Timers>(&mut self, host: &mut H, body: &[u8], url: Url) {
        match parse_playlist(body, &url) {
            Err(err) => {
                self.started = false;
                let err = PlaylistError::parsing(None, url.as_str(), &err.to_string());
                tracing::error!("PL({}): {err}", self.kind);
                self.events.trigger(PlaylistLoaderEvent::Error(err));
            }
            Ok(ParsedPlaylist::Master(master)) => {
                tracing::info!(
                    "PL({}): Multivariant Playlist loaded with {} variant(s)",
                    self.kind,
                    master.playlists.len()
                );
                self.state = PlaylistLoaderState::HaveMaster;
                self.src_url = url;
                self.master = Some(master);
                self.events.trigger(PlaylistLoaderEvent::LoadedPlaylist);
            }
            Ok(ParsedPlaylist::Media(media)) => {
                self.state = PlaylistLoaderState::HaveMaster;
                self.src_url = url.clone();
                let mut master = MasterPlaylist::from_media_url(&url);
                let uri = master.playlists.first().map(|p| p.uri.clone());
                let Some(uri) = uri else {
                    return;
                };
                if let Some(updated) = update_master(&master, media) {
                    master = updated;
                }
                self.master = Some(master);
                self.state = PlaylistLoaderState::HaveMetadata;
                self.media_uri = Some(uri);
                self.schedule_refresh(host, true);
                self.events.trigger(PlaylistLoaderEvent::LoadedPlaylist);
                self.events.trigger(PlaylistLoaderEvent::LoadedMetadata);
            }
        }
    }

    /// Integrate a freshly-loaded Media Playlist. Returns `false` if it could not be parsed.
    fn have_metadata<H: Timers>(
        &mut self,
        host: &mut H,
        body: &[u8],
        uri: &str,
        url: &Url,
        state_on_error: PlaylistLoaderState,
    ) -> bool {
        let media = match parse_media_playlist(body, uri, url) {
            Ok(media) => media,
            Err(err) => {
                self.state = state_on_error;
                let err = PlaylistError::parsing(Some(uri.to_owned()), url.as_str(), &err.to_string());
                tracing::error!("PL({}): {err}", self.kind);
                self.events.trigger(PlaylistLoaderEvent::Error(err));
                return false;
            }
        };
        self.state = PlaylistLoaderState::HaveMetadata;
        let Some(master) = self.master.as_ref() else {
            return false;
        };
        let updated = match update_master(master, media) {
            Some(next) => {
                self.master = Some(next);
                true
            }
            None => {
                tracing::debug!("PL({}): Playlist {uri} unchanged", self.kind);
                self.events.trigger(PlaylistLoaderEvent::PlaylistUnchanged);
                false
            }
        };
        self.media_uri = Some(uri.to_owned());
        self.schedule_refresh(host, updated);
        if updated {
            self.events.trigger(PlaylistLoaderEvent::LoadedPlaylist);
        }
        true
    }

    fn schedule_refresh<H: Timers>(&mut self, host: &mut H, updated: bool) {
        let Some(media) = self.media() else {
            return;
        };
        if media.end_list {
            return;
        }
        let delay = refresh_delay(media, updated);
        self.clear_media_update_timer(host);
        self.media_update_timer =
            Some(host.set_timer(delay, TimerReason::PlaylistRefresh(self.kind)));
    }

    fn on_request_failure<H: Timers + Clock>(&mut self, host: &mut H, err: RequestError) {
        let Some(req) = self.request.as_mut() else {
            return;
        };
        if is_retryable(&err) && req.attempts_failed < self.retry.max_retry {
            req.attempts_failed += 1;
            let delay = retry_delay(host, req.attempts_failed, &self.retry);
            tracing::warn!(
                "PL({}): Request to {} failed, retrying in {delay:.0}ms (attempt {})",
                self.kind,
                req.url,
                req.attempts_failed
            );
            req.retry_timer = Some(host.set_timer(delay, TimerReason::PlaylistRetry(self.kind)));
            return;
        }

        let Some(req) = self.request.take() else {
            return;
        };
        let (playlist_uri, state) = match req.target {
            RequestTarget::Initial => {
                if self.state == PlaylistLoaderState::HaveNothing {
                    self.started = false;
                }
                (None, self.state)
            }
            RequestTarget::Switch {
                uri,
                starting_state,
            } => (Some(uri), starting_state),
            RequestTarget::Refresh { uri } => (Some(uri), PlaylistLoaderState::HaveMetadata),
        };
        self.state = state;
        let error = PlaylistError::from_request(playlist_uri, req.url.as_str(), &err);
        tracing::warn!("PL({}): {error}", self.kind);
        self.events.trigger(PlaylistLoaderEvent::Error(error));
    }

    fn issue_request<H: Transport>(&mut self, host: &mut H, url: Url, target: RequestTarget) {
        let token = CancellationToken::new();
        let request_id = host.fetch(self.request_options(url.clone()), token.clone());
        self.request = Some(PendingRequest {
            request_id,
            token,
            url,
            target,
            attempts_failed: 0,
            retry_timer: None,
        });
    }

    fn request_options(&self, url: Url) -> RequestOptions {
        RequestOptions {
            uri: url,
            byte_range: None,
            response_type: ResponseType::Text,
            timeout_ms: self.request_timeout,
            with_credentials: self.with_credentials,
        }
    }

    /// Abort the pending request. Its retry timer, if any, will be ignored when firing.
    fn stop_request(&mut self) {
        if let Some(req) = self.request.take() {
            req.token.cancel();
        }
    }

    fn stop_request_with_host<H: Timers>(&mut self, host: &mut H) {
        if let Some(req) = self.request.take() {
            req.token.cancel();
            if let Some(timer) = req.retry_timer {
                host.clear_timer(timer);
            }
        }
    }

    fn clear_media_update_timer<H: Timers>(&mut self, host: &mut H) {
        if let Some(timer) = self.media_update_timer.take() {
            host.clear_timer(timer);
        }
    }
}

/// Delay, in milliseconds, before refreshing a live Media Playlist: the last segment's
/// duration if the last refresh brought changes, half the target duration otherwise.
pub fn refresh_delay(media: &Playlist, updated: bool) -> f64 {
    match media.segments.last() {
        Some(last) if updated && last.duration > 0. => last.duration * 1000.,
        _ => {
            let target = if media.target_duration > 0. {
                media.target_duration
            } else {
                10.
            };
            target * 500.
        }
    }
}

/// Timeouts, 404, 412 and server errors might be temporary.
fn is_retryable(err: &RequestError) -> bool {
    match err.kind {
        RequestErrorKind::Timeout => true,
        RequestErrorKind::Failure => {
            matches!(err.status, Some(status) if status == 404 || status == 412 || status >= 500)
        }
        RequestErrorKind::Aborted => false,
    }
}

/// Exponential backoff, fuzzed by up to 30% either way.
fn retry_delay<H: Clock>(host: &mut H, retry_attempt: u32, config: &RetryConfig) -> f64 {
    let exponent = retry_attempt.saturating_sub(1).min(31);
    let delay = f64::min(config.backoff_base * 2u64.pow(exponent) as f64, config.backoff_max);
    let fuzzing_factor = (host.random() * 2. - 1.) * 0.3;
    delay * (fuzzing_factor + 1.)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;
    use bytes::Bytes;
    use rstest::{fixture, rstest};

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=500000
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1500000
high.m3u8
";

    fn live_media(sequence: u64, count: usize) -> String {
        let mut s = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:{sequence}\n"
        );
        for i in 0..count {
            s.push_str(&format!("#EXTINF:9.0,\nseg{}.ts\n", sequence + i as u64));
        }
        s
    }

    fn vod_media() -> String {
        let mut s = live_media(0, 3);
        s.push_str("#EXT-X-ENDLIST\n");
        s
    }

    fn loaded(body: &str) -> RequestOutcome {
        RequestOutcome::Loaded {
            status: 200,
            body: Bytes::from(body.to_owned()),
            final_uri: None,
        }
    }

    #[fixture]
    fn loader() -> PlaylistLoader {
        PlaylistLoader::new(
            LoaderKind::Main,
            Url::parse("http://cdn.test/master.m3u8").expect("valid url"),
            &Config::default(),
        )
    }

    fn respond(loader: &mut PlaylistLoader, host: &mut MockHost, suffix: &str, outcome: RequestOutcome) {
        let id = host.request_to(suffix).map(|r| r.id).expect("pending request");
        assert!(loader.on_request_finished(host, id, outcome));
    }

    #[rstest]
    fn setting_media_before_master_fails(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        assert_eq!(
            loader.set_media(&mut host, "low.m3u8"),
            Err(PlaylistLoaderError::InvalidState("HAVE_NOTHING"))
        );
    }

    #[rstest]
    fn loads_master_then_first_variant(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(MASTER));
        assert_eq!(loader.state(), PlaylistLoaderState::HaveMaster);
        assert_eq!(loader.drain_events(), vec![PlaylistLoaderEvent::LoadedPlaylist]);

        loader.select_default_media(&mut host);
        assert_eq!(loader.state(), PlaylistLoaderState::SwitchingMedia);
        respond(&mut loader, &mut host, "low.m3u8", loaded(&live_media(0, 6)));
        assert_eq!(loader.state(), PlaylistLoaderState::HaveMetadata);
        assert_eq!(
            loader.drain_events(),
            vec![
                PlaylistLoaderEvent::LoadedPlaylist,
                PlaylistLoaderEvent::LoadedMetadata
            ]
        );
        assert_eq!(loader.media().map(|m| m.uri.as_str()), Some("low.m3u8"));
        assert_eq!(
            host.timer(TimerReason::PlaylistRefresh(LoaderKind::Main)).map(|t| t.delay),
            Some(9000.)
        );
    }

    #[rstest]
    fn wraps_bare_media_playlist(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(&vod_media()));
        assert_eq!(loader.state(), PlaylistLoaderState::HaveMetadata);
        assert_eq!(
            loader.drain_events(),
            vec![
                PlaylistLoaderEvent::LoadedPlaylist,
                PlaylistLoaderEvent::LoadedMetadata
            ]
        );
        let master = loader.master().expect("synthesized master");
        assert_eq!(master.playlists.len(), 1);
        assert_eq!(loader.media().map(|m| m.segments.len()), Some(3));
        assert!(host.timers.is_empty());
    }

    #[rstest]
    fn unchanged_refresh_is_reported(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(MASTER));
        loader.select_default_media(&mut host);
        respond(&mut loader, &mut host, "low.m3u8", loaded(&live_media(0, 6)));
        loader.drain_events();
        let generation = loader.master().map(|m| m.generation());

        let timer = host
            .timer(TimerReason::PlaylistRefresh(LoaderKind::Main))
            .map(|t| t.id)
            .expect("refresh timer");
        assert!(loader.on_timer(&mut host, timer, TimerReason::PlaylistRefresh(LoaderKind::Main)));
        assert_eq!(loader.state(), PlaylistLoaderState::HaveCurrentMetadata);
        respond(&mut loader, &mut host, "low.m3u8", loaded(&live_media(0, 6)));
        assert_eq!(
            loader.drain_events(),
            vec![PlaylistLoaderEvent::PlaylistUnchanged]
        );
        assert_eq!(loader.master().map(|m| m.generation()), generation);
        // half the target duration when unchanged
        assert_eq!(
            host.timer(TimerReason::PlaylistRefresh(LoaderKind::Main)).map(|t| t.delay),
            Some(5000.)
        );
    }

    #[rstest]
    fn switching_to_loaded_vod_playlist_is_synchronous(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(MASTER));
        loader.set_media(&mut host, "high.m3u8").expect("known playlist");
        respond(&mut loader, &mut host, "high.m3u8", loaded(&vod_media()));
        loader.set_media(&mut host, "low.m3u8").expect("known playlist");
        respond(&mut loader, &mut host, "low.m3u8", loaded(&vod_media()));
        loader.drain_events();

        let requests_before = host.requests.len();
        loader.set_media(&mut host, "high.m3u8").expect("known playlist");
        assert_eq!(host.requests.len(), requests_before);
        assert_eq!(loader.state(), PlaylistLoaderState::HaveMetadata);
        assert_eq!(
            loader.drain_events(),
            vec![PlaylistLoaderEvent::MediaChanging, PlaylistLoaderEvent::MediaChange]
        );
    }

    #[rstest]
    fn coalesces_and_aborts_switches(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(MASTER));
        loader.set_media(&mut host, "low.m3u8").expect("known playlist");
        let requests = host.requests.len();
        loader.set_media(&mut host, "low.m3u8").expect("known playlist");
        assert_eq!(host.requests.len(), requests);

        loader.set_media(&mut host, "high.m3u8").expect("known playlist");
        assert!(host.request_to("low.m3u8").is_none());
        assert!(host.request_to("high.m3u8").is_some());
        assert_eq!(
            loader.set_media(&mut host, "unknown.m3u8"),
            Err(PlaylistLoaderError::UnknownPlaylist("unknown.m3u8".into()))
        );
    }

    #[rstest]
    fn retries_then_reports_errors(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(MASTER));
        loader.set_media(&mut host, "low.m3u8").expect("known playlist");
        loader.drain_events();

        for attempt in 1..=2u32 {
            respond(
                &mut loader,
                &mut host,
                "low.m3u8",
                RequestOutcome::Failed { status: Some(503) },
            );
            assert!(loader.drain_events().is_empty());
            let timer = host
                .timer(TimerReason::PlaylistRetry(LoaderKind::Main))
                .expect("retry timer");
            assert_eq!(timer.delay, 300. * 2f64.powi(attempt as i32 - 1));
            let id = timer.id;
            assert!(loader.on_timer(&mut host, id, TimerReason::PlaylistRetry(LoaderKind::Main)));
        }
        respond(
            &mut loader,
            &mut host,
            "low.m3u8",
            RequestOutcome::Failed { status: Some(503) },
        );
        let events = loader.drain_events();
        let [PlaylistLoaderEvent::Error(err)] = events.as_slice() else {
            panic!("expected an error, got {events:?}");
        };
        assert_eq!(err.playlist_uri.as_deref(), Some("low.m3u8"));
        assert!(err.server_fault);
        assert_eq!(err.code(), 4);
        assert_eq!(loader.state(), PlaylistLoaderState::HaveMaster);
    }

    #[rstest]
    fn client_errors_are_not_retried(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(
            &mut loader,
            &mut host,
            "master.m3u8",
            RequestOutcome::Failed { status: Some(403) },
        );
        let events = loader.drain_events();
        assert!(matches!(events.as_slice(), [PlaylistLoaderEvent::Error(e)] if e.code() == 2));
        assert!(!loader.is_started());
    }

    #[rstest]
    fn final_rendition_reloads_after_half_target_duration(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.load(&mut host, true);
        assert_eq!(
            host.timer(TimerReason::PlaylistRefresh(LoaderKind::Main)).map(|t| t.delay),
            Some(5000.)
        );
        let id = host.timers[0].id;
        assert!(loader.on_timer(&mut host, id, TimerReason::PlaylistRefresh(LoaderKind::Main)));
        assert!(loader.is_started());
    }

    #[rstest]
    fn pause_restores_state_and_aborts(mut loader: PlaylistLoader) {
        let mut host = MockHost::new();
        loader.start(&mut host);
        respond(&mut loader, &mut host, "master.m3u8", loaded(MASTER));
        loader.set_media(&mut host, "low.m3u8").expect("known playlist");
        loader.pause(&mut host);
        assert_eq!(loader.state(), PlaylistLoaderState::HaveMaster);
        assert!(host.pending_requests().is_empty());
    }

    #[rstest]
    #[case(&[9., 6.], true, 6000.)]
    #[case(&[9., 6.], false, 5000.)]
    #[case(&[], true, 5000.)]
    fn computes_refresh_delay(#[case] durations: &[f64], #[case] updated: bool, #[case] expected: f64) {
        let mut media = crate::playlist::test_helpers::media_playlist("p.m3u8", 0, durations, false);
        media.target_duration = 10.;
        assert_eq!(refresh_delay(&media, updated), expected);
    }
}
