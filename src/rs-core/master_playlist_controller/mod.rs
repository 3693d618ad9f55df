//! Orchestrates everything needed to play one HLS content.
//!
//! The `MasterPlaylistController` owns the playlist loaders, the segment loaders, the sync
//! controller and the playback watcher. The host calls its `on_*` methods when something
//! happened (a timer fired, a request ended...), the controller forwards it to the concerned
//! component, then reacts to what every component reported before giving control back.

mod ad_cues;
mod event_handlers;
mod media_groups;
mod representations;

pub use media_groups::default_rendition;
pub use representations::Representation;

use std::rc::Rc;

use url::Url;

use crate::{
    adaptive::{goal_buffer_length, system_bandwidth, PlaylistSelector},
    config::Config,
    error::{BlacklistDuration, PlayerError},
    host::{
        DecryptedMessage, EndOfStreamError, Host, LoaderKind, MediaEvent, MediaSourceReadyState,
        RequestId, RequestOutcome, TimerId, TimerReason,
    },
    playback_watcher::{PlaybackWatcher, WatchedContent},
    playlist::{
        duration, is_enabled, is_lowest_enabled_rendition, seekable, update_segments,
        ExcludeUntil, MasterPlaylist, Playlist,
    },
    playlist_loader::PlaylistLoader,
    segment_loader::{LoaderContext, SegmentLoader, SegmentLoaderStats},
    sync_controller::SyncController,
    utils::{
        codecs::{default_codecs, make_mime_type, parse_codecs, CodecInfo},
        event_target::{forward_subscribable, Event, EventTarget, Subscribable},
        time_ranges::{find_range, printable_range, TimeRanges},
    },
};

use self::{ad_cues::AdCues, media_groups::ActiveRendition};

/// Events emitted by the `MasterPlaylistController`, for the player's user.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    /// The first Media Playlist has been loaded.
    LoadedMetadata,
    /// The main Media Playlist was loaded or refreshed.
    LoadedPlaylist,
    /// The main Media Playlist changed.
    MediaChange,
    /// A new bandwidth measure was taken into account.
    BandwidthUpdate,
    /// A variant has been excluded from selection.
    BlacklistPlaylist {
        uri: String,
        exclude_until: ExcludeUntil,
    },
    /// The only playable variant encountered an error and will be reloaded.
    RetryPlaylist,
    /// The live Media Playlist stopped being updated.
    PlaylistStuck,
    SeekableChanged,
    DurationChange,
    /// Media data has been pushed.
    Progress,
    SourceOpen,
    /// The initial variant has been chosen and loaded.
    SelectedInitialMedia,
    /// Every buffered data was removed.
    Reset,
    /// Something noteworthy but not actionable happened, identified by its name.
    Usage(&'static str),
    /// Playback cannot continue.
    Error(PlayerError),
}

impl Event for PlayerEvent {
    fn name(&self) -> &'static str {
        match self {
            PlayerEvent::LoadedMetadata => "loadedmetadata",
            PlayerEvent::LoadedPlaylist => "loadedplaylist",
            PlayerEvent::MediaChange => "mediachange",
            PlayerEvent::BandwidthUpdate => "bandwidthupdate",
            PlayerEvent::BlacklistPlaylist { .. } => "blacklistplaylist",
            PlayerEvent::RetryPlaylist => "retryplaylist",
            PlayerEvent::PlaylistStuck => "playliststuck",
            PlayerEvent::SeekableChanged => "seekablechanged",
            PlayerEvent::DurationChange => "durationchange",
            PlayerEvent::Progress => "progress",
            PlayerEvent::SourceOpen => "sourceopen",
            PlayerEvent::SelectedInitialMedia => "selectedinitialmedia",
            PlayerEvent::Reset => "hls-reset",
            PlayerEvent::Usage(_) => "usage",
            PlayerEvent::Error(_) => "error",
        }
    }
}

/// Values every segment loader reads during one entry point.
#[derive(Clone, Copy, Debug)]
struct LoadingConditions {
    duration: f64,
    has_played: bool,
    goal_buffer_length: f64,
}

impl LoadingConditions {
    fn context<'a>(
        self,
        sync: &'a mut SyncController,
        master: Option<&'a MasterPlaylist>,
        seekable: &'a TimeRanges,
    ) -> LoaderContext<'a> {
        LoaderContext {
            sync,
            master,
            seekable,
            duration: self.duration,
            has_played: self.has_played,
            goal_buffer_length: self.goal_buffer_length,
        }
    }
}

pub struct MasterPlaylistController {
    config: Config,
    main_playlist_loader: PlaylistLoader,
    /// Alternate audio rendition in use, if not muxed in the variants.
    audio: Option<ActiveRendition>,
    subtitles: Option<ActiveRendition>,
    /// Renditions which failed, never selected again.
    failed_renditions: Vec<(LoaderKind, String)>,
    main_segment_loader: SegmentLoader,
    audio_segment_loader: SegmentLoader,
    subtitle_segment_loader: SegmentLoader,
    sync_controller: SyncController,
    playback_watcher: PlaybackWatcher,
    selector: PlaylistSelector,
    ad_cues: AdCues,
    seekable: TimeRanges,
    has_played: bool,
    /// Consecutive main playlist refreshes which brought nothing new.
    unchanged_refreshes: u32,
    error: Option<PlayerError>,
    disposed: bool,
    events: EventTarget<PlayerEvent>,
}

forward_subscribable!(MasterPlaylistController, PlayerEvent, events);

impl MasterPlaylistController {
    /// Prepare the playback of the content at `src`. Nothing is loaded before `start`.
    pub fn new(src: &str, config: Config) -> Result<Self, PlayerError> {
        let src_url = Url::parse(src).map_err(|_| PlayerError::InvalidUrl(src.to_owned()))?;
        Ok(Self {
            main_playlist_loader: PlaylistLoader::new(LoaderKind::Main, src_url, &config),
            audio: None,
            subtitles: None,
            failed_renditions: vec![],
            main_segment_loader: SegmentLoader::new(LoaderKind::Main, &config),
            audio_segment_loader: SegmentLoader::new(LoaderKind::Audio, &config),
            subtitle_segment_loader: SegmentLoader::new(LoaderKind::Subtitle, &config),
            sync_controller: SyncController::new(),
            playback_watcher: PlaybackWatcher::new(&config),
            selector: PlaylistSelector::new(config.selector),
            ad_cues: AdCues::default(),
            seekable: TimeRanges::new(),
            has_played: false,
            unchanged_refreshes: 0,
            error: None,
            disposed: false,
            events: EventTarget::new(),
            config,
        })
    }

    /// Load the Multivariant Playlist and start watching playback.
    pub fn start<H: Host>(&mut self, host: &mut H) {
        if self.disposed || self.main_playlist_loader.is_started() {
            return;
        }
        tracing::info!("MPC: starting");
        self.main_playlist_loader.start(host);
        self.playback_watcher.start(host);
        self.process_events(host);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current version of the Multivariant Playlist.
    pub fn master(&self) -> Option<&MasterPlaylist> {
        self.main_playlist_loader.master()
    }

    /// The variant currently loaded.
    pub fn media(&self) -> Option<&Rc<Playlist>> {
        self.main_playlist_loader.media()
    }

    /// Last fatal error, if playback stopped because of one.
    pub fn error(&self) -> Option<&PlayerError> {
        self.error.as_ref()
    }

    pub fn seekable(&self) -> &TimeRanges {
        &self.seekable
    }

    /// Duration of the content: `f64::INFINITY` for live contents, `0.` before its first Media
    /// Playlist is known.
    pub fn duration<H: Host>(&self, host: &H) -> f64 {
        let Some(media) = self.main_playlist_loader.media() else {
            return 0.;
        };
        if !media.end_list {
            return f64::INFINITY;
        }
        let sink_duration = host.duration();
        if host.ready_state() != MediaSourceReadyState::Closed && sink_duration.is_finite() {
            sink_duration
        } else {
            duration(media, None, 0.)
        }
    }

    /// Last bandwidth measured by the main segment loader, in bits per second.
    pub fn bandwidth(&self) -> f64 {
        self.main_segment_loader.bandwidth()
    }

    /// Bandwidth the variant selection is based on, network and processing combined.
    pub fn system_bandwidth(&self) -> f64 {
        system_bandwidth(
            self.main_segment_loader.bandwidth(),
            self.main_segment_loader.throughput(),
        )
    }

    pub fn stats(&self) -> &SegmentLoaderStats {
        self.main_segment_loader.stats()
    }

    /// Choose the variant which should be played now.
    pub fn select_playlist<H: Host>(&mut self, host: &H) -> Option<Rc<Playlist>> {
        let bandwidth = self.system_bandwidth();
        let master = self.main_playlist_loader.master()?;
        self.selector
            .select(
                master,
                bandwidth,
                host.player_dimensions(),
                &self.config,
                host.now(),
            )
            .cloned()
    }

    /// To call once the host's MediaSource is open.
    pub fn on_source_open<H: Host>(&mut self, host: &mut H) {
        tracing::info!("MPC: MediaSource open");
        self.setup_source_buffers(host);
        if !host.paused() {
            self.play(host);
        }
        self.events.trigger(PlayerEvent::SourceOpen);
        self.process_events(host);
    }

    /// To call when playback is requested.
    pub fn play<H: Host>(&mut self, host: &mut H) {
        if self.setup_first_play(host) {
            self.process_events(host);
            return;
        }
        if host.ended() {
            host.set_current_time(0.);
        }
        if self.has_played {
            self.load(host);
        }
        // paused long enough to fall out of the live window
        if self.duration(&*host) == f64::INFINITY {
            if let (Some(start), Some(end)) = (self.seekable.start(0), self.seekable.last_end()) {
                if host.current_time() < start {
                    tracing::info!("MPC: behind the live window, jumping to {end}");
                    host.set_current_time(end);
                }
            }
        }
        self.process_events(host);
    }

    /// Resume every segment loader in use.
    pub fn load<H: Host>(&mut self, host: &mut H) {
        self.with_segment_loader(host, LoaderKind::Main, |l, h, ctx| l.load(h, ctx));
        if self.audio.is_some() {
            self.with_segment_loader(host, LoaderKind::Audio, |l, h, ctx| l.load(h, ctx));
        }
        if self.subtitles.is_some() {
            self.with_segment_loader(host, LoaderKind::Subtitle, |l, h, ctx| l.load(h, ctx));
        }
    }

    /// Stop loading playlists and segments until `load` is called.
    pub fn pause_loading<H: Host>(&mut self, host: &mut H) {
        self.main_playlist_loader.pause(host);
        for rendition in [self.audio.as_mut(), self.subtitles.as_mut()].into_iter().flatten() {
            rendition.loader.pause(host);
        }
        self.main_segment_loader.pause(host);
        self.audio_segment_loader.pause(host);
        self.subtitle_segment_loader.pause(host);
    }

    /// Seek to `time`. When it is not buffered yet, everything buffered is dropped and loading
    /// restarts from there.
    pub fn set_current_time<H: Host>(&mut self, host: &mut H, time: f64) {
        let already_buffered = !find_range(&host.buffered(), time).is_empty();
        host.set_current_time(time);
        let has_segments = self
            .main_playlist_loader
            .media()
            .map_or(false, |m| !m.segments.is_empty());
        if !has_segments || already_buffered {
            return;
        }
        tracing::info!("MPC: seeking to unbuffered time {time}");
        let duration = self.duration(&*host);
        self.main_segment_loader.reset_everything(host, duration);
        if self.audio.is_some() {
            self.audio_segment_loader.reset_everything(host, duration);
        }
        if self.subtitles.is_some() {
            self.subtitle_segment_loader.reset_everything(host, duration);
        }
        self.load(host);
        self.process_events(host);
    }

    /// To call when a timer fires. Returns `false` if no component armed it.
    pub fn on_timer<H: Host>(&mut self, host: &mut H, id: TimerId, reason: TimerReason) -> bool {
        let handled = match reason {
            TimerReason::PlaylistRefresh(kind) | TimerReason::PlaylistRetry(kind) => {
                match self.playlist_loader_mut(kind) {
                    Some(loader) => loader.on_timer(host, id, reason),
                    None => false,
                }
            }
            TimerReason::BufferCheck(kind) => {
                self.with_segment_loader(host, kind, |l, h, ctx| l.on_timer(h, ctx, id, reason))
            }
            TimerReason::PlaybackMonitor | TimerReason::GapSkip => {
                let content = WatchedContent {
                    seekable: &self.seekable,
                    media: self.main_playlist_loader.media().map(|m| &**m),
                };
                self.playback_watcher.on_timer(host, content, id, reason)
            }
        };
        if handled {
            self.process_events(host);
        }
        handled
    }

    /// To call on a request's progress.
    pub fn on_request_progress<H: Host>(
        &mut self,
        host: &mut H,
        id: RequestId,
        bytes_loaded: u64,
    ) -> bool {
        let handled = [LoaderKind::Main, LoaderKind::Audio, LoaderKind::Subtitle]
            .into_iter()
            .any(|kind| {
                self.with_segment_loader(host, kind, |l, h, ctx| {
                    l.on_request_progress(h, ctx, id, bytes_loaded)
                })
            });
        if handled {
            self.process_events(host);
        }
        handled
    }

    /// To call when a request ends. Returns `false` if the request is unknown, e.g. because
    /// it was cancelled.
    pub fn on_request_finished<H: Host>(
        &mut self,
        host: &mut H,
        id: RequestId,
        outcome: RequestOutcome,
    ) -> bool {
        let mut handled = self
            .main_playlist_loader
            .on_request_finished(host, id, outcome.clone());
        for rendition in [self.audio.as_mut(), self.subtitles.as_mut()].into_iter().flatten() {
            if handled {
                break;
            }
            handled = rendition.loader.on_request_finished(host, id, outcome.clone());
        }
        for kind in [LoaderKind::Main, LoaderKind::Audio, LoaderKind::Subtitle] {
            if handled {
                break;
            }
            handled = self.with_segment_loader(host, kind, |l, h, ctx| {
                l.on_request_finished(h, ctx, id, outcome.clone())
            });
        }
        if handled {
            self.process_events(host);
        } else {
            tracing::debug!("MPC: ignoring end of unknown request {id}");
        }
        handled
    }

    /// To call when the host finished an operation on one of its buffers.
    pub fn on_source_buffer_update<H: Host>(&mut self, host: &mut H, track: LoaderKind) {
        self.with_segment_loader(host, track, |l, h, ctx| l.on_source_buffer_update(h, ctx));
        self.process_events(host);
    }

    /// To call with the decryption worker's replies.
    pub fn on_decrypted<H: Host>(&mut self, host: &mut H, message: DecryptedMessage) -> bool {
        let handled = [LoaderKind::Main, LoaderKind::Audio, LoaderKind::Subtitle]
            .into_iter()
            .any(|kind| {
                self.with_segment_loader(host, kind, |l, h, ctx| {
                    l.on_decrypted(h, ctx, message.clone())
                })
            });
        if handled {
            self.process_events(host);
        }
        handled
    }

    /// To call on every media element event.
    pub fn on_media_event<H: Host>(&mut self, host: &mut H, event: MediaEvent) {
        let content = WatchedContent {
            seekable: &self.seekable,
            media: self.main_playlist_loader.media().map(|m| &**m),
        };
        self.playback_watcher.on_media_event(host, content, event);
        if event == MediaEvent::Play {
            self.play(host);
        }
        self.process_events(host);
    }

    /// Stop everything. The controller cannot be used anymore.
    pub fn dispose<H: Host>(&mut self, host: &mut H) {
        tracing::info!("MPC: disposing");
        self.disposed = true;
        self.main_playlist_loader.dispose(host);
        for rendition in [self.audio.as_mut(), self.subtitles.as_mut()].into_iter().flatten() {
            rendition.loader.dispose(host);
        }
        self.main_segment_loader.dispose(host);
        self.audio_segment_loader.dispose(host);
        self.subtitle_segment_loader.dispose(host);
        self.playback_watcher.dispose(host);
        self.ad_cues.clear(host);
        self.events.clear();
    }

    fn conditions<H: Host>(&self, host: &H) -> LoadingConditions {
        LoadingConditions {
            duration: self.duration(host),
            has_played: self.has_played,
            goal_buffer_length: goal_buffer_length(&self.config, host.current_time()),
        }
    }

    /// Run `f` on the segment loader of the given kind with a context built from the current
    /// state.
    fn with_segment_loader<H: Host, R>(
        &mut self,
        host: &mut H,
        kind: LoaderKind,
        f: impl FnOnce(&mut SegmentLoader, &mut H, &mut LoaderContext<'_>) -> R,
    ) -> R {
        let conditions = self.conditions(&*host);
        let master = match kind {
            LoaderKind::Main => self.main_playlist_loader.master(),
            LoaderKind::Audio | LoaderKind::Subtitle => None,
        };
        let mut ctx = conditions.context(&mut self.sync_controller, master, &self.seekable);
        let loader = match kind {
            LoaderKind::Main => &mut self.main_segment_loader,
            LoaderKind::Audio => &mut self.audio_segment_loader,
            LoaderKind::Subtitle => &mut self.subtitle_segment_loader,
        };
        f(loader, host, &mut ctx)
    }

    fn playlist_loader_mut(&mut self, kind: LoaderKind) -> Option<&mut PlaylistLoader> {
        match kind {
            LoaderKind::Main => Some(&mut self.main_playlist_loader),
            LoaderKind::Audio => self.audio.as_mut().map(|a| &mut a.loader),
            LoaderKind::Subtitle => self.subtitles.as_mut().map(|s| &mut s.loader),
        }
    }

    /// Timeout, in milliseconds, of segment requests for `media`. Requests on the lowest
    /// variant are never timed out, as there is nothing to switch to.
    fn segment_request_timeout<H: Host>(&self, host: &H, media: &Playlist) -> Option<f64> {
        let master = self.main_playlist_loader.master()?;
        if is_lowest_enabled_rendition(master, media, host.now()) {
            None
        } else {
            Some(media.target_duration * 1.5 * 1000.)
        }
    }

    /// Create the host's buffers for the current variant, once both are known.
    fn setup_source_buffers<H: Host>(&mut self, host: &mut H) {
        if host.ready_state() != MediaSourceReadyState::Open {
            return;
        }
        let (Some(master), Some(media)) = (
            self.main_playlist_loader.master(),
            self.main_playlist_loader.media().cloned(),
        ) else {
            return;
        };
        let mime_types = mime_types_for_playlist(master, &media);
        for (kind, mime_type) in [LoaderKind::Main, LoaderKind::Audio]
            .into_iter()
            .zip(mime_types.iter())
        {
            let result =
                self.with_segment_loader(host, kind, |l, h, ctx| l.set_mime_type(h, ctx, mime_type));
            if let Err(err) = result {
                self.fatal(host, err.into(), EndOfStreamError::Decode);
                return;
            }
        }
        self.exclude_incompatible_variants(&media);
    }

    /// Exclude forever the variants which could not be pushed to the buffers created for
    /// `media`: different number of codecs or different video codec.
    fn exclude_incompatible_variants(&mut self, media: &Playlist) {
        let Some(master) = self.main_playlist_loader.master() else {
            return;
        };
        let reference = declared_codecs(media);
        let is_incompatible = |p: &Playlist| {
            let codecs = declared_codecs(p);
            codecs.codec_count != reference.codec_count
                || codecs.video_codec != reference.video_codec
        };
        let any_new = master
            .playlists
            .iter()
            .any(|p| is_incompatible(p) && p.exclude_until != Some(ExcludeUntil::Forever));
        if !any_new {
            return;
        }
        let next = master.map_playlists(|p| {
            if is_incompatible(p) {
                tracing::warn!("MPC: excluding incompatible variant {}", p.uri);
                p.exclude_until = Some(ExcludeUntil::Forever);
            }
        });
        self.main_playlist_loader.replace_master(next);
    }

    /// Start playback the first time it is asked for, jumping to the live edge on live
    /// contents. Returns `true` if it did.
    fn setup_first_play<H: Host>(&mut self, host: &mut H) -> bool {
        let Some(media) = self.main_playlist_loader.media() else {
            return false;
        };
        if host.paused() || self.has_played {
            return false;
        }
        if !media.end_list {
            let Some(live_edge) = self.seekable.end(0) else {
                return false;
            };
            tracing::info!("MPC: starting live playback at {live_edge}");
            host.set_current_time(live_edge);
        }
        self.has_played = true;
        self.load(host);
        true
    }

    /// Exclude the variant with the given URI, or the current one, after an error and switch
    /// to another one. The last playable variant is reloaded instead.
    pub(crate) fn blacklist_current_playlist<H: Host>(
        &mut self,
        host: &mut H,
        playlist_uri: Option<&str>,
        blacklist_duration: Option<BlacklistDuration>,
        cause: PlayerError,
    ) {
        let now = host.now();
        let current = match playlist_uri {
            Some(uri) => self
                .main_playlist_loader
                .master()
                .and_then(|m| m.playlist(uri)),
            None => self.main_playlist_loader.media(),
        }
        .cloned();
        let (Some(master), Some(current)) = (self.main_playlist_loader.master(), current) else {
            self.fatal(host, cause, EndOfStreamError::Network);
            return;
        };

        let others_enabled = master
            .playlists
            .iter()
            .filter(|p| p.uri != current.uri && is_enabled(p, now))
            .count();
        if others_enabled == 0 {
            tracing::warn!(
                "MPC: problem with {} ({cause}), retrying since it is the last playable variant",
                current.uri
            );
            self.events.trigger(PlayerEvent::RetryPlaylist);
            self.main_playlist_loader.load(host, true);
            return;
        }

        let exclude_until = blacklist_duration
            .unwrap_or(BlacklistDuration::Seconds(self.config.blacklist_duration))
            .exclude_until(now);
        if let Some(next) = master.map_playlist(&current.uri, |p| {
            p.exclude_until = Some(exclude_until);
        }) {
            self.main_playlist_loader.replace_master(next);
        }
        self.events.trigger(PlayerEvent::BlacklistPlaylist {
            uri: current.uri.clone(),
            exclude_until,
        });
        self.events
            .trigger(PlayerEvent::Usage("hls-rendition-blacklisted"));

        let Some(next) = self.select_playlist(&*host) else {
            return;
        };
        tracing::warn!(
            "MPC: problem with {} ({cause}), switching to {}",
            current.uri,
            next.uri
        );
        if let Err(err) = self.main_playlist_loader.set_media(host, &next.uri) {
            tracing::error!("MPC: could not switch to {}: {err}", next.uri);
        }
    }

    /// Stop on an unrecoverable error.
    fn fatal<H: Host>(&mut self, host: &mut H, err: PlayerError, reason: EndOfStreamError) {
        tracing::error!("MPC: {err}");
        self.error = Some(err.clone());
        if host.ready_state() == MediaSourceReadyState::Open {
            host.end_of_stream(Some(reason));
        }
        self.events.trigger(PlayerEvent::Error(err));
    }

    /// Follow the main Media Playlist's duration, or the buffered end when it goes further.
    fn update_duration<H: Host>(&mut self, host: &mut H) {
        if host.ready_state() != MediaSourceReadyState::Open {
            return;
        }
        let Some(media) = self.main_playlist_loader.media() else {
            return;
        };
        let mut new_duration = duration(media, None, 0.);
        if let Some(buffered_end) = host.buffered().last_end() {
            new_duration = new_duration.max(buffered_end);
        }
        if host.duration() == new_duration {
            return;
        }
        tracing::debug!("MPC: updating duration to {new_duration}");
        host.set_duration(new_duration);
        self.events.trigger(PlayerEvent::DurationChange);
    }

    /// Recompute the seekable window from the main and alternate audio Media Playlists.
    fn update_seekable<H: Host>(&mut self, host: &mut H) {
        let duration = self.duration(&*host);
        let Some(main) = self
            .main_playlist_loader
            .media()
            .and_then(|m| seekable_for(&self.sync_controller, m, duration))
        else {
            return;
        };
        let audio = match self.audio.as_ref() {
            None => None,
            Some(rendition) => {
                match rendition
                    .loader
                    .media()
                    .and_then(|m| seekable_for(&self.sync_controller, m, duration))
                {
                    Some(audio) => Some(audio),
                    None => return,
                }
            }
        };
        let next = combine_seekable(&main, audio.as_ref());
        if next == self.seekable {
            return;
        }
        tracing::debug!("MPC: seekable updated to [{}]", printable_range(&next));
        self.seekable = next;
        self.events.trigger(PlayerEvent::SeekableChanged);
        let content = WatchedContent {
            seekable: &self.seekable,
            media: self.main_playlist_loader.media().map(|m| &**m),
        };
        self.playback_watcher.on_seekable_changed(host, content);
        self.setup_first_play(host);
    }

    /// Bring the timing information a segment loader found back into the playlist loader's
    /// version of the same playlist.
    fn persist_segment_timing(&mut self, kind: LoaderKind) {
        let source = match kind {
            LoaderKind::Main => self.main_segment_loader.playlist(),
            LoaderKind::Audio => self.audio_segment_loader.playlist(),
            LoaderKind::Subtitle => self.subtitle_segment_loader.playlist(),
        }
        .cloned();
        let Some(source) = source else {
            return;
        };
        let Some(loader) = self.playlist_loader_mut(kind) else {
            return;
        };
        let next = loader.master().and_then(|master| {
            master.map_playlist(&source.uri, |target| merge_segment_timing(target, &source))
        });
        if let Some(next) = next {
            loader.replace_master(next);
        }
    }
}

/// Copy into `target` the timing information `source`, another version of the same playlist,
/// has. Known information is never erased.
fn merge_segment_timing(target: &mut Playlist, source: &Playlist) {
    let offset = target.media_sequence as i64 - source.media_sequence as i64;
    let segments = std::mem::take(&mut target.segments);
    target.segments = update_segments(&source.segments, segments, offset);
    if source.sync_info.is_some() {
        target.sync_info = source.sync_info;
    }
}

fn seekable_for(sync: &SyncController, media: &Playlist, duration: f64) -> Option<TimeRanges> {
    let expired = sync.get_expired_time(media, duration)?;
    let ranges = seekable(media, Some(expired));
    (!ranges.is_empty()).then_some(ranges)
}

/// Seekable window when both the main and the alternate audio playlists are considered: their
/// intersection, or the main one when they do not overlap.
pub fn combine_seekable(main: &TimeRanges, audio: Option<&TimeRanges>) -> TimeRanges {
    let Some(audio) = audio else {
        return main.clone();
    };
    let (Some(main_start), Some(main_end), Some(audio_start), Some(audio_end)) =
        (main.start(0), main.end(0), audio.start(0), audio.end(0))
    else {
        return main.clone();
    };
    if audio_start > main_end || main_start > audio_end {
        return main.clone();
    }
    TimeRanges::single(main_start.max(audio_start), main_end.min(audio_end))
}

fn declared_codecs(playlist: &Playlist) -> CodecInfo {
    match playlist.attributes.codecs.as_deref() {
        Some(codecs) => parse_codecs(codecs),
        None => CodecInfo {
            codec_count: 2,
            ..CodecInfo::default()
        },
    }
}

/// Mime-types of the buffers needed to play `media`: the main one, then the alternate audio
/// one if audio comes from separate renditions.
pub fn mime_types_for_playlist(master: &MasterPlaylist, media: &Playlist) -> Vec<String> {
    let container = if media.segments.first().map_or(false, |s| s.map.is_some()) {
        "mp4"
    } else {
        "mp2t"
    };
    let mut codecs = match media.attributes.codecs.as_deref() {
        Some(codecs) => parse_codecs(codecs),
        None => default_codecs(),
    };
    let audio_group = media
        .attributes
        .audio
        .as_ref()
        .and_then(|id| master.media_groups.audio.get(id))
        .filter(|renditions| !renditions.is_empty());
    let has_alternate_audio = audio_group.is_some();
    let is_muxed = audio_group.map_or(false, |renditions| {
        renditions.iter().all(|r| r.resolved_uri.is_none())
    });

    if has_alternate_audio && codecs.audio_profile.is_none() {
        tracing::warn!(
            "MPC: alternate audio without an audio codec announced, assuming mp4a.40.2"
        );
        codecs.audio_profile = default_codecs().audio_profile;
    }

    let video = codecs.video_codec.as_ref().map(|codec| {
        format!(
            "{codec}{}",
            codecs.video_object_type_indicator.as_deref().unwrap_or("")
        )
    });
    let audio = codecs
        .audio_profile
        .as_ref()
        .map(|profile| format!("mp4a.40.{profile}"));
    let just_audio = make_mime_type("audio", container, &[audio.as_deref()]);
    let just_video = make_mime_type("video", container, &[video.as_deref()]);
    let both = make_mime_type("video", container, &[video.as_deref(), audio.as_deref()]);

    if has_alternate_audio {
        if !is_muxed && video.is_some() {
            return vec![just_video, just_audio];
        }
        return vec![both, just_audio];
    }
    if video.is_none() {
        return vec![just_audio];
    }
    vec![both]
}
