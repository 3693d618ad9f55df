use crate::{
    adaptive::{buffer_low_water_line, lowest_bitrate_compatible_variant_selector},
    error::{BlacklistDuration, PlaylistError, SegmentLoaderError},
    host::{EndOfStreamError, Host, LoaderKind, MediaSourceReadyState},
    playback_watcher::PlaybackWatcherEvent,
    playlist::{playlist_end, Playlist},
    playlist_loader::PlaylistLoaderEvent,
    segment_loader::SegmentLoaderEvent,
    sync_controller::SyncControllerEvent,
    utils::{
        event_target::{Event, Subscribable},
        time_ranges::SAFE_TIME_DELTA,
    },
};

use super::{MasterPlaylistController, PlayerEvent};

impl MasterPlaylistController {
    /// React to everything the owned components reported, until they have nothing left to say.
    pub(super) fn process_events<H: Host>(&mut self, host: &mut H) {
        loop {
            let mut handled_any = false;
            for event in self.main_playlist_loader.drain_events() {
                handled_any = true;
                self.on_main_playlist_event(host, event);
            }
            for kind in [LoaderKind::Audio, LoaderKind::Subtitle] {
                let events = self
                    .playlist_loader_mut(kind)
                    .map(|loader| loader.drain_events())
                    .unwrap_or_default();
                for event in events {
                    handled_any = true;
                    self.on_group_playlist_event(host, kind, event);
                }
            }
            for kind in [LoaderKind::Main, LoaderKind::Audio, LoaderKind::Subtitle] {
                let events = match kind {
                    LoaderKind::Main => self.main_segment_loader.drain_events(),
                    LoaderKind::Audio => self.audio_segment_loader.drain_events(),
                    LoaderKind::Subtitle => self.subtitle_segment_loader.drain_events(),
                };
                for event in events {
                    handled_any = true;
                    match kind {
                        LoaderKind::Main => self.on_main_segment_event(host, event),
                        kind => self.on_group_segment_event(host, kind, event),
                    }
                }
            }
            for event in self.sync_controller.drain_events() {
                handled_any = true;
                match event {
                    SyncControllerEvent::SyncInfoUpdate => self.update_seekable(host),
                    SyncControllerEvent::TimestampOffset => {
                        self.subtitle_segment_loader.on_timestamp_offset(host)
                    }
                }
            }
            for event in self.playback_watcher.drain_events() {
                handled_any = true;
                self.on_watcher_event(event);
            }
            if !handled_any || self.disposed {
                break;
            }
        }
    }

    fn on_main_playlist_event<H: Host>(&mut self, host: &mut H, event: PlaylistLoaderEvent) {
        match event {
            PlaylistLoaderEvent::LoadedPlaylist => self.on_main_loaded_playlist(host),
            PlaylistLoaderEvent::LoadedMetadata => self.on_main_loaded_metadata(host),
            PlaylistLoaderEvent::MediaChanging => self.main_segment_loader.abort(host),
            PlaylistLoaderEvent::MediaChange => self.on_main_media_change(host),
            PlaylistLoaderEvent::PlaylistUnchanged => self.on_main_playlist_unchanged(host),
            PlaylistLoaderEvent::Error(err) => {
                if self.main_playlist_loader.master().is_none() {
                    self.fatal(host, err.into(), EndOfStreamError::Network);
                    return;
                }
                let uri = err.playlist_uri.clone();
                let duration = err.blacklist_duration;
                self.blacklist_current_playlist(host, uri.as_deref(), duration, err.into());
            }
        }
    }

    fn on_main_loaded_playlist<H: Host>(&mut self, host: &mut H) {
        let Some(media) = self.main_playlist_loader.media().cloned() else {
            self.select_initial_media(host);
            return;
        };
        self.unchanged_refreshes = 0;
        if self.config.use_cue_tags {
            let offset = self.seekable.start(0).unwrap_or(0.);
            self.ad_cues.update(host, &media, offset);
        }
        let timeout = self.segment_request_timeout(&*host, &media);
        self.with_segment_loader(host, LoaderKind::Main, |l, h, ctx| {
            l.set_playlist(h, ctx, media, timeout)
        });
        self.update_duration(host);
        if !host.paused() {
            self.with_segment_loader(host, LoaderKind::Main, |l, h, ctx| l.load(h, ctx));
        }
        self.events.trigger(PlayerEvent::LoadedPlaylist);
    }

    fn select_initial_media<H: Host>(&mut self, host: &mut H) {
        let now = host.now();
        let lowest = if self.config.enable_low_initial_playlist {
            self.main_playlist_loader
                .master()
                .and_then(|m| lowest_bitrate_compatible_variant_selector(m, now))
                .cloned()
        } else {
            None
        };
        if let Some(selected) = lowest.or_else(|| self.select_playlist(&*host)) {
            tracing::info!("MPC: initial variant {}", selected.uri);
            if let Err(err) = self.main_playlist_loader.set_media(host, &selected.uri) {
                tracing::warn!("MPC: could not select initial variant: {err}");
            }
        }
        self.main_playlist_loader.select_default_media(host);
    }

    fn on_main_loaded_metadata<H: Host>(&mut self, host: &mut H) {
        let Some(media) = self.main_playlist_loader.media().cloned() else {
            return;
        };
        if media.end_list && !host.preload_none() {
            self.with_segment_loader(host, LoaderKind::Main, |l, h, ctx| l.load(h, ctx));
        }
        self.setup_media_groups(host);
        self.setup_source_buffers(host);
        self.setup_first_play(host);
        self.events.trigger(PlayerEvent::LoadedMetadata);
        self.events.trigger(PlayerEvent::SelectedInitialMedia);
    }

    fn on_main_media_change<H: Host>(&mut self, host: &mut H) {
        let Some(media) = self.main_playlist_loader.media().cloned() else {
            return;
        };
        tracing::info!("MPC: now playing {}", media.uri);
        let timeout = self.segment_request_timeout(&*host, &media);
        self.with_segment_loader(host, LoaderKind::Main, |l, h, ctx| {
            l.set_playlist(h, ctx, media, timeout)
        });
        self.setup_media_groups(host);
        self.with_segment_loader(host, LoaderKind::Main, |l, h, ctx| l.load(h, ctx));
        self.events.trigger(PlayerEvent::MediaChange);
    }

    fn on_main_playlist_unchanged<H: Host>(&mut self, host: &mut H) {
        self.unchanged_refreshes += 1;
        let Some(media) = self.main_playlist_loader.media().cloned() else {
            return;
        };
        if self.unchanged_refreshes < self.config.playlist_stuck_threshold
            || !self.stuck_at_playlist_end(&*host, &media)
        {
            return;
        }
        self.unchanged_refreshes = 0;
        let cause = PlaylistError {
            playlist_uri: Some(media.uri.clone()),
            status: None,
            message: "Playlist no longer updating.".into(),
            server_fault: false,
            blacklist_duration: None,
        };
        self.blacklist_current_playlist(host, Some(&media.uri), None, cause.into());
        self.events.trigger(PlayerEvent::PlaylistStuck);
    }

    /// `true` if playback reached the end of `media` and there is nothing more to load.
    fn stuck_at_playlist_end<H: Host>(&self, host: &H, media: &Playlist) -> bool {
        if self.seekable.is_empty() {
            return false;
        }
        let Some(expired) = self
            .sync_controller
            .get_expired_time(media, self.duration(host))
        else {
            return false;
        };
        let Some(end) = playlist_end(media, Some(expired), false) else {
            return false;
        };
        let current_time = host.current_time();
        match host.buffered().last_end() {
            None => end - current_time <= SAFE_TIME_DELTA,
            Some(buffered_end) => {
                buffered_end - current_time <= SAFE_TIME_DELTA
                    && end - buffered_end <= SAFE_TIME_DELTA
            }
        }
    }

    fn on_main_segment_event<H: Host>(&mut self, host: &mut H, event: SegmentLoaderEvent) {
        match event {
            SegmentLoaderEvent::Progress => self.events.trigger(PlayerEvent::Progress),
            SegmentLoaderEvent::SyncInfoUpdate => {
                self.persist_segment_timing(LoaderKind::Main);
                self.update_seekable(host);
            }
            SegmentLoaderEvent::BandwidthUpdate => self.on_bandwidth_update(host),
            SegmentLoaderEvent::Error(err) => {
                let duration = err.blacklist_duration;
                self.blacklist_current_playlist(host, None, duration, err.into());
            }
            SegmentLoaderEvent::Ended => self.on_end_of_stream(host),
            SegmentLoaderEvent::EarlyAbort => {
                let duration = BlacklistDuration::Seconds(self.config.abort_early_blacklist_duration);
                let cause = SegmentLoaderError {
                    message: "Aborted early because there isn't enough bandwidth to complete \
                              the request without rebuffering."
                        .into(),
                    status: None,
                    blacklist_duration: Some(duration),
                };
                self.blacklist_current_playlist(host, None, Some(duration), cause.into());
            }
            SegmentLoaderEvent::TimestampOffset => {
                self.events.trigger(PlayerEvent::Usage("hls-timestamp-offset"))
            }
            SegmentLoaderEvent::ResetEverything => self.events.trigger(PlayerEvent::Reset),
        }
    }

    /// Switch variant after a new bandwidth measure, if it is worth it.
    fn on_bandwidth_update<H: Host>(&mut self, host: &mut H) {
        let next = self.select_playlist(&*host);
        let current = self.main_playlist_loader.media().cloned();
        if let (Some(next), Some(current)) = (next, current) {
            if self.should_switch_to_media(&*host, &current, &next) {
                tracing::info!("MPC: switching from {} to {}", current.uri, next.uri);
                if let Err(err) = self.main_playlist_loader.set_media(host, &next.uri) {
                    tracing::warn!("MPC: could not switch to {}: {err}", next.uri);
                }
            }
        }
        self.events.trigger(PlayerEvent::BandwidthUpdate);
    }

    fn should_switch_to_media<H: Host>(&self, host: &H, current: &Playlist, next: &Playlist) -> bool {
        if current.uri == next.uri {
            return false;
        }
        // live contents have no buffer to protect
        if !current.end_list {
            return true;
        }
        if self.duration(host) < self.config.max_buffer_low_water_line {
            return true;
        }
        let next_bandwidth = next.attributes.bandwidth.unwrap_or(0);
        let current_bandwidth = current.attributes.bandwidth.unwrap_or(0);
        if next_bandwidth < current_bandwidth {
            return true;
        }
        let current_time = host.current_time();
        let forward_buffer = host
            .buffered()
            .last_end()
            .map_or(0., |end| end - current_time);
        forward_buffer >= buffer_low_water_line(&self.config, current_time)
    }

    /// End the stream once every active segment loader pushed its last segment.
    pub(super) fn on_end_of_stream<H: Host>(&mut self, host: &mut H) {
        let audio_ended = self.audio.is_none() || self.audio_segment_loader.is_ended();
        if !self.main_segment_loader.is_ended() || !audio_ended {
            return;
        }
        if host.ready_state() == MediaSourceReadyState::Open {
            tracing::info!("MPC: ending the stream");
            host.end_of_stream(None);
        }
    }

    fn on_group_playlist_event<H: Host>(
        &mut self,
        host: &mut H,
        kind: LoaderKind,
        event: PlaylistLoaderEvent,
    ) {
        match event {
            PlaylistLoaderEvent::LoadedPlaylist | PlaylistLoaderEvent::MediaChange => {
                self.on_group_playlist_loaded(host, kind)
            }
            PlaylistLoaderEvent::MediaChanging => match kind {
                LoaderKind::Audio => self.audio_segment_loader.abort(host),
                _ => self.subtitle_segment_loader.abort(host),
            },
            PlaylistLoaderEvent::Error(err) => {
                tracing::warn!("MPC: {kind} playlist error: {err}");
                self.on_media_group_error(host, kind);
            }
            PlaylistLoaderEvent::LoadedMetadata | PlaylistLoaderEvent::PlaylistUnchanged => {}
        }
    }

    fn on_group_playlist_loaded<H: Host>(&mut self, host: &mut H, kind: LoaderKind) {
        let Some(media) = self
            .playlist_loader_mut(kind)
            .and_then(|loader| loader.media().cloned())
        else {
            return;
        };
        // alternate renditions follow the main content's timeout
        let timeout = self
            .main_playlist_loader
            .media()
            .cloned()
            .and_then(|main| self.segment_request_timeout(&*host, &main));
        let should_load = !host.paused() || (media.end_list && !host.preload_none());
        self.with_segment_loader(host, kind, |l, h, ctx| {
            l.set_playlist(h, ctx, media, timeout);
            if should_load {
                l.load(h, ctx);
            }
        });
    }

    fn on_group_segment_event<H: Host>(
        &mut self,
        host: &mut H,
        kind: LoaderKind,
        event: SegmentLoaderEvent,
    ) {
        match event {
            SegmentLoaderEvent::SyncInfoUpdate => {
                self.persist_segment_timing(kind);
                self.update_seekable(host);
            }
            SegmentLoaderEvent::Error(err) => {
                tracing::warn!("MPC: {kind} segment error: {err}");
                self.on_media_group_error(host, kind);
            }
            SegmentLoaderEvent::Ended if kind == LoaderKind::Audio => self.on_end_of_stream(host),
            _ => {}
        }
    }

    fn on_watcher_event(&mut self, event: PlaybackWatcherEvent) {
        self.events.trigger(PlayerEvent::Usage(event.name()));
    }
}

