//! Fetches the segments of one Media Playlist and pushes them to the host's buffers.

mod segment_info;
mod source_updater;

pub use segment_info::{generate_segment_info, SegmentInfo};
pub use source_updater::{AppendKind, SourceOperation, SourceUpdater};

use std::{collections::HashMap, rc::Rc};

use bytes::Bytes;

use crate::{
    adaptive::{min_rebuffer_max_bandwidth_selector, RebufferSelectorParams},
    config::Config,
    decrypter::segment_iv,
    error::{BlacklistDuration, RequestErrorKind, SegmentLoaderError, SourceBufferError},
    host::{
        Cue, CuePayload, DecryptedMessage, Host, LoaderKind, MediaSourceReadyState, RequestId,
        RequestOutcome, SegmentProbe, TextTrackKind, TimerId, TimerReason,
    },
    media_segment_request::{
        KeyRequest, KeySource, MediaSegmentRequest, RequestProgress, RequestStats,
        ResourceRequest, SegmentData, SegmentRequestParams,
    },
    playlist::{
        estimate_segment_request_time, get_media_info_for_time, MasterPlaylist, Playlist,
        SyncInfo,
    },
    sync_controller::{ProbedSegment, SyncController, SyncPoint},
    utils::{
        event_target::{forward_subscribable, Event, EventTarget, Subscribable},
        time_ranges::{time_until_rebuffer, TimeRanges, TIME_FUDGE_FACTOR},
    },
};

/// Everything a `SegmentLoader` reads from its owner when deciding what to load.
pub struct LoaderContext<'a> {
    pub sync: &'a mut SyncController,
    /// Current Multivariant Playlist, used to look for a better variant on early aborts.
    pub master: Option<&'a MasterPlaylist>,
    pub seekable: &'a TimeRanges,
    /// Duration of the content, `f64::INFINITY` for live contents.
    pub duration: f64,
    /// `true` once playback started at least once.
    pub has_played: bool,
    /// Forward buffer, in seconds, to maintain.
    pub goal_buffer_length: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentLoaderState {
    /// Waiting for a playlist, a mime-type and a first `load` call.
    Init,
    Ready,
    /// Waiting on a segment's requests.
    Waiting,
    /// Waiting on the host to push a segment.
    Appending,
    /// Subtitles only: waiting for the presentation time of the segment's timeline.
    WaitingOnTimeline,
    Disposed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SegmentLoaderEvent {
    /// A segment has been pushed, or a request progressed.
    Progress,
    /// Timing information of the playlist changed.
    SyncInfoUpdate,
    /// A new bandwidth measure is available.
    BandwidthUpdate,
    Error(SegmentLoaderError),
    /// The last segment of the content has been pushed.
    Ended,
    /// A request was aborted because a lower variant would prevent rebuffering.
    EarlyAbort,
    /// A new timestamp offset has been set on the buffer.
    TimestampOffset,
    /// Every buffered data was removed.
    ResetEverything,
}

impl Event for SegmentLoaderEvent {
    fn name(&self) -> &'static str {
        match self {
            SegmentLoaderEvent::Progress => "progress",
            SegmentLoaderEvent::SyncInfoUpdate => "syncinfoupdate",
            SegmentLoaderEvent::BandwidthUpdate => "bandwidthupdate",
            SegmentLoaderEvent::Error(_) => "error",
            SegmentLoaderEvent::Ended => "ended",
            SegmentLoaderEvent::EarlyAbort => "earlyabort",
            SegmentLoaderEvent::TimestampOffset => "timestampoffset",
            SegmentLoaderEvent::ResetEverything => "reseteverything",
        }
    }
}

/// Tracks found in the first segment pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartingMedia {
    pub contains_audio: bool,
    pub contains_video: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SegmentLoaderStats {
    pub media_bytes_transferred: u64,
    pub media_requests: u32,
    pub media_requests_aborted: u32,
    pub media_requests_timedout: u32,
    pub media_requests_errored: u32,
    /// Milliseconds spent on media requests.
    pub media_transfer_duration: f64,
    pub media_seconds_loaded: f64,
}

/// Cumulative moving average of the rate at which segments went from loaded to pushed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Throughput {
    rate: f64,
    count: u32,
}

struct PendingSegment {
    info: SegmentInfo,
    request: MediaSegmentRequest,
}

/// Returns why switching from `starting_media` to a segment with `new_media` cannot be done
/// on the same buffer, if it cannot.
pub fn illegal_media_switch(
    kind: LoaderKind,
    starting_media: Option<StartingMedia>,
    new_media: Option<&SegmentProbe>,
) -> Option<&'static str> {
    if kind != LoaderKind::Main {
        return None;
    }
    let (starting, new) = (starting_media?, new_media?);
    if !new.contains_audio && !new.contains_video {
        return Some("Neither audio nor video found in segment.");
    }
    if starting.contains_video && !new.contains_video {
        return Some(
            "Only audio found in segment when we expected video. \
             We can't switch to audio only from a stream that had video.",
        );
    }
    if !starting.contains_video && new.contains_video {
        return Some(
            "Video found in segment when we expected only audio. \
             We can't switch to a stream with video from an audio only stream.",
        );
    }
    None
}

/// Time before which buffered data can be removed without risk.
///
/// That is the start of the seekable window when inside it, or `back_buffer_length` seconds
/// before `current_time`, but never closer than one target duration from `current_time`.
pub fn safe_back_buffer_trim_time(
    seekable: &TimeRanges,
    current_time: f64,
    target_duration: f64,
    back_buffer_length: f64,
) -> f64 {
    let remove_to = match seekable.start(0) {
        Some(start) if start > 0. && start < current_time => start,
        _ => current_time - back_buffer_length,
    };
    remove_to.min(current_time - target_duration)
}

/// Loads segments of a Media Playlist until the goal buffer is reached, then keeps the
/// buffer filled as playback goes on.
///
/// The loop runs on a `TimerReason::BufferCheck` timer. Each tick, if nothing is loading,
/// the next segment to load is chosen from the last pushed one or, when starting or after a
/// reset, from a sync point given by the `SyncController`.
pub struct SegmentLoader {
    kind: LoaderKind,
    state: SegmentLoaderState,
    playlist: Option<Rc<Playlist>>,
    mime_type: Option<String>,
    source_updater: Option<SourceUpdater>,

    /// Time ranges of the subtitles given to the host.
    text_buffered: TimeRanges,

    /// Index of the last segment pushed, relative to the current playlist.
    media_index: Option<i64>,
    sync_point: Option<SyncPoint>,
    current_timeline: Option<u64>,
    /// Look for the next segment at the end of the buffer instead of at the current time.
    fetch_at_buffer: bool,
    pending: Option<PendingSegment>,
    check_buffer_timer: Option<TimerId>,

    /// Initialization segments already loaded, by identity.
    init_segments: HashMap<String, Bytes>,
    key_cache: HashMap<String, [u8; 16]>,
    active_init_segment_id: Option<String>,
    starting_media: Option<StartingMedia>,

    ended: bool,
    error: Option<SegmentLoaderError>,
    bandwidth: f64,
    round_trip: f64,
    throughput: Throughput,
    stats: SegmentLoaderStats,
    next_request_id: u64,

    request_timeout: Option<f64>,
    buffer_check_interval: f64,
    back_buffer_length: f64,
    bandwidth_variance: f64,
    cache_encryption_keys: bool,
    with_credentials: bool,

    events: EventTarget<SegmentLoaderEvent>,
}

forward_subscribable!(SegmentLoader, SegmentLoaderEvent, events);

impl SegmentLoader {
    pub fn new(kind: LoaderKind, config: &Config) -> Self {
        let id_base = match kind {
            LoaderKind::Main => 1,
            LoaderKind::Audio => 2,
            LoaderKind::Subtitle => 3,
        };
        Self {
            kind,
            state: SegmentLoaderState::Init,
            playlist: None,
            mime_type: None,
            source_updater: None,
            text_buffered: TimeRanges::new(),
            media_index: None,
            sync_point: None,
            current_timeline: None,
            fetch_at_buffer: false,
            pending: None,
            check_buffer_timer: None,
            init_segments: HashMap::new(),
            key_cache: HashMap::new(),
            active_init_segment_id: None,
            starting_media: None,
            ended: false,
            error: None,
            bandwidth: config.initial_bandwidth,
            round_trip: f64::NAN,
            throughput: Throughput::default(),
            stats: SegmentLoaderStats::default(),
            next_request_id: id_base << 40,
            request_timeout: None,
            buffer_check_interval: config.buffer_check_interval,
            back_buffer_length: config.back_buffer_length,
            bandwidth_variance: config.bandwidth_variance,
            cache_encryption_keys: config.cache_encryption_keys,
            with_credentials: config.with_credentials,
            events: EventTarget::queued(),
        }
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn state(&self) -> SegmentLoaderState {
        self.state
    }

    /// The loader's version of its playlist, with the timing information it gathered.
    pub fn playlist(&self) -> Option<&Rc<Playlist>> {
        self.playlist.as_ref()
    }

    pub fn media_index(&self) -> Option<i64> {
        self.media_index
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Last measured bandwidth, in bits per second.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Duration, in milliseconds, of the last segment request.
    pub fn round_trip(&self) -> f64 {
        self.round_trip
    }

    /// Average rate, in bits per second, at which loaded segments were pushed.
    pub fn throughput(&self) -> f64 {
        self.throughput.rate
    }

    pub fn stats(&self) -> &SegmentLoaderStats {
        &self.stats
    }

    pub fn error(&self) -> Option<&SegmentLoaderError> {
        self.error.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// `true` when the buffer check loop is not running.
    pub fn paused(&self) -> bool {
        self.check_buffer_timer.is_none()
    }

    pub fn drain_events(&mut self) -> Vec<SegmentLoaderEvent> {
        self.events.drain()
    }

    /// Ranges of time buffered for that loader's track.
    pub fn buffered<H: Host>(&self, host: &H) -> TimeRanges {
        match self.kind {
            LoaderKind::Subtitle => self.text_buffered.clone(),
            kind => host.source_buffered(kind),
        }
    }

    /// Install or update the playlist to load segments from.
    ///
    /// `request_timeout` is the timeout, in milliseconds, of segment requests.
    pub fn set_playlist<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &mut LoaderContext<'_>,
        playlist: Rc<Playlist>,
        request_timeout: Option<f64>,
    ) {
        self.request_timeout = request_timeout;
        let old = self.playlist.replace(playlist);
        let Some(current) = self.playlist.as_mut() else {
            return;
        };

        // Until playback starts, the start of a live playlist is the zero-time.
        if !ctx.has_played && !current.end_list {
            let media_sequence = current.media_sequence;
            Rc::make_mut(current).sync_info = Some(SyncInfo {
                media_sequence,
                time: 0.,
            });
        }

        let same_uri = old.as_ref().map_or(false, |old| old.uri == current.uri);
        if let Some(old) = old.as_ref().filter(|_| same_uri) {
            let diff = current.media_sequence as i64 - old.media_sequence as i64;
            if diff != 0 {
                tracing::debug!("SL({}): media sequence moved by {diff}", self.kind);
            }
            if let Some(idx) = self.media_index.as_mut() {
                *idx -= diff;
            }
            if let Some(pending) = self.pending.as_mut() {
                pending.info.media_index -= diff;
            }
            ctx.sync
                .save_expired_segment_info(old, Rc::make_mut(current));
        }
        self.events.trigger(SegmentLoaderEvent::SyncInfoUpdate);

        if self.state == SegmentLoaderState::Init && self.could_begin_loading() {
            self.init(host, ctx);
            return;
        }
        if !same_uri && self.media_index.is_some() {
            self.resync_loader(host);
        }
    }

    /// Create the host buffer this loader pushes to.
    pub fn set_mime_type<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &mut LoaderContext<'_>,
        mime_type: &str,
    ) -> Result<(), SourceBufferError> {
        if self.mime_type.is_some() {
            return Ok(());
        }
        if self.kind != LoaderKind::Subtitle {
            self.source_updater = Some(SourceUpdater::new(host, self.kind, mime_type)?);
        }
        self.mime_type = Some(mime_type.to_owned());
        if self.state == SegmentLoaderState::Init && self.could_begin_loading() {
            self.init(host, ctx);
        }
        Ok(())
    }

    /// Start, or resume, loading segments.
    pub fn load<H: Host>(&mut self, host: &mut H, ctx: &mut LoaderContext<'_>) {
        self.monitor_buffer(host);
        if self.playlist.is_none() {
            return;
        }
        if self.state == SegmentLoaderState::Init && self.could_begin_loading() {
            self.init(host, ctx);
            return;
        }
        if !self.could_begin_loading()
            || !matches!(
                self.state,
                SegmentLoaderState::Ready | SegmentLoaderState::Init
            )
        {
            return;
        }
        self.state = SegmentLoaderState::Ready;
    }

    /// Stop the buffer check loop. A segment being loaded is still pushed.
    pub fn pause<H: Host>(&mut self, host: &mut H) {
        if let Some(id) = self.check_buffer_timer.take() {
            host.clear_timer(id);
        }
    }

    /// Abort the segment being loaded, if it is still being requested.
    pub fn abort<H: Host>(&mut self, host: &mut H) {
        if self.state != SegmentLoaderState::Waiting {
            self.pending = None;
            return;
        }
        if let Some(mut pending) = self.pending.take() {
            tracing::debug!("SL({}): aborting {}", self.kind, pending.info);
            pending.request.abort();
            self.stats.media_requests += 1;
            self.stats.media_requests_aborted += 1;
        }
        self.state = SegmentLoaderState::Ready;
        if !self.paused() {
            self.monitor_buffer(host);
        }
    }

    /// Forget the position in the playlist, keeping the buffer. Used on variant switches.
    pub fn resync_loader<H: Host>(&mut self, host: &mut H) {
        self.media_index = None;
        self.sync_point = None;
        self.abort(host);
    }

    /// Like `resync_loader`, the next segment being then chosen from the current time.
    pub fn reset_loader<H: Host>(&mut self, host: &mut H) {
        self.fetch_at_buffer = false;
        self.resync_loader(host);
    }

    /// Remove everything buffered and restart from the current time.
    pub fn reset_everything<H: Host>(&mut self, host: &mut H, duration: f64) {
        tracing::info!("SL({}): resetting everything", self.kind);
        self.ended = false;
        self.reset_loader(host);
        self.remove(host, 0., duration);
        self.events.trigger(SegmentLoaderEvent::ResetEverything);
    }

    /// Remove buffered data, and the cues describing it, between `start` and `end`.
    pub fn remove<H: Host>(&mut self, host: &mut H, start: f64, end: f64) {
        let end = if end == f64::INFINITY && host.duration().is_finite() {
            host.duration()
        } else {
            end
        };
        match self.kind {
            LoaderKind::Subtitle => {
                self.text_buffered.remove(start, end);
                host.remove_cues(TextTrackKind::Subtitles, start, end);
            }
            LoaderKind::Main => {
                if let Some(updater) = self.source_updater.as_mut() {
                    updater.remove(host, start, end);
                }
                host.remove_cues(TextTrackKind::SegmentMetadata, start, end);
            }
            LoaderKind::Audio => {
                if let Some(updater) = self.source_updater.as_mut() {
                    updater.remove(host, start, end);
                }
            }
        }
    }

    /// Stop everything. The loader cannot be used anymore.
    pub fn dispose<H: Host>(&mut self, host: &mut H) {
        self.state = SegmentLoaderState::Disposed;
        self.pause(host);
        if let Some(mut pending) = self.pending.take() {
            pending.request.abort();
        }
        if let Some(updater) = self.source_updater.as_mut() {
            updater.clear_queue();
        }
        self.events.clear();
    }

    /// To call when a timer fires. Returns `false` if the timer is not this loader's.
    pub fn on_timer<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &mut LoaderContext<'_>,
        id: TimerId,
        reason: TimerReason,
    ) -> bool {
        if reason != TimerReason::BufferCheck(self.kind) || self.check_buffer_timer != Some(id) {
            return false;
        }
        if self.state == SegmentLoaderState::Ready {
            self.fill_buffer(host, ctx);
        }
        // paused or re-armed meanwhile otherwise
        if self.check_buffer_timer == Some(id) {
            self.check_buffer_timer = Some(host.set_timer(self.buffer_check_interval, reason));
        }
        true
    }

    /// To call when the subtitles' timeline may now be known.
    pub fn on_timestamp_offset<H: Host>(&mut self, host: &mut H) {
        if self.state != SegmentLoaderState::WaitingOnTimeline {
            return;
        }
        self.state = SegmentLoaderState::Ready;
        if !self.paused() {
            self.monitor_buffer(host);
        }
    }

    /// To call on a media request's progress. Returns `false` if the request is not this
    /// loader's.
    pub fn on_request_progress<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &LoaderContext<'_>,
        id: RequestId,
        bytes_loaded: u64,
    ) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        let Some(stats) = pending.request.on_request_progress(&*host, id, bytes_loaded).copied()
        else {
            return false;
        };
        if !self.abort_request_early(host, ctx, &stats) {
            self.events.trigger(SegmentLoaderEvent::Progress);
        }
        true
    }

    /// To call when a request ends. Returns `false` if the request is not this loader's.
    pub fn on_request_finished<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &mut LoaderContext<'_>,
        id: RequestId,
        outcome: RequestOutcome,
    ) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        if !pending.request.owns(id) {
            return false;
        }
        let progress = pending.request.on_request_finished(host, id, outcome);
        self.on_segment_progress(host, ctx, progress);
        true
    }

    /// To call with the decryption worker's replies. Returns `false` if the message is not
    /// for this loader.
    pub fn on_decrypted<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &mut LoaderContext<'_>,
        message: DecryptedMessage,
    ) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        if pending.info.request_id != message.source {
            return false;
        }
        let progress = pending.request.on_decrypted(message);
        self.on_segment_progress(host, ctx, progress);
        true
    }

    /// To call when the host finished an operation on this loader's buffer.
    pub fn on_source_buffer_update<H: Host>(&mut self, host: &mut H, ctx: &mut LoaderContext<'_>) {
        let Some(updater) = self.source_updater.as_mut() else {
            return;
        };
        match updater.on_update_end(host) {
            Some(SourceOperation::Append(AppendKind::Init(id))) => {
                self.active_init_segment_id = Some(id);
            }
            Some(SourceOperation::Append(AppendKind::Media)) => self.handle_update_end(host, ctx),
            Some(SourceOperation::Remove { .. }) | None => {}
        }
    }

    fn could_begin_loading(&self) -> bool {
        self.playlist.is_some()
            && (self.source_updater.is_some() || self.kind == LoaderKind::Subtitle)
            && !self.paused()
    }

    fn init<H: Host>(&mut self, host: &mut H, ctx: &mut LoaderContext<'_>) {
        tracing::info!("SL({}): starting", self.kind);
        self.state = SegmentLoaderState::Ready;
        self.reset_everything(host, ctx.duration);
        self.monitor_buffer(host);
    }

    fn monitor_buffer<H: Host>(&mut self, host: &mut H) {
        if let Some(id) = self.check_buffer_timer.take() {
            host.clear_timer(id);
        }
        self.check_buffer_timer = Some(host.set_timer(1., TimerReason::BufferCheck(self.kind)));
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn fill_buffer<H: Host>(&mut self, host: &mut H, ctx: &mut LoaderContext<'_>) {
        if self
            .source_updater
            .as_ref()
            .map_or(false, SourceUpdater::updating)
        {
            return;
        }
        let Some(playlist) = self.playlist.clone() else {
            return;
        };
        let current_time = host.current_time();
        if self.sync_point.is_none() {
            self.sync_point = ctx.sync.get_sync_point(
                &playlist,
                ctx.duration,
                self.current_timeline,
                current_time,
            );
            if self.sync_point.is_none() && self.kind == LoaderKind::Subtitle {
                self.sync_point = Some(SyncPoint {
                    time: ctx.seekable.start(0).unwrap_or(0.),
                    segment_index: 0,
                });
            }
        }

        let buffered = self.buffered(&*host);
        let Some(mut info) = self.check_buffer(&buffered, &playlist, ctx, current_time) else {
            if !self.ended && self.is_end_of_stream(&*host, self.media_index) {
                self.end_of_stream(host);
            }
            return;
        };

        if info.media_index + 1 == playlist.segments.len() as i64
            && host.ready_state() == MediaSourceReadyState::Ended
            && !host.seeking()
        {
            return;
        }

        if let Some(updater) = self.source_updater.as_ref() {
            let before_offset = info
                .start_of_segment
                .map_or(false, |start| start < updater.timestamp_offset());
            if self.current_timeline != Some(info.timeline) || before_offset {
                info.timestamp_offset = info.start_of_segment;
            }
        }

        if self.kind == LoaderKind::Subtitle
            && ctx.sync.timestamp_offset_for_timeline(info.timeline).is_none()
        {
            tracing::debug!(
                "SL({}): waiting for timeline {} to be known",
                self.kind,
                info.timeline
            );
            self.state = SegmentLoaderState::WaitingOnTimeline;
            return;
        }

        self.load_segment(host, ctx, info, &playlist);
    }

    /// Choose the next segment to load, if one should be loaded.
    fn check_buffer(
        &mut self,
        buffered: &TimeRanges,
        playlist: &Playlist,
        ctx: &LoaderContext<'_>,
        current_time: f64,
    ) -> Option<SegmentInfo> {
        let last_buffered_end = buffered.last_end().unwrap_or(0.);
        let buffered_time = (last_buffered_end - current_time).max(0.);
        if playlist.segments.is_empty() || buffered_time >= ctx.goal_buffer_length {
            return None;
        }
        // one segment is enough until playback starts
        if !ctx.has_played && buffered_time >= 1. {
            return None;
        }

        let request_id = self.next_request_id();
        let Some(sync_point) = self.sync_point else {
            let index = self.sync_segment_candidate(playlist);
            return generate_segment_info(request_id, playlist, index, None, true);
        };

        if let Some(media_index) = self.media_index.filter(|i| *i + 1 >= 0) {
            let start_of_segment = usize::try_from(media_index)
                .ok()
                .and_then(|i| playlist.segments.get(i))
                .and_then(|s| s.end)
                .unwrap_or(last_buffered_end);
            return generate_segment_info(
                request_id,
                playlist,
                media_index + 1,
                Some(start_of_segment),
                false,
            );
        }

        let time = if self.fetch_at_buffer {
            last_buffered_end
        } else {
            current_time
        };
        let info = get_media_info_for_time(playlist, time, sync_point.segment_index, sync_point.time);
        generate_segment_info(
            request_id,
            playlist,
            info.media_index as i64,
            Some(info.start_time),
            false,
        )
    }

    /// Segment to load only to obtain timing information: the second segment of the current
    /// timeline, or its first one, or the last segment of the playlist.
    fn sync_segment_candidate(&self, playlist: &Playlist) -> i64 {
        let Some(timeline) = self.current_timeline else {
            return 0;
        };
        let same_timeline: Vec<usize> = playlist
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.timeline == timeline)
            .map(|(i, _)| i)
            .collect();
        match same_timeline.get(1).or(same_timeline.first()) {
            Some(i) => *i as i64,
            None => playlist.segments.len().saturating_sub(1) as i64,
        }
    }

    fn is_end_of_stream<H: Host>(&self, host: &H, appended_index: Option<i64>) -> bool {
        let (Some(playlist), Some(index)) = (self.playlist.as_ref(), appended_index) else {
            return false;
        };
        playlist.end_list
            && host.ready_state() == MediaSourceReadyState::Open
            && index + 1 == playlist.segments.len() as i64
    }

    fn end_of_stream<H: Host>(&mut self, host: &mut H) {
        tracing::info!("SL({}): last segment pushed", self.kind);
        self.state = SegmentLoaderState::Ready;
        self.pause(host);
        self.ended = true;
        self.events.trigger(SegmentLoaderEvent::Ended);
    }

    fn trim_back_buffer<H: Host>(&mut self, host: &mut H, ctx: &LoaderContext<'_>, playlist: &Playlist) {
        let target_duration = if playlist.target_duration > 0. {
            playlist.target_duration
        } else {
            10.
        };
        let remove_to = safe_back_buffer_trim_time(
            ctx.seekable,
            host.current_time(),
            target_duration,
            self.back_buffer_length,
        );
        if remove_to > 0. {
            self.remove(host, 0., remove_to);
        }
    }

    fn load_segment<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &LoaderContext<'_>,
        info: SegmentInfo,
        playlist: &Playlist,
    ) {
        self.state = SegmentLoaderState::Waiting;
        self.trim_back_buffer(host, ctx, playlist);
        let index = info.media_index as usize;
        let Some(segment) = playlist.segments.get(index) else {
            self.state = SegmentLoaderState::Ready;
            return;
        };

        let key = segment.key.as_ref().map(|key| {
            let iv = key
                .iv
                .unwrap_or_else(|| segment_iv(playlist.sequence_of(index)));
            let source = match self.key_cache.get(key.resolved_uri.as_str()) {
                Some(cached) => KeySource::Cached(*cached),
                None => KeySource::Fetch(key.resolved_uri.clone()),
            };
            KeyRequest { source, iv }
        });
        let init = segment
            .map
            .as_ref()
            .filter(|map| !self.init_segments.contains_key(&map.id()))
            .map(|map| ResourceRequest {
                url: map.resolved_uri.clone(),
                byte_range: map.byte_range,
            });
        let params = SegmentRequestParams {
            key,
            init,
            media: ResourceRequest {
                url: segment.resolved_uri.clone(),
                byte_range: segment.byte_range,
            },
            timeout_ms: self.request_timeout,
            with_credentials: self.with_credentials,
        };

        tracing::debug!("SL({}): loading {info}", self.kind);
        let request = MediaSegmentRequest::start(host, info.request_id, params);
        self.pending = Some(PendingSegment { info, request });
    }

    /// Abort the current request if it would lead to rebuffering while a lower variant would
    /// not. Returns `true` if it was aborted.
    fn abort_request_early<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &LoaderContext<'_>,
        stats: &RequestStats,
    ) -> bool {
        let (Some(playlist), Some(pending), Some(master)) =
            (self.playlist.as_ref(), self.pending.as_ref(), ctx.master)
        else {
            return false;
        };
        if host.paused()
            || self.request_timeout.is_none()
            || playlist.attributes.bandwidth.is_none()
            || stats.bandwidth <= 0.
        {
            return false;
        }
        let now = host.now();
        // let the measured bandwidth stabilize first
        if now - stats.first_bytes_received_at.unwrap_or(now) < 1000. {
            return false;
        }

        let current_time = host.current_time();
        let segment_duration = pending.info.duration;
        let Some(request_time_remaining) = estimate_segment_request_time(
            segment_duration,
            stats.bandwidth,
            playlist,
            stats.bytes_received,
        ) else {
            return false;
        };
        // still worth aborting when finishing with less than a second of buffer left
        let time_until_rebuffer =
            time_until_rebuffer(&self.buffered(&*host), current_time, host.playback_rate()) - 1.;
        if request_time_remaining <= time_until_rebuffer {
            return false;
        }

        let params = RebufferSelectorParams {
            master,
            current_time,
            bandwidth: stats.bandwidth,
            duration: ctx.duration,
            segment_duration,
            time_until_rebuffer,
            current_timeline: self.current_timeline,
            now,
        };
        let Some(candidate) = min_rebuffer_max_bandwidth_selector(&params, ctx.sync) else {
            return false;
        };
        let rebuffering_impact = request_time_remaining - time_until_rebuffer;
        let time_saved = rebuffering_impact - candidate.rebuffering_impact;
        let minimum_time_saving = if time_until_rebuffer <= TIME_FUDGE_FACTOR {
            1.
        } else {
            0.5
        };
        if candidate.playlist.uri == playlist.uri || time_saved < minimum_time_saving {
            return false;
        }

        tracing::warn!(
            "SL({}): aborting request early, switching to {} would save {time_saved}s",
            self.kind,
            candidate.playlist.uri
        );
        // scaled so that the selector does not exclude the candidate
        self.bandwidth =
            candidate.playlist.attributes.bandwidth.unwrap_or(0) as f64 * self.bandwidth_variance
                + 1.;
        self.abort(host);
        self.events.trigger(SegmentLoaderEvent::EarlyAbort);
        true
    }

    fn on_segment_progress<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &mut LoaderContext<'_>,
        progress: RequestProgress,
    ) {
        match progress {
            RequestProgress::Pending | RequestProgress::Decrypting => {}
            RequestProgress::Failed(err) => {
                self.stats.media_requests += 1;
                self.pending = None;
                self.state = SegmentLoaderState::Ready;
                match err.kind {
                    RequestErrorKind::Aborted => {
                        self.stats.media_requests_aborted += 1;
                    }
                    RequestErrorKind::Timeout => {
                        self.stats.media_requests_timedout += 1;
                        self.pause(host);
                        self.bandwidth = 1.;
                        self.round_trip = f64::NAN;
                        self.fail(err.into());
                    }
                    RequestErrorKind::Failure => {
                        self.stats.media_requests_errored += 1;
                        self.pause(host);
                        self.fail(err.into());
                    }
                }
            }
            RequestProgress::Done(data) => {
                self.on_segment_loaded(host, data);
                self.handle_segment(host, ctx);
            }
        }
    }

    fn fail(&mut self, err: SegmentLoaderError) {
        tracing::warn!("SL({}): {err}", self.kind);
        self.error = Some(err.clone());
        self.events.trigger(SegmentLoaderEvent::Error(err));
    }

    fn on_segment_loaded<H: Host>(&mut self, host: &H, data: SegmentData) {
        self.stats.media_requests += 1;
        self.stats.media_bytes_transferred += data.stats.bytes_received;
        self.stats.media_transfer_duration += data.stats.roundtrip_time;
        self.bandwidth = data.stats.bandwidth;
        self.round_trip = data.stats.roundtrip_time;

        let (Some(pending), Some(playlist)) = (self.pending.as_mut(), self.playlist.as_ref())
        else {
            return;
        };
        let segment = usize::try_from(pending.info.media_index)
            .ok()
            .and_then(|i| playlist.segments.get(i));
        if let Some(segment) = segment {
            if let (Some(map), Some(init)) = (segment.map.as_ref(), data.init.as_ref()) {
                self.init_segments.insert(map.id(), init.clone());
            }
            if let (Some(key), Some(bytes)) = (segment.key.as_ref(), data.key) {
                if self.cache_encryption_keys {
                    self.key_cache
                        .insert(key.resolved_uri.to_string(), bytes);
                }
            }
        }
        pending.info.end_of_all_requests = Some(host.now());
        pending.info.data = Some(data);
    }

    fn handle_segment<H: Host>(&mut self, host: &mut H, ctx: &mut LoaderContext<'_>) {
        let Some(pending) = self.pending.as_ref() else {
            self.state = SegmentLoaderState::Ready;
            return;
        };
        let info = pending.info.clone();
        let (Some(data), Some(playlist)) = (info.data, self.playlist.as_mut()) else {
            self.pending = None;
            self.state = SegmentLoaderState::Ready;
            return;
        };
        let Some(index) = usize::try_from(info.media_index)
            .ok()
            .filter(|i| *i < playlist.segments.len())
        else {
            tracing::debug!(
                "SL({}): segment {} left the playlist, dropping it",
                self.kind,
                info.uri
            );
            self.pending = None;
            self.state = SegmentLoaderState::Ready;
            return;
        };

        if self.kind == LoaderKind::Subtitle {
            self.state = SegmentLoaderState::Appending;
            let start = info.start_of_segment.unwrap_or(0.);
            let end = start + info.duration;
            let segment = &mut Rc::make_mut(playlist).segments[index];
            segment.start = Some(start);
            segment.end = Some(end);
            if info.is_sync_request {
                self.events.trigger(SegmentLoaderEvent::SyncInfoUpdate);
                self.pending = None;
                self.state = SegmentLoaderState::Ready;
                return;
            }
            self.stats.media_seconds_loaded += info.duration;
            if let Some(pending) = self.pending.as_mut() {
                pending.info.byte_length = data.media.len();
            }
            // avoid doubling cues already there
            host.remove_cues(TextTrackKind::Subtitles, start, end);
            host.add_cue(
                TextTrackKind::Subtitles,
                Cue {
                    start,
                    end,
                    payload: CuePayload::Subtitles(data.media),
                },
            );
            self.text_buffered.add(start, end);
            self.handle_update_end(host, ctx);
            return;
        }

        let map = playlist.segments[index].map.clone();
        let probe = host.probe_segment(self.kind, &data.media, map.is_some());
        let timing = match probe {
            Some(probe) => {
                let probed = ProbedSegment {
                    media_index: index,
                    timeline: info.timeline,
                    start_of_segment: info.start_of_segment.unwrap_or(0.),
                    timestamp_offset_changed: info.timestamp_offset.is_some(),
                };
                ctx.sync
                    .probe_segment_info(Rc::make_mut(playlist), probed, &probe)
                    .then_some(probe)
            }
            None => None,
        };
        if self.starting_media.is_none() {
            if let Some(timing) = timing.filter(|t| t.contains_audio || t.contains_video) {
                self.starting_media = Some(StartingMedia {
                    contains_audio: timing.contains_audio,
                    contains_video: timing.contains_video,
                });
            }
        }

        if let Some(message) = illegal_media_switch(self.kind, self.starting_media, timing.as_ref())
        {
            self.pending = None;
            self.state = SegmentLoaderState::Ready;
            self.pause(host);
            self.fail(SegmentLoaderError {
                message: message.to_owned(),
                status: None,
                blacklist_duration: Some(BlacklistDuration::Forever),
            });
            return;
        }

        if info.is_sync_request {
            tracing::debug!("SL({}): sync request done: {}", self.kind, info.uri);
            self.events.trigger(SegmentLoaderEvent::SyncInfoUpdate);
            self.pending = None;
            self.state = SegmentLoaderState::Ready;
            return;
        }

        let Some(updater) = self.source_updater.as_mut() else {
            self.pending = None;
            self.state = SegmentLoaderState::Ready;
            return;
        };
        if let Some(offset) = info.timestamp_offset {
            if offset != updater.timestamp_offset() {
                updater.set_timestamp_offset(host, offset);
                self.events.trigger(SegmentLoaderEvent::TimestampOffset);
            }
        }

        self.state = SegmentLoaderState::Appending;
        if let Some(map) = map {
            let init_id = map.id();
            if self.active_init_segment_id.as_deref() != Some(init_id.as_str()) {
                if let Some(init) = self.init_segments.get(&init_id) {
                    updater.append(host, init.clone(), AppendKind::Init(init_id));
                }
            }
        }

        let segment = &playlist.segments[index];
        self.stats.media_seconds_loaded += match (segment.start, segment.end) {
            (Some(start), Some(end)) => end - start,
            _ => segment.duration,
        };
        if let Some(pending) = self.pending.as_mut() {
            pending.info.byte_length = data.media.len();
            tracing::debug!("SL({}): pushing {}", self.kind, pending.info);
        }
        updater.append(host, data.media, AppendKind::Media);
    }

    fn handle_update_end<H: Host>(&mut self, host: &mut H, ctx: &mut LoaderContext<'_>) {
        let Some(pending) = self.pending.take() else {
            self.state = SegmentLoaderState::Ready;
            if !self.paused() {
                self.monitor_buffer(host);
            }
            return;
        };
        let info = pending.info;
        let is_walking_forward = self.media_index.is_some();
        self.record_throughput(&*host, &info);
        self.add_segment_metadata_cue(host, &info);

        self.state = SegmentLoaderState::Ready;
        self.media_index = Some(info.media_index);
        self.fetch_at_buffer = true;
        self.current_timeline = Some(info.timeline);
        self.events.trigger(SegmentLoaderEvent::SyncInfoUpdate);

        let (segment_end, target_duration) = match self.playlist.as_ref() {
            Some(playlist) => (
                usize::try_from(info.media_index)
                    .ok()
                    .and_then(|i| playlist.segments.get(i))
                    .and_then(|s| s.end),
                playlist.target_duration,
            ),
            None => (None, 0.),
        };
        // the guess was too conservative, restart from a better sync point
        if let Some(end) = segment_end {
            if host.current_time() - end > target_duration * 3. {
                self.reset_everything(host, ctx.duration);
                return;
            }
        }

        // no variant switch before knowing where to load from
        if is_walking_forward {
            self.events.trigger(SegmentLoaderEvent::BandwidthUpdate);
        }
        self.events.trigger(SegmentLoaderEvent::Progress);

        if self.is_end_of_stream(&*host, Some(info.media_index)) {
            self.end_of_stream(host);
        }
        if !self.paused() {
            self.monitor_buffer(host);
        }
    }

    fn record_throughput<H: Host>(&mut self, host: &H, info: &SegmentInfo) {
        let Some(end_of_all_requests) = info.end_of_all_requests else {
            return;
        };
        // +1 so that the processing time is never 0
        let processing_time = host.now() - end_of_all_requests + 1.;
        let sample = (info.byte_length as f64 / processing_time * 8. * 1000.).floor();
        self.throughput.count += 1;
        self.throughput.rate += (sample - self.throughput.rate) / self.throughput.count as f64;
    }

    fn add_segment_metadata_cue<H: Host>(&self, host: &mut H, info: &SegmentInfo) {
        if self.kind != LoaderKind::Main {
            return;
        }
        let Some(playlist) = self.playlist.as_ref() else {
            return;
        };
        let Some(segment) = usize::try_from(info.media_index)
            .ok()
            .and_then(|i| playlist.segments.get(i))
        else {
            return;
        };
        let (Some(start), Some(end)) = (segment.start, segment.end) else {
            return;
        };
        if !start.is_finite() || !end.is_finite() {
            return;
        }
        host.remove_cues(TextTrackKind::SegmentMetadata, start, end);
        host.add_cue(
            TextTrackKind::SegmentMetadata,
            Cue {
                start,
                end,
                payload: CuePayload::SegmentMetadata {
                    uri: info.uri.clone(),
                    timeline: info.timeline,
                    bandwidth: playlist.attributes.bandwidth,
                    resolution: playlist
                        .attributes
                        .resolution
                        .map(|r| (r.width, r.height)),
                    codecs: playlist.attributes.codecs.clone(),
                    byte_length: info.byte_length,
                },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        playlist::test_helpers::{master, media_playlist, variant},
        testing::MockHost,
    };
    use rstest::rstest;

    struct Env {
        host: MockHost,
        sync: SyncController,
        master: Option<MasterPlaylist>,
        seekable: TimeRanges,
        duration: f64,
        has_played: bool,
    }

    impl Env {
        fn new(duration: f64) -> Self {
            Self {
                host: MockHost::new(),
                sync: SyncController::new(),
                master: None,
                seekable: TimeRanges::single(0., duration.min(1000.)),
                duration,
                has_played: true,
            }
        }

        fn split(&mut self) -> (LoaderContext<'_>, &mut MockHost) {
            (
                LoaderContext {
                    sync: &mut self.sync,
                    master: self.master.as_ref(),
                    seekable: &self.seekable,
                    duration: self.duration,
                    has_played: self.has_played,
                    goal_buffer_length: 30.,
                },
                &mut self.host,
            )
        }

        /// Fire the loader's buffer check timer.
        fn tick(&mut self, loader: &mut SegmentLoader) {
            let reason = TimerReason::BufferCheck(loader.kind());
            let id = self.host.timer(reason).map(|t| t.id).expect("timer armed");
            let (mut ctx, host) = self.split();
            assert!(loader.on_timer(host, &mut ctx, id, reason));
        }

        fn finish(&mut self, loader: &mut SegmentLoader, suffix: &str, outcome: RequestOutcome) {
            let id = self
                .host
                .request_to(suffix)
                .map(|r| r.id)
                .expect("pending request");
            let (mut ctx, host) = self.split();
            assert!(loader.on_request_finished(host, &mut ctx, id, outcome));
        }

        fn buffer_updated(&mut self, loader: &mut SegmentLoader) {
            let (mut ctx, host) = self.split();
            loader.on_source_buffer_update(host, &mut ctx);
        }
    }

    fn loaded(data: &'static [u8]) -> RequestOutcome {
        RequestOutcome::Loaded {
            status: 200,
            body: Bytes::from_static(data),
            final_uri: None,
        }
    }

    fn probe(start: f64, end: f64, audio: bool, video: bool) -> SegmentProbe {
        SegmentProbe {
            start,
            end,
            contains_audio: audio,
            contains_video: video,
        }
    }

    /// A main loader started on `playlist`, its initial buffer removal completed.
    fn started_loader(env: &mut Env, playlist: Playlist, kind: LoaderKind) -> SegmentLoader {
        let mut loader = SegmentLoader::new(kind, &Config::default());
        let (mut ctx, host) = env.split();
        loader.set_playlist(host, &mut ctx, Rc::new(playlist), Some(15_000.));
        if kind != LoaderKind::Subtitle {
            loader
                .set_mime_type(host, &mut ctx, "video/mp2t; codecs=\"avc1.4d400d, mp4a.40.2\"")
                .expect("buffer created");
        }
        loader.load(host, &mut ctx);
        assert_eq!(loader.state(), SegmentLoaderState::Ready);
        if kind != LoaderKind::Subtitle {
            assert_eq!(env.host.removed, vec![(kind, 0., env.duration)]);
            env.buffer_updated(&mut loader);
        }
        loader
    }

    #[test]
    fn loads_and_pushes_vod_segments() {
        let mut env = Env::new(30.);
        let mut loader = started_loader(
            &mut env,
            media_playlist("p.m3u8", 0, &[10., 10., 10.], true),
            LoaderKind::Main,
        );
        env.tick(&mut loader);
        assert_eq!(loader.state(), SegmentLoaderState::Waiting);
        let request = env.host.request_to("seg0.ts").expect("first segment requested");
        assert_eq!(request.options.timeout_ms, Some(15_000.));

        env.host.now += 100.;
        env.finish(&mut loader, "seg0.ts", loaded(b"segment 0"));
        assert_eq!(loader.state(), SegmentLoaderState::Appending);
        assert_eq!(env.host.appended.len(), 1);
        assert_eq!(loader.bandwidth(), (9. / 100. * 8. * 1000.0f64).floor());
        assert_eq!(loader.stats().media_requests, 1);

        env.host.set_track_buffered(LoaderKind::Main, &[(0., 10.)]);
        env.buffer_updated(&mut loader);
        assert_eq!(loader.state(), SegmentLoaderState::Ready);
        assert_eq!(loader.media_index(), Some(0));
        let events = loader.drain_events();
        assert!(events.contains(&SegmentLoaderEvent::SyncInfoUpdate));
        assert!(events.contains(&SegmentLoaderEvent::Progress));
        assert!(!events.contains(&SegmentLoaderEvent::BandwidthUpdate));
        assert!(loader.throughput() > 0.);

        let segment = &loader.playlist().expect("playlist").segments[0];
        assert_eq!((segment.start, segment.end), (Some(0.), Some(10.)));
        assert!(env
            .host
            .cues
            .iter()
            .any(|(track, cue)| *track == TextTrackKind::SegmentMetadata && cue.end == 10.));

        env.tick(&mut loader);
        assert!(env.host.request_to("seg1.ts").is_some());
    }

    #[test]
    fn ends_after_last_segment() {
        let mut env = Env::new(10.);
        let mut loader = started_loader(
            &mut env,
            media_playlist("p.m3u8", 0, &[10.], true),
            LoaderKind::Main,
        );
        env.tick(&mut loader);
        env.finish(&mut loader, "seg0.ts", loaded(b"data"));
        env.buffer_updated(&mut loader);
        assert!(loader.is_ended());
        assert!(loader.paused());
        assert!(loader.drain_events().contains(&SegmentLoaderEvent::Ended));
    }

    #[test]
    fn timeouts_drop_bandwidth_and_report_an_error() {
        let mut env = Env::new(30.);
        let mut loader = started_loader(
            &mut env,
            media_playlist("p.m3u8", 0, &[10.; 3], true),
            LoaderKind::Main,
        );
        env.tick(&mut loader);
        env.finish(&mut loader, "seg0.ts", RequestOutcome::TimedOut);
        assert_eq!(loader.bandwidth(), 1.);
        assert!(loader.round_trip().is_nan());
        assert!(loader.paused());
        assert_eq!(loader.stats().media_requests_timedout, 1);
        assert!(matches!(
            loader.drain_events().last(),
            Some(SegmentLoaderEvent::Error(_))
        ));
    }

    #[test]
    fn host_aborts_are_not_errors() {
        let mut env = Env::new(30.);
        let mut loader = started_loader(
            &mut env,
            media_playlist("p.m3u8", 0, &[10.; 3], true),
            LoaderKind::Main,
        );
        env.tick(&mut loader);
        env.finish(&mut loader, "seg0.ts", RequestOutcome::Aborted);
        assert_eq!(loader.state(), SegmentLoaderState::Ready);
        assert!(!loader.paused());
        assert_eq!(loader.stats().media_requests_aborted, 1);
        assert!(loader.error().is_none());
    }

    #[test]
    fn shifts_media_index_on_live_refresh() {
        let mut env = Env::new(f64::INFINITY);
        env.has_played = false;
        let mut loader = SegmentLoader::new(LoaderKind::Main, &Config::default());
        let (mut ctx, host) = env.split();
        loader.set_playlist(
            host,
            &mut ctx,
            Rc::new(media_playlist("live.m3u8", 10, &[4.; 6], false)),
            None,
        );
        loader.media_index = Some(3);
        loader.set_playlist(
            host,
            &mut ctx,
            Rc::new(media_playlist("live.m3u8", 12, &[4.; 6], false)),
            None,
        );
        assert_eq!(loader.media_index(), Some(1));
        assert_eq!(
            loader.playlist().and_then(|p| p.sync_info),
            Some(SyncInfo {
                media_sequence: 12,
                time: 0.
            })
        );

        loader.set_playlist(
            host,
            &mut ctx,
            Rc::new(media_playlist("other.m3u8", 12, &[4.; 6], false)),
            None,
        );
        assert_eq!(loader.media_index(), None);
    }

    #[test]
    fn only_live_playlists_get_a_zero_time_before_play() {
        let mut env = Env::new(f64::INFINITY);
        env.has_played = false;
        let mut loader = SegmentLoader::new(LoaderKind::Main, &Config::default());
        let (mut ctx, host) = env.split();
        loader.set_playlist(
            host,
            &mut ctx,
            Rc::new(media_playlist("vod.m3u8", 5, &[4.; 3], true)),
            None,
        );
        assert_eq!(loader.playlist().and_then(|p| p.sync_info), None);
    }

    #[test]
    fn issues_sync_requests_without_sync_point() {
        let mut env = Env::new(f64::INFINITY);
        // a timeline already mapped, as would have been done by a previous variant
        let mut previous = media_playlist("prev.m3u8", 0, &[10.], false);
        let mapped = ProbedSegment {
            media_index: 0,
            timeline: 0,
            start_of_segment: 100.,
            timestamp_offset_changed: true,
        };
        env.sync
            .probe_segment_info(&mut previous, mapped, &probe(0., 10., true, true));

        let mut loader = started_loader(
            &mut env,
            media_playlist("live.m3u8", 50, &[10.; 4], false),
            LoaderKind::Main,
        );
        env.tick(&mut loader);
        assert!(loader
            .pending
            .as_ref()
            .map_or(false, |p| p.info.is_sync_request));
        env.host.probe = Some(probe(20., 30., true, true));
        env.finish(&mut loader, "seg50.ts", loaded(b"data"));
        assert!(env.host.appended.is_empty());
        assert_eq!(loader.state(), SegmentLoaderState::Ready);
        let playlist = loader.playlist().expect("playlist");
        assert_eq!(playlist.segments[0].start, Some(120.));
        assert_eq!(
            playlist.sync_info,
            Some(SyncInfo {
                media_sequence: 50,
                time: 120.
            })
        );
        assert!(loader
            .drain_events()
            .contains(&SegmentLoaderEvent::SyncInfoUpdate));
    }

    #[test]
    fn aborts_early_when_a_lower_variant_avoids_rebuffering() {
        let mut env = Env::new(30.);
        let mut hi = media_playlist("hi.m3u8", 0, &[10.; 3], true);
        hi.attributes.bandwidth = Some(4_000_000);
        env.master = Some(master(vec![
            hi.clone(),
            variant("lo.m3u8", Some(100_000), None),
        ]));
        let mut loader = started_loader(&mut env, hi, LoaderKind::Main);
        env.host.set_track_buffered(LoaderKind::Main, &[(0., 2.)]);
        env.tick(&mut loader);
        let id = env.host.request_to("seg0.ts").map(|r| r.id).expect("request");

        let (ctx, host) = env.split();
        assert!(loader.on_request_progress(host, &ctx, id, 1000));
        host.now += 1000.;
        assert!(loader.on_request_progress(host, &ctx, id, 2000));

        assert_eq!(loader.bandwidth(), 100_000. * 1.2 + 1.);
        assert_eq!(loader.state(), SegmentLoaderState::Ready);
        assert!(env.host.pending_requests().is_empty());
        assert!(loader.drain_events().contains(&SegmentLoaderEvent::EarlyAbort));
    }

    #[test]
    fn rejects_illegal_media_switches() {
        let mut env = Env::new(30.);
        let mut loader = started_loader(
            &mut env,
            media_playlist("p.m3u8", 0, &[10.; 3], true),
            LoaderKind::Main,
        );
        env.tick(&mut loader);
        env.finish(&mut loader, "seg0.ts", loaded(b"av"));
        env.buffer_updated(&mut loader);
        loader.drain_events();

        env.host.probe = Some(probe(10., 20., true, false));
        env.tick(&mut loader);
        env.finish(&mut loader, "seg1.ts", loaded(b"audio only"));
        let Some(SegmentLoaderEvent::Error(err)) = loader.drain_events().pop() else {
            panic!("expected an error");
        };
        assert_eq!(err.blacklist_duration, Some(BlacklistDuration::Forever));
        assert_eq!(env.host.appended.len(), 1);
    }

    #[test]
    fn subtitles_wait_for_their_timeline() {
        let mut env = Env::new(30.);
        let mut loader = started_loader(
            &mut env,
            media_playlist("subs.m3u8", 0, &[10.; 3], true),
            LoaderKind::Subtitle,
        );
        env.tick(&mut loader);
        assert_eq!(loader.state(), SegmentLoaderState::WaitingOnTimeline);
        assert!(env.host.requests.is_empty());

        let mut main = media_playlist("main.m3u8", 0, &[10.], true);
        let mapped = ProbedSegment {
            media_index: 0,
            timeline: 0,
            start_of_segment: 0.,
            timestamp_offset_changed: true,
        };
        env.sync
            .probe_segment_info(&mut main, mapped, &probe(0., 10., true, true));
        loader.on_timestamp_offset(&mut env.host);
        assert_eq!(loader.state(), SegmentLoaderState::Ready);

        env.tick(&mut loader);
        env.finish(&mut loader, "seg0.ts", loaded(b"WEBVTT"));
        let (track, cue) = env.host.cues.last().expect("cue added");
        assert_eq!(*track, TextTrackKind::Subtitles);
        assert_eq!((cue.start, cue.end), (0., 10.));
        assert_eq!(loader.media_index(), Some(0));
        assert_eq!(loader.buffered(&env.host), TimeRanges::single(0., 10.));
    }

    #[rstest]
    #[case(LoaderKind::Main, (true, true), (false, false), true)]
    #[case(LoaderKind::Main, (true, true), (true, false), true)]
    #[case(LoaderKind::Main, (true, false), (true, true), true)]
    #[case(LoaderKind::Main, (true, true), (false, true), false)]
    #[case(LoaderKind::Audio, (false, true), (true, false), false)]
    fn detects_illegal_media_switches(
        #[case] kind: LoaderKind,
        #[case] starting: (bool, bool),
        #[case] new: (bool, bool),
        #[case] illegal: bool,
    ) {
        let starting = StartingMedia {
            contains_audio: starting.0,
            contains_video: starting.1,
        };
        let new = probe(0., 1., new.0, new.1);
        assert_eq!(
            illegal_media_switch(kind, Some(starting), Some(&new)).is_some(),
            illegal
        );
        assert!(illegal_media_switch(kind, None, Some(&new)).is_none());
    }

    #[rstest]
    #[case(&[(20., 100.)], 50., 10., 20.)]
    #[case(&[(0., 100.)], 50., 10., 20.)]
    #[case(&[(0., 100.)], 35., 10., 5.)]
    #[case(&[(60., 100.)], 50., 10., 20.)]
    #[case(&[(45., 100.)], 50., 10., 40.)]
    fn computes_safe_back_buffer_trim_time(
        #[case] seekable: &[(f64, f64)],
        #[case] current_time: f64,
        #[case] target_duration: f64,
        #[case] expected: f64,
    ) {
        let seekable = TimeRanges::from_ranges(seekable);
        assert_eq!(
            safe_back_buffer_trim_time(&seekable, current_time, target_duration, 30.),
            expected
        );
    }
}
