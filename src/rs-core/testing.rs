//! In-memory `Host` recording every call, used to drive components through scenarios.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    error::SourceBufferError,
    host::{
        Clock, Cue, DecryptionMessage, Decrypter, EndOfStreamError, LoaderKind, MediaElement,
        MediaSink, MediaSourceReadyState, RequestId, RequestOptions, SegmentProbe, TextTrackKind,
        TextTrackSink, TimerId, TimerReason, Timers, Transport,
    },
    utils::time_ranges::TimeRanges,
};

pub(crate) struct MockRequest {
    pub id: RequestId,
    pub options: RequestOptions,
    pub token: CancellationToken,
}

pub(crate) struct MockTimer {
    pub id: TimerId,
    pub delay: f64,
    pub reason: TimerReason,
}

pub(crate) struct MockHost {
    pub now: f64,
    pub random_value: f64,
    next_id: u64,

    pub timers: Vec<MockTimer>,
    pub requests: Vec<MockRequest>,

    pub ready_state: MediaSourceReadyState,
    pub add_source_buffer_error: Option<SourceBufferError>,
    pub source_buffers: Vec<(LoaderKind, String)>,
    pub appended: Vec<(LoaderKind, Bytes)>,
    pub removed: Vec<(LoaderKind, f64, f64)>,
    pub timestamp_offsets: Vec<(LoaderKind, f64)>,
    pub track_buffered: HashMap<LoaderKind, TimeRanges>,
    pub end_of_stream_calls: Vec<Option<EndOfStreamError>>,
    pub media_duration: f64,
    pub probe: Option<SegmentProbe>,
    pub probe_queue: VecDeque<SegmentProbe>,

    pub current_time: f64,
    pub seeks: Vec<f64>,
    pub paused: bool,
    pub seeking: bool,
    pub ended: bool,
    pub playback_rate: f64,
    pub buffered: TimeRanges,
    pub dimensions: (u32, u32),
    pub preload_none: bool,

    pub cues: Vec<(TextTrackKind, Cue)>,
    pub removed_cues: Vec<(TextTrackKind, f64, f64)>,
    pub decryptions: Vec<DecryptionMessage>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            now: 1_000_000.,
            random_value: 0.5,
            next_id: 1,
            timers: vec![],
            requests: vec![],
            ready_state: MediaSourceReadyState::Open,
            add_source_buffer_error: None,
            source_buffers: vec![],
            appended: vec![],
            removed: vec![],
            timestamp_offsets: vec![],
            track_buffered: HashMap::new(),
            end_of_stream_calls: vec![],
            media_duration: f64::NAN,
            probe: Some(SegmentProbe {
                start: 0.,
                end: 10.,
                contains_audio: true,
                contains_video: true,
            }),
            probe_queue: VecDeque::new(),
            current_time: 0.,
            seeks: vec![],
            paused: false,
            seeking: false,
            ended: false,
            playback_rate: 1.,
            buffered: TimeRanges::new(),
            dimensions: (1280, 720),
            preload_none: false,
            cues: vec![],
            removed_cues: vec![],
            decryptions: vec![],
        }
    }

    /// Requests which were neither cancelled nor taken out.
    pub fn pending_requests(&self) -> Vec<&MockRequest> {
        self.requests
            .iter()
            .filter(|r| !r.token.is_cancelled())
            .collect()
    }

    /// Last non-cancelled request made on a URL ending with `suffix`.
    pub fn request_to(&self, suffix: &str) -> Option<&MockRequest> {
        self.requests
            .iter()
            .rev()
            .find(|r| !r.token.is_cancelled() && r.options.uri.as_str().ends_with(suffix))
    }

    pub fn last_request(&self) -> Option<&MockRequest> {
        self.requests.last()
    }

    /// Last armed timer for that reason.
    pub fn timer(&self, reason: TimerReason) -> Option<&MockTimer> {
        self.timers.iter().rev().find(|t| t.reason == reason)
    }

    pub fn set_track_buffered(&mut self, track: LoaderKind, ranges: &[(f64, f64)]) {
        self.track_buffered
            .insert(track, TimeRanges::from_ranges(ranges));
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Clock for MockHost {
    fn now(&self) -> f64 {
        self.now
    }

    fn random(&mut self) -> f64 {
        self.random_value
    }
}

impl Timers for MockHost {
    fn set_timer(&mut self, delay_ms: f64, reason: TimerReason) -> TimerId {
        let id = self.next_id();
        self.timers.push(MockTimer {
            id,
            delay: delay_ms,
            reason,
        });
        id
    }

    fn clear_timer(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }
}

impl Transport for MockHost {
    fn fetch(&mut self, options: RequestOptions, token: CancellationToken) -> RequestId {
        let id = self.next_id();
        self.requests.push(MockRequest { id, options, token });
        id
    }
}

impl MediaSink for MockHost {
    fn ready_state(&self) -> MediaSourceReadyState {
        self.ready_state
    }

    fn add_source_buffer(
        &mut self,
        track: LoaderKind,
        mime_type: &str,
    ) -> Result<(), SourceBufferError> {
        if let Some(err) = self.add_source_buffer_error.clone() {
            return Err(err);
        }
        self.source_buffers.push((track, mime_type.to_owned()));
        Ok(())
    }

    fn append_buffer(&mut self, track: LoaderKind, data: Bytes) {
        self.appended.push((track, data));
    }

    fn remove_buffer(&mut self, track: LoaderKind, start: f64, end: f64) {
        self.removed.push((track, start, end));
    }

    fn set_timestamp_offset(&mut self, track: LoaderKind, offset: f64) {
        self.timestamp_offsets.push((track, offset));
    }

    fn source_buffered(&self, track: LoaderKind) -> TimeRanges {
        self.track_buffered
            .get(&track)
            .cloned()
            .unwrap_or_default()
    }

    fn end_of_stream(&mut self, error: Option<EndOfStreamError>) {
        self.end_of_stream_calls.push(error);
        self.ready_state = MediaSourceReadyState::Ended;
    }

    fn duration(&self) -> f64 {
        self.media_duration
    }

    fn set_duration(&mut self, duration: f64) {
        self.media_duration = duration;
    }

    fn probe_segment(
        &mut self,
        _track: LoaderKind,
        _data: &[u8],
        _is_fmp4: bool,
    ) -> Option<SegmentProbe> {
        self.probe_queue.pop_front().or(self.probe)
    }
}

impl MediaElement for MockHost {
    fn current_time(&self) -> f64 {
        self.current_time
    }

    fn set_current_time(&mut self, time: f64) {
        self.seeks.push(time);
        self.current_time = time;
    }

    fn paused(&self) -> bool {
        self.paused
    }

    fn seeking(&self) -> bool {
        self.seeking
    }

    fn ended(&self) -> bool {
        self.ended
    }

    fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    fn buffered(&self) -> TimeRanges {
        self.buffered.clone()
    }

    fn player_dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn preload_none(&self) -> bool {
        self.preload_none
    }
}

impl TextTrackSink for MockHost {
    fn add_cue(&mut self, track: TextTrackKind, cue: Cue) {
        self.cues.push((track, cue));
    }

    fn remove_cues(&mut self, track: TextTrackKind, start: f64, end: f64) {
        self.removed_cues.push((track, start, end));
    }
}

impl Decrypter for MockHost {
    fn post_decryption(&mut self, message: DecryptionMessage) {
        self.decryptions.push(message);
    }
}
