//! Detects playback stalls and tries to unstuck the media element.
//!
//! The `PlaybackWatcher` knows nothing of playlists or segments. It polls the media element's
//! clock and, when it stopped advancing while playing, looks at the buffered ranges to choose
//! a corrective seek.

use crate::{
    config::Config,
    host::{MediaElement, MediaEvent, TimerId, TimerReason, Timers},
    playlist::Playlist,
    utils::{
        event_target::{forward_subscribable, Event, EventTarget, Subscribable},
        time_ranges::{
            find_gaps, find_next_range, find_range, printable_range, TimeRange, TimeRanges,
            SAFE_TIME_DELTA, TIME_FUDGE_FACTOR,
        },
    },
};

/// A corrective action was taken. Emitted as `usage` events by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackWatcherEvent {
    /// Stalled inside a buffered range for no known reason, re-seeked to the current time.
    UnknownWaiting,
    /// Fell behind a live window, jumped to its end.
    LiveResync,
    /// Audio played past a hole in the video buffer, re-seeked to the current time.
    VideoUnderflow,
    /// Jumped over a hole in the buffer.
    GapSkip,
}

impl Event for PlaybackWatcherEvent {
    fn name(&self) -> &'static str {
        match self {
            PlaybackWatcherEvent::UnknownWaiting => "hls-unknown-waiting",
            PlaybackWatcherEvent::LiveResync => "hls-live-resync",
            PlaybackWatcherEvent::VideoUnderflow => "hls-video-underflow",
            PlaybackWatcherEvent::GapSkip => "hls-gap-skip",
        }
    }
}

/// What the watcher needs to know about the content at a given time.
#[derive(Clone, Copy)]
pub struct WatchedContent<'a> {
    pub seekable: &'a TimeRanges,
    /// Active media playlist, if known.
    pub media: Option<&'a Playlist>,
}

/// `true` if `current_time` is after the end of the seekable window.
///
/// On live contents, with `allow_unsafe_live_window`, seeks up to three target durations
/// after that end are tolerated.
pub fn after_seekable_window(
    seekable: &TimeRanges,
    current_time: f64,
    media: Option<&Playlist>,
    allow_unsafe_live_window: bool,
) -> bool {
    let Some(seekable_end) = seekable.last_end() else {
        return false;
    };
    let allowed_end = match media {
        Some(media) if !media.end_list && allow_unsafe_live_window => {
            seekable_end + media.target_duration * 3.
        }
        _ => seekable_end + SAFE_TIME_DELTA,
    };
    current_time > allowed_end
}

/// `true` if `current_time` is before the start of a seekable window which does not start at
/// `0`.
pub fn before_seekable_window(seekable: &TimeRanges, current_time: f64) -> bool {
    match seekable.start(0) {
        // a window starting at 0 cannot be fallen out of
        Some(start) => start > 0. && current_time < start - SAFE_TIME_DELTA,
        None => false,
    }
}

/// The hole in `buffered` audio may have played through, leading to `current_time`.
///
/// Some browsers keep playing audio for a few seconds after the video reached a hole in its
/// buffer, so the current time ends up after that hole while the video is frozen before it.
/// Such a hole starts between `window.0` and `window.1` seconds before `current_time`.
pub fn gap_from_video_underflow(
    buffered: &TimeRanges,
    current_time: f64,
    window: (f64, f64),
) -> Option<TimeRange> {
    find_gaps(buffered).iter().copied().find(|gap| {
        let since_gap = current_time - gap.start();
        since_gap > window.0 && since_gap < window.1
    })
}

/// Polls the media element's clock to detect and correct stalls.
pub struct PlaybackWatcher {
    consecutive_updates: u32,
    last_recorded_time: Option<f64>,
    monitor_timer: Option<TimerId>,
    /// Timer jumping over a buffer gap, with the time at which it was armed.
    gap_timer: Option<(TimerId, f64)>,

    poll_interval: f64,
    stall_poll_threshold: u32,
    video_underflow_window: (f64, f64),
    allow_seeks_within_unsafe_live_window: bool,

    events: EventTarget<PlaybackWatcherEvent>,
}

forward_subscribable!(PlaybackWatcher, PlaybackWatcherEvent, events);

impl PlaybackWatcher {
    pub fn new(config: &Config) -> Self {
        Self {
            consecutive_updates: 0,
            last_recorded_time: None,
            monitor_timer: None,
            gap_timer: None,
            poll_interval: config.playback_poll_interval,
            stall_poll_threshold: config.stall_poll_threshold,
            video_underflow_window: config.video_underflow_window,
            allow_seeks_within_unsafe_live_window: config.allow_seeks_within_unsafe_live_window,
            events: EventTarget::queued(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<PlaybackWatcherEvent> {
        self.events.drain()
    }

    /// Start polling the media element's clock.
    pub fn start<H: Timers>(&mut self, host: &mut H) {
        if let Some(id) = self.monitor_timer.take() {
            host.clear_timer(id);
        }
        self.monitor_timer = Some(host.set_timer(self.poll_interval, TimerReason::PlaybackMonitor));
    }

    /// To call when a timer fires. Returns `false` if the timer is not this watcher's.
    pub fn on_timer<H: MediaElement + Timers>(
        &mut self,
        host: &mut H,
        content: WatchedContent<'_>,
        id: TimerId,
        reason: TimerReason,
    ) -> bool {
        match reason {
            TimerReason::PlaybackMonitor if self.monitor_timer == Some(id) => {
                self.monitor_timer = None;
                self.check_current_time(host, content);
                if self.monitor_timer.is_none() {
                    self.monitor_timer = Some(host.set_timer(self.poll_interval, reason));
                }
                true
            }
            TimerReason::GapSkip => match self.gap_timer {
                Some((gap_id, scheduled_time)) if gap_id == id => {
                    self.skip_the_gap(host, scheduled_time);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// To call on every media element event.
    pub fn on_media_event<H: MediaElement + Timers>(
        &mut self,
        host: &mut H,
        content: WatchedContent<'_>,
        event: MediaEvent,
    ) {
        match event {
            MediaEvent::Waiting => self.waiting(host, content),
            MediaEvent::Seeking
            | MediaEvent::Seeked
            | MediaEvent::Pause
            | MediaEvent::Playing
            | MediaEvent::Error => self.cancel_timer(host),
            MediaEvent::Play | MediaEvent::Ended => {}
        }
    }

    /// To call when the seekable window changed.
    pub fn on_seekable_changed<H: MediaElement>(&mut self, host: &mut H, content: WatchedContent<'_>) {
        self.fixes_bad_seeks(host, content);
    }

    pub fn dispose<H: Timers>(&mut self, host: &mut H) {
        if let Some(id) = self.monitor_timer.take() {
            host.clear_timer(id);
        }
        self.cancel_timer(host);
        self.events.clear();
    }

    fn check_current_time<H: MediaElement + Timers>(
        &mut self,
        host: &mut H,
        content: WatchedContent<'_>,
    ) {
        if host.seeking() && self.fixes_bad_seeks(host, content) {
            self.consecutive_updates = 0;
            self.last_recorded_time = Some(host.current_time());
            return;
        }
        if host.paused() || host.seeking() {
            return;
        }

        let current_time = host.current_time();
        let buffered = host.buffered();
        let unchanged = self.last_recorded_time == Some(current_time);
        let at_buffer_end = buffered
            .last_end()
            .map_or(true, |end| current_time + SAFE_TIME_DELTA >= end);
        if unchanged && at_buffer_end {
            // most likely just waiting for data, as a `waiting` event should have told
            self.tech_waiting(host, content);
            return;
        }

        if unchanged {
            self.consecutive_updates += 1;
            if self.consecutive_updates > self.stall_poll_threshold {
                self.waiting(host, content);
            }
        } else {
            self.consecutive_updates = 0;
            self.last_recorded_time = Some(current_time);
        }
    }

    fn cancel_timer<H: Timers>(&mut self, host: &mut H) {
        self.consecutive_updates = 0;
        if let Some((id, _)) = self.gap_timer.take() {
            tracing::debug!("PW: cancelling gap skip");
            host.clear_timer(id);
        }
    }

    /// Correct seeks outside of the seekable window. Returns `true` if one was corrected.
    fn fixes_bad_seeks<H: MediaElement>(&mut self, host: &mut H, content: WatchedContent<'_>) -> bool {
        if !host.seeking() {
            return false;
        }
        let seekable = content.seekable;
        let current_time = host.current_time();
        let mut seek_to = None;
        if after_seekable_window(
            seekable,
            current_time,
            content.media,
            self.allow_seeks_within_unsafe_live_window,
        ) {
            seek_to = seekable.last_end();
        }
        if before_seekable_window(seekable, current_time) {
            seek_to = seekable.start(0).map(|start| start + SAFE_TIME_DELTA);
        }
        let Some(seek_to) = seek_to else {
            return false;
        };
        tracing::info!(
            "PW: seek at {current_time} outside of seekable {}, seeking to {seek_to}",
            printable_range(seekable)
        );
        host.set_current_time(seek_to);
        true
    }

    fn waiting<H: MediaElement + Timers>(&mut self, host: &mut H, content: WatchedContent<'_>) {
        if self.tech_waiting(host, content) {
            return;
        }
        // last resort: seeking to the current time often resumes a player stalled inside a
        // buffered range, provided enough data is ahead
        let current_time = host.current_time();
        let current_range = find_range(&host.buffered(), current_time);
        let Some(range_end) = current_range.end(0) else {
            return;
        };
        if current_time + 3. <= range_end {
            self.cancel_timer(host);
            host.set_current_time(current_time);
            tracing::warn!(
                "PW: stalled at {current_time} inside buffered range {}, seeking to current time",
                printable_range(&current_range)
            );
            self.events.trigger(PlaybackWatcherEvent::UnknownWaiting);
        }
    }

    /// Try the known corrections for a stall. Returns `true` if nothing else should be done.
    fn tech_waiting<H: MediaElement + Timers>(
        &mut self,
        host: &mut H,
        content: WatchedContent<'_>,
    ) -> bool {
        let seekable = content.seekable;
        let current_time = host.current_time();
        if host.seeking() && self.fixes_bad_seeks(host, content) {
            return true;
        }
        if host.seeking() || self.gap_timer.is_some() {
            return true;
        }

        if before_seekable_window(seekable, current_time) {
            let Some(live_point) = seekable.last_end() else {
                return false;
            };
            tracing::warn!(
                "PW: fell out of the live window at {current_time}, seeking to {live_point}"
            );
            self.cancel_timer(host);
            host.set_current_time(live_point);
            self.events.trigger(PlaybackWatcherEvent::LiveResync);
            return true;
        }

        let buffered = host.buffered();
        let next_range = find_next_range(&buffered, current_time);
        if next_range.is_empty() {
            if let Some(gap) =
                gap_from_video_underflow(&buffered, current_time, self.video_underflow_window)
            {
                tracing::warn!(
                    "PW: video gap from {} to {}, seeking to current time {current_time}",
                    gap.start(),
                    gap.end()
                );
                self.cancel_timer(host);
                host.set_current_time(current_time);
                self.events.trigger(PlaybackWatcherEvent::VideoUnderflow);
                return true;
            }
            return false;
        }

        let Some(next_start) = next_range.start(0) else {
            return false;
        };
        let difference = next_start - current_time;
        tracing::info!("PW: stopped at {current_time}, skipping to {next_start} in {difference}s");
        let id = host.set_timer(difference * 1000., TimerReason::GapSkip);
        self.gap_timer = Some((id, current_time));
        true
    }

    fn skip_the_gap<H: MediaElement + Timers>(&mut self, host: &mut H, scheduled_time: f64) {
        let current_time = host.current_time();
        let next_range = find_next_range(&host.buffered(), current_time);
        self.cancel_timer(host);
        // playback may have resumed meanwhile
        if current_time != scheduled_time {
            return;
        }
        let Some(next_start) = next_range.start(0) else {
            return;
        };
        tracing::info!("PW: skipping gap from {current_time} to {next_start}");
        host.set_current_time(next_start + TIME_FUDGE_FACTOR);
        self.events.trigger(PlaybackWatcherEvent::GapSkip);
    }
}
