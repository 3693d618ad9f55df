//! Correspondence between positions in Media Playlists and presentation times.

use std::collections::BTreeMap;

use crate::{
    host::SegmentProbe,
    playlist::{sum_durations, Playlist, SyncInfo},
    utils::event_target::{forward_subscribable, Event, EventTarget, Subscribable},
};

/// A known presentation time for the segment at `segment_index`.
///
/// `segment_index` is relative to the playlist's first segment and may be negative when the
/// known segment already left the playlist.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncPoint {
    pub time: f64,
    pub segment_index: i64,
}

/// Ways of finding a sync point, from the most to the least trusted on ties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Content with a known duration starts at `0`.
    Vod,
    /// A segment of the current timeline which has already been buffered.
    Segment,
    /// The start of a discontinuity whose time is known.
    Discontinuity,
    /// The playlist's sync information, kept when its segments expire.
    Playlist,
}

const STRATEGIES: [SyncStrategy; 4] = [
    SyncStrategy::Vod,
    SyncStrategy::Segment,
    SyncStrategy::Discontinuity,
    SyncStrategy::Playlist,
];

#[derive(Clone, Debug, PartialEq)]
pub enum SyncControllerEvent {
    /// A playlist received new sync information.
    SyncInfoUpdate,
    /// A new timestamp offset was used for a timeline.
    TimestampOffset,
}

impl Event for SyncControllerEvent {
    fn name(&self) -> &'static str {
        match self {
            SyncControllerEvent::SyncInfoUpdate => "syncinfoupdate",
            SyncControllerEvent::TimestampOffset => "timestampoffset",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct TimelineMapping {
    /// Presentation time at which the timeline was first appended.
    time: f64,
    /// What to add to a media time of that timeline to obtain a presentation time.
    mapping: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct DiscontinuitySync {
    time: f64,
    /// Distance, in segments, between the discontinuity and the segment its time was derived
    /// from. `0` is exact.
    accuracy: usize,
}

/// What the segment loader knows about a segment it just loaded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbedSegment {
    pub media_index: usize,
    pub timeline: u64,
    /// Presentation time at which the segment is expected to start.
    pub start_of_segment: f64,
    /// `true` if a new timestamp offset is applied for that segment.
    pub timestamp_offset_changed: bool,
}

pub struct SyncController {
    timelines: BTreeMap<u64, TimelineMapping>,
    discontinuities: BTreeMap<u64, DiscontinuitySync>,
    events: EventTarget<SyncControllerEvent>,
}

forward_subscribable!(SyncController, SyncControllerEvent, events);

impl SyncController {
    pub fn new() -> Self {
        Self {
            timelines: BTreeMap::new(),
            discontinuities: BTreeMap::new(),
            events: EventTarget::queued(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<SyncControllerEvent> {
        self.events.drain()
    }

    /// Find the sync point closest to `current_time`.
    pub fn get_sync_point(
        &self,
        playlist: &Playlist,
        duration: f64,
        current_timeline: Option<u64>,
        current_time: f64,
    ) -> Option<SyncPoint> {
        let candidates = self.run_strategies(playlist, duration, current_timeline, current_time);
        select_closest(&candidates, |p| (p.time - current_time).abs())
    }

    /// Estimate the amount of time which already left a live playlist.
    pub fn get_expired_time(&self, playlist: &Playlist, duration: f64) -> Option<f64> {
        let candidates =
            self.run_strategies(playlist, duration, Some(playlist.discontinuity_sequence), 0.);
        let sync_point = select_closest(&candidates, |p| p.segment_index.abs() as f64)?;
        let time = if sync_point.segment_index > 0 {
            -sync_point.time
        } else {
            sync_point.time
        };
        Some((time + sum_durations(playlist, sync_point.segment_index, 0)).abs())
    }

    /// Carry timing information from segments which left `old` into `new`'s sync info.
    ///
    /// Returns `true` if `new` received sync information.
    pub fn save_expired_segment_info(&mut self, old: &Playlist, new: &mut Playlist) -> bool {
        let diff = new.media_sequence as i64 - old.media_sequence as i64;
        let mut i = diff - 1;
        while i >= 0 {
            if let Some(start) = old.segments.get(i as usize).and_then(|s| s.start) {
                new.sync_info = Some(SyncInfo {
                    media_sequence: old.media_sequence + i as u64,
                    time: start,
                });
                tracing::debug!(
                    "SC: saved expired segment info, sequence {} at {start}",
                    old.media_sequence + i as u64
                );
                self.events.trigger(SyncControllerEvent::SyncInfoUpdate);
                return true;
            }
            i -= 1;
        }
        false
    }

    /// Record the timing of a loaded segment into `playlist`, from what the host read from it.
    ///
    /// Returns `true` if the segment's presentation time could be deduced.
    pub fn probe_segment_info(
        &mut self,
        playlist: &mut Playlist,
        segment: ProbedSegment,
        timing: &SegmentProbe,
    ) -> bool {
        if !self.calculate_segment_time_mapping(playlist, segment, timing) {
            return false;
        }
        self.save_discontinuity_sync_info(playlist, segment);
        if playlist.sync_info.is_none() {
            if let Some(start) = playlist.segments.get(segment.media_index).and_then(|s| s.start) {
                playlist.sync_info = Some(SyncInfo {
                    media_sequence: playlist.sequence_of(segment.media_index),
                    time: start,
                });
            }
        }
        true
    }

    /// Presentation time at which the given timeline was first appended.
    pub fn timestamp_offset_for_timeline(&self, timeline: u64) -> Option<f64> {
        self.timelines.get(&timeline).map(|t| t.time)
    }

    /// Offset between media times of the given timeline and presentation times.
    pub fn mapping_for_timeline(&self, timeline: u64) -> Option<f64> {
        self.timelines.get(&timeline).map(|t| t.mapping)
    }

    fn run_strategies(
        &self,
        playlist: &Playlist,
        duration: f64,
        current_timeline: Option<u64>,
        current_time: f64,
    ) -> Vec<(SyncStrategy, SyncPoint)> {
        STRATEGIES
            .iter()
            .filter_map(|strategy| {
                let point = match strategy {
                    SyncStrategy::Vod => vod_sync_point(duration),
                    SyncStrategy::Segment => {
                        segment_sync_point(playlist, current_timeline, current_time)
                    }
                    SyncStrategy::Discontinuity => {
                        self.discontinuity_sync_point(playlist, current_time)
                    }
                    SyncStrategy::Playlist => playlist_sync_point(playlist),
                };
                point.map(|p| (*strategy, p))
            })
            .collect()
    }

    fn discontinuity_sync_point(&self, playlist: &Playlist, current_time: f64) -> Option<SyncPoint> {
        let mut sync_point = None;
        let mut last_distance: Option<f64> = None;
        for (i, segment_index) in playlist.discontinuity_starts.iter().enumerate() {
            let discontinuity = playlist.discontinuity_sequence + i as u64 + 1;
            let Some(sync) = self.discontinuities.get(&discontinuity) else {
                continue;
            };
            let distance = (current_time - sync.time).abs();
            match last_distance {
                Some(last) if last < distance => break,
                _ => {
                    last_distance = Some(distance);
                    sync_point = Some(SyncPoint {
                        time: sync.time,
                        segment_index: *segment_index as i64,
                    });
                }
            }
        }
        sync_point
    }

    fn calculate_segment_time_mapping(
        &mut self,
        playlist: &mut Playlist,
        segment: ProbedSegment,
        timing: &SegmentProbe,
    ) -> bool {
        let Some(seg) = playlist.segments.get_mut(segment.media_index) else {
            return false;
        };
        if segment.timestamp_offset_changed {
            let mapping = TimelineMapping {
                time: segment.start_of_segment,
                mapping: segment.start_of_segment - timing.start,
            };
            self.timelines.insert(segment.timeline, mapping);
            tracing::debug!(
                "SC: timeline {} mapped with offset {}",
                segment.timeline,
                mapping.mapping
            );
            self.events.trigger(SyncControllerEvent::TimestampOffset);
            seg.start = Some(segment.start_of_segment);
            seg.end = Some(timing.end + mapping.mapping);
        } else if let Some(mapping) = self.timelines.get(&segment.timeline) {
            seg.start = Some(timing.start + mapping.mapping);
            seg.end = Some(timing.end + mapping.mapping);
        } else {
            return false;
        }
        true
    }

    fn save_discontinuity_sync_info(&mut self, playlist: &Playlist, segment: ProbedSegment) {
        let Some(seg) = playlist.segments.get(segment.media_index) else {
            return;
        };
        if seg.discontinuity {
            if let Some(start) = seg.start {
                self.discontinuities
                    .insert(seg.timeline, DiscontinuitySync { time: start, accuracy: 0 });
            }
            return;
        }
        for (i, segment_index) in playlist.discontinuity_starts.iter().enumerate() {
            let discontinuity = playlist.discontinuity_sequence + i as u64 + 1;
            let index_diff = *segment_index as i64 - segment.media_index as i64;
            let accuracy = index_diff.unsigned_abs() as usize;
            let better = self
                .discontinuities
                .get(&discontinuity)
                .map_or(true, |d| d.accuracy > accuracy);
            if !better {
                continue;
            }
            let time = if index_diff < 0 {
                seg.start.map(|start| {
                    start
                        - sum_durations(
                            playlist,
                            segment.media_index as i64,
                            *segment_index as i64,
                        )
                })
            } else {
                seg.end.map(|end| {
                    end + sum_durations(
                        playlist,
                        segment.media_index as i64 + 1,
                        *segment_index as i64,
                    )
                })
            };
            if let Some(time) = time {
                self.discontinuities
                    .insert(discontinuity, DiscontinuitySync { time, accuracy });
            }
        }
    }
}

impl Default for SyncController {
    fn default() -> Self {
        Self::new()
    }
}

fn vod_sync_point(duration: f64) -> Option<SyncPoint> {
    if duration.is_finite() {
        Some(SyncPoint {
            time: 0.,
            segment_index: 0,
        })
    } else {
        None
    }
}

fn segment_sync_point(
    playlist: &Playlist,
    current_timeline: Option<u64>,
    current_time: f64,
) -> Option<SyncPoint> {
    let current_timeline = current_timeline?;
    let mut sync_point = None;
    let mut last_distance: Option<f64> = None;
    for (i, segment) in playlist.segments.iter().enumerate() {
        if segment.timeline != current_timeline {
            continue;
        }
        let Some(start) = segment.start else {
            continue;
        };
        let distance = (current_time - start).abs();
        match last_distance {
            Some(last) if last < distance => break,
            _ => {
                last_distance = Some(distance);
                sync_point = Some(SyncPoint {
                    time: start,
                    segment_index: i as i64,
                });
            }
        }
    }
    sync_point
}

fn playlist_sync_point(playlist: &Playlist) -> Option<SyncPoint> {
    playlist.sync_info.map(|info| SyncPoint {
        time: info.time,
        segment_index: info.media_sequence as i64 - playlist.media_sequence as i64,
    })
}

/// The candidate with the smallest `distance`, the earliest strategy winning ties.
fn select_closest(
    candidates: &[(SyncStrategy, SyncPoint)],
    distance: impl Fn(&SyncPoint) -> f64,
) -> Option<SyncPoint> {
    let mut best: Option<(SyncStrategy, SyncPoint, f64)> = None;
    for (strategy, point) in candidates {
        let d = distance(point);
        if best.map_or(true, |(_, _, best_d)| d < best_d) {
            best = Some((*strategy, *point, d));
        }
    }
    best.map(|(strategy, point, _)| {
        tracing::trace!("SC: sync point from {strategy:?}: {point:?}");
        point
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::test_helpers::media_playlist;
    use rstest::rstest;

    fn probe(start: f64, end: f64) -> SegmentProbe {
        SegmentProbe {
            start,
            end,
            contains_audio: true,
            contains_video: true,
        }
    }

    #[test]
    fn vod_starts_at_zero() {
        let sc = SyncController::new();
        let playlist = media_playlist("p.m3u8", 0, &[10.; 3], true);
        assert_eq!(
            sc.get_sync_point(&playlist, 30., Some(0), 12.),
            Some(SyncPoint {
                time: 0.,
                segment_index: 0
            })
        );
    }

    #[test]
    fn live_without_timing_has_no_sync_point() {
        let sc = SyncController::new();
        let playlist = media_playlist("p.m3u8", 100, &[10.; 3], false);
        assert_eq!(sc.get_sync_point(&playlist, f64::INFINITY, Some(0), 0.), None);
        assert_eq!(sc.get_expired_time(&playlist, f64::INFINITY), None);
    }

    #[test]
    fn picks_closest_buffered_segment() {
        let sc = SyncController::new();
        let mut playlist = media_playlist("p.m3u8", 100, &[10.; 5], false);
        for (i, seg) in playlist.segments.iter_mut().enumerate() {
            seg.start = Some(500. + i as f64 * 10.);
        }
        assert_eq!(
            sc.get_sync_point(&playlist, f64::INFINITY, Some(0), 523.),
            Some(SyncPoint {
                time: 520.,
                segment_index: 2
            })
        );
    }

    #[test]
    fn playlist_sync_info_can_point_before_window() {
        let sc = SyncController::new();
        let mut playlist = media_playlist("p.m3u8", 100, &[10.; 3], false);
        playlist.target_duration = 10.;
        playlist.sync_info = Some(SyncInfo {
            media_sequence: 98,
            time: 400.,
        });
        assert_eq!(
            sc.get_sync_point(&playlist, f64::INFINITY, Some(0), 0.),
            Some(SyncPoint {
                time: 400.,
                segment_index: -2
            })
        );
        assert_eq!(sc.get_expired_time(&playlist, f64::INFINITY), Some(420.));
    }

    #[test]
    fn expired_time_from_later_segment() {
        let sc = SyncController::new();
        let mut playlist = media_playlist("p.m3u8", 100, &[10.; 4], false);
        playlist.segments[2].start = Some(350.);
        assert_eq!(sc.get_expired_time(&playlist, f64::INFINITY), Some(330.));
    }

    #[rstest]
    #[case(103, Some((102, 120.)))]
    #[case(101, Some((100, 100.)))]
    #[case(100, None)]
    fn saves_expired_segment_info(#[case] new_sequence: u64, #[case] expected: Option<(u64, f64)>) {
        let mut sc = SyncController::new();
        let mut old = media_playlist("p.m3u8", 100, &[10.; 4], false);
        old.segments[0].start = Some(100.);
        old.segments[2].start = Some(120.);
        let mut new = media_playlist("p.m3u8", new_sequence, &[10.; 4], false);
        let saved = sc.save_expired_segment_info(&old, &mut new);
        assert_eq!(saved, expected.is_some());
        assert_eq!(
            new.sync_info.map(|s| (s.media_sequence, s.time)),
            expected
        );
        assert_eq!(
            sc.drain_events().len(),
            if expected.is_some() { 1 } else { 0 }
        );
    }

    #[test]
    fn maps_timelines_and_records_segment_times() {
        let mut sc = SyncController::new();
        let mut playlist = media_playlist("p.m3u8", 0, &[10.; 3], true);

        let first = ProbedSegment {
            media_index: 0,
            timeline: 0,
            start_of_segment: 0.,
            timestamp_offset_changed: true,
        };
        assert!(sc.probe_segment_info(&mut playlist, first, &probe(10., 20.)));
        assert_eq!(sc.mapping_for_timeline(0), Some(-10.));
        assert_eq!(sc.timestamp_offset_for_timeline(0), Some(0.));
        assert_eq!(playlist.segments[0].start, Some(0.));
        assert_eq!(playlist.segments[0].end, Some(10.));
        assert_eq!(
            playlist.sync_info,
            Some(SyncInfo {
                media_sequence: 0,
                time: 0.
            })
        );
        assert_eq!(sc.drain_events(), vec![SyncControllerEvent::TimestampOffset]);

        let second = ProbedSegment {
            media_index: 1,
            timeline: 0,
            start_of_segment: 10.,
            timestamp_offset_changed: false,
        };
        assert!(sc.probe_segment_info(&mut playlist, second, &probe(20., 30.)));
        assert_eq!(playlist.segments[1].start, Some(10.));
        assert_eq!(playlist.segments[1].end, Some(20.));

        let unknown_timeline = ProbedSegment {
            media_index: 2,
            timeline: 4,
            start_of_segment: 20.,
            timestamp_offset_changed: false,
        };
        assert!(!sc.probe_segment_info(&mut playlist, unknown_timeline, &probe(0., 10.)));
        assert_eq!(playlist.segments[2].start, None);
    }

    #[test]
    fn derives_discontinuity_times() {
        let mut sc = SyncController::new();
        let mut playlist = media_playlist("p.m3u8", 0, &[10., 10., 6., 10.], true);
        playlist.discontinuity_starts = vec![2];
        playlist.segments[2].discontinuity = true;
        playlist.segments[2].timeline = 1;
        playlist.segments[3].timeline = 1;

        let first = ProbedSegment {
            media_index: 0,
            timeline: 0,
            start_of_segment: 0.,
            timestamp_offset_changed: true,
        };
        sc.probe_segment_info(&mut playlist, first, &probe(0., 10.));

        // from segment 0, the discontinuity at index 2 starts after segments 0 and 1
        let point = sc.discontinuity_sync_point(&playlist, 25.);
        assert_eq!(
            point,
            Some(SyncPoint {
                time: 20.,
                segment_index: 2
            })
        );

        let third = ProbedSegment {
            media_index: 2,
            timeline: 1,
            start_of_segment: 21.,
            timestamp_offset_changed: true,
        };
        sc.probe_segment_info(&mut playlist, third, &probe(1000., 1006.));
        assert_eq!(
            sc.discontinuity_sync_point(&playlist, 25.),
            Some(SyncPoint {
                time: 21.,
                segment_index: 2
            })
        );
    }
}
