//! Duration, seekable window and time lookups over a Media Playlist's segments.

use super::{ExcludeUntil, MasterPlaylist, Playlist};
use crate::utils::time_ranges::{TimeRanges, TIME_FUDGE_FACTOR};

/// Result of a duration estimation.
#[derive(Clone, Copy, Debug, PartialEq)]
struct DurationEstimate {
    result: f64,
    /// `true` when based on an observed segment time rather than only on announced durations.
    precise: bool,
}

/// Estimate the time at which the segment with media sequence `end_sequence` starts, walking
/// backward from it.
fn backward_duration(playlist: &Playlist, end_sequence: i64) -> DurationEstimate {
    let mut result = 0.;
    let mut i = end_sequence - playlist.media_sequence as i64;
    if i >= 0 {
        if let Some(segment) = playlist.segments.get(i as usize) {
            if let Some(start) = segment.start {
                return DurationEstimate {
                    result: start,
                    precise: true,
                };
            }
            if let Some(end) = segment.end {
                return DurationEstimate {
                    result: end - segment.duration,
                    precise: true,
                };
            }
        }
    }
    while i > 0 {
        i -= 1;
        let Some(segment) = playlist.segments.get(i as usize) else {
            continue;
        };
        if let Some(end) = segment.end {
            return DurationEstimate {
                result: result + end,
                precise: true,
            };
        }
        result += segment.duration;
        if let Some(start) = segment.start {
            return DurationEstimate {
                result: result + start,
                precise: true,
            };
        }
    }
    DurationEstimate {
        result,
        precise: false,
    }
}

/// Estimate the time at which the segment with media sequence `end_sequence` starts, walking
/// forward from it.
fn forward_duration(playlist: &Playlist, end_sequence: i64) -> DurationEstimate {
    let mut result = 0.;
    let first = (end_sequence - playlist.media_sequence as i64).max(0) as usize;
    for segment in playlist.segments.iter().skip(first) {
        if let Some(start) = segment.start {
            return DurationEstimate {
                result: start - result,
                precise: true,
            };
        }
        result += segment.duration;
        if let Some(end) = segment.end {
            return DurationEstimate {
                result: end - result,
                precise: true,
            };
        }
    }
    DurationEstimate {
        result: -1.,
        precise: false,
    }
}

/// Duration between the start of the timeline and the segment with media sequence
/// `end_sequence`, `expired` being the amount of content which left the playlist.
pub fn interval_duration(playlist: &Playlist, end_sequence: Option<i64>, expired: f64) -> f64 {
    let end_sequence = end_sequence
        .unwrap_or(playlist.media_sequence as i64 + playlist.segments.len() as i64);
    if end_sequence < playlist.media_sequence as i64 {
        return 0.;
    }
    let backward = backward_duration(playlist, end_sequence);
    if backward.precise {
        return backward.result;
    }
    let forward = forward_duration(playlist, end_sequence);
    if forward.precise {
        return forward.result;
    }
    backward.result + expired
}

/// Duration of the playlist, or the time at which the segment with media sequence
/// `end_sequence` starts when given.
///
/// Returns `f64::INFINITY` for live playlists when no `end_sequence` is given.
pub fn duration(playlist: &Playlist, end_sequence: Option<i64>, expired: f64) -> f64 {
    if end_sequence.is_none() {
        if let Some(total) = playlist.total_duration {
            return total;
        }
        if !playlist.end_list {
            return f64::INFINITY;
        }
    }
    interval_duration(playlist, end_sequence, expired)
}

/// Sum of the durations of segments between `start_index` (inclusive) and `end_index`
/// (exclusive). Negative indexes count as one target duration each.
pub fn sum_durations(playlist: &Playlist, start_index: i64, end_index: i64) -> f64 {
    let (mut start, end) = if start_index > end_index {
        (end_index, start_index)
    } else {
        (start_index, end_index)
    };
    let mut durations = 0.;
    if start < 0 {
        durations += (start..end.min(0)).count() as f64 * playlist.target_duration;
        start = 0;
    }
    for i in start..end {
        if let Some(segment) = playlist.segments.get(i as usize) {
            durations += segment.duration;
        }
    }
    durations
}

/// Index of the last segment which can safely be played on a live playlist: at least three
/// target durations away from the live edge.
pub fn safe_live_index(playlist: &Playlist) -> usize {
    let Some(last) = playlist.segments.last() else {
        return 0;
    };
    let mut i = playlist.segments.len() - 1;
    let mut distance_from_end = if last.duration > 0. {
        last.duration
    } else {
        playlist.target_duration
    };
    let safe_distance = distance_from_end + playlist.target_duration * 2.;
    while i > 0 {
        i -= 1;
        distance_from_end += playlist.segments[i].duration;
        if distance_from_end >= safe_distance {
            break;
        }
    }
    i
}

/// Time at which the playlist ends, `None` if it cannot be known yet.
pub fn playlist_end(playlist: &Playlist, expired: Option<f64>, use_safe_live_end: bool) -> Option<f64> {
    if !playlist.loaded {
        return None;
    }
    if playlist.end_list {
        return Some(duration(playlist, None, 0.));
    }
    let expired = expired?;
    let end_sequence = if use_safe_live_end {
        safe_live_index(playlist)
    } else {
        playlist.segments.len()
    };
    Some(interval_duration(
        playlist,
        Some(playlist.media_sequence as i64 + end_sequence as i64),
        expired,
    ))
}

/// Range of time in which seeking is possible.
pub fn seekable(playlist: &Playlist, expired: Option<f64>) -> TimeRanges {
    let start = expired.unwrap_or(0.);
    match playlist_end(playlist, expired, true) {
        Some(end) => TimeRanges::single(start, end),
        None => TimeRanges::new(),
    }
}

/// Segment found by `get_media_info_for_time`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaInfo {
    pub media_index: usize,
    /// Estimated start time of that segment.
    pub start_time: f64,
}

/// Find the segment containing `current_time`, starting from a known sync point: the segment
/// at `start_index` starting at `start_time`.
pub fn get_media_info_for_time(
    playlist: &Playlist,
    current_time: f64,
    start_index: i64,
    start_time: f64,
) -> MediaInfo {
    let num_segments = playlist.segments.len();
    let mut time = current_time - start_time;

    if time < 0. {
        if start_index > 0 {
            let mut i = start_index - 1;
            while i >= 0 {
                if let Some(segment) = playlist.segments.get(i as usize) {
                    time += segment.duration + TIME_FUDGE_FACTOR;
                    if time > 0. {
                        return MediaInfo {
                            media_index: i as usize,
                            start_time: start_time - sum_durations(playlist, start_index, i),
                        };
                    }
                }
                i -= 1;
            }
        }
        return MediaInfo {
            media_index: 0,
            start_time: current_time,
        };
    }

    let mut start_index = start_index;
    if start_index < 0 {
        for _ in start_index..0 {
            time -= playlist.target_duration;
            if time < 0. {
                return MediaInfo {
                    media_index: 0,
                    start_time: current_time,
                };
            }
        }
        start_index = 0;
    }

    for i in start_index as usize..num_segments {
        time -= playlist.segments[i].duration + TIME_FUDGE_FACTOR;
        if time < 0. {
            return MediaInfo {
                media_index: i,
                start_time: start_time + sum_durations(playlist, start_index, i as i64),
            };
        }
    }

    MediaInfo {
        media_index: num_segments.saturating_sub(1),
        start_time: current_time,
    }
}

/// `true` if the playlist is currently excluded, be it temporarily or not.
pub fn is_blacklisted(playlist: &Playlist, now: f64) -> bool {
    match playlist.exclude_until {
        Some(ExcludeUntil::Forever) => true,
        Some(ExcludeUntil::Until(until)) => until > now,
        None => false,
    }
}

/// `true` if the playlist was permanently excluded.
pub fn is_incompatible(playlist: &Playlist) -> bool {
    playlist.exclude_until == Some(ExcludeUntil::Forever)
}

/// `true` if the playlist can be selected right now.
pub fn is_enabled(playlist: &Playlist, now: f64) -> bool {
    !playlist.disabled && !is_blacklisted(playlist, now)
}

pub fn is_disabled(playlist: &Playlist) -> bool {
    playlist.disabled
}

/// `true` if at least one segment is encrypted.
pub fn is_aes(playlist: &Playlist) -> bool {
    playlist.segments.iter().any(|s| s.key.is_some())
}

/// `true` if at least one segment has an initialization segment.
pub fn is_fmp4(playlist: &Playlist) -> bool {
    playlist.segments.iter().any(|s| s.map.is_some())
}

/// Estimate the time, in seconds, needed to load a segment of `segment_duration` seconds of
/// that playlist at `bandwidth` bits per second, `bytes_received` being already loaded.
///
/// Returns `None` if the playlist does not announce its bandwidth.
pub fn estimate_segment_request_time(
    segment_duration: f64,
    bandwidth: f64,
    playlist: &Playlist,
    bytes_received: u64,
) -> Option<f64> {
    let declared = playlist.attributes.bandwidth? as f64;
    let size = segment_duration * declared;
    Some((size - bytes_received as f64 * 8.) / bandwidth)
}

/// `true` if no enabled variant has a lower bandwidth than `media`.
pub fn is_lowest_enabled_rendition(master: &MasterPlaylist, media: &Playlist, now: f64) -> bool {
    if master.playlists.len() == 1 {
        return true;
    }
    let current = media.attributes.bandwidth.unwrap_or(u64::MAX);
    !master
        .playlists
        .iter()
        .any(|p| is_enabled(p, now) && p.attributes.bandwidth.unwrap_or(0) < current)
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[10., 10., 10.])]
    #[case(&[9.009, 9.009, 4.5, 2.002])]
    #[case(&[6.])]
    fn vod_duration_is_sum_of_segments(#[case] durations: &[f64]) {
        let playlist = media_playlist("p.m3u8", 3, durations, true);
        let expected: f64 = durations.iter().sum();
        assert!((duration(&playlist, None, 0.) - expected).abs() < 1e-9);
    }

    #[test]
    fn total_duration_overrides_and_live_is_infinite() {
        let mut playlist = media_playlist("p.m3u8", 0, &[10., 10.], false);
        assert_eq!(duration(&playlist, None, 0.), f64::INFINITY);
        playlist.total_duration = Some(42.);
        assert_eq!(duration(&playlist, None, 0.), 42.);
    }

    #[test]
    fn interval_duration_uses_known_timing() {
        let mut playlist = media_playlist("p.m3u8", 10, &[4., 4., 4., 4.], false);
        assert_eq!(interval_duration(&playlist, Some(12), 20.), 28.);
        playlist.segments[1].end = Some(50.);
        assert_eq!(interval_duration(&playlist, Some(12), 20.), 50.);
        playlist.segments[2].start = Some(60.);
        assert_eq!(interval_duration(&playlist, Some(12), 20.), 60.);
        assert_eq!(interval_duration(&playlist, Some(5), 20.), 0.);
    }

    #[rstest]
    #[case(0, 2, 8.)]
    #[case(2, 0, 8.)]
    #[case(-2, 1, 14.)]
    fn sums_durations(#[case] start: i64, #[case] end: i64, #[case] expected: f64) {
        let mut playlist = media_playlist("p.m3u8", 0, &[4., 4., 6.], false);
        playlist.target_duration = 5.;
        assert_eq!(sum_durations(&playlist, start, end), expected);
    }

    #[rstest]
    #[case(&[], 0)]
    #[case(&[10.], 0)]
    #[case(&[10., 10.], 0)]
    #[case(&[10., 10., 10., 10., 10., 10.], 3)]
    #[case(&[2., 2., 2., 2., 2., 2., 2., 2., 2., 2.], 7)]
    fn safe_live_index_stays_in_bounds(#[case] durations: &[f64], #[case] expected: usize) {
        let mut playlist = media_playlist("p.m3u8", 0, durations, false);
        playlist.target_duration = durations.first().copied().unwrap_or(10.);
        let idx = safe_live_index(&playlist);
        assert_eq!(idx, expected);
        if !durations.is_empty() {
            assert!(idx < durations.len());
        }
    }

    #[test]
    fn seekable_for_live_needs_expired_time() {
        let playlist = media_playlist("p.m3u8", 0, &[10.; 6], false);
        assert!(seekable(&playlist, None).is_empty());
        let range = seekable(&playlist, Some(100.));
        assert_eq!(range.start(0), Some(100.));
        assert_eq!(range.end(0), Some(130.));
    }

    #[test]
    fn seekable_for_vod_covers_everything() {
        let playlist = media_playlist("p.m3u8", 0, &[10.; 3], true);
        let range = seekable(&playlist, None);
        assert_eq!((range.start(0), range.end(0)), (Some(0.), Some(30.)));
    }

    #[rstest]
    #[case(0., 0, 0, 0.)]
    #[case(15., 0, 1, 10.)]
    #[case(29.99, 0, 2, 20.)]
    #[case(45., 0, 2, 45.)]
    #[case(5., 2, 0, 0.)]
    #[case(12., 2, 1, 10.)]
    fn finds_segment_for_time(
        #[case] time: f64,
        #[case] start_index: i64,
        #[case] expected_index: usize,
        #[case] expected_start: f64,
    ) {
        let playlist = media_playlist("p.m3u8", 0, &[10., 10., 10.], true);
        let start_time = start_index as f64 * 10.;
        let info = get_media_info_for_time(&playlist, time, start_index, start_time);
        assert_eq!(info.media_index, expected_index);
        assert!((info.start_time - expected_start).abs() < 1e-9);
    }

    #[test]
    fn exclusion_states() {
        let mut playlist = variant("a.m3u8", Some(1), None);
        assert!(is_enabled(&playlist, 1000.));
        playlist.exclude_until = Some(ExcludeUntil::Until(2000.));
        assert!(is_blacklisted(&playlist, 1000.));
        assert!(!is_blacklisted(&playlist, 3000.));
        assert!(!is_incompatible(&playlist));
        playlist.exclude_until = Some(ExcludeUntil::Forever);
        assert!(is_incompatible(&playlist));
        assert!(!is_enabled(&playlist, 1e15));
        playlist.exclude_until = None;
        playlist.disabled = true;
        assert!(!is_enabled(&playlist, 0.));
    }

    #[test]
    fn estimates_request_time() {
        let playlist = variant("a.m3u8", Some(1_000_000), None);
        assert_eq!(
            estimate_segment_request_time(10., 2_000_000., &playlist, 250_000),
            Some(4.)
        );
        let no_bw = variant("b.m3u8", None, None);
        assert_eq!(estimate_segment_request_time(10., 1., &no_bw, 0), None);
    }

    #[test]
    fn lowest_enabled_rendition() {
        let mut low = variant("low.m3u8", Some(100), None);
        let high = variant("high.m3u8", Some(1000), None);
        let m = master(vec![low.clone(), high.clone()]);
        assert!(is_lowest_enabled_rendition(&m, &low, 0.));
        assert!(!is_lowest_enabled_rendition(&m, &high, 0.));
        low.exclude_until = Some(ExcludeUntil::Forever);
        let m = master(vec![low, high.clone()]);
        assert!(is_lowest_enabled_rendition(&m, &high, 0.));
    }
}
