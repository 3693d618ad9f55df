use std::{ops::Index, slice::Iter};

/// Tolerance, in seconds, under which two media times are considered the same.
pub const TIME_FUDGE_FACTOR: f64 = 1. / 30.;

/// Safety margin, in seconds, used when checking if a time is inside a range.
pub const SAFE_TIME_DELTA: f64 = TIME_FUDGE_FACTOR * 3.;

/// Represent a range of time, from a start to an end, generally in seconds
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeRange {
    start: f64,
    end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Returns the start time of the range
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Returns the end time of the range
    pub fn end(&self) -> f64 {
        self.end
    }
}

/// Abstracts non-contiguous chronological ranges of time, generally expressed in seconds.
///
/// Ranges are kept sorted and never overlap.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeRanges {
    ranges: Vec<TimeRange>,
}

impl TimeRanges {
    /// Create a new empty `TimeRanges` object
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `TimeRanges` from a list of `(start, end)` tuples, merging overlapping ones.
    pub fn from_ranges(ranges: &[(f64, f64)]) -> Self {
        let mut ret = Self::new();
        for &(start, end) in ranges {
            ret.add(start, end);
        }
        ret
    }

    /// Create a `TimeRanges` with a single range.
    pub fn single(start: f64, end: f64) -> Self {
        Self {
            ranges: vec![TimeRange { start, end }],
        }
    }

    /// Add a range of time to that `TimeRanges` object, merging it with the ranges that are
    /// already there.
    pub fn add(&mut self, start: f64, end: f64) {
        if end < start {
            return;
        }
        let mut merged = TimeRange { start, end };
        let mut inserted = false;
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        for range in std::mem::take(&mut self.ranges) {
            if range.end < merged.start {
                ranges.push(range);
            } else if range.start > merged.end {
                if !inserted {
                    ranges.push(merged);
                    inserted = true;
                }
                ranges.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }
        if !inserted {
            ranges.push(merged);
        }
        self.ranges = ranges;
    }

    /// Remove a range of time, splitting the ranges partially covered by it.
    pub fn remove(&mut self, start: f64, end: f64) {
        if !(end > start) {
            return;
        }
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        for range in std::mem::take(&mut self.ranges) {
            if range.end <= start || range.start >= end {
                ranges.push(range);
                continue;
            }
            if range.start < start {
                ranges.push(TimeRange {
                    start: range.start,
                    end: start,
                });
            }
            if range.end > end {
                ranges.push(TimeRange {
                    start: end,
                    end: range.end,
                });
            }
        }
        self.ranges = ranges;
    }

    /// Returns the number of non-contiguous ranges in this `TimeRanges` object
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the starting time of the range whose index is given in argument.
    ///
    /// Returns `None` if the given index is superior or equal to the number of actual ranges.
    pub fn start(&self, idx: usize) -> Option<f64> {
        self.ranges.get(idx).map(|r| r.start)
    }

    /// Returns the ending time of the range whose index is given in argument.
    ///
    /// Returns `None` if the given index is superior or equal to the number of actual ranges.
    pub fn end(&self, idx: usize) -> Option<f64> {
        self.ranges.get(idx).map(|r| r.end)
    }

    /// Returns the end of the last range, if one.
    pub fn last_end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.end)
    }

    /// Returns the range containing the given position.
    ///
    /// Returns `None` if no range in this `TimeRanges` object contains it.
    pub fn range_for(&self, pos: f64) -> Option<&TimeRange> {
        self.ranges
            .iter()
            .find(|r| pos >= r.start && pos < r.end)
    }

    pub fn iter(&self) -> Iter<'_, TimeRange> {
        self.ranges.iter()
    }

    fn filter(&self, predicate: impl Fn(&TimeRange) -> bool) -> TimeRanges {
        TimeRanges {
            ranges: self.ranges.iter().copied().filter(|r| predicate(r)).collect(),
        }
    }
}

impl Index<usize> for TimeRanges {
    type Output = TimeRange;
    fn index(&self, index: usize) -> &Self::Output {
        &self.ranges[index]
    }
}

impl<'a> IntoIterator for &'a TimeRanges {
    type Item = &'a TimeRange;
    type IntoIter = Iter<'a, TimeRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

/// Returns the ranges containing `time`, with a `SAFE_TIME_DELTA` tolerance on both sides.
pub fn find_range(buffered: &TimeRanges, time: f64) -> TimeRanges {
    buffered.filter(|r| r.start - SAFE_TIME_DELTA <= time && r.end + SAFE_TIME_DELTA >= time)
}

/// Returns the ranges starting after `time`.
pub fn find_next_range(buffered: &TimeRanges, time: f64) -> TimeRanges {
    buffered.filter(|r| r.start - TIME_FUDGE_FACTOR >= time)
}

/// Returns the holes between consecutive buffered ranges.
pub fn find_gaps(buffered: &TimeRanges) -> TimeRanges {
    if buffered.len() < 2 {
        return TimeRanges::new();
    }
    let ranges = buffered
        .ranges
        .windows(2)
        .map(|w| TimeRange {
            start: w[0].end,
            end: w[1].start,
        })
        .collect();
    TimeRanges { ranges }
}

/// Returns the intersection between two sets of ranges.
pub fn buffer_intersection(a: &TimeRanges, b: &TimeRanges) -> TimeRanges {
    let mut ret = TimeRanges::new();
    for ra in a {
        for rb in b {
            let start = ra.start.max(rb.start);
            let end = ra.end.min(rb.end);
            if start < end {
                ret.add(start, end);
            }
        }
    }
    ret
}

/// Seconds of playback, at the given rate, until the end of the last buffered range is
/// reached.
pub fn time_until_rebuffer(buffered: &TimeRanges, current_time: f64, playback_rate: f64) -> f64 {
    let buffered_end = buffered.last_end().unwrap_or(0.);
    let rate = if playback_rate > 0. { playback_rate } else { 1. };
    (buffered_end - current_time) / rate
}

/// Format ranges as `start => end` pairs, for logs.
pub fn printable_range(ranges: &TimeRanges) -> String {
    ranges
        .iter()
        .map(|r| format!("{} => {}", r.start, r.end))
        .collect::<Vec<_>>()
        .join(", ")
}
