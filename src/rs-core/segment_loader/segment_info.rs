use std::fmt;

use crate::{media_segment_request::SegmentData, playlist::Playlist};

/// Everything known about the segment a `SegmentLoader` is currently loading.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentInfo {
    /// Identifies that segment's requests, and decryption messages.
    pub request_id: u64,
    /// URI of the playlist the segment comes from.
    pub playlist_uri: String,
    /// Index of the segment in the playlist. Shifted on live refreshes, it becomes negative if
    /// the segment left the playlist meanwhile.
    pub media_index: i64,
    pub uri: String,
    /// Only loaded to obtain timing information, not pushed.
    pub is_sync_request: bool,
    /// Expected presentation time at which the segment starts, if known.
    pub start_of_segment: Option<f64>,
    /// Timestamp offset to apply before pushing that segment, if a new one is needed.
    pub timestamp_offset: Option<f64>,
    pub timeline: u64,
    pub duration: f64,
    /// Size, in bytes, of the pushed media data.
    pub byte_length: usize,
    /// Wall-clock time, in milliseconds, at which every request ended.
    pub end_of_all_requests: Option<f64>,
    pub data: Option<SegmentData>,
}

/// Describe the segment at `media_index` in `playlist`, `None` if there is none.
pub fn generate_segment_info(
    request_id: u64,
    playlist: &Playlist,
    media_index: i64,
    start_of_segment: Option<f64>,
    is_sync_request: bool,
) -> Option<SegmentInfo> {
    if media_index < 0 {
        return None;
    }
    let segment = playlist.segments.get(media_index as usize)?;
    Some(SegmentInfo {
        request_id,
        playlist_uri: playlist.uri.clone(),
        media_index,
        uri: segment.resolved_uri.to_string(),
        is_sync_request,
        start_of_segment,
        timestamp_offset: None,
        timeline: segment.timeline,
        duration: segment.duration,
        byte_length: 0,
        end_of_all_requests: None,
        data: None,
    })
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment [{}] {} timeline {} duration {}",
            self.media_index, self.uri, self.timeline, self.duration
        )?;
        if let Some(start) = self.start_of_segment {
            write!(f, " start {start}")?;
        }
        if self.is_sync_request {
            f.write_str(" (sync request)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::test_helpers::media_playlist;
    use rstest::rstest;

    #[rstest]
    #[case(-1, false)]
    #[case(0, true)]
    #[case(2, true)]
    #[case(3, false)]
    fn only_describes_existing_segments(#[case] index: i64, #[case] exists: bool) {
        let playlist = media_playlist("p.m3u8", 7, &[4., 4., 5.], false);
        let info = generate_segment_info(1, &playlist, index, Some(3.), false);
        assert_eq!(info.is_some(), exists);
        if let Some(info) = info {
            assert_eq!(info.uri, format!("http://media.test/seg{}.ts", 7 + index));
            assert_eq!(info.playlist_uri, "p.m3u8");
        }
    }
}
