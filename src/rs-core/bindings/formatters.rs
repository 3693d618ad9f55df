use serde_json::json;

use crate::{
    host::CuePayload, master_playlist_controller::PlayerEvent, playlist::ByteRange,
    utils::time_ranges::TimeRanges,
};

/// Read ranges given as `[start0, end0, start1, end1...]`. A trailing odd value is ignored.
pub(crate) fn ranges_from_js(flat: &[f64]) -> TimeRanges {
    let mut ranges = TimeRanges::new();
    for pair in flat.chunks_exact(2) {
        ranges.add(pair[0], pair[1]);
    }
    ranges
}

pub(crate) fn ranges_for_js(ranges: &TimeRanges) -> Vec<f64> {
    ranges.iter().flat_map(|r| [r.start(), r.end()]).collect()
}

pub(crate) fn format_range_for_js(original: Option<ByteRange>) -> (Option<f64>, Option<f64>) {
    match original {
        None => (None, None),
        Some(range) => (Some(range.offset as f64), Some(range.last_byte() as f64)),
    }
}

/// JSON description of a cue, and its raw data for subtitles.
pub(crate) fn format_cue_for_js(payload: &CuePayload) -> (String, Option<Vec<u8>>) {
    match payload {
        CuePayload::SegmentMetadata {
            uri,
            timeline,
            bandwidth,
            resolution,
            codecs,
            byte_length,
        } => {
            let value = json!({
                "uri": uri,
                "timeline": timeline,
                "bandwidth": bandwidth,
                "resolution": resolution.map(|(width, height)| json!({ "width": width, "height": height })),
                "codecs": codecs,
                "byteLength": byte_length,
            });
            (value.to_string(), None)
        }
        CuePayload::AdCue {
            cue_out,
            ad_start,
            ad_end,
        } => {
            let value = json!({ "cueOut": cue_out, "adStart": ad_start, "adEnd": ad_end });
            (value.to_string(), None)
        }
        CuePayload::Subtitles(data) => ("{}".to_owned(), Some(data.to_vec())),
    }
}

/// JSON detail of a player event, for the events carrying information.
pub(crate) fn format_event_detail_for_js(event: &PlayerEvent) -> Option<String> {
    let value = match event {
        PlayerEvent::BlacklistPlaylist { uri, .. } => json!({ "uri": uri }),
        PlayerEvent::Usage(name) => json!({ "name": name }),
        PlayerEvent::Error(err) => json!({ "message": err.to_string() }),
        _ => return None,
    };
    Some(value.to_string())
}
