use std::{collections::BTreeMap, rc::Rc};

use url::Url;

use crate::utils::url::resolve_url;

mod duration;

pub use duration::*;

/// A byte range inside a resource, both values in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// Offset of the last byte included in that range.
    pub fn last_byte(&self) -> u64 {
        (self.offset + self.length).saturating_sub(1)
    }
}

/// Exclusion state of a variant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExcludeUntil {
    /// Temporarily excluded until that wall-clock time, in milliseconds.
    Until(f64),
    /// Permanently excluded, the variant being incompatible.
    Forever,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Attributes announced for a variant in the Multivariant Playlist.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaylistAttributes {
    pub bandwidth: Option<u64>,
    pub resolution: Option<Resolution>,
    pub codecs: Option<String>,
    /// Audio group id.
    pub audio: Option<String>,
    /// Subtitles group id.
    pub subtitles: Option<String>,
}

/// AES-128 key needed to decrypt a segment.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentKey {
    pub uri: String,
    pub resolved_uri: Url,
    /// Initialization vector, the segment's media sequence number being used when not set.
    pub iv: Option<[u8; 16]>,
}

/// Initialization segment (EXT-X-MAP).
#[derive(Clone, Debug, PartialEq)]
pub struct InitSegment {
    pub uri: String,
    pub resolved_uri: Url,
    pub byte_range: Option<ByteRange>,
}

impl InitSegment {
    /// Identity of that initialization segment, two segments sharing the same identity sharing
    /// the same data.
    pub fn id(&self) -> String {
        match self.byte_range {
            Some(br) => format!("{},{},{}", br.length, br.offset, self.resolved_uri),
            None => format!("inf,0,{}", self.resolved_uri),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub uri: String,
    pub resolved_uri: Url,
    /// Duration, in seconds, announced by the playlist.
    pub duration: f64,
    pub byte_range: Option<ByteRange>,
    pub key: Option<SegmentKey>,
    pub map: Option<InitSegment>,
    /// Discontinuity sequence number this segment belongs to.
    pub timeline: u64,
    /// `true` if a discontinuity happens just before this segment.
    pub discontinuity: bool,
    pub cue_out: Option<String>,
    pub cue_out_cont: Option<String>,
    pub cue_in: bool,
    /// Presentation time, in seconds, at which that segment starts once known.
    pub start: Option<f64>,
    /// Presentation time, in seconds, at which that segment ends once known.
    pub end: Option<f64>,
}

/// Known correspondence between a media sequence number and a presentation time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncInfo {
    pub media_sequence: u64,
    pub time: f64,
}

/// A variant, or an alternate rendition, and once fetched, its Media Playlist.
#[derive(Clone, Debug, PartialEq)]
pub struct Playlist {
    pub id: String,
    /// URI as written in the Multivariant Playlist.
    pub uri: String,
    pub resolved_uri: Url,
    pub attributes: PlaylistAttributes,
    pub exclude_until: Option<ExcludeUntil>,
    /// Disabled through the representations API.
    pub disabled: bool,
    /// `true` once the Media Playlist has been fetched at least once.
    pub loaded: bool,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    /// Indexes of the segments preceded by a discontinuity.
    pub discontinuity_starts: Vec<usize>,
    pub target_duration: f64,
    pub end_list: bool,
    /// Overrides the computed duration when set.
    pub total_duration: Option<f64>,
    pub segments: Vec<Segment>,
    pub sync_info: Option<SyncInfo>,
}

impl Playlist {
    /// Create a variant not loaded yet.
    pub fn new_variant(id: String, uri: String, resolved_uri: Url) -> Self {
        Self {
            id,
            uri,
            resolved_uri,
            attributes: PlaylistAttributes::default(),
            exclude_until: None,
            disabled: false,
            loaded: false,
            media_sequence: 0,
            discontinuity_sequence: 0,
            discontinuity_starts: vec![],
            target_duration: 0.,
            end_list: false,
            total_duration: None,
            segments: vec![],
            sync_info: None,
        }
    }

    /// Absolute media sequence number of the segment at `index`.
    pub fn sequence_of(&self, index: usize) -> u64 {
        self.media_sequence + index as u64
    }

    /// Index of the segment with the given media sequence number, if in the playlist.
    pub fn index_of(&self, media_sequence: u64) -> Option<usize> {
        let idx = media_sequence.checked_sub(self.media_sequence)? as usize;
        if idx < self.segments.len() {
            Some(idx)
        } else {
            None
        }
    }
}

/// Alternate rendition from an EXT-X-MEDIA tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Rendition {
    pub name: String,
    pub language: Option<String>,
    pub default: bool,
    pub autoselect: bool,
    /// `None` when the rendition is muxed in the variants.
    pub uri: Option<String>,
    pub resolved_uri: Option<Url>,
}

/// EXT-X-MEDIA renditions by group id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaGroups {
    pub audio: BTreeMap<String, Vec<Rendition>>,
    pub subtitles: BTreeMap<String, Vec<Rendition>>,
}

/// Multivariant Playlist and the current state of its variants.
///
/// A `MasterPlaylist` is never modified once shared: every change produces a new value with an
/// incremented `generation`, which replaces the previous one wholesale.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterPlaylist {
    pub uri: Url,
    pub playlists: Vec<Rc<Playlist>>,
    pub media_groups: MediaGroups,
    generation: u64,
}

impl MasterPlaylist {
    pub fn new(uri: Url, playlists: Vec<Playlist>, media_groups: MediaGroups) -> Self {
        Self {
            uri,
            playlists: playlists.into_iter().map(Rc::new).collect(),
            media_groups,
            generation: 0,
        }
    }

    /// Synthesize a single-variant Multivariant Playlist around a Media Playlist's URL.
    pub fn from_media_url(url: &Url) -> Self {
        let uri = url.to_string();
        let playlist = Playlist::new_variant(format!("0-{uri}"), uri, url.clone());
        Self::new(url.clone(), vec![playlist], MediaGroups::default())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn playlist(&self, uri: &str) -> Option<&Rc<Playlist>> {
        self.playlists.iter().find(|p| p.uri == uri)
    }

    pub fn playlist_by_id(&self, id: &str) -> Option<&Rc<Playlist>> {
        self.playlists.iter().find(|p| p.id == id)
    }

    /// Returns the next version of this `MasterPlaylist` where the playlist with the same URI
    /// than `playlist` is replaced by it.
    pub(crate) fn with_playlist(&self, playlist: Rc<Playlist>) -> MasterPlaylist {
        let mut next = self.clone();
        next.generation += 1;
        for p in next.playlists.iter_mut() {
            if p.uri == playlist.uri {
                *p = playlist.clone();
            }
        }
        next
    }

    /// Returns the next version of this `MasterPlaylist`, where `update` was applied to the
    /// playlist with the given URI.
    ///
    /// Returns `None` if there is no such playlist.
    pub(crate) fn map_playlist(
        &self,
        uri: &str,
        update: impl FnOnce(&mut Playlist),
    ) -> Option<MasterPlaylist> {
        let current = self.playlist(uri)?;
        let mut playlist = (**current).clone();
        update(&mut playlist);
        Some(self.with_playlist(Rc::new(playlist)))
    }

    /// Returns the next version of this `MasterPlaylist`, where `update` was applied to every
    /// playlist.
    pub(crate) fn map_playlists(&self, mut update: impl FnMut(&mut Playlist)) -> MasterPlaylist {
        let mut next = self.clone();
        next.generation += 1;
        for p in next.playlists.iter_mut() {
            update(Rc::make_mut(p));
        }
        next
    }
}

/// Merge a freshly-fetched Media Playlist into the Multivariant Playlist.
///
/// Returns `None` if the playlist is unknown or if nothing changed: same segment count, same
/// media sequence and same end state.
///
/// Segments are aligned on their media sequence number. Timing information already known for
/// a segment is kept.
pub fn update_master(master: &MasterPlaylist, media: Playlist) -> Option<MasterPlaylist> {
    let old = master.playlist(&media.uri)?;
    if old.loaded
        && old.segments.len() == media.segments.len()
        && old.end_list == media.end_list
        && old.media_sequence == media.media_sequence
    {
        return None;
    }

    let segments = if old.loaded {
        let offset = media.media_sequence as i64 - old.media_sequence as i64;
        update_segments(&old.segments, media.segments, offset)
    } else {
        media.segments
    };
    let mut merged = Playlist {
        id: old.id.clone(),
        uri: old.uri.clone(),
        resolved_uri: old.resolved_uri.clone(),
        attributes: old.attributes.clone(),
        exclude_until: old.exclude_until,
        disabled: old.disabled,
        loaded: true,
        media_sequence: media.media_sequence,
        discontinuity_sequence: media.discontinuity_sequence,
        discontinuity_starts: media.discontinuity_starts,
        target_duration: media.target_duration,
        end_list: media.end_list,
        total_duration: media.total_duration,
        segments,
        sync_info: old.sync_info.or(media.sync_info),
    };
    let base = merged.resolved_uri.clone();
    for segment in merged.segments.iter_mut() {
        resolve_segment_uris(segment, &base);
    }
    Some(master.with_playlist(Rc::new(merged)))
}

/// Align `update` on `original`, `offset` being the difference between their media sequences,
/// and bring back into `update` the timing information already known in `original`.
pub fn update_segments(original: &[Segment], update: Vec<Segment>, offset: i64) -> Vec<Segment> {
    let mut result = update;
    for (i, new_seg) in result.iter_mut().enumerate() {
        let old_idx = i as i64 + offset;
        if old_idx < 0 {
            continue;
        }
        if let Some(old_seg) = original.get(old_idx as usize) {
            if old_seg.start.is_some() {
                new_seg.start = old_seg.start;
            }
            if old_seg.end.is_some() {
                new_seg.end = old_seg.end;
            }
        }
    }
    result
}

fn resolve_segment_uris(segment: &mut Segment, base: &Url) {
    if let Some(resolved) = resolve_url(base, &segment.uri) {
        segment.resolved_uri = resolved;
    }
    if let Some(key) = segment.key.as_mut() {
        if let Some(resolved) = resolve_url(base, &key.uri) {
            key.resolved_uri = resolved;
        }
    }
    if let Some(map) = segment.map.as_mut() {
        if let Some(resolved) = resolve_url(base, &map.uri) {
            map.resolved_uri = resolved;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn media_sequence_indexes_are_strictly_increasing() {
        let playlist = media_playlist("p.m3u8", 42, &[4., 4., 4., 4.], false);
        let seqs: Vec<u64> = (0..playlist.segments.len())
            .map(|i| playlist.sequence_of(i))
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(playlist.index_of(44), Some(2));
        assert_eq!(playlist.index_of(41), None);
        assert_eq!(playlist.index_of(46), None);
    }

    #[test]
    fn update_master_returns_none_when_unchanged() {
        let loaded = media_playlist("p.m3u8", 10, &[4.; 6], false);
        let master = master(vec![loaded.clone()]);
        assert!(update_master(&master, loaded.clone()).is_none());

        let shifted = media_playlist("p.m3u8", 11, &[4.; 6], false);
        let updated = update_master(&master, shifted).expect("changed playlist");
        assert_eq!(updated.generation(), master.generation() + 1);
        assert_eq!(updated.playlist("p.m3u8").map(|p| p.media_sequence), Some(11));

        let longer = media_playlist("p.m3u8", 10, &[4.; 7], false);
        assert!(update_master(&master, longer).is_some());
    }

    #[test]
    fn update_master_ignores_unknown_playlists() {
        let master = master(vec![media_playlist("p.m3u8", 0, &[4.], false)]);
        assert!(update_master(&master, media_playlist("other.m3u8", 0, &[4.], false)).is_none());
    }

    #[test]
    fn update_master_keeps_known_timing_and_variant_state() {
        let mut old = media_playlist("p.m3u8", 10, &[4., 4., 4.], false);
        old.segments[1].start = Some(100.);
        old.segments[1].end = Some(104.);
        old.segments[2].start = Some(104.);
        old.exclude_until = Some(ExcludeUntil::Until(5000.));
        old.attributes.bandwidth = Some(1_000_000);
        let master = master(vec![old]);

        let refreshed = media_playlist("p.m3u8", 11, &[4., 4., 4.], false);
        let updated = update_master(&master, refreshed).expect("changed playlist");
        let merged = updated.playlist("p.m3u8").expect("playlist kept");
        assert_eq!(merged.segments[0].start, Some(100.));
        assert_eq!(merged.segments[0].end, Some(104.));
        assert_eq!(merged.segments[1].start, Some(104.));
        assert_eq!(merged.segments[2].start, None);
        assert_eq!(merged.exclude_until, Some(ExcludeUntil::Until(5000.)));
        assert_eq!(merged.attributes.bandwidth, Some(1_000_000));
    }

    #[test]
    fn update_master_resolves_segment_uris_against_playlist() {
        let mut variant = variant("low/index.m3u8", Some(1), None);
        variant.resolved_uri = url("http://cdn.test/live/low/index.m3u8");
        let master = master(vec![variant]);
        let mut fetched = media_playlist("low/index.m3u8", 0, &[4.], true);
        fetched.segments[0].uri = "chunk0.ts".into();
        let updated = update_master(&master, fetched).expect("first load");
        assert_eq!(
            updated.playlists[0].segments[0].resolved_uri.as_str(),
            "http://cdn.test/live/low/chunk0.ts"
        );
    }

    #[test]
    fn map_playlist_produces_new_generation() {
        let master = master(vec![variant("a.m3u8", Some(1), None)]);
        let next = master
            .map_playlist("a.m3u8", |p| p.disabled = true)
            .expect("known playlist");
        assert!(!master.playlists[0].disabled);
        assert!(next.playlists[0].disabled);
        assert!(next.generation() > master.generation());
        assert!(master.map_playlist("b.m3u8", |_| {}).is_none());
    }
}
