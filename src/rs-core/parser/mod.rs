//! Translation of the `m3u8-rs` object model into this crate's playlist model.
//!
//! `m3u8-rs` does the M3U8 syntax work. What is done here is everything it leaves to its users:
//! URI resolution, carrying EXT-X-KEY and EXT-X-MAP to the following segments, implicit byte
//! range offsets, discontinuity timelines and ad markers.

use std::collections::BTreeMap;

use m3u8_rs::{AlternativeMediaType, KeyMethod};
use thiserror::Error;
use url::Url;

use crate::{
    playlist::{
        ByteRange, InitSegment, MasterPlaylist, MediaGroups, Playlist, PlaylistAttributes,
        Rendition, Resolution, Segment, SegmentKey,
    },
    utils::url::resolve_url,
};

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ParsingError {
    #[error("invalid M3U8 playlist")]
    InvalidSyntax,
    #[error("expected a Media Playlist, got a Multivariant Playlist")]
    UnexpectedMultivariantPlaylist,
    #[error("invalid URI `{0}`")]
    InvalidUri(String),
}

/// Either kind of playlist, as it can be received from the initial request.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedPlaylist {
    Master(MasterPlaylist),
    Media(Playlist),
}

/// Parse the response to the initial request, which may be either a Multivariant Playlist or
/// directly a Media Playlist.
///
/// `url` is the URL the playlist was loaded from, after redirections.
pub fn parse_playlist(data: &[u8], url: &Url) -> Result<ParsedPlaylist, ParsingError> {
    match m3u8_rs::parse_playlist_res(data) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
            Ok(ParsedPlaylist::Master(convert_master(master, url)?))
        }
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
            let uri = url.to_string();
            Ok(ParsedPlaylist::Media(convert_media(
                media,
                format!("0-{uri}"),
                uri,
                url,
            )))
        }
        Err(_) => Err(ParsingError::InvalidSyntax),
    }
}

/// Parse a Media Playlist.
///
/// `uri` is the playlist's URI as written in the Multivariant Playlist, which identifies it.
/// `url` is the URL it was loaded from, against which its segments' URIs are resolved.
pub fn parse_media_playlist(data: &[u8], uri: &str, url: &Url) -> Result<Playlist, ParsingError> {
    match m3u8_rs::parse_playlist_res(data) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => Ok(convert_media(
            media,
            format!("0-{uri}"),
            uri.to_owned(),
            url,
        )),
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
            Err(ParsingError::UnexpectedMultivariantPlaylist)
        }
        Err(_) => Err(ParsingError::InvalidSyntax),
    }
}

fn convert_master(master: m3u8_rs::MasterPlaylist, url: &Url) -> Result<MasterPlaylist, ParsingError> {
    let mut playlists = vec![];
    for (i, variant) in master
        .variants
        .into_iter()
        .filter(|v| !v.is_i_frame)
        .enumerate()
    {
        let resolved_uri = resolve_url(url, &variant.uri)
            .ok_or_else(|| ParsingError::InvalidUri(variant.uri.clone()))?;
        let mut playlist = Playlist::new_variant(
            format!("{i}-{}", variant.uri),
            variant.uri,
            resolved_uri,
        );
        playlist.attributes = PlaylistAttributes {
            bandwidth: Some(variant.bandwidth),
            resolution: variant.resolution.map(|r| Resolution {
                width: r.width as u32,
                height: r.height as u32,
            }),
            codecs: variant.codecs,
            audio: variant.audio,
            subtitles: variant.subtitles,
        };
        playlists.push(playlist);
    }

    let mut media_groups = MediaGroups::default();
    for media in master.alternatives {
        let group = match media.media_type {
            AlternativeMediaType::Audio => &mut media_groups.audio,
            AlternativeMediaType::Subtitles => &mut media_groups.subtitles,
            _ => continue,
        };
        let resolved_uri = media.uri.as_deref().and_then(|u| resolve_url(url, u));
        group
            .entry(media.group_id)
            .or_insert_with(Vec::new)
            .push(Rendition {
                name: media.name,
                language: media.language,
                default: media.default,
                autoselect: media.autoselect,
                uri: media.uri,
                resolved_uri,
            });
    }

    Ok(MasterPlaylist::new(url.clone(), playlists, media_groups))
}

fn convert_media(media: m3u8_rs::MediaPlaylist, id: String, uri: String, url: &Url) -> Playlist {
    let mut playlist = Playlist::new_variant(id, uri, url.clone());
    playlist.loaded = true;
    playlist.media_sequence = media.media_sequence;
    playlist.discontinuity_sequence = media.discontinuity_sequence;
    playlist.target_duration = media.target_duration as f64;
    playlist.end_list = media.end_list;

    let mut timeline = media.discontinuity_sequence;
    let mut current_key: Option<SegmentKey> = None;
    let mut current_map: Option<InitSegment> = None;
    // end of the last byte range, per resource
    let mut next_offsets: BTreeMap<String, u64> = BTreeMap::new();

    for (i, seg) in media.segments.into_iter().enumerate() {
        if seg.discontinuity {
            timeline += 1;
            playlist.discontinuity_starts.push(i);
        }

        if let Some(key) = seg.key.as_ref() {
            current_key = match (&key.method, key.uri.as_deref()) {
                (KeyMethod::AES128, Some(key_uri)) => {
                    resolve_url(url, key_uri).map(|resolved_uri| SegmentKey {
                        uri: key_uri.to_owned(),
                        resolved_uri,
                        iv: key.iv.as_deref().and_then(parse_iv),
                    })
                }
                _ => None,
            };
        }

        if let Some(map) = seg.map.as_ref() {
            current_map = resolve_url(url, &map.uri).map(|resolved_uri| {
                let byte_range = map.byte_range.as_ref().map(|br| ByteRange {
                    length: br.length,
                    offset: br.offset.unwrap_or(0),
                });
                InitSegment {
                    uri: map.uri.clone(),
                    resolved_uri,
                    byte_range,
                }
            });
        }

        let Some(resolved_uri) = resolve_url(url, &seg.uri) else {
            tracing::warn!("PL: ignoring segment with an invalid URI: {}", seg.uri);
            continue;
        };

        let byte_range = seg.byte_range.as_ref().map(|br| {
            let offset = br
                .offset
                .unwrap_or_else(|| next_offsets.get(&seg.uri).copied().unwrap_or(0));
            next_offsets.insert(seg.uri.clone(), offset + br.length);
            ByteRange {
                length: br.length,
                offset,
            }
        });

        let mut cue_out = None;
        let mut cue_out_cont = None;
        let mut cue_in = false;
        for tag in &seg.unknown_tags {
            let name = tag.tag.trim_start_matches("#EXT-");
            match name {
                "X-CUE-OUT" => cue_out = Some(tag.rest.clone().unwrap_or_default()),
                "X-CUE-OUT-CONT" => cue_out_cont = Some(tag.rest.clone().unwrap_or_default()),
                "X-CUE-IN" => cue_in = true,
                _ => {}
            }
        }

        playlist.segments.push(Segment {
            uri: seg.uri,
            resolved_uri,
            duration: seg.duration as f64,
            byte_range,
            key: current_key.clone(),
            map: current_map.clone(),
            timeline,
            discontinuity: seg.discontinuity,
            cue_out,
            cue_out_cont,
            cue_in,
            start: None,
            end: None,
        });
    }

    if playlist.target_duration <= 0. {
        playlist.target_duration = playlist
            .segments
            .iter()
            .map(|s| s.duration)
            .fold(0., f64::max)
            .ceil();
    }
    playlist
}

/// Parse an EXT-X-KEY `IV` attribute, a hexadecimal 128 bits value.
pub(crate) fn parse_iv(iv: &str) -> Option<[u8; 16]> {
    let hex = iv
        .trim()
        .strip_prefix("0x")
        .or_else(|| iv.trim().strip_prefix("0X"))?;
    if hex.is_empty() || hex.len() > 32 {
        return None;
    }
    u128::from_str_radix(hex, 16).ok().map(u128::to_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("valid test url")
    }

    const MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"French\",LANGUAGE=\"fr\",DEFAULT=NO,AUTOSELECT=YES,URI=\"audio/fr.m3u8\"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=NO,AUTOSELECT=NO,URI=\"subs/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=416x234,CODECS=\"avc1.4d400d,mp4a.40.2\",AUDIO=\"aud\",SUBTITLES=\"subs\"
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aud\"
https://other.test/mid/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:7
#EXT-X-DISCONTINUITY-SEQUENCE:2
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x00000000000000000000000000000001
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"
#EXTINF:10.0,
#EXT-X-BYTERANGE:1000@720
media.mp4
#EXTINF:10.0,
#EXT-X-BYTERANGE:2000
media.mp4
#EXT-X-KEY:METHOD=NONE
#EXT-X-DISCONTINUITY
#EXTINF:8.5,
#EXT-X-CUE-OUT:30
other.mp4
#EXT-X-CUE-IN
#EXTINF:9.0,
last.mp4
#EXT-X-ENDLIST
";

    #[test]
    fn parses_multivariant_playlists() {
        let parsed = parse_playlist(MASTER.as_bytes(), &url("http://cdn.test/live/master.m3u8"))
            .expect("valid playlist");
        let ParsedPlaylist::Master(master) = parsed else {
            panic!("expected a Multivariant Playlist");
        };
        assert_eq!(master.playlists.len(), 2);
        let low = &master.playlists[0];
        assert_eq!(low.id, "0-low/index.m3u8");
        assert_eq!(low.resolved_uri.as_str(), "http://cdn.test/live/low/index.m3u8");
        assert_eq!(low.attributes.bandwidth, Some(500_000));
        assert_eq!(
            low.attributes.resolution,
            Some(Resolution {
                width: 416,
                height: 234
            })
        );
        assert_eq!(low.attributes.audio.as_deref(), Some("aud"));
        assert_eq!(low.attributes.subtitles.as_deref(), Some("subs"));
        assert!(!low.loaded);
        assert_eq!(
            master.playlists[1].resolved_uri.as_str(),
            "https://other.test/mid/index.m3u8"
        );

        let audio = &master.media_groups.audio["aud"];
        assert_eq!(audio.len(), 2);
        assert!(audio[0].default);
        assert_eq!(
            audio[1].resolved_uri.as_ref().map(Url::as_str),
            Some("http://cdn.test/live/audio/fr.m3u8")
        );
        assert_eq!(master.media_groups.subtitles["subs"].len(), 1);
    }

    #[test]
    fn wraps_media_playlists() {
        let parsed = parse_playlist(MEDIA.as_bytes(), &url("http://cdn.test/v/index.m3u8"))
            .expect("valid playlist");
        let ParsedPlaylist::Media(media) = parsed else {
            panic!("expected a Media Playlist");
        };
        assert_eq!(media.uri, "http://cdn.test/v/index.m3u8");
        assert!(media.loaded);
        assert!(media.end_list);
    }

    #[test]
    fn converts_media_playlist_segments() {
        let media = parse_media_playlist(
            MEDIA.as_bytes(),
            "v/index.m3u8",
            &url("http://cdn.test/v/index.m3u8"),
        )
        .expect("valid playlist");
        assert_eq!(media.uri, "v/index.m3u8");
        assert_eq!(media.media_sequence, 7);
        assert_eq!(media.discontinuity_sequence, 2);
        assert_eq!(media.target_duration, 10.);
        assert_eq!(media.segments.len(), 4);
        assert_eq!(media.discontinuity_starts, vec![2]);

        let first = &media.segments[0];
        assert_eq!(first.resolved_uri.as_str(), "http://cdn.test/v/media.mp4");
        assert_eq!(
            first.byte_range,
            Some(ByteRange {
                length: 1000,
                offset: 720
            })
        );
        let key = first.key.as_ref().expect("encrypted segment");
        assert_eq!(key.resolved_uri.as_str(), "http://cdn.test/v/key.bin");
        assert_eq!(key.iv.map(|iv| iv[15]), Some(1));
        let map = first.map.as_ref().expect("init segment");
        assert_eq!(map.id(), "720,0,http://cdn.test/v/init.mp4");

        let second = &media.segments[1];
        assert_eq!(
            second.byte_range,
            Some(ByteRange {
                length: 2000,
                offset: 1720
            })
        );
        assert!(second.key.is_some());
        assert!(second.map.is_some());
        assert_eq!(second.timeline, 2);

        let third = &media.segments[2];
        assert!(third.key.is_none());
        assert!(third.discontinuity);
        assert_eq!(third.timeline, 3);
        assert_eq!(third.cue_out.as_deref(), Some("30"));
        assert!(media.segments[3].cue_in);
    }

    #[test]
    fn refuses_multivariant_as_media() {
        assert_eq!(
            parse_media_playlist(MASTER.as_bytes(), "x", &url("http://cdn.test/x.m3u8")),
            Err(ParsingError::UnexpectedMultivariantPlaylist)
        );
    }

    #[rstest]
    #[case("0x00000000000000000000000000000001", Some(1u128))]
    #[case("0X0A", Some(10u128))]
    #[case("0xffffffffffffffffffffffffffffffff", Some(u128::MAX))]
    #[case("1234", None)]
    #[case("0x", None)]
    #[case("0xzz", None)]
    fn parses_ivs(#[case] iv: &str, #[case] expected: Option<u128>) {
        assert_eq!(parse_iv(iv), expected.map(u128::to_be_bytes));
    }
}
