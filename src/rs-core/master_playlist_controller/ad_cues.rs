use crate::{
    host::{Cue, CuePayload, TextTrackKind, TextTrackSink},
    playlist::Playlist,
};

#[derive(Clone, Debug, PartialEq)]
struct AdCue {
    start: f64,
    end: f64,
    cue_out: String,
    ad_start: f64,
    ad_end: f64,
}

impl AdCue {
    fn to_cue(&self) -> Cue {
        Cue {
            start: self.start,
            end: self.end,
            payload: CuePayload::AdCue {
                cue_out: self.cue_out.clone(),
                ad_start: self.ad_start,
                ad_end: self.ad_end,
            },
        }
    }
}

/// Ad breaks announced in the main Media Playlist, exposed on the `CueTags` text track.
///
/// A cue spans the segments of an ad break seen so far. It grows as live refreshes bring new
/// segments and is closed by a cue-in marker.
#[derive(Debug, Default)]
pub(super) struct AdCues {
    cues: Vec<AdCue>,
}

impl AdCues {
    /// Walk `media`'s segments, its first one starting at `offset`, and create or extend the
    /// corresponding cues.
    pub fn update<H: TextTrackSink>(&mut self, host: &mut H, media: &Playlist, offset: f64) {
        let mut media_time = offset;
        let mut current: Option<usize> = None;
        for segment in &media.segments {
            if current.is_none() {
                current = self.find(media_time + segment.duration / 2.);
            }
            match current {
                Some(idx) => {
                    if segment.cue_in {
                        self.resize(host, idx, media_time, Some(media_time));
                        media_time += segment.duration;
                        current = None;
                        continue;
                    }
                    // already covered by a previous update
                    if media_time < self.cues[idx].end {
                        media_time += segment.duration;
                        continue;
                    }
                    let end = self.cues[idx].end + segment.duration;
                    self.resize(host, idx, end, None);
                }
                None => {
                    if let Some(cue_out) = segment.cue_out.as_deref() {
                        current = Some(self.add(
                            host,
                            AdCue {
                                start: media_time,
                                end: media_time + segment.duration,
                                cue_out: cue_out.to_owned(),
                                ad_start: media_time,
                                ad_end: media_time + parse_cue_out(cue_out),
                            },
                        ));
                    }
                    if let Some(cont) = segment.cue_out_cont.as_deref() {
                        let (ad_offset, ad_total) = parse_cue_out_cont(cont);
                        let ad_start = media_time - ad_offset;
                        current = Some(self.add(
                            host,
                            AdCue {
                                start: media_time,
                                end: media_time + segment.duration,
                                cue_out: String::new(),
                                ad_start,
                                ad_end: ad_start + ad_total,
                            },
                        ));
                    }
                }
            }
            media_time += segment.duration;
        }
    }

    /// Remove every cue from the host.
    pub fn clear<H: TextTrackSink>(&mut self, host: &mut H) {
        for cue in self.cues.drain(..) {
            host.remove_cues(TextTrackKind::CueTags, cue.start, cue.end);
        }
    }

    fn find(&self, time: f64) -> Option<usize> {
        self.cues
            .iter()
            .position(|c| time >= c.ad_start && time <= c.ad_end)
    }

    fn add<H: TextTrackSink>(&mut self, host: &mut H, cue: AdCue) -> usize {
        tracing::debug!(
            "MPC: ad break from {} to {} (cue at {})",
            cue.ad_start,
            cue.ad_end,
            cue.start
        );
        host.add_cue(TextTrackKind::CueTags, cue.to_cue());
        self.cues.push(cue);
        self.cues.len() - 1
    }

    fn resize<H: TextTrackSink>(
        &mut self,
        host: &mut H,
        idx: usize,
        end: f64,
        ad_end: Option<f64>,
    ) {
        let cue = &mut self.cues[idx];
        host.remove_cues(TextTrackKind::CueTags, cue.start, cue.end);
        cue.end = end;
        if let Some(ad_end) = ad_end {
            cue.ad_end = ad_end;
        }
        host.add_cue(TextTrackKind::CueTags, cue.to_cue());
    }
}

/// Duration of the ad break from a cue-out value, either `30` or `DURATION=30`.
fn parse_cue_out(value: &str) -> f64 {
    let value = value.trim();
    let value = value.strip_prefix("DURATION=").unwrap_or(value);
    leading_float(value)
}

/// Elapsed and total ad break time from a `elapsed/total` cue-out-cont value.
fn parse_cue_out_cont(value: &str) -> (f64, f64) {
    let mut parts = value.split('/');
    let elapsed = parts.next().map_or(0., leading_float);
    let total = parts.next().map_or(0., leading_float);
    (elapsed, total)
}

/// Parse the longest numeric prefix of `value`, `0.` if there is none.
fn leading_float(value: &str) -> f64 {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && *c == '-')))
        .map_or(value.len(), |(i, _)| i);
    value[..end].parse().unwrap_or(0.)
}
