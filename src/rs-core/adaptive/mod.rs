//! Variant selection.

use std::rc::Rc;

use crate::{
    config::{Config, SelectorKind},
    playlist::{
        estimate_segment_request_time, is_disabled, is_enabled, is_incompatible, MasterPlaylist,
        Playlist,
    },
    sync_controller::SyncController,
    utils::codecs::parse_codecs,
};

pub use self::ewma::Ewma;

mod ewma;

struct Rep<'a> {
    bandwidth: u64,
    width: Option<u32>,
    height: Option<u32>,
    playlist: &'a Rc<Playlist>,
}

impl<'a> Rep<'a> {
    fn new(playlist: &'a Rc<Playlist>) -> Self {
        let resolution = playlist.attributes.resolution;
        Self {
            bandwidth: playlist.attributes.bandwidth.unwrap_or(u64::MAX),
            width: resolution.map(|r| r.width),
            height: resolution.map(|r| r.height),
            playlist,
        }
    }

    fn has_resolution(&self) -> bool {
        self.width.map_or(false, |w| w > 0) && self.height.map_or(false, |h| h > 0)
    }
}

/// Among `reps` sorted by ascending bandwidth, the first one having the highest bandwidth.
fn first_with_highest_bandwidth<'a, 'b>(reps: &'b [&'b Rep<'a>]) -> Option<&'b Rep<'a>> {
    let highest = reps.last()?.bandwidth;
    reps.iter().find(|r| r.bandwidth == highest).copied()
}

/// Choose the variant best fitting the given bandwidth and player dimensions.
///
/// Tries, in order: the highest-bandwidth variant exactly matching the player's dimensions,
/// the smallest resolution bigger than the player, the highest variant fitting the bandwidth,
/// the lowest enabled variant and finally any variant. Only returns `None` for an empty
/// Multivariant Playlist.
pub fn simple_selector<'a>(
    master: &'a MasterPlaylist,
    player_bandwidth: f64,
    player_width: u32,
    player_height: u32,
    limit_by_player_dimensions: bool,
    bandwidth_variance: f64,
    now: f64,
) -> Option<&'a Rc<Playlist>> {
    let mut sorted: Vec<Rep<'a>> = master.playlists.iter().map(Rep::new).collect();
    sorted.sort_by_key(|r| r.bandwidth);
    let fallback = sorted.first().map(|r| r.playlist);

    let compatible: Vec<&Rep<'a>> = sorted
        .iter()
        .filter(|r| !is_incompatible(r.playlist))
        .collect();
    let mut enabled: Vec<&Rep<'a>> = compatible
        .iter()
        .copied()
        .filter(|r| is_enabled(r.playlist, now))
        .collect();
    if enabled.is_empty() {
        enabled = compatible
            .iter()
            .copied()
            .filter(|r| !is_disabled(r.playlist))
            .collect();
    }

    let fitting: Vec<&Rep<'a>> = enabled
        .iter()
        .copied()
        .filter(|r| (r.bandwidth as f64) * bandwidth_variance < player_bandwidth)
        .collect();
    let bandwidth_best = first_with_highest_bandwidth(&fitting);
    let last_resort = bandwidth_best
        .or(enabled.first().copied())
        .or(compatible.first().copied())
        .map(|r| r.playlist)
        .or(fallback);

    if !limit_by_player_dimensions {
        return last_resort;
    }

    let mut have_resolution: Vec<&Rep<'a>> = fitting
        .iter()
        .copied()
        .filter(|r| r.has_resolution())
        .collect();
    have_resolution.sort_by_key(|r| r.width);

    let exact: Vec<&Rep<'a>> = have_resolution
        .iter()
        .copied()
        .filter(|r| r.width == Some(player_width) && r.height == Some(player_height))
        .collect();
    if let Some(rep) = first_with_highest_bandwidth(&exact) {
        return Some(rep.playlist);
    }

    let bigger: Vec<&Rep<'a>> = have_resolution
        .iter()
        .copied()
        .filter(|r| {
            r.width.map_or(false, |w| w > player_width)
                || r.height.map_or(false, |h| h > player_height)
        })
        .collect();
    if let Some(smallest) = bigger.first() {
        let same_size: Vec<&Rep<'a>> = bigger
            .iter()
            .copied()
            .filter(|r| r.width == smallest.width && r.height == smallest.height)
            .collect();
        if let Some(rep) = first_with_highest_bandwidth(&same_size) {
            return Some(rep.playlist);
        }
    }

    last_resort
}

/// Inputs of `min_rebuffer_max_bandwidth_selector`.
pub struct RebufferSelectorParams<'a> {
    pub master: &'a MasterPlaylist,
    pub current_time: f64,
    /// Measured bandwidth, in bits per second.
    pub bandwidth: f64,
    pub duration: f64,
    pub segment_duration: f64,
    /// Seconds of playback left before rebuffering.
    pub time_until_rebuffer: f64,
    pub current_timeline: Option<u64>,
    pub now: f64,
}

/// A candidate variant with the rebuffering it would cause, in seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct RebufferEstimate {
    pub playlist: Rc<Playlist>,
    pub rebuffering_impact: f64,
}

/// Choose the highest-bandwidth variant whose next segment could be loaded without
/// rebuffering, or the one causing the least rebuffering if none can.
///
/// Variants without a known sync point count double, as a sync request would be needed first.
pub fn min_rebuffer_max_bandwidth_selector(
    params: &RebufferSelectorParams<'_>,
    sync_controller: &SyncController,
) -> Option<RebufferEstimate> {
    let compatible: Vec<&Rc<Playlist>> = params
        .master
        .playlists
        .iter()
        .filter(|p| !is_incompatible(p))
        .collect();
    let mut enabled: Vec<&Rc<Playlist>> = compatible
        .iter()
        .copied()
        .filter(|p| is_enabled(p, params.now))
        .collect();
    if enabled.is_empty() {
        enabled = compatible
            .iter()
            .copied()
            .filter(|p| !is_disabled(p))
            .collect();
    }

    let mut estimates: Vec<RebufferEstimate> = enabled
        .into_iter()
        .filter_map(|playlist| {
            let request_time = estimate_segment_request_time(
                params.segment_duration,
                params.bandwidth,
                playlist,
                0,
            )?;
            let sync_point = sync_controller.get_sync_point(
                playlist,
                params.duration,
                params.current_timeline,
                params.current_time,
            );
            let num_requests = if sync_point.is_some() { 1. } else { 2. };
            Some(RebufferEstimate {
                playlist: playlist.clone(),
                rebuffering_impact: request_time * num_requests - params.time_until_rebuffer,
            })
        })
        .collect();

    let best_without_rebuffering = estimates
        .iter()
        .filter(|e| e.rebuffering_impact <= 0.)
        .fold(None::<&RebufferEstimate>, |best, e| match best {
            Some(b) if compare_bandwidth(&e.playlist, &b.playlist).is_le() => Some(b),
            _ => Some(e),
        })
        .cloned();
    if best_without_rebuffering.is_some() {
        return best_without_rebuffering;
    }

    estimates.sort_by(|a, b| a.rebuffering_impact.total_cmp(&b.rebuffering_impact));
    estimates.into_iter().next()
}

/// The lowest-bandwidth enabled variant having video, if any.
pub fn lowest_bitrate_compatible_variant_selector(
    master: &MasterPlaylist,
    now: f64,
) -> Option<&Rc<Playlist>> {
    let mut playlists: Vec<&Rc<Playlist>> = master
        .playlists
        .iter()
        .filter(|p| is_enabled(p, now))
        .collect();
    playlists.sort_by(|a, b| compare_bandwidth(a, b));
    playlists.into_iter().find(|p| {
        p.attributes
            .codecs
            .as_deref()
            .map_or(false, |c| parse_codecs(c).video_codec.is_some())
    })
}

fn compare_bandwidth(a: &Playlist, b: &Playlist) -> std::cmp::Ordering {
    let a = a.attributes.bandwidth.unwrap_or(u64::MAX);
    let b = b.attributes.bandwidth.unwrap_or(u64::MAX);
    a.cmp(&b)
}

/// Forward buffer, in seconds, to maintain at `current_time`: grows with playback up to its
/// maximum.
pub fn goal_buffer_length(config: &Config, current_time: f64) -> f64 {
    let initial = config.goal_buffer_length;
    let max = initial.max(config.max_goal_buffer_length);
    (initial + current_time * config.goal_buffer_length_rate).min(max)
}

/// Forward buffer, in seconds, needed before switching up at `current_time`.
pub fn buffer_low_water_line(config: &Config, current_time: f64) -> f64 {
    let initial = config.buffer_low_water_line;
    let max = initial.max(config.max_buffer_low_water_line);
    (initial + current_time * config.buffer_low_water_line_rate).min(max)
}

/// Combine the network bandwidth with the throughput of the whole loading pipeline: the
/// resulting bitrate is what can actually be pushed to the buffers.
pub fn system_bandwidth(bandwidth: f64, throughput: f64) -> f64 {
    let inv_bandwidth = 1. / if bandwidth > 0. { bandwidth } else { 1. };
    let inv_throughput = if throughput > 0. { 1. / throughput } else { 0. };
    (1. / (inv_bandwidth + inv_throughput)).floor()
}

/// Bandwidth-based selection, as configured.
pub struct PlaylistSelector {
    kind: SelectorKind,
    average: Ewma,
}

impl PlaylistSelector {
    pub fn new(kind: SelectorKind) -> Self {
        let decay = match kind {
            SelectorKind::MovingAverage { decay } => decay,
            SelectorKind::LastBandwidth => 1.,
        };
        Self {
            kind,
            average: Ewma::new(decay),
        }
    }

    /// Choose a variant for the given system bandwidth.
    pub fn select<'a>(
        &mut self,
        master: &'a MasterPlaylist,
        system_bandwidth: f64,
        player_dimensions: (u32, u32),
        config: &Config,
        now: f64,
    ) -> Option<&'a Rc<Playlist>> {
        let bandwidth = match self.kind {
            SelectorKind::LastBandwidth => system_bandwidth,
            SelectorKind::MovingAverage { .. } => self.average.add_sample(system_bandwidth),
        };
        simple_selector(
            master,
            bandwidth,
            player_dimensions.0,
            player_dimensions.1,
            config.limit_rendition_by_player_dimensions,
            config.bandwidth_variance,
            now,
        )
    }
}
