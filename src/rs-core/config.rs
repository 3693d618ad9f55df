use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_BACKOFF_BASE: f64 = 300.;
const DEFAULT_BACKOFF_MAX: f64 = 3000.;

/// Runtime configuration of a `MasterPlaylistController` and of everything it owns.
///
/// Every field has a default, so a partial JSON object can be given to `Config::from_json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Forward buffer, in seconds, segment loaders try to maintain when playback starts.
    pub goal_buffer_length: f64,

    /// Ceiling, in seconds, for the goal buffer length once it grew with playback.
    pub max_goal_buffer_length: f64,

    /// Seconds of goal buffer gained for each second of playback.
    pub goal_buffer_length_rate: f64,

    /// Amount of already-played media, in seconds, kept in the buffers.
    pub back_buffer_length: f64,

    /// Minimum forward buffer, in seconds, needed before switching up to a higher quality on
    /// VoD contents.
    pub buffer_low_water_line: f64,

    /// Ceiling, in seconds, for the low water line once it grew with playback.
    pub max_buffer_low_water_line: f64,

    /// Seconds of low water line gained for each second of playback.
    pub buffer_low_water_line_rate: f64,

    /// Bandwidth, in bits per second, assumed before any segment has been loaded.
    pub initial_bandwidth: f64,

    /// Multiplier applied to a variant's declared bandwidth before comparing it to the
    /// estimated one, to absorb measurement noise.
    pub bandwidth_variance: f64,

    /// Time, in seconds, a variant is excluded for after a playlist or segment error.
    pub blacklist_duration: f64,

    /// Time, in seconds, a variant is excluded for after one of its segment requests was
    /// aborted because it would have led to rebuffering.
    pub abort_early_blacklist_duration: f64,

    /// Interval, in milliseconds, at which segment loaders re-check their buffer.
    pub buffer_check_interval: f64,

    /// Interval, in milliseconds, at which the playback watcher polls the media clock.
    pub playback_poll_interval: f64,

    /// Number of polls without clock progression after which playback is considered stalled.
    pub stall_poll_threshold: u32,

    /// Window of time, in seconds, behind the current position where a buffer gap is
    /// considered to be a video underflow.
    ///
    /// Those bounds were tuned against one browser's behavior of continuing to play audio for
    /// a few seconds after reaching a video gap. They are environment-specific.
    pub video_underflow_window: (f64, f64),

    /// Allow seeks up to three target durations after the live edge without correcting them.
    pub allow_seeks_within_unsafe_live_window: bool,

    /// Consecutive unchanged live refreshes at the live edge after which the current variant is
    /// considered stuck.
    pub playlist_stuck_threshold: u32,

    /// If `false`, the player's dimensions are ignored when selecting a variant.
    pub limit_rendition_by_player_dimensions: bool,

    /// Expose cue-out/cue-in markers as cues on the `CueTags` text track.
    pub use_cue_tags: bool,

    /// Start on the lowest bitrate variant having video.
    pub enable_low_initial_playlist: bool,

    /// Keep decryption keys once fetched instead of requesting them for each segment.
    pub cache_encryption_keys: bool,

    /// Send credentials (cookies) with every request.
    pub with_credentials: bool,

    /// Bandwidth-based selection strategy.
    pub selector: SelectorKind,

    /// Retry policy for playlist requests.
    pub playlist_retry: RetryConfig,

    /// Timeout, in milliseconds, for playlist requests. `None` to disable.
    pub playlist_request_timeout: Option<f64>,
}

/// Which bandwidth measure `select_playlist` feeds to the variant selector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SelectorKind {
    /// The last measured system bandwidth.
    LastBandwidth,
    /// An exponentially weighted moving average of the system bandwidth, `decay` being the
    /// weight given to the most recent sample.
    MovingAverage { decay: f64 },
}

/// Retry policy for a category of requests.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Amount of times a failed request might be retried on errors that seem temporary.
    pub max_retry: u32,

    /// Roughly the initial delay, in milliseconds, before a retry. Grows exponentially with
    /// consecutive failures.
    pub backoff_base: f64,

    /// Roughly the maximum delay, in milliseconds, before a retry.
    pub backoff_max: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 2,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            goal_buffer_length: 30.,
            max_goal_buffer_length: 60.,
            goal_buffer_length_rate: 1.,
            back_buffer_length: 30.,
            buffer_low_water_line: 0.,
            max_buffer_low_water_line: 30.,
            buffer_low_water_line_rate: 1.,
            initial_bandwidth: 4_194_304.,
            bandwidth_variance: 1.2,
            blacklist_duration: 5. * 60.,
            abort_early_blacklist_duration: 2. * 60.,
            buffer_check_interval: 500.,
            playback_poll_interval: 250.,
            stall_poll_threshold: 5,
            video_underflow_window: (2., 4.),
            allow_seeks_within_unsafe_live_window: false,
            playlist_stuck_threshold: 3,
            limit_rendition_by_player_dimensions: true,
            use_cue_tags: false,
            enable_low_initial_playlist: false,
            cache_encryption_keys: false,
            with_credentials: false,
            selector: SelectorKind::LastBandwidth,
            playlist_retry: RetryConfig::default(),
            playlist_request_timeout: Some(10_000.),
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON object, missing fields taking their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let SelectorKind::MovingAverage { decay } = self.selector {
            if !(0. ..=1.).contains(&decay) {
                return Err(ConfigError::InvalidValue {
                    field: "selector",
                    reason: "Moving average bandwidth decay must be between 0 and 1.".into(),
                });
            }
        }
        if self.bandwidth_variance <= 0. {
            return Err(ConfigError::InvalidValue {
                field: "bandwidth_variance",
                reason: "must be strictly positive".into(),
            });
        }
        let (low, high) = self.video_underflow_window;
        if low >= high {
            return Err(ConfigError::InvalidValue {
                field: "video_underflow_window",
                reason: format!("empty window ({low}, {high})"),
            });
        }
        Ok(())
    }
}
