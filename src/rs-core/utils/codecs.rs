use std::sync::OnceLock;

use regex::Regex;

/// Information extracted from an HLS `CODECS` attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecInfo {
    /// Number of codecs listed, `2` (audio + video) being assumed when empty.
    pub codec_count: usize,
    /// Video codec family, e.g. `avc1`.
    pub video_codec: Option<String>,
    /// Rest of the video codec string, e.g. `.4d400d`.
    pub video_object_type_indicator: Option<String>,
    /// AAC audio object type, e.g. `2` for `mp4a.40.2`.
    pub audio_profile: Option<String>,
}

fn video_codec_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|\s|,)+(avc[13])([^ ,]*)").ok())
        .as_ref()
}

fn audio_profile_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|\s|,)+mp4a\.[0-9a-f]+\.([0-9a-f]+)").ok())
        .as_ref()
}

/// Parse a `CODECS` attribute.
pub fn parse_codecs(codecs: &str) -> CodecInfo {
    let codec_count = if codecs.trim().is_empty() {
        2
    } else {
        codecs.split(',').count()
    };
    let mut info = CodecInfo {
        codec_count,
        ..CodecInfo::default()
    };
    if let Some(caps) = video_codec_regex().and_then(|re| re.captures(codecs)) {
        info.video_codec = caps.get(2).map(|m| m.as_str().to_owned());
        info.video_object_type_indicator = caps.get(3).map(|m| m.as_str().to_owned());
    }
    if let Some(caps) = audio_profile_regex().and_then(|re| re.captures(codecs)) {
        info.audio_profile = caps.get(2).map(|m| m.as_str().to_owned());
    }
    info
}

/// Codecs assumed when a variant does not announce any.
pub fn default_codecs() -> CodecInfo {
    CodecInfo {
        codec_count: 2,
        video_codec: Some("avc1".into()),
        video_object_type_indicator: Some(".4d400d".into()),
        audio_profile: Some("2".into()),
    }
}

/// Build a mime-type such as `video/mp2t; codecs="avc1.4d400d, mp4a.40.2"`.
pub fn make_mime_type(media_type: &str, container: &str, codecs: &[Option<&str>]) -> String {
    let codecs = codecs
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<&str>>()
        .join(", ");
    format!("{media_type}/{container}; codecs=\"{codecs}\"")
}
