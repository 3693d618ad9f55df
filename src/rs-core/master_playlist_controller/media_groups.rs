use crate::{
    host::{Host, LoaderKind},
    playlist::Rendition,
    playlist_loader::PlaylistLoader,
};

use super::MasterPlaylistController;

/// An alternate rendition being loaded from its own Media Playlist.
pub(super) struct ActiveRendition {
    pub group_id: String,
    pub name: String,
    pub loader: PlaylistLoader,
}

/// Rendition to use by default in a group: for audio the `DEFAULT` one, else the first
/// `AUTOSELECT` one, else the first one. Subtitles are only enabled by default when one is
/// marked `DEFAULT`.
pub fn default_rendition(renditions: &[Rendition], kind: LoaderKind) -> Option<&Rendition> {
    let default = renditions.iter().find(|r| r.default);
    match kind {
        LoaderKind::Audio => default
            .or_else(|| renditions.iter().find(|r| r.autoselect))
            .or_else(|| renditions.first()),
        LoaderKind::Subtitle => default,
        LoaderKind::Main => None,
    }
}

impl MasterPlaylistController {
    pub(super) fn setup_media_groups<H: Host>(&mut self, host: &mut H) {
        self.setup_media_group(host, LoaderKind::Audio);
        self.setup_media_group(host, LoaderKind::Subtitle);
    }

    /// Make the rendition of the current variant's group active, stopping the previous one if
    /// it changed.
    pub(super) fn setup_media_group<H: Host>(&mut self, host: &mut H, kind: LoaderKind) {
        let wanted = self.wanted_rendition(kind);
        let active = self
            .active_rendition(kind)
            .map(|a| (a.group_id.as_str(), a.name.as_str()));
        if wanted.as_ref().map(|(g, r)| (g.as_str(), r.name.as_str())) == active
            && active.is_some()
        {
            return;
        }
        self.stop_media_group(host, kind);
        let Some((group_id, rendition)) = wanted else {
            return;
        };
        // muxed in the variants
        let Some(url) = rendition.resolved_uri else {
            tracing::debug!("MPC: {kind} rendition {} is muxed", rendition.name);
            return;
        };
        tracing::info!("MPC: loading {kind} rendition {} of group {group_id}", rendition.name);
        let mut loader = PlaylistLoader::new(kind, url, &self.config);
        loader.start(host);
        let active = ActiveRendition {
            group_id,
            name: rendition.name,
            loader,
        };
        match kind {
            LoaderKind::Audio => self.audio = Some(active),
            LoaderKind::Subtitle => self.subtitles = Some(active),
            LoaderKind::Main => {}
        }
    }

    /// The rendition of the given type the current variant should be played with, alongside
    /// its group id. Renditions which failed before are never chosen.
    fn wanted_rendition(&self, kind: LoaderKind) -> Option<(String, Rendition)> {
        let media = self.main_playlist_loader.media()?;
        let master = self.main_playlist_loader.master()?;
        let (group_id, groups) = match kind {
            LoaderKind::Audio => (media.attributes.audio.as_ref()?, &master.media_groups.audio),
            LoaderKind::Subtitle => (
                media.attributes.subtitles.as_ref()?,
                &master.media_groups.subtitles,
            ),
            LoaderKind::Main => return None,
        };
        let candidates: Vec<Rendition> = groups
            .get(group_id)?
            .iter()
            .filter(|r| {
                !self
                    .failed_renditions
                    .iter()
                    .any(|(k, name)| *k == kind && *name == r.name)
            })
            .cloned()
            .collect();
        let chosen = default_rendition(&candidates, kind)?.clone();
        Some((group_id.clone(), chosen))
    }

    fn active_rendition(&self, kind: LoaderKind) -> Option<&ActiveRendition> {
        match kind {
            LoaderKind::Audio => self.audio.as_ref(),
            LoaderKind::Subtitle => self.subtitles.as_ref(),
            LoaderKind::Main => None,
        }
    }

    /// Stop loading the active rendition of that type and empty its buffer.
    fn stop_media_group<H: Host>(&mut self, host: &mut H, kind: LoaderKind) {
        let previous = match kind {
            LoaderKind::Audio => self.audio.take(),
            LoaderKind::Subtitle => self.subtitles.take(),
            LoaderKind::Main => None,
        };
        let Some(mut previous) = previous else {
            return;
        };
        tracing::info!("MPC: stopping {kind} rendition {}", previous.name);
        previous.loader.dispose(host);
        let duration = self.duration(&*host);
        let loader = match kind {
            LoaderKind::Audio => &mut self.audio_segment_loader,
            _ => &mut self.subtitle_segment_loader,
        };
        loader.reset_everything(host, duration);
        loader.pause(host);
    }

    /// Give up on the active rendition of that type and fall back to another one, if any.
    pub(super) fn on_media_group_error<H: Host>(&mut self, host: &mut H, kind: LoaderKind) {
        let Some(name) = self.active_rendition(kind).map(|a| a.name.clone()) else {
            return;
        };
        tracing::warn!("MPC: {kind} rendition {name} failed, looking for another one");
        self.failed_renditions.push((kind, name));
        self.stop_media_group(host, kind);
        self.setup_media_group(host, kind);
    }
}
