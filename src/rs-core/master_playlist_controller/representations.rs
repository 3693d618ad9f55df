use serde::Serialize;

use crate::{
    host::Host,
    playlist::{is_incompatible, Playlist},
    utils::event_target::Subscribable,
};

use super::{MasterPlaylistController, PlayerEvent};

/// A variant as exposed to the player's user, who can enable or disable it.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Representation {
    pub id: String,
    pub uri: String,
    pub bandwidth: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codecs: Option<String>,
    pub enabled: bool,
}

impl From<&Playlist> for Representation {
    fn from(playlist: &Playlist) -> Self {
        let resolution = playlist.attributes.resolution;
        Self {
            id: playlist.id.clone(),
            uri: playlist.uri.clone(),
            bandwidth: playlist.attributes.bandwidth,
            width: resolution.map(|r| r.width),
            height: resolution.map(|r| r.height),
            codecs: playlist.attributes.codecs.clone(),
            enabled: !playlist.disabled,
        }
    }
}

impl MasterPlaylistController {
    /// Every variant which could be played.
    pub fn representations(&self) -> Vec<Representation> {
        self.main_playlist_loader
            .master()
            .map(|master| {
                master
                    .playlists
                    .iter()
                    .filter(|p| !is_incompatible(p))
                    .map(|p| Representation::from(&**p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Allow or forbid the selection of a variant. Returns `false` if there is no variant
    /// with that id.
    ///
    /// When the current variant is not the right one anymore, the switch is done right away.
    pub fn set_representation_enabled<H: Host>(
        &mut self,
        host: &mut H,
        id: &str,
        enabled: bool,
    ) -> bool {
        let Some(master) = self.main_playlist_loader.master() else {
            return false;
        };
        let Some(playlist) = master.playlist_by_id(id) else {
            return false;
        };
        if playlist.disabled != enabled {
            return true;
        }
        let uri = playlist.uri.clone();
        if let Some(next) = master.map_playlist(&uri, |p| p.disabled = !enabled) {
            self.main_playlist_loader.replace_master(next);
        }
        tracing::info!(
            "MPC: representation {id} {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.events.trigger(PlayerEvent::Usage(if enabled {
            "hls-rendition-enabled"
        } else {
            "hls-rendition-disabled"
        }));
        self.fast_quality_change(host);
        self.process_events(host);
        true
    }

    /// Switch to the best variant now, dropping the pending segment request.
    fn fast_quality_change<H: Host>(&mut self, host: &mut H) {
        let Some(next) = self.select_playlist(&*host) else {
            return;
        };
        if self.media().map_or(false, |m| m.uri == next.uri) {
            return;
        }
        tracing::info!("MPC: switching to {} right away", next.uri);
        if let Err(err) = self.main_playlist_loader.set_media(host, &next.uri) {
            tracing::warn!("MPC: could not switch to {}: {err}", next.uri);
            return;
        }
        self.main_segment_loader.reset_loader(host);
    }
}
