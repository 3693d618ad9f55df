//! HLS playback engine.
//!
//! The engine decides what to load and when: playlists, segments and the variant to play.
//! Everything touching the outside world (network, timers, the media element and its
//! MediaSource) goes through the traits of the `host` module, implemented in JavaScript for
//! WebAssembly builds.

pub mod adaptive;
pub mod config;
pub mod decrypter;
pub mod error;
pub mod host;
pub mod master_playlist_controller;
pub mod media_segment_request;
pub mod parser;
pub mod playback_watcher;
pub mod playlist;
pub mod playlist_loader;
pub mod segment_loader;
pub mod sync_controller;
pub mod utils;

#[cfg(target_arch = "wasm32")]
mod bindings;
#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::PlayerError;
pub use host::Host;
pub use master_playlist_controller::{MasterPlaylistController, PlayerEvent};

#[cfg(target_arch = "wasm32")]
pub use bindings::HlsPlayer;
