//! Origin-facing forwarders
//!
//! Fetches playlists and media bytes from an origin on the client's behalf.
//! Every reference inside a forwarded playlist is rewritten into a proxied
//! reference (see [`reference`]) so that the player keeps coming back here.

pub mod client;
pub mod error;
pub mod hls;
pub mod reference;
pub mod web;

pub use client::UpstreamClient;
pub use error::{Error, Result};
pub use hls::HlsForwarder;
pub use web::WebForwarder;

/// Playlist responses never get cached by the player or intermediaries.
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const PLAYLIST_CACHE_CONTROL: &str = "no-cache, no-store, private";
