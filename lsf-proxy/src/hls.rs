//! HLS playlist forwarding
//!
//! Downloads a master or media playlist, replaces every URI it contains with
//! a proxied reference and serves the re-serialized document.

use std::path::Path;

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
use url::Url;

use crate::{
    client::UpstreamClient,
    reference::{decode_reference, proxied_reference, resolve_sibling},
    web::WebForwarder,
    Error, Result, PLAYLIST_CACHE_CONTROL, PLAYLIST_CONTENT_TYPE,
};

/// Rewrites playlists so that every reference points back at `prefix`.
#[derive(Debug, Clone)]
pub struct HlsForwarder {
    client: UpstreamClient,
    headers: HeaderMap,
}

impl HlsForwarder {
    #[must_use]
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
        }
    }

    /// Headers attached to every origin request (e.g. a platform `Referer`).
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Serve a single-variant master playlist pointing at `origin`.
    ///
    /// Used when the extractor already resolved a leaf media playlist, so
    /// the player sees a master it can follow back through the proxy.
    pub fn wrap_playlist(&self, origin: &str, prefix: &Url) -> Result<Response> {
        let origin = Url::parse(origin).map_err(|e| Error::invalid_url(origin, e))?;
        let master = MasterPlaylist {
            variants: vec![VariantStream {
                uri: proxied_reference(prefix, &origin, self.client.proxy()).to_string(),
                ..VariantStream::default()
            }],
            ..MasterPlaylist::default()
        };
        playlist_response(&Playlist::MasterPlaylist(master))
    }

    /// Download the playlist at `origin` and serve it rewritten.
    pub async fn forward_playlist(&self, origin: &str, prefix: &Url) -> Result<Response> {
        let (served_by, response) = self.client.get(&self.headers, origin, 0).await?;
        let body = response.bytes().await?;

        let mut playlist = decode_playlist(&body)?;
        rewrite_playlist(&mut playlist, &served_by, prefix, self.client.proxy())?;

        tracing::debug!(origin = %served_by, "forwarding rewritten playlist");
        playlist_response(&playlist)
    }

    /// Follow a proxied reference: playlists are rewritten again, anything
    /// else is relayed byte for byte.
    pub async fn forward(&self, encoded: &str, prefix: &Url) -> Result<Response> {
        let origin = decode_reference(encoded)?;
        tracing::debug!(origin = %origin, "following proxied reference");

        if is_playlist(&origin) {
            self.forward_playlist(origin.as_str(), prefix).await
        } else {
            WebForwarder::new(self.client.clone())
                .forward(&self.headers, origin.as_str(), 0)
                .await
        }
    }
}

/// Whether `url` names an m3u8 document.
#[must_use]
pub fn is_playlist(url: &Url) -> bool {
    Path::new(url.path())
        .extension()
        .is_some_and(|ext| ext == "m3u8")
}

/// Parse a playlist body.
///
/// A document without a single entry is answered with an empty media
/// playlist even if it is not valid m3u8, so a player polling a stream that
/// has not started yet keeps polling instead of erroring out.
pub fn decode_playlist(body: &[u8]) -> Result<Playlist> {
    match m3u8_rs::parse_playlist_res(body) {
        Ok(playlist) => Ok(playlist),
        Err(_) if !has_entries(body) => {
            tracing::debug!("origin playlist has no entries, serving an empty one");
            Ok(Playlist::MediaPlaylist(MediaPlaylist::default()))
        }
        Err(e) => {
            tracing::debug!(error = ?e, "origin playlist did not parse");
            Err(Error::PlaylistDecode)
        }
    }
}

fn has_entries(body: &[u8]) -> bool {
    String::from_utf8_lossy(body)
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Replace every URI in `playlist` with a proxied reference.
///
/// Element count, order and all other attributes are left untouched. Key
/// URIs that do not resolve to http(s) (e.g. `skd://` for FairPlay) are not
/// fetchable through the proxy and stay as they are.
pub fn rewrite_playlist(
    playlist: &mut Playlist,
    base: &Url,
    prefix: &Url,
    proxy: Option<&Url>,
) -> Result<()> {
    let rewrite = |uri: &str| -> Result<String> {
        let origin = resolve_sibling(base, uri)?;
        Ok(proxied_reference(prefix, &origin, proxy).to_string())
    };

    match playlist {
        Playlist::MasterPlaylist(master) => {
            for variant in &mut master.variants {
                variant.uri = rewrite(&variant.uri)?;
            }
            for alternative in &mut master.alternatives {
                if let Some(uri) = alternative.uri.as_mut() {
                    *uri = rewrite(uri.as_str())?;
                }
            }
        }
        Playlist::MediaPlaylist(media) => {
            for segment in &mut media.segments {
                if let Some(map) = segment.map.as_mut().filter(|m| !m.uri.is_empty()) {
                    map.uri = rewrite(&map.uri)?;
                }
                if let Some(uri) = segment.key.as_mut().and_then(|k| k.uri.as_mut()) {
                    if matches!(resolve_sibling(base, uri.as_str())?.scheme(), "http" | "https") {
                        *uri = rewrite(uri.as_str())?;
                    }
                }
                segment.uri = rewrite(&segment.uri)?;
            }
        }
    }
    Ok(())
}

/// The document is sent whole with a `Content-Length`, never chunked.
fn playlist_response(playlist: &Playlist) -> Result<Response> {
    let mut body = Vec::new();
    playlist.write_to(&mut body)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL)
        .body(Body::from(body))?)
}
