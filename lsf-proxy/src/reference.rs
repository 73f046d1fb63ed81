//! Proxied references
//!
//! A proxied reference is a URL on this server whose `url` query parameter
//! carries the standard base64 encoding of an origin URL. When an outbound
//! proxy is active it travels along in the `proxy` parameter so that later
//! hops leave through the same egress.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use url::Url;

use crate::{Error, Result};

/// Query parameter carrying the encoded origin.
pub const URL_PARAM: &str = "url";
/// Query parameter carrying the outbound proxy.
pub const PROXY_PARAM: &str = "proxy";

/// Encode an origin URL for the `url` query parameter.
#[must_use]
pub fn encode_origin(origin: &str) -> String {
    STANDARD.encode(origin.as_bytes())
}

/// Reverse of [`encode_origin`].
///
/// Form decoding turns an unescaped `+` into a space, so spaces are mapped
/// back before decoding.
pub fn decode_origin(encoded: &str) -> Result<String> {
    let normalized = encoded.trim().replace(' ', "+");
    let raw = STANDARD.decode(normalized)?;
    String::from_utf8(raw).map_err(|_| Error::NotUtf8)
}

/// Decode a `url` parameter into an absolute origin URL.
pub fn decode_reference(encoded: &str) -> Result<Url> {
    let origin = decode_origin(encoded)?;
    Url::parse(&origin).map_err(|e| Error::invalid_url(&origin, e))
}

/// Build the proxied reference for `origin` under `prefix`.
///
/// Query pairs already on `prefix` are kept, except stale `url`/`proxy`
/// pairs which are replaced.
#[must_use]
pub fn proxied_reference(prefix: &Url, origin: &Url, proxy: Option<&Url>) -> Url {
    let kept: Vec<(String, String)> = prefix
        .query_pairs()
        .filter(|(k, _)| k != URL_PARAM && k != PROXY_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut reference = prefix.clone();
    {
        let mut pairs = reference.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(kept);
        if let Some(proxy) = proxy {
            pairs.append_pair(PROXY_PARAM, proxy.as_str());
        }
        pairs.append_pair(URL_PARAM, &encode_origin(origin.as_str()));
    }
    reference
}

/// Resolve a playlist item URI against the playlist it came from.
///
/// Absolute URIs are kept as-is and a missing scheme or host is taken from
/// `base`. A relative path (first path segment non-empty) is a sibling of
/// the base document: it is joined to the directory holding the last path
/// segment of `base`, never to the root. Root-relative paths stay
/// root-relative.
pub fn resolve_sibling(base: &Url, item: &str) -> Result<Url> {
    match Url::parse(item) {
        Ok(absolute) => Ok(absolute),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            base.join(item).map_err(|e| Error::invalid_url(item, e))
        }
        Err(e) => Err(Error::invalid_url(item, e)),
    }
}
