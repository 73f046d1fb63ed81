//! Platform extractor seam
//!
//! An extractor turns a platform's room identifier into the origin URL of the
//! live stream. Site-specific extractors live outside this crate and are
//! plugged in through a [`Registry`].

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use axum::http::HeaderMap;
use url::Url;

/// How a resolved playlist is presented to the player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaylistMode {
    /// Download and rewrite the playlist on every request.
    #[default]
    Forward,
    /// Serve a one-variant master pointing at the playlist, which is then
    /// fetched through a proxied reference.
    Wrap,
}

/// Origin of a room's stream.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub url: Url,
    /// Extra headers for requests to this origin.
    pub headers: HeaderMap,
    /// Send the mobile User-Agent.
    pub mobile: bool,
    pub playlist: PlaylistMode,
}

impl Resolved {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            mobile: false,
            playlist: PlaylistMode::default(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub const fn mobile(mut self) -> Self {
        self.mobile = true;
        self
    }

    #[must_use]
    pub const fn wrapped(mut self) -> Self {
        self.playlist = PlaylistMode::Wrap;
        self
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Resolve `room` to its current stream origin.
    ///
    /// `proxy` is the outbound proxy of the request and should be used for
    /// any platform API calls.
    async fn resolve(&self, room: &str, proxy: Option<&Url>) -> anyhow::Result<Resolved>;

    /// Headers for follow-up requests to proxied references of this
    /// platform (e.g. a `Referer` the CDN insists on).
    fn headers(&self) -> HeaderMap {
        HeaderMap::new()
    }

    /// Whether follow-up requests use the mobile User-Agent.
    fn mobile(&self) -> bool {
        false
    }
}

/// Extractors by lowercase platform name.
#[derive(Clone, Default)]
pub struct Registry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, platform: &str, extractor: impl Extractor + 'static) -> Self {
        self.extractors
            .insert(platform.to_lowercase(), Arc::new(extractor));
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, platform: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(&platform.to_lowercase()).cloned()
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.extractors.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.platforms()).finish()
    }
}
