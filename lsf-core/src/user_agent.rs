//! User-Agent sent to origins. Some platforms only hand out playable
//! streams to mobile clients, so the extractor picks which one applies.

pub const DESKTOP: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const MOBILE: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

/// Pair of configured User-Agent strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgent {
    desktop: String,
    mobile: String,
}

impl UserAgent {
    pub fn new(desktop: impl Into<String>, mobile: impl Into<String>) -> Self {
        Self {
            desktop: desktop.into(),
            mobile: mobile.into(),
        }
    }

    #[must_use]
    pub fn pick(&self, mobile: bool) -> &str {
        if mobile {
            &self.mobile
        } else {
            &self.desktop
        }
    }
}

impl Default for UserAgent {
    fn default() -> Self {
        Self::new(DESKTOP, MOBILE)
    }
}

impl From<&crate::config::UpstreamConfig> for UserAgent {
    fn from(cfg: &crate::config::UpstreamConfig) -> Self {
        Self::new(cfg.user_agent.clone(), cfg.mobile_user_agent.clone())
    }
}
