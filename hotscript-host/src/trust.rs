//! Download trust policy
//!
//! Trust is URL allow-listing, nothing more: a trusted URL may be downloaded
//! and run, an untrusted one is refused before any request is made.

/// Publishers trusted out of the box. Matched case-insensitively.
pub const TRUSTED_PUBLISHERS: &[&str] = &[
    "https://github.com/NightmareXIV/",
    "https://www.github.com/NightmareXIV/",
    "https://raw.githubusercontent.com/NightmareXIV/",
    "https://github.com/PunishXIV/",
    "https://www.github.com/PunishXIV/",
    "https://raw.githubusercontent.com/PunishXIV/",
    "https://nightmarexiv.com/",
];

/// Built-in publishers plus operator-configured prefixes
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    extra_prefixes: Vec<String>,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add operator prefixes. These match exactly (case-sensitive).
    pub fn with_extra_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.extra_prefixes
            .extend(prefixes.into_iter().filter(|p| !p.is_empty()));
        self
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        TRUSTED_PUBLISHERS
            .iter()
            .any(|prefix| starts_with_ignore_ascii_case(url, prefix))
            || self
                .extra_prefixes
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()))
    }
}

fn starts_with_ignore_ascii_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
