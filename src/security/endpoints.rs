use std::collections::HashMap;

/// Route namespace shared by every data route.
pub const NAMESPACE: &str = "llm-connector/v1";

/// Every slug the registry knows about, in display order.
pub const ALL_SLUGS: [&str; 6] = [
    "site_info",
    "plugin_list",
    "theme_list",
    "system_status",
    "user_count",
    "post_stats",
];

/// Static route -> permission slug table. Routes without an entry are not
/// subject to the allowlist check.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    slugs: HashMap<String, String>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::from_pairs([
            ("site-info", "site_info"),
            ("plugins", "plugin_list"),
            ("themes", "theme_list"),
            ("system-status", "system_status"),
            ("user-count", "user_count"),
            ("post-stats", "post_stats"),
        ])
    }
}

impl EndpointRegistry {
    pub fn from_pairs<I, R, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (R, S)>,
        R: Into<String>,
        S: Into<String>,
    {
        Self {
            slugs: pairs
                .into_iter()
                .map(|(route, slug)| (route.into(), slug.into()))
                .collect(),
        }
    }

    /// Accepts either the bare segment (`site-info`) or the full path
    /// (`/llm-connector/v1/site-info`).
    pub fn slug_for(&self, route: &str) -> Option<&str> {
        let trimmed = route.trim_matches('/');
        let segment = trimmed
            .strip_prefix(NAMESPACE)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(trimmed);
        self.slugs.get(segment).map(String::as_str)
    }

    /// (route segment, slug) pairs, sorted by route.
    pub fn routes(&self) -> Vec<(&str, &str)> {
        let mut routes: Vec<_> = self
            .slugs
            .iter()
            .map(|(r, s)| (r.as_str(), s.as_str()))
            .collect();
        routes.sort_unstable();
        routes
    }
}
