//! Site and connectivity capabilities consumed by the engine.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A remote account the engine downloads files for.
///
/// Each site has its own registry and package tables; the download queue
/// is shared by all sites.
pub trait Site: Send + Sync + 'static {
    /// Stable identifier used to partition persisted state.
    fn id(&self) -> &str;

    /// Whether the site allows files to be downloaded at all.
    fn can_download_files(&self) -> bool {
        true
    }

    /// URL to actually request, e.g. with credentials attached.
    fn fix_url(&self, url: &str) -> String {
        url.to_string()
    }
}

/// Device connectivity.
pub trait NetworkStatus: Send + Sync + 'static {
    fn is_online(&self) -> bool;

    /// True on connections where large transfers should be avoided.
    fn is_metered(&self) -> bool;
}

/// Sites known to the engine, keyed by id.
#[derive(Clone, Default)]
pub struct SiteRegistry {
    sites: Arc<DashMap<String, Arc<dyn Site>>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, site: Arc<dyn Site>) {
        self.sites.insert(site.id().to_string(), site);
    }

    pub fn unregister(&self, site_id: &str) -> bool {
        self.sites.remove(site_id).is_some()
    }

    pub fn get(&self, site_id: &str) -> EngineResult<Arc<dyn Site>> {
        self.sites
            .get(site_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownSite(site_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sites.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Site with fixed settings, optionally appending an access token to every
/// requested URL.
#[derive(Clone, Debug)]
pub struct StaticSite {
    id: String,
    token: Option<String>,
    can_download_files: bool,
}

impl StaticSite {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: None,
            can_download_files: true,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_downloads(mut self, enabled: bool) -> Self {
        self.can_download_files = enabled;
        self
    }
}

impl Site for StaticSite {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_download_files(&self) -> bool {
        self.can_download_files
    }

    fn fix_url(&self, url: &str) -> String {
        let Some(token) = &self.token else {
            return url.to_string();
        };
        match url::Url::parse(url) {
            Ok(mut parsed) => {
                parsed.query_pairs_mut().append_pair("token", token);
                parsed.to_string()
            }
            Err(_) => url.to_string(),
        }
    }
}

/// Connectivity flags that can be flipped at runtime.
#[derive(Debug)]
pub struct StaticNetwork {
    online: AtomicBool,
    metered: AtomicBool,
}

impl StaticNetwork {
    pub fn new(online: bool, metered: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            metered: AtomicBool::new(metered),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::SeqCst);
    }
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl NetworkStatus for StaticNetwork {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_metered(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let sites = SiteRegistry::new();
        sites.register(Arc::new(StaticSite::new("school")));
        assert_eq!(sites.get("school").unwrap().id(), "school");
        assert!(matches!(
            sites.get("other"),
            Err(EngineError::UnknownSite(id)) if id == "other"
        ));
        assert!(sites.unregister("school"));
        assert!(sites.ids().is_empty());
    }

    #[test]
    fn test_fix_url_appends_token() {
        let site = StaticSite::new("s").with_token("abc");
        assert_eq!(
            site.fix_url("https://host/pluginfile.php/1/a.pdf?forcedownload=1"),
            "https://host/pluginfile.php/1/a.pdf?forcedownload=1&token=abc"
        );
        assert_eq!(StaticSite::new("s").fix_url("https://host/x"), "https://host/x");
    }

    #[test]
    fn test_network_toggles() {
        let network = StaticNetwork::new(false, true);
        assert!(!network.is_online());
        network.set_online(true);
        network.set_metered(false);
        assert!(network.is_online());
        assert!(!network.is_metered());
    }
}
