use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::debug;
use url::Url;

type Endpoint = (String, u16);

/// Endpoints that must never be routed through an outbound HTTP proxy.
///
/// The listener installs its own `{host, port}` at start-up and removes it
/// again when the returned guard is dropped, so self-requests (ping, probes)
/// always go direct.
#[derive(Debug, Clone, Default)]
pub struct ProxyBypass {
    exempt: Arc<RwLock<HashSet<Endpoint>>>,
}

impl ProxyBypass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, host: &str, port: u16) -> BypassGuard {
        let endpoint = (host.to_string(), port);
        if let Ok(mut exempt) = self.exempt.write() {
            exempt.insert(endpoint.clone());
        }
        debug!("Installed proxy bypass for {}:{}", host, port);
        BypassGuard {
            bypass: self.clone(),
            endpoint,
        }
    }

    pub fn is_exempt(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) else {
            return false;
        };
        self.exempt
            .read()
            .map(|exempt| exempt.contains(&(host.to_string(), port)))
            .unwrap_or(false)
    }

    fn uninstall(&self, endpoint: &Endpoint) {
        if let Ok(mut exempt) = self.exempt.write() {
            exempt.remove(endpoint);
        }
        debug!("Removed proxy bypass for {}:{}", endpoint.0, endpoint.1);
    }
}

/// Keeps a bypass entry alive; dropping it uninstalls the entry.
#[derive(Debug)]
pub struct BypassGuard {
    bypass: ProxyBypass,
    endpoint: Endpoint,
}

impl Drop for BypassGuard {
    fn drop(&mut self) {
        self.bypass.uninstall(&self.endpoint);
    }
}
