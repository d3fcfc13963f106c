use std::collections::HashMap;

/// Supplies extra request headers for upstream fetches of a URL.
pub trait HeaderProvider: Send + Sync {
    fn headers(&self, url: &str) -> HashMap<String, String>;
}

impl HeaderProvider for HashMap<String, String> {
    fn headers(&self, _url: &str) -> HashMap<String, String> {
        self.clone()
    }
}

impl<F> HeaderProvider for F
where
    F: Fn(&str) -> HashMap<String, String> + Send + Sync,
{
    fn headers(&self, url: &str) -> HashMap<String, String> {
        self(url)
    }
}

/// Global headers first, then the per-URL ones; later entries override earlier ones.
pub fn merge_headers(
    url: &str,
    global: Option<&dyn HeaderProvider>,
    per_url: Option<&dyn HeaderProvider>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for provider in [global, per_url].into_iter().flatten() {
        for (name, value) in provider.headers(url) {
            merged.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
            merged.push((name, value));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_url_headers_override_global() {
        let global: HashMap<String, String> = [
            ("User-Agent".to_string(), "global".to_string()),
            ("X-Token".to_string(), "abc".to_string()),
        ]
        .into();
        let per_url = |url: &str| -> HashMap<String, String> {
            [("user-agent".to_string(), format!("for {}", url))].into()
        };

        let merged = merge_headers("http://a/v.mp4", Some(&global), Some(&per_url));

        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&("X-Token".to_string(), "abc".to_string())));
        assert!(merged.contains(&("user-agent".to_string(), "for http://a/v.mp4".to_string())));
    }

    #[test]
    fn test_no_providers() {
        assert!(merge_headers("http://a/v.mp4", None, None).is_empty());
    }
}
