use md5::{Digest, Md5};

use crate::constants::MAX_EXTENSION_LENGTH;

/// Maps a URL to the file name of its complete cache file.
pub trait NameGenerator: Send + Sync {
    /// Must be deterministic; an empty name falls back to [`Md5NameGenerator`].
    fn generate_name(&self, url: &str) -> String;
}

impl<F> NameGenerator for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn generate_name(&self, url: &str) -> String {
        self(url)
    }
}

/// MD5 hex digest of the URL, plus the URL's extension when it has a short one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5NameGenerator;

impl NameGenerator for Md5NameGenerator {
    fn generate_name(&self, url: &str) -> String {
        let digest = Md5::digest(url.as_bytes());
        let name = format!("{:x}", digest);
        match extension(url) {
            Some(ext) => format!("{}.{}", name, ext),
            None => name,
        }
    }
}

/// Text after the last `.` of the final path segment, if 1-4 characters long.
fn extension(url: &str) -> Option<&str> {
    let dot = url.rfind('.')?;
    if url.rfind('/').is_some_and(|slash| slash > dot) {
        return None;
    }
    let ext = &url[dot + 1..];
    let len = ext.chars().count();
    (1..=MAX_EXTENSION_LENGTH).contains(&len).then_some(ext)
}

/// Decides whether a URL should go through the caching proxy at all.
pub trait UrlFilter: Send + Sync {
    fn accept(&self, url: &str) -> bool;
}

impl<F> UrlFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn accept(&self, url: &str) -> bool {
        self(url)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl UrlFilter for AcceptAll {
    fn accept(&self, _url: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpOnly;

impl UrlFilter for HttpOnly {
    fn accept(&self, url: &str) -> bool {
        url.starts_with("http")
    }
}
