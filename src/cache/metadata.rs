use std::fmt;

/// What the network told us about a resource.
///
/// Two values are equal only when url, mime and length all match; storage
/// uses that to skip redundant writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SourceInfo {
    pub url: String,
    /// MIME type, empty when the server did not send one
    pub mime: String,
    /// Total resource length in bytes, `None` when unknown
    pub length: Option<u64>,
}

impl SourceInfo {
    pub fn new(url: impl Into<String>, mime: Option<String>, length: Option<u64>) -> Self {
        Self {
            url: url.into(),
            mime: mime.unwrap_or_default(),
            length,
        }
    }

    /// Length usable for `Content-Length`/`Content-Range`.
    pub fn known_length(&self) -> Option<u64> {
        self.length.filter(|len| *len > 0)
    }

    pub fn known_mime(&self) -> Option<&str> {
        if self.mime.is_empty() {
            None
        } else {
            Some(&self.mime)
        }
    }

    /// Length as stored in the database column (`-1` for unknown).
    pub(crate) fn length_column(&self) -> i64 {
        self.length
            .and_then(|len| i64::try_from(len).ok())
            .unwrap_or(-1)
    }

    pub(crate) fn from_columns(url: String, mime: Option<String>, length: i64) -> Self {
        Self {
            url,
            mime: mime.unwrap_or_default(),
            length: u64::try_from(length).ok(),
        }
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(len) => write!(f, "{} ({}, {} bytes)", self.url, self.mime, len),
            None => write!(f, "{} ({}, unknown length)", self.url, self.mime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_covers_all_fields() {
        let a = SourceInfo::new("http://a/v.mp4", Some("video/mp4".into()), Some(10));
        let b = SourceInfo::new("http://a/v.mp4", Some("video/mp4".into()), Some(10));
        let c = SourceInfo::new("http://a/v.mp4", Some("video/mp4".into()), Some(11));
        let d = SourceInfo::new("http://a/v.mp4", None, Some(10));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_known_values() {
        let info = SourceInfo::new("u", None, Some(0));
        assert_eq!(info.known_length(), None);
        assert_eq!(info.known_mime(), None);

        let info = SourceInfo::new("u", Some("audio/mpeg".into()), Some(42));
        assert_eq!(info.known_length(), Some(42));
        assert_eq!(info.known_mime(), Some("audio/mpeg"));
    }

    #[test]
    fn test_column_conversion() {
        let unknown = SourceInfo::new("u", None, None);
        assert_eq!(unknown.length_column(), -1);
        assert_eq!(SourceInfo::from_columns("u".into(), None, -1), unknown);

        let known = SourceInfo::new("u", Some("video/mp4".into()), Some(1234));
        assert_eq!(
            SourceInfo::from_columns("u".into(), Some("video/mp4".into()), 1234),
            known
        );
    }
}
