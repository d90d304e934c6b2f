//! Request metadata and HTTP/2 request-header synthesis.

use crate::codec::HeaderField;

/// Reserved metadata key whose value overrides the `:authority`
/// pseudo-header for a single call. Stripped from the metadata before the
/// remaining pairs are sent as HTTP/2 headers.
pub const AUTHORITY_OVERRIDE_KEY: &str = "authority-override";

/// Application metadata attached to a call.
///
/// Keys are normalized to lowercase ASCII. Insertion order is preserved so
/// headers go on the wire in the order the caller supplied them; duplicate
/// keys are allowed.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key-value pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((key.into().to_ascii_lowercase(), value.into()));
    }

    /// Get the first value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove every value for a key, returning the first removed value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        let mut removed = None;
        self.entries.retain(|(k, v)| {
            if *k == key {
                if removed.is_none() {
                    removed = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Check whether the metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of entries, counting duplicates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// Build the full HTTP/2 request header list for a call.
///
/// The [`AUTHORITY_OVERRIDE_KEY`] entry, if present, is removed from the
/// metadata and becomes the `:authority` pseudo-header; otherwise
/// `default_authority` is used. All remaining metadata pairs follow the
/// fixed request headers verbatim, except attempts to smuggle pseudo-headers
/// or the reserved transport headers, which are dropped.
pub(crate) fn create_request_headers(
    metadata: &mut Metadata,
    path: &str,
    default_authority: &str,
    scheme: &str,
) -> Vec<HeaderField> {
    let authority = metadata
        .remove(AUTHORITY_OVERRIDE_KEY)
        .unwrap_or_else(|| default_authority.to_string());

    let mut headers = vec![
        HeaderField::new(":method", "POST"),
        HeaderField::new(":scheme", scheme),
        HeaderField::new(":path", path),
        HeaderField::new(":authority", authority.as_str()),
        HeaderField::new("content-type", "application/grpc"),
        HeaderField::new("te", "trailers"),
    ];

    for (key, value) in metadata.iter() {
        if key.starts_with(':') || key == "content-type" || key == "te" {
            continue;
        }
        headers.push(HeaderField::new(key, value));
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_value<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a [u8]> {
        headers
            .iter()
            .find(|h| h.name == name.as_bytes())
            .map(|h| h.value.as_slice())
    }

    #[test]
    fn insert_normalizes_keys() {
        let mut metadata = Metadata::new();
        metadata.insert("X-Custom", "value");
        assert_eq!(metadata.get("x-custom"), Some("value"));
        assert_eq!(metadata.get("X-CUSTOM"), Some("value"));
    }

    #[test]
    fn remove_returns_first_and_drops_all() {
        let mut metadata = Metadata::new();
        metadata.insert("k", "a");
        metadata.insert("k", "b");
        assert_eq!(metadata.remove("k"), Some("a".to_string()));
        assert!(metadata.get("k").is_none());
        assert!(metadata.is_empty());
    }

    #[test]
    fn request_headers_use_default_authority() {
        let mut metadata = Metadata::new();
        let headers =
            create_request_headers(&mut metadata, "/svc/M", "example.com:443", "https");
        assert_eq!(header_value(&headers, ":authority"), Some(&b"example.com:443"[..]));
        assert_eq!(header_value(&headers, ":path"), Some(&b"/svc/M"[..]));
        assert_eq!(header_value(&headers, ":method"), Some(&b"POST"[..]));
        assert_eq!(header_value(&headers, ":scheme"), Some(&b"https"[..]));
        assert_eq!(header_value(&headers, "te"), Some(&b"trailers"[..]));
    }

    #[test]
    fn authority_override_is_stripped_and_applied() {
        let mut metadata = Metadata::new();
        metadata.insert(AUTHORITY_OVERRIDE_KEY, "other.example.com");
        metadata.insert("x-trace", "abc");
        let headers = create_request_headers(&mut metadata, "/svc/M", "example.com", "https");
        assert_eq!(
            header_value(&headers, ":authority"),
            Some(&b"other.example.com"[..])
        );
        assert_eq!(header_value(&headers, "x-trace"), Some(&b"abc"[..]));
        // The override key itself never reaches the wire.
        assert!(header_value(&headers, AUTHORITY_OVERRIDE_KEY).is_none());
        assert!(metadata.get(AUTHORITY_OVERRIDE_KEY).is_none());
    }

    #[test]
    fn reserved_headers_are_dropped() {
        let mut metadata = Metadata::new();
        metadata.insert(":status", "200");
        metadata.insert("te", "gzip");
        metadata.insert("content-type", "text/plain");
        metadata.insert("x-ok", "1");
        let headers = create_request_headers(&mut metadata, "/svc/M", "a", "http");
        assert_eq!(header_value(&headers, "content-type"), Some(&b"application/grpc"[..]));
        assert_eq!(header_value(&headers, "te"), Some(&b"trailers"[..]));
        assert_eq!(header_value(&headers, "x-ok"), Some(&b"1"[..]));
        assert!(!headers.iter().any(|h| h.name == b":status"));
    }

    #[test]
    fn metadata_order_preserved() {
        let mut metadata = Metadata::new();
        metadata.insert("a", "1");
        metadata.insert("b", "2");
        metadata.insert("a", "3");
        let pairs: Vec<_> = metadata.iter().collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "2"), ("a", "3")]);
    }
}
