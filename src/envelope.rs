//! Envelope wrapper used where routing metadata must travel with a payload.
//!
//! Most operators pass raw values; envelopes only appear at routing
//! boundaries. Header keys are case-insensitive (lower-cased on insertion
//! and lookup).

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

/// Header key carrying the origin identifier of an envelope.
pub const ORIGIN_HEADER: &str = "x-reactor-origin";

static NEXT_ENVELOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Case-insensitive string→string header mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts with a lower-cased key, returning the previous value if any.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.to_lowercase(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn origin(&self) -> Option<&str> {
        self.get(ORIGIN_HEADER)
    }

    pub fn set_origin(&mut self, origin: impl Into<String>) {
        self.set(ORIGIN_HEADER, origin);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Immutable shared snapshot of the current headers.
    pub fn snapshot(&self) -> Arc<Headers> {
        Arc::new(self.clone())
    }
}

/// A payload plus routing metadata: lazily-assigned unique id, headers and
/// an optional reply-to tag.
#[derive(Debug)]
pub struct Envelope<T> {
    payload: T,
    id: OnceLock<u64>,
    headers: Headers,
    reply_to: Option<String>,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            id: OnceLock::new(),
            headers: Headers::new(),
            reply_to: None,
        }
    }

    pub fn with_headers(payload: T, headers: Headers) -> Self {
        Self {
            payload,
            id: OnceLock::new(),
            headers,
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, target: impl Into<String>) -> Self {
        self.reply_to = Some(target.into());
        self
    }

    /// Process-unique identifier, assigned on first read.
    pub fn id(&self) -> u64 {
        *self
            .id
            .get_or_init(|| NEXT_ENVELOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn reply_to_tag(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Maps the payload, carrying id, headers and reply-to over unchanged.
    pub fn map<O>(self, f: impl FnOnce(T) -> O) -> Envelope<O> {
        Envelope {
            payload: f(self.payload),
            id: self.id,
            headers: self.headers,
            reply_to: self.reply_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Header keys are case-insensitive on insert and lookup
    #[test]
    fn test_case_insensitive_headers() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.contains("Content-type"));

        headers.set("CONTENT-TYPE", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type"), Some("application/json"));
    }

    /// The origin header uses its pinned literal key
    #[test]
    fn test_origin_header() {
        let mut headers = Headers::new();
        headers.set_origin("node-7");
        assert_eq!(headers.get("X-Reactor-Origin"), Some("node-7"));
        assert_eq!(headers.origin(), Some("node-7"));
    }

    /// Ids are lazy, unique and stable per envelope
    #[test]
    fn test_lazy_unique_ids() {
        let a = Envelope::new("a");
        let b = Envelope::new("b");
        let a_id = a.id();
        assert_eq!(a.id(), a_id);
        assert_ne!(b.id(), a_id);
    }

    /// Mapping the payload preserves the already-assigned id and metadata
    #[test]
    fn test_map_preserves_metadata() {
        let mut envelope = Envelope::new(21).reply_to("replies");
        envelope.headers_mut().set_origin("source-1");
        let id = envelope.id();

        let doubled = envelope.map(|n| n * 2);
        assert_eq!(*doubled.payload(), 42);
        assert_eq!(doubled.id(), id);
        assert_eq!(doubled.headers().origin(), Some("source-1"));
        assert_eq!(doubled.reply_to_tag(), Some("replies"));
    }
}
