use crate::request::RequestContext;

pub const DEFAULT_KEY_HEADER: &str = "Idempotency-Key";

/// Where the caller-supplied idempotency key is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// A request header, e.g. `Idempotency-Key`.
    Header(String),
    /// A top-level field of a JSON request body, for callers that cannot
    /// set custom headers.
    BodyField(String),
}

/// Pulls the idempotency key out of an inbound request. Pure: never
/// fabricates a key, never touches storage.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
    source: KeySource,
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self::from_header(DEFAULT_KEY_HEADER)
    }
}

impl KeyExtractor {
    pub fn new(source: KeySource) -> Self {
        Self { source }
    }

    pub fn from_header(name: impl Into<String>) -> Self {
        Self::new(KeySource::Header(name.into()))
    }

    pub fn from_body_field(field: impl Into<String>) -> Self {
        Self::new(KeySource::BodyField(field.into()))
    }

    /// Name of the header this extractor reads, for error reporting.
    pub fn location(&self) -> &str {
        match &self.source {
            KeySource::Header(name) => name,
            KeySource::BodyField(field) => field,
        }
    }

    /// Returns the key if present. Empty values and malformed JSON bodies
    /// count as absent; the coordinator decides what absence means.
    pub fn extract(&self, request: &RequestContext) -> Option<String> {
        let value = match &self.source {
            KeySource::Header(name) => request.header(name).map(str::to_owned),
            KeySource::BodyField(field) => {
                let body = request.body.as_deref()?;
                let parsed: serde_json::Value = serde_json::from_slice(body).ok()?;
                parsed.get(field)?.as_str().map(str::to_owned)
            }
        };

        value.filter(|key| !key.trim().is_empty())
    }
}
