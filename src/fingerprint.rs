use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::RequestContext;

/// Digest of an operation's identity and, optionally, its body. Used to
/// detect an idempotency key being replayed against different content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Computes the fingerprint for a request. The body participates only
    /// when `include_body` is set (strict content validation).
    pub fn compute(request: &RequestContext, include_body: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(request.method.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(request.path.as_bytes());

        if include_body {
            hasher.update(b"|");
            if let Some(ref body) = request.body {
                hasher.update(body);
            }
        }

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContentFingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
