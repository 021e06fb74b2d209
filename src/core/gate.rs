//! Output gating for oversized results.
//!
//! Large intermediate results are replaced by a small artifact reference so
//! the pipeline never carries multi-megabyte payloads between stages. Callers
//! that need the full payload fetch it out of band using the content hash.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialized size above which a result is replaced by a stub.
pub const GATE_THRESHOLD_BYTES: usize = 10_000;

/// Maximum characters kept in a stub preview.
pub const PREVIEW_CHARS: usize = 200;

/// Reference stub substituted for an oversized result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStub {
    /// MIME type of the gated content.
    pub content_type: String,
    /// Hex-encoded SHA-256 of the serialized content.
    pub content_hash: String,
    /// Serialized length in bytes.
    pub byte_length: usize,
    /// Leading characters of the serialized content.
    pub preview: String,
}

/// A task result after gating: either the original value or a stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatedOutput {
    /// The result fit under the threshold and passes through unchanged.
    Inline {
        /// The original value.
        value: Value,
    },
    /// The result was oversized and is represented by a reference stub.
    Stub {
        /// The reference stub.
        stub: ArtifactStub,
    },
}

impl GatedOutput {
    /// The inline value, if the output was not gated.
    #[must_use]
    pub const fn as_inline(&self) -> Option<&Value> {
        match self {
            Self::Inline { value } => Some(value),
            Self::Stub { .. } => None,
        }
    }

    /// The stub, if the output was gated.
    #[must_use]
    pub const fn as_stub(&self) -> Option<&ArtifactStub> {
        match self {
            Self::Stub { stub } => Some(stub),
            Self::Inline { .. } => None,
        }
    }
}

/// Gate a result value behind the serialized-size threshold.
#[must_use]
pub fn gate_output(value: Value) -> GatedOutput {
    // Value maps always carry string keys, so serialization cannot fail in
    // practice; an unserializable value passes through ungated.
    let Ok(bytes) = serde_json::to_vec(&value) else {
        return GatedOutput::Inline { value };
    };
    if bytes.len() <= GATE_THRESHOLD_BYTES {
        return GatedOutput::Inline { value };
    }

    let content_type = match &value {
        Value::String(_) => "text/plain",
        _ => "application/json",
    };
    let text = String::from_utf8_lossy(&bytes);
    let preview: String = text.chars().take(PREVIEW_CHARS).collect();

    tracing::debug!(
        byte_length = bytes.len(),
        threshold = GATE_THRESHOLD_BYTES,
        "result gated behind artifact stub"
    );

    GatedOutput::Stub {
        stub: ArtifactStub {
            content_type: content_type.to_string(),
            content_hash: hex::encode(Sha256::digest(&bytes)),
            byte_length: bytes.len(),
            preview,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_result_passes_through() {
        let value = json!({"answer": 42});
        let gated = gate_output(value.clone());
        assert_eq!(gated.as_inline(), Some(&value));
    }

    #[test]
    fn result_at_threshold_passes_through() {
        // "x...x" serializes to the payload plus two quote bytes.
        let value = Value::String("x".repeat(GATE_THRESHOLD_BYTES - 2));
        let gated = gate_output(value);
        assert!(gated.as_inline().is_some());
    }

    #[test]
    fn oversized_result_is_stubbed() {
        let value = Value::String("y".repeat(GATE_THRESHOLD_BYTES * 2));
        let gated = gate_output(value);
        let stub = gated.as_stub().expect("expected stub");
        assert_eq!(stub.byte_length, GATE_THRESHOLD_BYTES * 2 + 2);
        assert_eq!(stub.content_hash.len(), 64);
        assert_eq!(stub.preview.chars().count(), PREVIEW_CHARS);
        assert_eq!(stub.content_type, "text/plain");
    }

    #[test]
    fn stub_hash_is_stable() {
        let value = Value::String("z".repeat(20_000));
        let a = gate_output(value.clone());
        let b = gate_output(value);
        assert_eq!(a.as_stub().unwrap().content_hash, b.as_stub().unwrap().content_hash);
    }
}
