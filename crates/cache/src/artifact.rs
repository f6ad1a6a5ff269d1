//! Persisted artifact model and its on-disk encoding
//!
//! An artifact is stored as two lines of JSON:
//!
//! ```text
//! {"schema_version":1,"key":"…","request":{…},"computed_at":"…","payload_sha256":"…"}
//! <payload JSON>
//! ```
//!
//! The header line can be read on its own, which keeps completion checks
//! cheap for large payloads. The full read re-hashes the payload line and
//! rejects anything that does not match the header.

use crate::{CacheKey, Error, EvaluationRequest, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Header of a stored artifact (everything except the payload)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Encoding version the artifact was written with
    pub schema_version: u32,
    /// Key the artifact is stored under
    pub key: CacheKey,
    /// Request that produced the payload
    pub request: EvaluationRequest,
    /// When the payload was computed
    pub computed_at: DateTime<Utc>,
    /// SHA-256 of the serialized payload line
    pub payload_sha256: String,
}

/// A fully loaded artifact
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    /// Header fields
    pub meta: ArtifactMeta,
    /// Evaluation output
    pub payload: Value,
}

impl CachedArtifact {
    /// Key the artifact is stored under
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.meta.key
    }

    /// When the payload was computed
    #[must_use]
    pub fn computed_at(&self) -> DateTime<Utc> {
        self.meta.computed_at
    }

    /// Encoding version the artifact was written with
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.meta.schema_version
    }
}

/// Serialize a new artifact, returning the loaded view and its bytes
pub fn encode(
    key: &CacheKey,
    request: &EvaluationRequest,
    payload: &Value,
) -> Result<(CachedArtifact, Vec<u8>)> {
    // Compact encoding never contains a raw newline, so the payload stays on one line
    let payload_bytes = serde_json::to_vec(payload)
        .map_err(|e| Error::serialization(format!("Failed to serialize payload: {e}")))?;
    let meta = ArtifactMeta {
        schema_version: SCHEMA_VERSION,
        key: key.clone(),
        request: request.clone(),
        computed_at: Utc::now(),
        payload_sha256: hex::encode(Sha256::digest(&payload_bytes)),
    };
    let header = serde_json::to_vec(&meta)
        .map_err(|e| Error::serialization(format!("Failed to serialize header: {e}")))?;

    let mut bytes = Vec::with_capacity(header.len() + payload_bytes.len() + 2);
    bytes.extend_from_slice(&header);
    bytes.push(b'\n');
    bytes.extend_from_slice(&payload_bytes);
    bytes.push(b'\n');

    Ok((
        CachedArtifact {
            meta,
            payload: payload.clone(),
        },
        bytes,
    ))
}

/// Parse and validate a header line
pub fn decode_header(key: &CacheKey, line: &[u8]) -> Result<ArtifactMeta> {
    let line = trim_newline(line);
    if line.is_empty() {
        return Err(Error::corrupt(key.as_hex(), "empty header"));
    }
    let meta: ArtifactMeta = serde_json::from_slice(line)
        .map_err(|e| Error::corrupt(key.as_hex(), format!("unreadable header: {e}")))?;
    if meta.schema_version != SCHEMA_VERSION {
        return Err(Error::corrupt(
            key.as_hex(),
            format!(
                "schema version {} (expected {SCHEMA_VERSION})",
                meta.schema_version
            ),
        ));
    }
    if meta.key != *key {
        return Err(Error::corrupt(
            key.as_hex(),
            format!("header names key {}", meta.key),
        ));
    }
    Ok(meta)
}

/// Parse and validate a complete artifact
pub fn decode(key: &CacheKey, bytes: &[u8]) -> Result<CachedArtifact> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::corrupt(key.as_hex(), "missing payload line"))?;
    let meta = decode_header(key, &bytes[..split])?;

    let payload_bytes = trim_newline(&bytes[split + 1..]);
    let digest = hex::encode(Sha256::digest(payload_bytes));
    if digest != meta.payload_sha256 {
        return Err(Error::corrupt(
            key.as_hex(),
            format!(
                "payload digest {digest} does not match header {}",
                meta.payload_sha256
            ),
        ));
    }
    let payload = serde_json::from_slice(payload_bytes)
        .map_err(|e| Error::corrupt(key.as_hex(), format!("unreadable payload: {e}")))?;

    Ok(CachedArtifact { meta, payload })
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\n").unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParameterSet;
    use serde_json::json;

    fn request() -> EvaluationRequest {
        EvaluationRequest::new("freeze", "pangu", "surface_air_temperature", ParameterSet::new())
    }

    #[test]
    fn test_encode_is_two_lines() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let (_, bytes) = encode(&key, &req, &json!({"text": "multi\nline"})).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_decode_accepts_encoded() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let payload = json!({"rmse": [1.5, 2.25], "cases": 12});
        let (artifact, bytes) = encode(&key, &req, &payload).unwrap();

        let decoded = decode(&key, &bytes).unwrap();
        assert_eq!(decoded, artifact);
        assert_eq!(decoded.schema_version(), SCHEMA_VERSION);
    }

    #[test]
    fn test_decode_header_only() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let (artifact, bytes) = encode(&key, &req, &json!(1)).unwrap();
        let first_line = bytes.split(|b| *b == b'\n').next().unwrap();

        let meta = decode_header(&key, first_line).unwrap();
        assert_eq!(meta, artifact.meta);
    }

    #[test]
    fn test_tampered_payload_is_corrupt() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let (_, bytes) = encode(&key, &req, &json!({"value": 1})).unwrap();
        let tampered = String::from_utf8(bytes)
            .unwrap()
            .replace(r#"{"value":1}"#, r#"{"value":2}"#);

        let err = decode(&key, tampered.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn test_truncated_artifact_is_corrupt() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let (_, bytes) = encode(&key, &req, &json!({"value": 1})).unwrap();

        let err = decode(&key, &bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let other = CacheKey::from_canonical("other");
        let (_, bytes) = encode(&key, &req, &json!(null)).unwrap();

        let err = decode(&other, &bytes).unwrap_err();
        assert!(err.to_string().contains("header names key"));
    }

    #[test]
    fn test_future_schema_version_is_corrupt() {
        let req = request();
        let key = CacheKey::derive(&req).unwrap();
        let (artifact, _) = encode(&key, &req, &json!(null)).unwrap();
        let mut meta = artifact.meta;
        meta.schema_version = SCHEMA_VERSION + 1;
        let line = serde_json::to_vec(&meta).unwrap();

        let err = decode_header(&key, &line).unwrap_err();
        assert!(err.to_string().contains("schema version"));
    }
}
