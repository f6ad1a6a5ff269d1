//! Deterministic cache keys for evaluation requests
//!
//! A key is the SHA-256 digest of the request's canonical JSON encoding.
//! Canonical means every object (including objects nested inside parameter
//! values) is emitted with its keys sorted, so the key never depends on the
//! order in which parameters were inserted or on the process computing it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Computation parameters of an evaluation, keyed by parameter name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, Value>);

impl ParameterSet {
    /// Create an empty parameter set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert or replace a parameter
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a parameter
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Number of parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no parameters are set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate parameters in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One evaluation the external library can perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// Event category, e.g. `heat_wave`
    pub event_type: String,
    /// Forecast model identifier, e.g. `hres`
    pub model_id: String,
    /// Evaluated variable, e.g. `surface_air_temperature`
    pub variable_name: String,
    /// Computation parameters
    #[serde(default)]
    pub parameter_set: ParameterSet,
}

impl EvaluationRequest {
    /// Create a request
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        model_id: impl Into<String>,
        variable_name: impl Into<String>,
        parameter_set: ParameterSet,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            model_id: model_id.into(),
            variable_name: variable_name.into(),
            parameter_set,
        }
    }

    /// Canonical JSON encoding (sorted object keys at every depth)
    pub fn canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self)
            .map_err(|e| Error::serialization(format!("Failed to encode request: {e}")))?;
        serde_json::to_string(&canonicalize(value))
            .map_err(|e| Error::serialization(format!("Failed to serialize request: {e}")))
    }

    /// Short human-readable label for logs
    #[must_use]
    pub fn label(&self) -> String {
        if self.parameter_set.is_empty() {
            format!("{}/{}/{}", self.event_type, self.model_id, self.variable_name)
        } else {
            let params = self
                .parameter_set
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{}/{}/{}[{params}]",
                self.event_type, self.model_id, self.variable_name
            )
        }
    }
}

/// Rebuild a JSON value so that every object lists its keys in sorted order.
///
/// Inserting into a fresh map in sorted order keeps the result canonical whether
/// or not serde_json's `preserve_order` feature is enabled somewhere in the build.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Deterministic identifier of an [`EvaluationRequest`] (SHA-256 as hex)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl CacheKey {
    /// Derive the key of a request
    pub fn derive(request: &EvaluationRequest) -> Result<Self> {
        let canonical = request.canonical_json()?;
        Ok(Self::from_canonical(&canonical))
    }

    /// Key for an already-canonical encoding
    #[must_use]
    pub fn from_canonical(canonical: &str) -> Self {
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Parse a key from its hex form
    ///
    /// # Errors
    ///
    /// Returns error if the string is not 64 lowercase hex characters
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != 64 {
            return Err(Error::serialization(format!(
                "Cache key must be 64 hex characters, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(Error::serialization(
                "Cache key must contain only lowercase hex digits",
            ));
        }
        Ok(Self(s))
    }

    /// Full hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heat_request() -> EvaluationRequest {
        EvaluationRequest::new(
            "heat_wave",
            "hres",
            "surface_air_temperature",
            ParameterSet::new()
                .with("lead_time_days", json!([1, 3, 5]))
                .with("target", "era5"),
        )
    }

    // ==========================================================================
    // ParameterSet tests
    // ==========================================================================

    #[test]
    fn test_parameter_set_from_iter() {
        let params: ParameterSet = [("a", json!(1)), ("b", json!("x"))].into_iter().collect();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("b"), Some(&json!("x")));
    }

    #[test]
    fn test_parameter_set_serializes_as_plain_object() {
        let params = ParameterSet::new().with("n", 3);
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"n":3}"#);
    }

    // ==========================================================================
    // Canonical encoding tests
    // ==========================================================================

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let mut nested = Map::new();
        nested.insert("zeta".into(), json!(1));
        nested.insert("alpha".into(), json!(2));
        let request = EvaluationRequest::new(
            "freeze",
            "gc",
            "surface_air_temperature",
            ParameterSet::new().with("opts", Value::Object(nested)),
        );

        let canonical = request.canonical_json().unwrap();
        let alpha = canonical.find("alpha").unwrap();
        let zeta = canonical.find("zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_label_without_params() {
        let request = EvaluationRequest::new("heat_wave", "aifs", "t2m", ParameterSet::new());
        assert_eq!(request.label(), "heat_wave/aifs/t2m");
    }

    #[test]
    fn test_label_with_params() {
        let request = EvaluationRequest::new(
            "heat_wave",
            "aifs",
            "t2m",
            ParameterSet::new().with("target", "ghcn"),
        );
        assert_eq!(request.label(), r#"heat_wave/aifs/t2m[target="ghcn"]"#);
    }

    // ==========================================================================
    // CacheKey tests
    // ==========================================================================

    #[test]
    fn cache_key_is_stable_across_calls() {
        let request = heat_request();
        let k1 = CacheKey::derive(&request).unwrap();
        let k2 = CacheKey::derive(&request.clone()).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.as_hex().len(), 64);
    }

    #[test]
    fn cache_key_ignores_parameter_insertion_order() {
        let mut a = ParameterSet::new();
        a.insert("target", "era5");
        a.insert("lead_time_days", json!([1, 3, 5]));
        let mut b = ParameterSet::new();
        b.insert("lead_time_days", json!([1, 3, 5]));
        b.insert("target", "era5");

        let ka = CacheKey::derive(&EvaluationRequest::new("heat_wave", "hres", "t", a)).unwrap();
        let kb = CacheKey::derive(&EvaluationRequest::new("heat_wave", "hres", "t", b)).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn cache_key_changes_with_each_field() {
        let base = heat_request();
        let base_key = CacheKey::derive(&base).unwrap();

        let mut event = base.clone();
        event.event_type = "freeze".into();
        let mut model = base.clone();
        model.model_id = "pangu".into();
        let mut variable = base.clone();
        variable.variable_name = "air_temperature".into();
        let mut params = base.clone();
        params.parameter_set.insert("target", "ghcn");

        for changed in [event, model, variable, params] {
            assert_ne!(
                base_key,
                CacheKey::derive(&changed).unwrap(),
                "Key must change when {} differs from {}",
                changed.label(),
                base.label()
            );
        }
    }

    #[test]
    fn cache_key_does_not_confuse_field_boundaries() {
        // Naive concatenation would make these collide
        let a = EvaluationRequest::new("heat", "_wave", "t", ParameterSet::new());
        let b = EvaluationRequest::new("heat_", "wave", "t", ParameterSet::new());
        assert_ne!(CacheKey::derive(&a).unwrap(), CacheKey::derive(&b).unwrap());
    }

    #[test]
    fn test_from_hex_validation() {
        let key = CacheKey::derive(&heat_request()).unwrap();
        assert_eq!(CacheKey::from_hex(key.as_hex()).unwrap(), key);
        assert!(CacheKey::from_hex("abc").is_err());
        assert!(CacheKey::from_hex("X".repeat(64)).is_err());
        assert!(CacheKey::from_hex("A".repeat(64)).is_err());
    }

    #[test]
    fn test_deserialize_validates_hex() {
        let key = CacheKey::derive(&heat_request()).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.as_hex()));
        assert_eq!(serde_json::from_str::<CacheKey>(&json).unwrap(), key);
        assert!(serde_json::from_str::<CacheKey>("\"abc\"").is_err());
        assert!(serde_json::from_str::<CacheKey>(&format!("\"{}\"", "Z".repeat(64))).is_err());
    }

    #[test]
    fn test_short_key() {
        let key = CacheKey::derive(&heat_request()).unwrap();
        assert_eq!(key.short().len(), 12);
        assert!(key.as_hex().starts_with(key.short()));
    }
}
