//! # Call Fingerprinting
//!
//! Derives a stable identity for a call from its semantic inputs. The signature is rendered
//! into a canonical JSON text (object keys sorted at every depth, query parameters sorted by
//! name, absent fields omitted) and hashed with SHA-256.
//!
//! Absent optional fields are left out of the canonical form entirely, so "no body" and
//! "an empty body" produce different fingerprints. Values with no canonical JSON form
//! (non-string map keys, NaN, infinities) are rejected rather than coerced.
//!
//! ## Store keys
//!
//! Besides the full digest, every [`SignatureField`] gets its own short hash, and the store
//! key lists them as segments:
//!
//! ```text
//! {prefix}:{namespace}:m=…:u=…:q=…:b=…:h=…:c=…:a=…:d={digest}
//! ```
//!
//! so entries can be selected by any combination of fields with
//! [`Fingerprint::key_pattern`].

mod finite;

use crate::error::{ToolkitError, ToolkitResult};
use crate::store::KeyPattern;
use finite::ensure_finite;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Semantic inputs of one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSignature {
    method: String,
    target: String,
    query: Option<Vec<(String, String)>>,
    body: Option<Value>,
    headers: Option<BTreeMap<String, String>>,
    cookies: Option<BTreeMap<String, String>>,
    arguments: Option<BTreeMap<String, Value>>,
}

impl CallSignature {
    /// Create a signature for `method` on `target`
    ///
    /// The method is upper-cased so `get` and `GET` identify the same call.
    pub fn new(method: impl AsRef<str>, target: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            target: target.into(),
            ..Default::default()
        }
    }

    /// Add one query parameter
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    /// Set the full query; an empty iterator still marks the query as present
    pub fn query<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query = Some(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Attach a structured body
    pub fn body<T: Serialize + ?Sized>(mut self, body: &T) -> ToolkitResult<Self> {
        self.body = Some(representable(body, "body")?);
        Ok(self)
    }

    /// Attach an already-structured body
    pub fn json_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Include a header in the identity (names are case-insensitive)
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Include a cookie in the identity
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Include a non-HTTP keyword argument of the wrapped call
    pub fn argument<T: Serialize + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> ToolkitResult<Self> {
        let name = name.into();
        let value = representable(value, &format!("argument '{name}'"))?;
        self.arguments
            .get_or_insert_with(BTreeMap::new)
            .insert(name, value);
        Ok(self)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The part of the signature that identifies a request *type* for admission scoping:
    /// method, target, headers and cookies
    pub fn request_type(&self) -> Self {
        Self {
            method: self.method.clone(),
            target: self.target.clone(),
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
            ..Default::default()
        }
    }

    /// Canonical form of one field; `None` when the field is absent
    fn field_value(&self, field: SignatureField) -> Option<Value> {
        match field {
            SignatureField::Method => Some(Value::String(self.method.clone())),
            SignatureField::Target => Some(Value::String(self.target.clone())),
            SignatureField::Query => self.query.as_ref().map(|query| {
                // Stable sort: repeated names keep their relative order
                let mut sorted = query.clone();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Array(
                    sorted
                        .into_iter()
                        .map(|(k, v)| Value::Array(vec![Value::String(k), Value::String(v)]))
                        .collect(),
                )
            }),
            SignatureField::Body => self.body.clone(),
            SignatureField::Headers => self.headers.as_ref().map(string_map),
            SignatureField::Cookies => self.cookies.as_ref().map(string_map),
            SignatureField::Arguments => self
                .arguments
                .as_ref()
                .map(|arguments| Value::Object(arguments.clone().into_iter().collect())),
        }
    }

    /// Canonical text of this signature
    pub fn canonical(&self) -> String {
        let mut root = Map::new();
        for field in SignatureField::ALL {
            if let Some(value) = self.field_value(field) {
                root.insert(field.name().to_string(), value);
            }
        }

        let mut out = String::new();
        write_canonical(&Value::Object(root), &mut out);
        out
    }
}

/// Serialize `value` for a signature, rejecting anything without a canonical form
fn representable<T: Serialize + ?Sized>(value: &T, what: &str) -> ToolkitResult<Value> {
    ensure_finite(value)
        .map_err(|e| ToolkitError::Serialization(format!("{what} is not representable: {e}")))?;
    serde_json::to_value(value)
        .map_err(|e| ToolkitError::Serialization(format!("{what} is not representable: {e}")))
}

/// The separately hashed parts of a [`CallSignature`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureField {
    Method,
    Target,
    Query,
    Body,
    Headers,
    Cookies,
    Arguments,
}

impl SignatureField {
    /// Every field, in key segment order
    pub const ALL: [SignatureField; 7] = [
        Self::Method,
        Self::Target,
        Self::Query,
        Self::Body,
        Self::Headers,
        Self::Cookies,
        Self::Arguments,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Target => "target",
            Self::Query => "query",
            Self::Body => "body",
            Self::Headers => "headers",
            Self::Cookies => "cookies",
            Self::Arguments => "arguments",
        }
    }

    /// Label of this field's key segment
    fn label(self) -> &'static str {
        match self {
            Self::Method => "m",
            Self::Target => "u",
            Self::Query => "q",
            Self::Body => "b",
            Self::Headers => "h",
            Self::Cookies => "c",
            Self::Arguments => "a",
        }
    }
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Write `value` with object keys sorted at every depth and no insignificant whitespace
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Namespaced digest of a call signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    namespace: String,
    digest: String,
    /// Per-field hashes, in `SignatureField::ALL` order
    segments: [String; 7],
}

impl Fingerprint {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hex-encoded SHA-256 digest
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Short hash of one field of the signature
    pub fn segment(&self, field: SignatureField) -> &str {
        &self.segments[field as usize]
    }

    /// Store key for this fingerprint under `prefix`
    pub fn key(&self, prefix: &str) -> String {
        let mut key = format!("{}:{}:", prefix, self.namespace);
        for (field, segment) in SignatureField::ALL.iter().zip(&self.segments) {
            key.push_str(field.label());
            key.push('=');
            key.push_str(segment);
            key.push(':');
        }
        key.push_str("d=");
        key.push_str(&self.digest);
        key
    }

    /// Pattern matching the key of every signature in this namespace that agrees with this
    /// one on each of `fields`; the other fields may hold anything
    pub fn key_pattern(&self, prefix: &str, fields: &[SignatureField]) -> KeyPattern {
        let mut pattern = KeyPattern::literal(format!("{}:{}:", prefix, self.namespace));
        for (field, segment) in SignatureField::ALL.iter().zip(&self.segments) {
            pattern = pattern.then(format!("{}=", field.label()));
            pattern = if fields.contains(field) {
                pattern.then(segment.as_str())
            } else {
                pattern.wildcard()
            };
            pattern = pattern.then(":");
        }
        pattern.then("d=").wildcard()
    }
}

/// Builds fingerprints for one wrapped site
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    namespace: String,
}

impl FingerprintBuilder {
    pub fn new(namespace: impl Into<String>) -> ToolkitResult<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn build(&self, signature: &CallSignature) -> Fingerprint {
        let digest = Sha256::digest(signature.canonical().as_bytes());
        Fingerprint {
            namespace: self.namespace.clone(),
            digest: hex::encode(digest),
            segments: SignatureField::ALL.map(|field| segment_hash(signature, field)),
        }
    }
}

/// First 64 bits of the field's canonical hash; an absent field hashes the empty text,
/// which no canonical JSON value renders to
fn segment_hash(signature: &CallSignature, field: SignatureField) -> String {
    let mut text = String::new();
    if let Some(value) = signature.field_value(field) {
        write_canonical(&value, &mut text);
    }
    hex::encode(&Sha256::digest(text.as_bytes())[..8])
}

/// Fingerprint `signature` under `namespace`
pub fn build(namespace: &str, signature: &CallSignature) -> ToolkitResult<Fingerprint> {
    Ok(FingerprintBuilder::new(namespace)?.build(signature))
}

/// Namespaces become key segments and scan prefixes, so they must not contain the
/// segment separator or glob metacharacters.
pub(crate) fn validate_namespace(namespace: &str) -> ToolkitResult<()> {
    if namespace.is_empty() {
        return Err(ToolkitError::Serialization(
            "namespace must not be empty".to_string(),
        ));
    }
    if let Some(c) = namespace
        .chars()
        .find(|c| matches!(c, ':' | '*' | '?' | '[' | ']' | '\\') || c.is_whitespace())
    {
        return Err(ToolkitError::Serialization(format!(
            "namespace '{namespace}' contains reserved character {c:?}"
        )));
    }
    Ok(())
}
