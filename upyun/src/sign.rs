//! Request signing.
//!
//! Everything here is a pure function of its inputs. REST calls sign
//! `METHOD&uri&date&length&md5(password)`; policy-style calls (multipart,
//! pretreatment, callbacks) sign a canonical `key + value` concatenation
//! produced by [`canonical_string`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::hasher::md5_hex;
use crate::{UpyunError, UpyunResult};

/// Callback fields covered by the pretreatment callback signature
pub const CALLBACK_FIELDS: [&str; 6] = [
    "bucket_name",
    "status_code",
    "path",
    "description",
    "task_id",
    "info",
];

/// RFC 1123 date as used in the `Date` header
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// The signing key: hex MD5 of the plaintext password
pub fn hash_password(plain: &str) -> String {
    md5_hex(plain)
}

/// An UPYUN operator with its pre-hashed password
#[derive(Clone)]
pub struct Operator {
    username: String,
    password_hash: String,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Operator {
    /// Hashes the password once; the plaintext is not kept
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password_hash: hash_password(password),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    /// `Authorization` value for a REST call
    pub fn rest_authorization(&self, method: &str, uri: &str, date: &str, length: u64) -> String {
        let signature = md5_hex(format!(
            "{method}&{uri}&{date}&{length}&{}",
            self.password_hash
        ));
        format!("UPYUN {}:{signature}", self.username)
    }

    /// `Authorization` value for a purge call
    pub fn purge_authorization(&self, bucket: &str, urls: &str, date: &str) -> String {
        let signature = md5_hex(format!("{urls}&{bucket}&{date}&{}", self.password_hash));
        format!("UpYun {bucket}:{}:{signature}", self.username)
    }

    /// Signature for pretreatment fields: `md5(operator + canonical + password_hash)`
    pub fn pretreat_signature(&self, fields: &Map<String, Value>) -> UpyunResult<String> {
        let canonical = canonical_string(fields)?;
        Ok(md5_hex(format!(
            "{}{canonical}{}",
            self.username, self.password_hash
        )))
    }

    /// `Authorization` value for a pretreatment or status call
    pub fn pretreat_authorization(&self, fields: &Map<String, Value>) -> UpyunResult<String> {
        Ok(format!(
            "UPYUN {}:{}",
            self.username,
            self.pretreat_signature(fields)?
        ))
    }

    /// Check the signature UPYUN attaches to a pretreatment callback.
    ///
    /// Only [`CALLBACK_FIELDS`] take part; list values are joined with a
    /// single space before signing.
    pub fn verify_callback(&self, callback: &Map<String, Value>) -> bool {
        let Some(Value::String(expected)) = callback.get("signature") else {
            return false;
        };

        let mut fields = Map::new();
        for key in CALLBACK_FIELDS {
            let Some(value) = callback.get(key) else {
                continue;
            };
            let value = match value {
                Value::Array(items) => Value::String(
                    items
                        .iter()
                        .map(scalar_text)
                        .collect::<Option<Vec<_>>>()
                        .map(|parts| parts.join(" "))
                        .unwrap_or_default(),
                ),
                other => other.clone(),
            };
            fields.insert(key.to_string(), value);
        }

        match self.pretreat_signature(&fields) {
            Ok(actual) => actual == *expected,
            Err(_) => false,
        }
    }
}

/// Sorted `key + value` concatenation shared by every policy-style signature.
///
/// Strings are taken raw, numbers and booleans by their JSON text, arrays as
/// their elements joined without a separator. Nulls and nested objects are
/// rejected.
pub fn canonical_string(fields: &Map<String, Value>) -> UpyunResult<String> {
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        match &fields[key] {
            Value::Array(items) => {
                for item in items {
                    out.push_str(&scalar_text(item).ok_or_else(|| unsignable(key))?);
                }
            }
            value => out.push_str(&scalar_text(value).ok_or_else(|| unsignable(key))?),
        }
    }
    Ok(out)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn unsignable(key: &str) -> UpyunError {
    UpyunError::client(format!("field '{key}' cannot be signed"))
}

/// Multipart policy signature: `md5(canonical + secret)`
pub fn policy_signature(fields: &Map<String, Value>, secret: &str) -> UpyunResult<String> {
    Ok(md5_hex(format!("{}{secret}", canonical_string(fields)?)))
}

/// Form API signature: `md5(policy&secret)`
pub fn form_signature(policy: &str, secret: &str) -> String {
    md5_hex(format!("{policy}&{secret}"))
}

/// base64 of the JSON encoding of a policy document
pub fn encode_policy(fields: &Map<String, Value>) -> UpyunResult<String> {
    Ok(STANDARD.encode(serde_json::to_vec(fields)?))
}

/// Inverse of [`encode_policy`]
pub fn decode_policy(policy: &str) -> UpyunResult<Map<String, Value>> {
    let raw = STANDARD
        .decode(policy.trim())
        .map_err(|e| UpyunError::client(format!("policy is not valid base64: {e}")))?;
    match serde_json::from_slice(&raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(UpyunError::client("policy is not a JSON object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const DATE: &str = "Fri, 20 Jan 2017 08:46:20 GMT";

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn http_date_is_rfc1123() {
        let at = Utc.with_ymd_and_hms(2017, 1, 20, 8, 46, 20).unwrap();
        assert_eq!(http_date(at), DATE);
    }

    #[test]
    fn rest_authorization_is_deterministic() {
        let op = Operator::new("upyun", "password");
        assert_eq!(op.password_hash(), "5f4dcc3b5aa765d61d8327deb882cf99");
        assert_eq!(
            op.rest_authorization("POST", "/api/v1/echo", DATE, 0),
            "UPYUN upyun:65afd51c291f0d281abbc2c97653dc6b"
        );
        assert_eq!(
            op.rest_authorization("PUT", "/bucket/a.txt", DATE, 13),
            "UPYUN upyun:80116349c974fc5a4ca69ca5fae5f4d2"
        );
    }

    #[test]
    fn purge_authorization_names_bucket() {
        let op = Operator::new("upyun", "password");
        assert_eq!(
            op.purge_authorization("demo", "http://demo.b0.upaiyun.com/a.png\n", DATE),
            "UpYun demo:upyun:48a818047ca0922d3de14bb9e5638577"
        );
    }

    #[test]
    fn canonical_string_sorts_keys() {
        let fields = object(json!({
            "path": "/a/b.bin",
            "file_blocks": 3,
            "file_size": 2500000,
            "file_hash": "abc",
            "expiration": 1500000000
        }));
        assert_eq!(
            canonical_string(&fields).unwrap(),
            "expiration1500000000file_blocks3file_hashabcfile_size2500000path/a/b.bin"
        );
        assert_eq!(
            policy_signature(&fields, "secret").unwrap(),
            "318eb727ba1e35d89468b15634b1a0da"
        );
    }

    #[test]
    fn canonical_string_joins_lists() {
        let fields = object(json!({"b": ["x", "y"], "a": 1}));
        assert_eq!(canonical_string(&fields).unwrap(), "a1bxy");
    }

    #[test]
    fn nested_objects_are_rejected() {
        let fields = object(json!({"a": {"b": 1}}));
        assert!(canonical_string(&fields).unwrap_err().is_client());
        let fields = object(json!({"a": null}));
        assert!(canonical_string(&fields).is_err());
    }

    #[test]
    fn pretreat_signature_wraps_canonical_fields() {
        let op = Operator::new("operator", "password");
        let fields = object(json!({
            "bucket_name": "demo",
            "source": "/v.mp4",
            "notify_url": "http://cb",
            "tasks": "W10="
        }));
        assert_eq!(
            op.pretreat_signature(&fields).unwrap(),
            "aaa78741eea34fd50a8edc47c0cc9dc2"
        );
    }

    #[test]
    fn callback_signature_round_trips() {
        let op = Operator::new("operator", "password");
        let mut callback = object(json!({
            "bucket_name": "demo",
            "status_code": "200",
            "path": "/v.mp4",
            "description": "OK",
            "task_id": "t1",
            "info": ["a", "b"],
            "extra": "ignored",
            "signature": "a1bff9c44b32b815973bf857ed12e36a"
        }));
        assert!(op.verify_callback(&callback));

        callback.insert("status_code".into(), json!("500"));
        assert!(!op.verify_callback(&callback));

        callback.remove("signature");
        assert!(!op.verify_callback(&callback));
    }

    #[test]
    fn form_signature_joins_with_ampersand() {
        assert_eq!(
            form_signature("eyJhIjoxfQ==", "secret"),
            "c6552c7d8c6db96dc1912dd71cf143a8"
        );
    }

    #[test]
    fn policy_encoding_is_base64_json() {
        let fields = object(json!({"a": 1}));
        let policy = encode_policy(&fields).unwrap();
        assert_eq!(policy, "eyJhIjoxfQ==");
        assert_eq!(decode_policy(&policy).unwrap(), fields);
    }
}
