//! Job payloads.
//!
//! At the storage boundary a payload is an opaque, ordered string→string map
//! ([`PayloadMap`]) serialized as a JSON object. Handlers never work with the
//! map directly: each job kind has a typed payload implementing
//! [`JobPayload`], decoded when the job is dispatched.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::user::Token;

/// Ordered mapping of string keys to string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadMap(BTreeMap<String, String>);

impl PayloadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up a key that the payload cannot do without.
    pub fn require(&self, key: &'static str) -> Result<&str, PayloadError> {
        self.get(key).ok_or(PayloadError::Missing(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode as the JSON object stored in the `payload` column.
    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, PayloadError> {
        Ok(Self(serde_json::from_str(raw)?))
    }
}

impl<K, V> FromIterator<(K, V)> for PayloadMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Failure to encode or decode a payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is missing key {0:?}")]
    Missing(&'static str),

    #[error("unknown email type {0:?}")]
    UnknownEmailType(String),

    #[error("payload is not a string map: {0}")]
    Json(#[from] serde_json::Error),
}

/// A typed job payload bound to a job name.
pub trait JobPayload: Sized + Send + 'static {
    /// Job name the payload is enqueued and dispatched under.
    const NAME: &'static str;

    fn to_map(&self) -> PayloadMap;

    fn from_map(map: &PayloadMap) -> Result<Self, PayloadError>;
}

/// Which email a `send-email` job sends.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    Signup,
    Login,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::Signup => "signup",
            EmailKind::Login => "login",
        }
    }
}

impl FromStr for EmailKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup" => Ok(EmailKind::Signup),
            "login" => Ok(EmailKind::Login),
            other => Err(PayloadError::UnknownEmailType(other.to_string())),
        }
    }
}

/// Payload of the `send-email` job: `{type, token}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEmail {
    pub kind: EmailKind,
    pub token: Token,
}

impl SendEmail {
    pub fn signup(token: Token) -> Self {
        Self {
            kind: EmailKind::Signup,
            token,
        }
    }

    pub fn login(token: Token) -> Self {
        Self {
            kind: EmailKind::Login,
            token,
        }
    }
}

impl JobPayload for SendEmail {
    const NAME: &'static str = "send-email";

    fn to_map(&self) -> PayloadMap {
        PayloadMap::new()
            .with("type", self.kind.as_str())
            .with("token", self.token.as_str())
    }

    fn from_map(map: &PayloadMap) -> Result<Self, PayloadError> {
        let kind = map.require("type")?.parse()?;
        let token = Token::new(map.require("token")?);
        Ok(Self { kind, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn send_email_uses_type_and_token_keys() {
        let token = Token::new("t_abcd");
        let map = SendEmail::signup(token.clone()).to_map();

        assert_eq!(map.get("type"), Some("signup"));
        assert_eq!(map.get("token"), Some("t_abcd"));
        assert_eq!(SendEmail::from_map(&map).unwrap(), SendEmail::signup(token));
    }

    #[test]
    fn unknown_email_type_is_rejected() {
        let map = PayloadMap::new().with("type", "newsletter").with("token", "t_abcd");
        let err = SendEmail::from_map(&map).unwrap_err();
        assert_eq!(err.to_string(), r#"unknown email type "newsletter""#);
    }

    #[test]
    fn missing_token_is_rejected() {
        let map = PayloadMap::new().with("type", "login");
        assert!(matches!(
            SendEmail::from_map(&map),
            Err(PayloadError::Missing("token"))
        ));
    }

    #[test]
    fn non_string_json_values_are_rejected() {
        assert!(PayloadMap::from_json(r#"{"attempt": 3}"#).is_err());
    }

    #[test]
    fn json_encoding_is_key_ordered() {
        let map: PayloadMap = [("b", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(map.to_json().unwrap(), r#"{"a":"1","b":"2"}"#);
    }

    proptest! {
        #[test]
        fn json_encoding_preserves_entries(entries in proptest::collection::btree_map(".*", ".*", 0..8)) {
            let map: PayloadMap = entries.clone().into_iter().collect();
            let decoded = PayloadMap::from_json(&map.to_json().unwrap()).unwrap();
            prop_assert_eq!(decoded.len(), entries.len());
            for (k, v) in &entries {
                prop_assert_eq!(decoded.get(k), Some(v.as_str()));
            }
        }
    }
}
