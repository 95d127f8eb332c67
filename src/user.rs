use std::collections::HashMap;

use chrono::{self, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha1::Sha1;

use crate::util::f64_to_i64_safe;

const CUSTOM_ATTRIBUTES_STARTING_CAPACITY: usize = 8;

// Buckets are the first 15 hex digits of a SHA-1, interpreted as a fraction
// of the largest 15-digit value. 15 digits, not 16: the value must stay
// positive in an i64.
const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f32 = BUCKET_SCALE_INT as f32;

lazy_static! {
    static ref SEMVER_LEADING_COMPONENTS_REGEX: Regex =
        Regex::new(r"^\d+(\.\d+)?(\.\d+)?").unwrap();
}

/// A value that can be stored in a user attribute: any JSON-shaped datum.
///
/// A literal `Null` is a real value, distinct from an attribute that is
/// absent altogether.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// An array of attribute values.
    Array(Vec<AttributeValue>),
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// A map of string keys to attribute values.
    Object(HashMap<String, AttributeValue>),
    /// A null value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> AttributeValue {
        AttributeValue::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> AttributeValue {
        AttributeValue::Float(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        v.into_iter().collect()
    }
}

impl<T> std::iter::FromIterator<T> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().map(AttributeValue::from).collect())
    }
}

impl AttributeValue {
    /// Returns the contained string, without conversion.
    pub fn as_str(&self) -> Option<&String> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a float if it is numeric, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the contained bool, without conversion.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Interprets the value as an instant in time, accepting either an
    /// RFC3339/ISO8601 timestamp string or milliseconds since the Unix epoch
    /// (numeric or stringified). Returns None when no interpretation fits.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        match self {
            AttributeValue::Int(millis) => Utc.timestamp_millis_opt(*millis).single(),
            AttributeValue::Float(millis) => {
                f64_to_i64_safe(*millis).and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }
            AttributeValue::String(s) => {
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                    Some(dt.with_timezone(&Utc))
                } else if let Ok(millis) = s.parse() {
                    Utc.timestamp_millis_opt(millis).single()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Parses a string value as a semantic version, tolerating versions with
    /// a missing minor or patch component (treated as zero).
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?;
        semver::Version::parse(version_str)
            .ok()
            .or_else(|| AttributeValue::parse_semver_loose(version_str))
    }

    fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
        let parts = SEMVER_LEADING_COMPONENTS_REGEX.captures(version_str)?;

        let numeric_parts = parts.get(0)?;
        let mut padded = numeric_parts.as_str().to_string();

        for i in 1..parts.len() {
            if parts.get(i).is_none() {
                padded.push_str(".0");
            }
        }

        padded.push_str(&version_str[numeric_parts.end()..]);

        semver::Version::parse(&padded).ok()
    }

    /// Applies the predicate to each element of an array value, or to the
    /// value itself if it is scalar, returning the first value that passes.
    /// Null never matches.
    pub fn find<P>(&self, p: P) -> Option<&AttributeValue>
    where
        P: Fn(&AttributeValue) -> bool,
    {
        match self {
            AttributeValue::Array(values) => values.iter().find(|v| p(v)),
            AttributeValue::Null => None,
            _ => {
                if p(self) {
                    Some(self)
                } else {
                    None
                }
            }
        }
    }

    // Only strings and integers participate in bucketing; everything else
    // lands in bucket zero.
    fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// An identified principal that flags are evaluated against.
///
/// Every user has a key; the remaining built-in attributes and any custom
/// attributes are optional. Build one with [User::with_key].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct User {
    #[serde(rename = "key")]
    _key: String,
    #[serde(rename = "secondary", skip_serializing_if = "Option::is_none")]
    _secondary: Option<String>,
    #[serde(rename = "ip", skip_serializing_if = "Option::is_none")]
    _ip: Option<String>,
    #[serde(rename = "country", skip_serializing_if = "Option::is_none")]
    _country: Option<String>,
    #[serde(rename = "email", skip_serializing_if = "Option::is_none")]
    _email: Option<String>,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    _first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none")]
    _last_name: Option<String>,
    #[serde(rename = "avatar", skip_serializing_if = "Option::is_none")]
    _avatar: Option<String>,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    _name: Option<String>,
    #[serde(rename = "anonymous", skip_serializing_if = "Option::is_none")]
    _anonymous: Option<bool>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    custom: HashMap<String, AttributeValue>,
}

// A custom map serialized as an explicit null should read back as empty.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl User {
    /// Starts building a user with the given key.
    pub fn with_key(key: impl Into<String>) -> UserBuilder {
        UserBuilder::new(key)
    }

    /// The user's key.
    pub fn key(&self) -> &str {
        &self._key
    }

    /// The user's secondary key, used to further distinguish users that
    /// share a bucketing attribute.
    pub fn secondary(&self) -> Option<&str> {
        self._secondary.as_deref()
    }

    /// The user's display name.
    pub fn name(&self) -> Option<&str> {
        self._name.as_deref()
    }

    /// Whether the user is anonymous.
    pub fn anonymous(&self) -> Option<bool> {
        self._anonymous
    }

    /// Looks up an attribute by name. Built-in attributes shadow custom
    /// attributes of the same name.
    pub fn value_of(&self, attr: &str) -> Option<AttributeValue> {
        match attr {
            "key" => Some(AttributeValue::String(self._key.clone())),
            "secondary" => self._secondary.as_deref().map(AttributeValue::from),
            "ip" => self._ip.as_deref().map(AttributeValue::from),
            "country" => self._country.as_deref().map(AttributeValue::from),
            "email" => self._email.as_deref().map(AttributeValue::from),
            "firstName" => self._first_name.as_deref().map(AttributeValue::from),
            "lastName" => self._last_name.as_deref().map(AttributeValue::from),
            "avatar" => self._avatar.as_deref().map(AttributeValue::from),
            "name" => self._name.as_deref().map(AttributeValue::from),
            "anonymous" => self._anonymous.map(AttributeValue::from),
            _ => self.custom.get(attr).cloned(),
        }
    }

    /// Computes the user's rollout bucket for the given hash key and salt,
    /// optionally bucketing by an attribute other than `key`.
    ///
    /// The result is a deterministic fraction in `[0, 1)`. Users whose
    /// bucketing attribute is absent or not bucketable land in bucket zero.
    pub fn bucket(&self, bucketing_key: &str, by_attr: Option<&str>, salt: &str) -> f32 {
        let attr_value = match by_attr {
            Some(attr) => self.value_of(attr),
            None => Some(AttributeValue::String(self._key.clone())),
        };
        self.hash_to_bucket(bucketing_key, attr_value.as_ref(), salt)
            .unwrap_or(0.0)
    }

    fn hash_to_bucket(
        &self,
        bucketing_key: &str,
        attr_value: Option<&AttributeValue>,
        salt: &str,
    ) -> Option<f32> {
        let mut id = attr_value?.as_bucketable()?;

        if let Some(secondary) = self.secondary() {
            id.push('.');
            id.push_str(secondary);
        }

        let mut hash = Sha1::new();
        hash.update(bucketing_key.as_bytes());
        hash.update(b".");
        hash.update(salt.as_bytes());
        hash.update(b".");
        hash.update(id.as_bytes());
        let hexhash = hash.hexdigest();

        // Guaranteed to fit: 15 hex digits are at most 60 bits.
        let numhash = i64::from_str_radix(&hexhash[..15], 16).ok()?;

        Some(numhash as f32 / BUCKET_SCALE)
    }
}

/// Builder for [User].
pub struct UserBuilder {
    key: String,
    secondary: Option<String>,
    ip: Option<String>,
    country: Option<String>,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    avatar: Option<String>,
    name: Option<String>,
    anonymous: Option<bool>,
    custom: HashMap<String, AttributeValue>,
}

impl UserBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secondary: None,
            ip: None,
            country: None,
            email: None,
            first_name: None,
            last_name: None,
            avatar: None,
            name: None,
            anonymous: None,
            custom: HashMap::with_capacity(CUSTOM_ATTRIBUTES_STARTING_CAPACITY),
        }
    }

    pub fn secondary(&mut self, secondary: impl Into<String>) -> &mut Self {
        self.secondary = Some(secondary.into());
        self
    }

    pub fn ip(&mut self, ip: impl Into<String>) -> &mut Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn country(&mut self, country: impl Into<String>) -> &mut Self {
        self.country = Some(country.into());
        self
    }

    pub fn email(&mut self, email: impl Into<String>) -> &mut Self {
        self.email = Some(email.into());
        self
    }

    pub fn first_name(&mut self, first_name: impl Into<String>) -> &mut Self {
        self.first_name = Some(first_name.into());
        self
    }

    pub fn last_name(&mut self, last_name: impl Into<String>) -> &mut Self {
        self.last_name = Some(last_name.into());
        self
    }

    pub fn avatar(&mut self, avatar: impl Into<String>) -> &mut Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(&mut self, anonymous: bool) -> &mut Self {
        self.anonymous = Some(anonymous);
        self
    }

    pub fn custom(&mut self, custom: HashMap<String, AttributeValue>) -> &mut Self {
        self.custom.extend(custom);
        self
    }

    pub fn build(&self) -> User {
        if self.key.is_empty() {
            warn!("user built with an empty key; evaluations for this user will fail");
        }
        User {
            _key: self.key.clone(),
            _secondary: self.secondary.clone(),
            _ip: self.ip.clone(),
            _country: self.country.clone(),
            _email: self.email.clone(),
            _first_name: self.first_name.clone(),
            _last_name: self.last_name.clone(),
            _avatar: self.avatar.clone(),
            _name: self.name.clone(),
            _anonymous: self.anonymous,
            custom: self.custom.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::hashmap;
    use spectral::prelude::*;

    const BUCKET_TOLERANCE: f32 = 0.0000001;

    #[test]
    fn bucket_user_by_key() {
        let user = User::with_key("userKeyA").build();
        let bucket = user.bucket("hashKey", None, "saltyA");
        assert_that!(bucket).is_close_to(0.42157587, BUCKET_TOLERANCE);

        let user = User::with_key("userKeyB").build();
        let bucket = user.bucket("hashKey", None, "saltyA");
        assert_that!(bucket).is_close_to(0.6708485, BUCKET_TOLERANCE);

        let user = User::with_key("userKeyC").build();
        let bucket = user.bucket("hashKey", None, "saltyA");
        assert_that!(bucket).is_close_to(0.10343106, BUCKET_TOLERANCE);
    }

    #[test]
    fn bucket_incorporates_secondary_key() {
        let plain = User::with_key("userKeyA").build();
        let with_secondary = User::with_key("userKeyA").secondary("s2").build();
        assert_that!(plain.bucket("hashKey", None, "saltyA")).is_not_equal_to(
            with_secondary.bucket("hashKey", None, "saltyA"),
        );
    }

    #[test]
    fn bucket_user_by_int_attr_matches_equivalent_string() {
        const USER_KEY: &str = "userKeyD";

        let custom = hashmap! {
            "intAttr".into() => 33333.into(),
        };
        let user = User::with_key(USER_KEY).custom(custom).build();
        let bucket = user.bucket("hashKey", Some("intAttr"), "saltyA");
        assert_that!(bucket).is_close_to(0.54771423, BUCKET_TOLERANCE);

        let custom = hashmap! {
            "stringAttr".into() => "33333".into(),
        };
        let user = User::with_key(USER_KEY).custom(custom).build();
        let bucket2 = user.bucket("hashKey", Some("stringAttr"), "saltyA");
        assert_that!(bucket).is_close_to(bucket2, BUCKET_TOLERANCE);
    }

    #[test]
    fn unbucketable_attributes_land_in_bucket_zero() {
        let custom = hashmap! {
            "floatAttr".into() => 999.999.into(),
            "boolAttr".into() => true.into(),
            "arrayAttr".into() => AttributeValue::Array(vec!["x".into()]),
            "nullAttr".into() => AttributeValue::Null,
        };
        let user = User::with_key("userKeyE").custom(custom).build();
        for attr in ["floatAttr", "boolAttr", "arrayAttr", "nullAttr", "missing"] {
            let bucket = user.bucket("hashKey", Some(attr), "saltyA");
            assert_that!(bucket).is_close_to(0.0, BUCKET_TOLERANCE);
        }
    }

    #[test]
    fn built_in_attributes_shadow_custom_attributes() {
        let custom = hashmap! {
            "email".into() => "shadowed@example.com".into(),
            "team".into() => "Avengers".into(),
        };
        let user = User::with_key("u")
            .email("real@example.com")
            .custom(custom)
            .build();
        assert_eq!(
            user.value_of("email"),
            Some(AttributeValue::String("real@example.com".into()))
        );
        assert_eq!(
            user.value_of("team"),
            Some(AttributeValue::String("Avengers".into()))
        );
    }

    #[test]
    fn parse_user_rejects_missing_key() {
        let result: serde_json::Result<User> = serde_json::from_str(r"{}");
        assert_that!(result).is_err();
    }

    #[test]
    fn parse_user_rejects_null_key() {
        let result: serde_json::Result<User> = serde_json::from_str(r#"{"key": null}"#);
        assert_that!(result).is_err();
    }

    #[test]
    fn null_custom_is_default() {
        let user1: User = serde_json::from_str(r#"{"key": "foo"}"#).unwrap();
        assert_eq!(user1.custom, hashmap![]);

        let user2: User = serde_json::from_str(r#"{"key": "foo", "custom": null}"#).unwrap();
        assert_eq!(user2.custom, hashmap![]);
    }

    #[test]
    fn user_round_trips_through_json() {
        let user: User = serde_json::from_str(
            r#"{
                "key": "abc",
                "email": "abc@example.com",
                "firstName": "A",
                "anonymous": false,
                "custom": {"groups": ["g1", "g2"], "level": 3}
            }"#,
        )
        .unwrap();
        let json = serde_json::to_string(&user).unwrap();
        let back: User = serde_json::from_str(&json).unwrap();
        assert_eq!(user, back);
    }

    #[test]
    fn attribute_find_handles_scalars_and_arrays() {
        let scalar = AttributeValue::String("a".into());
        assert!(scalar.find(|v| v.as_str().is_some()).is_some());
        assert!(scalar.find(|v| v.as_bool().is_some()).is_none());

        let array: AttributeValue = vec!["a", "b"].into();
        assert_eq!(
            array.find(|v| v.as_str().map(|s| s == "b").unwrap_or(false)),
            Some(&AttributeValue::String("b".into()))
        );

        assert!(AttributeValue::Null.find(|_| true).is_none());
    }

    #[test]
    fn semver_parse_pads_missing_components() {
        assert_eq!(
            AttributeValue::from("2").as_semver(),
            Some(semver::Version::new(2, 0, 0))
        );
        assert_eq!(
            AttributeValue::from("2.5").as_semver(),
            Some(semver::Version::new(2, 5, 0))
        );
        assert_eq!(
            AttributeValue::from("2.5.1-beta.1").as_semver(),
            semver::Version::parse("2.5.1-beta.1").ok()
        );
        assert_eq!(AttributeValue::from("not-a-version").as_semver(), None);
        assert_eq!(AttributeValue::Int(2).as_semver(), None);
    }

    #[test]
    fn datetime_conversions() {
        let from_millis = AttributeValue::Int(1_000).to_datetime().unwrap();
        let from_string = AttributeValue::from("1970-01-01T00:00:01Z")
            .to_datetime()
            .unwrap();
        assert_eq!(from_millis, from_string);

        assert!(AttributeValue::from("1000").to_datetime().is_some());
        assert!(AttributeValue::Bool(true).to_datetime().is_none());
        assert!(AttributeValue::Null.to_datetime().is_none());
    }
}
