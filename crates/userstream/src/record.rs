//! 📦 The Canonical User Record, and the bouncer that decides what counts as one.
//!
//! 🎬 COLD OPEN. A message arrives on `user_stream`. It claims to be a user.
//! It has an `id`. It has an `email`. It has... a `post_code` that is a number?
//! The bouncer squints. The bouncer checks the list. Twelve fields, all strings,
//! no exceptions, no plus-ones. The message is escorted to the dead-letter lounge.
//!
//! Everything downstream of [`UserRecord::from_payload`] can assume the shape is right.
//! That's the whole point of doing it here, once, at the door. 🦆

use scylla::{DeserializeRow, SerializeRow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PipelineError;

/// 📐 The fixed field set, in table column order. `id` first, because it's the key.
pub const FIELD_NAMES: [&str; 12] = [
    "id",
    "first_name",
    "last_name",
    "gender",
    "dob",
    "address",
    "post_code",
    "email",
    "username",
    "registered_date",
    "phone",
    "picture",
];

/// 🧍 One synthetic user. Flat, all strings, keyed by `id`.
///
/// `id` is minted exactly once, by the producer, from a random UUID. Nobody
/// downstream ever regenerates it, which is why replaying a message just
/// overwrites the same row with the same content. Idempotence by birth certificate.
///
/// Doubles as the Cassandra row type: the scylla derives match columns by name.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SerializeRow, DeserializeRow,
)]
pub struct UserRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: String,
    pub dob: String,
    pub address: String,
    pub post_code: String,
    pub email: String,
    pub username: String,
    pub registered_date: String,
    pub phone: String,
    pub picture: String,
}

impl UserRecord {
    /// 🚪 Parse and validate one topic payload.
    ///
    /// Rules, in order:
    /// - bytes must be UTF-8, and must parse as JSON ([`PipelineError::Deserialization`])
    /// - the JSON must be an object
    /// - all twelve fields present, each a JSON string (null counts as missing a string)
    /// - `id` must not be empty, it's a primary key
    ///
    /// Extra fields are ignored. Anything else is a [`PipelineError::SchemaViolation`].
    pub fn from_payload(payload: &[u8]) -> Result<Self, PipelineError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| PipelineError::Deserialization(format!("payload is not UTF-8: {e}")))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PipelineError::Deserialization(format!("payload is not JSON: {e}")))?;
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(PipelineError::SchemaViolation {
                    field: "$",
                    reason: format!("expected a JSON object, found {}", json_kind(&other)),
                });
            }
        };

        let record = UserRecord {
            id: take_string(&mut fields, "id")?,
            first_name: take_string(&mut fields, "first_name")?,
            last_name: take_string(&mut fields, "last_name")?,
            gender: take_string(&mut fields, "gender")?,
            dob: take_string(&mut fields, "dob")?,
            address: take_string(&mut fields, "address")?,
            post_code: take_string(&mut fields, "post_code")?,
            email: take_string(&mut fields, "email")?,
            username: take_string(&mut fields, "username")?,
            registered_date: take_string(&mut fields, "registered_date")?,
            phone: take_string(&mut fields, "phone")?,
            picture: take_string(&mut fields, "picture")?,
        };

        if record.id.trim().is_empty() {
            return Err(PipelineError::SchemaViolation {
                field: "id",
                reason: "primary key must not be empty".to_string(),
            });
        }
        Ok(record)
    }

    /// 📤 Encode for the topic. UTF-8 JSON, the only dialect the consumer speaks.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// 🔍 `(name, value)` pairs in [`FIELD_NAMES`] order.
    pub fn fields(&self) -> [(&'static str, &str); 12] {
        [
            ("id", self.id.as_str()),
            ("first_name", self.first_name.as_str()),
            ("last_name", self.last_name.as_str()),
            ("gender", self.gender.as_str()),
            ("dob", self.dob.as_str()),
            ("address", self.address.as_str()),
            ("post_code", self.post_code.as_str()),
            ("email", self.email.as_str()),
            ("username", self.username.as_str()),
            ("registered_date", self.registered_date.as_str()),
            ("phone", self.phone.as_str()),
            ("picture", self.picture.as_str()),
        ]
    }
}

fn take_string(fields: &mut Map<String, Value>, name: &'static str) -> Result<String, PipelineError> {
    match fields.remove(name) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(PipelineError::SchemaViolation {
            field: name,
            reason: format!("expected a string, found {}", json_kind(&other)),
        }),
        None => Err(PipelineError::SchemaViolation {
            field: name,
            reason: "required field is missing".to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::UserRecord;

    /// 🧪 A perfectly ordinary user with a caller-chosen id.
    pub(crate) fn user(id: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            gender: "female".into(),
            dob: "1815-12-10T00:00:00.000Z".into(),
            address: "12 St James's Square, London, England, United Kingdom".into(),
            post_code: "SW1Y 4JH".into(),
            email: "ada.lovelace@example.com".into(),
            username: "analyticalengine".into(),
            registered_date: "2012-03-01T10:00:00.000Z".into(),
            phone: "020 7946 0000".into(),
            picture: "https://randomuser.me/api/portraits/med/women/1.jpg".into(),
        }
    }
}
