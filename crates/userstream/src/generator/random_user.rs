//! 🌍 randomuser.me, the bottomless well of people who don't exist.
//!
//! The API answers `{"results": [ { ...deeply nested person... } ]}`. We take
//! the first result, flatten it, and forget the nesting ever happened. This is
//! the only file in the crate that knows what randomuser's JSON looks like.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use crate::errors::PipelineError;
use crate::generator::{RecordSource, mint_id};
use crate::record::UserRecord;

/// 📡 Where to GET users from, and how long we're willing to wait.
#[derive(Debug, Deserialize, Clone)]
pub struct RandomUserConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// ⏱️ Whole-request timeout. Connect, send, headers, body, all of it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_url() -> String {
    "https://randomuser.me/api/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for RandomUserConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RandomUserConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 📡 The HTTP-backed source. One reusable `reqwest::Client`, one GET per fetch.
#[derive(Debug)]
pub(crate) struct RandomUserSource {
    client: reqwest::Client,
    config: RandomUserConfig,
}

impl RandomUserSource {
    pub(crate) fn new(config: RandomUserConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("💀 The HTTP client refused to be born. Probably the TLS stack having a moment.")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RecordSource for RandomUserSource {
    async fn fetch(&mut self) -> Result<UserRecord, PipelineError> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .map_err(|e| {
                PipelineError::SourceUnavailable(format!("GET {} failed: {e}", self.config.url))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::SourceUnavailable(format!(
                "GET {} answered {status}",
                self.config.url
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            PipelineError::SourceUnavailable(format!("reading body from {} failed: {e}", self.config.url))
        })?;
        trace!("📬 randomuser answered with {} bytes", body.len());

        let envelope: Envelope = serde_json::from_slice(&body)
            .map_err(|e| PipelineError::MalformedSource(e.to_string()))?;
        let person = envelope
            .results
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::MalformedSource("`results` is empty".to_string()))?;

        person.into_record(mint_id())
    }
}

// 🧩 The nested shape, exactly as deep as we need and no deeper.
// Fields we don't map are simply not declared; serde skips them.

#[derive(Debug, Deserialize)]
struct Envelope {
    results: Vec<Person>,
}

#[derive(Debug, Deserialize)]
struct Person {
    gender: String,
    name: Name,
    location: Location,
    email: String,
    login: Login,
    dob: Dated,
    registered: Dated,
    phone: String,
    picture: Picture,
}

#[derive(Debug, Deserialize)]
struct Name {
    first: String,
    last: String,
}

#[derive(Debug, Deserialize)]
struct Location {
    street: Street,
    city: String,
    state: String,
    country: String,
    postcode: Scalar,
}

#[derive(Debug, Deserialize)]
struct Street {
    number: Scalar,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Login {
    username: String,
}

#[derive(Debug, Deserialize)]
struct Dated {
    date: String,
}

#[derive(Debug, Deserialize)]
struct Picture {
    medium: String,
}

/// 🔢 randomuser sends postcodes as numbers for some countries and strings for others.
/// Street numbers too. We take either and keep the text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(text) => f.write_str(text),
            Scalar::Number(number) => write!(f, "{number}"),
        }
    }
}

impl Person {
    /// 🧹 Flatten, then refuse any field that came out empty.
    fn into_record(self, id: String) -> Result<UserRecord, PipelineError> {
        let Location {
            street,
            city,
            state,
            country,
            postcode,
        } = self.location;
        let record = UserRecord {
            id,
            first_name: self.name.first,
            last_name: self.name.last,
            gender: self.gender,
            dob: self.dob.date,
            address: format!("{} {}, {city}, {state}, {country}", street.number, street.name),
            post_code: postcode.to_string(),
            email: self.email,
            username: self.login.username,
            registered_date: self.registered.date,
            phone: self.phone,
            picture: self.picture.medium,
        };
        if let Some((field, _)) = record.fields().into_iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(PipelineError::MalformedSource(format!("`{field}` is empty")));
        }
        Ok(record)
    }
}
