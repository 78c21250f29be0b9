//! 🎲 The Record Generator Adapter: where fake people are born.
//!
//! 🚰 One call, one user. The adapter asks somebody for a person, flattens
//! whatever nested shape they arrive in, and stamps a fresh UUID on them.
//! No retries live here. If the tap is dry, the producer loop shrugs and tries
//! again next tick. That's its job, not ours.
//!
//! 🎭 Same casting-agency setup as every other backend in this crate: a trait,
//! a couple of concrete sources, and an enum that dispatches between them so
//! callers never need to know whether the user came from the internet or from RAM.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::PipelineError;
use crate::record::UserRecord;

mod fixture;
mod random_user;

pub(crate) use fixture::FixtureSource;
pub use random_user::RandomUserConfig;
pub(crate) use random_user::RandomUserSource;

/// 🚰 Something that can hand over exactly one normalized user per call.
///
/// # Contract 📜
/// - Every `Ok` carries a complete [`UserRecord`] with a freshly minted `id`.
/// - Network trouble or a non-2xx is [`PipelineError::SourceUnavailable`].
/// - A response missing the fields we need is [`PipelineError::MalformedSource`].
/// - No retries. The caller owns the retry policy.
#[async_trait]
pub(crate) trait RecordSource: std::fmt::Debug + Send {
    /// 📦 Fetch one user and flatten it into the canonical shape.
    async fn fetch(&mut self) -> Result<UserRecord, PipelineError>;
}

/// 📡 Which source to pull from. `[source.random_user]` in TOML, or `source = "fixture"`.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    /// 🌍 The real thing: a GET against randomuser.me (or anything shaped like it).
    RandomUser(RandomUserConfig),
    /// 🧪 The same well-behaved user over and over, each with a brand-new id. Offline-friendly.
    Fixture,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::RandomUser(RandomUserConfig::default())
    }
}

/// 🎭 The many faces of a RecordSource.
#[derive(Debug)]
pub(crate) enum SourceBackend {
    RandomUser(RandomUserSource),
    Fixture(FixtureSource),
}

impl SourceBackend {
    /// 🏗️ Build whichever source the config asks for.
    pub(crate) fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(match config {
            SourceConfig::RandomUser(random_user) => {
                SourceBackend::RandomUser(RandomUserSource::new(random_user.clone())?)
            }
            SourceConfig::Fixture => SourceBackend::Fixture(FixtureSource::default()),
        })
    }
}

#[async_trait]
impl RecordSource for SourceBackend {
    async fn fetch(&mut self) -> Result<UserRecord, PipelineError> {
        match self {
            SourceBackend::RandomUser(source) => source.fetch().await,
            SourceBackend::Fixture(source) => source.fetch().await,
        }
    }
}

/// 🎲 A new primary key. 128 random bits, hyphenated, minted exactly once per user.
pub(crate) fn mint_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
